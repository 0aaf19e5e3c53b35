//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Staged operation pipeline and worker queues."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{Interval, MissedTickBehavior};

/// Create a linked cancel handle and token.
pub fn cancellation() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelToken { rx })
}

/// Triggers cancellation for every clone of the paired token.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    /// Signal cancellation. Idempotent.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// New token observing this handle.
    pub fn token(&self) -> CancelToken {
        CancelToken {
            rx: self.tx.subscribe(),
        }
    }

    /// True once `cancel` was called.
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Observes a [`CancelHandle`]. Dropping the handle without cancelling leaves
/// the token uncancelled forever.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    /// Token that is never cancelled.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    /// True once cancellation was signalled.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve when cancellation is signalled.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Interval ticker that stops when its token is cancelled. The first tick
/// completes immediately; missed ticks are delayed, not bunched.
#[derive(Debug)]
pub struct Poller {
    ticker: Interval,
    cancel: CancelToken,
}

impl Poller {
    /// Ticker firing every `interval` until `cancel` fires.
    pub fn new(interval: Duration, cancel: CancelToken) -> Self {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { ticker, cancel }
    }

    /// Wait for the next tick. Returns `false` once cancelled.
    pub async fn tick(&mut self) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            _ = self.ticker.tick() => true,
        }
    }
}

/// Evaluate `condition` immediately and then once per `interval` until it
/// yields a value, returns an error, or `cancel` fires (`Ok(None)`).
pub async fn poll_until<T, E, F, Fut>(
    interval: Duration,
    cancel: &CancelToken,
    mut condition: F,
) -> Result<Option<T>, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
{
    let mut poller = Poller::new(interval, cancel.clone());
    while poller.tick().await {
        if let Some(value) = condition().await? {
            return Ok(Some(value));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn polls_until_condition_holds() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let result: Result<Option<usize>, ()> =
            poll_until(Duration::from_millis(5), &CancelToken::never(), || {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    Ok((n == 3).then_some(n))
                }
            })
            .await;
        assert_eq!(result, Ok(Some(3)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn cancellation_interrupts_the_wait() {
        let (handle, token) = cancellation();
        let waiter = tokio::spawn(async move {
            poll_until::<(), (), _, _>(Duration::from_secs(3600), &token, || async { Ok(None) })
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.cancel();
        let outcome = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("poll returns after cancel")
            .expect("task joins");
        assert_eq!(outcome, Ok(None));
        assert!(handle.is_cancelled());
    }

    #[tokio::test]
    async fn errors_stop_polling() {
        let result: Result<Option<()>, &str> =
            poll_until(Duration::from_millis(1), &CancelToken::never(), || async {
                Err("boom")
            })
            .await;
        assert_eq!(result, Err("boom"));
    }
}
