//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Staged operation pipeline and worker queues."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use fleet_common::scale_duration;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

use crate::poll::CancelToken;
use crate::Executor;

/// Unbounded id queue drained by a fixed pool of workers.
///
/// Duplicate adds are tolerated; executors rely on version-checked writes,
/// not on exclusive processing of an id.
pub struct Queue {
    name: String,
    executor: Arc<dyn Executor>,
    sender: mpsc::UnboundedSender<String>,
    receiver: Arc<AsyncMutex<mpsc::UnboundedReceiver<String>>>,
    speed_factor: u32,
}

impl Queue {
    /// Queue feeding `executor`.
    pub fn new(name: impl Into<String>, executor: Arc<dyn Executor>) -> Arc<Self> {
        Self::with_speed_factor(name, executor, 1)
    }

    /// Queue whose re-enqueue delays are divided by `speed_factor`. Tests only.
    pub fn with_speed_factor(
        name: impl Into<String>,
        executor: Arc<dyn Executor>,
        speed_factor: u32,
    ) -> Arc<Self> {
        let (sender, receiver) = mpsc::unbounded_channel();
        Arc::new(Self {
            name: name.into(),
            executor,
            sender,
            receiver: Arc::new(AsyncMutex::new(receiver)),
            speed_factor,
        })
    }

    /// Queue name used in logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueue an id.
    pub fn add(&self, id: impl Into<String>) {
        let id = id.into();
        debug!(queue = %self.name, id = %id, "id enqueued");
        // The queue owns a receiver for its whole life, so send only fails
        // after the queue itself is gone.
        let _ = self.sender.send(id);
    }

    /// Spawn `workers` workers and return immediately. Workers and pending
    /// re-enqueue timers stop when `stop` fires.
    pub fn run(self: &Arc<Self>, stop: CancelToken, workers: usize) -> QueueHandle {
        info!(queue = %self.name, workers, "starting queue workers");
        let tasks = (0..workers.max(1))
            .map(|worker| {
                let queue = self.clone();
                let stop = stop.clone();
                let span = tracing::info_span!("queue_worker", queue = %self.name, worker);
                tokio::spawn(async move { queue.worker_loop(stop).await }.instrument(span))
            })
            .collect();
        QueueHandle {
            name: self.name.clone(),
            tasks: Mutex::new(tasks),
        }
    }

    async fn worker_loop(self: Arc<Self>, stop: CancelToken) {
        loop {
            let next = tokio::select! {
                biased;
                _ = stop.cancelled() => None,
                id = self.next_id() => id,
            };
            let Some(id) = next else {
                break;
            };
            if stop.is_cancelled() {
                break;
            }
            self.process(&id, &stop).await;
        }
        debug!("queue worker exited");
    }

    async fn next_id(&self) -> Option<String> {
        self.receiver.lock().await.recv().await
    }

    async fn process(self: &Arc<Self>, id: &str, stop: &CancelToken) {
        match self.executor.execute(id).await {
            Ok(delay) if delay.is_zero() => {
                debug!(id = %id, "processing finished");
            }
            Ok(delay) => {
                let delay = scale_duration(delay, self.speed_factor);
                debug!(id = %id, delay_ms = delay.as_millis() as u64, "re-enqueue scheduled");
                self.schedule(id.to_owned(), delay, stop.clone());
            }
            Err(err) if err.is_not_found() => {
                warn!(id = %id, error = %err, "dropping id");
            }
            Err(err) => {
                error!(id = %id, error = %err, "processing failed");
            }
        }
    }

    fn schedule(self: &Arc<Self>, id: String, delay: Duration, stop: CancelToken) {
        let queue = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = stop.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if let Some(queue) = queue.upgrade() {
                        queue.add(id);
                    }
                }
            }
        });
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.name)
            .field("speed_factor", &self.speed_factor)
            .finish_non_exhaustive()
    }
}

/// Worker tasks of a running queue.
#[derive(Debug)]
pub struct QueueHandle {
    name: String,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl QueueHandle {
    /// Wait for every worker to exit. Call after firing the stop token.
    pub async fn join(&self) {
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(err) = task.await {
                warn!(queue = %self.name, error = %err, "queue worker join error");
            }
        }
    }
}
