//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Message schema helpers and protocol codecs."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::types::Event;
use crate::{EventError, Result};

/// Consumer of one event type.
#[async_trait]
pub trait Subscriber<E: Event>: Send + Sync {
    /// Handle one event. Errors are logged by the topic and otherwise ignored.
    async fn on_event(&self, event: E) -> Result<()>;
}

/// Delivery counters for a topic.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TopicStats {
    /// Events handed to `publish`.
    pub published: u64,
    /// Per-subscriber deliveries queued.
    pub delivered: u64,
    /// Subscriber invocations that returned an error.
    pub failed: u64,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> TopicStats {
        TopicStats {
            published: self.published.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

struct Registration<E> {
    name: String,
    sender: mpsc::UnboundedSender<E>,
}

/// Typed topic with named subscribers.
pub struct Topic<E: Event> {
    subscribers: RwLock<Vec<Registration<E>>>,
    counters: Arc<Counters>,
}

impl<E: Event> Default for Topic<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Event> Topic<E> {
    /// Topic without subscribers.
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Register a subscriber drained by a dedicated task on the current runtime.
    pub fn subscribe<S>(&self, name: impl Into<String>, subscriber: Arc<S>) -> Result<()>
    where
        S: Subscriber<E> + 'static,
    {
        let name = name.into();
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|_| EventError::NoRuntime(name.clone()))?;
        let mut receiver = self.register(name.clone())?;
        let counters = self.counters.clone();
        handle.spawn(async move {
            while let Some(event) = receiver.recv().await {
                if let Err(err) = subscriber.on_event(event).await {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(topic = E::NAME, subscriber = %name, error = %err, "event subscriber failed");
                }
            }
            debug!(topic = E::NAME, subscriber = %name, "event subscriber drained");
        });
        Ok(())
    }

    /// Register a subscriber that consumes the raw channel itself.
    pub fn subscribe_channel(&self, name: impl Into<String>) -> Result<mpsc::UnboundedReceiver<E>> {
        self.register(name.into())
    }

    fn register(&self, name: String) -> Result<mpsc::UnboundedReceiver<E>> {
        let mut subscribers = self.subscribers.write();
        if subscribers.iter().any(|s| s.name == name) {
            return Err(EventError::DuplicateSubscriber {
                topic: E::NAME,
                subscriber: name,
            });
        }
        let (sender, receiver) = mpsc::unbounded_channel();
        subscribers.push(Registration { name, sender });
        Ok(receiver)
    }

    /// Remove a subscriber by name. Its drain task ends once the queue is empty.
    pub fn unsubscribe(&self, name: &str) -> bool {
        let mut subscribers = self.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|s| s.name != name);
        subscribers.len() != before
    }

    /// Fan the event out to every subscriber. Never blocks and never fails;
    /// subscribers whose channel closed are dropped.
    pub fn publish(&self, event: E) {
        self.counters.published.fetch_add(1, Ordering::Relaxed);
        let mut closed = Vec::new();
        {
            let subscribers = self.subscribers.read();
            for registration in subscribers.iter() {
                if registration.sender.send(event.clone()).is_ok() {
                    self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                } else {
                    closed.push(registration.name.clone());
                }
            }
        }
        for name in closed {
            debug!(topic = E::NAME, subscriber = %name, "dropping closed subscriber");
            self.unsubscribe(&name);
        }
    }

    /// Names of the registered subscribers.
    pub fn subscriber_names(&self) -> Vec<String> {
        self.subscribers.read().iter().map(|s| s.name.clone()).collect()
    }

    /// Delivery counters.
    pub fn stats(&self) -> TopicStats {
        self.counters.snapshot()
    }
}

impl<E: Event> std::fmt::Debug for Topic<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Topic")
            .field("name", &E::NAME)
            .field("subscribers", &self.subscriber_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    struct Ping(u32);

    impl Event for Ping {
        const NAME: &'static str = "ping";
    }

    #[derive(Default)]
    struct Failing {
        seen: Mutex<Vec<u32>>,
    }

    #[async_trait]
    impl Subscriber<Ping> for Failing {
        async fn on_event(&self, event: Ping) -> Result<()> {
            self.seen.lock().push(event.0);
            Err(EventError::subscriber("failing", "always"))
        }
    }

    #[tokio::test]
    async fn failing_subscriber_does_not_affect_others() {
        let topic = Topic::<Ping>::new();
        let failing = Arc::new(Failing::default());
        topic.subscribe("failing", failing.clone()).unwrap();
        let mut rx = topic.subscribe_channel("collector").unwrap();

        topic.publish(Ping(1));
        topic.publish(Ping(2));

        assert_eq!(rx.recv().await, Some(Ping(1)));
        assert_eq!(rx.recv().await, Some(Ping(2)));

        for _ in 0..50 {
            if topic.stats().failed == 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(*failing.seen.lock(), vec![1, 2]);
        let stats = topic.stats();
        assert_eq!(stats.published, 2);
        assert_eq!(stats.delivered, 4);
        assert_eq!(stats.failed, 2);
    }

    #[tokio::test]
    async fn duplicate_names_rejected_and_closed_channels_dropped() {
        let topic = Topic::<Ping>::new();
        let rx = topic.subscribe_channel("a").unwrap();
        assert!(matches!(
            topic.subscribe_channel("a"),
            Err(EventError::DuplicateSubscriber { .. })
        ));
        drop(rx);
        topic.publish(Ping(7));
        assert!(topic.subscriber_names().is_empty());
    }

    #[test]
    fn subscribe_outside_runtime_is_an_error() {
        let topic = Topic::<Ping>::new();
        let err = topic
            .subscribe("late", Arc::new(Failing::default()))
            .unwrap_err();
        assert!(matches!(err, EventError::NoRuntime(_)));
        assert!(topic.subscriber_names().is_empty());
    }
}
