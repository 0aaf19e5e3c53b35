//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Message schema helpers and protocol codecs."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Process-wide event stream.
//!
//! Managers publish into typed [`Topic`]s held by the [`EventBroker`]; metrics
//! and telemetry consumers subscribe by name. Each subscriber drains its own
//! unbounded channel, so a slow or failing consumer never blocks a step.

pub mod broker;
pub mod topic;
pub mod types;

/// Shared result type for event delivery.
pub type Result<T> = std::result::Result<T, EventError>;

/// Errors raised by subscribers and topic management.
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    /// A subscriber rejected an event; logged by the topic, never propagated.
    #[error("subscriber {subscriber} failed: {reason}")]
    Subscriber {
        /// Subscriber name.
        subscriber: String,
        /// Failure description.
        reason: String,
    },
    /// Spawning a drain task requires a running tokio runtime.
    #[error("no tokio runtime available to drain subscriber {0}")]
    NoRuntime(String),
    /// The subscriber name is already registered on the topic.
    #[error("subscriber {subscriber} already registered on topic {topic}")]
    DuplicateSubscriber {
        /// Topic name.
        topic: &'static str,
        /// Subscriber name.
        subscriber: String,
    },
}

impl EventError {
    /// Convenience constructor for subscriber implementations.
    pub fn subscriber(subscriber: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Subscriber {
            subscriber: subscriber.into(),
            reason: reason.to_string(),
        }
    }
}

pub use broker::EventBroker;
pub use topic::{Subscriber, Topic, TopicStats};
pub use types::{Event, OperationStateChanged, OrchestrationStateChanged, StepProcessed};
