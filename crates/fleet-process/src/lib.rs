//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Staged operation pipeline and worker queues."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Processing core for long-running operations.
//!
//! A [`StagedManager`] drives one operation through ordered stages of
//! idempotent [`Step`]s. A [`Queue`] feeds operation ids to any [`Executor`]
//! from a fixed worker pool and re-enqueues ids whose execution asked for a
//! delay. [`poll_until`] is the cancellable wait loop used by long-lived
//! executors such as the orchestration manager.

use std::time::Duration;

use async_trait::async_trait;
use fleet_store::StoreError;

pub mod poll;
pub mod queue;
pub mod staged;
pub mod step;

/// Shared result type for processing.
pub type Result<T> = std::result::Result<T, ProcessError>;

/// Error taxonomy for managers and steps.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// Record does not exist. Benign when resuming after a restart.
    #[error("not found: {0}")]
    NotFound(String),
    /// Stale-version write; reload and retry.
    #[error("conflict: {0}")]
    Conflict(String),
    /// Transient collaborator failure; back off without changing state.
    #[error("temporary failure: {0}")]
    Temporary(String),
    /// Validation or logic error; the entity is marked failed.
    #[error("{0}")]
    Fatal(String),
    /// Unclassified error raised by a step; handled as fatal.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ProcessError {
    /// Construct a temporary error.
    pub fn temporary(message: impl Into<String>) -> Self {
        Self::Temporary(message.into())
    }

    /// Construct a fatal error.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }

    /// True for errors that only delay completion.
    pub fn is_temporary(&self) -> bool {
        matches!(self, Self::Temporary(_))
    }

    /// True for errors resolved by backing off and running again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Temporary(_) | Self::Conflict(_))
    }

    /// True when the record is missing.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<StoreError> for ProcessError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { .. } => Self::NotFound(err.to_string()),
            StoreError::Conflict { .. } => Self::Conflict(err.to_string()),
            other => Self::Temporary(other.to_string()),
        }
    }
}

/// Anything the queue can drive: processes one id and reports when to run
/// it again. A zero delay means done.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Process `id` once.
    async fn execute(&self, id: &str) -> Result<Duration>;
}

pub use poll::{cancellation, poll_until, CancelHandle, CancelToken, Poller};
pub use queue::{Queue, QueueHandle};
pub use staged::StagedManager;
pub use step::{Step, StepCondition, StepResult};
