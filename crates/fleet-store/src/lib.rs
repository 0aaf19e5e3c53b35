//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Persistence abstractions and storage bindings."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Durable records for operations, orchestrations, and instances.
//!
//! Every write is version-checked: callers hand back the record they read and
//! the store rejects it with [`StoreError::Conflict`] when somebody else wrote
//! in between. A missing record is always [`StoreError::NotFound`], never a
//! conflict, so callers can choose between reload-and-retry and abort.

/// Result alias used throughout the store crate.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Error type for the storage subsystem.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The requested record does not exist.
    #[error("{kind} {id} not found")]
    NotFound {
        /// Record kind, e.g. `operation`.
        kind: &'static str,
        /// Identifier that was looked up.
        id: String,
    },
    /// Stale-version write.
    #[error("{kind} {id} version conflict: expected {expected}, found {actual}")]
    Conflict {
        /// Record kind.
        kind: &'static str,
        /// Identifier of the record.
        id: String,
        /// Version supplied by the writer.
        expected: u64,
        /// Version currently stored.
        actual: u64,
    },
    /// Insert of an identifier that is already taken.
    #[error("{kind} {id} already exists")]
    AlreadyExists {
        /// Record kind.
        kind: &'static str,
        /// Duplicate identifier.
        id: String,
    },
    /// Backend failure (connection loss, serialization, ...).
    #[error("storage error: {0}")]
    Internal(String),
}

impl StoreError {
    /// Construct a not-found error.
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// True when the record does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// True when the write lost an optimistic-lock race.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

pub mod instance;
pub mod memory;
pub mod operation;
pub mod orchestration;
pub mod runtime;
pub mod storage;

pub use instance::Instance;
pub use memory::MemoryStorage;
pub use operation::{Operation, OperationFilter, OperationState, OperationStats, OperationType};
pub use orchestration::{
    NotificationState, Orchestration, OrchestrationFilter, OrchestrationParameters,
    OrchestrationState, OrchestrationType, ParallelStrategySpec, RetryOperationParameters,
    RuntimeTarget, StrategySpec, StrategyType, TargetSpec, TARGET_ALL,
};
pub use runtime::{MaintenanceWindow, Runtime};
pub use storage::{
    Instances, OperationReader, OperationWriter, Operations, Orchestrations, Storage,
};
