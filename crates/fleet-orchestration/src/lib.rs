//! ---
//! ems_section: "04-configuration-orchestration"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "High-level orchestration kernel coordinating fleet campaigns."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Fleet-wide campaigns built on the processing core.
//!
//! An [`OrchestrationManager`] expands one orchestration into per-runtime
//! operations through a [`RuntimeResolver`] and an [`OperationFactory`],
//! assigns maintenance windows from a [`MaintenancePolicy`], runs the batch on
//! an [`ExecutionStrategy`] and polls the store until the campaign settles.

use fleet_process::ProcessError;
use fleet_store::StoreError;
use thiserror::Error;

pub mod factory;
pub mod maintenance;
pub mod manager;
pub mod notification;
pub mod policy;
pub mod resolver;
pub mod strategy;

/// Result alias for orchestration components.
pub type Result<T> = std::result::Result<T, OrchestrationError>;

/// Errors raised by orchestration collaborators.
#[derive(Debug, Error)]
pub enum OrchestrationError {
    /// A target selector could not be evaluated.
    #[error("invalid target: {0}")]
    InvalidTarget(String),
    /// Storage failure.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Maintenance policy could not be loaded.
    #[error("maintenance policy unavailable: {0}")]
    Policy(String),
    /// The execution handle is unknown or already closed.
    #[error("execution {0} not found")]
    ExecutionNotFound(String),
    /// A runtime operation was handed over without its runtime snapshot.
    #[error("operation {0} carries no runtime")]
    NoRuntime(String),
    /// Validation or logic error.
    #[error("{0}")]
    Fatal(String),
}

impl OrchestrationError {
    /// Construct a fatal error.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }

    /// True when running the same call again may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Store(err) if !err.is_not_found())
    }
}

impl From<OrchestrationError> for ProcessError {
    fn from(err: OrchestrationError) -> Self {
        match err {
            OrchestrationError::Store(err) => ProcessError::from(err),
            other => ProcessError::Fatal(other.to_string()),
        }
    }
}

pub use factory::{is_retryable, OperationFactory, RuntimeOperation, StoreOperationFactory};
pub use maintenance::{
    resolve_window, CompiledPolicy, MaintenancePolicy, MaintenancePolicyEntry,
    MaintenancePolicyMatch, MaintenancePolicyRule,
};
pub use manager::{update_retrying_description, OrchestrationManager};
pub use notification::{
    event_type_for, Bundle, BundleBuilder, DisabledBundleBuilder, NotificationError,
    NotificationParams, NotificationTenant, KUBERNETES_MAINTENANCE_EVENT,
    RUNTIME_MAINTENANCE_EVENT,
};
pub use policy::{JsonFilePolicySource, PolicySource, StaticPolicySource};
pub use resolver::{InstanceResolver, RuntimeResolver};
pub use strategy::{ExecutionStrategy, ParallelStrategy};
