//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Message schema helpers and protocol codecs."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fmt::Debug;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleet_store::{
    Operation, OperationState, OperationType, Orchestration, OrchestrationState,
    OrchestrationType,
};
use serde::{Deserialize, Serialize};

/// Marker for payloads carried on a [`crate::Topic`].
pub trait Event: Clone + Debug + Send + Sync + 'static {
    /// Topic name used in logs.
    const NAME: &'static str;
}

/// Emitted after every step attempt, successful or not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepProcessed {
    /// Operation the step ran for.
    pub operation_id: String,
    /// Pipeline the step belongs to.
    pub operation_type: OperationType,
    /// Owning orchestration, if any.
    pub orchestration_id: Option<String>,
    /// Stage name.
    pub stage: String,
    /// Step name.
    pub step: String,
    /// Wall-clock time spent inside the step.
    pub duration: Duration,
    /// Requested retry delay; zero when the step completed.
    pub delay: Duration,
    /// Step error, rendered.
    pub error: Option<String>,
    /// Operation state before the step.
    pub old_state: OperationState,
    /// Operation state after the manager handled the outcome.
    pub new_state: OperationState,
    /// Emission time.
    pub timestamp: DateTime<Utc>,
}

impl StepProcessed {
    /// `"error"`, `"delayed"` or `"done"`.
    pub fn outcome(&self) -> &'static str {
        if self.error.is_some() {
            "error"
        } else if !self.delay.is_zero() {
            "delayed"
        } else {
            "done"
        }
    }
}

impl Event for StepProcessed {
    const NAME: &'static str = "step_processed";
}

/// Emitted whenever a manager moves an operation to another state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationStateChanged {
    /// Operation identifier.
    pub operation_id: String,
    /// Operation type.
    pub operation_type: OperationType,
    /// Owning orchestration, if any.
    pub orchestration_id: Option<String>,
    /// Previous state.
    pub old_state: OperationState,
    /// New state.
    pub new_state: OperationState,
    /// Emission time.
    pub timestamp: DateTime<Utc>,
}

impl OperationStateChanged {
    /// Build the event for `operation`, which already carries the new state.
    pub fn new(operation: &Operation, old_state: OperationState) -> Self {
        Self {
            operation_id: operation.id.clone(),
            operation_type: operation.operation_type,
            orchestration_id: operation.orchestration_id.clone(),
            old_state,
            new_state: operation.state,
            timestamp: Utc::now(),
        }
    }
}

impl Event for OperationStateChanged {
    const NAME: &'static str = "operation_state_changed";
}

/// Emitted whenever the orchestration manager persists a new campaign state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationStateChanged {
    /// Orchestration identifier.
    pub orchestration_id: String,
    /// Campaign kind.
    pub orchestration_type: OrchestrationType,
    /// Previous state.
    pub old_state: OrchestrationState,
    /// New state.
    pub new_state: OrchestrationState,
    /// Description at the time of the transition.
    pub description: String,
    /// Emission time.
    pub timestamp: DateTime<Utc>,
}

impl OrchestrationStateChanged {
    /// Build the event for `orchestration`, which already carries the new state.
    pub fn new(orchestration: &Orchestration, old_state: OrchestrationState) -> Self {
        Self {
            orchestration_id: orchestration.id.clone(),
            orchestration_type: orchestration.orchestration_type,
            old_state,
            new_state: orchestration.state,
            description: orchestration.description.clone(),
            timestamp: Utc::now(),
        }
    }
}

impl Event for OrchestrationStateChanged {
    const NAME: &'static str = "orchestration_state_changed";
}
