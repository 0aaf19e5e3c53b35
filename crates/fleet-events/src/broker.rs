//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Message schema helpers and protocol codecs."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;

use tracing::trace;

use crate::topic::Topic;
use crate::types::{OperationStateChanged, OrchestrationStateChanged, StepProcessed};

/// One topic per engine event type. Lives from startup to shutdown.
#[derive(Debug, Default)]
pub struct EventBroker {
    step_processed: Topic<StepProcessed>,
    operation_state_changed: Topic<OperationStateChanged>,
    orchestration_state_changed: Topic<OrchestrationStateChanged>,
}

impl EventBroker {
    /// Broker wrapped for sharing between managers.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Step-processed topic.
    pub fn step_processed(&self) -> &Topic<StepProcessed> {
        &self.step_processed
    }

    /// Operation state-change topic.
    pub fn operation_state_changed(&self) -> &Topic<OperationStateChanged> {
        &self.operation_state_changed
    }

    /// Orchestration state-change topic.
    pub fn orchestration_state_changed(&self) -> &Topic<OrchestrationStateChanged> {
        &self.orchestration_state_changed
    }

    /// Publish a step outcome.
    pub fn publish_step(&self, event: StepProcessed) {
        trace!(
            operation_id = %event.operation_id,
            stage = %event.stage,
            step = %event.step,
            outcome = event.outcome(),
            "step processed"
        );
        self.step_processed.publish(event);
    }

    /// Publish an operation transition; no-op when the state did not change.
    pub fn publish_operation_state(&self, event: OperationStateChanged) {
        if event.old_state != event.new_state {
            self.operation_state_changed.publish(event);
        }
    }

    /// Publish an orchestration transition; no-op when the state did not change.
    pub fn publish_orchestration_state(&self, event: OrchestrationStateChanged) {
        if event.old_state != event.new_state {
            self.orchestration_state_changed.publish(event);
        }
    }
}
