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

use async_trait::async_trait;
use fleet_store::Operation;

use crate::ProcessError;

/// Outcome of one step attempt: the (possibly persisted) operation and the
/// delay after which the step wants to run again. Zero means the step is done.
pub type StepResult = std::result::Result<(Operation, Duration), ProcessError>;

/// Single idempotent unit of work. May be run any number of times for the
/// same operation.
#[async_trait]
pub trait Step: Send + Sync {
    /// Stable name used in logs and events.
    fn name(&self) -> &str;

    /// Run against the current operation snapshot.
    async fn run(&self, operation: Operation) -> StepResult;
}

/// Predicate deciding whether a step applies to an operation. A skipped step
/// counts as done for its stage.
pub type StepCondition = Arc<dyn Fn(&Operation) -> bool + Send + Sync>;

pub(crate) struct RegisteredStep {
    pub(crate) step: Arc<dyn Step>,
    pub(crate) condition: Option<StepCondition>,
}

impl RegisteredStep {
    pub(crate) fn applies_to(&self, operation: &Operation) -> bool {
        self.condition
            .as_ref()
            .map_or(true, |condition| condition(operation))
    }
}

pub(crate) struct Stage {
    pub(crate) name: String,
    pub(crate) steps: Vec<RegisteredStep>,
}
