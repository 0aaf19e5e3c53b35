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
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use fleet_common::{OperationsConfig, SharedClock, SystemClock};
use fleet_events::{EventBroker, OperationStateChanged, StepProcessed};
use fleet_store::{Operation, OperationReader, OperationState, OperationType, OperationWriter, Operations};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::step::{RegisteredStep, Stage, Step, StepCondition};
use crate::{Executor, ProcessError, Result};

const FAIL_ATTEMPTS: usize = 3;

/// Drives operations of one type through ordered stages of steps.
///
/// The stage list is fixed before the manager is shared. Completed stages are
/// persisted on the operation and never re-entered; a stage interrupted by a
/// delay restarts from its first step on the next call, so steps must be
/// idempotent.
pub struct StagedManager {
    operation_type: OperationType,
    operations: Operations,
    broker: Arc<EventBroker>,
    stages: Vec<Stage>,
    clock: SharedClock,
    timeout: Duration,
    temporary_backoff: Duration,
}

impl StagedManager {
    /// Manager for `operation_type` without stages.
    pub fn new(
        operation_type: OperationType,
        operations: Operations,
        broker: Arc<EventBroker>,
        config: &OperationsConfig,
    ) -> Self {
        Self {
            operation_type,
            operations,
            broker,
            stages: Vec::new(),
            clock: Arc::new(SystemClock),
            timeout: config.timeout,
            temporary_backoff: config.temporary_backoff,
        }
    }

    /// Replace the wall-clock source used for timeout checks.
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Append stages in execution order. Names already defined are ignored.
    pub fn define_stages<I, S>(&mut self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for name in names {
            let name = name.into();
            if self.stages.iter().any(|stage| stage.name == name) {
                continue;
            }
            self.stages.push(Stage {
                name,
                steps: Vec::new(),
            });
        }
    }

    /// Register `step` at the end of `stage`.
    pub fn add_step(
        &mut self,
        stage: &str,
        step: Arc<dyn Step>,
        condition: Option<StepCondition>,
    ) -> Result<()> {
        let Some(target) = self.stages.iter_mut().find(|s| s.name == stage) else {
            return Err(ProcessError::fatal(format!(
                "stage {stage} is not defined for {} operations",
                self.operation_type
            )));
        };
        target.steps.push(RegisteredStep { step, condition });
        Ok(())
    }

    /// Stage names in execution order.
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name.as_str()).collect()
    }

    /// Operation type this manager drives.
    pub fn operation_type(&self) -> OperationType {
        self.operation_type
    }

    async fn process(&self, mut operation: Operation) -> Result<Duration> {
        if operation.state == OperationState::Pending || operation.state == OperationState::Retrying {
            let old_state = operation.state;
            operation.state = OperationState::InProgress;
            operation = self.operations.update_operation(operation).await?;
            self.broker
                .publish_operation_state(OperationStateChanged::new(&operation, old_state));
        }

        for stage in &self.stages {
            if operation.is_stage_finished(&stage.name) {
                continue;
            }
            for registered in &stage.steps {
                if !registered.applies_to(&operation) {
                    debug!(stage = %stage.name, step = registered.step.name(), "step skipped by condition");
                    continue;
                }
                self.check_timeout(&operation)?;

                let (next, delay) = self.run_step(&stage.name, registered, operation).await?;
                operation = next;
                if !delay.is_zero() {
                    info!(stage = %stage.name, step = registered.step.name(), delay_ms = delay.as_millis() as u64, "step requested retry");
                    self.operations.update_operation(operation).await?;
                    return Ok(delay);
                }
            }
            operation.finish_stage(&stage.name);
            operation = self.operations.update_operation(operation).await?;
            debug!(stage = %stage.name, "stage finished");
        }

        let old_state = operation.state;
        operation.state = OperationState::Succeeded;
        let operation = self.operations.update_operation(operation).await?;
        info!("operation succeeded");
        self.broker
            .publish_operation_state(OperationStateChanged::new(&operation, old_state));
        Ok(Duration::ZERO)
    }

    async fn run_step(
        &self,
        stage: &str,
        registered: &RegisteredStep,
        operation: Operation,
    ) -> Result<(Operation, Duration)> {
        let step_name = registered.step.name().to_owned();
        let operation_id = operation.id.clone();
        let orchestration_id = operation.orchestration_id.clone();
        let old_state = operation.state;

        let span = info_span!("step", stage = %stage, step = %step_name);
        let started = Instant::now();
        let outcome = registered.step.run(operation).instrument(span).await;
        let duration = started.elapsed();

        let (delay, error, new_state) = match &outcome {
            Ok((op, delay)) => (*delay, None, op.state),
            Err(err) if err.is_retryable() => (Duration::ZERO, Some(err.to_string()), old_state),
            Err(err) => (Duration::ZERO, Some(err.to_string()), OperationState::Failed),
        };
        self.broker.publish_step(StepProcessed {
            operation_id,
            operation_type: self.operation_type,
            orchestration_id,
            stage: stage.to_owned(),
            step: step_name,
            duration,
            delay,
            error,
            old_state,
            new_state,
            timestamp: Utc::now(),
        });
        outcome
    }

    fn check_timeout(&self, operation: &Operation) -> Result<()> {
        let elapsed = operation.elapsed_since_start(self.clock.now());
        if elapsed > self.timeout {
            return Err(ProcessError::fatal(format!(
                "operation exceeded the time limit of {}s",
                self.timeout.as_secs()
            )));
        }
        Ok(())
    }

    /// Mark the stored operation failed. Reloads on conflict so a step that
    /// persisted before failing is not overwritten with stale data.
    async fn fail(&self, operation_id: &str, cause: &ProcessError) {
        for attempt in 1..=FAIL_ATTEMPTS {
            let mut operation = match self.operations.get_operation(operation_id).await {
                Ok(operation) => operation,
                Err(err) => {
                    error!(error = %err, "unable to load operation to mark it failed");
                    return;
                }
            };
            if operation.is_finished() {
                return;
            }
            let old_state = operation.state;
            operation.state = OperationState::Failed;
            operation.append_description(cause.to_string());
            match self.operations.update_operation(operation).await {
                Ok(updated) => {
                    self.broker
                        .publish_operation_state(OperationStateChanged::new(&updated, old_state));
                    return;
                }
                Err(err) if err.is_conflict() && attempt < FAIL_ATTEMPTS => {
                    debug!(attempt, "conflict while marking operation failed, reloading");
                }
                Err(err) => {
                    error!(error = %err, "unable to mark operation failed");
                    return;
                }
            }
        }
    }
}

impl std::fmt::Debug for StagedManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StagedManager")
            .field("operation_type", &self.operation_type)
            .field("stages", &self.stage_names())
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Executor for StagedManager {
    async fn execute(&self, operation_id: &str) -> Result<Duration> {
        let span = info_span!("operation", operation_id = %operation_id, operation_type = %self.operation_type);
        async {
            let operation = match self.operations.get_operation(operation_id).await {
                Ok(operation) => operation,
                Err(err) if err.is_not_found() => {
                    error!("operation not found");
                    return Err(ProcessError::from(err));
                }
                Err(err) => {
                    warn!(error = %err, "unable to load operation, backing off");
                    return Ok(self.temporary_backoff);
                }
            };
            if operation.is_finished() {
                debug!(state = %operation.state, "operation already finished");
                return Ok(Duration::ZERO);
            }

            match self.process(operation).await {
                Ok(delay) => Ok(delay),
                Err(err) if err.is_retryable() => {
                    warn!(error = %err, backoff_ms = self.temporary_backoff.as_millis() as u64, "temporary failure, backing off");
                    Ok(self.temporary_backoff)
                }
                Err(err) if err.is_not_found() => {
                    info!("operation removed during processing");
                    Ok(Duration::ZERO)
                }
                Err(err) => {
                    error!(error = %err, "operation failed");
                    self.fail(operation_id, &err).await;
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }
}
