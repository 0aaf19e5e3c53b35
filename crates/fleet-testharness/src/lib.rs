//! ---
//! ems_section: "11-simulation"
//! ems_subsection: "01-bootstrap"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Test harness fixtures and recording fakes."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Shared fixtures for the engine test suites.
//!
//! The fakes record what the engine asked of them so tests can assert on
//! ordering and counts without a real provisioner or notification backend.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleet_common::AppConfig;
use fleet_events::{Event, Subscriber};
use fleet_orchestration::{Bundle, BundleBuilder, NotificationError, NotificationParams};
use fleet_process::{ProcessError, Step, StepResult};
use fleet_store::{
    Instance, Operation, OperationType, Orchestration, OrchestrationParameters,
    OrchestrationType, RuntimeTarget, TargetSpec,
};
use parking_lot::Mutex;
use tracing::debug;

/// Instance with a runtime assigned, in `westeurope` on the `azure` plan.
pub fn fixture_instance(instance_id: &str) -> Instance {
    Instance::new(
        instance_id,
        format!("runtime-{instance_id}"),
        "global-account-1",
        "azure",
        "westeurope",
    )
}

/// Pending operation for `instance_id`.
pub fn fixture_operation(id: &str, instance_id: &str, operation_type: OperationType) -> Operation {
    Operation::new(id, instance_id, operation_type)
}

/// Parameters targeting every runtime.
pub fn fixture_targets_all() -> OrchestrationParameters {
    OrchestrationParameters {
        targets: TargetSpec {
            include: vec![RuntimeTarget::all()],
            exclude: Vec::new(),
        },
        ..OrchestrationParameters::default()
    }
}

/// Pending runtime upgrade of every runtime.
pub fn fixture_orchestration(id: &str) -> Orchestration {
    Orchestration::new(id, OrchestrationType::UpgradeRuntime, fixture_targets_all())
}

/// Configuration with millisecond waits so scenarios finish quickly.
pub fn fixture_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.queues.provisioning_workers = 4;
    config.queues.deprovisioning_workers = 2;
    config.queues.update_workers = 2;
    config.queues.orchestration_workers = 2;
    config.operations.temporary_backoff = Duration::from_millis(10);
    config.orchestration.polling_interval = Duration::from_millis(10);
    config.orchestration.not_found_backoff = Duration::from_millis(10);
    config.orchestration.parallel_workers = 4;
    config.metrics.enabled = false;
    config
}

/// Scripted result of one [`RecordingStep`] run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// Finish the step.
    Done,
    /// Ask to run again after the delay.
    Delay(Duration),
    /// Fail temporarily.
    Temporary(String),
    /// Fail for good.
    Fatal(String),
}

/// Step that records every run and replays scripted outcomes, then
/// [`StepOutcome::Done`] once the script is exhausted.
#[derive(Debug)]
pub struct RecordingStep {
    name: String,
    script: Mutex<VecDeque<StepOutcome>>,
    runs: Mutex<Vec<String>>,
}

impl RecordingStep {
    /// Step that always succeeds.
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Self::scripted(name, [])
    }

    /// Step replaying `script` in order.
    pub fn scripted(
        name: impl Into<String>,
        script: impl IntoIterator<Item = StepOutcome>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            script: Mutex::new(script.into_iter().collect()),
            runs: Mutex::new(Vec::new()),
        })
    }

    /// Operation ids in run order.
    pub fn runs(&self) -> Vec<String> {
        self.runs.lock().clone()
    }

    /// Number of runs so far.
    pub fn run_count(&self) -> usize {
        self.runs.lock().len()
    }
}

#[async_trait]
impl Step for RecordingStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, operation: Operation) -> StepResult {
        self.runs.lock().push(operation.id.clone());
        let outcome = self.script.lock().pop_front().unwrap_or(StepOutcome::Done);
        debug!(step = %self.name, operation_id = %operation.id, ?outcome, "recording step ran");
        match outcome {
            StepOutcome::Done => Ok((operation, Duration::ZERO)),
            StepOutcome::Delay(delay) => Ok((operation, delay)),
            StepOutcome::Temporary(reason) => Err(ProcessError::temporary(reason)),
            StepOutcome::Fatal(reason) => Err(ProcessError::fatal(reason)),
        }
    }
}

/// Notification calls seen by a [`RecordingBundleBuilder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationCall {
    /// Create event with its payload.
    Create(NotificationParams),
    /// Update event.
    Update(String),
    /// Cancel event.
    Cancel(String),
}

#[derive(Debug, Default)]
struct NotificationLog {
    calls: Mutex<Vec<NotificationCall>>,
    temporary_failures: Mutex<usize>,
}

/// Bundle builder recording every event. Can fail the next creates
/// temporarily.
#[derive(Debug, Clone, Default)]
pub struct RecordingBundleBuilder {
    log: Arc<NotificationLog>,
}

impl RecordingBundleBuilder {
    /// Builder with notifications enabled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` create calls with a temporary error.
    pub fn fail_next_creates(&self, count: usize) {
        *self.log.temporary_failures.lock() = count;
    }

    /// Every delivered call, in order.
    pub fn calls(&self) -> Vec<NotificationCall> {
        self.log.calls.lock().clone()
    }

    /// Payloads of the delivered create events.
    pub fn created(&self) -> Vec<NotificationParams> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                NotificationCall::Create(params) => Some(params),
                _ => None,
            })
            .collect()
    }

    /// Orchestration ids of the delivered cancel events.
    pub fn cancelled(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                NotificationCall::Cancel(id) => Some(id),
                _ => None,
            })
            .collect()
    }
}

struct RecordingBundle {
    params: NotificationParams,
    log: Arc<NotificationLog>,
}

#[async_trait]
impl Bundle for RecordingBundle {
    async fn create_notification_event(&self) -> Result<(), NotificationError> {
        {
            let mut failures = self.log.temporary_failures.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(NotificationError::Temporary("notification backend busy".into()));
            }
        }
        self.log
            .calls
            .lock()
            .push(NotificationCall::Create(self.params.clone()));
        Ok(())
    }

    async fn update_notification_event(&self) -> Result<(), NotificationError> {
        self.log
            .calls
            .lock()
            .push(NotificationCall::Update(self.params.orchestration_id.clone()));
        Ok(())
    }

    async fn cancel_notification_event(&self) -> Result<(), NotificationError> {
        self.log
            .calls
            .lock()
            .push(NotificationCall::Cancel(self.params.orchestration_id.clone()));
        Ok(())
    }
}

impl BundleBuilder for RecordingBundleBuilder {
    fn disabled_check(&self) -> bool {
        false
    }

    fn new_bundle(
        &self,
        _id: &str,
        params: NotificationParams,
    ) -> Result<Box<dyn Bundle>, NotificationError> {
        Ok(Box::new(RecordingBundle {
            params,
            log: self.log.clone(),
        }))
    }
}

/// Subscriber keeping every event it receives.
#[derive(Debug)]
pub struct CollectingSubscriber<E> {
    events: Mutex<Vec<E>>,
}

impl<E> Default for CollectingSubscriber<E> {
    fn default() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }
}

impl<E: Clone> CollectingSubscriber<E> {
    /// Empty collector, ready to subscribe.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Events received so far.
    pub fn events(&self) -> Vec<E> {
        self.events.lock().clone()
    }

    /// Number of events received so far.
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// True when nothing was received.
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    /// Wait until at least `count` events arrived. Returns false on timeout.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            while self.len() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .is_ok()
    }
}

#[async_trait]
impl<E: Event> Subscriber<E> for CollectingSubscriber<E> {
    async fn on_event(&self, event: E) -> fleet_events::Result<()> {
        self.events.lock().push(event);
        Ok(())
    }
}

/// Poll `condition` every few milliseconds until it holds or `timeout`
/// passes. Returns whether it held.
pub async fn eventually<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(timeout, async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .is_ok()
}
