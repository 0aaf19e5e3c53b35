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
use chrono::Utc;
use fleet_common::{ManualClock, OperationsConfig};
use fleet_events::{EventBroker, StepProcessed};
use fleet_process::{Executor, ProcessError, StagedManager, Step, StepCondition, StepResult};
use fleet_store::{
    Operation, OperationReader, OperationState, OperationType, OperationWriter, Operations,
    Storage,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;

const OP_SUCCESS: &str = "5b954fa8-fc34-4164-96e9-49e3b6741278";
const OP_FAILED: &str = "69b8ee2b-5c21-4997-9070-4fd356b24c46";
const OP_REPEAT: &str = "ca317a1e-ddab-44d2-b2ba-7bbd9df9066f";
const OP_TEMPORARY: &str = "0c4b9d6e-8f0e-4a8b-9d49-1f4a0e2b7c11";

/// Appends its name to the description, persists, then reacts to the id.
struct DescribingStep {
    name: &'static str,
    operations: Operations,
    runs: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Step for DescribingStep {
    fn name(&self) -> &str {
        self.name
    }

    async fn run(&self, mut operation: Operation) -> StepResult {
        self.runs.lock().push(self.name.to_owned());
        operation.append_description(self.name);
        let updated = self.operations.update_operation(operation).await?;
        match updated.id.as_str() {
            OP_FAILED => Err(ProcessError::fatal(format!("operation {} failed", updated.id))),
            OP_REPEAT => Ok((updated, Duration::from_millis(10))),
            OP_TEMPORARY => Err(ProcessError::temporary("provisioner unavailable")),
            _ => Ok((updated, Duration::ZERO)),
        }
    }
}

struct Fixture {
    storage: Storage,
    manager: StagedManager,
    events: mpsc::UnboundedReceiver<StepProcessed>,
    runs: Arc<Mutex<Vec<String>>>,
}

async fn fixture(operation_id: &str, state: OperationState) -> Fixture {
    let storage = Storage::in_memory();
    let mut op = Operation::new(operation_id, "inst-1", OperationType::Deprovision);
    op.state = state;
    storage.operations().insert_operation(op).await.unwrap();

    let broker = EventBroker::shared();
    let events = broker.step_processed().subscribe_channel("collector").unwrap();
    let mut manager = StagedManager::new(
        OperationType::Deprovision,
        storage.operations().clone(),
        broker,
        &OperationsConfig::default(),
    );
    manager.define_stages(["start", "remove_runtime", "finish"]);

    let runs = Arc::new(Mutex::new(Vec::new()));
    let step = |name: &'static str| -> Arc<dyn Step> {
        Arc::new(DescribingStep {
            name,
            operations: storage.operations().clone(),
            runs: runs.clone(),
        })
    };
    // registered out of order on purpose: stage order wins
    manager.add_step("finish", step("final"), None).unwrap();
    manager.add_step("start", step("init"), None).unwrap();
    manager.add_step("remove_runtime", step("one"), None).unwrap();
    manager.add_step("remove_runtime", step("two"), None).unwrap();

    Fixture {
        storage,
        manager,
        events,
        runs,
    }
}

fn drain(events: &mut mpsc::UnboundedReceiver<StepProcessed>) -> Vec<StepProcessed> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

#[tokio::test]
async fn successful_operation_runs_every_stage_in_order() {
    let mut fx = fixture(OP_SUCCESS, OperationState::InProgress).await;

    let delay = fx.manager.execute(OP_SUCCESS).await.unwrap();
    assert_eq!(delay, Duration::ZERO);

    let op = fx.storage.operations().get_operation(OP_SUCCESS).await.unwrap();
    assert_eq!(op.state, OperationState::Succeeded);
    assert_eq!(op.description, "init; one; two; final");
    assert_eq!(op.finished_stages, vec!["start", "remove_runtime", "finish"]);
    assert_eq!(drain(&mut fx.events).len(), 4);
}

#[tokio::test]
async fn failing_step_marks_operation_failed() {
    let mut fx = fixture(OP_FAILED, OperationState::InProgress).await;

    let err = fx.manager.execute(OP_FAILED).await.unwrap_err();
    assert!(!err.is_retryable());

    let op = fx.storage.operations().get_operation(OP_FAILED).await.unwrap();
    assert_eq!(op.state, OperationState::Failed);
    assert!(op.description.starts_with("init; operation"));

    let events = drain(&mut fx.events);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].new_state, OperationState::Failed);
    assert!(events[0].error.is_some());
}

#[tokio::test]
async fn delayed_step_returns_delay_and_keeps_position() {
    let mut fx = fixture(OP_REPEAT, OperationState::InProgress).await;

    let delay = fx.manager.execute(OP_REPEAT).await.unwrap();
    assert_eq!(delay, Duration::from_millis(10));

    let op = fx.storage.operations().get_operation(OP_REPEAT).await.unwrap();
    assert_eq!(op.state, OperationState::InProgress);
    assert_eq!(op.description, "init");
    assert!(op.finished_stages.is_empty());

    let events = drain(&mut fx.events);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].delay, Duration::from_millis(10));
}

#[tokio::test]
async fn temporary_error_backs_off_without_state_change() {
    let mut fx = fixture(OP_TEMPORARY, OperationState::InProgress).await;

    let delay = fx.manager.execute(OP_TEMPORARY).await.unwrap();
    assert_eq!(delay, OperationsConfig::default().temporary_backoff);

    let op = fx.storage.operations().get_operation(OP_TEMPORARY).await.unwrap();
    assert_eq!(op.state, OperationState::InProgress);
    assert_eq!(drain(&mut fx.events).len(), 1);
}

#[tokio::test]
async fn terminal_operation_is_a_no_op() {
    let mut fx = fixture(OP_SUCCESS, OperationState::Succeeded).await;

    let delay = fx.manager.execute(OP_SUCCESS).await.unwrap();
    assert_eq!(delay, Duration::ZERO);
    assert!(fx.runs.lock().is_empty());
    assert!(drain(&mut fx.events).is_empty());

    let op = fx.storage.operations().get_operation(OP_SUCCESS).await.unwrap();
    assert_eq!(op.state, OperationState::Succeeded);
    assert_eq!(op.version, 0);
}

#[tokio::test]
async fn pending_operation_moves_to_in_progress_first() {
    let broker = EventBroker::shared();
    let mut states = broker
        .operation_state_changed()
        .subscribe_channel("states")
        .unwrap();
    let storage = Storage::in_memory();
    storage
        .operations()
        .insert_operation(Operation::new("op-1", "inst-1", OperationType::Update))
        .await
        .unwrap();
    let manager = StagedManager::new(
        OperationType::Update,
        storage.operations().clone(),
        broker,
        &OperationsConfig::default(),
    );

    manager.execute("op-1").await.unwrap();

    let first = states.try_recv().unwrap();
    assert_eq!(
        (first.old_state, first.new_state),
        (OperationState::Pending, OperationState::InProgress)
    );
    let second = states.try_recv().unwrap();
    assert_eq!(second.new_state, OperationState::Succeeded);
}

#[tokio::test]
async fn completed_stages_are_not_re_entered() {
    let mut fx = fixture(OP_SUCCESS, OperationState::InProgress).await;
    let mut op = fx.storage.operations().get_operation(OP_SUCCESS).await.unwrap();
    op.finish_stage("start");
    fx.storage.operations().update_operation(op).await.unwrap();

    fx.manager.execute(OP_SUCCESS).await.unwrap();

    assert_eq!(*fx.runs.lock(), vec!["one", "two", "final"]);
    assert_eq!(drain(&mut fx.events).len(), 3);
}

#[tokio::test]
async fn condition_skips_step() {
    let mut fx = fixture(OP_SUCCESS, OperationState::InProgress).await;
    fx.manager.define_stages(["cleanup"]);
    let skipped: StepCondition = Arc::new(|op: &Operation| op.parameters.get("purge").is_some());
    fx.manager
        .add_step(
            "cleanup",
            Arc::new(DescribingStep {
                name: "purge",
                operations: fx.storage.operations().clone(),
                runs: fx.runs.clone(),
            }),
            Some(skipped),
        )
        .unwrap();

    fx.manager.execute(OP_SUCCESS).await.unwrap();

    assert!(!fx.runs.lock().iter().any(|name| name == "purge"));
    let op = fx.storage.operations().get_operation(OP_SUCCESS).await.unwrap();
    assert!(op.is_stage_finished("cleanup"));
    assert_eq!(op.state, OperationState::Succeeded);
}

#[tokio::test]
async fn unknown_stage_is_rejected() {
    let mut fx = fixture(OP_SUCCESS, OperationState::InProgress).await;
    let err = fx
        .manager
        .add_step(
            "missing",
            Arc::new(DescribingStep {
                name: "x",
                operations: fx.storage.operations().clone(),
                runs: fx.runs.clone(),
            }),
            None,
        )
        .unwrap_err();
    assert!(err.to_string().contains("missing"));
}

#[tokio::test]
async fn missing_operation_is_reported() {
    let fx = fixture(OP_SUCCESS, OperationState::InProgress).await;
    let err = fx.manager.execute("ghost").await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn timed_out_operation_fails_before_next_step() {
    let fx = fixture(OP_SUCCESS, OperationState::InProgress).await;
    let clock = Arc::new(ManualClock::new(Utc::now()));
    clock.advance(Duration::from_secs(25 * 3600));
    let manager = fx.manager.with_clock(clock);

    let err = manager.execute(OP_SUCCESS).await.unwrap_err();
    assert!(err.to_string().contains("time limit"));
    assert!(fx.runs.lock().is_empty());

    let op = fx.storage.operations().get_operation(OP_SUCCESS).await.unwrap();
    assert_eq!(op.state, OperationState::Failed);
}
