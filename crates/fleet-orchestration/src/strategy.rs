//! ---
//! ems_section: "04-configuration-orchestration"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "High-level orchestration kernel coordinating fleet campaigns."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fleet_common::{scale_duration, SharedClock, SystemClock};
use fleet_process::{cancellation, CancelHandle, CancelToken, Executor};
use fleet_store::StrategySpec;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::factory::RuntimeOperation;
use crate::{OrchestrationError, Result};

/// Concurrency policy for the per-runtime operations of one campaign.
pub trait ExecutionStrategy: Send + Sync {
    /// Start a batch and return its execution id. Returns immediately.
    fn execute(&self, operations: Vec<RuntimeOperation>, spec: &StrategySpec) -> Result<String>;

    /// Add operations to a running batch. Fails with
    /// [`OrchestrationError::ExecutionNotFound`] once the batch is closed.
    fn insert(
        &self,
        execution_id: &str,
        operations: Vec<RuntimeOperation>,
        spec: &StrategySpec,
    ) -> Result<()>;

    /// Stop a batch: queued operations are dropped, running ones finish
    /// their current call.
    fn cancel(&self, execution_id: &str);

    /// Divide every wait by `factor`. Tests only.
    fn speed_up(&self, factor: u32);
}

#[derive(Debug, Default)]
struct ExecutionState {
    outstanding: usize,
    closed: bool,
}

struct Execution {
    id: String,
    sender: mpsc::UnboundedSender<String>,
    receiver: AsyncMutex<mpsc::UnboundedReceiver<String>>,
    state: Mutex<ExecutionState>,
    cancel: CancelHandle,
}

impl Execution {
    fn close(&self) {
        self.state.lock().closed = true;
        self.cancel.cancel();
    }

    /// Record one operation as done. Returns true when it was the last one.
    fn complete_one(&self) -> bool {
        let mut state = self.state.lock();
        state.outstanding = state.outstanding.saturating_sub(1);
        if state.outstanding == 0 && !state.closed {
            state.closed = true;
            return true;
        }
        false
    }
}

type Executions = Arc<Mutex<HashMap<String, Arc<Execution>>>>;

struct Shared {
    executor: Arc<dyn Executor>,
    executions: Executions,
    clock: SharedClock,
    speed_factor: AtomicU32,
}

impl Shared {
    fn scaled(&self, wait: Duration) -> Duration {
        scale_duration(wait, self.speed_factor.load(Ordering::Relaxed))
    }

    fn finish(&self, execution: &Execution) {
        if execution.complete_one() {
            info!(execution_id = %execution.id, "execution finished");
            execution.cancel.cancel();
            self.executions.lock().remove(&execution.id);
        }
    }

    /// Queue `operation_id` after `wait`, unless the execution is canceled first.
    fn enqueue_after(&self, execution: &Arc<Execution>, operation_id: String, wait: Duration) {
        if wait.is_zero() {
            let _ = execution.sender.send(operation_id);
            return;
        }
        let sender = execution.sender.clone();
        let token = execution.cancel.token();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(wait) => {
                    let _ = sender.send(operation_id);
                }
            }
        });
    }

    fn schedule(&self, execution: &Arc<Execution>, operation: RuntimeOperation, spec: &StrategySpec) {
        let now = self.clock.now();
        let start = if spec.maintenance_window {
            operation.runtime.window_begin().or(spec.schedule_time)
        } else {
            spec.schedule_time
        };
        let wait = start
            .and_then(|start| (start - now).to_std().ok())
            .unwrap_or(Duration::ZERO);
        let wait = self.scaled(wait);
        debug!(
            execution_id = %execution.id,
            operation_id = %operation.operation.id,
            wait_ms = wait.as_millis() as u64,
            "operation scheduled"
        );
        self.enqueue_after(execution, operation.operation.id, wait);
    }

    async fn worker(self: Arc<Self>, execution: Arc<Execution>, stop: CancelToken) {
        loop {
            let next = tokio::select! {
                biased;
                _ = stop.cancelled() => None,
                id = async { execution.receiver.lock().await.recv().await } => id,
            };
            let Some(operation_id) = next else {
                break;
            };
            if stop.is_cancelled() {
                break;
            }
            match self.executor.execute(&operation_id).await {
                Ok(delay) if !delay.is_zero() => {
                    let delay = self.scaled(delay);
                    debug!(operation_id = %operation_id, delay_ms = delay.as_millis() as u64, "operation re-enqueued");
                    self.enqueue_after(&execution, operation_id, delay);
                }
                Ok(_) => {
                    debug!(operation_id = %operation_id, "operation processed");
                    self.finish(&execution);
                }
                Err(err) if err.is_not_found() => {
                    warn!(operation_id = %operation_id, error = %err, "operation vanished");
                    self.finish(&execution);
                }
                Err(err) => {
                    error!(operation_id = %operation_id, error = %err, "operation failed");
                    self.finish(&execution);
                }
            }
        }
    }
}

/// Runs every operation of a batch concurrently on a per-execution worker
/// pool. Operations start at their maintenance window when the strategy asks
/// for it, otherwise at the schedule time or immediately.
pub struct ParallelStrategy {
    shared: Arc<Shared>,
    default_workers: usize,
}

impl ParallelStrategy {
    /// Strategy driving `executor`; `default_workers` applies when the
    /// orchestration does not set a worker count.
    pub fn new(executor: Arc<dyn Executor>, default_workers: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                executor,
                executions: Arc::new(Mutex::new(HashMap::new())),
                clock: Arc::new(SystemClock),
                speed_factor: AtomicU32::new(1),
            }),
            default_workers: default_workers.max(1),
        }
    }

    /// Replace the clock used to compute start times.
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.clock = clock;
        }
        self
    }

    /// Number of executions still running.
    pub fn running_executions(&self) -> usize {
        self.shared.executions.lock().len()
    }

    fn check_runtimes(operations: &[RuntimeOperation]) -> Result<()> {
        match operations.iter().find(|op| op.runtime.instance_id.is_empty()) {
            Some(op) => Err(OrchestrationError::NoRuntime(op.operation.id.clone())),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for ParallelStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelStrategy")
            .field("default_workers", &self.default_workers)
            .field("running_executions", &self.running_executions())
            .finish_non_exhaustive()
    }
}

impl ExecutionStrategy for ParallelStrategy {
    fn execute(&self, operations: Vec<RuntimeOperation>, spec: &StrategySpec) -> Result<String> {
        Self::check_runtimes(&operations)?;
        let id = Uuid::new_v4().to_string();
        let (sender, receiver) = mpsc::unbounded_channel();
        let (cancel, token) = cancellation();
        let execution = Arc::new(Execution {
            id: id.clone(),
            sender,
            receiver: AsyncMutex::new(receiver),
            state: Mutex::new(ExecutionState {
                outstanding: operations.len(),
                closed: operations.is_empty(),
            }),
            cancel,
        });
        if operations.is_empty() {
            execution.cancel.cancel();
            debug!(execution_id = %id, "empty execution closed immediately");
            return Ok(id);
        }

        let workers = match spec.parallel.workers {
            0 => self.default_workers,
            n => n,
        };
        info!(execution_id = %id, operations = operations.len(), workers, "starting execution");
        self.shared.executions.lock().insert(id.clone(), execution.clone());
        for worker in 0..workers {
            let span = info_span!("execution_worker", execution_id = %id, worker);
            tokio::spawn(
                self.shared
                    .clone()
                    .worker(execution.clone(), token.clone())
                    .instrument(span),
            );
        }
        for operation in operations {
            self.shared.schedule(&execution, operation, spec);
        }
        Ok(id)
    }

    fn insert(
        &self,
        execution_id: &str,
        operations: Vec<RuntimeOperation>,
        spec: &StrategySpec,
    ) -> Result<()> {
        Self::check_runtimes(&operations)?;
        let execution = self
            .shared
            .executions
            .lock()
            .get(execution_id)
            .cloned()
            .ok_or_else(|| OrchestrationError::ExecutionNotFound(execution_id.to_owned()))?;
        {
            let mut state = execution.state.lock();
            if state.closed {
                return Err(OrchestrationError::ExecutionNotFound(execution_id.to_owned()));
            }
            state.outstanding += operations.len();
        }
        info!(execution_id, operations = operations.len(), "operations inserted");
        for operation in operations {
            self.shared.schedule(&execution, operation, spec);
        }
        Ok(())
    }

    fn cancel(&self, execution_id: &str) {
        if let Some(execution) = self.shared.executions.lock().remove(execution_id) {
            info!(execution_id, "canceling execution");
            execution.close();
        }
    }

    fn speed_up(&self, factor: u32) {
        self.shared.speed_factor.store(factor.max(1), Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use fleet_store::{MaintenanceWindow, Operation, OperationType, Runtime};
    use std::collections::HashMap as Map;

    #[derive(Default)]
    struct Recorder {
        delays: Mutex<Map<String, Vec<Duration>>>,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Executor for Recorder {
        async fn execute(&self, id: &str) -> fleet_process::Result<Duration> {
            self.calls.lock().push(id.to_owned());
            let next = self
                .delays
                .lock()
                .get_mut(id)
                .and_then(|script| (!script.is_empty()).then(|| script.remove(0)));
            Ok(next.unwrap_or(Duration::ZERO))
        }
    }

    fn runtime_operation(id: &str) -> RuntimeOperation {
        let runtime = Runtime {
            instance_id: format!("inst-{id}"),
            runtime_id: format!("rt-{id}"),
            ..Runtime::default()
        };
        RuntimeOperation {
            operation: Operation::new(id, runtime.instance_id.clone(), OperationType::UpgradeRuntime),
            runtime,
        }
    }

    async fn wait_until_idle(strategy: &ParallelStrategy) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while strategy.running_executions() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("execution drains");
    }

    #[tokio::test]
    async fn runs_every_operation_and_closes() {
        let recorder = Arc::new(Recorder::default());
        recorder
            .delays
            .lock()
            .insert("op-2".into(), vec![Duration::from_millis(10)]);
        let strategy = ParallelStrategy::new(recorder.clone(), 2);

        let ops = vec![runtime_operation("op-1"), runtime_operation("op-2")];
        let id = strategy.execute(ops, &StrategySpec::default()).unwrap();
        wait_until_idle(&strategy).await;

        let mut calls = recorder.calls.lock().clone();
        calls.sort();
        assert_eq!(calls, vec!["op-1", "op-2", "op-2"]);
        let err = strategy
            .insert(&id, vec![runtime_operation("op-3")], &StrategySpec::default())
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::ExecutionNotFound(_)));
    }

    #[tokio::test]
    async fn insert_extends_running_execution() {
        let recorder = Arc::new(Recorder::default());
        recorder
            .delays
            .lock()
            .insert("op-1".into(), vec![Duration::from_millis(50)]);
        let strategy = ParallelStrategy::new(recorder.clone(), 1);
        let spec = StrategySpec::default();

        let id = strategy.execute(vec![runtime_operation("op-1")], &spec).unwrap();
        strategy.insert(&id, vec![runtime_operation("op-2")], &spec).unwrap();
        wait_until_idle(&strategy).await;

        assert!(recorder.calls.lock().contains(&"op-2".to_owned()));
    }

    #[tokio::test]
    async fn maintenance_window_defers_start() {
        let recorder = Arc::new(Recorder::default());
        let strategy = ParallelStrategy::new(recorder.clone(), 1);
        let mut op = runtime_operation("op-1");
        let begin = Utc::now() + chrono::Duration::hours(1);
        op.runtime.maintenance_window = Some(MaintenanceWindow {
            begin,
            end: begin + chrono::Duration::hours(2),
            days: vec!["Mon".into()],
        });
        let spec = StrategySpec {
            maintenance_window: true,
            ..StrategySpec::default()
        };

        let id = strategy.execute(vec![op], &spec).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(recorder.calls.lock().is_empty());

        strategy.cancel(&id);
        assert_eq!(strategy.running_executions(), 0);
    }

    #[tokio::test]
    async fn speed_factor_shrinks_waits() {
        let recorder = Arc::new(Recorder::default());
        let strategy = ParallelStrategy::new(recorder.clone(), 1);
        strategy.speed_up(3_600_000);
        let spec = StrategySpec {
            schedule_time: Some(Utc::now() + chrono::Duration::hours(1)),
            ..StrategySpec::default()
        };

        strategy.execute(vec![runtime_operation("op-1")], &spec).unwrap();
        wait_until_idle(&strategy).await;
        assert_eq!(*recorder.calls.lock(), vec!["op-1"]);
    }

    #[tokio::test]
    async fn operations_without_runtime_are_rejected() {
        let strategy = ParallelStrategy::new(Arc::new(Recorder::default()), 1);
        let mut op = runtime_operation("op-1");
        op.runtime.instance_id.clear();
        let err = strategy.execute(vec![op], &StrategySpec::default()).unwrap_err();
        assert!(matches!(err, OrchestrationError::NoRuntime(_)));
    }
}
