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
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleet_common::{OperationsConfig, OrchestrationConfig, SharedClock, SystemClock};
use fleet_events::{EventBroker, OrchestrationStateChanged};
use fleet_process::{CancelToken, Executor, Poller, ProcessError};
use fleet_store::{
    Instances, NotificationState, OperationReader, OperationState, OperationStats,
    OperationWriter, Orchestration, OrchestrationState, OrchestrationType, Orchestrations,
    RetryOperationParameters, Storage, StrategySpec,
};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::factory::{OperationFactory, RuntimeOperation};
use crate::maintenance::{resolve_window, CompiledPolicy};
use crate::notification::{
    event_type_for, BundleBuilder, NotificationError, NotificationParams, NotificationTenant,
};
use crate::policy::PolicySource;
use crate::resolver::RuntimeResolver;
use crate::strategy::{ExecutionStrategy, ParallelStrategy};
use crate::{OrchestrationError, Result};

const FINISH_ATTEMPTS: usize = 3;
const NOTIFICATION_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Replace the `retrying` marker with `update`, or append `update`.
pub fn update_retrying_description(description: &str, update: &str) -> String {
    if description.contains("retrying") {
        description.replace("retrying", update)
    } else if description.is_empty() {
        update.to_owned()
    } else {
        format!("{description}, {update}")
    }
}

/// What became of a retry request made while the campaign ran.
enum RetryOutcome {
    Inserted,
    Rejected(Orchestration),
}

/// How a poll loop ended.
struct Settled {
    orchestration: Orchestration,
    stats: OperationStats,
    canceled: bool,
}

/// Drives one orchestration per [`Executor::execute`] call: resolve the
/// pass's operations, persist, notify, hand them to the execution strategy
/// and poll the store until every operation settled or a cancel completed.
///
/// Nothing is cached between calls. A restarted process re-enqueues the
/// orchestration id and the manager resumes from the stored operations.
pub struct OrchestrationManager {
    storage: Storage,
    resolver: Arc<dyn RuntimeResolver>,
    factory: Arc<dyn OperationFactory>,
    policy_source: Arc<dyn PolicySource>,
    bundle_builder: Arc<dyn BundleBuilder>,
    broker: Arc<EventBroker>,
    strategies: HashMap<OrchestrationType, Arc<dyn ExecutionStrategy>>,
    clock: SharedClock,
    stop: CancelToken,
    polling_interval: Duration,
    not_found_backoff: Duration,
    temporary_backoff: Duration,
    default_runtime_version: String,
    default_kubernetes_version: String,
    speed_factor: u32,
    parallel_workers: usize,
}

impl OrchestrationManager {
    /// Manager without executors; register one per campaign kind with
    /// [`OrchestrationManager::with_executor`].
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        storage: Storage,
        resolver: Arc<dyn RuntimeResolver>,
        factory: Arc<dyn OperationFactory>,
        policy_source: Arc<dyn PolicySource>,
        bundle_builder: Arc<dyn BundleBuilder>,
        broker: Arc<EventBroker>,
        config: &OrchestrationConfig,
        operations: &OperationsConfig,
    ) -> Self {
        Self {
            storage,
            resolver,
            factory,
            policy_source,
            bundle_builder,
            broker,
            strategies: HashMap::new(),
            clock: Arc::new(SystemClock),
            stop: CancelToken::never(),
            polling_interval: config.polling_interval,
            not_found_backoff: config.not_found_backoff,
            temporary_backoff: operations.temporary_backoff,
            default_runtime_version: config.default_runtime_version.clone(),
            default_kubernetes_version: config.default_kubernetes_version.clone(),
            speed_factor: config.speed_factor,
            parallel_workers: config.parallel_workers,
        }
    }

    /// Replace the wall-clock source. Call before registering executors.
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Token that interrupts the poll loop on shutdown.
    pub fn with_stop(mut self, stop: CancelToken) -> Self {
        self.stop = stop;
        self
    }

    /// Run `orchestration_type` campaigns on a [`ParallelStrategy`] over
    /// `executor`.
    pub fn with_executor(
        self,
        orchestration_type: OrchestrationType,
        executor: Arc<dyn Executor>,
    ) -> Self {
        let strategy =
            ParallelStrategy::new(executor, self.parallel_workers).with_clock(self.clock.clone());
        strategy.speed_up(self.speed_factor);
        self.with_strategy(orchestration_type, Arc::new(strategy))
    }

    /// Run `orchestration_type` campaigns on a custom strategy.
    pub fn with_strategy(
        mut self,
        orchestration_type: OrchestrationType,
        strategy: Arc<dyn ExecutionStrategy>,
    ) -> Self {
        self.strategies.insert(orchestration_type, strategy);
        self
    }

    fn strategy_for(
        &self,
        orchestration: &Orchestration,
    ) -> Result<Arc<dyn ExecutionStrategy>> {
        self.strategies
            .get(&orchestration.orchestration_type)
            .cloned()
            .ok_or_else(|| {
                OrchestrationError::fatal(format!(
                    "no executor registered for {} orchestrations",
                    orchestration.orchestration_type
                ))
            })
    }

    /// Load and compile the policy once per pass.
    async fn load_policy(&self) -> CompiledPolicy {
        match self.policy_source.load().await.and_then(|policy| policy.compile()) {
            Ok(policy) => policy,
            Err(err) => {
                warn!(error = %err, "maintenance policy unavailable, continuing without windows");
                CompiledPolicy::default()
            }
        }
    }

    /// Set (or clear) the maintenance window of each operation and persist
    /// the runtime snapshot.
    async fn assign_windows(
        &self,
        operations: &mut [RuntimeOperation],
        policy: Option<&CompiledPolicy>,
        spec: &StrategySpec,
    ) -> Result<()> {
        let now = self.clock.now();
        for ro in operations.iter_mut() {
            ro.runtime.maintenance_window = match policy {
                Some(policy) if spec.maintenance_window => {
                    resolve_window(&ro.runtime, policy, spec.schedule_time, now)
                }
                _ => None,
            };
            ro.operation.runtime = Some(ro.runtime.clone());
            ro.operation = self
                .storage
                .operations()
                .update_operation(ro.operation.clone())
                .await?;
        }
        Ok(())
    }

    /// Create one operation per resolved runtime.
    async fn schedule_operations(
        &self,
        orchestration: &mut Orchestration,
        policy: &CompiledPolicy,
    ) -> Result<Vec<RuntimeOperation>> {
        let params = &mut orchestration.parameters;
        if params.runtime_version.is_none() {
            params.runtime_version = Some(self.default_runtime_version.clone());
        }
        if params.kubernetes_version.is_none() {
            params.kubernetes_version = Some(self.default_kubernetes_version.clone());
        }

        let runtimes = self.resolver.resolve(&orchestration.parameters.targets).await?;
        let spec = orchestration.parameters.strategy.clone();
        let now = self.clock.now();
        let mut operations = Vec::with_capacity(runtimes.len());
        for mut runtime in runtimes {
            let instance = match self.storage.instances().get_instance(&runtime.instance_id).await {
                Ok(instance) => instance,
                Err(err) if err.is_not_found() => {
                    warn!(instance_id = %runtime.instance_id, "instance removed since resolution, skipping");
                    continue;
                }
                Err(err) => return Err(err.into()),
            };
            if spec.maintenance_window {
                runtime.maintenance_window = resolve_window(&runtime, policy, spec.schedule_time, now);
            }
            let operation = self
                .factory
                .new_operation(orchestration, runtime, &instance, OperationState::Pending)
                .await?;
            operations.push(operation);
        }

        orchestration.description = format!("Scheduled {} operations", operations.len());
        orchestration.state = if operations.is_empty() {
            OrchestrationState::Succeeded
        } else {
            OrchestrationState::InProgress
        };
        Ok(operations)
    }

    /// Reset the requested operations of a retried campaign.
    async fn retry_operations(
        &self,
        orchestration: &mut Orchestration,
        policy: &CompiledPolicy,
    ) -> Result<Vec<RuntimeOperation>> {
        let retry = std::mem::take(&mut orchestration.parameters.retry_operation);
        let mut operations = self.factory.retry_operations(&retry.retry_operations).await?;
        let policy = (!retry.immediate).then_some(policy);
        self.assign_windows(&mut operations, policy, &orchestration.parameters.strategy)
            .await?;

        orchestration.description = update_retrying_description(
            &orchestration.description,
            &format!("retried {} operations", operations.len()),
        );
        orchestration.state = if operations.is_empty() {
            OrchestrationState::Succeeded
        } else {
            OrchestrationState::InProgress
        };
        Ok(operations)
    }

    async fn resolve_operations(
        &self,
        orchestration: &mut Orchestration,
        policy: &CompiledPolicy,
    ) -> Result<Vec<RuntimeOperation>> {
        match orchestration.state {
            OrchestrationState::Pending => self.schedule_operations(orchestration, policy).await,
            OrchestrationState::Retrying => self.retry_operations(orchestration, policy).await,
            _ => self.factory.resume_operations(&orchestration.id).await,
        }
    }

    async fn persist(&self, orchestration: Orchestration, old_state: OrchestrationState) -> Result<Orchestration> {
        let updated = self
            .storage
            .orchestrations()
            .update_orchestration(orchestration)
            .await?;
        self.broker
            .publish_orchestration_state(OrchestrationStateChanged::new(&updated, old_state));
        Ok(updated)
    }

    /// Send the create notification once. The orchestration is persisted
    /// right after delivery so a restart does not announce twice.
    async fn send_notification_create(
        &self,
        mut orchestration: Orchestration,
        operations: &[RuntimeOperation],
    ) -> std::result::Result<Orchestration, NotificationError> {
        if self.bundle_builder.disabled_check()
            || orchestration.state != OrchestrationState::InProgress
            || orchestration.parameters.notification_state >= Some(NotificationState::Created)
        {
            return Ok(orchestration);
        }
        orchestration.advance_notification(NotificationState::Pending);

        let now = self.clock.now().format(NOTIFICATION_DATE_FORMAT).to_string();
        let tenants = operations
            .iter()
            .map(|ro| match &ro.runtime.maintenance_window {
                Some(window) => NotificationTenant {
                    instance_id: ro.runtime.instance_id.clone(),
                    start_date: window.begin.format(NOTIFICATION_DATE_FORMAT).to_string(),
                    end_date: window.end.format(NOTIFICATION_DATE_FORMAT).to_string(),
                },
                None => NotificationTenant {
                    instance_id: ro.runtime.instance_id.clone(),
                    start_date: now.clone(),
                    end_date: String::new(),
                },
            })
            .collect();
        let params = NotificationParams {
            orchestration_id: orchestration.id.clone(),
            event_type: event_type_for(orchestration.orchestration_type).to_owned(),
            tenants,
        };
        let bundle = self.bundle_builder.new_bundle(&orchestration.id, params)?;
        bundle.create_notification_event().await?;
        info!(tenants = operations.len(), "create notification sent");
        orchestration.advance_notification(NotificationState::Created);

        for attempt in 1..=FINISH_ATTEMPTS {
            match self.storage.orchestrations().update_orchestration(orchestration.clone()).await {
                Ok(updated) => return Ok(updated),
                Err(err) if err.is_conflict() && attempt < FINISH_ATTEMPTS => {
                    match self.storage.orchestrations().get_orchestration(&orchestration.id).await {
                        Ok(reloaded) => {
                            orchestration = reloaded;
                            orchestration.advance_notification(NotificationState::Created);
                        }
                        Err(err) => {
                            warn!(error = %err, "unable to reload orchestration");
                            break;
                        }
                    }
                }
                Err(err) => {
                    warn!(error = %err, "unable to persist notification state");
                    break;
                }
            }
        }
        // delivered but not recorded; the next pass may announce again
        Ok(orchestration)
    }

    async fn send_notification_cancel(&self, orchestration: &mut Orchestration) {
        if orchestration.parameters.notification_state != Some(NotificationState::Created) {
            return;
        }
        let params = NotificationParams {
            orchestration_id: orchestration.id.clone(),
            event_type: event_type_for(orchestration.orchestration_type).to_owned(),
            tenants: Vec::new(),
        };
        let outcome = match self.bundle_builder.new_bundle(&orchestration.id, params) {
            Ok(bundle) => bundle.cancel_notification_event().await,
            Err(err) => Err(err),
        };
        match outcome {
            Ok(()) => {
                info!("cancel notification sent");
                orchestration.advance_notification(NotificationState::Cancelled);
            }
            Err(err) => warn!(error = %err, "unable to send cancel notification"),
        }
    }

    /// Retry operations requested while the campaign is running. Inserts
    /// into the running execution, or starts another one if it closed.
    async fn insert_retries(
        &self,
        mut orchestration: Orchestration,
        policy: &CompiledPolicy,
        strategy: &Arc<dyn ExecutionStrategy>,
        executions: &mut Vec<String>,
    ) -> Result<RetryOutcome> {
        let retry = orchestration.parameters.retry_operation.clone();
        let spec = orchestration.parameters.strategy.clone();
        let mut operations = match self.factory.retry_operations(&retry.retry_operations).await {
            Ok(operations) => operations,
            Err(err) if !err.is_retryable() => {
                return self
                    .reject_retries(orchestration, &err)
                    .await
                    .map(RetryOutcome::Rejected);
            }
            Err(err) => return Err(err),
        };
        let window_policy = (!retry.immediate).then_some(policy);
        self.assign_windows(&mut operations, window_policy, &spec).await?;
        let count = operations.len();

        let current = executions.last().cloned().unwrap_or_default();
        match strategy.insert(&current, operations.clone(), &spec) {
            Ok(()) => {}
            Err(OrchestrationError::ExecutionNotFound(_)) => {
                let execution_id = strategy.execute(operations, &spec)?;
                info!(execution_id = %execution_id, "started another execution for retried operations");
                executions.push(execution_id);
            }
            Err(err) => return Err(err),
        }

        orchestration.description = update_retrying_description(
            &orchestration.description,
            &format!("retried {count} operations"),
        );
        orchestration.parameters.retry_operation = RetryOperationParameters::default();
        self.storage
            .orchestrations()
            .update_orchestration(orchestration)
            .await?;
        info!(count, "retried operations inserted");
        Ok(RetryOutcome::Inserted)
    }

    /// Drop a retry request the factory refused. No operation was touched.
    async fn reject_retries(
        &self,
        mut orchestration: Orchestration,
        cause: &OrchestrationError,
    ) -> Result<Orchestration> {
        warn!(error = %cause, "retry request rejected");
        orchestration.description = update_retrying_description(
            &orchestration.description,
            &format!("retry rejected: {cause}"),
        );
        orchestration.parameters.retry_operation = RetryOperationParameters::default();
        Ok(self
            .storage
            .orchestrations()
            .update_orchestration(orchestration)
            .await?)
    }

    /// Poll until the campaign settled. `None` means the manager is stopping.
    async fn wait_for_completion(
        &self,
        orchestration_id: &str,
        policy: &CompiledPolicy,
        strategy: &Arc<dyn ExecutionStrategy>,
        executions: &mut Vec<String>,
    ) -> Option<Settled> {
        let mut poller = Poller::new(self.polling_interval, self.stop.clone());
        while poller.tick().await {
            let orchestration = match self.storage.orchestrations().get_orchestration(orchestration_id).await {
                Ok(orchestration) => orchestration,
                Err(err) => {
                    warn!(error = %err, "unable to reload orchestration");
                    continue;
                }
            };
            let stats = match self
                .storage
                .operations()
                .get_operation_stats_for_orchestration(orchestration_id)
                .await
            {
                Ok(stats) => stats,
                Err(err) => {
                    warn!(error = %err, "unable to read operation stats");
                    continue;
                }
            };

            if orchestration.state == OrchestrationState::Canceling {
                if stats.count(OperationState::InProgress) == 0 {
                    return Some(Settled {
                        orchestration,
                        stats,
                        canceled: true,
                    });
                }
                if let Err(err) = self.factory.cancel_operations(orchestration_id).await {
                    warn!(error = %err, "unable to cancel pending operations");
                }
                debug!(in_progress = stats.count(OperationState::InProgress), "waiting for in-progress operations");
                continue;
            }

            let orchestration = if orchestration.parameters.retry_operation.retry_operations.is_empty() {
                orchestration
            } else {
                match self
                    .insert_retries(orchestration, policy, strategy, executions)
                    .await
                {
                    // stats predate the reset operations
                    Ok(RetryOutcome::Inserted) => continue,
                    Ok(RetryOutcome::Rejected(orchestration)) => orchestration,
                    Err(err) => {
                        warn!(error = %err, "unable to retry operations, trying again next tick");
                        continue;
                    }
                }
            };

            if stats.not_finished() == 0 {
                return Some(Settled {
                    orchestration,
                    stats,
                    canceled: false,
                });
            }
            debug!(not_finished = stats.not_finished(), "orchestration still running");
        }
        None
    }

    /// Record the final state. Reloads on conflict.
    async fn finish(
        &self,
        settled: Settled,
        strategy: &Arc<dyn ExecutionStrategy>,
        executions: &[String],
    ) -> Result<()> {
        let Settled {
            mut orchestration,
            stats,
            canceled,
        } = settled;

        for execution_id in executions {
            strategy.cancel(execution_id);
        }
        let target = if canceled {
            self.factory.cancel_operations(&orchestration.id).await?;
            self.send_notification_cancel(&mut orchestration).await;
            OrchestrationState::Canceled
        } else if stats.count(OperationState::Failed) > 0 {
            OrchestrationState::Failed
        } else {
            OrchestrationState::Succeeded
        };

        for attempt in 1..=FINISH_ATTEMPTS {
            let old_state = orchestration.state;
            orchestration.state = target;
            match self.persist(orchestration.clone(), old_state).await {
                Ok(updated) => {
                    info!(state = %updated.state, succeeded = stats.count(OperationState::Succeeded), failed = stats.count(OperationState::Failed), "orchestration finished");
                    return Ok(());
                }
                Err(OrchestrationError::Store(err)) if err.is_conflict() && attempt < FINISH_ATTEMPTS => {
                    debug!(attempt, "conflict while finishing orchestration, reloading");
                    let notification = orchestration.parameters.notification_state;
                    orchestration = self
                        .storage
                        .orchestrations()
                        .get_orchestration(&orchestration.id)
                        .await?;
                    if let Some(state) = notification {
                        orchestration.advance_notification(state);
                    }
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Mark the stored orchestration failed.
    async fn fail(&self, orchestration_id: &str, cause: &ProcessError) {
        for attempt in 1..=FINISH_ATTEMPTS {
            let mut orchestration = match self.storage.orchestrations().get_orchestration(orchestration_id).await {
                Ok(orchestration) => orchestration,
                Err(err) => {
                    error!(error = %err, "unable to load orchestration to mark it failed");
                    return;
                }
            };
            if orchestration.is_finished() {
                return;
            }
            let old_state = orchestration.state;
            orchestration.state = OrchestrationState::Failed;
            orchestration.description = cause.to_string();
            match self.persist(orchestration, old_state).await {
                Ok(_) => return,
                Err(OrchestrationError::Store(err)) if err.is_conflict() && attempt < FINISH_ATTEMPTS => {
                    debug!(attempt, "conflict while marking orchestration failed, reloading");
                }
                Err(err) => {
                    error!(error = %err, "unable to mark orchestration failed");
                    return;
                }
            }
        }
    }

    /// Classify a pass error: retryable ones back off, the rest fail the
    /// orchestration.
    async fn abort(&self, orchestration_id: &str, err: OrchestrationError) -> fleet_process::Result<Duration> {
        let err = ProcessError::from(err);
        if err.is_retryable() {
            warn!(error = %err, backoff_ms = self.polling_interval.as_millis() as u64, "orchestration pass interrupted, backing off");
            return Ok(self.polling_interval);
        }
        error!(error = %err, "orchestration failed");
        self.fail(orchestration_id, &err).await;
        Err(err)
    }

    async fn process(&self, mut orchestration: Orchestration) -> fleet_process::Result<Duration> {
        let id = orchestration.id.clone();
        if orchestration.state == OrchestrationState::Retrying
            && orchestration.parameters.retry_operation.retry_operations.is_empty()
        {
            return Err(ProcessError::fatal(format!(
                "orchestration {id} is retrying without operations to retry"
            )));
        }

        let policy = self.load_policy().await;
        let old_state = orchestration.state;
        let operations = match self.resolve_operations(&mut orchestration, &policy).await {
            Ok(operations) => operations,
            Err(err) => return self.abort(&id, err).await,
        };

        let orchestration = match self.persist(orchestration, old_state).await {
            Ok(orchestration) => orchestration,
            Err(err) => {
                warn!(error = %err, "unable to persist orchestration, backing off");
                return Ok(self.polling_interval);
            }
        };
        if orchestration.is_finished() {
            info!(state = %orchestration.state, "orchestration finished without operations");
            return Ok(Duration::ZERO);
        }

        let strategy = match self.strategy_for(&orchestration) {
            Ok(strategy) => strategy,
            Err(err) => return self.abort(&id, err).await,
        };
        let orchestration = match self.send_notification_create(orchestration, &operations).await {
            Ok(orchestration) => orchestration,
            Err(err) if err.is_temporary() => {
                warn!(error = %err, "notification backend unavailable, backing off");
                return Ok(self.temporary_backoff);
            }
            Err(err) => return self.abort(&id, OrchestrationError::fatal(err.to_string())).await,
        };

        let to_run = if orchestration.state == OrchestrationState::Canceling {
            operations
                .into_iter()
                .filter(|ro| ro.operation.state == OperationState::InProgress)
                .collect()
        } else {
            operations
        };
        info!(operations = to_run.len(), "starting execution");
        let mut executions = match strategy.execute(to_run, &orchestration.parameters.strategy) {
            Ok(execution_id) => vec![execution_id],
            Err(err) => return self.abort(&id, err).await,
        };

        let Some(settled) = self
            .wait_for_completion(&id, &policy, &strategy, &mut executions)
            .await
        else {
            info!("manager stopping, leaving orchestration for the next start");
            for execution_id in &executions {
                strategy.cancel(execution_id);
            }
            return Ok(Duration::ZERO);
        };

        match self.finish(settled, &strategy, &executions).await {
            Ok(()) => Ok(Duration::ZERO),
            Err(err) => self.abort(&id, err).await,
        }
    }
}

impl std::fmt::Debug for OrchestrationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestrationManager")
            .field("kinds", &self.strategies.keys().collect::<Vec<_>>())
            .field("polling_interval", &self.polling_interval)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Executor for OrchestrationManager {
    async fn execute(&self, orchestration_id: &str) -> fleet_process::Result<Duration> {
        let span = info_span!("orchestration", orchestration_id = %orchestration_id);
        async {
            let orchestration = match self
                .storage
                .orchestrations()
                .get_orchestration(orchestration_id)
                .await
            {
                Ok(orchestration) => orchestration,
                Err(err) if err.is_not_found() => {
                    warn!(backoff_ms = self.not_found_backoff.as_millis() as u64, "orchestration not found, backing off");
                    return Ok(self.not_found_backoff);
                }
                Err(err) => {
                    warn!(error = %err, "unable to load orchestration, backing off");
                    return Ok(self.polling_interval);
                }
            };
            if orchestration.is_finished() {
                debug!(state = %orchestration.state, "orchestration already finished");
                return Ok(Duration::ZERO);
            }
            self.process(orchestration).await
        }
        .instrument(span)
        .await
    }
}
