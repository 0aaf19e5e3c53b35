//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Primary engine wiring and lifecycle management."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use fleet_common::{AppConfig, SharedClock, SystemClock};
use fleet_events::EventBroker;
use fleet_metrics::{new_registry, spawn_http_server, EngineMetrics, MetricsServer, SharedRegistry};
use fleet_orchestration::{
    is_retryable, BundleBuilder, DisabledBundleBuilder, InstanceResolver, JsonFilePolicySource,
    OrchestrationManager, PolicySource, RuntimeResolver, StaticPolicySource,
    StoreOperationFactory,
};
use fleet_process::{cancellation, CancelHandle, Executor, Queue, QueueHandle, StagedManager};
use fleet_store::{
    Operation, OperationReader, OperationType, OperationWriter, Orchestration, OrchestrationState,
    OrchestrationType, Orchestrations, RetryOperationParameters, Storage,
};
use indexmap::IndexMap;
use tracing::{info, warn};

use crate::reprocess::{operations_to_resume, orchestrations_to_resume, QUEUED_OPERATION_TYPES};

const ALL_OPERATION_TYPES: [OperationType; 5] = [
    OperationType::Provision,
    OperationType::Deprovision,
    OperationType::Update,
    OperationType::UpgradeRuntime,
    OperationType::UpgradeCluster,
];

const ORCHESTRATION_TYPES: [OrchestrationType; 2] =
    [OrchestrationType::UpgradeRuntime, OrchestrationType::UpgradeCluster];

const STATE_UPDATE_ATTEMPTS: usize = 3;

fn ensure_retryable_state(orchestration: &Orchestration) -> Result<()> {
    match orchestration.state {
        OrchestrationState::Failed | OrchestrationState::Retrying | OrchestrationState::InProgress => Ok(()),
        other => bail!("orchestration {} cannot be retried in state {other}", orchestration.id),
    }
}

/// Engine under construction. Register steps on [`FleetEngine::pipeline`],
/// then [`FleetEngine::start`].
pub struct FleetEngine {
    config: Arc<AppConfig>,
    storage: Storage,
    broker: Arc<EventBroker>,
    clock: SharedClock,
    pipelines: IndexMap<OperationType, StagedManager>,
    resolver: Option<Arc<dyn RuntimeResolver>>,
    policy_source: Option<Arc<dyn PolicySource>>,
    bundle_builder: Arc<dyn BundleBuilder>,
    metrics_registry: Option<SharedRegistry>,
}

impl FleetEngine {
    pub fn new(config: AppConfig, storage: Storage) -> Self {
        let broker = EventBroker::shared();
        let pipelines = ALL_OPERATION_TYPES
            .into_iter()
            .map(|operation_type| {
                let manager = StagedManager::new(
                    operation_type,
                    storage.operations().clone(),
                    broker.clone(),
                    &config.operations,
                );
                (operation_type, manager)
            })
            .collect();
        Self {
            config: Arc::new(config),
            storage,
            broker,
            clock: Arc::new(SystemClock),
            pipelines,
            resolver: None,
            policy_source: None,
            bundle_builder: Arc::new(DisabledBundleBuilder),
            metrics_registry: None,
        }
    }

    /// Replace the wall-clock source of every pipeline and the orchestration
    /// manager.
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.pipelines = self
            .pipelines
            .into_iter()
            .map(|(operation_type, manager)| (operation_type, manager.with_clock(clock.clone())))
            .collect();
        self.clock = clock;
        self
    }

    /// Target resolution; defaults to an [`InstanceResolver`] over the store.
    pub fn with_resolver(mut self, resolver: Arc<dyn RuntimeResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Maintenance policy; defaults to the configured file, else no rules.
    pub fn with_policy_source(mut self, source: Arc<dyn PolicySource>) -> Self {
        self.policy_source = Some(source);
        self
    }

    /// Customer notifications; disabled unless set.
    pub fn with_bundle_builder(mut self, builder: Arc<dyn BundleBuilder>) -> Self {
        self.bundle_builder = builder;
        self
    }

    /// Record engine metrics into `registry` even when the exporter is off.
    pub fn with_metrics_registry(mut self, registry: SharedRegistry) -> Self {
        self.metrics_registry = Some(registry);
        self
    }

    pub fn broker(&self) -> Arc<EventBroker> {
        self.broker.clone()
    }

    /// Pipeline of `operation_type`, for stage and step registration.
    pub fn pipeline(&mut self, operation_type: OperationType) -> &mut StagedManager {
        self.pipelines.entry(operation_type).or_insert_with(|| {
            StagedManager::new(
                operation_type,
                self.storage.operations().clone(),
                self.broker.clone(),
                &self.config.operations,
            )
        })
    }

    /// Start every queue, resume unfinished work and return a handle.
    pub async fn start(self) -> Result<EngineHandle> {
        self.config.validate().context("invalid engine configuration")?;
        let (stop, stop_token) = cancellation();
        let speed_factor = self.config.orchestration.speed_factor;

        let metrics_registry = match (&self.metrics_registry, self.config.metrics.enabled) {
            (Some(registry), _) => Some(registry.clone()),
            (None, true) => Some(new_registry()),
            (None, false) => None,
        };
        if let Some(registry) = &metrics_registry {
            let metrics = Arc::new(EngineMetrics::new(registry.clone())?);
            metrics.attach(&self.broker)?;
        }
        let metrics_server = match (&metrics_registry, self.config.metrics.enabled) {
            (Some(registry), true) => Some(
                spawn_http_server(registry.clone(), self.config.metrics.listen)
                    .context("failed to start metrics exporter")?,
            ),
            _ => None,
        };

        let executors: IndexMap<OperationType, Arc<StagedManager>> = self
            .pipelines
            .into_iter()
            .map(|(operation_type, manager)| {
                if manager.stage_names().is_empty() {
                    warn!(%operation_type, "pipeline has no stages; its operations succeed immediately");
                }
                (operation_type, Arc::new(manager))
            })
            .collect();
        let executor_for = |operation_type: OperationType| -> Result<Arc<dyn Executor>> {
            executors
                .get(&operation_type)
                .map(|manager| manager.clone() as Arc<dyn Executor>)
                .ok_or_else(|| anyhow!("no pipeline for {operation_type} operations"))
        };

        let queues = &self.config.queues;
        let mut operation_queues = IndexMap::new();
        for operation_type in QUEUED_OPERATION_TYPES {
            let workers = match operation_type {
                OperationType::Provision => queues.provisioning_workers,
                OperationType::Deprovision => queues.deprovisioning_workers,
                _ => queues.update_workers,
            };
            let queue = Queue::with_speed_factor(
                operation_type.to_string(),
                executor_for(operation_type)?,
                speed_factor,
            );
            let handle = queue.run(stop_token.clone(), workers);
            operation_queues.insert(operation_type, RunningQueue { queue, handle });
        }

        let resolver: Arc<dyn RuntimeResolver> = match self.resolver {
            Some(resolver) => resolver,
            None => Arc::new(InstanceResolver::new(self.storage.instances().clone())),
        };
        let policy_source: Arc<dyn PolicySource> = match (self.policy_source, &self.config.orchestration.maintenance_policy_path) {
            (Some(source), _) => source,
            (None, Some(path)) => Arc::new(JsonFilePolicySource::new(path.clone())),
            (None, None) => Arc::new(StaticPolicySource::default()),
        };
        let factory = Arc::new(
            StoreOperationFactory::new(self.storage.operations().clone())
                .with_clock(self.clock.clone()),
        );
        let mut manager = OrchestrationManager::new(
            self.storage.clone(),
            resolver,
            factory,
            policy_source,
            self.bundle_builder,
            self.broker.clone(),
            &self.config.orchestration,
            &self.config.operations,
        )
        .with_clock(self.clock.clone())
        .with_stop(stop_token.clone());
        for orchestration_type in ORCHESTRATION_TYPES {
            manager = manager.with_executor(
                orchestration_type,
                executor_for(orchestration_type.operation_type())?,
            );
        }
        let manager: Arc<dyn Executor> = Arc::new(manager);

        let mut orchestration_queues = IndexMap::new();
        for orchestration_type in ORCHESTRATION_TYPES {
            let queue = Queue::with_speed_factor(
                format!("{orchestration_type}_orchestration"),
                manager.clone(),
                speed_factor,
            );
            let handle = queue.run(stop_token.clone(), queues.orchestration_workers);
            orchestration_queues.insert(orchestration_type, RunningQueue { queue, handle });
        }

        for (operation_type, running) in &operation_queues {
            for id in operations_to_resume(self.storage.operations(), *operation_type).await? {
                running.queue.add(id);
            }
        }
        for (orchestration_type, running) in &orchestration_queues {
            for id in orchestrations_to_resume(&self.storage, *orchestration_type).await? {
                running.queue.add(id);
            }
        }

        info!(
            operation_queues = operation_queues.len(),
            orchestration_queues = orchestration_queues.len(),
            metrics = metrics_server.is_some(),
            "engine started"
        );

        Ok(EngineHandle {
            config: self.config,
            storage: self.storage,
            broker: self.broker,
            stop,
            operation_queues,
            orchestration_queues,
            metrics_registry,
            metrics_server,
        })
    }
}

impl std::fmt::Debug for FleetEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FleetEngine")
            .field("pipelines", &self.pipelines.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

struct RunningQueue {
    queue: Arc<Queue>,
    handle: QueueHandle,
}

/// Running engine.
pub struct EngineHandle {
    config: Arc<AppConfig>,
    storage: Storage,
    broker: Arc<EventBroker>,
    stop: CancelHandle,
    operation_queues: IndexMap<OperationType, RunningQueue>,
    orchestration_queues: IndexMap<OrchestrationType, RunningQueue>,
    metrics_registry: Option<SharedRegistry>,
    metrics_server: Option<MetricsServer>,
}

impl EngineHandle {
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn broker(&self) -> Arc<EventBroker> {
        self.broker.clone()
    }

    pub fn metrics(&self) -> Option<SharedRegistry> {
        self.metrics_registry.clone()
    }

    /// Address of the `/metrics` exporter when enabled.
    pub fn metrics_addr(&self) -> Option<std::net::SocketAddr> {
        self.metrics_server.as_ref().map(MetricsServer::addr)
    }

    /// Persist a new operation and hand it to its queue. Upgrade operations
    /// are created by orchestrations and rejected here.
    pub async fn submit_operation(&self, operation: Operation) -> Result<Operation> {
        let running = self.operation_queue(operation.operation_type)?;
        let operation = self
            .storage
            .operations()
            .insert_operation(operation)
            .await
            .context("failed to store operation")?;
        running.queue.add(operation.id.clone());
        info!(operation_id = %operation.id, operation_type = %operation.operation_type, "operation submitted");
        Ok(operation)
    }

    /// Enqueue an already stored operation again.
    pub fn enqueue_operation(&self, operation_type: OperationType, id: &str) -> Result<()> {
        self.operation_queue(operation_type)?.queue.add(id);
        Ok(())
    }

    /// Persist a new orchestration and hand it to its queue.
    pub async fn submit_orchestration(&self, orchestration: Orchestration) -> Result<Orchestration> {
        let running = self
            .orchestration_queues
            .get(&orchestration.orchestration_type)
            .ok_or_else(|| anyhow!("no queue for {} orchestrations", orchestration.orchestration_type))?;
        let orchestration = self
            .storage
            .orchestrations()
            .insert_orchestration(orchestration)
            .await
            .context("failed to store orchestration")?;
        running.queue.add(orchestration.id.clone());
        info!(orchestration_id = %orchestration.id, orchestration_type = %orchestration.orchestration_type, "orchestration submitted");
        Ok(orchestration)
    }

    /// Ask a running campaign to stop. The manager observes the request on
    /// its next poll; finished campaigns are left untouched.
    pub async fn cancel_orchestration(&self, id: &str) -> Result<Orchestration> {
        self.update_orchestration(id, |orchestration| {
            if orchestration.is_finished() || orchestration.state == OrchestrationState::Canceling {
                return Ok(false);
            }
            orchestration.state = OrchestrationState::Canceling;
            Ok(true)
        })
        .await
    }

    /// Run the given operations of a campaign again. A failed campaign is
    /// reopened as Retrying; a running one picks the request up on its next
    /// poll, merged with any request still waiting there. Every id must name
    /// a retryable operation of the campaign.
    pub async fn retry_orchestration(
        &self,
        id: &str,
        operation_ids: Vec<String>,
        immediate: bool,
    ) -> Result<Orchestration> {
        let current = self
            .storage
            .orchestrations()
            .get_orchestration(id)
            .await
            .with_context(|| format!("failed to load orchestration {id}"))?;
        ensure_retryable_state(&current)?;
        self.check_retry_targets(id, &operation_ids).await?;

        let mut reopened = false;
        let updated = self
            .update_orchestration(id, |orchestration| {
                ensure_retryable_state(orchestration)?;
                reopened = orchestration.state == OrchestrationState::Failed;
                if reopened {
                    orchestration.state = OrchestrationState::Retrying;
                }
                if !orchestration.description.contains("retrying") {
                    orchestration.description = if orchestration.description.is_empty() {
                        "retrying".to_owned()
                    } else {
                        format!("{}, retrying", orchestration.description)
                    };
                }
                let pending = &mut orchestration.parameters.retry_operation;
                if pending.retry_operations.is_empty() {
                    *pending = RetryOperationParameters {
                        immediate,
                        retry_operations: Vec::new(),
                    };
                } else {
                    // windows apply unless every merged request skipped them
                    pending.immediate &= immediate;
                }
                for operation_id in &operation_ids {
                    if !pending.retry_operations.contains(operation_id) {
                        pending.retry_operations.push(operation_id.clone());
                    }
                }
                Ok(true)
            })
            .await?;
        if reopened {
            if let Some(running) = self.orchestration_queues.get(&updated.orchestration_type) {
                running.queue.add(updated.id.clone());
            }
        }
        Ok(updated)
    }

    async fn check_retry_targets(&self, orchestration_id: &str, operation_ids: &[String]) -> Result<()> {
        if operation_ids.is_empty() {
            bail!("orchestration {orchestration_id} retry names no operations");
        }
        for operation_id in operation_ids {
            let operation = self
                .storage
                .operations()
                .get_operation(operation_id)
                .await
                .with_context(|| format!("operation {operation_id} cannot be retried"))?;
            if operation.orchestration_id.as_deref() != Some(orchestration_id) {
                bail!("operation {operation_id} does not belong to orchestration {orchestration_id}");
            }
            if !is_retryable(operation.state) {
                bail!("operation {operation_id} cannot be retried from state {}", operation.state);
            }
        }
        Ok(())
    }

    /// Load, mutate and write back with reload on version conflicts. The
    /// closure returns false to skip the write.
    async fn update_orchestration<F>(&self, id: &str, mut change: F) -> Result<Orchestration>
    where
        F: FnMut(&mut Orchestration) -> Result<bool>,
    {
        let store = self.storage.orchestrations();
        for attempt in 1..=STATE_UPDATE_ATTEMPTS {
            let mut orchestration = store
                .get_orchestration(id)
                .await
                .with_context(|| format!("failed to load orchestration {id}"))?;
            if !change(&mut orchestration)? {
                return Ok(orchestration);
            }
            match store.update_orchestration(orchestration).await {
                Ok(updated) => return Ok(updated),
                Err(err) if err.is_conflict() && attempt < STATE_UPDATE_ATTEMPTS => continue,
                Err(err) => {
                    return Err(err).with_context(|| format!("failed to update orchestration {id}"))
                }
            }
        }
        Err(anyhow!("orchestration {id} kept changing concurrently"))
    }

    fn operation_queue(&self, operation_type: OperationType) -> Result<&RunningQueue> {
        self.operation_queues
            .get(&operation_type)
            .ok_or_else(|| anyhow!("{operation_type} operations are driven by orchestrations"))
    }

    /// Stop every worker, wait for them and stop the exporter.
    pub async fn shutdown(self) -> Result<()> {
        self.stop.cancel();
        for (_, running) in self.orchestration_queues {
            running.handle.join().await;
        }
        for (_, running) in self.operation_queues {
            running.handle.join().await;
        }
        if let Some(server) = self.metrics_server {
            if let Err(err) = server.shutdown().await {
                warn!(error = %err, "metrics exporter shutdown failed");
            }
        }
        info!("engine shutdown complete");
        Ok(())
    }
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle")
            .field("operation_queues", &self.operation_queues.keys().collect::<Vec<_>>())
            .field("orchestration_queues", &self.orchestration_queues.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}
