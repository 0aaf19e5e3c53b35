//! ---
//! ems_section: "04-configuration-orchestration"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "High-level orchestration kernel coordinating fleet campaigns."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;

use async_trait::async_trait;
use fleet_common::{SharedClock, SystemClock};
use fleet_store::{
    Instance, Operation, OperationFilter, OperationReader, OperationState, OperationWriter,
    Operations, Orchestration, Runtime,
};
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{OrchestrationError, Result};

const CANCEL_ATTEMPTS: usize = 3;

/// A target runtime paired with the operation acting on it.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeOperation {
    /// Target runtime, including its maintenance window.
    pub runtime: Runtime,
    /// Per-runtime operation.
    pub operation: Operation,
}

impl RuntimeOperation {
    /// Pair an operation with the runtime snapshot it carries. Operations
    /// created before snapshots existed get a bare descriptor.
    pub fn from_operation(operation: Operation) -> Self {
        let runtime = operation.runtime.clone().unwrap_or_else(|| Runtime {
            instance_id: operation.instance_id.clone(),
            ..Runtime::default()
        });
        Self { runtime, operation }
    }
}

/// Creates and manipulates the per-runtime operations of an orchestration.
#[async_trait]
pub trait OperationFactory: Send + Sync {
    /// Operation for `runtime` within `orchestration`, created in `state`.
    async fn new_operation(
        &self,
        orchestration: &Orchestration,
        runtime: Runtime,
        instance: &Instance,
        state: OperationState,
    ) -> Result<RuntimeOperation>;

    /// Not finished operations of the orchestration.
    async fn resume_operations(&self, orchestration_id: &str) -> Result<Vec<RuntimeOperation>>;

    /// Move every Pending operation of the orchestration to Canceled.
    async fn cancel_operations(&self, orchestration_id: &str) -> Result<()>;

    /// Reset the listed operations for another attempt.
    async fn retry_operations(&self, operation_ids: &[String]) -> Result<Vec<RuntimeOperation>>;
}

/// [`OperationFactory`] writing straight to the operation store.
#[derive(Debug, Clone)]
pub struct StoreOperationFactory {
    operations: Operations,
    clock: SharedClock,
}

impl StoreOperationFactory {
    /// Factory over `operations`.
    pub fn new(operations: Operations) -> Self {
        Self {
            operations,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the clock used for retry timestamps.
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    async fn cancel_one(&self, mut operation: Operation) -> Result<()> {
        for attempt in 1..=CANCEL_ATTEMPTS {
            if operation.state != OperationState::Pending {
                return Ok(());
            }
            operation.state = OperationState::Canceled;
            operation.append_description("canceled");
            match self.operations.update_operation(operation.clone()).await {
                Ok(_) => return Ok(()),
                Err(err) if err.is_conflict() && attempt < CANCEL_ATTEMPTS => {
                    debug!(operation_id = %operation.id, attempt, "conflict while canceling, reloading");
                    operation = self.operations.get_operation(&operation.id).await?;
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }
}

fn operation_parameters(orchestration: &Orchestration) -> serde_json::Value {
    let params = &orchestration.parameters;
    json!({
        "runtime_version": params.runtime_version,
        "kubernetes_version": params.kubernetes_version,
        "dry_run": params.dry_run,
    })
}

#[async_trait]
impl OperationFactory for StoreOperationFactory {
    async fn new_operation(
        &self,
        orchestration: &Orchestration,
        runtime: Runtime,
        instance: &Instance,
        state: OperationState,
    ) -> Result<RuntimeOperation> {
        let filter = OperationFilter {
            instance_id: Some(instance.instance_id.clone()),
            ..OperationFilter::for_orchestration(&orchestration.id)
        }
        .with_states(OperationState::NOT_FINISHED);

        // a pass interrupted after inserting must not duplicate the operation
        if let Some(mut existing) = self.operations.list_operations(&filter).await?.into_iter().next() {
            debug!(operation_id = %existing.id, instance_id = %instance.instance_id, "reusing existing operation");
            existing.runtime = Some(runtime.clone());
            let operation = self.operations.update_operation(existing).await?;
            return Ok(RuntimeOperation { runtime, operation });
        }

        let mut operation = Operation::new(
            Uuid::new_v4().to_string(),
            instance.instance_id.clone(),
            orchestration.orchestration_type.operation_type(),
        )
        .with_orchestration(orchestration.id.clone())
        .with_runtime(runtime.clone());
        operation.state = state;
        operation.parameters = operation_parameters(orchestration);
        operation.description = format!("scheduled by orchestration {}", orchestration.id);

        let operation = self.operations.insert_operation(operation).await?;
        Ok(RuntimeOperation { runtime, operation })
    }

    async fn resume_operations(&self, orchestration_id: &str) -> Result<Vec<RuntimeOperation>> {
        let filter = OperationFilter::for_orchestration(orchestration_id)
            .with_states(OperationState::NOT_FINISHED);
        let operations = self.operations.list_operations(&filter).await?;
        Ok(operations.into_iter().map(RuntimeOperation::from_operation).collect())
    }

    async fn cancel_operations(&self, orchestration_id: &str) -> Result<()> {
        let filter = OperationFilter::for_orchestration(orchestration_id)
            .with_states([OperationState::Pending]);
        let pending = self.operations.list_operations(&filter).await?;
        let count = pending.len();
        for operation in pending {
            self.cancel_one(operation).await?;
        }
        info!(orchestration_id, count, "pending operations canceled");
        Ok(())
    }

    async fn retry_operations(&self, operation_ids: &[String]) -> Result<Vec<RuntimeOperation>> {
        // every id is checked before the first write
        let mut loaded: Vec<Operation> = Vec::with_capacity(operation_ids.len());
        for id in operation_ids {
            if loaded.iter().any(|op| &op.id == id) {
                continue;
            }
            let operation = match self.operations.get_operation(id).await {
                Ok(operation) => operation,
                Err(err) if err.is_not_found() => {
                    return Err(OrchestrationError::fatal(format!(
                        "operation {id} cannot be retried: not found"
                    )));
                }
                Err(err) => return Err(err.into()),
            };
            if !is_retryable(operation.state) {
                return Err(OrchestrationError::fatal(format!(
                    "operation {id} cannot be retried from state {}",
                    operation.state
                )));
            }
            loaded.push(operation);
        }

        let mut retried = Vec::with_capacity(loaded.len());
        for mut operation in loaded {
            if operation.state == OperationState::Failed {
                warn!(operation_id = %operation.id, "retrying failed operation");
            }
            operation.state = OperationState::Pending;
            operation.finished_stages.clear();
            operation.started_at = self.clock.now();
            operation.append_description("retrying");
            let operation = self.operations.update_operation(operation).await?;
            retried.push(RuntimeOperation::from_operation(operation));
        }
        Ok(retried)
    }
}

/// States an operation may be retried from.
pub fn is_retryable(state: OperationState) -> bool {
    matches!(
        state,
        OperationState::Failed | OperationState::Retrying | OperationState::Pending
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_store::{OrchestrationParameters, OrchestrationType, Storage};

    fn orchestration() -> Orchestration {
        Orchestration::new(
            "orch-1",
            OrchestrationType::UpgradeCluster,
            OrchestrationParameters {
                kubernetes_version: Some("1.29.4".into()),
                ..OrchestrationParameters::default()
            },
        )
    }

    fn instance(id: &str) -> Instance {
        Instance::new(id, format!("rt-{id}"), "ga-1", "azure", "westeurope")
    }

    #[tokio::test]
    async fn new_operation_is_linked_and_idempotent() {
        let storage = Storage::in_memory();
        let factory = StoreOperationFactory::new(storage.operations().clone());
        let orch = orchestration();
        let inst = instance("i-1");

        let first = factory
            .new_operation(&orch, inst.to_runtime(), &inst, OperationState::Pending)
            .await
            .unwrap();
        let again = factory
            .new_operation(&orch, inst.to_runtime(), &inst, OperationState::Pending)
            .await
            .unwrap();

        assert_eq!(first.operation.id, again.operation.id);
        assert_eq!(first.operation.orchestration_id.as_deref(), Some("orch-1"));
        assert_eq!(first.operation.operation_type, fleet_store::OperationType::UpgradeCluster);
        assert_eq!(first.operation.parameters["kubernetes_version"], "1.29.4");
        assert_eq!(factory.resume_operations("orch-1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cancel_only_touches_pending_operations() {
        let storage = Storage::in_memory();
        let factory = StoreOperationFactory::new(storage.operations().clone());
        let orch = orchestration();
        let a = instance("i-1");
        let b = instance("i-2");
        factory
            .new_operation(&orch, a.to_runtime(), &a, OperationState::Pending)
            .await
            .unwrap();
        let running = factory
            .new_operation(&orch, b.to_runtime(), &b, OperationState::InProgress)
            .await
            .unwrap();

        factory.cancel_operations("orch-1").await.unwrap();

        let stats = storage
            .operations()
            .get_operation_stats_for_orchestration("orch-1")
            .await
            .unwrap();
        assert_eq!(stats.count(OperationState::Canceled), 1);
        let running = storage.operations().get_operation(&running.operation.id).await.unwrap();
        assert_eq!(running.state, OperationState::InProgress);
    }

    #[tokio::test]
    async fn retry_resets_failed_operations() {
        let storage = Storage::in_memory();
        let factory = StoreOperationFactory::new(storage.operations().clone());
        let orch = orchestration();
        let inst = instance("i-1");
        let created = factory
            .new_operation(&orch, inst.to_runtime(), &inst, OperationState::Pending)
            .await
            .unwrap();
        let mut failed = created.operation;
        failed.state = OperationState::Failed;
        failed.finish_stage("start");
        let failed = storage.operations().update_operation(failed).await.unwrap();

        let retried = factory.retry_operations(&[failed.id.clone()]).await.unwrap();

        assert_eq!(retried.len(), 1);
        assert_eq!(retried[0].operation.state, OperationState::Pending);
        assert!(retried[0].operation.finished_stages.is_empty());
        assert!(retried[0].operation.description.ends_with("retrying"));
        assert_eq!(retried[0].runtime.instance_id, "i-1");
    }

    #[tokio::test]
    async fn retry_rejects_unknown_and_succeeded_operations() {
        let storage = Storage::in_memory();
        let factory = StoreOperationFactory::new(storage.operations().clone());
        let err = factory.retry_operations(&["ghost".into()]).await.unwrap_err();
        assert!(err.to_string().contains("not found"));

        let mut done = Operation::new("op-1", "i-1", fleet_store::OperationType::UpgradeRuntime);
        done.state = OperationState::Succeeded;
        storage.operations().insert_operation(done).await.unwrap();
        let err = factory.retry_operations(&["op-1".into()]).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::Fatal(_)));
    }

    #[tokio::test]
    async fn rejected_retry_leaves_every_operation_untouched() {
        let storage = Storage::in_memory();
        let factory = StoreOperationFactory::new(storage.operations().clone());
        let mut failed = Operation::new("op-failed", "i-1", fleet_store::OperationType::UpgradeRuntime);
        failed.state = OperationState::Failed;
        failed.finish_stage("upgrade");
        let failed = storage.operations().insert_operation(failed).await.unwrap();

        let err = factory
            .retry_operations(&[failed.id.clone(), "ghost".into()])
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::Fatal(_)));

        let stored = storage.operations().get_operation("op-failed").await.unwrap();
        assert_eq!(stored.state, OperationState::Failed);
        assert_eq!(stored.finished_stages, vec!["upgrade"]);
        assert_eq!(stored.description, failed.description);
    }

    #[tokio::test]
    async fn duplicate_ids_are_retried_once() {
        let storage = Storage::in_memory();
        let factory = StoreOperationFactory::new(storage.operations().clone());
        let mut failed = Operation::new("op-1", "i-1", fleet_store::OperationType::UpgradeRuntime);
        failed.state = OperationState::Failed;
        storage.operations().insert_operation(failed).await.unwrap();

        let retried = factory
            .retry_operations(&["op-1".into(), "op-1".into()])
            .await
            .unwrap();
        assert_eq!(retried.len(), 1);
    }
}
