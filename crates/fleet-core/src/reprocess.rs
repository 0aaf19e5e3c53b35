//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Primary engine wiring and lifecycle management."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use anyhow::{Context, Result};
use fleet_store::{
    OperationFilter, OperationReader, OperationState, OperationType, Operations,
    OrchestrationFilter, OrchestrationState, OrchestrationType, Orchestrations, Storage,
};
use tracing::info;

/// Operation types with their own worker queue. Upgrade operations run inside
/// an orchestration's execution strategy instead.
pub const QUEUED_OPERATION_TYPES: [OperationType; 3] = [
    OperationType::Provision,
    OperationType::Deprovision,
    OperationType::Update,
];

const RESUMED_ORCHESTRATION_STATES: [OrchestrationState; 3] = [
    OrchestrationState::InProgress,
    OrchestrationState::Pending,
    OrchestrationState::Retrying,
];

/// Ids of the not finished operations of one type, oldest first.
pub async fn operations_to_resume(
    operations: &Operations,
    operation_type: OperationType,
) -> Result<Vec<String>> {
    let found = operations
        .get_not_finished_operations_by_type(operation_type)
        .await
        .with_context(|| format!("while listing not finished {operation_type} operations"))?;
    for operation in &found {
        info!(operation_id = %operation.id, %operation_type, "resuming operation");
    }
    Ok(found.into_iter().map(|operation| operation.id).collect())
}

/// Orchestration ids to enqueue on startup, in enqueue order: at most one
/// canceling orchestration that still has operations in progress, then
/// in-progress, pending and retrying ones, each oldest first.
pub async fn orchestrations_to_resume(
    storage: &Storage,
    orchestration_type: OrchestrationType,
) -> Result<Vec<String>> {
    let mut ids = Vec::new();
    if let Some(id) = canceling_to_resume(storage, orchestration_type).await? {
        ids.push(id);
    }
    for state in RESUMED_ORCHESTRATION_STATES {
        for orchestration in list_by_state(storage, orchestration_type, state).await? {
            info!(orchestration_id = %orchestration.id, %state, %orchestration_type, "resuming orchestration");
            ids.push(orchestration.id);
        }
    }
    Ok(ids)
}

// Only one, so a backlog of cancels cannot fill the orchestration workers.
async fn canceling_to_resume(
    storage: &Storage,
    orchestration_type: OrchestrationType,
) -> Result<Option<String>> {
    for orchestration in list_by_state(storage, orchestration_type, OrchestrationState::Canceling).await? {
        let in_progress = storage
            .operations()
            .list_operations(
                &OperationFilter::for_orchestration(orchestration.id.clone())
                    .with_states([OperationState::InProgress]),
            )
            .await
            .with_context(|| {
                format!("while listing operations of orchestration {}", orchestration.id)
            })?;
        if !in_progress.is_empty() {
            info!(orchestration_id = %orchestration.id, %orchestration_type, "resuming canceling orchestration");
            return Ok(Some(orchestration.id));
        }
    }
    Ok(None)
}

async fn list_by_state(
    storage: &Storage,
    orchestration_type: OrchestrationType,
    state: OrchestrationState,
) -> Result<Vec<fleet_store::Orchestration>> {
    let filter = OrchestrationFilter {
        types: vec![orchestration_type],
        states: vec![state],
    };
    let mut found = storage
        .orchestrations()
        .list_orchestrations(&filter)
        .await
        .with_context(|| format!("while listing {state} {orchestration_type} orchestrations"))?;
    found.sort_by_key(|orchestration| orchestration.created_at);
    Ok(found)
}
