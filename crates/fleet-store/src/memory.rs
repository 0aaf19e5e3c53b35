//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Persistence abstractions and storage bindings."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! In-memory backend.
//!
//! Single-process only and not durable. Used by tests and by embedders that
//! rebuild state from elsewhere on restart.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use tracing::trace;

use crate::instance::Instance;
use crate::operation::{Operation, OperationFilter, OperationStats};
use crate::orchestration::{Orchestration, OrchestrationFilter};
use crate::storage::{Instances, OperationReader, OperationWriter, Operations, Orchestrations, Storage};
use crate::{Result, StoreError};

const OPERATION: &str = "operation";
const ORCHESTRATION: &str = "orchestration";
const INSTANCE: &str = "instance";

/// `RwLock<HashMap>` backed implementation of every store trait.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    operations: RwLock<HashMap<String, Operation>>,
    orchestrations: RwLock<HashMap<String, Orchestration>>,
    instances: RwLock<HashMap<String, Instance>>,
}

impl MemoryStorage {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap the backend in a [`Storage`] handle.
    pub fn into_storage(self) -> Storage {
        let shared = Arc::new(self);
        Storage::new(
            Operations::new(shared.clone(), shared.clone()),
            shared.clone(),
            shared,
        )
    }

    /// Number of stored operations.
    pub fn operation_count(&self) -> usize {
        self.operations.read().len()
    }
}

#[async_trait]
impl OperationReader for MemoryStorage {
    async fn get_operation(&self, id: &str) -> Result<Operation> {
        self.operations
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::not_found(OPERATION, id))
    }

    async fn list_operations(&self, filter: &OperationFilter) -> Result<Vec<Operation>> {
        let mut found: Vec<Operation> = self
            .operations
            .read()
            .values()
            .filter(|op| filter.matches(op))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(found)
    }

    async fn get_operation_stats_for_orchestration(
        &self,
        orchestration_id: &str,
    ) -> Result<OperationStats> {
        Ok(self
            .operations
            .read()
            .values()
            .filter(|op| op.orchestration_id.as_deref() == Some(orchestration_id))
            .map(|op| op.state)
            .collect())
    }
}

#[async_trait]
impl OperationWriter for MemoryStorage {
    async fn insert_operation(&self, operation: Operation) -> Result<Operation> {
        let mut operations = self.operations.write();
        if operations.contains_key(&operation.id) {
            return Err(StoreError::AlreadyExists {
                kind: OPERATION,
                id: operation.id,
            });
        }
        trace!(operation_id = %operation.id, "operation inserted");
        operations.insert(operation.id.clone(), operation.clone());
        Ok(operation)
    }

    async fn update_operation(&self, mut operation: Operation) -> Result<Operation> {
        let mut operations = self.operations.write();
        let stored = operations
            .get_mut(&operation.id)
            .ok_or_else(|| StoreError::not_found(OPERATION, operation.id.clone()))?;
        if stored.version != operation.version {
            return Err(StoreError::Conflict {
                kind: OPERATION,
                id: operation.id,
                expected: operation.version,
                actual: stored.version,
            });
        }
        operation.version += 1;
        operation.updated_at = Utc::now();
        *stored = operation.clone();
        Ok(operation)
    }

    async fn delete_operation(&self, id: &str) -> Result<()> {
        self.operations
            .write()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found(OPERATION, id))
    }
}

#[async_trait]
impl Orchestrations for MemoryStorage {
    async fn insert_orchestration(&self, orchestration: Orchestration) -> Result<Orchestration> {
        let mut orchestrations = self.orchestrations.write();
        if orchestrations.contains_key(&orchestration.id) {
            return Err(StoreError::AlreadyExists {
                kind: ORCHESTRATION,
                id: orchestration.id,
            });
        }
        orchestrations.insert(orchestration.id.clone(), orchestration.clone());
        Ok(orchestration)
    }

    async fn get_orchestration(&self, id: &str) -> Result<Orchestration> {
        self.orchestrations
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::not_found(ORCHESTRATION, id))
    }

    async fn update_orchestration(&self, mut orchestration: Orchestration) -> Result<Orchestration> {
        let mut orchestrations = self.orchestrations.write();
        let stored = orchestrations
            .get_mut(&orchestration.id)
            .ok_or_else(|| StoreError::not_found(ORCHESTRATION, orchestration.id.clone()))?;
        if stored.version != orchestration.version {
            return Err(StoreError::Conflict {
                kind: ORCHESTRATION,
                id: orchestration.id,
                expected: orchestration.version,
                actual: stored.version,
            });
        }
        orchestration.version += 1;
        orchestration.updated_at = Utc::now();
        *stored = orchestration.clone();
        Ok(orchestration)
    }

    async fn list_orchestrations(&self, filter: &OrchestrationFilter) -> Result<Vec<Orchestration>> {
        let mut found: Vec<Orchestration> = self
            .orchestrations
            .read()
            .values()
            .filter(|o| filter.matches(o))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(found)
    }
}

#[async_trait]
impl Instances for MemoryStorage {
    async fn insert_instance(&self, instance: Instance) -> Result<Instance> {
        let mut instances = self.instances.write();
        if instances.contains_key(&instance.instance_id) {
            return Err(StoreError::AlreadyExists {
                kind: INSTANCE,
                id: instance.instance_id,
            });
        }
        instances.insert(instance.instance_id.clone(), instance.clone());
        Ok(instance)
    }

    async fn get_instance(&self, instance_id: &str) -> Result<Instance> {
        self.instances
            .read()
            .get(instance_id)
            .cloned()
            .ok_or_else(|| StoreError::not_found(INSTANCE, instance_id))
    }

    async fn list_instances(&self) -> Result<Vec<Instance>> {
        let mut found: Vec<Instance> = self.instances.read().values().cloned().collect();
        found.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.instance_id.cmp(&b.instance_id))
        });
        Ok(found)
    }

    async fn delete_instance(&self, instance_id: &str) -> Result<()> {
        self.instances
            .write()
            .remove(instance_id)
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found(INSTANCE, instance_id))
    }
}
