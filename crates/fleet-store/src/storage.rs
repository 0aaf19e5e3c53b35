//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Persistence abstractions and storage bindings."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::instance::Instance;
use crate::operation::{Operation, OperationFilter, OperationState, OperationStats, OperationType};
use crate::orchestration::{Orchestration, OrchestrationFilter};
use crate::Result;

/// Read capability over operation records.
#[async_trait]
pub trait OperationReader: Send + Sync {
    /// Fetch one operation by id.
    async fn get_operation(&self, id: &str) -> Result<Operation>;

    /// List operations matching `filter`, oldest first.
    async fn list_operations(&self, filter: &OperationFilter) -> Result<Vec<Operation>>;

    /// Per-state counts of the operations owned by an orchestration.
    async fn get_operation_stats_for_orchestration(
        &self,
        orchestration_id: &str,
    ) -> Result<OperationStats>;

    /// Pending, InProgress and Retrying operations of one type, oldest first.
    async fn get_not_finished_operations_by_type(
        &self,
        operation_type: OperationType,
    ) -> Result<Vec<Operation>> {
        let filter = OperationFilter {
            types: vec![operation_type],
            ..OperationFilter::default()
        }
        .with_states(OperationState::NOT_FINISHED);
        self.list_operations(&filter).await
    }
}

/// Write capability over operation records.
#[async_trait]
pub trait OperationWriter: Send + Sync {
    /// Insert a new operation. Fails with `AlreadyExists` on a duplicate id.
    async fn insert_operation(&self, operation: Operation) -> Result<Operation>;

    /// Version-checked update. The supplied version must equal the stored one;
    /// the returned record carries the bumped version and write timestamp.
    async fn update_operation(&self, operation: Operation) -> Result<Operation>;

    /// Remove an operation. Used only by terminal deprovisioning.
    async fn delete_operation(&self, id: &str) -> Result<()>;
}

/// Orchestration records. Every update is version-checked.
#[async_trait]
pub trait Orchestrations: Send + Sync {
    /// Insert a new orchestration.
    async fn insert_orchestration(&self, orchestration: Orchestration) -> Result<Orchestration>;
    /// Fetch one orchestration by id.
    async fn get_orchestration(&self, id: &str) -> Result<Orchestration>;
    /// Version-checked update; see [`OperationWriter::update_operation`].
    async fn update_orchestration(&self, orchestration: Orchestration) -> Result<Orchestration>;
    /// List orchestrations matching `filter`, ordered by creation time.
    async fn list_orchestrations(&self, filter: &OrchestrationFilter) -> Result<Vec<Orchestration>>;
}

/// Provisioned instance records, the input of target resolution.
#[async_trait]
pub trait Instances: Send + Sync {
    /// Insert a new instance.
    async fn insert_instance(&self, instance: Instance) -> Result<Instance>;
    /// Fetch one instance by id.
    async fn get_instance(&self, instance_id: &str) -> Result<Instance>;
    /// Every known instance, ordered by creation time.
    async fn list_instances(&self) -> Result<Vec<Instance>>;
    /// Remove an instance.
    async fn delete_instance(&self, instance_id: &str) -> Result<()>;
}

/// Operation store assembled from a reader and a writer.
///
/// Backends usually implement both halves on one type, but a read replica can
/// be paired with a primary writer without either knowing about the other.
#[derive(Clone)]
pub struct Operations {
    reader: Arc<dyn OperationReader>,
    writer: Arc<dyn OperationWriter>,
}

impl Operations {
    /// Compose the two capabilities.
    pub fn new(reader: Arc<dyn OperationReader>, writer: Arc<dyn OperationWriter>) -> Self {
        Self { reader, writer }
    }

    /// Read half.
    pub fn reader(&self) -> &Arc<dyn OperationReader> {
        &self.reader
    }

    /// Write half.
    pub fn writer(&self) -> &Arc<dyn OperationWriter> {
        &self.writer
    }
}

impl fmt::Debug for Operations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operations").finish_non_exhaustive()
    }
}

#[async_trait]
impl OperationReader for Operations {
    async fn get_operation(&self, id: &str) -> Result<Operation> {
        self.reader.get_operation(id).await
    }

    async fn list_operations(&self, filter: &OperationFilter) -> Result<Vec<Operation>> {
        self.reader.list_operations(filter).await
    }

    async fn get_operation_stats_for_orchestration(
        &self,
        orchestration_id: &str,
    ) -> Result<OperationStats> {
        self.reader
            .get_operation_stats_for_orchestration(orchestration_id)
            .await
    }

    async fn get_not_finished_operations_by_type(
        &self,
        operation_type: OperationType,
    ) -> Result<Vec<Operation>> {
        self.reader
            .get_not_finished_operations_by_type(operation_type)
            .await
    }
}

#[async_trait]
impl OperationWriter for Operations {
    async fn insert_operation(&self, operation: Operation) -> Result<Operation> {
        self.writer.insert_operation(operation).await
    }

    async fn update_operation(&self, operation: Operation) -> Result<Operation> {
        self.writer.update_operation(operation).await
    }

    async fn delete_operation(&self, id: &str) -> Result<()> {
        self.writer.delete_operation(id).await
    }
}

/// Handle to every store the engine needs. Cheap to clone.
#[derive(Clone)]
pub struct Storage {
    operations: Operations,
    orchestrations: Arc<dyn Orchestrations>,
    instances: Arc<dyn Instances>,
}

impl Storage {
    /// Assemble a storage handle.
    pub fn new(
        operations: Operations,
        orchestrations: Arc<dyn Orchestrations>,
        instances: Arc<dyn Instances>,
    ) -> Self {
        Self {
            operations,
            orchestrations,
            instances,
        }
    }

    /// Fresh in-memory backend.
    pub fn in_memory() -> Self {
        crate::memory::MemoryStorage::new().into_storage()
    }

    /// Operation store.
    pub fn operations(&self) -> &Operations {
        &self.operations
    }

    /// Orchestration store.
    pub fn orchestrations(&self) -> &Arc<dyn Orchestrations> {
        &self.orchestrations
    }

    /// Instance store.
    pub fn instances(&self) -> &Arc<dyn Instances> {
        &self.instances
    }
}

impl fmt::Debug for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Storage").finish_non_exhaustive()
    }
}
