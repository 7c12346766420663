//! The `Repository` trait: a transactional store for workflows,
//! executions, workers, secrets (ciphertext only), and the task result
//! cache. Generalized from the teacher's `WorkflowEventStore` trait to
//! Flux's wider surface (spec.md §4.3).

use async_trait::async_trait;
use flux_core::event::Event;
use flux_core::execution::{Execution, ExecutionState};
use flux_core::ids::{ExecutionId, WorkerName};
use flux_core::workflow::{WorkerResources, WorkflowDefinition};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// A registered worker, as tracked by the server's worker registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub name: WorkerName,
    pub session_token_hash: String,
    pub resources: WorkerResources,
    pub last_seen: chrono::DateTime<chrono::Utc>,
    pub claimed_executions: u32,
}

#[async_trait]
pub trait Repository: Send + Sync + 'static {
    // Workflow catalog
    async fn upsert_workflow(&self, def: WorkflowDefinition, body: Vec<u8>) -> Result<(), StoreError>;
    async fn get_workflow(&self, name: &str, version: Option<u32>) -> Result<(WorkflowDefinition, Vec<u8>), StoreError>;
    async fn list_workflows(&self) -> Result<Vec<WorkflowDefinition>, StoreError>;

    // Executions
    async fn create_execution(&self, execution: Execution) -> Result<(), StoreError>;
    async fn load_execution(&self, id: ExecutionId) -> Result<Execution, StoreError>;
    /// Append one or more events and persist the new execution state in
    /// one atomic operation, rejecting the write if `expected_seq`
    /// doesn't match the stored `checkpoint_seq` (optimistic CAS, P8).
    async fn append_events(
        &self,
        id: ExecutionId,
        expected_seq: u64,
        new_events: Vec<Event>,
        new_state: ExecutionState,
    ) -> Result<(), StoreError>;
    async fn set_current_worker(&self, id: ExecutionId, worker: Option<WorkerName>) -> Result<(), StoreError>;
    async fn list_executions_by_state(&self, state: ExecutionState) -> Result<Vec<Execution>, StoreError>;

    // Worker registry
    async fn upsert_worker(&self, worker: WorkerRecord) -> Result<(), StoreError>;
    async fn get_worker(&self, name: &WorkerName) -> Result<WorkerRecord, StoreError>;
    async fn list_workers(&self) -> Result<Vec<WorkerRecord>, StoreError>;
    async fn remove_worker(&self, name: &WorkerName) -> Result<(), StoreError>;

    // Secrets (ciphertext only; see `crate::vault` for the plaintext-facing API)
    async fn put_secret(&self, name: &str, ciphertext: Vec<u8>) -> Result<(), StoreError>;
    async fn get_secret(&self, name: &str) -> Result<Vec<u8>, StoreError>;
    async fn list_secret_names(&self) -> Result<Vec<String>, StoreError>;
    async fn remove_secret(&self, name: &str) -> Result<(), StoreError>;

    // Task result cache, keyed by (task_name, fingerprint)
    async fn get_cached(&self, task_name: &str, fingerprint: &str) -> Result<Option<Vec<u8>>, StoreError>;
    async fn put_cached(&self, task_name: &str, fingerprint: &str, value: Vec<u8>) -> Result<(), StoreError>;
}
