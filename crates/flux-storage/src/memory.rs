//! A `DashMap`-backed `Repository` for tests and single-process dev
//! mode. Generalized from the teacher's `durable::persistence::memory`.

use async_trait::async_trait;
use dashmap::DashMap;
use flux_core::event::Event;
use flux_core::execution::{Execution, ExecutionState};
use flux_core::ids::{ExecutionId, WorkerName};
use flux_core::workflow::WorkflowDefinition;

use crate::error::StoreError;
use crate::repository::{Repository, WorkerRecord};

#[derive(Default)]
pub struct InMemoryRepository {
    workflows: DashMap<(String, u32), (WorkflowDefinition, Vec<u8>)>,
    latest_version: DashMap<String, u32>,
    executions: DashMap<ExecutionId, Execution>,
    workers: DashMap<WorkerName, WorkerRecord>,
    secrets: DashMap<String, Vec<u8>>,
    cache: DashMap<(String, String), Vec<u8>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn upsert_workflow(&self, def: WorkflowDefinition, body: Vec<u8>) -> Result<(), StoreError> {
        let entry = self.latest_version.entry(def.name.clone()).or_insert(0);
        let max = *entry.value();
        if def.version > max {
            *self.latest_version.entry(def.name.clone()).or_insert(0) = def.version;
        }
        self.workflows.insert((def.name.clone(), def.version), (def, body));
        Ok(())
    }

    async fn get_workflow(&self, name: &str, version: Option<u32>) -> Result<(WorkflowDefinition, Vec<u8>), StoreError> {
        let version = match version {
            Some(v) => v,
            None => *self
                .latest_version
                .get(name)
                .ok_or_else(|| StoreError::NotFound(format!("workflow {name}")))?
                .value(),
        };
        self.workflows
            .get(&(name.to_string(), version))
            .map(|e| e.value().clone())
            .ok_or_else(|| StoreError::NotFound(format!("workflow {name}@{version}")))
    }

    async fn list_workflows(&self) -> Result<Vec<WorkflowDefinition>, StoreError> {
        Ok(self.workflows.iter().map(|e| e.value().0.clone()).collect())
    }

    async fn create_execution(&self, execution: Execution) -> Result<(), StoreError> {
        self.executions.insert(execution.execution_id, execution);
        Ok(())
    }

    async fn load_execution(&self, id: ExecutionId) -> Result<Execution, StoreError> {
        self.executions
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or_else(|| StoreError::NotFound(format!("execution {id}")))
    }

    async fn append_events(
        &self,
        id: ExecutionId,
        expected_seq: u64,
        new_events: Vec<Event>,
        new_state: ExecutionState,
    ) -> Result<(), StoreError> {
        let mut entry = self
            .executions
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("execution {id}")))?;
        if entry.checkpoint_seq != expected_seq {
            return Err(StoreError::Conflict {
                expected: expected_seq,
                found: entry.checkpoint_seq,
            });
        }
        if entry.state.is_terminal() {
            return Err(StoreError::Conflict {
                expected: expected_seq,
                found: entry.checkpoint_seq,
            });
        }
        let added = new_events.len() as u64;
        entry.events.extend(new_events);
        entry.checkpoint_seq += added;
        entry.state = new_state;
        entry.updated_at = chrono::Utc::now();
        Ok(())
    }

    async fn set_current_worker(&self, id: ExecutionId, worker: Option<WorkerName>) -> Result<(), StoreError> {
        let mut entry = self
            .executions
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("execution {id}")))?;
        entry.current_worker = worker;
        Ok(())
    }

    async fn list_executions_by_state(&self, state: ExecutionState) -> Result<Vec<Execution>, StoreError> {
        Ok(self
            .executions
            .iter()
            .filter(|e| e.value().state == state)
            .map(|e| e.value().clone())
            .collect())
    }

    async fn upsert_worker(&self, worker: WorkerRecord) -> Result<(), StoreError> {
        self.workers.insert(worker.name.clone(), worker);
        Ok(())
    }

    async fn get_worker(&self, name: &WorkerName) -> Result<WorkerRecord, StoreError> {
        self.workers
            .get(name)
            .map(|e| e.value().clone())
            .ok_or_else(|| StoreError::NotFound(format!("worker {name}")))
    }

    async fn list_workers(&self) -> Result<Vec<WorkerRecord>, StoreError> {
        Ok(self.workers.iter().map(|e| e.value().clone()).collect())
    }

    async fn remove_worker(&self, name: &WorkerName) -> Result<(), StoreError> {
        self.workers.remove(name);
        Ok(())
    }

    async fn put_secret(&self, name: &str, ciphertext: Vec<u8>) -> Result<(), StoreError> {
        self.secrets.insert(name.to_string(), ciphertext);
        Ok(())
    }

    async fn get_secret(&self, name: &str) -> Result<Vec<u8>, StoreError> {
        self.secrets
            .get(name)
            .map(|e| e.value().clone())
            .ok_or_else(|| StoreError::NotFound(format!("secret {name}")))
    }

    async fn list_secret_names(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.secrets.iter().map(|e| e.key().clone()).collect())
    }

    async fn remove_secret(&self, name: &str) -> Result<(), StoreError> {
        self.secrets.remove(name);
        Ok(())
    }

    async fn get_cached(&self, task_name: &str, fingerprint: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self
            .cache
            .get(&(task_name.to_string(), fingerprint.to_string()))
            .map(|e| e.value().clone()))
    }

    async fn put_cached(&self, task_name: &str, fingerprint: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.cache
            .insert((task_name.to_string(), fingerprint.to_string()), value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flux_core::event::{Event, EventKind};
    use flux_core::ids::SourceId;
    use serde_json::json;

    fn sample_event(seq: u64) -> Event {
        Event {
            seq,
            source_id: SourceId("wf#0".into()),
            name: "wf".into(),
            timestamp: chrono::Utc::now(),
            kind: EventKind::WorkflowStarted { input: json!(null) },
        }
    }

    #[tokio::test]
    async fn append_events_rejects_stale_seq() {
        let repo = InMemoryRepository::new();
        let execution = Execution::new("hello_world", 1, json!("World"));
        let id = execution.execution_id;
        repo.create_execution(execution).await.unwrap();

        repo.append_events(id, 0, vec![sample_event(0)], ExecutionState::Running)
            .await
            .unwrap();

        let err = repo
            .append_events(id, 0, vec![sample_event(1)], ExecutionState::Running)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
    }

    #[tokio::test]
    async fn append_events_rejects_after_terminal() {
        let repo = InMemoryRepository::new();
        let execution = Execution::new("hello_world", 1, json!("World"));
        let id = execution.execution_id;
        repo.create_execution(execution).await.unwrap();
        repo.append_events(id, 0, vec![sample_event(0)], ExecutionState::Completed)
            .await
            .unwrap();

        let err = repo
            .append_events(id, 1, vec![sample_event(1)], ExecutionState::Running)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
    }
}
