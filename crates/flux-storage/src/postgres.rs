//! The reference `Repository` backend: Postgres via `sqlx`, following
//! the table layout in spec.md §6.3 and the query patterns of the
//! teacher's `durable::persistence::postgres`.

use async_trait::async_trait;
use flux_core::event::Event;
use flux_core::execution::{Execution, ExecutionState};
use flux_core::ids::{ExecutionId, WorkerName};
use flux_core::workflow::WorkflowDefinition;
use sqlx::{PgPool, Row};

use crate::error::StoreError;
use crate::repository::{Repository, WorkerRecord};

pub struct PgRepository {
    pool: PgPool,
}

impl PgRepository {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(StoreError::Sqlx)?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }
}

fn state_to_str(state: ExecutionState) -> &'static str {
    match state {
        ExecutionState::Created => "CREATED",
        ExecutionState::Scheduled => "SCHEDULED",
        ExecutionState::Claimed => "CLAIMED",
        ExecutionState::Running => "RUNNING",
        ExecutionState::Paused => "PAUSED",
        ExecutionState::Cancelling => "CANCELLING",
        ExecutionState::Completed => "COMPLETED",
        ExecutionState::Failed => "FAILED",
        ExecutionState::Cancelled => "CANCELLED",
    }
}

fn str_to_state(s: &str) -> ExecutionState {
    match s {
        "SCHEDULED" => ExecutionState::Scheduled,
        "CLAIMED" => ExecutionState::Claimed,
        "RUNNING" => ExecutionState::Running,
        "PAUSED" => ExecutionState::Paused,
        "CANCELLING" => ExecutionState::Cancelling,
        "COMPLETED" => ExecutionState::Completed,
        "FAILED" => ExecutionState::Failed,
        "CANCELLED" => ExecutionState::Cancelled,
        _ => ExecutionState::Created,
    }
}

#[async_trait]
impl Repository for PgRepository {
    async fn upsert_workflow(&self, def: WorkflowDefinition, body: Vec<u8>) -> Result<(), StoreError> {
        let meta = serde_json::to_value(&def)?;
        sqlx::query(
            "INSERT INTO workflows (name, version, body, meta) VALUES ($1, $2, $3, $4)
             ON CONFLICT (name, version) DO UPDATE SET body = EXCLUDED.body, meta = EXCLUDED.meta",
        )
        .bind(&def.name)
        .bind(def.version as i32)
        .bind(&body)
        .bind(meta)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_workflow(&self, name: &str, version: Option<u32>) -> Result<(WorkflowDefinition, Vec<u8>), StoreError> {
        let row = match version {
            Some(v) => {
                sqlx::query("SELECT body, meta FROM workflows WHERE name = $1 AND version = $2")
                    .bind(name)
                    .bind(v as i32)
                    .fetch_optional(&self.pool)
                    .await?
            }
            None => {
                sqlx::query(
                    "SELECT body, meta FROM workflows WHERE name = $1 ORDER BY version DESC LIMIT 1",
                )
                .bind(name)
                .fetch_optional(&self.pool)
                .await?
            }
        }
        .ok_or_else(|| StoreError::NotFound(format!("workflow {name}")))?;

        let body: Vec<u8> = row.try_get("body")?;
        let meta: serde_json::Value = row.try_get("meta")?;
        let def: WorkflowDefinition = serde_json::from_value(meta)?;
        Ok((def, body))
    }

    async fn list_workflows(&self) -> Result<Vec<WorkflowDefinition>, StoreError> {
        let rows = sqlx::query("SELECT meta FROM workflows ORDER BY name, version")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| {
                let meta: serde_json::Value = row.try_get("meta")?;
                Ok(serde_json::from_value(meta)?)
            })
            .collect()
    }

    async fn create_execution(&self, execution: Execution) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO executions
                (execution_id, workflow_name, workflow_version, input, state, worker,
                 checkpoint_seq, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(execution.execution_id.0)
        .bind(&execution.workflow_name)
        .bind(execution.workflow_version as i32)
        .bind(&execution.input)
        .bind(state_to_str(execution.state))
        .bind(execution.current_worker.as_ref().map(|w| w.0.clone()))
        .bind(execution.checkpoint_seq as i64)
        .bind(execution.created_at)
        .bind(execution.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_execution(&self, id: ExecutionId) -> Result<Execution, StoreError> {
        let row = sqlx::query(
            "SELECT workflow_name, workflow_version, input, state, worker, checkpoint_seq,
                    created_at, updated_at
             FROM executions WHERE execution_id = $1",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("execution {id}")))?;

        let event_rows = sqlx::query(
            "SELECT seq, type, source_id, name, value, timestamp
             FROM execution_events WHERE execution_id = $1 ORDER BY seq",
        )
        .bind(id.0)
        .fetch_all(&self.pool)
        .await?;

        let mut events = Vec::with_capacity(event_rows.len());
        for row in event_rows {
            let seq: i64 = row.try_get("seq")?;
            let value: serde_json::Value = row.try_get("value")?;
            events.push(Event {
                seq: seq as u64,
                source_id: flux_core::ids::SourceId(row.try_get("source_id")?),
                name: row.try_get("name")?,
                timestamp: row.try_get("timestamp")?,
                kind: serde_json::from_value(value)?,
            });
        }

        let worker: Option<String> = row.try_get("worker")?;
        Ok(Execution {
            execution_id: id,
            workflow_name: row.try_get("workflow_name")?,
            workflow_version: row.try_get::<i32, _>("workflow_version")? as u32,
            input: row.try_get("input")?,
            state: str_to_state(row.try_get::<String, _>("state")?.as_str()),
            current_worker: worker.map(WorkerName),
            output: None,
            error: None,
            events,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            checkpoint_seq: row.try_get::<i64, _>("checkpoint_seq")? as u64,
        })
    }

    async fn append_events(
        &self,
        id: ExecutionId,
        expected_seq: u64,
        new_events: Vec<Event>,
        new_state: ExecutionState,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT checkpoint_seq FROM executions WHERE execution_id = $1 FOR UPDATE",
        )
        .bind(id.0)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("execution {id}")))?;
        let found: i64 = row.try_get("checkpoint_seq")?;
        if found as u64 != expected_seq {
            return Err(StoreError::Conflict {
                expected: expected_seq,
                found: found as u64,
            });
        }

        let mut seq = expected_seq;
        for event in &new_events {
            let value = serde_json::to_value(&event.kind)?;
            sqlx::query(
                "INSERT INTO execution_events (execution_id, seq, type, source_id, name, value, timestamp)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
            )
            .bind(id.0)
            .bind(seq as i64)
            .bind(event.kind.tag())
            .bind(&event.source_id.0)
            .bind(&event.name)
            .bind(value)
            .bind(event.timestamp)
            .execute(&mut *tx)
            .await?;
            seq += 1;
        }

        sqlx::query(
            "UPDATE executions SET checkpoint_seq = $2, state = $3, updated_at = now()
             WHERE execution_id = $1",
        )
        .bind(id.0)
        .bind(seq as i64)
        .bind(state_to_str(new_state))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn set_current_worker(&self, id: ExecutionId, worker: Option<WorkerName>) -> Result<(), StoreError> {
        sqlx::query("UPDATE executions SET worker = $2 WHERE execution_id = $1")
            .bind(id.0)
            .bind(worker.map(|w| w.0))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_executions_by_state(&self, state: ExecutionState) -> Result<Vec<Execution>, StoreError> {
        let rows = sqlx::query("SELECT execution_id FROM executions WHERE state = $1 ORDER BY created_at")
            .bind(state_to_str(state))
            .fetch_all(&self.pool)
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let id: uuid::Uuid = row.try_get("execution_id")?;
            out.push(self.load_execution(ExecutionId(id)).await?);
        }
        Ok(out)
    }

    async fn upsert_worker(&self, worker: WorkerRecord) -> Result<(), StoreError> {
        let resources = serde_json::to_value(&worker.resources)?;
        sqlx::query(
            "INSERT INTO workers (name, session_token_hash, resources, last_seen)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (name) DO UPDATE SET
                session_token_hash = EXCLUDED.session_token_hash,
                resources = EXCLUDED.resources,
                last_seen = EXCLUDED.last_seen",
        )
        .bind(&worker.name.0)
        .bind(&worker.session_token_hash)
        .bind(resources)
        .bind(worker.last_seen)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_worker(&self, name: &WorkerName) -> Result<WorkerRecord, StoreError> {
        let row = sqlx::query(
            "SELECT name, session_token_hash, resources, last_seen FROM workers WHERE name = $1",
        )
        .bind(&name.0)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("worker {name}")))?;
        let resources: serde_json::Value = row.try_get("resources")?;
        Ok(WorkerRecord {
            name: WorkerName(row.try_get("name")?),
            session_token_hash: row.try_get("session_token_hash")?,
            resources: serde_json::from_value(resources)?,
            last_seen: row.try_get("last_seen")?,
            claimed_executions: 0,
        })
    }

    async fn list_workers(&self) -> Result<Vec<WorkerRecord>, StoreError> {
        let rows = sqlx::query("SELECT name FROM workers").fetch_all(&self.pool).await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let name: String = row.try_get("name")?;
            out.push(self.get_worker(&WorkerName(name)).await?);
        }
        Ok(out)
    }

    async fn remove_worker(&self, name: &WorkerName) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM workers WHERE name = $1")
            .bind(&name.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn put_secret(&self, name: &str, ciphertext: Vec<u8>) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO secrets (name, ciphertext) VALUES ($1, $2)
             ON CONFLICT (name) DO UPDATE SET ciphertext = EXCLUDED.ciphertext",
        )
        .bind(name)
        .bind(ciphertext)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_secret(&self, name: &str) -> Result<Vec<u8>, StoreError> {
        let row = sqlx::query("SELECT ciphertext FROM secrets WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("secret {name}")))?;
        Ok(row.try_get("ciphertext")?)
    }

    async fn list_secret_names(&self) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query("SELECT name FROM secrets").fetch_all(&self.pool).await?;
        rows.into_iter().map(|r| Ok(r.try_get("name")?)).collect()
    }

    async fn remove_secret(&self, name: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM secrets WHERE name = $1")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_cached(&self, task_name: &str, fingerprint: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let row = sqlx::query(
            "SELECT value FROM task_cache WHERE task_name = $1 AND fingerprint = $2",
        )
        .bind(task_name)
        .bind(fingerprint)
        .fetch_optional(&self.pool)
        .await?;
        Ok(match row {
            Some(r) => Some(r.try_get("value")?),
            None => None,
        })
    }

    async fn put_cached(&self, task_name: &str, fingerprint: &str, value: Vec<u8>) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO task_cache (task_name, fingerprint, value) VALUES ($1, $2, $3)
             ON CONFLICT (task_name, fingerprint) DO NOTHING",
        )
        .bind(task_name)
        .bind(fingerprint)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
