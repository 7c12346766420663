//! The in-process worker registry: tracks each connected worker's
//! resources, claim count, and a broadcast channel used to fan out
//! control events to its `/workers/{name}/connect` SSE stream. This is
//! the in-memory counterpart to `flux_storage::repository::WorkerRecord`
//! — the registry holds the *live connection*, the repository holds the
//! durable record, mirroring the teacher's split between
//! `control-plane`'s `AppState` (live) and `Database` (durable).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use flux_core::ids::WorkerName;
use flux_core::workflow::WorkerResources;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

/// Control-plane events pushed to a worker's SSE stream (spec.md §4.7,
/// §6.1's SSE frame table).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkerControlEvent {
    ExecutionScheduled {
        execution_id: Uuid,
        workflow_name: String,
        workflow_version: u32,
    },
    ExecutionResumed {
        execution_id: Uuid,
        resume_input: serde_json::Value,
    },
    ExecutionCancelled {
        execution_id: Uuid,
    },
}

impl WorkerControlEvent {
    pub fn event_name(&self) -> &'static str {
        match self {
            WorkerControlEvent::ExecutionScheduled { .. } => "execution_scheduled",
            WorkerControlEvent::ExecutionResumed { .. } => "execution_resumed",
            WorkerControlEvent::ExecutionCancelled { .. } => "execution_cancelled",
        }
    }
}

/// One connected worker: its declared resources, session identity, and
/// the channel its SSE handler subscribes to. `connection_id` is bumped
/// on every `register` call so a disconnect watcher spawned for an
/// earlier connection can tell, after waking from its grace-period
/// sleep, whether the worker has since reconnected under a fresh
/// connection (spec.md §4.7 step 6) rather than evicting a live one.
pub struct WorkerConnection {
    pub resources: WorkerResources,
    pub session_token_hash: String,
    pub claimed_executions: AtomicU32,
    pub connection_id: u64,
    tx: broadcast::Sender<WorkerControlEvent>,
}

/// Snapshot used by the dispatcher's (pure, unit-testable) resource-fit
/// matching — decoupled from the live connection so matching logic
/// doesn't need an `&WorkerRegistry` to be tested.
#[derive(Debug, Clone)]
pub struct WorkerSnapshot {
    pub name: WorkerName,
    pub resources: WorkerResources,
    pub claimed_executions: u32,
}

pub struct WorkerRegistry {
    workers: RwLock<HashMap<WorkerName, WorkerConnection>>,
    next_connection_id: AtomicU64,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self {
            workers: RwLock::new(HashMap::new()),
            next_connection_id: AtomicU64::new(1),
        }
    }

    /// Register (or re-register) `name`, returning the freshly minted
    /// `connection_id` for this registration.
    pub async fn register(&self, name: WorkerName, resources: WorkerResources, session_token_hash: String) -> u64 {
        let (tx, _rx) = broadcast::channel(256);
        let connection_id = self.next_connection_id.fetch_add(1, Ordering::SeqCst);
        let mut workers = self.workers.write().await;
        workers.insert(
            name,
            WorkerConnection {
                resources,
                session_token_hash,
                claimed_executions: AtomicU32::new(0),
                connection_id,
                tx,
            },
        );
        connection_id
    }

    /// `true` if `name` is either gone or has since reconnected under a
    /// different `connection_id` — either way the disconnect that
    /// scheduled this check is no longer current and eviction should be
    /// skipped.
    pub async fn is_current_connection(&self, name: &WorkerName, connection_id: u64) -> bool {
        self.workers
            .read()
            .await
            .get(name)
            .map(|w| w.connection_id == connection_id)
            .unwrap_or(false)
    }

    pub async fn deregister(&self, name: &WorkerName) {
        self.workers.write().await.remove(name);
    }

    pub async fn authorize(&self, name: &WorkerName, session_token_hash: &str) -> bool {
        self.workers
            .read()
            .await
            .get(name)
            .map(|w| w.session_token_hash == session_token_hash)
            .unwrap_or(false)
    }

    /// Subscribe to `name`'s control event stream; the SSE handler owns
    /// the returned receiver for the lifetime of the connection.
    pub async fn subscribe(&self, name: &WorkerName) -> Option<broadcast::Receiver<WorkerControlEvent>> {
        self.workers.read().await.get(name).map(|w| w.tx.subscribe())
    }

    pub async fn send(&self, name: &WorkerName, event: WorkerControlEvent) -> bool {
        match self.workers.read().await.get(name) {
            Some(w) => w.tx.send(event).is_ok(),
            None => false,
        }
    }

    pub async fn increment_claims(&self, name: &WorkerName) {
        if let Some(w) = self.workers.read().await.get(name) {
            w.claimed_executions.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub async fn decrement_claims(&self, name: &WorkerName) {
        if let Some(w) = self.workers.read().await.get(name) {
            w.claimed_executions.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| Some(c.saturating_sub(1))).ok();
        }
    }

    pub async fn snapshot(&self) -> Vec<WorkerSnapshot> {
        self.workers
            .read()
            .await
            .iter()
            .map(|(name, conn)| WorkerSnapshot {
                name: name.clone(),
                resources: conn.resources.clone(),
                claimed_executions: conn.claimed_executions.load(Ordering::SeqCst),
            })
            .collect()
    }

    pub async fn contains(&self, name: &WorkerName) -> bool {
        self.workers.read().await.contains_key(name)
    }

    pub async fn connection_id(&self, name: &WorkerName) -> Option<u64> {
        self.workers.read().await.get(name).map(|w| w.connection_id)
    }
}

impl Default for WorkerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Grace period after which a worker whose stream closed (and never
/// reconnected) is considered dead and its claims reverted (spec.md
/// §4.8's "Worker Registry ... evicts workers whose stream closes and
/// does not reconnect within a configured grace period").
pub const RECONNECT_GRACE_PERIOD: Duration = Duration::from_secs(30);

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reconnect_under_a_new_connection_id_supersedes_the_old_one() {
        let registry = WorkerRegistry::new();
        let name = WorkerName("w1".into());
        let resources = WorkerResources::default();

        let first = registry.register(name.clone(), resources.clone(), "hash1".into()).await;
        assert!(registry.is_current_connection(&name, first).await);

        let second = registry.register(name.clone(), resources, "hash2".into()).await;
        assert_ne!(first, second);
        assert!(!registry.is_current_connection(&name, first).await);
        assert!(registry.is_current_connection(&name, second).await);
    }

    #[tokio::test]
    async fn deregistered_worker_is_never_the_current_connection() {
        let registry = WorkerRegistry::new();
        let name = WorkerName("w1".into());
        let id = registry.register(name.clone(), WorkerResources::default(), "hash".into()).await;

        registry.deregister(&name).await;
        assert!(!registry.is_current_connection(&name, id).await);
    }
}
