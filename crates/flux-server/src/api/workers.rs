//! Worker bootstrap, SSE control stream, claim, and checkpoint
//! endpoints (spec.md §4.7, §6.1). Session tokens are opaque random
//! strings hashed with SHA-256 before being handed to the registry, the
//! same "never store bearer credentials in plaintext" convention the
//! teacher's `auth` module uses for its own session tokens.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use flux_core::event::Event as FluxEvent;
use flux_core::execution::ExecutionState;
use flux_core::ids::{ExecutionId, WorkerName};
use flux_core::workflow::WorkerResources;
use flux_storage::repository::{Repository, WorkerRecord};
use futures::StreamExt;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio_stream::wrappers::BroadcastStream;

use crate::error::ApiError;
use crate::hub::ExecutionStreamEvent;
use crate::registry::{WorkerControlEvent, RECONNECT_GRACE_PERIOD};
use crate::state::AppState;

pub fn routes<R: Repository>(state: AppState<R>) -> Router {
    Router::new()
        .route("/workers/register", post(register_worker::<R>))
        .route("/workers/:name/connect", get(connect::<R>))
        .route("/workers/:name/claim/:execution_id", post(claim::<R>))
        .route("/workers/:name/checkpoint/:execution_id", post(checkpoint::<R>))
        .with_state(state)
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct RegisterWorkerRequest {
    pub name: String,
    pub resources: WorkerResources,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct RegisterWorkerResponse {
    pub session_token: String,
}

fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

/// POST /workers/register — bootstrap handshake (spec.md §4.7 step 1).
/// Authenticated by a shared bootstrap token configured out of band
/// (`FLUX_WORKERS__BOOTSTRAP_TOKEN`); returns a freshly minted session
/// token the worker presents to every subsequent call.
pub async fn register_worker<R: Repository>(
    State(state): State<AppState<R>>,
    headers: HeaderMap,
    Json(req): Json<RegisterWorkerRequest>,
) -> Result<Json<RegisterWorkerResponse>, ApiError> {
    let presented = bearer_token(&headers).ok_or(ApiError::Unauthorized)?;
    if presented != &*state.bootstrap_token {
        return Err(ApiError::Unauthorized);
    }

    let mut token_bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut token_bytes);
    let session_token = hex::encode(token_bytes);
    let token_hash = hash_token(&session_token);

    let worker_name = WorkerName(req.name.clone());
    state
        .registry
        .register(worker_name.clone(), req.resources.clone(), token_hash.clone())
        .await;
    state
        .repo
        .upsert_worker(WorkerRecord {
            name: worker_name,
            session_token_hash: token_hash,
            resources: req.resources,
            last_seen: chrono::Utc::now(),
            claimed_executions: 0,
        })
        .await?;
    state.dispatch_notify.notify_one();

    Ok(Json(RegisterWorkerResponse { session_token }))
}

async fn authorize<R: Repository>(state: &AppState<R>, name: &str, headers: &HeaderMap) -> Result<WorkerName, ApiError> {
    let presented = bearer_token(headers).ok_or(ApiError::Unauthorized)?;
    let worker_name = WorkerName(name.to_string());
    if !state.registry.authorize(&worker_name, &hash_token(presented)).await {
        return Err(ApiError::Unauthorized);
    }
    Ok(worker_name)
}

/// GET /workers/{name}/connect — the long-lived SSE control stream
/// (spec.md §4.7 step 2). Carries `ExecutionScheduled`,
/// `ExecutionResumed`, `ExecutionCancelled` frames; this stream is
/// itself the liveness signal the registry's grace-period eviction
/// watches (spec.md §4.7 step 6, §8 scenario 5): when it ends, a
/// watcher is armed that evicts the worker and reverts its claimed
/// executions to `SCHEDULED` if no reconnection supersedes it within
/// [`RECONNECT_GRACE_PERIOD`].
pub async fn connect<R: Repository>(
    State(state): State<AppState<R>>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Result<Sse<impl futures::Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    let worker_name = authorize(&state, &name, &headers).await?;
    let rx = state
        .registry
        .subscribe(&worker_name)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("worker {name} not registered")))?;
    let connection_id = state
        .registry
        .connection_id(&worker_name)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("worker {name} not registered")))?;

    let guard = DisconnectGuard {
        state: state.clone(),
        worker_name: worker_name.clone(),
        connection_id,
    };

    let inner = BroadcastStream::new(rx).filter_map(|item| async move {
        match item {
            Ok(event) => {
                let json = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
                Some(Ok(SseEvent::default().event(event.event_name()).data(json)))
            }
            Err(_lagged) => None,
        }
    });
    let stream = futures::stream::unfold((inner, Some(guard)), |(mut inner, guard)| async move {
        inner.next().await.map(|item| (item, (inner, guard)))
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}

/// Dropped when the SSE stream it's embedded in ends — client
/// disconnect, worker crash, or server shutdown all look the same from
/// here. Schedules the grace-period check rather than evicting
/// immediately, since an SSE stream can legitimately drop on transient
/// network hiccups that a prompt reconnect resolves.
struct DisconnectGuard<R: Repository> {
    state: AppState<R>,
    worker_name: WorkerName,
    connection_id: u64,
}

impl<R: Repository> Drop for DisconnectGuard<R> {
    fn drop(&mut self) {
        let state = self.state.clone();
        let worker_name = self.worker_name.clone();
        let connection_id = self.connection_id;
        tokio::spawn(async move {
            tokio::time::sleep(RECONNECT_GRACE_PERIOD).await;
            if state.registry.is_current_connection(&worker_name, connection_id).await {
                tracing::warn!(%worker_name, "worker did not reconnect within grace period, evicting");
                state.registry.deregister(&worker_name).await;
                revert_executions_claimed_by(&state, &worker_name).await;
            }
        });
    }
}

/// Move every non-terminal execution still assigned to `worker_name`
/// back to `SCHEDULED` and wake the dispatcher (spec.md §8 scenario 5:
/// another worker claims, replays, and skips the already-completed
/// tasks).
async fn revert_executions_claimed_by<R: Repository>(state: &AppState<R>, worker_name: &WorkerName) {
    use ExecutionState::*;
    for live_state in [Claimed, Running, Paused, Cancelling] {
        let executions = match state.repo.list_executions_by_state(live_state).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "failed to list executions during eviction revert");
                continue;
            }
        };
        for execution in executions {
            if execution.current_worker.as_ref() != Some(worker_name) {
                continue;
            }
            let reverted = state
                .repo
                .append_events(execution.execution_id, execution.checkpoint_seq, Vec::new(), ExecutionState::Scheduled)
                .await;
            match reverted {
                Ok(()) => {
                    let _ = state.repo.set_current_worker(execution.execution_id, None).await;
                    tracing::info!(execution_id = %execution.execution_id, %worker_name, "reverted execution to SCHEDULED after worker eviction");
                }
                Err(e) => tracing::warn!(execution_id = %execution.execution_id, error = %e, "failed to revert execution after worker eviction"),
            }
        }
    }
    state.dispatch_notify.notify_one();
}

/// POST /workers/{name}/claim/{execution_id} — at-most-one claim
/// (spec.md §4.8): a compare-and-set on the `SCHEDULED` state. Only
/// the first caller to find the execution still `SCHEDULED` wins; the
/// rest observe the CAS failure as a `409`.
pub async fn claim<R: Repository>(
    State(state): State<AppState<R>>,
    Path((name, execution_id)): Path<(String, uuid::Uuid)>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let worker_name = authorize(&state, &name, &headers).await?;
    let execution_id = ExecutionId(execution_id);
    let execution = state.repo.load_execution(execution_id).await?;

    if execution.state != ExecutionState::Scheduled {
        return Err(ApiError::Conflict(format!(
            "execution {execution_id} is not in SCHEDULED (currently {:?})",
            execution.state
        )));
    }

    state
        .repo
        .append_events(execution_id, execution.checkpoint_seq, Vec::new(), ExecutionState::Claimed)
        .await
        .map_err(|e| match e {
            flux_storage::error::StoreError::Conflict { .. } => {
                ApiError::Conflict(format!("execution {execution_id} was claimed by another worker"))
            }
            other => other.into(),
        })?;
    state.repo.set_current_worker(execution_id, Some(worker_name.clone())).await?;
    state.registry.increment_claims(&worker_name).await;

    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct CheckpointRequest {
    pub checkpoint_seq: u64,
    pub events: Vec<FluxEvent>,
}

/// POST /workers/{name}/checkpoint/{execution_id} — persist newly
/// appended event(s) (spec.md §4.7 step 4). The CAS on
/// `checkpoint_seq` is what makes the durability-before-ack guarantee
/// in spec.md §5 hold: the worker does not consider an event durable
/// until this call returns `200`.
pub async fn checkpoint<R: Repository>(
    State(state): State<AppState<R>>,
    Path((name, execution_id)): Path<(String, uuid::Uuid)>,
    headers: HeaderMap,
    Json(req): Json<CheckpointRequest>,
) -> Result<StatusCode, ApiError> {
    let worker_name = authorize(&state, &name, &headers).await?;
    let execution_id = ExecutionId(execution_id);
    let execution = state.repo.load_execution(execution_id).await?;

    if execution.current_worker.as_ref() != Some(&worker_name) {
        return Err(ApiError::Unauthorized);
    }

    let new_state = derive_transport_state(&execution.state, &req.events);

    state
        .repo
        .append_events(execution_id, req.checkpoint_seq, req.events.clone(), new_state)
        .await
        .map_err(|e| match e {
            flux_storage::error::StoreError::Conflict { expected, found } => {
                ApiError::Conflict(format!("stale checkpoint_seq: expected {expected}, server has {found}"))
            }
            other => other.into(),
        })?;

    if new_state.is_terminal() {
        state.registry.decrement_claims(&worker_name).await;
        state.repo.set_current_worker(execution_id, None).await?;
    }

    let reloaded = state.repo.load_execution(execution_id).await?;
    state
        .hub
        .publish(ExecutionStreamEvent {
            execution_id,
            state: reloaded.state,
            output: reloaded.output,
            error: reloaded.error,
            timestamp: chrono::Utc::now(),
        })
        .await;
    if new_state.is_terminal() {
        state.hub.retire(execution_id).await;
    }

    Ok(StatusCode::OK)
}

/// Layer the dispatcher's transport states (`RUNNING`/`PAUSED`/
/// terminal) on top of the event-derived state, per spec.md §4.8: the
/// first `WORKFLOW_STARTED`/`TASK_STARTED` checkpoint moves
/// `CLAIMED -> RUNNING`; a pause/terminal workflow event moves to the
/// matching transport state directly.
fn derive_transport_state(current: &ExecutionState, new_events: &[FluxEvent]) -> ExecutionState {
    use flux_core::event::EventKind::*;
    let mut state = *current;
    for event in new_events {
        state = match &event.kind {
            WorkflowPaused { .. } => ExecutionState::Paused,
            WorkflowCompleted { .. } => ExecutionState::Completed,
            WorkflowFailed { .. } => ExecutionState::Failed,
            WorkflowCancelled { .. } => ExecutionState::Cancelled,
            WorkflowStarted { .. } | WorkflowResumed { .. } | TaskStarted { .. } => {
                if matches!(state, ExecutionState::Claimed | ExecutionState::Cancelling | ExecutionState::Scheduled) {
                    ExecutionState::Running
                } else {
                    state
                }
            }
            _ => state,
        };
    }
    state
}

pub fn control_event_for_resume(execution_id: uuid::Uuid, resume_input: serde_json::Value) -> WorkerControlEvent {
    WorkerControlEvent::ExecutionResumed { execution_id, resume_input }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claimed_to_running_on_first_task_started() {
        let events = vec![FluxEvent {
            seq: 1,
            source_id: flux_core::ids::SourceId("t".into()),
            name: "t".into(),
            timestamp: chrono::Utc::now(),
            kind: flux_core::event::EventKind::TaskStarted { attempt: 0 },
        }];
        assert_eq!(derive_transport_state(&ExecutionState::Claimed, &events), ExecutionState::Running);
    }

    #[test]
    fn running_to_paused_on_workflow_paused() {
        let events = vec![FluxEvent {
            seq: 2,
            source_id: flux_core::ids::SourceId("wf".into()),
            name: "wf".into(),
            timestamp: chrono::Utc::now(),
            kind: flux_core::event::EventKind::WorkflowPaused { name: "manual".into() },
        }];
        assert_eq!(derive_transport_state(&ExecutionState::Running, &events), ExecutionState::Paused);
    }
}
