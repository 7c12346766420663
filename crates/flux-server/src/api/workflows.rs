//! Workflow catalog + execution lifecycle endpoints (spec.md §6.1):
//! register, list, metadata, run/resume/status/cancel. Run/resume
//! support the three response modes (`sync`, `async`, `stream`) the
//! spec requires, mirroring the teacher's `control-plane::api::messages`
//! convention of one handler per mode fork rather than three separate
//! routes.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Multipart, Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use flux_core::execution::{Execution, ExecutionState};
use flux_core::ids::ExecutionId;
use flux_core::workflow::{OutputStorageKind, ResourceRequirements, WorkflowDefinition};
use flux_storage::repository::Repository;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct WorkflowSummary {
    pub name: String,
    pub version: u32,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct RunResponse {
    pub execution_id: Uuid,
    pub state: ExecutionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<flux_core::event::WireError>,
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct StatusQuery {
    #[serde(default)]
    pub detailed: bool,
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct CancelQuery {
    #[serde(default)]
    pub mode: Option<String>,
}

pub fn routes<R: Repository>(state: AppState<R>) -> Router {
    Router::new()
        .route("/workflows", post(register_workflow::<R>).get(list_workflows::<R>))
        .route("/workflows/:name", get(get_workflow::<R>))
        .route("/workflows/:name/run/:mode", post(run_workflow::<R>))
        .route("/workflows/:name/resume/:execution_id/:mode", post(resume_workflow::<R>))
        .route("/workflows/:name/status/:execution_id", get(execution_status::<R>))
        .route("/workflows/:name/cancel/:execution_id", get(cancel_execution::<R>))
        .with_state(state)
}

/// POST /workflows — register one or more workflows from an uploaded
/// multipart body. Each part named `name` starts a new workflow entry;
/// `resources` (JSON `ResourceRequirements`) and `secrets` (JSON array
/// of names) are optional sibling fields; `body` is the opaque encoded
/// program the worker's registered code addresses by `(name, version)`
/// (spec.md §9 — dynamic shipping is out of scope, so this is metadata
/// plus an opaque blob, not executable code the server interprets).
#[utoipa::path(post, path = "/workflows", responses((status = 200, body = [WorkflowSummary])), tag = "workflows")]
pub async fn register_workflow<R: Repository>(
    State(state): State<AppState<R>>,
    mut multipart: Multipart,
) -> Result<Json<Vec<WorkflowSummary>>, ApiError> {
    let mut name: Option<String> = None;
    let mut resources = ResourceRequirements::default();
    let mut secrets = Vec::new();
    let mut body: Vec<u8> = Vec::new();
    let mut output_storage = OutputStorageKind::Inline;

    while let Some(field) = multipart.next_field().await.map_err(|e| ApiError::BadRequest(e.to_string()))? {
        match field.name().unwrap_or_default() {
            "name" => name = Some(field.text().await.map_err(|e| ApiError::BadRequest(e.to_string()))?),
            "resources" => {
                let text = field.text().await.map_err(|e| ApiError::BadRequest(e.to_string()))?;
                resources = serde_json::from_str(&text).map_err(|e| ApiError::BadRequest(e.to_string()))?;
            }
            "secrets" => {
                let text = field.text().await.map_err(|e| ApiError::BadRequest(e.to_string()))?;
                secrets = serde_json::from_str(&text).map_err(|e| ApiError::BadRequest(e.to_string()))?;
            }
            "output_storage" => {
                let text = field.text().await.map_err(|e| ApiError::BadRequest(e.to_string()))?;
                output_storage = match text.as_str() {
                    "external_by_ref" => OutputStorageKind::ExternalByRef,
                    _ => OutputStorageKind::Inline,
                };
            }
            "body" => {
                body = field.bytes().await.map_err(|e| ApiError::BadRequest(e.to_string()))?.to_vec();
            }
            _ => {}
        }
    }

    let name = name.ok_or_else(|| ApiError::BadRequest("missing required field: name".into()))?;

    // Re-registration of the same name creates a new version (spec.md
    // §4.8): probe the current latest, then upsert at latest+1.
    let next_version = match state.repo.get_workflow(&name, None).await {
        Ok((def, _)) => def.version + 1,
        Err(_) => 1,
    };

    let def = WorkflowDefinition {
        name: name.clone(),
        version: next_version,
        secret_requests: secrets.into_iter().collect(),
        resource_requirements: resources,
        output_storage_kind: output_storage,
    };
    state.repo.upsert_workflow(def.clone(), body).await?;

    Ok(Json(vec![WorkflowSummary { name: def.name, version: def.version }]))
}

#[utoipa::path(get, path = "/workflows", responses((status = 200, body = [WorkflowSummary])), tag = "workflows")]
pub async fn list_workflows<R: Repository>(State(state): State<AppState<R>>) -> Result<Json<Vec<WorkflowSummary>>, ApiError> {
    let defs = state.repo.list_workflows().await?;
    Ok(Json(defs.into_iter().map(|d| WorkflowSummary { name: d.name, version: d.version }).collect()))
}

#[utoipa::path(get, path = "/workflows/{name}", responses((status = 200, body = WorkflowDefinition)), tag = "workflows")]
pub async fn get_workflow<R: Repository>(
    State(state): State<AppState<R>>,
    Path(name): Path<String>,
) -> Result<Json<WorkflowDefinition>, ApiError> {
    let (def, _body) = state.repo.get_workflow(&name, None).await.map_err(|_| ApiError::NotFound(format!("workflow {name} not found")))?;
    Ok(Json(def))
}

/// POST /workflows/{name}/run/{mode} — create and dispatch a new
/// execution. `sync` blocks on the execution reaching a terminal or
/// paused state; `async` returns immediately with `202`; `stream`
/// upgrades to SSE, relaying every `workflow.execution.*` frame.
pub async fn run_workflow<R: Repository>(
    State(state): State<AppState<R>>,
    Path((name, mode)): Path<(String, String)>,
    Json(input): Json<Value>,
) -> Result<Response, ApiError> {
    let (def, _body) = state.repo.get_workflow(&name, None).await.map_err(|_| ApiError::NotFound(format!("workflow {name} not found")))?;

    let execution = Execution::new(def.name.clone(), def.version, input);
    let execution_id = execution.execution_id;
    state.repo.create_execution(execution).await?;
    state.dispatch_notify.notify_one();

    respond_in_mode(&state, execution_id, &mode).await
}

pub async fn resume_workflow<R: Repository>(
    State(state): State<AppState<R>>,
    Path((_name, execution_id, mode)): Path<(String, Uuid, String)>,
    Json(resume_input): Json<Value>,
) -> Result<Response, ApiError> {
    let execution_id = ExecutionId(execution_id);
    let execution = state.repo.load_execution(execution_id).await?;
    if execution.state != ExecutionState::Paused {
        return Err(ApiError::Conflict(format!("execution {execution_id} is not paused")));
    }

    let Some(worker) = execution.current_worker.clone() else {
        return Err(ApiError::Conflict(format!("execution {execution_id} has no owning worker to resume on")));
    };

    state
        .repo
        .append_events(execution_id, execution.checkpoint_seq, Vec::new(), ExecutionState::Scheduled)
        .await?;
    state
        .registry
        .send(&worker, crate::registry::WorkerControlEvent::ExecutionResumed { execution_id: execution_id.0, resume_input })
        .await;

    respond_in_mode(&state, execution_id, &mode).await
}

async fn respond_in_mode<R: Repository>(state: &AppState<R>, execution_id: ExecutionId, mode: &str) -> Result<Response, ApiError> {
    match mode {
        "async" => Ok((StatusCode::ACCEPTED, Json(serde_json::json!({ "execution_id": execution_id.0 }))).into_response()),
        "sync" => {
            let outcome = wait_for_resting_state(state, execution_id).await?;
            Ok((StatusCode::OK, Json(outcome)).into_response())
        }
        "stream" => Ok(stream_execution(state.clone(), execution_id).await.into_response()),
        other => Err(ApiError::BadRequest(format!("unknown run mode: {other}"))),
    }
}

async fn wait_for_resting_state<R: Repository>(state: &AppState<R>, execution_id: ExecutionId) -> Result<RunResponse, ApiError> {
    let mut rx = state.hub.subscribe(execution_id).await;
    loop {
        let execution = state.repo.load_execution(execution_id).await?;
        if execution.state.is_terminal() || execution.state == ExecutionState::Paused {
            return Ok(RunResponse {
                execution_id: execution_id.0,
                state: execution.state,
                output: execution.output,
                error: execution.error,
            });
        }
        match tokio::time::timeout(Duration::from_secs(60), rx.recv()).await {
            Ok(Ok(_event)) => continue,
            Ok(Err(_)) => continue,
            Err(_) => continue,
        }
    }
}

async fn stream_execution<R: Repository>(state: AppState<R>, execution_id: ExecutionId) -> Sse<impl futures::Stream<Item = Result<SseEvent, Infallible>>> {
    let rx = state.hub.subscribe(execution_id).await;
    let stream = BroadcastStream::new(rx).filter_map(|item| async move {
        match item {
            Ok(event) => {
                let json = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
                Some(Ok(SseEvent::default().event(event.event_name()).data(json)))
            }
            Err(_) => None,
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[utoipa::path(
    get,
    path = "/workflows/{name}/status/{execution_id}",
    params(("detailed" = Option<bool>, Query)),
    responses((status = 200, body = RunResponse)),
    tag = "workflows"
)]
pub async fn execution_status<R: Repository>(
    State(state): State<AppState<R>>,
    Path((_name, execution_id)): Path<(String, Uuid)>,
    axum::extract::Query(query): axum::extract::Query<StatusQuery>,
) -> Result<Json<Value>, ApiError> {
    let execution = state.repo.load_execution(ExecutionId(execution_id)).await?;
    let mut body = serde_json::json!({
        "execution_id": execution.execution_id.0,
        "workflow_name": execution.workflow_name,
        "workflow_version": execution.workflow_version,
        "input": execution.input,
        "state": execution.state,
        "output": execution.output,
        "error": execution.error,
        "checkpoint_seq": execution.checkpoint_seq,
    });
    if query.detailed {
        body["events"] = serde_json::to_value(&execution.events).unwrap_or(Value::Null);
    }
    Ok(Json(body))
}

pub async fn cancel_execution<R: Repository>(
    State(state): State<AppState<R>>,
    Path((_name, execution_id)): Path<(String, Uuid)>,
    axum::extract::Query(query): axum::extract::Query<CancelQuery>,
) -> Result<Json<Value>, ApiError> {
    let execution_id = ExecutionId(execution_id);
    let execution = state.repo.load_execution(execution_id).await?;
    if !execution.state.cancellable() {
        return Err(ApiError::Conflict(format!("execution {execution_id} is not in a cancellable state")));
    }

    state
        .repo
        .append_events(execution_id, execution.checkpoint_seq, Vec::new(), ExecutionState::Cancelling)
        .await?;

    if let Some(worker) = &execution.current_worker {
        state
            .registry
            .send(worker, crate::registry::WorkerControlEvent::ExecutionCancelled { execution_id: execution_id.0 })
            .await;
    }

    if query.mode.as_deref() == Some("sync") {
        let mut rx = state.hub.subscribe(execution_id).await;
        loop {
            let execution = state.repo.load_execution(execution_id).await?;
            if execution.state == ExecutionState::Cancelled {
                return Ok(Json(serde_json::json!({ "state": execution.state })));
            }
            if tokio::time::timeout(Duration::from_secs(60), rx.recv()).await.is_err() {
                return Ok(Json(serde_json::json!({ "state": execution.state })));
            }
        }
    }

    let execution = state.repo.load_execution(execution_id).await?;
    Ok(Json(serde_json::json!({ "state": execution.state })))
}
