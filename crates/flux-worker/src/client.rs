//! `ServerClient`: the worker's HTTP view of the control plane —
//! register, claim, checkpoint, and the detailed status fetch used
//! after a successful claim (spec.md §4.7, §6.1). Generalized from the
//! teacher's `everruns-worker::client` (a reqwest-based wrapper with
//! reconnect) from a Temporal gateway to flux-server's REST surface.

use std::sync::Arc;

use flux_core::event::Event;
use flux_core::ids::{ExecutionId, WorkerName};
use flux_core::workflow::WorkerResources;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Control-plane events delivered on `/workers/{name}/connect`,
/// mirroring the wire shape of `flux_server::registry::WorkerControlEvent`
/// without a crate dependency on the server binary.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ControlEvent {
    ExecutionScheduled { execution_id: Uuid, workflow_name: String, workflow_version: u32 },
    ExecutionResumed { execution_id: Uuid, resume_input: Value },
    ExecutionCancelled { execution_id: Uuid },
}

/// The detailed execution snapshot returned by
/// `GET /workflows/{name}/status/{execution_id}?detailed=true`, enough
/// to reconstruct an `ExecutionContext` and drive it (spec.md §4.7
/// step 4).
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionSnapshot {
    pub execution_id: Uuid,
    pub workflow_name: String,
    pub workflow_version: u32,
    pub input: Value,
    pub state: flux_core::execution::ExecutionState,
    pub checkpoint_seq: u64,
    #[serde(default)]
    pub events: Vec<Event>,
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("unauthorized: session token rejected")]
    Unauthorized,
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("server error ({status}): {body}")]
    Server { status: u16, body: String },
}

#[derive(Serialize)]
struct RegisterRequest {
    name: String,
    resources: WorkerResources,
}

#[derive(Deserialize)]
struct RegisterResponse {
    session_token: String,
}

#[derive(Serialize)]
struct CheckpointRequest<'a> {
    checkpoint_seq: u64,
    events: &'a [Event],
}

/// Thin reqwest wrapper over flux-server's REST surface, holding the
/// base URL and (once bootstrapped) the session token it presents as a
/// bearer credential on every subsequent call. The token lives behind
/// an `Arc<Mutex<_>>` so clones handed to concurrently-spawned
/// execution tasks all see a re-registration performed by the
/// reconnect loop (`connect::subscribe`) without re-authenticating
/// themselves.
#[derive(Clone)]
pub struct ServerClient {
    http: reqwest::Client,
    base_url: String,
    name: WorkerName,
    session_token: Arc<Mutex<Option<String>>>,
}

impl ServerClient {
    pub fn new(base_url: impl Into<String>, name: WorkerName) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            name,
            session_token: Arc::new(Mutex::new(None)),
        }
    }

    pub async fn has_session(&self) -> bool {
        self.session_token.lock().await.is_some()
    }

    /// Drop the current session token so the reconnect loop
    /// re-registers on its next iteration (spec.md §4.7 step 6).
    pub async fn forget_session(&self) {
        *self.session_token.lock().await = None;
    }

    fn url(&self, path: impl std::fmt::Display) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, ClientError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(ClientError::Unauthorized);
        }
        let body = resp.text().await.unwrap_or_default();
        if status == reqwest::StatusCode::CONFLICT {
            return Err(ClientError::Conflict(body));
        }
        Err(ClientError::Server { status: status.as_u16(), body })
    }

    /// POST /workers/register (spec.md §4.7 step 1). Stores the
    /// returned session token for subsequent calls.
    pub async fn register(&self, bootstrap_token: &str, resources: WorkerResources) -> Result<(), ClientError> {
        let resp = self
            .http
            .post(self.url("/workers/register"))
            .bearer_auth(bootstrap_token)
            .json(&RegisterRequest { name: self.name.0.clone(), resources })
            .send()
            .await?;
        let resp = Self::check_status(resp).await?;
        let body: RegisterResponse = resp.json().await?;
        *self.session_token.lock().await = Some(body.session_token);
        Ok(())
    }

    async fn session_token_or_err(&self) -> Result<String, ClientError> {
        self.session_token.lock().await.clone().ok_or(ClientError::Unauthorized)
    }

    /// Open the raw byte stream backing `/workers/{name}/connect`; the
    /// `connect` module turns this into a reconnecting `ControlEvent`
    /// stream.
    pub async fn connect_stream(&self) -> Result<reqwest::Response, ClientError> {
        let token = self.session_token_or_err().await?;
        let resp = self
            .http
            .get(self.url(format!("/workers/{}/connect", self.name)))
            .bearer_auth(token)
            .send()
            .await?;
        Self::check_status(resp).await
    }

    /// POST /workers/{name}/claim/{execution_id} (spec.md §4.7 step 3).
    pub async fn claim(&self, execution_id: ExecutionId) -> Result<(), ClientError> {
        let token = self.session_token_or_err().await?;
        let resp = self
            .http
            .post(self.url(format!("/workers/{}/claim/{}", self.name, execution_id.0)))
            .bearer_auth(token)
            .send()
            .await?;
        Self::check_status(resp).await.map(|_| ())
    }

    /// GET /workflows/{name}/status/{execution_id}?detailed=true — the
    /// full snapshot needed to rebuild the execution context after a
    /// winning claim.
    pub async fn fetch_execution(&self, workflow_name: &str, execution_id: ExecutionId) -> Result<ExecutionSnapshot, ClientError> {
        let resp = self
            .http
            .get(self.url(format!("/workflows/{workflow_name}/status/{}", execution_id.0)))
            .query(&[("detailed", "true")])
            .send()
            .await?;
        let resp = Self::check_status(resp).await?;
        Ok(resp.json().await?)
    }

    /// POST /workers/{name}/checkpoint/{execution_id} (spec.md §4.7 step
    /// 4). The server rejects a stale `checkpoint_seq` with `409`,
    /// which surfaces as `ClientError::Conflict`.
    pub async fn checkpoint(&self, execution_id: ExecutionId, checkpoint_seq: u64, events: &[Event]) -> Result<(), ClientError> {
        let token = self.session_token_or_err().await?;
        let resp = self
            .http
            .post(self.url(format!("/workers/{}/checkpoint/{}", self.name, execution_id.0)))
            .bearer_auth(token)
            .json(&CheckpointRequest { checkpoint_seq, events })
            .send()
            .await?;
        Self::check_status(resp).await.map(|_| ())
    }
}
