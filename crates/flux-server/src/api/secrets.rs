//! Admin secrets CRUD (spec.md §6.1: `GET/POST/DELETE /admin/secrets[/name]`),
//! a thin HTTP skin over [`flux_storage::vault::SecretsVault`]. Requires
//! the vault to be configured; if `FLUX_SECURITY__ENCRYPTION_KEY` was
//! never set, every route here returns `503` rather than silently
//! storing plaintext.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use flux_storage::repository::Repository;
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::state::AppState;

pub fn routes<R: Repository>(state: AppState<R>) -> Router {
    Router::new()
        .route("/admin/secrets", get(list_secrets::<R>).post(set_secret::<R>))
        .route("/admin/secrets/:name", delete(remove_secret::<R>))
        .with_state(state)
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct SecretNames {
    pub names: Vec<String>,
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct SetSecretRequest {
    pub name: String,
    pub value: String,
}

fn vault_unconfigured() -> ApiError {
    ApiError::Internal("secrets vault not configured: set FLUX_SECURITY__ENCRYPTION_KEY".into())
}

/// GET /admin/secrets — names only, never values (spec.md §4.4).
pub async fn list_secrets<R: Repository>(State(state): State<AppState<R>>) -> Result<Json<SecretNames>, ApiError> {
    let vault = state.vault.as_ref().ok_or_else(vault_unconfigured)?;
    let names = vault.list().await.map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(SecretNames { names }))
}

/// POST /admin/secrets — set (or overwrite) a named secret.
pub async fn set_secret<R: Repository>(
    State(state): State<AppState<R>>,
    Json(req): Json<SetSecretRequest>,
) -> Result<StatusCode, ApiError> {
    let vault = state.vault.as_ref().ok_or_else(vault_unconfigured)?;
    vault
        .set(&req.name, req.value.as_bytes())
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(StatusCode::OK)
}

/// DELETE /admin/secrets/{name}
pub async fn remove_secret<R: Repository>(
    State(state): State<AppState<R>>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    let vault = state.vault.as_ref().ok_or_else(vault_unconfigured)?;
    vault.remove(&name).await.map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(StatusCode::OK)
}
