//! Top-level API error: every handler error funnels through this so a
//! single `IntoResponse` impl maps the spec.md §7 taxonomy to HTTP
//! status uniformly, generalizing the teacher's habit of mapping
//! service errors to `StatusCode` by hand in each handler.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use flux_core::error::ErrorKind;
use flux_storage::error::StoreError;
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    fn classify(&self) -> ErrorKind {
        match self {
            ApiError::Store(e) => e.classify(),
            ApiError::NotFound(_) => ErrorKind::TransportProtocol,
            ApiError::Conflict(_) => ErrorKind::Conflict,
            ApiError::BadRequest(_) => ErrorKind::TransportProtocol,
            ApiError::Unauthorized => ErrorKind::TransportProtocol,
            ApiError::Internal(_) => ErrorKind::Infrastructure,
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            _ => StatusCode::from_u16(self.classify().http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        tracing::warn!(error = %self, status = %status, "request failed");
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
