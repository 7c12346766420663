use flux_core::error::ErrorKind;
use thiserror::Error;

/// Failure modes of the repository (spec.md §4.3): not found, a stale
/// `checkpoint_seq` CAS, or a transient backend outage.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: stale checkpoint_seq (expected {expected}, found {found})")]
    Conflict { expected: u64, found: u64 },

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl StoreError {
    pub fn classify(&self) -> ErrorKind {
        match self {
            StoreError::NotFound(_) => ErrorKind::TransportProtocol,
            StoreError::Conflict { .. } => ErrorKind::Conflict,
            StoreError::Unavailable(_) | StoreError::Sqlx(_) => ErrorKind::Infrastructure,
            StoreError::Serde(_) => ErrorKind::ProgrammerError,
        }
    }
}
