//! Error taxonomy shared across crates.
//!
//! Every public contract gets its own `thiserror` enum; this module only
//! holds the pieces common to all of them (the codec errors, and the
//! `ErrorKind` classification that lets HTTP handlers map any Flux error
//! to a status code without per-handler guesswork).

use thiserror::Error;

/// The taxonomy from the error handling design: transport/protocol,
/// conflict, workflow-user-error, timeout, cancellation, infrastructure,
/// programmer error. Every crate-local error type implements
/// `classify() -> ErrorKind` so callers at the HTTP boundary can map
/// uniformly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    TransportProtocol,
    Conflict,
    WorkflowUserError,
    Timeout,
    Cancellation,
    Infrastructure,
    ProgrammerError,
}

impl ErrorKind {
    /// Conventional HTTP status for this error kind. `WorkflowUserError`
    /// and `Timeout` outcomes are journaled, not transport failures, so
    /// they surface as `200` with an error field rather than a `5xx`.
    pub fn http_status(self) -> u16 {
        match self {
            ErrorKind::TransportProtocol => 400,
            ErrorKind::Conflict => 409,
            ErrorKind::WorkflowUserError => 200,
            ErrorKind::Timeout => 200,
            ErrorKind::Cancellation => 200,
            ErrorKind::Infrastructure => 503,
            ErrorKind::ProgrammerError => 422,
        }
    }
}

/// A value could not be encoded by a codec.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("value is not representable by this codec: {0}")]
    NotRepresentable(String),
    #[error("json encode failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("bincode encode failed: {0}")]
    Bincode(#[from] bincode::Error),
}

impl EncodeError {
    pub fn classify(&self) -> ErrorKind {
        ErrorKind::ProgrammerError
    }
}

/// Bytes could not be decoded, either because they are corrupt or the
/// wrong codec was used to read them.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("corrupt payload: {0}")]
    Corrupt(String),
    #[error("base64 decode failed: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("json decode failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("bincode decode failed: {0}")]
    Bincode(#[from] bincode::Error),
}

impl DecodeError {
    pub fn classify(&self) -> ErrorKind {
        ErrorKind::TransportProtocol
    }
}
