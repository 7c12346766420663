pub mod run;
pub mod secrets;
pub mod status;
pub mod workflows;

/// Sentinel error distinguishing "the execution itself ended in
/// `FAILED`/`CANCELLED`" (exit code `1`) from every other CLI failure
/// (exit code `2`).
#[derive(Debug, thiserror::Error)]
#[error("execution did not complete: {0}")]
pub struct ExecutionFailed(pub String);
