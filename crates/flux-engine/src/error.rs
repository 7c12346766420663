//! Error types for the task and workflow runtimes (spec.md §4.5, §4.6,
//! §7). Both runtimes surface the user's own errors as
//! [`flux_core::workflow::WorkflowError`]; these enums wrap that plus
//! the engine's own failure modes (storage, encoding, checkpointing).

use flux_core::error::{DecodeError, EncodeError, ErrorKind};
use flux_core::workflow::WorkflowError;
use flux_storage::error::StoreError;

/// Failure of a single checkpoint append (event persistence).
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("checkpoint rejected: stale checkpoint_seq (expected {expected}, found {found})")]
    Stale { expected: u64, found: u64 },
    #[error("cannot append past a terminal execution state")]
    Terminal,
}

impl CheckpointError {
    pub fn classify(&self) -> ErrorKind {
        match self {
            CheckpointError::Store(e) => e.classify(),
            CheckpointError::Stale { .. } => ErrorKind::Conflict,
            CheckpointError::Terminal => ErrorKind::ProgrammerError,
        }
    }
}

/// Failure modes of a task invocation (spec.md §4.5.2, §7).
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    /// The task body (after exhausting retry and fallback) raised this
    /// error; it is re-raised to the workflow body via `?`.
    #[error("task failed: {0}")]
    Failed(WorkflowError),
    /// A per-attempt deadline elapsed and no fallback saved it.
    #[error("task timed out")]
    TimedOut,
    /// Cancellation was observed mid-attempt; not a retryable failure.
    #[error("task cancelled")]
    Cancelled,
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl TaskError {
    pub fn classify(&self) -> ErrorKind {
        match self {
            TaskError::Failed(_) => ErrorKind::WorkflowUserError,
            TaskError::TimedOut => ErrorKind::Timeout,
            TaskError::Cancelled => ErrorKind::Cancellation,
            TaskError::Checkpoint(e) => e.classify(),
            TaskError::Encode(_) | TaskError::Decode(_) => ErrorKind::ProgrammerError,
            TaskError::Store(e) => e.classify(),
        }
    }

    /// The error a workflow body sees when it re-raises via `?` — the
    /// wrapped user error, or a synthesized one for engine-level
    /// failures so callers always get a `WorkflowError` at the call
    /// site, matching the task body's own return type.
    pub fn into_workflow_error(self) -> WorkflowError {
        match self {
            TaskError::Failed(e) => e,
            TaskError::TimedOut => WorkflowError::new("Timeout", "task timed out"),
            TaskError::Cancelled => WorkflowError::new("Cancelled", "task was cancelled"),
            other => WorkflowError::new("Infrastructure", other.to_string()),
        }
    }
}

/// Outcome of driving a workflow body to a resting point (spec.md
/// §4.6): the body either returns, raises a user error, pauses, or
/// observes cancellation. Modeled as a dedicated `Result`-like enum
/// rather than overloading `WorkflowError`, since "pause" and
/// "cancelled" are control-flow signals, not failures — idiomatic Rust
/// expresses the spec's "raise a control-flow signal that unwinds to
/// the runtime" as a distinct `Err` variant threaded through `?`.
#[derive(Debug, thiserror::Error)]
pub enum Suspend {
    #[error("paused at {0}")]
    Paused(String),
    #[error("cancelled")]
    Cancelled,
}

/// The error type a workflow body's `run` returns: either the user's
/// own [`WorkflowError`] (propagated with `?` from a failed task) or a
/// [`Suspend`] signal from `ctx.pause()` / cooperative cancellation
/// checks, both convertible with `?` via `From`.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowOutcome {
    #[error(transparent)]
    Failed(#[from] WorkflowError),
    #[error(transparent)]
    Suspend(#[from] Suspend),
}

impl From<TaskError> for WorkflowOutcome {
    fn from(err: TaskError) -> Self {
        match err {
            TaskError::Cancelled => WorkflowOutcome::Suspend(Suspend::Cancelled),
            other => WorkflowOutcome::Failed(other.into_workflow_error()),
        }
    }
}

/// Failure of building or running a [`crate::compose::Graph`]
/// (spec.md §4.5.4): cycles and unreachable ends are programmer
/// errors, caught at construction, not invocation.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("graph contains a cycle")]
    Cycle,
    #[error("unknown node: {0}")]
    UnknownNode(String),
    #[error("node {0} is unreachable from any entry point")]
    Unreachable(String),
    #[error(transparent)]
    Task(#[from] TaskError),
}

impl GraphError {
    pub fn classify(&self) -> ErrorKind {
        match self {
            GraphError::Cycle | GraphError::UnknownNode(_) | GraphError::Unreachable(_) => {
                ErrorKind::ProgrammerError
            }
            GraphError::Task(e) => e.classify(),
        }
    }
}

/// Top-level failure of driving a registered workflow through
/// [`crate::workflow::WorkflowRuntime::run`] — distinct from
/// [`WorkflowOutcome`], which is what the *body* returns; this is what
/// the runtime itself can fail with (checkpointing, registry lookup).
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error("workflow already in a terminal state")]
    AlreadyTerminal,
}

impl RuntimeError {
    pub fn classify(&self) -> ErrorKind {
        match self {
            RuntimeError::Checkpoint(e) => e.classify(),
            RuntimeError::Store(e) => e.classify(),
            RuntimeError::Encode(_) => ErrorKind::ProgrammerError,
            RuntimeError::AlreadyTerminal => ErrorKind::ProgrammerError,
        }
    }
}
