//! The append-only event log record type.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::ids::SourceId;

/// One append-only record in an execution's event log.
///
/// `source_id` identifies the emitting task-or-workflow instance and is
/// stable across replay (see [`crate::ids::ScopeCounter`]). `value` is
/// whatever payload the event kind carries, already encoded by the
/// configured codec so the log can be stored and transmitted uniformly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub seq: u64,
    pub source_id: SourceId,
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
}

/// Every event type an execution's log may contain. Tagged so the wire
/// form matches the `SCREAMING_SNAKE_CASE` names used throughout the
/// REST/SSE surface (`WORKFLOW_STARTED`, `TASK_RETRY_FAILED`, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    // Workflow lifecycle
    WorkflowStarted { input: serde_json::Value },
    WorkflowCompleted { output: serde_json::Value },
    WorkflowFailed { error: WireError },
    WorkflowPaused { name: String },
    WorkflowResumed { resume_input: serde_json::Value },
    WorkflowCancelled { reason: String },

    // Task lifecycle
    TaskStarted { attempt: u32 },
    TaskCompleted { output: serde_json::Value },
    TaskFailed { error: WireError, will_retry: bool },

    // Retry
    TaskRetryStarted { attempt: u32, delay_ms: u64 },
    TaskRetryCompleted { output: serde_json::Value },
    TaskRetryFailed { error: WireError, will_retry: bool },

    // Fallback
    TaskFallbackStarted,
    TaskFallbackCompleted { output: serde_json::Value },
    TaskFallbackFailed { error: WireError },

    // Rollback
    TaskRollbackStarted,
    TaskRollbackCompleted,
}

impl EventKind {
    /// Short name matching the REST/SSE wire tag, useful for logging
    /// without destructuring the whole variant.
    pub fn tag(&self) -> &'static str {
        match self {
            EventKind::WorkflowStarted { .. } => "WORKFLOW_STARTED",
            EventKind::WorkflowCompleted { .. } => "WORKFLOW_COMPLETED",
            EventKind::WorkflowFailed { .. } => "WORKFLOW_FAILED",
            EventKind::WorkflowPaused { .. } => "WORKFLOW_PAUSED",
            EventKind::WorkflowResumed { .. } => "WORKFLOW_RESUMED",
            EventKind::WorkflowCancelled { .. } => "WORKFLOW_CANCELLED",
            EventKind::TaskStarted { .. } => "TASK_STARTED",
            EventKind::TaskCompleted { .. } => "TASK_COMPLETED",
            EventKind::TaskFailed { .. } => "TASK_FAILED",
            EventKind::TaskRetryStarted { .. } => "TASK_RETRY_STARTED",
            EventKind::TaskRetryCompleted { .. } => "TASK_RETRY_COMPLETED",
            EventKind::TaskRetryFailed { .. } => "TASK_RETRY_FAILED",
            EventKind::TaskFallbackStarted => "TASK_FALLBACK_STARTED",
            EventKind::TaskFallbackCompleted { .. } => "TASK_FALLBACK_COMPLETED",
            EventKind::TaskFallbackFailed { .. } => "TASK_FALLBACK_FAILED",
            EventKind::TaskRollbackStarted => "TASK_ROLLBACK_STARTED",
            EventKind::TaskRollbackCompleted => "TASK_ROLLBACK_COMPLETED",
        }
    }

    /// Terminal workflow events absorb the execution: no further events
    /// may be appended after one of these (P6).
    pub fn is_workflow_terminal(&self) -> bool {
        matches!(
            self,
            EventKind::WorkflowCompleted { .. }
                | EventKind::WorkflowFailed { .. }
                | EventKind::WorkflowCancelled { .. }
        )
    }

    /// A terminal outcome for a single task's `source_id` (step 2 of the
    /// invocation algorithm scans for these). A `TaskFailed`/
    /// `TaskRetryFailed` with `will_retry == true` is not terminal — the
    /// attempt loop is still going to retry it, so a worker resuming
    /// mid-retry must not mistake it for the final outcome.
    pub fn is_task_terminal(&self) -> bool {
        match self {
            EventKind::TaskCompleted { .. }
            | EventKind::TaskRetryCompleted { .. }
            | EventKind::TaskFallbackCompleted { .. }
            | EventKind::TaskFallbackFailed { .. } => true,
            EventKind::TaskFailed { will_retry, .. } | EventKind::TaskRetryFailed { will_retry, .. } => !will_retry,
            _ => false,
        }
    }
}

/// Errors crossing the wire are encoded as `{kind, message, details}`
/// tuples, never as authoritative stack traces (design note in
/// spec.md §9).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct WireError {
    pub kind: String,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl WireError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for WireError {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn event_kind_serializes_with_screaming_snake_tag() {
        let kind = EventKind::WorkflowStarted {
            input: json!({"x": 1}),
        };
        let s = serde_json::to_string(&kind).unwrap();
        assert!(s.contains("\"type\":\"WORKFLOW_STARTED\""));
    }

    #[test]
    fn terminal_classification() {
        assert!(EventKind::WorkflowCompleted { output: json!(null) }.is_workflow_terminal());
        assert!(!EventKind::TaskStarted { attempt: 1 }.is_workflow_terminal());
        assert!(EventKind::TaskCompleted { output: json!(null) }.is_task_terminal());
        assert!(!EventKind::TaskRetryStarted { attempt: 1, delay_ms: 0 }.is_task_terminal());
    }

    #[test]
    fn a_retriable_failure_is_not_terminal_but_an_exhausted_one_is() {
        assert!(!EventKind::TaskFailed { error: WireError::new("IOError", "boom"), will_retry: true }.is_task_terminal());
        assert!(EventKind::TaskFailed { error: WireError::new("IOError", "boom"), will_retry: false }.is_task_terminal());
        assert!(!EventKind::TaskRetryFailed { error: WireError::new("IOError", "boom"), will_retry: true }.is_task_terminal());
        assert!(EventKind::TaskRetryFailed { error: WireError::new("IOError", "boom"), will_retry: false }.is_task_terminal());
        assert!(EventKind::TaskRetryCompleted { output: json!("ok") }.is_task_terminal());
    }
}
