//! The execution record: identity, input/output, server-layered state,
//! and the checkpoint sequence used for optimistic concurrency.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::event::{Event, WireError};
use crate::ids::{ExecutionId, WorkerName};

/// Superset of the event-derived states (`Created`/`Running`/`Paused`/
/// terminal) and the server-layered transport states
/// (`Scheduled`/`Claimed`/`Cancelling`), matching spec.md §3/§4.8.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionState {
    Created,
    Scheduled,
    Claimed,
    Running,
    Paused,
    Cancelling,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionState {
    /// Terminal states are absorbing: once reached, no further events
    /// may be appended (P6).
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionState::Completed | ExecutionState::Failed | ExecutionState::Cancelled
        )
    }

    /// Cancellation is valid from any of these states (spec.md §4.8).
    pub fn cancellable(self) -> bool {
        matches!(
            self,
            ExecutionState::Scheduled
                | ExecutionState::Claimed
                | ExecutionState::Running
                | ExecutionState::Paused
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub execution_id: ExecutionId,
    pub workflow_name: String,
    pub workflow_version: u32,
    pub input: serde_json::Value,
    pub state: ExecutionState,
    pub current_worker: Option<WorkerName>,
    pub output: Option<serde_json::Value>,
    pub error: Option<WireError>,
    pub events: Vec<Event>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub checkpoint_seq: u64,
}

impl Execution {
    pub fn new(workflow_name: impl Into<String>, workflow_version: u32, input: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            execution_id: ExecutionId::new(),
            workflow_name: workflow_name.into(),
            workflow_version,
            input,
            state: ExecutionState::Created,
            current_worker: None,
            output: None,
            error: None,
            events: Vec::new(),
            created_at: now,
            updated_at: now,
        checkpoint_seq: 0,
        }
    }

    /// Derive the event-level state (`Created`/`Paused`/terminal/`Running`)
    /// from the event sequence alone, per spec.md §4.2's pure-function
    /// state derivation rule. This ignores the server-layered transport
    /// states; callers that need those consult `self.state` directly,
    /// which the execution manager keeps in sync with both this
    /// derivation and the dispatcher's transitions.
    pub fn derive_event_state(events: &[Event]) -> ExecutionState {
        use crate::event::EventKind::*;
        let last_workflow_event = events.iter().rev().find(|e| {
            matches!(
                e.kind,
                WorkflowStarted { .. }
                    | WorkflowCompleted { .. }
                    | WorkflowFailed { .. }
                    | WorkflowPaused { .. }
                    | WorkflowResumed { .. }
                    | WorkflowCancelled { .. }
            )
        });
        match last_workflow_event.map(|e| &e.kind) {
            None => ExecutionState::Created,
            Some(WorkflowPaused { .. }) => ExecutionState::Paused,
            Some(WorkflowCompleted { .. }) => ExecutionState::Completed,
            Some(WorkflowFailed { .. }) => ExecutionState::Failed,
            Some(WorkflowCancelled { .. }) => ExecutionState::Cancelled,
            Some(_) => ExecutionState::Running,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellable_states() {
        assert!(ExecutionState::Running.cancellable());
        assert!(ExecutionState::Paused.cancellable());
        assert!(!ExecutionState::Created.cancellable());
        assert!(!ExecutionState::Completed.cancellable());
    }

    #[test]
    fn terminal_states() {
        assert!(ExecutionState::Completed.is_terminal());
        assert!(!ExecutionState::Cancelling.is_terminal());
    }
}
