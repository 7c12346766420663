//! The execution context: an in-memory projection of one execution's
//! event log plus the mutation primitives spec.md §4.2 defines
//! (`start`, `complete`, `fail`, `pause`, `resume`, `cancel`,
//! `add_event`). Every mutation appends exactly the event(s) the
//! algorithm calls for and funnels through a checkpoint callback
//! supplied by the worker — the engine never talks to storage
//! directly (spec.md §4.6's inversion-of-control note).

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use flux_core::event::{Event, EventKind, WireError};
use flux_core::execution::ExecutionState;
use flux_core::ids::{ExecutionId, SourceId};

use crate::error::CheckpointError;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Called with each newly appended event; persists it durably and
/// updates the execution record before returning. The workflow/task
/// runtimes never proceed past a mutation until this resolves, so a
/// worker crash loses at most the in-flight attempt that hadn't yet
/// called this (spec.md §5's durability-before-ack guarantee).
pub type CheckpointFn = Arc<dyn Fn(Event) -> BoxFuture<'static, Result<(), CheckpointError>> + Send + Sync>;

/// In-memory projection of one execution's event log (spec.md §4.2).
pub struct ExecutionContext {
    pub execution_id: ExecutionId,
    pub input: serde_json::Value,
    events: Vec<Event>,
    checkpoint: CheckpointFn,
    cancelled: Arc<AtomicBool>,
}

impl ExecutionContext {
    /// Fresh context for a brand-new execution (no prior events).
    pub fn new(execution_id: ExecutionId, input: serde_json::Value, checkpoint: CheckpointFn) -> Self {
        Self {
            execution_id,
            input,
            events: Vec::new(),
            checkpoint,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Resume a context from a previously-persisted event log; does
    /// not re-invoke the checkpoint callback for existing events.
    pub fn from_events(
        execution_id: ExecutionId,
        input: serde_json::Value,
        events: Vec<Event>,
        checkpoint: CheckpointFn,
    ) -> Self {
        Self {
            execution_id,
            input,
            events,
            checkpoint,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn next_seq(&self) -> u64 {
        self.events.len() as u64
    }

    /// State is a pure function of the event sequence (spec.md §4.2).
    pub fn state(&self) -> ExecutionState {
        flux_core::execution::Execution::derive_event_state(&self.events)
    }

    pub fn has_started(&self) -> bool {
        !self.events.is_empty()
    }

    pub fn has_finished(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn has_succeeded(&self) -> bool {
        matches!(self.state(), ExecutionState::Completed)
    }

    pub fn has_failed(&self) -> bool {
        matches!(self.state(), ExecutionState::Failed)
    }

    pub fn is_paused(&self) -> bool {
        matches!(self.state(), ExecutionState::Paused)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.state(), ExecutionState::Cancelled)
    }

    /// Cooperative cancellation flag set by the worker when it
    /// receives `ExecutionCancelled` (spec.md §4.7, §5); checked at
    /// every suspension point, not polled against storage.
    pub fn cancellation_requested(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub fn cancellation_flag(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }

    pub fn request_cancellation(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    /// The single mutation primitive every higher-level operation below
    /// funnels through (spec.md §4.2): builds the event with the next
    /// sequence number, appends it in memory, then durably persists it
    /// before returning. P6 (terminal absorbing) is enforced here.
    pub async fn add_event(
        &mut self,
        source_id: SourceId,
        name: impl Into<String>,
        kind: EventKind,
    ) -> Result<&Event, CheckpointError> {
        if self.has_finished() {
            return Err(CheckpointError::Terminal);
        }
        let event = Event {
            seq: self.next_seq(),
            source_id,
            name: name.into(),
            timestamp: Utc::now(),
            kind,
        };
        (self.checkpoint)(event.clone()).await?;
        self.events.push(event);
        Ok(self.events.last().expect("just pushed"))
    }

    pub async fn start(&mut self, workflow_source: SourceId, input: serde_json::Value) -> Result<(), CheckpointError> {
        if self.has_started() {
            return Ok(());
        }
        self.add_event(workflow_source, "workflow", EventKind::WorkflowStarted { input })
            .await?;
        Ok(())
    }

    pub async fn complete(
        &mut self,
        workflow_source: SourceId,
        output: serde_json::Value,
    ) -> Result<(), CheckpointError> {
        self.add_event(workflow_source, "workflow", EventKind::WorkflowCompleted { output })
            .await?;
        Ok(())
    }

    pub async fn fail(&mut self, workflow_source: SourceId, error: WireError) -> Result<(), CheckpointError> {
        self.add_event(workflow_source, "workflow", EventKind::WorkflowFailed { error })
            .await?;
        Ok(())
    }

    pub async fn pause(&mut self, workflow_source: SourceId, name: String) -> Result<(), CheckpointError> {
        self.add_event(workflow_source, "workflow", EventKind::WorkflowPaused { name })
            .await?;
        Ok(())
    }

    pub async fn resume(
        &mut self,
        workflow_source: SourceId,
        resume_input: serde_json::Value,
    ) -> Result<(), CheckpointError> {
        self.add_event(
            workflow_source,
            "workflow",
            EventKind::WorkflowResumed { resume_input },
        )
        .await?;
        Ok(())
    }

    pub async fn cancel(&mut self, workflow_source: SourceId, reason: String) -> Result<(), CheckpointError> {
        self.add_event(workflow_source, "workflow", EventKind::WorkflowCancelled { reason })
            .await?;
        Ok(())
    }

    /// `true` if a `WORKFLOW_PAUSED` with the given name has no later
    /// `WORKFLOW_RESUMED` — used by `ctx.pause()` to decide whether a
    /// prior pause has already been resumed during this replay (P7).
    pub fn resume_input_for(&self, name: &str) -> Option<serde_json::Value> {
        let paused_at = self.events.iter().rposition(|e| {
            matches!(&e.kind, EventKind::WorkflowPaused { name: n } if n == name)
        })?;
        self.events[paused_at + 1..].iter().find_map(|e| match &e.kind {
            EventKind::WorkflowResumed { resume_input } => Some(resume_input.clone()),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flux_core::ids::SourceId;
    use serde_json::json;

    fn noop_checkpoint() -> CheckpointFn {
        Arc::new(|_event| Box::pin(async { Ok(()) }))
    }

    #[tokio::test]
    async fn monotonic_contiguous_sequence_numbers() {
        let mut ctx = ExecutionContext::new(ExecutionId::new(), json!("x"), noop_checkpoint());
        ctx.start(SourceId("wf".into()), json!("x")).await.unwrap();
        ctx.add_event(SourceId("t1".into()), "t1", EventKind::TaskStarted { attempt: 0 })
            .await
            .unwrap();
        ctx.complete(SourceId("wf".into()), json!("done")).await.unwrap();

        let seqs: Vec<u64> = ctx.events().iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn terminal_state_rejects_further_events() {
        let mut ctx = ExecutionContext::new(ExecutionId::new(), json!(null), noop_checkpoint());
        ctx.start(SourceId("wf".into()), json!(null)).await.unwrap();
        ctx.complete(SourceId("wf".into()), json!("done")).await.unwrap();

        let err = ctx
            .add_event(SourceId("t1".into()), "t1", EventKind::TaskStarted { attempt: 0 })
            .await
            .unwrap_err();
        assert!(matches!(err, CheckpointError::Terminal));
    }

    #[tokio::test]
    async fn state_derivation_tracks_pause_and_resume() {
        let mut ctx = ExecutionContext::new(ExecutionId::new(), json!(null), noop_checkpoint());
        ctx.start(SourceId("wf".into()), json!(null)).await.unwrap();
        assert_eq!(ctx.state(), ExecutionState::Running);

        ctx.pause(SourceId("wf".into()), "manual".into()).await.unwrap();
        assert!(ctx.is_paused());
        assert!(ctx.resume_input_for("manual").is_none());

        ctx.resume(SourceId("wf".into()), json!(42)).await.unwrap();
        assert_eq!(ctx.state(), ExecutionState::Running);
        assert_eq!(ctx.resume_input_for("manual"), Some(json!(42)));
    }
}
