//! Per-execution broadcast hub: fans out execution-state transitions
//! to any HTTP client subscribed to a streaming run or status feed
//! (spec.md §6.1's "streaming run response"). One `broadcast::Sender`
//! per `execution_id`, created lazily and dropped once the last
//! receiver disconnects — the same shape as the worker registry's
//! per-worker channel, just keyed by execution instead of by worker.

use std::collections::HashMap;
use std::sync::Arc;

use flux_core::execution::ExecutionState;
use flux_core::ids::ExecutionId;
use serde::Serialize;
use tokio::sync::{broadcast, RwLock};

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionStreamEvent {
    pub execution_id: ExecutionId,
    pub state: ExecutionState,
    pub output: Option<serde_json::Value>,
    pub error: Option<flux_core::event::WireError>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl ExecutionStreamEvent {
    /// SSE `event:` name for the streaming run response format (spec.md
    /// §6.1: `workflow.execution.{running,paused,completed,failed,cancelled}`).
    pub fn event_name(&self) -> &'static str {
        match self.state {
            ExecutionState::Running => "workflow.execution.running",
            ExecutionState::Paused => "workflow.execution.paused",
            ExecutionState::Completed => "workflow.execution.completed",
            ExecutionState::Failed => "workflow.execution.failed",
            ExecutionState::Cancelled => "workflow.execution.cancelled",
            _ => "workflow.execution.updated",
        }
    }
}

#[derive(Default)]
pub struct ExecutionHub {
    channels: RwLock<HashMap<ExecutionId, broadcast::Sender<ExecutionStreamEvent>>>,
}

impl ExecutionHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscribe(&self, id: ExecutionId) -> broadcast::Receiver<ExecutionStreamEvent> {
        let channels = self.channels.read().await;
        if let Some(tx) = channels.get(&id) {
            return tx.subscribe();
        }
        drop(channels);
        let mut channels = self.channels.write().await;
        let tx = channels
            .entry(id)
            .or_insert_with(|| broadcast::channel(64).0);
        tx.subscribe()
    }

    pub async fn publish(&self, event: ExecutionStreamEvent) {
        let channels = self.channels.read().await;
        if let Some(tx) = channels.get(&event.execution_id) {
            let _ = tx.send(event);
        }
    }

    /// Drop the channel for a terminal execution once clients have had
    /// a chance to observe the terminal frame.
    pub async fn retire(&self, id: ExecutionId) {
        self.channels.write().await.remove(&id);
    }
}

pub type SharedExecutionHub = Arc<ExecutionHub>;
