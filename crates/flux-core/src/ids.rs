//! Identity newtypes and the scope counter that derives stable
//! `source_id`s for task invocations.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionId(pub Uuid);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerName(pub String);

impl fmt::Display for WorkerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable identifier for an invocation site: a function of lexical
/// position (`scope`/`call_site`) and sibling index, identical across
/// replays because the index only advances when a task is actually
/// invoked.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceId(pub String);

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hands out `source_id`s for one lexical scope (a workflow body, or a
/// nested `parallel`/`map` block). A fresh counter is created whenever
/// the runtime enters such a scope; it is never shared across scopes,
/// and it increments only on actual invocation, so replay reproduces
/// identical ids as long as the workflow body is deterministic about
/// which call sites it reaches.
#[derive(Debug)]
pub struct ScopeCounter {
    scope: String,
    next: AtomicU64,
}

impl ScopeCounter {
    pub fn new(scope: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            next: AtomicU64::new(0),
        }
    }

    /// Allocate the next `source_id` for `call_site` within this scope.
    pub fn next_id(&self, call_site: &str) -> SourceId {
        let i = self.next.fetch_add(1, Ordering::SeqCst);
        SourceId(format!("{}/{}#{}", self.scope, call_site, i))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_counter_increments_only_on_call() {
        let counter = ScopeCounter::new("wf:hello_world@1");
        let a = counter.next_id("say_hello");
        let b = counter.next_id("say_hello");
        assert_ne!(a, b);
        assert_eq!(a.0, "wf:hello_world@1/say_hello#0");
        assert_eq!(b.0, "wf:hello_world@1/say_hello#1");
    }
}
