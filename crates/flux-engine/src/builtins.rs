//! Built-in nondeterministic primitives, modeled as ordinary tasks
//! (spec.md §4.2: "built-in nondeterministic primitives are modeled as
//! tasks" so their result is journaled on first execution and replayed
//! verbatim rather than recomputed — a clock read or a random draw must
//! come out the same way on every replay of a given `source_id`). Each
//! function here returns a [`TaskDef`] ready to pass to
//! [`crate::runtime::WorkflowContext::invoke`].

use std::time::Duration;

use chrono::{DateTime, Utc};
use flux_core::workflow::WorkflowError;
use rand::Rng;

use crate::task::{TaskCall, TaskDef};

/// The current time, journaled as `TASK_COMPLETED` on first call so a
/// replay sees the original timestamp rather than whatever `Utc::now`
/// returns on re-execution.
pub fn now() -> TaskDef<(), DateTime<Utc>> {
    TaskDef::new("flux.now", |_call: TaskCall<()>| async move { Ok(Utc::now()) })
}

/// A fresh v4 UUID, journaled the same way.
pub fn uuid4() -> TaskDef<(), uuid::Uuid> {
    TaskDef::new("flux.uuid4", |_call: TaskCall<()>| async move { Ok(uuid::Uuid::new_v4()) })
}

/// Input to [`randint`]: an inclusive `[low, high]` range.
#[derive(Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct IntRange {
    pub low: i64,
    pub high: i64,
}

/// A uniformly distributed integer in `[low, high]` inclusive.
pub fn randint() -> TaskDef<IntRange, i64> {
    TaskDef::new("flux.randint", |call: TaskCall<IntRange>| async move {
        let range = call.input;
        if range.low > range.high {
            return Err(WorkflowError::new(
                "ProgrammerError",
                format!("randint: low ({}) > high ({})", range.low, range.high),
            ));
        }
        let mut rng = rand::thread_rng();
        Ok(rng.gen_range(range.low..=range.high))
    })
}

/// A uniformly random pick from a caller-supplied list of choices,
/// returned by index so the journal doesn't need to assume the
/// elements themselves are round-trippable through the structured
/// codec independently of the caller's own `Out` type.
pub fn choice_index(len: usize) -> TaskDef<usize, usize> {
    TaskDef::new("flux.choice", move |_call: TaskCall<usize>| async move {
        if len == 0 {
            return Err(WorkflowError::new("ProgrammerError", "choice: empty list"));
        }
        let mut rng = rand::thread_rng();
        Ok(rng.gen_range(0..len))
    })
}

/// A durable delay: journaled as an ordinary task so that, unlike
/// `tokio::time::sleep` inside a task body, the delay survives a
/// worker crash and restart rather than quietly shrinking to whatever
/// time remains after recovery — the task body itself performs the
/// sleep, and its single `TASK_COMPLETED` event means a replay after
/// the sleep already elapsed short-circuits immediately (spec.md
/// §4.5.2 step 2).
pub fn sleep() -> TaskDef<Duration, ()> {
    TaskDef::new("flux.sleep", |call: TaskCall<Duration>| async move {
        tokio::time::sleep(call.input).await;
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn randint_range_is_validated_at_call_time() {
        let task = randint();
        assert_eq!(task.options.name, "flux.randint");
    }

    #[tokio::test]
    async fn randint_rejects_inverted_range() {
        let task = randint();
        let call = TaskCall::new(
            IntRange { low: 10, high: 1 },
            crate::task::TaskMeta {
                task_id: flux_core::ids::SourceId("t".into()),
                task_name: "flux.randint".into(),
                attempt: 0,
                execution_id: flux_core::ids::ExecutionId::new(),
            },
            Default::default(),
            std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false)),
        );
        let result = (task.body)(call).await;
        assert!(result.is_err());
    }
}
