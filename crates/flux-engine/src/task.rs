//! Task definitions: a task is represented as a value (spec.md §9 — "no
//! dynamic wrapper; options are a struct"), not a decorated callable.
//! `TaskDef` carries a name, the body reference, and the full
//! §4.5.1 options table; invoking it goes through
//! [`crate::runtime::WorkflowContext::invoke`].

use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use flux_core::ids::{ExecutionId, SourceId};
use flux_core::workflow::{OutputStorageKind, WorkflowError};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// `(task_id, task_name, attempt, execution_id)` passed to the task
/// body when `metadata=true` (spec.md §4.5.3) — here always available,
/// since Rust's static typing makes an optional extra argument more
/// awkward than just always threading it through `TaskCall`.
#[derive(Debug, Clone)]
pub struct TaskMeta {
    pub task_id: SourceId,
    pub task_name: String,
    pub attempt: u32,
    pub execution_id: ExecutionId,
}

/// What a task body receives: its input, the invocation metadata, and
/// a cooperative cancellation flag it may poll for synchronous work
/// (spec.md §5 — "task bodies that do synchronous work are expected to
/// poll `ctx.is_cancelled()`").
pub struct TaskCall<In> {
    pub input: In,
    pub meta: TaskMeta,
    pub secrets: std::collections::BTreeMap<String, Vec<u8>>,
    cancelled: Arc<AtomicBool>,
}

impl<In> TaskCall<In> {
    pub fn new(
        input: In,
        meta: TaskMeta,
        secrets: std::collections::BTreeMap<String, Vec<u8>>,
        cancelled: Arc<AtomicBool>,
    ) -> Self {
        Self {
            input,
            meta,
            secrets,
            cancelled,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(std::sync::atomic::Ordering::Relaxed)
    }
}

pub type TaskBodyFn<In, Out> =
    Arc<dyn Fn(TaskCall<In>) -> BoxFuture<'static, Result<Out, WorkflowError>> + Send + Sync>;

/// The recognized per-task options (spec.md §4.5.1).
#[derive(Clone)]
pub struct TaskOptions {
    pub name: String,
    pub retry_max_attempts: u32,
    pub retry_delay: Duration,
    pub retry_backoff: f64,
    pub timeout: Option<Duration>,
    pub cache: bool,
    pub secret_requests: BTreeSet<String>,
    pub output_storage: OutputStorageKind,
    /// Jitter as a fraction of nominal delay, capped at 0.2 (spec.md
    /// §4.5.2 — "if added, must be ≤20% of nominal delay").
    pub jitter: f64,
}

impl TaskOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            retry_max_attempts: 0,
            retry_delay: Duration::ZERO,
            retry_backoff: 1.0,
            timeout: None,
            cache: false,
            secret_requests: BTreeSet::new(),
            output_storage: OutputStorageKind::Inline,
            jitter: 0.0,
        }
    }
}

/// A task as a value: name, body, optional fallback/rollback, and
/// options. `In`/`Out` must round-trip through the structured codec so
/// they can be journaled.
pub struct TaskDef<In, Out> {
    pub options: TaskOptions,
    pub(crate) body: TaskBodyFn<In, Out>,
    pub(crate) fallback: Option<TaskBodyFn<In, Out>>,
    pub(crate) rollback: Option<TaskBodyFn<In, ()>>,
}

impl<In, Out> TaskDef<In, Out>
where
    In: Clone + Send + Sync + 'static,
    Out: Clone + Send + Sync + 'static,
{
    pub fn new<F, Fut>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(TaskCall<In>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Out, WorkflowError>> + Send + 'static,
    {
        Self {
            options: TaskOptions::new(name),
            body: Arc::new(move |call| Box::pin(body(call))),
            fallback: None,
            rollback: None,
        }
    }

    pub fn retry(mut self, max_attempts: u32, delay: Duration, backoff: f64) -> Self {
        self.options.retry_max_attempts = max_attempts;
        self.options.retry_delay = delay;
        self.options.retry_backoff = backoff;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = Some(timeout);
        self
    }

    pub fn jitter(mut self, fraction: f64) -> Self {
        self.options.jitter = fraction.clamp(0.0, 0.2);
        self
    }

    pub fn cache(mut self, cache: bool) -> Self {
        self.options.cache = cache;
        self
    }

    pub fn secrets(mut self, names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.options.secret_requests = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn output_storage(mut self, kind: OutputStorageKind) -> Self {
        self.options.output_storage = kind;
        self
    }

    pub fn fallback<F, Fut>(mut self, fallback: F) -> Self
    where
        F: Fn(TaskCall<In>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Out, WorkflowError>> + Send + 'static,
    {
        self.fallback = Some(Arc::new(move |call| Box::pin(fallback(call))));
        self
    }

    pub fn rollback<F, Fut>(mut self, rollback: F) -> Self
    where
        F: Fn(TaskCall<In>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), WorkflowError>> + Send + 'static,
    {
        self.rollback = Some(Arc::new(move |call| Box::pin(rollback(call))));
        self
    }
}

/// Retry delay for attempt `k` (0-indexed among retries): `retry_delay
/// × retry_backoff^k`, jitter applied afterward and capped at ≤20% of
/// the nominal value (spec.md §4.5.2).
pub fn retry_delay_for(options: &TaskOptions, k: u32) -> Duration {
    let nominal = options.retry_delay.as_secs_f64() * options.retry_backoff.powi(k as i32);
    if options.jitter <= 0.0 {
        return Duration::from_secs_f64(nominal.max(0.0));
    }
    let mut rng = rand::thread_rng();
    use rand::Rng;
    let spread = nominal * options.jitter;
    let offset = rng.gen_range(-spread..=spread);
    Duration::from_secs_f64((nominal + offset).max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_geometric_growth_without_jitter() {
        let opts = TaskOptions {
            retry_delay: Duration::from_secs(1),
            retry_backoff: 2.0,
            jitter: 0.0,
            ..TaskOptions::new("t")
        };
        assert_eq!(retry_delay_for(&opts, 0), Duration::from_secs(1));
        assert_eq!(retry_delay_for(&opts, 1), Duration::from_secs(2));
        assert_eq!(retry_delay_for(&opts, 2), Duration::from_secs(4));
    }

    #[test]
    fn jitter_stays_within_twenty_percent() {
        let opts = TaskOptions {
            retry_delay: Duration::from_secs(10),
            retry_backoff: 1.0,
            jitter: 0.2,
            ..TaskOptions::new("t")
        };
        for _ in 0..100 {
            let d = retry_delay_for(&opts, 0).as_secs_f64();
            assert!((8.0..=12.0).contains(&d), "delay {d} outside ±20% of 10s");
        }
    }
}
