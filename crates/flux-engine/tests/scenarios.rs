//! The six literal end-to-end scenarios from spec.md §8, plus focused
//! property tests for P2 (deterministic replay), P3 (at-most-once task
//! execution), and P5 (cache idempotence) that aren't already covered
//! by the unit tests inside `flux-engine::context`/`flux-storage::memory`.
//! Everything here runs against `InMemoryRepository`, matching the
//! teacher's preference for exercising its durable-execution engine
//! without a live Postgres (see `everruns-durable`'s in-memory test
//! fixtures).

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use flux_core::event::{Event, EventKind};
use flux_core::ids::{ExecutionId, SourceId};
use flux_core::workflow::WorkflowError;
use flux_engine::context::{BoxFuture, CheckpointFn, ExecutionContext};
use flux_engine::error::{CheckpointError, WorkflowOutcome};
use flux_engine::prelude::*;
use flux_storage::memory::InMemoryRepository;
use serde_json::json;
use tokio::sync::Mutex;

/// A checkpoint callback that records every event appended during this
/// run instead of persisting anywhere durable, so tests can assert on
/// exact emitted sequences (same helper shape as the unit tests in
/// `flux_engine::workflow`).
fn tracking_checkpoint() -> (CheckpointFn, Arc<Mutex<Vec<Event>>>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let checkpoint = {
        let events = events.clone();
        Arc::new(move |event: Event| {
            let events = events.clone();
            Box::pin(async move {
                events.lock().await.push(event);
                Ok(())
            }) as BoxFuture<'static, Result<(), CheckpointError>>
        })
    };
    (checkpoint, events)
}

async fn tags(events: &Arc<Mutex<Vec<Event>>>) -> Vec<&'static str> {
    events.lock().await.iter().map(|e| e.kind.tag()).collect()
}

// ---------------------------------------------------------------------
// Scenario 1: hello world, sync.
// ---------------------------------------------------------------------

struct HelloWorld;

#[async_trait]
impl Workflow<InMemoryRepository> for HelloWorld {
    type Input = String;
    type Output = String;
    const NAME: &'static str = "hello_world";
    const VERSION: u32 = 1;

    async fn run(&self, ctx: &WorkflowContext<InMemoryRepository>, input: Self::Input) -> Result<Self::Output, WorkflowOutcome> {
        let say_hello = TaskDef::new("say_hello", |call: TaskCall<String>| async move { Ok::<_, WorkflowError>(format!("Hello, {}", call.input)) });
        Ok(ctx.invoke(&say_hello, input).await?)
    }
}

#[tokio::test]
async fn scenario_1_hello_world_sync() {
    let repo = Arc::new(InMemoryRepository::new());
    let execution_id = ExecutionId::new();
    let (checkpoint, events) = tracking_checkpoint();
    let exec = Arc::new(Mutex::new(ExecutionContext::new(execution_id, json!("World"), checkpoint)));

    let outcome = WorkflowRuntime::run(&HelloWorld, execution_id, json!("World"), repo, None, exec).await.unwrap();

    match outcome {
        RunOutcome::Completed(output) => assert_eq!(output, "Hello, World"),
        _ => panic!("expected completion"),
    }
    assert_eq!(
        tags(&events).await,
        vec!["WORKFLOW_STARTED", "TASK_STARTED", "TASK_COMPLETED", "WORKFLOW_COMPLETED"]
    );
}

// ---------------------------------------------------------------------
// Scenario 2: retry then success.
// ---------------------------------------------------------------------

struct RetryThenSuccess {
    attempts: Arc<AtomicU32>,
}

#[async_trait]
impl Workflow<InMemoryRepository> for RetryThenSuccess {
    type Input = ();
    type Output = String;
    const NAME: &'static str = "retry_then_success";
    const VERSION: u32 = 1;

    async fn run(&self, ctx: &WorkflowContext<InMemoryRepository>, _input: ()) -> Result<Self::Output, WorkflowOutcome> {
        let attempts = self.attempts.clone();
        let flaky = TaskDef::new("flaky", move |_call: TaskCall<()>| {
            let attempts = attempts.clone();
            async move {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(WorkflowError::new("IOError", "transient failure"))
                } else {
                    Ok("ok".to_string())
                }
            }
        })
        .retry(3, Duration::ZERO, 2.0);
        Ok(ctx.invoke(&flaky, ()).await?)
    }
}

#[tokio::test]
async fn scenario_2_retry_then_success() {
    let repo = Arc::new(InMemoryRepository::new());
    let execution_id = ExecutionId::new();
    let (checkpoint, events) = tracking_checkpoint();
    let exec = Arc::new(Mutex::new(ExecutionContext::new(execution_id, json!(null), checkpoint)));
    let workflow = RetryThenSuccess { attempts: Arc::new(AtomicU32::new(0)) };

    let outcome = WorkflowRuntime::run(&workflow, execution_id, json!(null), repo, None, exec).await.unwrap();

    match outcome {
        RunOutcome::Completed(output) => assert_eq!(output, "ok"),
        _ => panic!("expected completion"),
    }
    let all_tags = tags(&events).await;
    // The workflow-lifecycle wrapper around the task's own sequence from spec.md §8 scenario 2.
    assert_eq!(
        all_tags,
        vec![
            "WORKFLOW_STARTED",
            "TASK_STARTED",
            "TASK_FAILED",
            "TASK_RETRY_STARTED",
            "TASK_RETRY_FAILED",
            "TASK_RETRY_STARTED",
            "TASK_RETRY_COMPLETED",
            "WORKFLOW_COMPLETED",
        ]
    );

    // P3: exactly one TASK_STARTED for this source_id, no matter how many retries ran.
    let started_count = all_tags.iter().filter(|t| **t == "TASK_STARTED").count();
    assert_eq!(started_count, 1, "retries must never re-emit TASK_STARTED (P3)");
}

// ---------------------------------------------------------------------
// Scenario 3: fallback on exhaustion.
// ---------------------------------------------------------------------

struct FallbackOnExhaustion;

#[async_trait]
impl Workflow<InMemoryRepository> for FallbackOnExhaustion {
    type Input = ();
    type Output = String;
    const NAME: &'static str = "fallback_on_exhaustion";
    const VERSION: u32 = 1;

    async fn run(&self, ctx: &WorkflowContext<InMemoryRepository>, _input: ()) -> Result<Self::Output, WorkflowOutcome> {
        let always_fails = TaskDef::new("flaky", |_call: TaskCall<()>| async move { Err::<String, _>(WorkflowError::new("IOError", "boom")) })
            .retry(1, Duration::ZERO, 1.0)
            .fallback(|_call: TaskCall<()>| async move { Ok::<String, WorkflowError>("fb".to_string()) });
        Ok(ctx.invoke(&always_fails, ()).await?)
    }
}

#[tokio::test]
async fn scenario_3_fallback_on_exhaustion() {
    let repo = Arc::new(InMemoryRepository::new());
    let execution_id = ExecutionId::new();
    let (checkpoint, events) = tracking_checkpoint();
    let exec = Arc::new(Mutex::new(ExecutionContext::new(execution_id, json!(null), checkpoint)));

    let outcome = WorkflowRuntime::run(&FallbackOnExhaustion, execution_id, json!(null), repo, None, exec).await.unwrap();

    match outcome {
        RunOutcome::Completed(output) => assert_eq!(output, "fb"),
        _ => panic!("expected completion via fallback"),
    }
    assert_eq!(
        tags(&events).await,
        vec![
            "WORKFLOW_STARTED",
            "TASK_STARTED",
            "TASK_FAILED",
            "TASK_RETRY_STARTED",
            "TASK_RETRY_FAILED",
            "TASK_FALLBACK_STARTED",
            "TASK_FALLBACK_COMPLETED",
            "WORKFLOW_COMPLETED",
        ]
    );
}

// ---------------------------------------------------------------------
// Scenario 4: pause and resume.
// ---------------------------------------------------------------------

struct PauseThenReturn;

#[async_trait]
impl Workflow<InMemoryRepository> for PauseThenReturn {
    type Input = i64;
    type Output = (i64, i64);
    const NAME: &'static str = "pause_then_return";
    const VERSION: u32 = 1;

    async fn run(&self, ctx: &WorkflowContext<InMemoryRepository>, input: Self::Input) -> Result<Self::Output, WorkflowOutcome> {
        let t1 = TaskDef::new("t1", |call: TaskCall<i64>| async move { Ok::<_, WorkflowError>(call.input * 2) });
        let a = ctx.invoke(&t1, input).await?;
        let v = ctx.pause("manual").await?;
        let v: i64 = serde_json::from_value(v).map_err(|e| WorkflowError::new("Decode", e.to_string()))?;
        Ok((a, v))
    }
}

#[tokio::test]
async fn scenario_4_pause_and_resume() {
    let repo = Arc::new(InMemoryRepository::new());
    let execution_id = ExecutionId::new();
    let (checkpoint, events) = tracking_checkpoint();
    let exec = Arc::new(Mutex::new(ExecutionContext::new(execution_id, json!(10), checkpoint)));

    let first = WorkflowRuntime::run(&PauseThenReturn, execution_id, json!(10), repo.clone(), None, exec.clone())
        .await
        .unwrap();
    match first {
        RunOutcome::Paused { name } => assert_eq!(name, "manual"),
        _ => panic!("expected pause"),
    }
    assert_eq!(tags(&events).await, vec!["WORKFLOW_STARTED", "TASK_STARTED", "TASK_COMPLETED", "WORKFLOW_PAUSED"]);

    let persisted = events.lock().await.clone();
    let (checkpoint2, events2) = tracking_checkpoint();
    let resumed_exec = Arc::new(Mutex::new(ExecutionContext::from_events(execution_id, json!(10), persisted, checkpoint2)));

    let outcome = WorkflowRuntime::resume(&PauseThenReturn, execution_id, json!(10), json!(42), repo, None, resumed_exec)
        .await
        .unwrap();

    match outcome {
        RunOutcome::Completed((a, v)) => assert_eq!((a, v), (20, 42)),
        _ => panic!("expected completion"),
    }
    assert_eq!(tags(&events2).await, vec!["WORKFLOW_RESUMED", "WORKFLOW_COMPLETED"]);
}

// ---------------------------------------------------------------------
// Scenario 5: worker death mid-execution; a second worker replays and
// skips the already-completed tasks (doubles as the P2 determinism
// check — the three pre-seeded tasks would panic if the runtime ever
// re-invoked their bodies).
// ---------------------------------------------------------------------

struct WorkerDeathReplay;

#[async_trait]
impl Workflow<InMemoryRepository> for WorkerDeathReplay {
    type Input = ();
    type Output = Vec<i64>;
    const NAME: &'static str = "worker_death_replay";
    const VERSION: u32 = 1;

    async fn run(&self, ctx: &WorkflowContext<InMemoryRepository>, _input: ()) -> Result<Self::Output, WorkflowOutcome> {
        let t1 = TaskDef::new("t1", |_call: TaskCall<()>| async move { panic!("t1 must not re-execute on replay") });
        let t2 = TaskDef::new("t2", |_call: TaskCall<()>| async move { panic!("t2 must not re-execute on replay") });
        let t3 = TaskDef::new("t3", |_call: TaskCall<()>| async move { panic!("t3 must not re-execute on replay") });
        let t4 = TaskDef::new("t4", |_call: TaskCall<()>| async move { Ok::<i64, WorkflowError>(40) });
        let t5 = TaskDef::new("t5", |_call: TaskCall<()>| async move { Ok::<i64, WorkflowError>(50) });

        let a1 = ctx.invoke(&t1, ()).await?;
        let a2 = ctx.invoke(&t2, ()).await?;
        let a3 = ctx.invoke(&t3, ()).await?;
        let a4 = ctx.invoke(&t4, ()).await?;
        let a5 = ctx.invoke(&t5, ()).await?;
        Ok(vec![a1, a2, a3, a4, a5])
    }
}

fn seeded_event(seq: u64, source_id: &str, name: &str, kind: EventKind) -> Event {
    Event {
        seq,
        source_id: SourceId(source_id.to_string()),
        name: name.to_string(),
        timestamp: Utc::now(),
        kind,
    }
}

#[tokio::test]
async fn scenario_5_worker_death_replay_skips_completed_tasks() {
    const SCOPE: &str = "worker_death_replay@1";
    let prior = vec![
        seeded_event(0, &format!("{SCOPE}/workflow"), "workflow", EventKind::WorkflowStarted { input: json!(null) }),
        seeded_event(1, &format!("{SCOPE}/t1#0"), "t1", EventKind::TaskStarted { attempt: 0 }),
        seeded_event(2, &format!("{SCOPE}/t1#0"), "t1", EventKind::TaskCompleted { output: json!(10) }),
        seeded_event(3, &format!("{SCOPE}/t2#1"), "t2", EventKind::TaskStarted { attempt: 0 }),
        seeded_event(4, &format!("{SCOPE}/t2#1"), "t2", EventKind::TaskCompleted { output: json!(20) }),
        seeded_event(5, &format!("{SCOPE}/t3#2"), "t3", EventKind::TaskStarted { attempt: 0 }),
        seeded_event(6, &format!("{SCOPE}/t3#2"), "t3", EventKind::TaskCompleted { output: json!(30) }),
    ];

    let repo = Arc::new(InMemoryRepository::new());
    let execution_id = ExecutionId::new();
    let (checkpoint, events) = tracking_checkpoint();
    // A fresh ExecutionContext built from a persisted log stands in for
    // "worker W2 claims and loads the snapshot W1 left behind".
    let exec = Arc::new(Mutex::new(ExecutionContext::from_events(execution_id, json!(null), prior, checkpoint)));

    let outcome = WorkflowRuntime::run(&WorkerDeathReplay, execution_id, json!(null), repo, None, exec).await.unwrap();

    match outcome {
        RunOutcome::Completed(values) => assert_eq!(values, vec![10, 20, 30, 40, 50]),
        _ => panic!("expected completion"),
    }

    let appended = events.lock().await;
    assert!(
        appended.iter().all(|e| !e.source_id.0.contains("/t1#") && !e.source_id.0.contains("/t2#") && !e.source_id.0.contains("/t3#")),
        "no event should be appended for the already-completed tasks"
    );
    assert!(appended.iter().any(|e| e.source_id.0.contains("/t4#") && e.kind.tag() == "TASK_STARTED"));
    assert!(appended.iter().any(|e| e.source_id.0.contains("/t5#") && e.kind.tag() == "TASK_STARTED"));
    assert_eq!(appended.last().unwrap().kind.tag(), "WORKFLOW_COMPLETED");
}

// ---------------------------------------------------------------------
// Scenario 6: cancellation during RUNNING rolls back the in-flight task.
// ---------------------------------------------------------------------

struct CancellationWithRollback {
    rollback_ran: Arc<AtomicBool>,
}

#[async_trait]
impl Workflow<InMemoryRepository> for CancellationWithRollback {
    type Input = ();
    type Output = ();
    const NAME: &'static str = "cancellation_with_rollback";
    const VERSION: u32 = 1;

    async fn run(&self, ctx: &WorkflowContext<InMemoryRepository>, _input: ()) -> Result<Self::Output, WorkflowOutcome> {
        let t1 = TaskDef::new("t1", |_call: TaskCall<()>| async move { Ok::<(), WorkflowError>(()) });
        ctx.invoke(&t1, ()).await?;

        ctx.exec.lock().await.request_cancellation();

        let rollback_ran = self.rollback_ran.clone();
        let t2 = TaskDef::new("t2", |_call: TaskCall<()>| async move { Ok::<(), WorkflowError>(()) }).rollback(move |_call: TaskCall<()>| {
            let rollback_ran = rollback_ran.clone();
            async move {
                rollback_ran.store(true, Ordering::SeqCst);
                Ok(())
            }
        });
        ctx.invoke(&t2, ()).await?;
        Ok(())
    }
}

#[tokio::test]
async fn scenario_6_cancellation_runs_rollback_then_cancels() {
    let repo = Arc::new(InMemoryRepository::new());
    let execution_id = ExecutionId::new();
    let (checkpoint, events) = tracking_checkpoint();
    let exec = Arc::new(Mutex::new(ExecutionContext::new(execution_id, json!(null), checkpoint)));
    let workflow = CancellationWithRollback { rollback_ran: Arc::new(AtomicBool::new(false)) };

    let outcome = WorkflowRuntime::run(&workflow, execution_id, json!(null), repo, None, exec).await.unwrap();

    assert!(matches!(outcome, RunOutcome::Cancelled));
    assert!(workflow.rollback_ran.load(Ordering::SeqCst), "rollback body must have actually run");
    assert_eq!(
        tags(&events).await,
        vec![
            "WORKFLOW_STARTED",
            "TASK_STARTED",
            "TASK_COMPLETED",
            "TASK_STARTED",
            "TASK_ROLLBACK_STARTED",
            "TASK_ROLLBACK_COMPLETED",
            "WORKFLOW_CANCELLED",
        ]
    );
}

// ---------------------------------------------------------------------
// P5: cache idempotence — a second execution of the same cached task,
// wired to a body that panics if invoked, must reuse the first
// execution's bit-identical output via the cache-hit path alone.
// ---------------------------------------------------------------------

struct DoublerReal;

#[async_trait]
impl Workflow<InMemoryRepository> for DoublerReal {
    type Input = i64;
    type Output = i64;
    const NAME: &'static str = "doubler_real";
    const VERSION: u32 = 1;

    async fn run(&self, ctx: &WorkflowContext<InMemoryRepository>, input: Self::Input) -> Result<Self::Output, WorkflowOutcome> {
        let double = TaskDef::new("double", |call: TaskCall<i64>| async move { Ok::<_, WorkflowError>(call.input * 2) }).cache(true);
        Ok(ctx.invoke(&double, input).await?)
    }
}

struct DoublerCacheOnly;

#[async_trait]
impl Workflow<InMemoryRepository> for DoublerCacheOnly {
    type Input = i64;
    type Output = i64;
    const NAME: &'static str = "doubler_cache_only";
    const VERSION: u32 = 1;

    async fn run(&self, ctx: &WorkflowContext<InMemoryRepository>, input: Self::Input) -> Result<Self::Output, WorkflowOutcome> {
        let double = TaskDef::new("double", |_call: TaskCall<i64>| async move { panic!("cache hit must not recompute") }).cache(true);
        Ok(ctx.invoke(&double, input).await?)
    }
}

#[tokio::test]
async fn p5_cache_hit_reuses_prior_output_bit_identically() {
    let repo = Arc::new(InMemoryRepository::new());

    let first_id = ExecutionId::new();
    let (cp1, _events1) = tracking_checkpoint();
    let exec1 = Arc::new(Mutex::new(ExecutionContext::new(first_id, json!(21), cp1)));
    let first = WorkflowRuntime::run(&DoublerReal, first_id, json!(21), repo.clone(), None, exec1).await.unwrap();
    let first_output = match first {
        RunOutcome::Completed(v) => v,
        _ => panic!("expected completion"),
    };
    assert_eq!(first_output, 42);

    let second_id = ExecutionId::new();
    let (cp2, events2) = tracking_checkpoint();
    let exec2 = Arc::new(Mutex::new(ExecutionContext::new(second_id, json!(21), cp2)));
    let second = WorkflowRuntime::run(&DoublerCacheOnly, second_id, json!(21), repo, None, exec2).await.unwrap();
    let second_output = match second {
        RunOutcome::Completed(v) => v,
        _ => panic!("expected completion via cache hit"),
    };

    assert_eq!(second_output, first_output, "two executions of the same cached task must yield bit-identical output (P5)");

    let second_tags = tags(&events2).await;
    assert_eq!(second_tags, vec!["WORKFLOW_STARTED", "TASK_STARTED", "TASK_COMPLETED", "WORKFLOW_COMPLETED"]);

    let completed = events2.lock().await.iter().find(|e| e.kind.tag() == "TASK_COMPLETED").unwrap().name.clone();
    assert_eq!(completed, "double", "a cache hit must be journaled under the task's logical name, not a placeholder");
}
