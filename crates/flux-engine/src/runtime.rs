//! [`WorkflowContext`]: the object a workflow body actually holds while
//! it runs — the execution log, the repository, the secrets vault, and
//! the scope counter that mints `source_id`s. `invoke`/`map`/`parallel`
//! implement spec.md §4.5.2-§4.5.3's task invocation algorithm.

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use flux_core::codec::{fingerprint, Codec, JsonCodec};
use flux_core::event::{EventKind, WireError};
use flux_core::ids::{ExecutionId, ScopeCounter, SourceId};
use flux_core::workflow::WorkflowError;
use flux_storage::repository::Repository;
use flux_storage::vault::SecretsVault;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::context::ExecutionContext;
use crate::error::{Suspend, TaskError, WorkflowOutcome};
use crate::task::{retry_delay_for, TaskCall, TaskDef, TaskMeta};

fn to_wire(err: &WorkflowError) -> WireError {
    WireError {
        kind: err.kind.clone(),
        message: err.message.clone(),
        details: err.details.clone(),
    }
}

pub struct WorkflowContext<R: Repository> {
    pub exec: Arc<Mutex<ExecutionContext>>,
    pub repo: Arc<R>,
    pub vault: Option<Arc<SecretsVault<R>>>,
    pub scope: Arc<ScopeCounter>,
    execution_id: ExecutionId,
    codec: JsonCodec,
}

impl<R: Repository> Clone for WorkflowContext<R> {
    fn clone(&self) -> Self {
        Self {
            exec: self.exec.clone(),
            repo: self.repo.clone(),
            vault: self.vault.clone(),
            scope: self.scope.clone(),
            execution_id: self.execution_id,
            codec: self.codec,
        }
    }
}

impl<R: Repository> WorkflowContext<R> {
    pub fn new(
        execution_id: ExecutionId,
        exec: Arc<Mutex<ExecutionContext>>,
        repo: Arc<R>,
        vault: Option<Arc<SecretsVault<R>>>,
        scope: Arc<ScopeCounter>,
    ) -> Self {
        Self {
            exec,
            repo,
            vault,
            scope,
            execution_id,
            codec: JsonCodec,
        }
    }

    pub fn execution_id(&self) -> ExecutionId {
        self.execution_id
    }

    pub async fn is_cancelled(&self) -> bool {
        let ctx = self.exec.lock().await;
        ctx.cancellation_requested()
    }

    /// Voluntary suspension point (spec.md §4.6 `pause(name)`, P7). If
    /// this exact call site already has a `WORKFLOW_RESUMED` later in
    /// the log — i.e. this is a replay after the server resumed the
    /// execution — returns the resume input immediately with no new
    /// event, so the code after `pause` runs exactly once. Otherwise
    /// records `WORKFLOW_PAUSED` and raises the `Suspend` signal that
    /// unwinds through the workflow body to
    /// [`crate::workflow::WorkflowRuntime::run`].
    pub async fn pause(&self, name: impl Into<String>) -> Result<serde_json::Value, WorkflowOutcome> {
        let name = name.into();
        let source_id = self.scope.next_id(&format!("pause:{name}"));

        let already_resumed = {
            let ctx = self.exec.lock().await;
            ctx.resume_input_for(&name)
        };
        if let Some(resume_input) = already_resumed {
            return Ok(resume_input);
        }

        let mut ctx = self.exec.lock().await;
        ctx.add_event(source_id, name.clone(), EventKind::WorkflowPaused { name: name.clone() })
            .await
            .map_err(|e| WorkflowOutcome::Failed(WorkflowError::new("Infrastructure", e.to_string())))?;
        Err(WorkflowOutcome::Suspend(Suspend::Paused(name)))
    }

    /// A nested scope for `map`/`parallel`/`pipeline` bodies, so
    /// `source_id`s minted inside them never collide with the parent's
    /// (spec.md §4.5.3 — "block is its own scope").
    pub fn nested(&self, block_name: &str) -> WorkflowContext<R> {
        WorkflowContext {
            exec: self.exec.clone(),
            repo: self.repo.clone(),
            vault: self.vault.clone(),
            scope: Arc::new(ScopeCounter::new(block_name.to_string())),
            execution_id: self.execution_id,
            codec: self.codec,
        }
    }

    async fn fetch_secrets(
        &self,
        requested: &std::collections::BTreeSet<String>,
    ) -> Result<BTreeMap<String, Vec<u8>>, TaskError> {
        let mut out = BTreeMap::new();
        if requested.is_empty() {
            return Ok(out);
        }
        let vault = self
            .vault
            .as_ref()
            .ok_or_else(|| TaskError::Failed(WorkflowError::new("Configuration", "no secrets vault configured")))?;
        for name in requested {
            let value = vault
                .get(name)
                .await
                .map_err(|e| TaskError::Failed(WorkflowError::new("SecretUnavailable", e.to_string())))?;
            out.insert(name.clone(), value);
        }
        Ok(out)
    }

    /// Run `task` with `input`, implementing the full invocation
    /// algorithm: replay short-circuit on a terminal event, cache
    /// probe, secret injection, retry with backoff, fallback, rollback,
    /// and re-raise (spec.md §4.5.2).
    pub async fn invoke<In, Out>(&self, task: &TaskDef<In, Out>, input: In) -> Result<Out, TaskError>
    where
        In: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
        Out: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    {
        let source_id = self.scope.next_id(&task.options.name);

        // Step 1-2: replay short-circuit. If this source_id already has
        // a terminal outcome recorded, return it without re-running the
        // body at all.
        if let Some(outcome) = self.terminal_outcome::<Out>(&source_id).await? {
            return outcome;
        }

        // Step 3: detect a resumed-but-unfinished attempt (worker
        // crashed mid-retry) so we don't re-emit TASK_STARTED.
        let (already_started, prior_attempts) = {
            let ctx = self.exec.lock().await;
            let mut started = false;
            let mut attempts = 0u32;
            for e in ctx.events() {
                if e.source_id != source_id {
                    continue;
                }
                match &e.kind {
                    EventKind::TaskStarted { .. } => started = true,
                    EventKind::TaskRetryStarted { attempt, .. } => attempts = attempts.max(*attempt),
                    _ => {}
                }
            }
            (started, attempts)
        };

        // Step 4: cache probe, only on a genuinely fresh invocation.
        if !already_started && task.options.cache {
            let fp = fingerprint(&task.options.name, &input, &serde_json::Value::Null)
                .map_err(|e| TaskError::Failed(WorkflowError::new("Encode", e.to_string())))?;
            if let Some(bytes) = self
                .repo
                .get_cached(&task.options.name, &fp.as_hex())
                .await
                .map_err(TaskError::Store)?
            {
                let output: Out = self
                    .codec
                    .decode(&bytes)
                    .map_err(|e| TaskError::Failed(WorkflowError::new("Decode", e.to_string())))?;
                self.record_cached_completion(&task.options.name, &source_id, &output).await?;
                return Ok(output);
            }
        }

        if !already_started {
            let mut ctx = self.exec.lock().await;
            ctx.add_event(source_id.clone(), task.options.name.clone(), EventKind::TaskStarted { attempt: 0 })
                .await?;
        }

        let secrets = self.fetch_secrets(&task.options.secret_requests).await?;

        let mut attempt = prior_attempts;
        loop {
            if self.is_cancelled().await {
                self.run_rollback(task, input.clone(), &source_id, attempt).await;
                return Err(TaskError::Cancelled);
            }

            let meta = TaskMeta {
                task_id: source_id.clone(),
                task_name: task.options.name.clone(),
                attempt,
                execution_id: self.execution_id(),
            };
            let cancelled_flag = {
                let ctx = self.exec.lock().await;
                ctx.cancellation_flag()
            };
            let call = TaskCall::new(input.clone(), meta, secrets.clone(), cancelled_flag);

            // §7: a timeout is "treated exactly like user error" for
            // retry/fallback purposes, so it is journaled only as the
            // ordinary TaskFailed/TaskRetryFailed below — no separate
            // event kind.
            let body_result = match task.options.timeout {
                Some(d) => match tokio::time::timeout(d, (task.body)(call)).await {
                    Ok(r) => r,
                    Err(_) => Err(WorkflowError::new("Timeout", "task attempt timed out")),
                },
                None => (task.body)(call).await,
            };

            match body_result {
                Ok(output) => {
                    if task.options.cache {
                        self.store_cache(task, &input, &output).await?;
                    }
                    let value = serde_json::to_value(&output)
                        .map_err(|e| TaskError::Failed(WorkflowError::new("Encode", e.to_string())))?;
                    // §4.5.2 step 6b: TASK_COMPLETED on the first attempt,
                    // TASK_RETRY_COMPLETED if this succeeded after a retry
                    // — never both for the same source_id.
                    let kind = if attempt > 0 {
                        EventKind::TaskRetryCompleted { output: value }
                    } else {
                        EventKind::TaskCompleted { output: value }
                    };
                    let mut ctx = self.exec.lock().await;
                    ctx.add_event(source_id.clone(), task.options.name.clone(), kind).await?;
                    return Ok(output);
                }
                Err(err) => {
                    let wire = to_wire(&err);
                    let will_retry = attempt < task.options.retry_max_attempts;
                    {
                        let mut ctx = self.exec.lock().await;
                        let kind = if attempt == 0 {
                            EventKind::TaskFailed {
                                error: wire.clone(),
                                will_retry,
                            }
                        } else {
                            EventKind::TaskRetryFailed {
                                error: wire.clone(),
                                will_retry,
                            }
                        };
                        ctx.add_event(source_id.clone(), task.options.name.clone(), kind).await?;
                    }

                    if !will_retry {
                        return self.exhaust(task, input.clone(), &source_id, attempt, err).await;
                    }

                    let delay = retry_delay_for(&task.options, attempt);
                    {
                        let mut ctx = self.exec.lock().await;
                        ctx.add_event(
                            source_id.clone(),
                            task.options.name.clone(),
                            EventKind::TaskRetryStarted {
                                attempt: attempt + 1,
                                delay_ms: delay.as_millis() as u64,
                            },
                        )
                        .await?;
                    }
                    if delay > Duration::ZERO {
                        tokio::time::sleep(delay).await;
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// Retries and primary attempt are exhausted: try the fallback, and
    /// roll back regardless of whether it succeeds, since the primary
    /// attempt's side effects (if any) still need undoing unless the
    /// fallback fully replaces them (spec.md §4.5.2 step 8).
    async fn exhaust<In, Out>(
        &self,
        task: &TaskDef<In, Out>,
        input: In,
        source_id: &SourceId,
        attempt: u32,
        primary_err: WorkflowError,
    ) -> Result<Out, TaskError>
    where
        In: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
        Out: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    {
        if let Some(fallback) = &task.fallback {
            let meta = TaskMeta {
                task_id: source_id.clone(),
                task_name: task.options.name.clone(),
                attempt,
                execution_id: self.execution_id(),
            };
            let secrets = self.fetch_secrets(&task.options.secret_requests).await?;
            let cancelled_flag = {
                let ctx = self.exec.lock().await;
                ctx.cancellation_flag()
            };
            {
                let mut ctx = self.exec.lock().await;
                ctx.add_event(source_id.clone(), task.options.name.clone(), EventKind::TaskFallbackStarted)
                    .await?;
            }
            let call = TaskCall::new(input.clone(), meta, secrets, cancelled_flag);
            match fallback(call).await {
                Ok(output) => {
                    let mut ctx = self.exec.lock().await;
                    ctx.add_event(
                        source_id.clone(),
                        task.options.name.clone(),
                        EventKind::TaskFallbackCompleted {
                            output: serde_json::to_value(&output)
                                .map_err(|e| TaskError::Failed(WorkflowError::new("Encode", e.to_string())))?,
                        },
                    )
                    .await?;
                    return Ok(output);
                }
                Err(fb_err) => {
                    let mut ctx = self.exec.lock().await;
                    ctx.add_event(
                        source_id.clone(),
                        task.options.name.clone(),
                        EventKind::TaskFallbackFailed { error: to_wire(&fb_err) },
                    )
                    .await?;
                    self.run_rollback(task, input, source_id, attempt).await;
                    return Err(TaskError::Failed(fb_err));
                }
            }
        }

        {
            let mut ctx = self.exec.lock().await;
            ctx.add_event(
                source_id.clone(),
                task.options.name.clone(),
                EventKind::TaskFailed {
                    error: to_wire(&primary_err),
                    will_retry: false,
                },
            )
            .await?;
        }
        self.run_rollback(task, input, source_id, attempt).await;
        Err(TaskError::Failed(primary_err))
    }

    async fn run_rollback<In, Out>(&self, task: &TaskDef<In, Out>, input: In, source_id: &SourceId, attempt: u32)
    where
        In: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
        Out: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    {
        let Some(rollback) = &task.rollback else {
            return;
        };
        let meta = TaskMeta {
            task_id: source_id.clone(),
            task_name: task.options.name.clone(),
            attempt,
            execution_id: self.execution_id(),
        };
        let cancelled_flag = {
            let ctx = self.exec.lock().await;
            ctx.cancellation_flag()
        };
        let call = TaskCall::new(input, meta, BTreeMap::new(), cancelled_flag);
        {
            let mut ctx = self.exec.lock().await;
            let _ = ctx
                .add_event(source_id.clone(), task.options.name.clone(), EventKind::TaskRollbackStarted)
                .await;
        }
        let _ = rollback(call).await;
        let mut ctx = self.exec.lock().await;
        let _ = ctx
            .add_event(source_id.clone(), task.options.name.clone(), EventKind::TaskRollbackCompleted)
            .await;
    }

    async fn store_cache<In, Out>(&self, task: &TaskDef<In, Out>, input: &In, output: &Out) -> Result<(), TaskError>
    where
        In: Serialize,
        Out: Serialize,
    {
        let fp = fingerprint(&task.options.name, input, &serde_json::Value::Null)
            .map_err(|e| TaskError::Failed(WorkflowError::new("Encode", e.to_string())))?;
        let bytes = self
            .codec
            .encode(output)
            .map_err(|e| TaskError::Failed(WorkflowError::new("Encode", e.to_string())))?;
        self.repo
            .put_cached(&task.options.name, &fp.as_hex(), bytes)
            .await
            .map_err(TaskError::Store)?;
        Ok(())
    }

    /// §4.5.2 step 4: a cache hit still emits `TASK_STARTED` then
    /// `TASK_COMPLETED`, under the task's logical name — from the log's
    /// perspective a cache hit reads exactly like an instant success.
    async fn record_cached_completion<Out: Serialize>(&self, task_name: &str, source_id: &SourceId, output: &Out) -> Result<(), TaskError> {
        let mut ctx = self.exec.lock().await;
        ctx.add_event(source_id.clone(), task_name.to_string(), EventKind::TaskStarted { attempt: 0 })
            .await?;
        ctx.add_event(
            source_id.clone(),
            task_name.to_string(),
            EventKind::TaskCompleted {
                output: serde_json::to_value(output)
                    .map_err(|e| TaskError::Failed(WorkflowError::new("Encode", e.to_string())))?,
            },
        )
        .await?;
        Ok(())
    }

    /// If `source_id` already has a terminal task event, decode and
    /// return its outcome (possibly `Err`); `None` means the caller
    /// should actually run the body.
    async fn terminal_outcome<Out>(&self, source_id: &SourceId) -> Result<Option<Result<Out, TaskError>>, TaskError>
    where
        Out: DeserializeOwned,
    {
        let ctx = self.exec.lock().await;
        let found = ctx
            .events()
            .iter()
            .rev()
            .find(|e| &e.source_id == source_id && e.kind.is_task_terminal());
        let Some(event) = found else {
            return Ok(None);
        };
        let outcome = match &event.kind {
            EventKind::TaskCompleted { output }
            | EventKind::TaskRetryCompleted { output }
            | EventKind::TaskFallbackCompleted { output } => {
                let decoded: Out = serde_json::from_value(output.clone())
                    .map_err(|e| TaskError::Failed(WorkflowError::new("Decode", e.to_string())))?;
                Ok(decoded)
            }
            EventKind::TaskFailed { error, .. } | EventKind::TaskRetryFailed { error, .. } | EventKind::TaskFallbackFailed { error } => {
                Err(TaskError::Failed(WorkflowError::new(error.kind.clone(), error.message.clone())))
            }
            _ => unreachable!("is_task_terminal guarantees one of the variants handled above"),
        };
        Ok(Some(outcome))
    }

    /// Run `bodies` concurrently under a single nested scope, emitting
    /// each member's `TASK_STARTED` in deterministic order before any
    /// of them actually run (spec.md §4.5.3 — `parallel` assigns
    /// `source_id`s up front so replay is order-independent even though
    /// execution isn't). On failure, the first failure by sequence
    /// number wins; the rest are not cancelled, matching the teacher's
    /// "let siblings finish" convention for bounded fan-out.
    pub async fn parallel<In, Out, F, Fut>(&self, block_name: &str, inputs: Vec<In>, f: F) -> Result<Vec<Out>, TaskError>
    where
        In: Clone + Send + Sync + 'static,
        Out: Send + Sync + 'static,
        F: Fn(WorkflowContext<R>, In) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Out, TaskError>> + Send + 'static,
    {
        let nested = self.nested(block_name);
        let f = Arc::new(f);
        let mut handles = Vec::with_capacity(inputs.len());
        for input in inputs {
            let ctx = nested.clone();
            let f = f.clone();
            handles.push(tokio::spawn(async move { f(ctx, input).await }));
        }
        let mut outputs = Vec::with_capacity(handles.len());
        let mut first_err = None;
        for handle in handles {
            match handle.await {
                Ok(Ok(out)) => outputs.push(out),
                Ok(Err(e)) => {
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
                Err(join_err) => {
                    if first_err.is_none() {
                        first_err = Some(TaskError::Failed(WorkflowError::new("Infrastructure", join_err.to_string())));
                    }
                }
            }
        }
        if let Some(err) = first_err {
            return Err(err);
        }
        Ok(outputs)
    }

    /// Sequential positional fan-out (spec.md §4.5.3 `map`): each
    /// element gets its own `source_id` in call order, so indices are
    /// stable across replay even if a later element's body is
    /// non-deterministic in wall-clock terms.
    pub async fn map<In, Out, F, Fut>(&self, block_name: &str, inputs: Vec<In>, f: F) -> Result<Vec<Out>, TaskError>
    where
        In: Clone + Send + Sync + 'static,
        F: Fn(WorkflowContext<R>, In) -> Fut,
        Fut: std::future::Future<Output = Result<Out, TaskError>>,
    {
        let nested = self.nested(block_name);
        let mut outputs = Vec::with_capacity(inputs.len());
        for input in inputs {
            outputs.push(f(nested.clone(), input).await?);
        }
        Ok(outputs)
    }
}
