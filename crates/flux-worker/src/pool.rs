//! The worker's execution pool (spec.md §4.7): consumes the
//! [`ControlEvent`] stream from [`crate::connect::subscribe`], claims
//! scheduled executions up to a concurrency bound, and drives each
//! claimed execution through [`WorkflowRuntime`] with a checkpoint
//! callback that posts events back to flux-server instead of a local
//! store. Generalized from the teacher's
//! `durable::worker::pool::WorkerPool`, which bounds concurrency with a
//! `Semaphore` and runs its poll/heartbeat loops as `tokio::spawn`
//! tasks against a `watch`-based shutdown signal; here a single
//! `ControlEvent` stream replaces the poll loop (the server pushes
//! work instead of the worker pulling it).

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use flux_core::ids::{ExecutionId, WorkerName};
use flux_core::workflow::WorkerResources;
use flux_engine::context::ExecutionContext;
use flux_engine::error::CheckpointError;
use flux_storage::error::StoreError;
use flux_engine::workflow::RunOutcome;
use flux_storage::repository::Repository;
use flux_storage::vault::SecretsVault;
use futures::StreamExt;
use tokio::sync::{Mutex, Semaphore};

use crate::client::{ClientError, ControlEvent, ServerClient};
use crate::registry::WorkflowRegistry;

/// Bounds how many executions this worker drives concurrently
/// (spec.md §4.7's `max_concurrency`, mirroring the teacher's
/// `WorkerPoolConfig::max_concurrency`/`Semaphore` pairing).
pub struct WorkerPoolConfig {
    pub name: WorkerName,
    pub server_url: String,
    pub bootstrap_token: String,
    pub resources: WorkerResources,
    pub max_concurrency: usize,
}

/// Drives claimed executions to completion against a fixed set of
/// compiled-in [`crate::registry::AnyWorkflow`] bodies. One instance
/// per worker process.
pub struct WorkerPool<R: Repository> {
    client: ServerClient,
    bootstrap_token: String,
    resources: WorkerResources,
    registry: Arc<WorkflowRegistry<R>>,
    repo: Arc<R>,
    vault: Option<Arc<SecretsVault<R>>>,
    permits: Arc<Semaphore>,
    cancel_flags: Arc<Mutex<HashMap<ExecutionId, Arc<AtomicBool>>>>,
}

impl<R: Repository> WorkerPool<R> {
    pub fn new(
        config: WorkerPoolConfig,
        registry: WorkflowRegistry<R>,
        repo: Arc<R>,
        vault: Option<Arc<SecretsVault<R>>>,
    ) -> Self {
        let client = ServerClient::new(config.server_url, config.name);
        Self {
            client,
            bootstrap_token: config.bootstrap_token,
            resources: config.resources,
            registry: Arc::new(registry),
            repo,
            vault,
            permits: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            cancel_flags: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Connect, subscribe to the control stream, and run until the
    /// stream ends (the reconnect loop inside [`crate::connect`] only
    /// gives up when the task is aborted, so in practice this runs for
    /// the lifetime of the worker process).
    pub async fn run(self) {
        let (mut events, subscriber) = crate::connect::subscribe(self.client.clone(), self.bootstrap_token.clone(), self.resources.clone());
        let pool = Arc::new(self);

        while let Some(event) = events.next().await {
            match event {
                ControlEvent::ExecutionScheduled { execution_id, workflow_name, workflow_version } => {
                    let pool = pool.clone();
                    let execution_id = ExecutionId(execution_id);
                    tokio::spawn(async move {
                        pool.handle_scheduled(execution_id, workflow_name, workflow_version).await;
                    });
                }
                ControlEvent::ExecutionResumed { execution_id, resume_input } => {
                    let pool = pool.clone();
                    let execution_id = ExecutionId(execution_id);
                    tokio::spawn(async move {
                        pool.handle_resumed(execution_id, resume_input).await;
                    });
                }
                ControlEvent::ExecutionCancelled { execution_id } => {
                    let execution_id = ExecutionId(execution_id);
                    let flags = pool.cancel_flags.lock().await;
                    if let Some(flag) = flags.get(&execution_id) {
                        flag.store(true, std::sync::atomic::Ordering::Relaxed);
                    }
                }
            }
        }

        subscriber.abort();
    }

    /// Claim the execution (CAS against `SCHEDULED`); on a lost race
    /// (`409`) another worker got there first and this call is a no-op.
    /// On success, fetch the full snapshot and run from the top —
    /// replay short-circuits every already-completed task (spec.md
    /// §4.5.2), so this is cheap even for a long-running execution.
    async fn handle_scheduled(self: Arc<Self>, execution_id: ExecutionId, workflow_name: String, workflow_version: u32) {
        let Ok(_permit) = self.permits.clone().acquire_owned().await else {
            return;
        };

        match self.client.claim(execution_id).await {
            Ok(()) => {}
            Err(ClientError::Conflict(_)) => return,
            Err(e) => {
                tracing::warn!(%execution_id, error = %e, "claim failed");
                return;
            }
        }

        let Some(workflow) = self.registry.get(&workflow_name, workflow_version) else {
            tracing::error!(%execution_id, workflow_name, workflow_version, "claimed execution for unregistered workflow");
            return;
        };

        let snapshot = match self.client.fetch_execution(&workflow_name, execution_id).await {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(%execution_id, error = %e, "failed to fetch claimed execution snapshot");
                return;
            }
        };

        let exec = self.new_context(execution_id, snapshot.input.clone(), snapshot.events, snapshot.checkpoint_seq).await;
        let input = snapshot.input;

        match workflow.run(execution_id, input, self.repo.clone(), self.vault.clone(), exec).await {
            Ok(outcome) => self.log_outcome(execution_id, outcome),
            Err(e) => tracing::warn!(%execution_id, error = %e, "workflow run ended with a runtime error"),
        }

        self.cancel_flags.lock().await.remove(&execution_id);
    }

    /// A resume is sent directly to the worker that already owns the
    /// execution (spec.md §4.7's resume path bypasses claim/dispatch
    /// entirely), so this runs `resume()` without calling `claim`
    /// first.
    async fn handle_resumed(self: Arc<Self>, execution_id: ExecutionId, resume_input: serde_json::Value) {
        let Ok(_permit) = self.permits.clone().acquire_owned().await else {
            return;
        };

        let workflow_name = match self.execution_workflow_name(execution_id).await {
            Some(name) => name,
            None => {
                tracing::error!(%execution_id, "resume for execution with no local workflow mapping");
                return;
            }
        };

        let Some((workflow, workflow_version)) = self.lookup_for_execution(&workflow_name).await else {
            tracing::error!(%execution_id, workflow_name, "resume for unregistered workflow");
            return;
        };

        let snapshot = match self.client.fetch_execution(&workflow_name, execution_id).await {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(%execution_id, error = %e, "failed to fetch execution snapshot for resume");
                return;
            }
        };
        let _ = workflow_version;

        let exec = self.new_context(execution_id, snapshot.input.clone(), snapshot.events, snapshot.checkpoint_seq).await;
        let input = snapshot.input;

        match workflow.resume(execution_id, input, resume_input, self.repo.clone(), self.vault.clone(), exec).await {
            Ok(outcome) => self.log_outcome(execution_id, outcome),
            Err(e) => tracing::warn!(%execution_id, error = %e, "workflow resume ended with a runtime error"),
        }

        self.cancel_flags.lock().await.remove(&execution_id);
    }

    /// We only have `workflow_name` on a fresh claim; a resume frame
    /// carries only the execution id, so the worker re-derives the
    /// name from the snapshot it's about to fetch anyway — the
    /// detailed status endpoint is keyed on `(workflow_name,
    /// execution_id)`, so this performs a lightweight lookup first.
    async fn execution_workflow_name(&self, execution_id: ExecutionId) -> Option<String> {
        self.repo.load_execution(execution_id).await.ok().map(|e| e.workflow_name)
    }

    async fn lookup_for_execution(&self, workflow_name: &str) -> Option<(Arc<dyn crate::registry::AnyWorkflow<R>>, u32)> {
        self.registry
            .registered()
            .into_iter()
            .find(|(name, _)| name == workflow_name)
            .and_then(|(name, version)| self.registry.get(&name, version).map(|w| (w, version)))
    }

    /// Build an `ExecutionContext` wired to a checkpoint callback that
    /// posts each newly appended event back to flux-server, tracking
    /// the optimistic `checkpoint_seq` the server's CAS expects
    /// (spec.md §4.7 step 4, §5).
    async fn new_context(&self, execution_id: ExecutionId, input: serde_json::Value, prior_events: Vec<flux_core::event::Event>, starting_seq: u64) -> Arc<Mutex<ExecutionContext>> {
        let seq = Arc::new(Mutex::new(starting_seq));
        let client = self.client.clone();
        let checkpoint: flux_engine::context::CheckpointFn = Arc::new(move |event| {
            let client = client.clone();
            let seq = seq.clone();
            Box::pin(async move {
                let mut seq = seq.lock().await;
                client
                    .checkpoint(execution_id, *seq, std::slice::from_ref(&event))
                    .await
                    .map_err(|e| match e {
                        ClientError::Conflict(_) => CheckpointError::Stale { expected: *seq, found: *seq + 1 },
                        other => CheckpointError::Store(StoreError::Unavailable(other.to_string())),
                    })?;
                *seq += 1;
                Ok(())
            })
        });

        let ctx = ExecutionContext::from_events(execution_id, input, prior_events, checkpoint);
        let cancel_flag = ctx.cancellation_flag();
        self.cancel_flags.lock().await.insert(execution_id, cancel_flag);
        Arc::new(Mutex::new(ctx))
    }

    fn log_outcome(&self, execution_id: ExecutionId, outcome: RunOutcome<serde_json::Value>) {
        match outcome {
            RunOutcome::Completed(_) => tracing::info!(%execution_id, "execution completed"),
            RunOutcome::Failed(err) => tracing::info!(%execution_id, error = %err, "execution failed"),
            RunOutcome::Paused { name } => tracing::info!(%execution_id, pause = %name, "execution paused"),
            RunOutcome::Cancelled => tracing::info!(%execution_id, "execution cancelled"),
        }
    }
}
