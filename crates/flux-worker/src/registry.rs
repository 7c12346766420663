//! Type-erased registration of compiled-in [`Workflow`] implementations
//! by `(name, version)` — spec.md §9's resolution of "workflows are
//! registered code in the worker binary, addressed by name and
//! version, not shipped as opaque closures". Generalized from the
//! teacher's `durable::engine::registry::{AnyWorkflow, WorkflowWrapper,
//! WorkflowRegistry}`, which type-erases a `Workflow` over JSON
//! input/output the same way; here the wrapped method is
//! `WorkflowRuntime::run`/`resume` rather than an action-callback
//! state machine.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use flux_core::error::EncodeError;
use flux_core::ids::ExecutionId;
use flux_engine::context::ExecutionContext;
use flux_engine::error::RuntimeError;
use flux_engine::workflow::{RunOutcome, Workflow, WorkflowRuntime};
use flux_storage::repository::Repository;
use flux_storage::vault::SecretsVault;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;

/// Object-safe counterpart of [`Workflow`]: input/output are JSON
/// `Value` at this boundary instead of the concrete associated types,
/// so one `HashMap` can hold every registered workflow regardless of
/// its `Input`/`Output` type.
#[async_trait]
pub trait AnyWorkflow<R: Repository>: Send + Sync {
    async fn run(
        &self,
        execution_id: ExecutionId,
        input: Value,
        repo: Arc<R>,
        vault: Option<Arc<SecretsVault<R>>>,
        exec: Arc<Mutex<ExecutionContext>>,
    ) -> Result<RunOutcome<Value>, RuntimeError>;

    async fn resume(
        &self,
        execution_id: ExecutionId,
        input: Value,
        resume_input: Value,
        repo: Arc<R>,
        vault: Option<Arc<SecretsVault<R>>>,
        exec: Arc<Mutex<ExecutionContext>>,
    ) -> Result<RunOutcome<Value>, RuntimeError>;
}

fn erase<Out: Serialize>(outcome: RunOutcome<Out>) -> Result<RunOutcome<Value>, RuntimeError> {
    Ok(match outcome {
        RunOutcome::Completed(out) => {
            let value = serde_json::to_value(out).map_err(|e| RuntimeError::Encode(EncodeError::NotRepresentable(e.to_string())))?;
            RunOutcome::Completed(value)
        }
        RunOutcome::Failed(err) => RunOutcome::Failed(err),
        RunOutcome::Paused { name } => RunOutcome::Paused { name },
        RunOutcome::Cancelled => RunOutcome::Cancelled,
    })
}

struct WorkflowWrapper<W> {
    inner: W,
}

#[async_trait]
impl<W, R> AnyWorkflow<R> for WorkflowWrapper<W>
where
    W: Workflow<R>,
    R: Repository,
{
    async fn run(
        &self,
        execution_id: ExecutionId,
        input: Value,
        repo: Arc<R>,
        vault: Option<Arc<SecretsVault<R>>>,
        exec: Arc<Mutex<ExecutionContext>>,
    ) -> Result<RunOutcome<Value>, RuntimeError> {
        let outcome = WorkflowRuntime::run(&self.inner, execution_id, input, repo, vault, exec).await?;
        erase(outcome)
    }

    async fn resume(
        &self,
        execution_id: ExecutionId,
        input: Value,
        resume_input: Value,
        repo: Arc<R>,
        vault: Option<Arc<SecretsVault<R>>>,
        exec: Arc<Mutex<ExecutionContext>>,
    ) -> Result<RunOutcome<Value>, RuntimeError> {
        let outcome = WorkflowRuntime::resume(&self.inner, execution_id, input, resume_input, repo, vault, exec).await?;
        erase(outcome)
    }
}

/// Maps `(name, version)` to a registered workflow body. One registry
/// instance lives for the lifetime of the worker process; `register`
/// is called once per workflow at startup, typically from `main`.
pub struct WorkflowRegistry<R: Repository> {
    factories: HashMap<(String, u32), Arc<dyn AnyWorkflow<R>>>,
}

impl<R: Repository> Default for WorkflowRegistry<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Repository> WorkflowRegistry<R> {
    pub fn new() -> Self {
        Self { factories: HashMap::new() }
    }

    /// Register a compiled-in workflow under its `(NAME, VERSION)`.
    pub fn register<W>(&mut self, workflow: W)
    where
        W: Workflow<R>,
    {
        self.factories
            .insert((W::NAME.to_string(), W::VERSION), Arc::new(WorkflowWrapper { inner: workflow }));
    }

    pub fn contains(&self, name: &str, version: u32) -> bool {
        self.factories.contains_key(&(name.to_string(), version))
    }

    pub fn get(&self, name: &str, version: u32) -> Option<Arc<dyn AnyWorkflow<R>>> {
        self.factories.get(&(name.to_string(), version)).cloned()
    }

    pub fn registered(&self) -> Vec<(String, u32)> {
        self.factories.keys().cloned().collect()
    }
}

impl<R: Repository> fmt::Debug for WorkflowRegistry<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowRegistry").field("registered", &self.factories.keys().collect::<Vec<_>>()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use flux_engine::error::WorkflowOutcome;
    use flux_engine::runtime::WorkflowContext;
    use flux_storage::memory::InMemoryRepository;

    struct Echo;

    #[async_trait]
    impl Workflow<InMemoryRepository> for Echo {
        type Input = String;
        type Output = String;
        const NAME: &'static str = "echo";
        const VERSION: u32 = 1;

        async fn run(&self, _ctx: &WorkflowContext<InMemoryRepository>, input: Self::Input) -> Result<Self::Output, WorkflowOutcome> {
            Ok(input)
        }
    }

    #[test]
    fn register_and_lookup() {
        let mut registry: WorkflowRegistry<InMemoryRepository> = WorkflowRegistry::new();
        assert!(!registry.contains("echo", 1));
        registry.register(Echo);
        assert!(registry.contains("echo", 1));
        assert!(!registry.contains("echo", 2));
        assert!(registry.get("echo", 1).is_some());
        assert_eq!(registry.registered(), vec![("echo".to_string(), 1)]);
    }
}
