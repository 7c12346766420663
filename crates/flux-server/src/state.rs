//! Shared application state, following the teacher's per-module
//! `AppState` convention (`control-plane::api::*::AppState`) but
//! collapsed into one struct here since every route needs the same
//! repository/registry/dispatcher trio — Flux's surface is narrower
//! than the teacher's.

use std::sync::Arc;

use flux_storage::repository::Repository;
use flux_storage::vault::SecretsVault;
use tokio::sync::Notify;

use crate::dispatcher::Dispatcher;
use crate::hub::ExecutionHub;
use crate::registry::WorkerRegistry;

#[derive(Clone)]
pub struct AppState<R: Repository> {
    pub repo: Arc<R>,
    pub registry: Arc<WorkerRegistry>,
    pub hub: Arc<ExecutionHub>,
    pub vault: Option<Arc<SecretsVault<R>>>,
    pub dispatch_notify: Arc<Notify>,
    pub bootstrap_token: Arc<str>,
}

impl<R: Repository> AppState<R> {
    pub fn new(
        repo: Arc<R>,
        vault: Option<Arc<SecretsVault<R>>>,
        bootstrap_token: impl Into<Arc<str>>,
    ) -> (Self, Arc<Dispatcher<R>>) {
        let registry = Arc::new(WorkerRegistry::new());
        let (dispatcher, dispatch_notify) = Dispatcher::new(repo.clone(), registry.clone());
        let dispatcher = Arc::new(dispatcher);
        (
            Self {
                repo,
                registry,
                hub: Arc::new(ExecutionHub::new()),
                vault,
                dispatch_notify,
                bootstrap_token: bootstrap_token.into(),
            },
            dispatcher,
        )
    }
}
