//! Flux worker binary: loads configuration, opens the same repository
//! backend flux-server uses (for direct task-cache/secrets access —
//! spec.md §4.6's "never talks to storage directly" scopes only event
//! persistence, which flows through the control plane instead), and
//! runs the execution pool against a registry of compiled-in
//! workflows. Mirrors the teacher's `everruns-worker::main` shape:
//! load config, construct a store, hand it to a pool, run forever.

use std::sync::Arc;

use anyhow::{Context, Result};
use flux_core::config::FluxConfig;
use flux_core::ids::WorkerName;
use flux_core::workflow::WorkerResources;
use flux_storage::memory::InMemoryRepository;
use flux_storage::postgres::PgRepository;
use flux_storage::repository::Repository;
use flux_storage::vault::SecretsVault;
use flux_worker::pool::{WorkerPool, WorkerPoolConfig};
use flux_worker::registry::WorkflowRegistry;

fn detect_resources() -> WorkerResources {
    let cpu_count = std::thread::available_parallelism().map(|n| n.get() as u32).unwrap_or(1);
    WorkerResources {
        cpu_count,
        memory_bytes: 0,
        gpu_descriptors: None,
        package_set: Default::default(),
    }
}

fn worker_name() -> WorkerName {
    if let Ok(name) = std::env::var("FLUX_WORKER_NAME") {
        return WorkerName(name);
    }
    let host = hostname_or_random();
    WorkerName(format!("worker-{host}"))
}

fn hostname_or_random() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| uuid::Uuid::now_v7().simple().to_string())
}

/// Register the workflows this worker process knows how to run. A
/// generic `flux-worker` binary has nothing to register by default —
/// downstream binaries that embed this crate call
/// `WorkflowRegistry::register` with their own `Workflow` impls before
/// handing the registry to `WorkerPool::new`.
fn build_registry<R: Repository>() -> WorkflowRegistry<R> {
    WorkflowRegistry::new()
}

async fn run<R: Repository>(config: FluxConfig, repo: Arc<R>) -> Result<()> {
    let vault = if config.security.encryption_key.is_empty() {
        tracing::warn!("FLUX_SECURITY__ENCRYPTION_KEY not set; workflows requesting secrets will fail");
        None
    } else {
        Some(Arc::new(
            SecretsVault::new(repo.clone(), &config.security.encryption_key, &[])
                .context("invalid FLUX_SECURITY__ENCRYPTION_KEY")?,
        ))
    };

    if config.workers.bootstrap_token.is_empty() {
        tracing::warn!("FLUX_WORKERS__BOOTSTRAP_TOKEN not set; registration will be rejected by a hardened server");
    }

    let pool_config = WorkerPoolConfig {
        name: worker_name(),
        server_url: config.workers.server_url.clone(),
        bootstrap_token: config.workers.bootstrap_token.clone(),
        resources: detect_resources(),
        max_concurrency: config.executor.max_workers as usize,
    };

    let registry = build_registry::<R>();
    tracing::info!(registered = ?registry.registered(), "starting flux-worker");

    let pool = WorkerPool::new(pool_config, registry, repo, vault);
    pool.run().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = FluxConfig::load(None).context("failed to load configuration")?;

    if config.core.database_url.starts_with("postgres://") && std::env::var("FLUX_USE_MEMORY").is_err() {
        let repo = Arc::new(
            PgRepository::connect(&config.core.database_url)
                .await
                .context("failed to connect to Postgres")?,
        );
        run(config, repo).await
    } else {
        tracing::info!("using in-memory repository (set a postgres:// DATABASE_URL to share cache/secrets with flux-server)");
        run(config, Arc::new(InMemoryRepository::new())).await
    }
}
