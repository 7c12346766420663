//! Flux server: workflow catalog, worker registry, dispatcher, and the
//! REST + SSE surface (spec.md §4.8, §6.1). Assembly follows the
//! teacher's `control-plane::main` shape: one `AppState` per resource
//! family's routes, merged into a single router, with CORS/trace
//! layers and a generated OpenAPI document.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::routing::get;
use axum::Router;
use flux_core::config::FluxConfig;
use flux_server::api;
use flux_server::dispatcher::Dispatcher;
use flux_server::state::AppState;
use flux_storage::memory::InMemoryRepository;
use flux_storage::postgres::PgRepository;
use flux_storage::repository::Repository;
use flux_storage::vault::SecretsVault;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    paths(
        api::workflows::register_workflow,
        api::workflows::list_workflows,
        api::workflows::get_workflow,
        api::workflows::execution_status,
    ),
    components(schemas(
        api::workflows::WorkflowSummary,
        api::workflows::RunResponse,
        api::workers::RegisterWorkerRequest,
        api::workers::RegisterWorkerResponse,
        api::workers::CheckpointRequest,
        api::secrets::SecretNames,
        api::secrets::SetSecretRequest,
        api::health::HealthResponse,
        flux_core::workflow::WorkflowDefinition,
        flux_core::workflow::ResourceRequirements,
        flux_core::workflow::WorkerResources,
        flux_core::execution::ExecutionState,
        flux_core::event::WireError,
    )),
    tags(
        (name = "workflows", description = "Workflow catalog and execution lifecycle"),
        (name = "workers", description = "Worker bootstrap, claim, and checkpoint"),
        (name = "secrets", description = "Secrets vault administration"),
    ),
    info(title = "Flux", version = "0.1.0", description = "Distributed workflow orchestration engine")
)]
struct ApiDoc;

async fn build_router<R: Repository>(state: AppState<R>) -> Router {
    let api_routes = Router::new()
        .merge(api::workflows::routes(state.clone()))
        .merge(api::workers::routes(state.clone()))
        .merge(api::secrets::routes(state.clone()));

    Router::new()
        .route("/health", get(api::health::health))
        .merge(api_routes)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-doc/openapi.json", ApiDoc::openapi()))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn run<R: Repository>(config: FluxConfig, repo: Arc<R>) -> Result<()> {
    let vault = if config.security.encryption_key.is_empty() {
        tracing::warn!("FLUX_SECURITY__ENCRYPTION_KEY not set; /admin/secrets will be unavailable");
        None
    } else {
        Some(Arc::new(
            SecretsVault::new(repo.clone(), &config.security.encryption_key, &[])
                .context("invalid FLUX_SECURITY__ENCRYPTION_KEY")?,
        ))
    };

    let bootstrap_token = if config.workers.bootstrap_token.is_empty() {
        tracing::warn!("FLUX_WORKERS__BOOTSTRAP_TOKEN not set; worker registration is unauthenticated");
        "".to_string()
    } else {
        config.workers.bootstrap_token.clone()
    };

    let (state, dispatcher) = AppState::new(repo, vault, bootstrap_token);
    tokio::spawn(Arc::clone(&dispatcher).run());

    let app = build_router(state).await;
    let addr = format!("{}:{}", config.core.server_host, config.core.server_port);
    tracing::info!(%addr, "flux-server listening");
    let listener = tokio::net::TcpListener::bind(&addr).await.context("failed to bind server address")?;
    axum::serve(listener, app).await.context("server error")?;
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
        repo.migrate().await.context("failed to run migrations")?;
        run(config, repo).await
    } else {
        tracing::info!("using in-memory repository (set a postgres:// DATABASE_URL for durable storage)");
        run(config, Arc::new(InMemoryRepository::new())).await
    }
}
