//! P4 (exclusive claim, spec.md §8): two workers racing `POST
//! /workers/{name}/claim/{execution_id}` against the same `SCHEDULED`
//! execution. Exercises `api::workers::claim` directly against an
//! `AppState<InMemoryRepository>` — no bound listener needed, the same
//! shape as the teacher's `everruns-control-plane`
//! `tests/integration_test.rs`, minus the network hop.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue};
use axum::Json;
use flux_core::execution::{Execution, ExecutionState};
use flux_core::workflow::WorkerResources;
use flux_server::api::workers::{claim, register_worker, RegisterWorkerRequest};
use flux_server::error::ApiError;
use flux_server::state::AppState;
use flux_storage::memory::InMemoryRepository;
use flux_storage::repository::Repository;
use serde_json::json;

const BOOTSTRAP_TOKEN: &str = "bootstrap-secret";

fn bearer(token: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        axum::http::header::AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
    );
    headers
}

async fn register(state: &AppState<InMemoryRepository>, name: &str) -> String {
    register_worker::<InMemoryRepository>(
        State(state.clone()),
        bearer(BOOTSTRAP_TOKEN),
        Json(RegisterWorkerRequest {
            name: name.to_string(),
            resources: WorkerResources::default(),
        }),
    )
    .await
    .unwrap()
    .0
    .session_token
}

#[tokio::test]
async fn only_one_of_two_concurrent_claims_on_the_same_execution_succeeds() {
    let repo = Arc::new(InMemoryRepository::new());
    let (state, _dispatcher) = AppState::new(repo.clone(), None, BOOTSTRAP_TOKEN);

    let token_a = register(&state, "worker-a").await;
    let token_b = register(&state, "worker-b").await;

    let mut execution = Execution::new("hello_world", 1, json!("World"));
    execution.state = ExecutionState::Scheduled;
    let execution_id = execution.execution_id;
    repo.create_execution(execution).await.unwrap();

    let (a, b) = tokio::join!(
        claim::<InMemoryRepository>(State(state.clone()), Path(("worker-a".to_string(), execution_id.0)), bearer(&token_a)),
        claim::<InMemoryRepository>(State(state.clone()), Path(("worker-b".to_string(), execution_id.0)), bearer(&token_b)),
    );
    let outcomes = [a, b];

    let successes = outcomes.iter().filter(|r| r.is_ok()).count();
    let conflicts = outcomes.iter().filter(|r| matches!(r, Err(ApiError::Conflict(_)))).count();
    assert_eq!(successes, 1, "exactly one of the two racing claims should win");
    assert_eq!(conflicts, 1, "the losing claim should observe a conflict, not a silent no-op");

    let reloaded = repo.load_execution(execution_id).await.unwrap();
    assert_eq!(reloaded.state, ExecutionState::Claimed);
    assert!(reloaded.current_worker.is_some());
}

#[tokio::test]
async fn claiming_an_already_claimed_execution_is_rejected() {
    let repo = Arc::new(InMemoryRepository::new());
    let (state, _dispatcher) = AppState::new(repo.clone(), None, BOOTSTRAP_TOKEN);
    let token = register(&state, "worker-a").await;

    let mut execution = Execution::new("hello_world", 1, json!("World"));
    execution.state = ExecutionState::Claimed;
    let execution_id = execution.execution_id;
    repo.create_execution(execution).await.unwrap();

    let result = claim::<InMemoryRepository>(State(state.clone()), Path(("worker-a".to_string(), execution_id.0)), bearer(&token)).await;
    assert!(matches!(result, Err(ApiError::Conflict(_))));
}
