//! The dispatcher (spec.md §4.8): matches pending executions to
//! eligible workers by resource fit, applying the tie-break rule when
//! more than one worker qualifies. The matching itself is a pure
//! function over a `WorkerSnapshot` slice so it is unit-testable
//! without a running server or repository, per SPEC_FULL.md's
//! ambient-stack note; the surrounding `Dispatcher` struct is the
//! `tokio::spawn`ed loop that calls it, woken by a `Notify` on
//! execution creation and worker heartbeat, adapted from the teacher's
//! `durable::worker::poller::AdaptivePoller` load-driven backoff
//! (generalized here to event-driven wakeup rather than fixed
//! polling, since the server already knows exactly when new work
//! might be dispatchable).

use std::sync::Arc;
use std::time::Duration;

use flux_core::event::Event;
use flux_core::execution::ExecutionState;
use flux_core::ids::WorkerName;
use flux_core::workflow::{ResourceRequirements, WorkflowDefinition};
use flux_storage::repository::Repository;
use tokio::sync::Notify;

use crate::registry::{WorkerControlEvent, WorkerRegistry, WorkerSnapshot};

/// Pick the best-fitting worker for `requirements`, or `None` if no
/// worker currently satisfies it. Tie-break (spec.md §4.8): least
/// currently-claimed executions, then lowest utilization (claims per
/// declared cpu core, since workers don't report a richer load
/// metric), then lexicographic worker name.
pub fn pick_worker(workers: &[WorkerSnapshot], requirements: &ResourceRequirements) -> Option<WorkerName> {
    let mut eligible: Vec<&WorkerSnapshot> = workers
        .iter()
        .filter(|w| requirements.satisfied_by(&w.resources))
        .collect();

    eligible.sort_by(|a, b| {
        a.claimed_executions
            .cmp(&b.claimed_executions)
            .then_with(|| utilization(a).partial_cmp(&utilization(b)).unwrap_or(std::cmp::Ordering::Equal))
            .then_with(|| a.name.0.cmp(&b.name.0))
    });

    eligible.first().map(|w| w.name.clone())
}

fn utilization(w: &WorkerSnapshot) -> f64 {
    let cores = w.resources.cpu_count.max(1) as f64;
    w.claimed_executions as f64 / cores
}

pub struct Dispatcher<R: Repository> {
    repo: Arc<R>,
    registry: Arc<WorkerRegistry>,
    notify: Arc<Notify>,
}

impl<R: Repository> Dispatcher<R> {
    pub fn new(repo: Arc<R>, registry: Arc<WorkerRegistry>) -> (Self, Arc<Notify>) {
        let notify = Arc::new(Notify::new());
        (
            Self {
                repo,
                registry,
                notify: notify.clone(),
            },
            notify,
        )
    }

    /// Wake the dispatcher loop — called after creating an execution,
    /// registering a worker, or a worker heartbeat.
    pub fn wake(&self) {
        self.notify.notify_one();
    }

    /// Run the dispatch loop until the process exits; intended to be
    /// `tokio::spawn`ed once at startup.
    pub async fn run(self: Arc<Self>) {
        loop {
            if let Err(e) = self.tick().await {
                tracing::error!(error = %e, "dispatcher tick failed");
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(Duration::from_secs(5)) => {}
            }
        }
    }

    /// One dispatch pass: offer every `CREATED` execution to a fitting
    /// worker. Leaves executions with no fit in `CREATED` to retry on
    /// the next wakeup (spec.md §4.8 — "if no worker fits, leave ...
    /// and retry on the next worker registration or heartbeat").
    pub async fn tick(&self) -> Result<(), flux_storage::error::StoreError> {
        let pending = self.repo.list_executions_by_state(ExecutionState::Created).await?;
        if pending.is_empty() {
            return Ok(());
        }
        let workers = self.registry.snapshot().await;

        for execution in pending {
            let (def, _body) = match self.repo.get_workflow(&execution.workflow_name, Some(execution.workflow_version)).await {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(execution_id = %execution.execution_id, error = %e, "workflow lookup failed during dispatch");
                    continue;
                }
            };
            let WorkflowDefinition { resource_requirements, .. } = def;

            let Some(worker) = pick_worker(&workers, &resource_requirements) else {
                continue;
            };

            self.repo
                .append_events(execution.execution_id, execution.checkpoint_seq, Vec::<Event>::new(), ExecutionState::Scheduled)
                .await?;
            self.repo.set_current_worker(execution.execution_id, Some(worker.clone())).await?;

            self.registry
                .send(
                    &worker,
                    WorkerControlEvent::ExecutionScheduled {
                        execution_id: execution.execution_id.0,
                        workflow_name: execution.workflow_name.clone(),
                        workflow_version: execution.workflow_version,
                    },
                )
                .await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flux_core::workflow::WorkerResources;
    use std::collections::BTreeSet;

    fn snapshot(name: &str, cpu: u32, claimed: u32) -> WorkerSnapshot {
        WorkerSnapshot {
            name: WorkerName(name.to_string()),
            resources: WorkerResources {
                cpu_count: cpu,
                memory_bytes: 8 * 1024 * 1024 * 1024,
                gpu_descriptors: None,
                package_set: BTreeSet::new(),
            },
            claimed_executions: claimed,
        }
    }

    #[test]
    fn picks_least_claimed_worker_among_eligible() {
        let workers = vec![snapshot("b", 4, 2), snapshot("a", 4, 0)];
        let picked = pick_worker(&workers, &ResourceRequirements::default());
        assert_eq!(picked, Some(WorkerName("a".into())));
    }

    #[test]
    fn breaks_ties_on_utilization_when_claimed_counts_match() {
        // equal claimed (2) but z has more cores, so lower utilization
        let workers = vec![snapshot("a", 4, 2), snapshot("z", 8, 2)];
        let picked = pick_worker(&workers, &ResourceRequirements::default());
        assert_eq!(picked, Some(WorkerName("z".into())));
    }

    #[test]
    fn falls_back_to_lexicographic_name_on_full_tie() {
        let workers = vec![snapshot("b", 4, 1), snapshot("a", 4, 1)];
        let picked = pick_worker(&workers, &ResourceRequirements::default());
        assert_eq!(picked, Some(WorkerName("a".into())));
    }

    #[test]
    fn rejects_workers_missing_required_package() {
        let mut w = snapshot("a", 4, 0);
        let req = ResourceRequirements {
            packages: ["torch".to_string()].into_iter().collect(),
            ..Default::default()
        };
        let picked = pick_worker(&[w.clone()], &req);
        assert_eq!(picked, None);

        w.resources.package_set.insert("torch".to_string());
        let picked = pick_worker(&[w], &req);
        assert_eq!(picked, Some(WorkerName("a".into())));
    }
}
