//! Crash reconciliation (spec.md §4.3): the one-pass scan that runs on
//! process start (and periodically thereafter) to find work the previous
//! process died in the middle of.
//!
//! Two independent half-scans, grounded on the same "find orphaned work,
//! repair or escalate" shape as the teacher's stale-task reclaim loop:
//! - `in_flight` mutations with no live owner: outcome is genuinely unknown,
//!   so they become `indeterminate` and the owning workflow needs attention.
//! - non-terminal handler runs with no live owner that never reached
//!   `mutating`: safe to resume exactly where they left off, no side effect
//!   was ever attempted.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use crate::domain::Phase;
use crate::ledger::MutationLedger;
use crate::persistence::{EngineStore, StoreError};

/// What one reconciliation pass found and repaired.
#[derive(Debug, Default, Clone)]
pub struct ReconcileReport {
    /// Mutations moved to `indeterminate`; their workflows now need attention.
    pub orphaned_mutations: Vec<Uuid>,
    /// Handler runs safe to resume on their next session.
    pub resumable_runs: Vec<Uuid>,
}

pub struct Reconciler {
    store: Arc<dyn EngineStore>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn EngineStore>) -> Self {
        Self { store }
    }

    /// Run one reconciliation pass. `live_workflow_ids` is the process-local
    /// registry of workflows with a session currently executing — anything
    /// outside it is, by definition, orphaned (spec.md §4.5: one session per
    /// workflow at a time).
    #[instrument(skip(self, live_workflow_ids))]
    pub async fn scan_and_repair(
        &self,
        live_workflow_ids: &HashSet<Uuid>,
    ) -> Result<ReconcileReport, StoreError> {
        let ledger = MutationLedger::new(Arc::clone(&self.store));
        let mut report = ReconcileReport::default();

        for mutation in self.store.list_in_flight_mutations().await? {
            let run = match self.store.get_handler_run(mutation.handler_run_id).await {
                Ok(run) => run,
                Err(e) => {
                    error!(mutation_id = %mutation.id, error = %e, "in-flight mutation references a missing run");
                    continue;
                }
            };
            if live_workflow_ids.contains(&run.workflow_id) {
                continue;
            }
            ledger
                .mark_indeterminate(
                    mutation.id,
                    "process crashed while the mutation's outcome was unknown".into(),
                )
                .await?;
            self.store
                .update_workflow_fields(
                    run.workflow_id,
                    Box::new(move |w| {
                        w.set_error("a mutation's outcome is indeterminate and needs resolution");
                        w.pending_retry_run_id = Some(run.id);
                    }),
                )
                .await?;
            info!(mutation_id = %mutation.id, workflow_id = %run.workflow_id, "marked orphaned mutation indeterminate");
            report.orphaned_mutations.push(mutation.id);
        }

        for run in self.store.list_incomplete_handler_runs().await? {
            if live_workflow_ids.contains(&run.workflow_id) {
                continue;
            }
            if matches!(run.phase, Phase::Mutating) {
                // Covered by the mutation half-scan above (or the mutation
                // row hasn't been created yet, in which case no side effect
                // was attempted and it's safe to resume from `mutating`).
                if self
                    .store
                    .get_mutation_by_handler_run(run.id)
                    .await?
                    .is_some()
                {
                    continue;
                }
            }
            debug!(run_id = %run.id, phase = ?run.phase, "handler run is resumable");
            report.resumable_runs.push(run.id);
        }

        Ok(report)
    }

    /// Spawn a periodic reconciliation loop, stopping when `shutdown`
    /// receives `true`.
    pub fn spawn_loop(
        self: Arc<Self>,
        interval: Duration,
        live_workflow_ids: Arc<std::sync::RwLock<HashSet<Uuid>>>,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let live = live_workflow_ids.read().unwrap().clone();
                        match self.scan_and_repair(&live).await {
                            Ok(report) if !report.orphaned_mutations.is_empty() || !report.resumable_runs.is_empty() => {
                                info!(
                                    orphaned_mutations = report.orphaned_mutations.len(),
                                    resumable_runs = report.resumable_runs.len(),
                                    "reconciliation pass repaired orphaned work"
                                );
                            }
                            Ok(_) => {}
                            Err(e) => error!("reconciliation pass failed: {e}"),
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            debug!("reconciliation loop: shutdown requested");
                            break;
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{HandlerRun, HandlerType, MutationStatus, Workflow};
    use crate::persistence::MemoryEngineStore;

    #[tokio::test]
    async fn orphaned_in_flight_mutation_becomes_indeterminate() {
        let store = Arc::new(MemoryEngineStore::new());
        let workflow = Workflow::new(Uuid::now_v7(), "wf");
        let workflow_id = workflow.id;
        store.create_workflow(workflow).await.unwrap();

        let mut run = HandlerRun::new(workflow_id, Uuid::now_v7(), HandlerType::Consumer, "biller");
        run.advance(Phase::Preparing).unwrap();
        run.advance(Phase::Prepared).unwrap();
        run.advance(Phase::Mutating).unwrap();
        let run_id = run.id;
        store.create_handler_run(run).await.unwrap();

        let ledger = MutationLedger::new(store.clone());
        let mutation = ledger
            .create_pending(run_id, "email", "send", serde_json::json!({}), None)
            .await
            .unwrap();
        ledger.mark_in_flight(mutation.id).await.unwrap();

        let reconciler = Reconciler::new(store.clone());
        let report = reconciler.scan_and_repair(&HashSet::new()).await.unwrap();
        assert_eq!(report.orphaned_mutations, vec![mutation.id]);

        let mutation = store.get_mutation(mutation.id).await.unwrap();
        assert_eq!(mutation.status, MutationStatus::Indeterminate);
        let workflow = store.get_workflow(workflow_id).await.unwrap();
        assert!(!workflow.error.is_empty());
        assert_eq!(workflow.pending_retry_run_id, Some(run_id));
    }

    #[tokio::test]
    async fn live_workflows_are_left_alone() {
        let store = Arc::new(MemoryEngineStore::new());
        let workflow = Workflow::new(Uuid::now_v7(), "wf");
        let workflow_id = workflow.id;
        store.create_workflow(workflow).await.unwrap();

        let run = HandlerRun::new(workflow_id, Uuid::now_v7(), HandlerType::Producer, "watcher");
        store.create_handler_run(run).await.unwrap();

        let reconciler = Reconciler::new(store.clone());
        let mut live = HashSet::new();
        live.insert(workflow_id);
        let report = reconciler.scan_and_repair(&live).await.unwrap();
        assert!(report.resumable_runs.is_empty());
    }

    #[tokio::test]
    async fn incomplete_non_mutating_run_is_resumable() {
        let store = Arc::new(MemoryEngineStore::new());
        let workflow = Workflow::new(Uuid::now_v7(), "wf");
        let workflow_id = workflow.id;
        store.create_workflow(workflow).await.unwrap();

        let mut run = HandlerRun::new(workflow_id, Uuid::now_v7(), HandlerType::Producer, "watcher");
        run.advance(Phase::Executing).unwrap();
        let run_id = run.id;
        store.create_handler_run(run).await.unwrap();

        let reconciler = Reconciler::new(store.clone());
        let report = reconciler.scan_and_repair(&HashSet::new()).await.unwrap();
        assert_eq!(report.resumable_runs, vec![run_id]);
    }
}
