//! The mutation ledger (spec.md §4.3): at most one external side effect per
//! consumer run, crash-safe via a durable `pending -> in_flight ->
//! {applied|failed|indeterminate}` record.

pub mod reconcile;

use std::sync::Arc;

use uuid::Uuid;

use crate::domain::{Mutation, MutationStatus, ResolvedBy};
use crate::persistence::{EngineStore, StoreError};

pub use reconcile::Reconciler;

pub struct MutationLedger {
    store: Arc<dyn EngineStore>,
}

impl MutationLedger {
    pub fn new(store: Arc<dyn EngineStore>) -> Self {
        Self { store }
    }

    /// Record an intended mutation as `pending`, right before attempting it.
    /// Fails if this run already has one (spec.md §3 "at most one row per
    /// consumer run").
    pub async fn create_pending(
        &self,
        handler_run_id: Uuid,
        namespace: impl Into<String>,
        method: impl Into<String>,
        params: serde_json::Value,
        idempotency_key: Option<String>,
    ) -> Result<Mutation, StoreError> {
        let mutation =
            Mutation::new_pending(handler_run_id, namespace, method, params, idempotency_key);
        self.store.create_mutation(mutation.clone()).await?;
        Ok(mutation)
    }

    /// Mark a mutation as about to be attempted against the external tool.
    /// Once this commits, a crash before the matching terminal write leaves
    /// the mutation `in_flight` for the reconciliation loop to find.
    pub async fn mark_in_flight(&self, mutation_id: Uuid) -> Result<(), StoreError> {
        self.store
            .update_mutation_status(mutation_id, MutationStatus::InFlight, None, None)
            .await
    }

    pub async fn mark_applied(
        &self,
        mutation_id: Uuid,
        result: serde_json::Value,
    ) -> Result<(), StoreError> {
        self.store
            .update_mutation_status(mutation_id, MutationStatus::Applied, Some(result), None)
            .await
    }

    /// The tool call itself returned a definite failure (as opposed to an
    /// ambiguous crash) — still a terminal, known-false outcome.
    pub async fn mark_failed(&self, mutation_id: Uuid, error: String) -> Result<(), StoreError> {
        self.store
            .update_mutation_status(mutation_id, MutationStatus::Failed, None, Some(error))
            .await
    }

    /// The tool call's outcome is unknown (timeout mid-call, process crash
    /// between send and ack). Requires user resolution before the workflow
    /// can proceed (spec.md §4.3).
    pub async fn mark_indeterminate(
        &self,
        mutation_id: Uuid,
        error: String,
    ) -> Result<(), StoreError> {
        self.store
            .update_mutation_status(mutation_id, MutationStatus::Indeterminate, None, Some(error))
            .await
    }

    pub async fn get_for_run(&self, handler_run_id: Uuid) -> Result<Option<Mutation>, StoreError> {
        self.store.get_mutation_by_handler_run(handler_run_id).await
    }

    /// A user decides how an `indeterminate` mutation actually went.
    /// `UserSkip`/`UserRetry`/`UserAssertFailed` all resolve it as not
    /// having applied — see `resolve_indeterminate_mutation` for why.
    pub async fn resolve(
        &self,
        mutation_id: Uuid,
        resolution: ResolvedBy,
    ) -> Result<(), StoreError> {
        self.store
            .resolve_indeterminate_mutation(mutation_id, resolution)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryEngineStore;

    #[tokio::test]
    async fn pending_to_applied_happy_path() {
        let store = Arc::new(MemoryEngineStore::new());
        let ledger = MutationLedger::new(store.clone());
        let run_id = Uuid::now_v7();

        let mutation = ledger
            .create_pending(run_id, "email", "send", serde_json::json!({}), None)
            .await
            .unwrap();
        ledger.mark_in_flight(mutation.id).await.unwrap();
        ledger
            .mark_applied(mutation.id, serde_json::json!({"id": "sent-1"}))
            .await
            .unwrap();

        let fetched = store.get_mutation(mutation.id).await.unwrap();
        assert_eq!(fetched.status, MutationStatus::Applied);
    }

    #[tokio::test]
    async fn second_mutation_on_same_run_is_rejected() {
        let store = Arc::new(MemoryEngineStore::new());
        let ledger = MutationLedger::new(store);
        let run_id = Uuid::now_v7();
        ledger
            .create_pending(run_id, "email", "send", serde_json::json!({}), None)
            .await
            .unwrap();
        let second = ledger
            .create_pending(run_id, "email", "send", serde_json::json!({}), None)
            .await;
        assert!(second.is_err());
    }
}
