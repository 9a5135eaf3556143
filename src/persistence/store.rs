//! `EngineStore`: typed access to the durable store (spec.md §4.1).
//!
//! The actual replicated store is an out-of-scope external collaborator
//! (spec.md §1); this trait is the façade the rest of the engine programs
//! against. Implementations must be thread-safe; every write that touches
//! more than one row is a single transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::{
    Event, HandlerRun, HandlerState, Mutation, MutationStatus, ResolvedBy, ScriptRun, Topic,
    TriggerKind, Workflow,
};

/// Errors from store operations (spec.md §4.1 "Failure semantics").
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("workflow not found: {0}")]
    WorkflowNotFound(Uuid),

    #[error("handler run not found: {0}")]
    HandlerRunNotFound(Uuid),

    #[error("mutation not found: {0}")]
    MutationNotFound(Uuid),

    #[error("topic not found: {0}/{1}")]
    TopicNotFound(Uuid, String),

    #[error("uniqueness constraint violated: {0}")]
    UniquenessViolation(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    /// A transaction body failed for a reason the façade does not retry
    /// internally (spec.md §4.1).
    #[error("internal error: {0}")]
    Internal(String),
}

/// A single topic reservation request, `{topic, ids[]}` (spec.md §4.4).
#[derive(Debug, Clone)]
pub struct ReservationRequest {
    pub topic: String,
    pub event_ids: Vec<Uuid>,
}

/// Parameters to publish one event (spec.md §4.2).
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub message_id: String,
    pub title: String,
    pub payload: serde_json::Value,
}

/// Filter for `peek`.
#[derive(Debug, Clone, Default)]
pub struct PeekFilter {
    pub status: Option<crate::domain::EventStatus>,
    pub limit: Option<usize>,
}

#[async_trait]
pub trait EngineStore: Send + Sync + 'static {
    // ---------------------------------------------------------------
    // Workflows
    // ---------------------------------------------------------------

    async fn create_workflow(&self, workflow: Workflow) -> Result<(), StoreError>;

    async fn get_workflow(&self, workflow_id: Uuid) -> Result<Workflow, StoreError>;

    /// List workflows with `status = active`, `maintenance = false`, and
    /// `next_run_timestamp <= now` (spec.md §4.7 candidate selection steps 1-2).
    async fn list_due_workflows(&self, now: DateTime<Utc>) -> Result<Vec<Workflow>, StoreError>;

    /// List workflows that have at least one `HandlerRun` in a non-terminal
    /// phase (used by resumption on process start, spec.md §4.5).
    async fn list_workflows_with_incomplete_runs(&self) -> Result<Vec<Uuid>, StoreError>;

    /// Only the engine writes `error`, `next_run_timestamp`,
    /// `pending_retry_run_id`, `handler_config`; only the user writes
    /// `status` directly (via pause/resume/archive) — see spec.md §5.
    async fn update_workflow_fields(
        &self,
        workflow_id: Uuid,
        mutate: Box<dyn FnOnce(&mut Workflow) + Send>,
    ) -> Result<(), StoreError>;

    async fn delete_workflow(&self, workflow_id: Uuid) -> Result<(), StoreError>;

    // ---------------------------------------------------------------
    // Handler runs
    // ---------------------------------------------------------------

    async fn create_handler_run(&self, run: HandlerRun) -> Result<(), StoreError>;

    async fn get_handler_run(&self, run_id: Uuid) -> Result<HandlerRun, StoreError>;

    /// Atomic phase advance with a `handler_state` write (spec.md §4.1).
    /// `state` is `None` when the transition carries no state update
    /// (e.g. `prepared -> mutating`).
    async fn advance_handler_run(
        &self,
        run_id: Uuid,
        next_phase: crate::domain::Phase,
        state: Option<HandlerState>,
    ) -> Result<(), StoreError>;

    async fn set_handler_run_prepare_result(
        &self,
        run_id: Uuid,
        prepare_result: crate::domain::PrepareResult,
    ) -> Result<(), StoreError>;

    async fn set_handler_run_mutation_outcome(
        &self,
        run_id: Uuid,
        outcome: crate::domain::MutationOutcome,
    ) -> Result<(), StoreError>;

    async fn fail_handler_run(
        &self,
        run_id: Uuid,
        error: crate::error::EngineError,
    ) -> Result<(), StoreError>;

    /// Handler runs in a non-terminal phase (`phase` not in
    /// `{committed, failed}`). The reconciliation loop cross-references
    /// this against its process-local live-session registry — the first
    /// half of the reconciliation scan (spec.md §4.3).
    async fn list_incomplete_handler_runs(&self) -> Result<Vec<HandlerRun>, StoreError>;

    // ---------------------------------------------------------------
    // Mutations
    // ---------------------------------------------------------------

    async fn create_mutation(&self, mutation: Mutation) -> Result<(), StoreError>;

    async fn get_mutation_by_handler_run(
        &self,
        handler_run_id: Uuid,
    ) -> Result<Option<Mutation>, StoreError>;

    async fn get_mutation(&self, mutation_id: Uuid) -> Result<Mutation, StoreError>;

    async fn update_mutation_status(
        &self,
        mutation_id: Uuid,
        status: MutationStatus,
        result: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Result<(), StoreError>;

    /// Mutations in `in_flight`, cross-referenced by the reconciliation loop
    /// against live owners — the second half of the reconciliation scan
    /// (spec.md §4.3).
    async fn list_in_flight_mutations(&self) -> Result<Vec<Mutation>, StoreError>;

    /// One transaction: update the mutation row, set `mutation_outcome` on
    /// the handler run, advance its phase to `mutated`, and clear
    /// `workflow.error` (spec.md §4.3 "user resolution of indeterminate
    /// mutations"). The run's reserved events and `pending_retry_run_id`
    /// are handled per resolution kind: `UserSkip` marks them `skipped` and
    /// *sets* `pending_retry_run_id` so the run is picked up and driven to
    /// `emitting` before the next restart; `UserRetry`/`UserAssertFailed`
    /// release them back to `pending` (bumping their attempt counter) and
    /// clear `pending_retry_run_id`, since the workflow gets a fresh
    /// consumer run on the next session rather than resuming this one.
    async fn resolve_indeterminate_mutation(
        &self,
        mutation_id: Uuid,
        resolution: ResolvedBy,
    ) -> Result<(), StoreError>;

    // ---------------------------------------------------------------
    // Topics / events
    // ---------------------------------------------------------------

    async fn get_or_create_topic(&self, workflow_id: Uuid, name: &str)
        -> Result<Topic, StoreError>;

    /// Idempotent by `(topic_id, message_id)`: the original event wins on
    /// conflict (spec.md §4.2).
    async fn publish_event(
        &self,
        workflow_id: Uuid,
        topic_name: &str,
        event: NewEvent,
        producing_run_id: Uuid,
    ) -> Result<Event, StoreError>;

    async fn peek_events(
        &self,
        workflow_id: Uuid,
        topic_name: &str,
        filter: PeekFilter,
    ) -> Result<Vec<Event>, StoreError>;

    async fn get_events_by_ids(
        &self,
        workflow_id: Uuid,
        topic_name: &str,
        message_ids: &[String],
    ) -> Result<Vec<Event>, StoreError>;

    /// Reserves only events currently `pending`; already-reserved events
    /// are silently skipped (spec.md §4.2).
    async fn reserve_events(
        &self,
        run_id: Uuid,
        requests: Vec<ReservationRequest>,
    ) -> Result<(), StoreError>;

    async fn consume_events(&self, run_id: Uuid) -> Result<(), StoreError>;

    async fn skip_events(&self, run_id: Uuid) -> Result<(), StoreError>;

    /// Increments the attempt counter and returns events to `pending`.
    async fn release_events(&self, run_id: Uuid) -> Result<(), StoreError>;

    // ---------------------------------------------------------------
    // Handler state
    // ---------------------------------------------------------------

    async fn get_handler_state(
        &self,
        workflow_id: Uuid,
        handler_name: &str,
    ) -> Result<Option<HandlerState>, StoreError>;

    async fn put_handler_state(&self, state: HandlerState) -> Result<(), StoreError>;

    // ---------------------------------------------------------------
    // Sessions (`script_runs`)
    // ---------------------------------------------------------------

    async fn create_script_run(
        &self,
        workflow_id: Uuid,
        trigger_kind: TriggerKind,
    ) -> Result<ScriptRun, StoreError>;

    async fn append_handler_run_to_session(
        &self,
        script_run_id: Uuid,
        handler_run_id: Uuid,
    ) -> Result<(), StoreError>;

    async fn finish_script_run(
        &self,
        script_run_id: Uuid,
        outcome: crate::domain::SessionOutcome,
    ) -> Result<(), StoreError>;

    async fn get_script_run(&self, script_run_id: Uuid) -> Result<ScriptRun, StoreError>;

    /// Most recent (by `started_at`) session for a workflow that never
    /// reached a terminal outcome — used by resumption on process start.
    async fn latest_incomplete_script_run(
        &self,
        workflow_id: Uuid,
    ) -> Result<Option<ScriptRun>, StoreError>;
}
