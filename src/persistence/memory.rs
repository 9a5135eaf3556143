//! In-memory `EngineStore`, for tests and single-process development.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use super::store::{EngineStore, NewEvent, PeekFilter, ReservationRequest, StoreError};
use crate::domain::{
    Event, EventStatus, HandlerRun, HandlerState, Mutation, MutationStatus, Phase, ResolvedBy,
    ScriptRun, SessionOutcome, Topic, TriggerKind, Workflow,
};

#[derive(Default)]
struct Inner {
    workflows: HashMap<Uuid, Workflow>,
    handler_runs: HashMap<Uuid, HandlerRun>,
    mutations: HashMap<Uuid, Mutation>,
    topics: HashMap<Uuid, Topic>,
    topic_index: HashMap<(Uuid, String), Uuid>,
    events: HashMap<Uuid, Event>,
    event_index: HashMap<(Uuid, String), Uuid>,
    handler_states: HashMap<(Uuid, String), HandlerState>,
    script_runs: HashMap<Uuid, ScriptRun>,
}

/// Thread-safe in-memory store, mirroring `PostgresEngineStore`'s semantics
/// without a database. Good enough for tests; not durable.
pub struct MemoryEngineStore {
    inner: RwLock<Inner>,
}

impl MemoryEngineStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }
}

impl Default for MemoryEngineStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EngineStore for MemoryEngineStore {
    async fn create_workflow(&self, workflow: Workflow) -> Result<(), StoreError> {
        self.inner.write().workflows.insert(workflow.id, workflow);
        Ok(())
    }

    async fn get_workflow(&self, workflow_id: Uuid) -> Result<Workflow, StoreError> {
        self.inner
            .read()
            .workflows
            .get(&workflow_id)
            .cloned()
            .ok_or(StoreError::WorkflowNotFound(workflow_id))
    }

    async fn list_due_workflows(&self, now: DateTime<Utc>) -> Result<Vec<Workflow>, StoreError> {
        Ok(self
            .inner
            .read()
            .workflows
            .values()
            .filter(|w| w.is_due(now))
            .cloned()
            .collect())
    }

    async fn list_workflows_with_incomplete_runs(&self) -> Result<Vec<Uuid>, StoreError> {
        let inner = self.inner.read();
        let mut ids: Vec<Uuid> = inner
            .handler_runs
            .values()
            .filter(|r| !matches!(r.phase, Phase::Committed | Phase::Failed))
            .map(|r| r.workflow_id)
            .collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    async fn update_workflow_fields(
        &self,
        workflow_id: Uuid,
        mutate: Box<dyn FnOnce(&mut Workflow) + Send>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let workflow = inner
            .workflows
            .get_mut(&workflow_id)
            .ok_or(StoreError::WorkflowNotFound(workflow_id))?;
        mutate(workflow);
        debug_assert!(workflow.error_invariant_holds());
        Ok(())
    }

    async fn delete_workflow(&self, workflow_id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        inner
            .workflows
            .remove(&workflow_id)
            .ok_or(StoreError::WorkflowNotFound(workflow_id))?;
        inner.handler_runs.retain(|_, r| r.workflow_id != workflow_id);
        inner.script_runs.retain(|_, s| s.workflow_id != workflow_id);
        inner.handler_states.retain(|(wf, _), _| *wf != workflow_id);
        let topic_ids: Vec<Uuid> = inner
            .topics
            .values()
            .filter(|t| t.workflow_id == workflow_id)
            .map(|t| t.id)
            .collect();
        inner.topics.retain(|_, t| t.workflow_id != workflow_id);
        inner.topic_index.retain(|(wf, _), _| *wf != workflow_id);
        inner.events.retain(|_, e| !topic_ids.contains(&e.topic_id));
        inner
            .event_index
            .retain(|(topic_id, _), _| !topic_ids.contains(topic_id));
        Ok(())
    }

    async fn create_handler_run(&self, run: HandlerRun) -> Result<(), StoreError> {
        self.inner.write().handler_runs.insert(run.id, run);
        Ok(())
    }

    async fn get_handler_run(&self, run_id: Uuid) -> Result<HandlerRun, StoreError> {
        self.inner
            .read()
            .handler_runs
            .get(&run_id)
            .cloned()
            .ok_or(StoreError::HandlerRunNotFound(run_id))
    }

    async fn advance_handler_run(
        &self,
        run_id: Uuid,
        next_phase: Phase,
        state: Option<HandlerState>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let run = inner
            .handler_runs
            .get_mut(&run_id)
            .ok_or(StoreError::HandlerRunNotFound(run_id))?;
        run.advance(next_phase)
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        if let Some(state) = state {
            let key = (state.workflow_id, state.handler_name.clone());
            inner
                .handler_states
                .entry(key)
                .and_modify(|existing| existing.merge(state.clone()))
                .or_insert(state);
        }
        Ok(())
    }

    async fn set_handler_run_prepare_result(
        &self,
        run_id: Uuid,
        prepare_result: crate::domain::PrepareResult,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let run = inner
            .handler_runs
            .get_mut(&run_id)
            .ok_or(StoreError::HandlerRunNotFound(run_id))?;
        run.prepare_result = Some(prepare_result);
        run.updated_at = Utc::now();
        Ok(())
    }

    async fn set_handler_run_mutation_outcome(
        &self,
        run_id: Uuid,
        outcome: crate::domain::MutationOutcome,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let run = inner
            .handler_runs
            .get_mut(&run_id)
            .ok_or(StoreError::HandlerRunNotFound(run_id))?;
        run.mutation_outcome = outcome;
        run.updated_at = Utc::now();
        Ok(())
    }

    async fn fail_handler_run(
        &self,
        run_id: Uuid,
        error: crate::error::EngineError,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let run = inner
            .handler_runs
            .get_mut(&run_id)
            .ok_or(StoreError::HandlerRunNotFound(run_id))?;
        run.fail(error);
        Ok(())
    }

    async fn list_incomplete_handler_runs(&self) -> Result<Vec<HandlerRun>, StoreError> {
        Ok(self
            .inner
            .read()
            .handler_runs
            .values()
            .filter(|r| !matches!(r.phase, Phase::Committed | Phase::Failed))
            .cloned()
            .collect())
    }

    async fn create_mutation(&self, mutation: Mutation) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        if inner
            .mutations
            .values()
            .any(|m| m.handler_run_id == mutation.handler_run_id)
        {
            return Err(StoreError::UniquenessViolation(format!(
                "handler run {} already has a mutation",
                mutation.handler_run_id
            )));
        }
        inner.mutations.insert(mutation.id, mutation);
        Ok(())
    }

    async fn get_mutation_by_handler_run(
        &self,
        handler_run_id: Uuid,
    ) -> Result<Option<Mutation>, StoreError> {
        Ok(self
            .inner
            .read()
            .mutations
            .values()
            .find(|m| m.handler_run_id == handler_run_id)
            .cloned())
    }

    async fn get_mutation(&self, mutation_id: Uuid) -> Result<Mutation, StoreError> {
        self.inner
            .read()
            .mutations
            .get(&mutation_id)
            .cloned()
            .ok_or(StoreError::MutationNotFound(mutation_id))
    }

    async fn update_mutation_status(
        &self,
        mutation_id: Uuid,
        status: MutationStatus,
        result: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let mutation = inner
            .mutations
            .get_mut(&mutation_id)
            .ok_or(StoreError::MutationNotFound(mutation_id))?;
        if !mutation.can_transition_to(status) {
            return Err(StoreError::Internal(format!(
                "illegal mutation transition {:?} -> {status:?}",
                mutation.status
            )));
        }
        mutation.status = status;
        mutation.result = result;
        mutation.error = error;
        mutation.updated_at = Utc::now();
        Ok(())
    }

    async fn list_in_flight_mutations(&self) -> Result<Vec<Mutation>, StoreError> {
        Ok(self
            .inner
            .read()
            .mutations
            .values()
            .filter(|m| m.status == MutationStatus::InFlight)
            .cloned()
            .collect())
    }

    async fn resolve_indeterminate_mutation(
        &self,
        mutation_id: Uuid,
        resolution: ResolvedBy,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let (handler_run_id, new_status) = {
            let mutation = inner
                .mutations
                .get_mut(&mutation_id)
                .ok_or(StoreError::MutationNotFound(mutation_id))?;
            if mutation.status != MutationStatus::Indeterminate {
                return Err(StoreError::Internal(format!(
                    "mutation {mutation_id} is not indeterminate"
                )));
            }
            if resolution == ResolvedBy::None {
                return Err(StoreError::Internal(
                    "resolution must be one of UserSkip/UserRetry/UserAssertFailed".into(),
                ));
            }
            // Indeterminate means "unknown", not "succeeded" — none of the
            // resolution kinds assert success, so the mutation always ends
            // up Failed; `resolved_by` records which kind of non-success.
            mutation.status = MutationStatus::Failed;
            mutation.resolved_by = resolution;
            mutation.updated_at = Utc::now();
            (mutation.handler_run_id, resolution)
        };

        let outcome = match new_status {
            ResolvedBy::UserSkip => crate::domain::MutationOutcome::Skipped,
            _ => crate::domain::MutationOutcome::Failure,
        };

        // Can't call `skip_events`/`release_events` here — they'd try to
        // re-acquire the write lock this method already holds. Inlined.
        for event in inner.events.values_mut() {
            if event.is_reserved_by(handler_run_id) {
                if new_status == ResolvedBy::UserSkip {
                    event.status = EventStatus::Skipped;
                } else {
                    event.status = EventStatus::Pending;
                    event.reserved_by_run_id = None;
                    event.attempt += 1;
                }
            }
        }

        if let Some(run) = inner.handler_runs.get_mut(&handler_run_id) {
            run.mutation_outcome = outcome;
            let _ = run.advance(Phase::Mutated);
            let workflow_id = run.workflow_id;
            if let Some(workflow) = inner.workflows.get_mut(&workflow_id) {
                workflow.resume();
                workflow.pending_retry_run_id = if new_status == ResolvedBy::UserSkip {
                    Some(handler_run_id)
                } else {
                    None
                };
            }
        }
        Ok(())
    }

    async fn get_or_create_topic(
        &self,
        workflow_id: Uuid,
        name: &str,
    ) -> Result<Topic, StoreError> {
        let mut inner = self.inner.write();
        let key = (workflow_id, name.to_string());
        if let Some(id) = inner.topic_index.get(&key).copied() {
            return Ok(inner.topics.get(&id).cloned().unwrap());
        }
        let topic = Topic {
            id: Uuid::now_v7(),
            workflow_id,
            name: name.to_string(),
            created_at: Utc::now(),
        };
        inner.topic_index.insert(key, topic.id);
        inner.topics.insert(topic.id, topic.clone());
        Ok(topic)
    }

    async fn publish_event(
        &self,
        workflow_id: Uuid,
        topic_name: &str,
        event: NewEvent,
        producing_run_id: Uuid,
    ) -> Result<Event, StoreError> {
        let topic = self.get_or_create_topic(workflow_id, topic_name).await?;
        let mut inner = self.inner.write();
        let index_key = (topic.id, event.message_id.clone());
        if let Some(existing_id) = inner.event_index.get(&index_key).copied() {
            return Ok(inner.events.get(&existing_id).cloned().unwrap());
        }
        let new_event = Event::new(
            topic.id,
            event.message_id.clone(),
            event.title,
            event.payload,
            producing_run_id,
        );
        inner.event_index.insert(index_key, new_event.id);
        inner.events.insert(new_event.id, new_event.clone());
        Ok(new_event)
    }

    async fn peek_events(
        &self,
        workflow_id: Uuid,
        topic_name: &str,
        filter: PeekFilter,
    ) -> Result<Vec<Event>, StoreError> {
        let inner = self.inner.read();
        let Some(&topic_id) = inner
            .topic_index
            .get(&(workflow_id, topic_name.to_string()))
        else {
            return Ok(Vec::new());
        };
        let mut events: Vec<Event> = inner
            .events
            .values()
            .filter(|e| e.topic_id == topic_id)
            .filter(|e| filter.status.map(|s| s == e.status).unwrap_or(true))
            .cloned()
            .collect();
        events.sort_by_key(|e| e.created_at);
        if let Some(limit) = filter.limit {
            events.truncate(limit);
        }
        Ok(events)
    }

    async fn get_events_by_ids(
        &self,
        workflow_id: Uuid,
        topic_name: &str,
        message_ids: &[String],
    ) -> Result<Vec<Event>, StoreError> {
        let inner = self.inner.read();
        let Some(&topic_id) = inner
            .topic_index
            .get(&(workflow_id, topic_name.to_string()))
        else {
            return Ok(Vec::new());
        };
        Ok(message_ids
            .iter()
            .filter_map(|mid| inner.event_index.get(&(topic_id, mid.clone())))
            .filter_map(|id| inner.events.get(id))
            .cloned()
            .collect())
    }

    async fn reserve_events(
        &self,
        run_id: Uuid,
        requests: Vec<ReservationRequest>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        for req in requests {
            for event_id in req.event_ids {
                if let Some(event) = inner.events.get_mut(&event_id) {
                    if event.status == EventStatus::Pending {
                        event.status = EventStatus::Reserved;
                        event.reserved_by_run_id = Some(run_id);
                    }
                }
            }
        }
        Ok(())
    }

    async fn consume_events(&self, run_id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        for event in inner.events.values_mut() {
            if event.is_reserved_by(run_id) {
                event.status = EventStatus::Consumed;
            }
        }
        Ok(())
    }

    async fn skip_events(&self, run_id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        for event in inner.events.values_mut() {
            if event.is_reserved_by(run_id) {
                event.status = EventStatus::Skipped;
            }
        }
        Ok(())
    }

    async fn release_events(&self, run_id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        for event in inner.events.values_mut() {
            if event.is_reserved_by(run_id) {
                event.status = EventStatus::Pending;
                event.reserved_by_run_id = None;
                event.attempt += 1;
            }
        }
        Ok(())
    }

    async fn get_handler_state(
        &self,
        workflow_id: Uuid,
        handler_name: &str,
    ) -> Result<Option<HandlerState>, StoreError> {
        Ok(self
            .inner
            .read()
            .handler_states
            .get(&(workflow_id, handler_name.to_string()))
            .cloned())
    }

    async fn put_handler_state(&self, state: HandlerState) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let key = (state.workflow_id, state.handler_name.clone());
        inner
            .handler_states
            .entry(key)
            .and_modify(|existing| existing.merge(state.clone()))
            .or_insert(state);
        Ok(())
    }

    async fn create_script_run(
        &self,
        workflow_id: Uuid,
        trigger_kind: TriggerKind,
    ) -> Result<ScriptRun, StoreError> {
        let run = ScriptRun::new(workflow_id, trigger_kind);
        self.inner.write().script_runs.insert(run.id, run.clone());
        Ok(run)
    }

    async fn append_handler_run_to_session(
        &self,
        script_run_id: Uuid,
        handler_run_id: Uuid,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let session = inner
            .script_runs
            .get_mut(&script_run_id)
            .ok_or(StoreError::Internal(format!(
                "script run {script_run_id} not found"
            )))?;
        session.handler_run_ids.push(handler_run_id);
        Ok(())
    }

    async fn finish_script_run(
        &self,
        script_run_id: Uuid,
        outcome: SessionOutcome,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let session = inner
            .script_runs
            .get_mut(&script_run_id)
            .ok_or(StoreError::Internal(format!(
                "script run {script_run_id} not found"
            )))?;
        session.finish(outcome);
        Ok(())
    }

    async fn get_script_run(&self, script_run_id: Uuid) -> Result<ScriptRun, StoreError> {
        self.inner
            .read()
            .script_runs
            .get(&script_run_id)
            .cloned()
            .ok_or(StoreError::Internal(format!(
                "script run {script_run_id} not found"
            )))
    }

    async fn latest_incomplete_script_run(
        &self,
        workflow_id: Uuid,
    ) -> Result<Option<ScriptRun>, StoreError> {
        Ok(self
            .inner
            .read()
            .script_runs
            .values()
            .filter(|s| s.workflow_id == workflow_id && !s.is_terminal())
            .max_by_key(|s| s.started_at)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{HandlerType, MutationOutcome};

    fn new_store() -> MemoryEngineStore {
        MemoryEngineStore::new()
    }

    #[tokio::test]
    async fn create_and_get_workflow_round_trips() {
        let store = new_store();
        let wf = Workflow::new(Uuid::now_v7(), "bill reminder");
        let id = wf.id;
        store.create_workflow(wf).await.unwrap();
        let fetched = store.get_workflow(id).await.unwrap();
        assert_eq!(fetched.title, "bill reminder");
    }

    #[tokio::test]
    async fn publish_is_idempotent_by_message_id() {
        let store = new_store();
        let wf = Workflow::new(Uuid::now_v7(), "wf");
        let wf_id = wf.id;
        store.create_workflow(wf).await.unwrap();
        let run_id = Uuid::now_v7();

        let first = store
            .publish_event(
                wf_id,
                "emails",
                NewEvent {
                    message_id: "msg-1".into(),
                    title: "t".into(),
                    payload: serde_json::json!({}),
                },
                run_id,
            )
            .await
            .unwrap();
        let second = store
            .publish_event(
                wf_id,
                "emails",
                NewEvent {
                    message_id: "msg-1".into(),
                    title: "different title".into(),
                    payload: serde_json::json!({"x": 1}),
                },
                run_id,
            )
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.title, "t");
    }

    #[tokio::test]
    async fn reserve_consume_cycle() {
        let store = new_store();
        let wf = Workflow::new(Uuid::now_v7(), "wf");
        let wf_id = wf.id;
        store.create_workflow(wf).await.unwrap();
        let run_id = Uuid::now_v7();
        let event = store
            .publish_event(
                wf_id,
                "emails",
                NewEvent {
                    message_id: "msg-1".into(),
                    title: "t".into(),
                    payload: serde_json::json!({}),
                },
                run_id,
            )
            .await
            .unwrap();

        store
            .reserve_events(
                run_id,
                vec![ReservationRequest {
                    topic: "emails".into(),
                    event_ids: vec![event.id],
                }],
            )
            .await
            .unwrap();
        let reserved = store
            .peek_events(wf_id, "emails", PeekFilter::default())
            .await
            .unwrap();
        assert_eq!(reserved[0].status, EventStatus::Reserved);

        store.consume_events(run_id).await.unwrap();
        let consumed = store
            .peek_events(wf_id, "emails", PeekFilter::default())
            .await
            .unwrap();
        assert_eq!(consumed[0].status, EventStatus::Consumed);
    }

    #[tokio::test]
    async fn release_bumps_attempt_and_returns_to_pending() {
        let store = new_store();
        let wf = Workflow::new(Uuid::now_v7(), "wf");
        let wf_id = wf.id;
        store.create_workflow(wf).await.unwrap();
        let run_id = Uuid::now_v7();
        let event = store
            .publish_event(
                wf_id,
                "emails",
                NewEvent {
                    message_id: "msg-1".into(),
                    title: "t".into(),
                    payload: serde_json::json!({}),
                },
                run_id,
            )
            .await
            .unwrap();
        store
            .reserve_events(
                run_id,
                vec![ReservationRequest {
                    topic: "emails".into(),
                    event_ids: vec![event.id],
                }],
            )
            .await
            .unwrap();
        store.release_events(run_id).await.unwrap();
        let events = store
            .peek_events(wf_id, "emails", PeekFilter::default())
            .await
            .unwrap();
        assert_eq!(events[0].status, EventStatus::Pending);
        assert_eq!(events[0].attempt, 1);
    }

    #[tokio::test]
    async fn second_mutation_for_same_run_is_rejected() {
        let store = new_store();
        let run_id = Uuid::now_v7();
        let m1 = Mutation::new_pending(run_id, "email", "send", serde_json::json!({}), None);
        store.create_mutation(m1).await.unwrap();
        let m2 = Mutation::new_pending(run_id, "email", "send", serde_json::json!({}), None);
        assert!(store.create_mutation(m2).await.is_err());
    }

    #[tokio::test]
    async fn resolve_indeterminate_sets_outcome_and_advances_phase() {
        let store = new_store();
        let wf = Workflow::new(Uuid::now_v7(), "wf");
        let wf_id = wf.id;
        store.create_workflow(wf).await.unwrap();

        let mut run = HandlerRun::new(wf_id, Uuid::now_v7(), HandlerType::Consumer, "biller");
        run.advance(Phase::Preparing).unwrap();
        run.advance(Phase::Prepared).unwrap();
        run.advance(Phase::Mutating).unwrap();
        let run_id = run.id;
        store.create_handler_run(run).await.unwrap();

        let event = store
            .publish_event(
                wf_id,
                "emails",
                NewEvent {
                    message_id: "msg-1".into(),
                    title: "t".into(),
                    payload: serde_json::json!({}),
                },
                run_id,
            )
            .await
            .unwrap();
        store
            .reserve_events(
                run_id,
                vec![ReservationRequest {
                    topic: "emails".into(),
                    event_ids: vec![event.id],
                }],
            )
            .await
            .unwrap();

        let mut mutation =
            Mutation::new_pending(run_id, "email", "send", serde_json::json!({}), None);
        mutation.status = MutationStatus::InFlight;
        mutation.status = MutationStatus::Indeterminate;
        let mutation_id = mutation.id;
        // bypass can_transition_to for direct test setup since Pending cannot
        // jump straight to Indeterminate in normal flow
        store.inner.write().mutations.insert(mutation_id, mutation);

        store
            .resolve_indeterminate_mutation(mutation_id, ResolvedBy::UserAssertFailed)
            .await
            .unwrap();

        let run = store.get_handler_run(run_id).await.unwrap();
        assert_eq!(run.phase, Phase::Mutated);
        assert_eq!(run.mutation_outcome, MutationOutcome::Failure);
        let mutation = store.get_mutation(mutation_id).await.unwrap();
        assert_eq!(mutation.status, MutationStatus::Failed);
        assert_eq!(mutation.resolved_by, ResolvedBy::UserAssertFailed);

        // UserAssertFailed releases the reserved event back to pending for a
        // fresh attempt, and leaves no pending retry run behind.
        let events = store
            .peek_events(wf_id, "emails", PeekFilter::default())
            .await
            .unwrap();
        assert_eq!(events[0].status, EventStatus::Pending);
        assert_eq!(events[0].attempt, 1);
        let workflow = store.get_workflow(wf_id).await.unwrap();
        assert_eq!(workflow.pending_retry_run_id, None);
        assert!(workflow.error.is_empty());
    }

    #[tokio::test]
    async fn resolve_indeterminate_skip_marks_events_skipped_and_sets_pending_retry() {
        let store = new_store();
        let wf = Workflow::new(Uuid::now_v7(), "wf");
        let wf_id = wf.id;
        store.create_workflow(wf).await.unwrap();

        let mut run = HandlerRun::new(wf_id, Uuid::now_v7(), HandlerType::Consumer, "biller");
        run.advance(Phase::Preparing).unwrap();
        run.advance(Phase::Prepared).unwrap();
        run.advance(Phase::Mutating).unwrap();
        let run_id = run.id;
        store.create_handler_run(run).await.unwrap();

        let event = store
            .publish_event(
                wf_id,
                "emails",
                NewEvent {
                    message_id: "msg-1".into(),
                    title: "t".into(),
                    payload: serde_json::json!({}),
                },
                run_id,
            )
            .await
            .unwrap();
        store
            .reserve_events(
                run_id,
                vec![ReservationRequest {
                    topic: "emails".into(),
                    event_ids: vec![event.id],
                }],
            )
            .await
            .unwrap();

        let mut mutation =
            Mutation::new_pending(run_id, "email", "send", serde_json::json!({}), None);
        mutation.status = MutationStatus::InFlight;
        mutation.status = MutationStatus::Indeterminate;
        let mutation_id = mutation.id;
        store.inner.write().mutations.insert(mutation_id, mutation);

        store
            .resolve_indeterminate_mutation(mutation_id, ResolvedBy::UserSkip)
            .await
            .unwrap();

        let run = store.get_handler_run(run_id).await.unwrap();
        assert_eq!(run.phase, Phase::Mutated);
        assert_eq!(run.mutation_outcome, MutationOutcome::Skipped);

        let events = store
            .peek_events(wf_id, "emails", PeekFilter::default())
            .await
            .unwrap();
        assert_eq!(events[0].status, EventStatus::Skipped);
        assert_eq!(events[0].attempt, 0);

        // pending_retry_run_id is *set*, not cleared, so the run is driven
        // to `emitting` on the next restart instead of being abandoned.
        let workflow = store.get_workflow(wf_id).await.unwrap();
        assert_eq!(workflow.pending_retry_run_id, Some(run_id));
        assert!(workflow.error.is_empty());
    }
}
