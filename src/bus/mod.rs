//! The event/topic bus (spec.md §4.2): the reservation-based queue handler
//! runs publish to and consume from.
//!
//! This is a thin typed layer over `EngineStore`'s topic/event operations —
//! the reservation semantics themselves (idempotent publish, pending ->
//! reserved -> {consumed|skipped|pending}) live in the store so a single
//! transaction covers each multi-row write; this module is where callers
//! reach for the operation by name instead of hand-assembling store calls.

use std::sync::Arc;

use uuid::Uuid;

use crate::domain::{Event, EventStatus};
use crate::persistence::{EngineStore, NewEvent, PeekFilter, ReservationRequest, StoreError};

/// One message a producer wants to publish.
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub message_id: String,
    pub title: String,
    pub payload: serde_json::Value,
}

pub struct EventBus {
    store: Arc<dyn EngineStore>,
}

impl EventBus {
    pub fn new(store: Arc<dyn EngineStore>) -> Self {
        Self { store }
    }

    /// Publish one message. Idempotent by `(topic, message_id)` — publishing
    /// the same `message_id` twice returns the original event unchanged
    /// (spec.md §4.2, §8 invariant: "duplicate publish is a no-op").
    pub async fn publish(
        &self,
        workflow_id: Uuid,
        topic: &str,
        message: OutgoingMessage,
        producing_run_id: Uuid,
    ) -> Result<Event, StoreError> {
        self.store
            .publish_event(
                workflow_id,
                topic,
                NewEvent {
                    message_id: message.message_id,
                    title: message.title,
                    payload: message.payload,
                },
                producing_run_id,
            )
            .await
    }

    /// Read-only look at a topic's events, optionally filtered by status.
    /// Does not reserve anything (spec.md §4.4: `peek` is a read operation,
    /// gated separately from `reserve`).
    pub async fn peek(
        &self,
        workflow_id: Uuid,
        topic: &str,
        status: Option<EventStatus>,
        limit: Option<usize>,
    ) -> Result<Vec<Event>, StoreError> {
        self.store
            .peek_events(workflow_id, topic, PeekFilter { status, limit })
            .await
    }

    /// All currently-`pending` events on a topic, oldest first.
    pub async fn peek_pending(
        &self,
        workflow_id: Uuid,
        topic: &str,
        limit: Option<usize>,
    ) -> Result<Vec<Event>, StoreError> {
        self.peek(workflow_id, topic, Some(EventStatus::Pending), limit)
            .await
    }

    pub async fn get_by_message_ids(
        &self,
        workflow_id: Uuid,
        topic: &str,
        message_ids: &[String],
    ) -> Result<Vec<Event>, StoreError> {
        self.store
            .get_events_by_ids(workflow_id, topic, message_ids)
            .await
    }

    /// Reserve the requested events for `run_id`. Events already reserved by
    /// someone else (or not `pending`) are silently skipped (spec.md §4.2).
    pub async fn reserve(
        &self,
        run_id: Uuid,
        requests: Vec<ReservationRequest>,
    ) -> Result<(), StoreError> {
        self.store.reserve_events(run_id, requests).await
    }

    /// Permanently retire the run's reservations (the happy path after a
    /// successful run).
    pub async fn consume(&self, run_id: Uuid) -> Result<(), StoreError> {
        self.store.consume_events(run_id).await
    }

    /// Retire the run's reservations as deliberately not acted on (a
    /// consumer that declines to mutate for these events).
    pub async fn skip(&self, run_id: Uuid) -> Result<(), StoreError> {
        self.store.skip_events(run_id).await
    }

    /// Undo a reservation, returning events to `pending` for a future
    /// attempt to pick up (crash recovery, explicit retry).
    pub async fn release(&self, run_id: Uuid) -> Result<(), StoreError> {
        self.store.release_events(run_id).await
    }
}
