//! `Topic` and `Event`: the per-workflow named queue and its reservable units of work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Topic {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Pending,
    Reserved,
    Consumed,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub topic_id: Uuid,
    /// Unique per `(topic_id, message_id)`; publishing twice is a no-op
    /// that returns the original row (idempotent producers).
    pub message_id: String,
    pub title: String,
    pub payload: serde_json::Value,
    pub status: EventStatus,
    pub reserved_by_run_id: Option<Uuid>,
    pub created_by_run_id: Uuid,
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
}

impl Event {
    pub fn new(
        topic_id: Uuid,
        message_id: impl Into<String>,
        title: impl Into<String>,
        payload: serde_json::Value,
        created_by_run_id: Uuid,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            topic_id,
            message_id: message_id.into(),
            title: title.into(),
            payload,
            status: EventStatus::Pending,
            reserved_by_run_id: None,
            created_by_run_id,
            attempt: 0,
            created_at: Utc::now(),
        }
    }

    pub fn is_reserved_by(&self, run_id: Uuid) -> bool {
        self.status == EventStatus::Reserved && self.reserved_by_run_id == Some(run_id)
    }
}
