//! `Mutation`: the single external side effect of a consumer run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationStatus {
    Pending,
    InFlight,
    Applied,
    Failed,
    /// "We don't know if it happened." Terminal until the user resolves it.
    Indeterminate,
}

/// How an indeterminate mutation was resolved, and by what user action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResolvedBy {
    #[default]
    None,
    UserSkip,
    UserRetry,
    UserAssertFailed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mutation {
    pub id: Uuid,
    /// At most one row per consumer run (uniqueness constraint).
    pub handler_run_id: Uuid,
    pub namespace: String,
    pub method: String,
    pub params: serde_json::Value,
    pub idempotency_key: Option<String>,
    pub status: MutationStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub reconciliation_attempts: u32,
    pub resolved_by: ResolvedBy,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Mutation {
    pub fn new_pending(
        handler_run_id: Uuid,
        namespace: impl Into<String>,
        method: impl Into<String>,
        params: serde_json::Value,
        idempotency_key: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            handler_run_id,
            namespace: namespace.into(),
            method: method.into(),
            params,
            idempotency_key,
            status: MutationStatus::Pending,
            result: None,
            error: None,
            reconciliation_attempts: 0,
            resolved_by: ResolvedBy::None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether this status is legal as a successor of `self.status`
    /// (spec.md §3: `pending -> in_flight -> {applied | failed |
    /// indeterminate}`; `indeterminate` is terminal until user-resolved).
    pub fn can_transition_to(&self, next: MutationStatus) -> bool {
        use MutationStatus::*;
        matches!(
            (self.status, next),
            (Pending, InFlight)
                | (InFlight, Applied)
                | (InFlight, Failed)
                | (InFlight, Indeterminate)
        )
    }
}
