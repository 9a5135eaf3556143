//! The `Workflow` row and its lifecycle status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a workflow (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Draft,
    Ready,
    Active,
    Paused,
    Error,
    Archived,
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkflowStatus::Draft => "draft",
            WorkflowStatus::Ready => "ready",
            WorkflowStatus::Active => "active",
            WorkflowStatus::Paused => "paused",
            WorkflowStatus::Error => "error",
            WorkflowStatus::Archived => "archived",
        };
        write!(f, "{s}")
    }
}

/// A workflow's schedule, as either a named interval shorthand or a raw
/// 5-field cron expression. Parsing/next-run computation lives in
/// `crate::scheduler::schedule`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum ScheduleSpec {
    /// Shorthand like `"5m"`, `"1m"`, `"1h"`, `"1d"`.
    Interval(String),
    /// A raw 5-field cron expression (`minute hour day-of-month month day-of-week`).
    Cron(String),
}

/// The validated producer/consumer handler registry for a workflow.
///
/// Kept opaque at this layer (the session orchestrator and handler state
/// machine are generic over handler *names*; the actual handler code lives
/// in the embedder, reached through the sandbox — see `crate::external`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HandlerConfig {
    pub producers: Vec<String>,
    pub consumers: Vec<ConsumerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    pub name: String,
    pub topic: String,
}

/// A durable, user-defined automation: one scheduling unit (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Uuid,
    pub title: String,
    pub status: WorkflowStatus,
    /// Engine-suspended for agent repair; while true the workflow is never
    /// eligible no matter what `status`/`next_run_timestamp` say.
    pub maintenance: bool,
    pub schedule: Option<ScheduleSpec>,
    pub next_run_timestamp: Option<DateTime<Utc>>,
    /// A consumer run awaiting `resolve_mutation_*` before it can retry.
    pub pending_retry_run_id: Option<Uuid>,
    /// User-visible explanation, non-empty iff `status == Error`.
    pub error: String,
    pub handler_config: HandlerConfig,
    pub active_script_id: Option<String>,
}

impl Workflow {
    pub fn new(id: Uuid, title: impl Into<String>) -> Self {
        Self {
            id,
            title: title.into(),
            status: WorkflowStatus::Draft,
            maintenance: false,
            schedule: None,
            next_run_timestamp: None,
            pending_retry_run_id: None,
            error: String::new(),
            handler_config: HandlerConfig::default(),
            active_script_id: None,
        }
    }

    /// Invariant from spec.md §9: `status == Error <=> error != ""`.
    /// Checked wherever the engine writes either field.
    pub fn error_invariant_holds(&self) -> bool {
        (self.status == WorkflowStatus::Error) == !self.error.is_empty()
    }

    /// Whether this workflow is a scheduling candidate right now
    /// (spec.md §3 invariant, ignoring retry-backoff and global pause,
    /// which the scheduler applies separately).
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == WorkflowStatus::Active
            && !self.maintenance
            && matches!(self.next_run_timestamp, Some(t) if t <= now)
    }

    /// Set the engine-owned error channel, transitioning status to `Error`.
    /// Only the engine calls this; only the user clears it (`resume`).
    pub fn set_error(&mut self, error: impl Into<String>) {
        self.error = error.into();
        self.status = WorkflowStatus::Error;
        debug_assert!(self.error_invariant_holds());
    }

    /// User-initiated resume: clears the error channel and reactivates.
    pub fn resume(&mut self) {
        self.error.clear();
        self.status = WorkflowStatus::Active;
        debug_assert!(self.error_invariant_holds());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wf() -> Workflow {
        Workflow::new(Uuid::now_v7(), "test workflow")
    }

    #[test]
    fn fresh_workflow_satisfies_error_invariant() {
        assert!(wf().error_invariant_holds());
    }

    #[test]
    fn set_error_flips_status_and_invariant_holds() {
        let mut w = wf();
        w.set_error("boom");
        assert_eq!(w.status, WorkflowStatus::Error);
        assert!(w.error_invariant_holds());
    }

    #[test]
    fn resume_clears_error_and_reactivates() {
        let mut w = wf();
        w.set_error("boom");
        w.resume();
        assert_eq!(w.status, WorkflowStatus::Active);
        assert!(w.error.is_empty());
        assert!(w.error_invariant_holds());
    }

    #[test]
    fn not_due_while_maintenance() {
        let mut w = wf();
        w.status = WorkflowStatus::Active;
        w.maintenance = true;
        w.next_run_timestamp = Some(Utc::now() - chrono::Duration::seconds(1));
        assert!(!w.is_due(Utc::now()));
    }

    #[test]
    fn due_when_active_and_past_next_run() {
        let mut w = wf();
        w.status = WorkflowStatus::Active;
        w.next_run_timestamp = Some(Utc::now() - chrono::Duration::seconds(1));
        assert!(w.is_due(Utc::now()));
    }
}
