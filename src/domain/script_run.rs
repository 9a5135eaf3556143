//! `ScriptRun`: the persisted record of one session (spec.md §2 names the
//! `script_runs` table; §4.5 describes sessions operationally without
//! giving their durable shape, which crash recovery/resumption requires).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What started this session (spec.md §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Schedule,
    Retry,
    Resume,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum SessionOutcome {
    Running,
    Completed,
    Suspended(String),
    Failed(crate::error::ErrorKind),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptRun {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub trigger_kind: TriggerKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: SessionOutcome,
    pub handler_run_ids: Vec<Uuid>,
}

impl ScriptRun {
    pub fn new(workflow_id: Uuid, trigger_kind: TriggerKind) -> Self {
        Self {
            id: Uuid::now_v7(),
            workflow_id,
            trigger_kind,
            started_at: Utc::now(),
            finished_at: None,
            outcome: SessionOutcome::Running,
            handler_run_ids: Vec::new(),
        }
    }

    pub fn finish(&mut self, outcome: SessionOutcome) {
        self.outcome = outcome;
        self.finished_at = Some(Utc::now());
    }

    pub fn is_terminal(&self) -> bool {
        self.finished_at.is_some()
    }
}
