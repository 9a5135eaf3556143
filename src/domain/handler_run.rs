//! `HandlerRun`: one execution attempt of one handler within a session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerType {
    Producer,
    Consumer,
}

/// Position in the handler run's state machine (spec.md §4.4).
///
/// Producer path: `Pending -> Executing -> Committed`.
/// Consumer path: `Pending -> Preparing -> Prepared -> Mutating -> Mutated
/// -> Emitting -> Committed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Pending,
    Executing,
    Preparing,
    Prepared,
    Mutating,
    Mutated,
    Emitting,
    Committed,
    Failed,
}

impl Phase {
    /// The phase sequence a producer run moves through.
    pub const PRODUCER_SEQUENCE: [Phase; 3] = [Phase::Pending, Phase::Executing, Phase::Committed];

    /// The phase sequence a consumer run moves through.
    pub const CONSUMER_SEQUENCE: [Phase; 7] = [
        Phase::Pending,
        Phase::Preparing,
        Phase::Prepared,
        Phase::Mutating,
        Phase::Mutated,
        Phase::Emitting,
        Phase::Committed,
    ];

    fn sequence(handler_type: HandlerType) -> &'static [Phase] {
        match handler_type {
            HandlerType::Producer => &Self::PRODUCER_SEQUENCE,
            HandlerType::Consumer => &Self::CONSUMER_SEQUENCE,
        }
    }

    /// Whether `next` is a legal forward step (or a same-type transition
    /// into `Failed`) from `self` along `handler_type`'s sequence. Phases
    /// only ever move forward (spec.md §8 invariant 6).
    pub fn can_advance_to(self, next: Phase, handler_type: HandlerType) -> bool {
        if next == Phase::Failed {
            return self != Phase::Committed && self != Phase::Failed;
        }
        let seq = Self::sequence(handler_type);
        let (Some(from), Some(to)) = (
            seq.iter().position(|p| *p == self),
            seq.iter().position(|p| *p == next),
        ) else {
            return false;
        };
        to == from + 1
    }
}

/// Terminal/active status of a handler run. `status` and `phase` must stay
/// consistent: `phase == Committed <=> status == Committed`; `phase ==
/// Failed <=> status` starts with `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerStatus {
    Active,
    Committed,
    Paused(String),
    Failed(crate::error::ErrorKind),
}

/// Outcome of the run's mutation, mirrored onto the run once the mutation
/// settles (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MutationOutcome {
    #[default]
    None,
    Success,
    Failure,
    Skipped,
}

/// The reservation list and intended mutation a `prepare` handler hands
/// back to the orchestrator (spec.md §4.4 step 2).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrepareResult {
    pub reservations: Vec<TopicReservation>,
    pub intended_mutation: Option<IntendedMutation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicReservation {
    pub topic: String,
    pub event_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntendedMutation {
    pub namespace: String,
    pub method: String,
    pub params: serde_json::Value,
    pub idempotency_key: Option<String>,
    pub ui_title: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerRun {
    pub id: Uuid,
    pub script_run_id: Uuid,
    pub workflow_id: Uuid,
    pub handler_type: HandlerType,
    pub handler_name: String,
    pub phase: Phase,
    pub status: HandlerStatus,
    pub retry_of: Option<Uuid>,
    pub prepare_result: Option<PrepareResult>,
    pub input_state: serde_json::Value,
    pub output_state: serde_json::Value,
    pub mutation_outcome: MutationOutcome,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub error: Option<EngineError>,
    pub cost: u64,
    pub logs: Vec<String>,
}

impl HandlerRun {
    pub fn new(
        workflow_id: Uuid,
        script_run_id: Uuid,
        handler_type: HandlerType,
        handler_name: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            script_run_id,
            workflow_id,
            handler_type,
            handler_name: handler_name.into(),
            phase: Phase::Pending,
            status: HandlerStatus::Active,
            retry_of: None,
            prepare_result: None,
            input_state: serde_json::Value::Null,
            output_state: serde_json::Value::Null,
            mutation_outcome: MutationOutcome::None,
            created_at: now,
            updated_at: now,
            error: None,
            cost: 0,
            logs: Vec::new(),
        }
    }

    /// A retry run continuing `self`'s logical attempt, entering at `phase`.
    /// Retries after mutation completion enter at `Emitting` and inherit
    /// `prepare_result`; retries before mutation start fresh at `Pending`.
    pub fn retry(&self, entering_at: Phase) -> Self {
        let mut run = Self::new(
            self.workflow_id,
            self.script_run_id,
            self.handler_type,
            self.handler_name.clone(),
        );
        run.retry_of = Some(self.id);
        run.phase = entering_at;
        if matches!(entering_at, Phase::Emitting) {
            run.prepare_result = self.prepare_result.clone();
        }
        run
    }

    pub fn advance(&mut self, next: Phase) -> Result<(), EngineError> {
        if !self.phase.can_advance_to(next, self.handler_type) {
            return Err(EngineError::internal(format!(
                "illegal phase transition {:?} -> {next:?} for {:?} run",
                self.phase, self.handler_type
            )));
        }
        self.phase = next;
        self.updated_at = Utc::now();
        match next {
            Phase::Committed => self.status = HandlerStatus::Committed,
            Phase::Failed => {
                let kind = self.error.as_ref().map(|e| e.kind).unwrap_or(crate::error::ErrorKind::Internal);
                self.status = HandlerStatus::Failed(kind);
            }
            _ => {}
        }
        Ok(())
    }

    pub fn fail(&mut self, error: EngineError) {
        self.error = Some(error);
        let _ = self.advance(Phase::Failed);
    }
}
