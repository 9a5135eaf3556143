//! The tool gate (spec.md §6): which operations a handler may perform
//! varies strictly by phase, and a consumer gets at most one `mutate` per
//! run. Every call into `crate::external::Tool` and `crate::bus::EventBus`
//! from handler code passes through here first.

use std::collections::HashSet;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::domain::{HandlerType, Phase};
use crate::error::EngineError;

/// The kinds of operation the gate discriminates between (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Read,
    Mutate,
    TopicPeek,
    TopicPublish,
    /// Opaque-bytes write into this run's `HandlerState` (spec.md §4.1).
    RegisterInput,
}

/// Whether `op` is permitted for a handler of `handler_type` currently in
/// `phase`. Transitional/terminal phases (`pending`, `prepared`, `mutated`,
/// `committed`, `failed`) run no handler code and permit nothing.
fn matrix_allows(handler_type: HandlerType, phase: Phase, op: OperationKind) -> bool {
    use OperationKind::*;
    match (handler_type, phase) {
        (HandlerType::Producer, Phase::Executing) => {
            matches!(op, Read | TopicPublish | RegisterInput)
        }
        (HandlerType::Consumer, Phase::Preparing) => {
            matches!(op, Read | TopicPeek | RegisterInput)
        }
        (HandlerType::Consumer, Phase::Mutating) => matches!(op, Read | Mutate),
        (HandlerType::Consumer, Phase::Emitting) => {
            matches!(op, Read | TopicPublish | RegisterInput)
        }
        _ => false,
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("{op:?} is not permitted in phase {phase:?} for a {handler_type:?} run")]
    NotPermitted {
        op: OperationKind,
        phase: Phase,
        handler_type: HandlerType,
    },

    #[error("run {0} has already performed its one mutation this run")]
    MutationAlreadyUsed(Uuid),
}

impl From<GateError> for EngineError {
    fn from(err: GateError) -> Self {
        EngineError::logic(err.to_string())
    }
}

/// Tracks, per process, which runs have already spent their one mutation.
/// The ledger's uniqueness constraint on `Mutation.handler_run_id` is the
/// durable backstop; this is the in-process fast check handler code hits
/// before ever reaching the ledger.
pub struct ToolGate {
    mutated_runs: Mutex<HashSet<Uuid>>,
}

impl ToolGate {
    pub fn new() -> Self {
        Self {
            mutated_runs: Mutex::new(HashSet::new()),
        }
    }

    pub fn check(
        &self,
        run_id: Uuid,
        handler_type: HandlerType,
        phase: Phase,
        op: OperationKind,
    ) -> Result<(), GateError> {
        if !matrix_allows(handler_type, phase, op) {
            return Err(GateError::NotPermitted {
                op,
                phase,
                handler_type,
            });
        }
        if op == OperationKind::Mutate {
            let mut mutated = self.mutated_runs.lock();
            if mutated.contains(&run_id) {
                return Err(GateError::MutationAlreadyUsed(run_id));
            }
            mutated.insert(run_id);
        }
        Ok(())
    }

    /// Release a run's mutation slot (used when a retry restarts a run
    /// before it ever attempted to mutate).
    pub fn forget(&self, run_id: Uuid) {
        self.mutated_runs.lock().remove(&run_id);
    }
}

impl Default for ToolGate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn producer_can_publish_while_executing() {
        let gate = ToolGate::new();
        assert!(gate
            .check(
                Uuid::now_v7(),
                HandlerType::Producer,
                Phase::Executing,
                OperationKind::TopicPublish
            )
            .is_ok());
    }

    #[test]
    fn consumer_cannot_mutate_while_preparing() {
        let gate = ToolGate::new();
        assert!(gate
            .check(
                Uuid::now_v7(),
                HandlerType::Consumer,
                Phase::Preparing,
                OperationKind::Mutate
            )
            .is_err());
    }

    #[test]
    fn consumer_cannot_mutate_twice_in_one_run() {
        let gate = ToolGate::new();
        let run_id = Uuid::now_v7();
        assert!(gate
            .check(run_id, HandlerType::Consumer, Phase::Mutating, OperationKind::Mutate)
            .is_ok());
        assert!(gate
            .check(run_id, HandlerType::Consumer, Phase::Mutating, OperationKind::Mutate)
            .is_err());
    }

    #[test]
    fn no_handler_code_runs_in_transitional_phases() {
        let gate = ToolGate::new();
        assert!(gate
            .check(Uuid::now_v7(), HandlerType::Consumer, Phase::Prepared, OperationKind::Read)
            .is_err());
        assert!(gate
            .check(Uuid::now_v7(), HandlerType::Consumer, Phase::Mutated, OperationKind::Read)
            .is_err());
    }
}
