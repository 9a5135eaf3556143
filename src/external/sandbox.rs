//! `Sandbox`: where handler code actually runs (spec.md §1 "the sandbox
//! VM" is out of scope). The engine calls into it once per phase capability
//! — `producer`, `prepare`, `mutate`, `next` — and gets back a typed
//! result; it never sees the handler's source or runtime.

use async_trait::async_trait;
use uuid::Uuid;

use crate::bus::OutgoingMessage;
use crate::domain::{Event, IntendedMutation, PrepareResult};
use crate::error::EngineError;

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("sandbox transport error: {0}")]
    Transport(String),
}

/// What a producer handler body returns: the state to persist and the
/// messages it wants published.
#[derive(Debug, Clone, Default)]
pub struct ProducerOutcome {
    pub output_state: serde_json::Value,
    pub publish: Vec<(String, OutgoingMessage)>,
}

/// Whether a consumer actually wants to go through with its `intended_mutation`.
#[derive(Debug, Clone)]
pub enum MutateDecision {
    Proceed,
    Skip,
}

/// What a consumer's `next` capability returns: final state and anything it
/// publishes downstream.
#[derive(Debug, Clone, Default)]
pub struct ConsumerStep {
    pub output_state: serde_json::Value,
    pub publish: Vec<(String, OutgoingMessage)>,
}

#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Run a producer's body (phase `executing`).
    async fn run_producer(
        &self,
        workflow_id: Uuid,
        handler_name: &str,
        input_state: serde_json::Value,
    ) -> Result<ProducerOutcome, SandboxError>;

    /// Run a consumer's `prepare` capability: decide what to reserve and
    /// whether it intends a mutation (phase `preparing`).
    async fn run_prepare(
        &self,
        workflow_id: Uuid,
        handler_name: &str,
        input_state: serde_json::Value,
        reserved_events: &[Event],
    ) -> Result<PrepareResult, SandboxError>;

    /// Run a consumer's `mutate` capability: confirm or decline the
    /// `intended_mutation` from `prepare` (phase `mutating`).
    async fn run_mutate(
        &self,
        workflow_id: Uuid,
        handler_name: &str,
        intended: &IntendedMutation,
    ) -> Result<MutateDecision, SandboxError>;

    /// Run a consumer's `next` capability: finish up and decide what to
    /// publish now that the mutation has settled (phase `emitting`).
    async fn run_next(
        &self,
        workflow_id: Uuid,
        handler_name: &str,
        input_state: serde_json::Value,
        mutation_result: Option<serde_json::Value>,
    ) -> Result<ConsumerStep, SandboxError>;
}

#[cfg(any(test, feature = "test-support"))]
pub mod test_support {
    use super::*;

    /// A sandbox that runs no real handler code; each phase returns a
    /// caller-supplied canned result. Useful for driving the handler state
    /// machine in isolation.
    #[derive(Default)]
    pub struct ScriptedSandbox {
        pub producer_outcome: ProducerOutcome,
        pub producer_error: Option<EngineError>,
        pub prepare_result: PrepareResult,
        pub mutate_decision: MutateDecisionKind,
        pub consumer_step: ConsumerStep,
    }

    #[derive(Default, Clone, Copy)]
    pub enum MutateDecisionKind {
        #[default]
        Proceed,
        Skip,
    }

    #[async_trait]
    impl Sandbox for ScriptedSandbox {
        async fn run_producer(
            &self,
            _workflow_id: Uuid,
            _handler_name: &str,
            _input_state: serde_json::Value,
        ) -> Result<ProducerOutcome, SandboxError> {
            if let Some(err) = self.producer_error.clone() {
                return Err(err.into());
            }
            Ok(self.producer_outcome.clone())
        }

        async fn run_prepare(
            &self,
            _workflow_id: Uuid,
            _handler_name: &str,
            _input_state: serde_json::Value,
            _reserved_events: &[Event],
        ) -> Result<PrepareResult, SandboxError> {
            Ok(self.prepare_result.clone())
        }

        async fn run_mutate(
            &self,
            _workflow_id: Uuid,
            _handler_name: &str,
            _intended: &IntendedMutation,
        ) -> Result<MutateDecision, SandboxError> {
            Ok(match self.mutate_decision {
                MutateDecisionKind::Proceed => MutateDecision::Proceed,
                MutateDecisionKind::Skip => MutateDecision::Skip,
            })
        }

        async fn run_next(
            &self,
            _workflow_id: Uuid,
            _handler_name: &str,
            _input_state: serde_json::Value,
            _mutation_result: Option<serde_json::Value>,
        ) -> Result<ConsumerStep, SandboxError> {
            Ok(self.consumer_step.clone())
        }
    }
}
