//! The handler run driver (spec.md §4.4): walks one `HandlerRun` through
//! its phase sequence, calling into the sandbox for each phase-scoped
//! capability and gating every tool/bus operation along the way.

pub mod gate;

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::bus::EventBus;
use crate::domain::{
    Event, HandlerRun, HandlerState, HandlerType, MutationOutcome, Phase, PrepareResult,
};
use crate::error::EngineError;
use crate::external::sandbox::MutateDecision;
use crate::external::{ErrorClassifier, Sandbox, ToolRegistry};
use crate::ledger::MutationLedger;
use crate::persistence::{EngineStore, ReservationRequest, StoreError};

pub use gate::{GateError, OperationKind, ToolGate};

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Sandbox(#[from] crate::external::sandbox::SandboxError),

    #[error(transparent)]
    Gate(#[from] GateError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl HandlerError {
    /// The classified error this run should record, once it's decided the
    /// run is going to fail. Store/gate failures are engine-internal or
    /// logic violations; sandbox failures carry the classifier's verdict.
    pub fn into_engine_error(self, classifier: &dyn ErrorClassifier) -> EngineError {
        match self {
            HandlerError::Store(e) => EngineError::internal(e.to_string()),
            HandlerError::Gate(e) => EngineError::logic(e.to_string()),
            HandlerError::Engine(e) => e,
            HandlerError::Sandbox(crate::external::sandbox::SandboxError::Engine(e)) => e,
            HandlerError::Sandbox(crate::external::sandbox::SandboxError::Transport(msg)) => {
                classifier.classify(&anyhow::anyhow!(msg))
            }
        }
    }
}

pub struct HandlerDriver {
    store: Arc<dyn EngineStore>,
    bus: EventBus,
    ledger: MutationLedger,
    gate: Arc<ToolGate>,
    sandbox: Arc<dyn Sandbox>,
    tools: ToolRegistry,
    classifier: Arc<dyn ErrorClassifier>,
}

impl HandlerDriver {
    pub fn new(
        store: Arc<dyn EngineStore>,
        gate: Arc<ToolGate>,
        sandbox: Arc<dyn Sandbox>,
        tools: ToolRegistry,
        classifier: Arc<dyn ErrorClassifier>,
    ) -> Self {
        Self {
            bus: EventBus::new(Arc::clone(&store)),
            ledger: MutationLedger::new(Arc::clone(&store)),
            store,
            gate,
            sandbox,
            tools,
            classifier,
        }
    }

    pub fn store(&self) -> &Arc<dyn EngineStore> {
        &self.store
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn classifier(&self) -> &Arc<dyn ErrorClassifier> {
        &self.classifier
    }

    /// Drive a producer run from `pending` to `committed`
    /// (spec.md §4.4: `pending -> executing -> committed`).
    #[instrument(skip(self), fields(run_id = %run.id, handler = %run.handler_name))]
    pub async fn run_producer(&self, run: &mut HandlerRun) -> Result<(), HandlerError> {
        debug_assert_eq!(run.handler_type, HandlerType::Producer);

        self.store
            .advance_handler_run(run.id, Phase::Executing, None)
            .await?;
        run.phase = Phase::Executing;

        let input_state = self
            .store
            .get_handler_state(run.workflow_id, &run.handler_name)
            .await?
            .map(|s| s.data)
            .unwrap_or(serde_json::Value::Null);

        self.gate
            .check(run.id, HandlerType::Producer, Phase::Executing, OperationKind::Read)?;
        let outcome = self
            .sandbox
            .run_producer(run.workflow_id, &run.handler_name, input_state)
            .await?;

        for (topic, message) in outcome.publish {
            self.gate.check(
                run.id,
                HandlerType::Producer,
                Phase::Executing,
                OperationKind::TopicPublish,
            )?;
            self.bus
                .publish(run.workflow_id, &topic, message, run.id)
                .await?;
        }

        self.store
            .advance_handler_run(
                run.id,
                Phase::Committed,
                Some(HandlerState::new(
                    run.workflow_id,
                    run.handler_name.clone(),
                    outcome.output_state,
                )),
            )
            .await?;
        run.phase = Phase::Committed;
        info!("producer run committed");
        Ok(())
    }

    /// Drive a consumer run from `pending` through to either `committed` or
    /// a short-circuit at `mutated`/`committed` when there's nothing to do
    /// (spec.md §4.4 edge cases: no events to process, consumer declines to
    /// mutate). `candidate_events` are the topic's currently-`pending`
    /// events this run is offered; `prepare` decides which, if any, to
    /// reserve.
    #[instrument(skip(self, candidate_events), fields(run_id = %run.id, handler = %run.handler_name))]
    pub async fn run_consumer(
        &self,
        run: &mut HandlerRun,
        candidate_events: Vec<Event>,
    ) -> Result<(), HandlerError> {
        debug_assert_eq!(run.handler_type, HandlerType::Consumer);

        if run.phase == Phase::Pending {
            self.prepare(run, candidate_events).await?;
        }
        if run.phase == Phase::Prepared {
            self.mutate(run).await?;
        }
        if run.phase == Phase::Mutated {
            self.emit(run).await?;
        }
        Ok(())
    }

    async fn prepare(&self, run: &mut HandlerRun, candidate_events: Vec<Event>) -> Result<(), HandlerError> {
        self.store
            .advance_handler_run(run.id, Phase::Preparing, None)
            .await?;
        run.phase = Phase::Preparing;

        let input_state = self
            .store
            .get_handler_state(run.workflow_id, &run.handler_name)
            .await?
            .map(|s| s.data)
            .unwrap_or(serde_json::Value::Null);

        self.gate.check(
            run.id,
            HandlerType::Consumer,
            Phase::Preparing,
            OperationKind::Read,
        )?;
        let prepare_result: PrepareResult = self
            .sandbox
            .run_prepare(run.workflow_id, &run.handler_name, input_state, &candidate_events)
            .await?;

        if !prepare_result.reservations.is_empty() {
            self.gate.check(
                run.id,
                HandlerType::Consumer,
                Phase::Preparing,
                OperationKind::TopicPeek,
            )?;
            let requests = prepare_result
                .reservations
                .iter()
                .map(|r| ReservationRequest {
                    topic: r.topic.clone(),
                    event_ids: r.event_ids.clone(),
                })
                .collect();
            self.bus.reserve(run.id, requests).await?;
        }

        self.store
            .set_handler_run_prepare_result(run.id, prepare_result.clone())
            .await?;
        run.prepare_result = Some(prepare_result);

        self.store.advance_handler_run(run.id, Phase::Prepared, None).await?;
        run.phase = Phase::Prepared;
        Ok(())
    }

    async fn mutate(&self, run: &mut HandlerRun) -> Result<(), HandlerError> {
        let Some(prepare_result) = run.prepare_result.clone() else {
            return Err(EngineError::internal("prepared run has no prepare_result").into());
        };

        let Some(intended) = prepare_result.intended_mutation else {
            // No mutation intended — skip straight to `mutated` with no outcome.
            self.store
                .advance_handler_run(run.id, Phase::Mutating, None)
                .await?;
            run.phase = Phase::Mutating;
            self.store
                .advance_handler_run(run.id, Phase::Mutated, None)
                .await?;
            run.phase = Phase::Mutated;
            return Ok(());
        };

        self.store
            .advance_handler_run(run.id, Phase::Mutating, None)
            .await?;
        run.phase = Phase::Mutating;

        self.gate
            .check(run.id, HandlerType::Consumer, Phase::Mutating, OperationKind::Mutate)?;
        let decision = self
            .sandbox
            .run_mutate(run.workflow_id, &run.handler_name, &intended)
            .await?;

        let outcome = match decision {
            MutateDecision::Skip => {
                self.gate.forget(run.id);
                MutationOutcome::Skipped
            }
            MutateDecision::Proceed => self.perform_mutation(run, &intended).await?,
        };

        self.store
            .set_handler_run_mutation_outcome(run.id, outcome)
            .await?;
        run.mutation_outcome = outcome;

        self.store.advance_handler_run(run.id, Phase::Mutated, None).await?;
        run.phase = Phase::Mutated;
        Ok(())
    }

    async fn perform_mutation(
        &self,
        run: &HandlerRun,
        intended: &crate::domain::IntendedMutation,
    ) -> Result<MutationOutcome, HandlerError> {
        let mutation = self
            .ledger
            .create_pending(
                run.id,
                intended.namespace.as_str(),
                intended.method.as_str(),
                intended.params.clone(),
                intended.idempotency_key.clone(),
            )
            .await?;
        self.ledger.mark_in_flight(mutation.id).await?;

        let Some(tool) = self.tools.get(&intended.namespace) else {
            let err = EngineError::internal(format!("no tool registered for {}", intended.namespace));
            self.ledger.mark_failed(mutation.id, err.to_string()).await?;
            return Err(err.into());
        };

        match tool.mutate(&intended.method, intended.params.clone()).await {
            Ok(result) => {
                self.ledger.mark_applied(mutation.id, result).await?;
                Ok(MutationOutcome::Success)
            }
            Err(engine_err) if engine_err.kind == crate::error::ErrorKind::Network => {
                // The call may or may not have reached the provider — this
                // is exactly the ambiguity the ledger exists for.
                self.ledger
                    .mark_indeterminate(mutation.id, engine_err.to_string())
                    .await?;
                warn!(mutation_id = %mutation.id, "mutation outcome indeterminate after network error");
                Err(engine_err.into())
            }
            Err(engine_err) => {
                self.ledger.mark_failed(mutation.id, engine_err.to_string()).await?;
                Err(engine_err.into())
            }
        }
    }

    async fn emit(&self, run: &mut HandlerRun) -> Result<(), HandlerError> {
        self.store
            .advance_handler_run(run.id, Phase::Emitting, None)
            .await?;
        run.phase = Phase::Emitting;

        let input_state = self
            .store
            .get_handler_state(run.workflow_id, &run.handler_name)
            .await?
            .map(|s| s.data)
            .unwrap_or(serde_json::Value::Null);
        let mutation_result = self
            .ledger
            .get_for_run(run.id)
            .await?
            .and_then(|m| m.result);

        self.gate.check(
            run.id,
            HandlerType::Consumer,
            Phase::Emitting,
            OperationKind::Read,
        )?;
        let step = self
            .sandbox
            .run_next(run.workflow_id, &run.handler_name, input_state, mutation_result)
            .await?;

        for (topic, message) in step.publish {
            self.gate.check(
                run.id,
                HandlerType::Consumer,
                Phase::Emitting,
                OperationKind::TopicPublish,
            )?;
            self.bus
                .publish(run.workflow_id, &topic, message, run.id)
                .await?;
        }

        self.bus.consume(run.id).await?;
        self.store
            .advance_handler_run(
                run.id,
                Phase::Committed,
                Some(HandlerState::new(
                    run.workflow_id,
                    run.handler_name.clone(),
                    step.output_state,
                )),
            )
            .await?;
        run.phase = Phase::Committed;
        debug!("consumer run committed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{IntendedMutation, TopicReservation, Workflow};
    use crate::external::classifier::HttpStatusClassifier;
    use crate::external::sandbox::test_support::{MutateDecisionKind, ScriptedSandbox};
    use crate::external::sandbox::{ConsumerStep, ProducerOutcome};
    use crate::external::tool::test_support::EchoTool;
    use crate::persistence::MemoryEngineStore;

    fn driver(sandbox: ScriptedSandbox, tools: ToolRegistry) -> (HandlerDriver, Arc<MemoryEngineStore>) {
        let store = Arc::new(MemoryEngineStore::new());
        let driver = HandlerDriver::new(
            store.clone(),
            Arc::new(ToolGate::new()),
            Arc::new(sandbox),
            tools,
            Arc::new(HttpStatusClassifier),
        );
        (driver, store)
    }

    #[tokio::test]
    async fn producer_commits_and_publishes() {
        let sandbox = ScriptedSandbox {
            producer_outcome: ProducerOutcome {
                output_state: serde_json::json!({"cursor": "abc"}),
                publish: vec![(
                    "inbound_emails".into(),
                    crate::bus::OutgoingMessage {
                        message_id: "m1".into(),
                        title: "t".into(),
                        payload: serde_json::json!({}),
                    },
                )],
            },
            ..Default::default()
        };
        let (driver, store) = driver(sandbox, ToolRegistry::new());
        let workflow = Workflow::new(Uuid::now_v7(), "wf");
        let workflow_id = workflow.id;
        store.create_workflow(workflow).await.unwrap();
        let script_run_id = Uuid::now_v7();
        let mut run = HandlerRun::new(workflow_id, script_run_id, HandlerType::Producer, "gmail_watcher");
        store.create_handler_run(run.clone()).await.unwrap();

        driver.run_producer(&mut run).await.unwrap();

        assert_eq!(run.phase, Phase::Committed);
        let events = store
            .peek_events(workflow_id, "inbound_emails", Default::default())
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        let state = store
            .get_handler_state(workflow_id, "gmail_watcher")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.data, serde_json::json!({"cursor": "abc"}));
    }

    #[tokio::test]
    async fn consumer_with_no_intended_mutation_short_circuits_to_mutated() {
        let sandbox = ScriptedSandbox {
            prepare_result: PrepareResult {
                reservations: vec![],
                intended_mutation: None,
            },
            consumer_step: ConsumerStep {
                output_state: serde_json::json!({"done": true}),
                publish: vec![],
            },
            ..Default::default()
        };
        let (driver, store) = driver(sandbox, ToolRegistry::new());
        let workflow = Workflow::new(Uuid::now_v7(), "wf");
        let workflow_id = workflow.id;
        store.create_workflow(workflow).await.unwrap();
        let mut run = HandlerRun::new(workflow_id, Uuid::now_v7(), HandlerType::Consumer, "biller");
        store.create_handler_run(run.clone()).await.unwrap();

        driver.run_consumer(&mut run, vec![]).await.unwrap();

        assert_eq!(run.phase, Phase::Committed);
        assert_eq!(run.mutation_outcome, MutationOutcome::None);
    }

    #[tokio::test]
    async fn consumer_mutation_proceeds_and_applies() {
        let mut tools = ToolRegistry::new();
        tools.register(Arc::new(EchoTool {
            namespace: "email".into(),
        }));
        let sandbox = ScriptedSandbox {
            prepare_result: PrepareResult {
                reservations: vec![TopicReservation {
                    topic: "inbound_emails".into(),
                    event_ids: vec![],
                }],
                intended_mutation: Some(IntendedMutation {
                    namespace: "email".into(),
                    method: "send".into(),
                    params: serde_json::json!({"to": "a@b.com"}),
                    idempotency_key: None,
                    ui_title: None,
                }),
            },
            mutate_decision: MutateDecisionKind::Proceed,
            consumer_step: ConsumerStep::default(),
            ..Default::default()
        };
        let (driver, store) = driver(sandbox, tools);
        let workflow = Workflow::new(Uuid::now_v7(), "wf");
        let workflow_id = workflow.id;
        store.create_workflow(workflow).await.unwrap();
        let mut run = HandlerRun::new(workflow_id, Uuid::now_v7(), HandlerType::Consumer, "biller");
        store.create_handler_run(run.clone()).await.unwrap();

        driver.run_consumer(&mut run, vec![]).await.unwrap();

        assert_eq!(run.phase, Phase::Committed);
        assert_eq!(run.mutation_outcome, MutationOutcome::Success);
        let mutation = store.get_mutation_by_handler_run(run.id).await.unwrap().unwrap();
        assert_eq!(mutation.status, crate::domain::MutationStatus::Applied);
    }

    #[tokio::test]
    async fn consumer_mutation_skip_records_skipped_outcome() {
        let sandbox = ScriptedSandbox {
            prepare_result: PrepareResult {
                reservations: vec![],
                intended_mutation: Some(IntendedMutation {
                    namespace: "email".into(),
                    method: "send".into(),
                    params: serde_json::json!({}),
                    idempotency_key: None,
                    ui_title: None,
                }),
            },
            mutate_decision: MutateDecisionKind::Skip,
            ..Default::default()
        };
        let (driver, store) = driver(sandbox, ToolRegistry::new());
        let workflow = Workflow::new(Uuid::now_v7(), "wf");
        let workflow_id = workflow.id;
        store.create_workflow(workflow).await.unwrap();
        let mut run = HandlerRun::new(workflow_id, Uuid::now_v7(), HandlerType::Consumer, "biller");
        store.create_handler_run(run.clone()).await.unwrap();

        driver.run_consumer(&mut run, vec![]).await.unwrap();

        assert_eq!(run.mutation_outcome, MutationOutcome::Skipped);
        assert!(store.get_mutation_by_handler_run(run.id).await.unwrap().is_none());
    }
}
