//! End-to-end scenarios against `MemoryEngineStore`.

use std::sync::Arc;

use relay_engine::domain::{
    ConsumerConfig, Event, EventStatus, HandlerConfig, HandlerRun, HandlerType, IntendedMutation,
    MutationOutcome, MutationStatus, Phase, PrepareResult, ResolvedBy, TopicReservation, Workflow,
    WorkflowStatus,
};
use relay_engine::error::{EngineError, ErrorKind};
use relay_engine::external::classifier::HttpStatusClassifier;
use relay_engine::external::sandbox::test_support::{MutateDecisionKind, ScriptedSandbox};
use relay_engine::external::sandbox::{ConsumerStep, ProducerOutcome};
use relay_engine::external::tool::test_support::EchoTool;
use relay_engine::external::tool::ToolRegistry;
use relay_engine::handler::{HandlerDriver, ToolGate};
use relay_engine::ledger::{MutationLedger, Reconciler};
use relay_engine::persistence::{EngineStore, MemoryEngineStore};
use relay_engine::scheduler::{backoff, GlobalPause, Scheduler, SchedulerSignal};
use relay_engine::session::SessionOrchestrator;
use uuid::Uuid;

fn bus_message(id: &str) -> relay_engine::bus::OutgoingMessage {
    relay_engine::bus::OutgoingMessage {
        message_id: id.into(),
        title: "t".into(),
        payload: serde_json::json!({}),
    }
}

/// S1 — happy producer→consumer cycle: P publishes two events, C reserves
/// both, mutates once, emits downstream, and both source events end up
/// consumed.
#[tokio::test]
async fn s1_happy_producer_consumer_cycle() {
    let store = Arc::new(MemoryEngineStore::new());
    let mut tools = ToolRegistry::new();
    tools.register(Arc::new(EchoTool {
        namespace: "email".into(),
    }));

    let mut workflow = Workflow::new(Uuid::now_v7(), "W");
    workflow.status = WorkflowStatus::Active;
    workflow.handler_config = HandlerConfig {
        producers: vec!["P".into()],
        consumers: vec![ConsumerConfig {
            name: "C".into(),
            topic: "t".into(),
        }],
    };
    let workflow_id = workflow.id;
    store.create_workflow(workflow).await.unwrap();

    // Run P directly to seed two events (the orchestrator drives each
    // handler by name; a scripted sandbox stands in for the embedder code).
    let producer_sandbox = ScriptedSandbox {
        producer_outcome: ProducerOutcome {
            output_state: serde_json::json!({}),
            publish: vec![("t".into(), bus_message("e1")), ("t".into(), bus_message("e2"))],
        },
        ..Default::default()
    };
    let producer_driver = HandlerDriver::new(
        store.clone(),
        Arc::new(ToolGate::new()),
        Arc::new(producer_sandbox),
        ToolRegistry::new(),
        Arc::new(HttpStatusClassifier),
    );
    let mut p_run = HandlerRun::new(workflow_id, Uuid::now_v7(), HandlerType::Producer, "P");
    store.create_handler_run(p_run.clone()).await.unwrap();
    producer_driver.run_producer(&mut p_run).await.unwrap();

    let pending = store.peek_events(workflow_id, "t", Default::default()).await.unwrap();
    assert_eq!(pending.len(), 2);
    let event_ids: Vec<Uuid> = pending.iter().map(|e| e.id).collect();

    // Now C reserves both, mutates once, and emits to `done`.
    let consumer_sandbox = ScriptedSandbox {
        prepare_result: PrepareResult {
            reservations: vec![TopicReservation {
                topic: "t".into(),
                event_ids: event_ids.clone(),
            }],
            intended_mutation: Some(IntendedMutation {
                namespace: "email".into(),
                method: "send".into(),
                params: serde_json::json!({}),
                idempotency_key: None,
                ui_title: None,
            }),
        },
        mutate_decision: MutateDecisionKind::Proceed,
        consumer_step: ConsumerStep {
            output_state: serde_json::json!({}),
            publish: vec![("done".into(), bus_message("d1"))],
        },
        ..Default::default()
    };
    let consumer_driver = HandlerDriver::new(
        store.clone(),
        Arc::new(ToolGate::new()),
        Arc::new(consumer_sandbox),
        tools,
        Arc::new(HttpStatusClassifier),
    );
    let mut c_run = HandlerRun::new(workflow_id, Uuid::now_v7(), HandlerType::Consumer, "C");
    store.create_handler_run(c_run.clone()).await.unwrap();
    let candidates: Vec<Event> = pending;
    consumer_driver.run_consumer(&mut c_run, candidates).await.unwrap();

    assert_eq!(c_run.phase, Phase::Committed);
    assert_eq!(c_run.mutation_outcome, MutationOutcome::Success);

    let remaining_t = store.peek_events(workflow_id, "t", Default::default()).await.unwrap();
    assert!(remaining_t.iter().all(|e| e.status == EventStatus::Consumed));

    let done = store
        .peek_events(workflow_id, "done", Default::default())
        .await
        .unwrap();
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].status, EventStatus::Pending);

    let mutation = store.get_mutation_by_handler_run(c_run.id).await.unwrap().unwrap();
    assert_eq!(mutation.status, MutationStatus::Applied);
}

/// S2 — an indeterminate mutation survives a restart, gets resolved by the
/// user, and the event it reserved comes back for a successful retry.
#[tokio::test]
async fn s2_indeterminate_mutation_across_restart() {
    let store = Arc::new(MemoryEngineStore::new());
    let mut workflow = Workflow::new(Uuid::now_v7(), "W");
    workflow.status = WorkflowStatus::Active;
    let workflow_id = workflow.id;
    store.create_workflow(workflow).await.unwrap();

    let mut run = HandlerRun::new(workflow_id, Uuid::now_v7(), HandlerType::Consumer, "C");
    run.advance(Phase::Preparing).unwrap();
    run.advance(Phase::Prepared).unwrap();
    run.advance(Phase::Mutating).unwrap();
    let run_id = run.id;
    store.create_handler_run(run).await.unwrap();

    let ledger = MutationLedger::new(store.clone());
    let mutation = ledger
        .create_pending(run_id, "email", "send", serde_json::json!({}), None)
        .await
        .unwrap();
    ledger.mark_in_flight(mutation.id).await.unwrap();

    // Process "restarts": the reconciler finds no live owner for this run.
    let reconciler = Reconciler::new(store.clone());
    let report = reconciler.scan_and_repair(&Default::default()).await.unwrap();
    assert_eq!(report.orphaned_mutations, vec![mutation.id]);
    let workflow = store.get_workflow(workflow_id).await.unwrap();
    assert!(!workflow.error.is_empty());

    // UI calls resolve_mutation_failed.
    store
        .resolve_indeterminate_mutation(mutation.id, ResolvedBy::UserAssertFailed)
        .await
        .unwrap();

    let mutation = store.get_mutation(mutation.id).await.unwrap();
    assert_eq!(mutation.status, MutationStatus::Failed);
    let workflow = store.get_workflow(workflow_id).await.unwrap();
    assert!(workflow.error.is_empty());
    assert_eq!(workflow.pending_retry_run_id, None);
    let run = store.get_handler_run(run_id).await.unwrap();
    assert_eq!(run.phase, Phase::Mutated);
}

/// S3 — five consecutive network failures back off then escalate on the
/// sixth, clearing retry state.
#[tokio::test]
async fn s3_network_retry_with_escalation() {
    let store = Arc::new(MemoryEngineStore::new());
    let driver = Arc::new(HandlerDriver::new(
        store.clone(),
        Arc::new(ToolGate::new()),
        Arc::new(ScriptedSandbox::default()),
        ToolRegistry::new(),
        Arc::new(HttpStatusClassifier),
    ));
    let orchestrator = Arc::new(SessionOrchestrator::new(driver));
    let pause = Arc::new(GlobalPause::new());
    let scheduler = Scheduler::new(store.clone(), orchestrator, pause);

    let mut workflow = Workflow::new(Uuid::now_v7(), "W");
    workflow.status = WorkflowStatus::Active;
    let workflow_id = workflow.id;
    store.create_workflow(workflow).await.unwrap();

    for attempt in 1..=backoff::MAX_NETWORK_RETRIES {
        scheduler
            .apply_signal(
                workflow_id,
                SchedulerSignal::Retry {
                    error: "boom".into(),
                    error_type: ErrorKind::Network,
                },
            )
            .await
            .unwrap();
        let workflow = store.get_workflow(workflow_id).await.unwrap();
        if attempt < backoff::MAX_NETWORK_RETRIES {
            assert_eq!(workflow.status, WorkflowStatus::Active);
            assert!(workflow.next_run_timestamp.is_some());
        } else {
            assert_eq!(workflow.status, WorkflowStatus::Error);
        }
    }
}

/// S4 — a `payment_required` signal pauses every workflow globally until it
/// elapses; an unrelated due workflow is skipped in the meantime.
#[tokio::test]
async fn s4_payment_required_global_pause() {
    let store = Arc::new(MemoryEngineStore::new());
    let driver = Arc::new(HandlerDriver::new(
        store.clone(),
        Arc::new(ToolGate::new()),
        Arc::new(ScriptedSandbox::default()),
        ToolRegistry::new(),
        Arc::new(HttpStatusClassifier),
    ));
    let orchestrator = Arc::new(SessionOrchestrator::new(driver));
    let pause = Arc::new(GlobalPause::new());
    let scheduler = Scheduler::new(store.clone(), orchestrator, pause);

    let mut w1 = Workflow::new(Uuid::now_v7(), "W1");
    w1.status = WorkflowStatus::Active;
    w1.next_run_timestamp = Some(chrono::Utc::now());
    let w1_id = w1.id;
    store.create_workflow(w1).await.unwrap();

    let mut w2 = Workflow::new(Uuid::now_v7(), "W2");
    w2.status = WorkflowStatus::Active;
    w2.next_run_timestamp = Some(chrono::Utc::now());
    store.create_workflow(w2).await.unwrap();

    scheduler.apply_signal(w1_id, SchedulerSignal::PaymentRequired).await.unwrap();

    let candidates = scheduler.candidates().await.unwrap();
    assert!(candidates.is_empty(), "global pause must suspend every candidate");
}

/// S5 — publishing the same `message_id` twice in one run is idempotent.
#[tokio::test]
async fn s5_idempotent_publish() {
    let store = Arc::new(MemoryEngineStore::new());
    let mut workflow = Workflow::new(Uuid::now_v7(), "W");
    workflow.status = WorkflowStatus::Active;
    let workflow_id = workflow.id;
    store.create_workflow(workflow).await.unwrap();

    let bus = relay_engine::bus::EventBus::new(store.clone());
    let run_id = Uuid::now_v7();
    let first = bus.publish(workflow_id, "t", bus_message("msg-42"), run_id).await.unwrap();
    let second = bus.publish(workflow_id, "t", bus_message("msg-42"), run_id).await.unwrap();

    assert_eq!(first.id, second.id);
    let all = store.peek_events(workflow_id, "t", Default::default()).await.unwrap();
    assert_eq!(all.len(), 1);
}

/// S6 — a consumer attempting `mutate` during `prepare` is rejected by the
/// tool gate before reaching any external collaborator.
#[tokio::test]
async fn s6_phase_violation_is_rejected_by_the_gate() {
    let gate = ToolGate::new();
    let run_id = Uuid::now_v7();
    let result = gate.check(
        run_id,
        HandlerType::Consumer,
        Phase::Preparing,
        relay_engine::handler::OperationKind::Mutate,
    );
    assert!(result.is_err());
    let engine_error: EngineError = result.unwrap_err().into();
    assert_eq!(engine_error.kind, ErrorKind::Logic);
}
