//! The session orchestrator (spec.md §4.5): the single-threaded-per-engine
//! unit of "run this workflow's due handlers now," plus the user-facing
//! resolution API (spec.md §6) that operates on quiescent workflow state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::domain::{
    HandlerRun, HandlerType, Phase, ResolvedBy, ScriptRun, SessionOutcome, TriggerKind, Workflow,
    WorkflowStatus,
};
use crate::error::ErrorKind;
use crate::handler::{HandlerDriver, HandlerError};
use crate::persistence::StoreError;
use crate::scheduler::SchedulerSignal;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// spec.md §5: at most one session in flight across the whole engine.
    #[error("a session is already in progress")]
    AlreadyRunning,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Single-threaded-per-engine session driver: builds a run plan from a
/// workflow's `handler_config`, drives each `HandlerRun` through the phase
/// state machine (`crate::handler`), and translates the outcome into the
/// signal the scheduler needs.
pub struct SessionOrchestrator {
    driver: Arc<HandlerDriver>,
    is_running: AtomicBool,
}

impl SessionOrchestrator {
    pub fn new(driver: Arc<HandlerDriver>) -> Self {
        Self {
            driver,
            is_running: AtomicBool::new(false),
        }
    }

    /// Whether a session is currently in flight anywhere in this engine
    /// (spec.md §5 "the `is_running` latch").
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    fn try_latch(&self) -> Result<(), SessionError> {
        self.is_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(|_| SessionError::AlreadyRunning)
    }

    fn release_latch(&self) {
        self.is_running.store(false, Ordering::SeqCst);
    }

    /// Entry point the scheduler calls for a `schedule`-triggered session
    /// (spec.md §4.7 "Execution").
    #[instrument(skip(self))]
    pub async fn run_scheduled_session(&self, workflow_id: Uuid) -> Result<SchedulerSignal, SessionError> {
        self.try_latch()?;
        let result = self.run_session(workflow_id, TriggerKind::Schedule, None).await;
        self.release_latch();
        result
    }

    /// Resumption on process start (spec.md §4.5): re-attach to the most
    /// recent incomplete session for `workflow_id` by retrying its last
    /// incomplete `HandlerRun`, then continuing the plan from there. A
    /// workflow frozen on an indeterminate mutation (`pending_retry_run_id`
    /// set) is left alone — it needs `resolve_mutation_*` first.
    #[instrument(skip(self))]
    pub async fn resume_session(&self, workflow_id: Uuid) -> Result<SchedulerSignal, SessionError> {
        self.try_latch()?;
        let result = self.run_resume(workflow_id).await;
        self.release_latch();
        result
    }

    /// Scan every workflow with an incomplete session and resume each in
    /// turn. Called once on process start before the scheduler loop begins.
    #[instrument(skip(self))]
    pub async fn resume_all_incomplete(&self) -> Result<Vec<Uuid>, SessionError> {
        let workflow_ids = self.driver.store().list_workflows_with_incomplete_runs().await?;
        let mut resumed = Vec::new();
        for workflow_id in workflow_ids {
            match self.resume_session(workflow_id).await {
                Ok(_) => resumed.push(workflow_id),
                Err(e) => warn!(%workflow_id, error = %e, "resumption failed"),
            }
        }
        Ok(resumed)
    }

    async fn run_resume(&self, workflow_id: Uuid) -> Result<SchedulerSignal, SessionError> {
        let workflow = self.driver.store().get_workflow(workflow_id).await?;
        if workflow.pending_retry_run_id.is_some() {
            return Ok(SchedulerSignal::NeedsAttention {
                error: workflow.error.clone(),
                error_type: ErrorKind::Internal,
            });
        }
        let Some(prior) = self
            .driver
            .store()
            .latest_incomplete_script_run(workflow_id)
            .await?
        else {
            return Ok(SchedulerSignal::Done);
        };
        let Some(&last_run_id) = prior.handler_run_ids.last() else {
            return Ok(SchedulerSignal::Done);
        };
        let last_run = self.driver.store().get_handler_run(last_run_id).await?;
        if matches!(last_run.phase, Phase::Committed | Phase::Failed) {
            return Ok(SchedulerSignal::Done);
        }

        // `mutated`/`emitting` inherit the prepare result and re-enter past
        // the mutate phase; everything earlier starts the run fresh
        // (`HandlerRun::retry`'s documented entry points, spec.md §4.5).
        let entering_at = if matches!(last_run.phase, Phase::Mutated | Phase::Emitting) {
            Phase::Emitting
        } else {
            Phase::Pending
        };
        let retry_run = last_run.retry(entering_at);
        self.run_session(workflow_id, TriggerKind::Resume, Some(retry_run)).await
    }

    async fn run_session(
        &self,
        workflow_id: Uuid,
        trigger_kind: TriggerKind,
        seed_retry: Option<HandlerRun>,
    ) -> Result<SchedulerSignal, SessionError> {
        let workflow = self.driver.store().get_workflow(workflow_id).await?;
        let mut script_run = self.driver.store().create_script_run(workflow_id, trigger_kind).await?;

        if let Some(mut retry_run) = seed_retry {
            self.driver.store().create_handler_run(retry_run.clone()).await?;
            match retry_run.handler_type {
                HandlerType::Producer => {
                    if let Some(signal) = self.step_producer(&mut script_run, &mut retry_run).await? {
                        return Ok(signal);
                    }
                }
                HandlerType::Consumer => {
                    let candidates = self.candidate_events(&workflow, &retry_run.handler_name).await?;
                    if let Some(signal) = self
                        .step_consumer(&mut script_run, &mut retry_run, candidates)
                        .await?
                    {
                        return Ok(signal);
                    }
                }
            }
        }

        for producer_name in &workflow.handler_config.producers {
            let mut run = HandlerRun::new(
                workflow_id,
                script_run.id,
                HandlerType::Producer,
                producer_name.clone(),
            );
            self.driver.store().create_handler_run(run.clone()).await?;
            if let Some(signal) = self.step_producer(&mut script_run, &mut run).await? {
                return Ok(signal);
            }
        }

        for consumer in &workflow.handler_config.consumers {
            loop {
                let pending = self
                    .driver
                    .bus()
                    .peek_pending(workflow_id, &consumer.topic, None)
                    .await?;
                if pending.is_empty() {
                    break;
                }
                let mut run = HandlerRun::new(
                    workflow_id,
                    script_run.id,
                    HandlerType::Consumer,
                    consumer.name.clone(),
                );
                self.driver.store().create_handler_run(run.clone()).await?;
                if let Some(signal) = self.step_consumer(&mut script_run, &mut run, pending).await? {
                    return Ok(signal);
                }
                // A run that reserved nothing made no progress on this
                // topic's pending events; looping again would just offer it
                // the same events forever. Treat that as a pause.
                let reserved_any = run
                    .prepare_result
                    .as_ref()
                    .is_some_and(|p| !p.reservations.is_empty());
                if !reserved_any {
                    break;
                }
            }
        }

        self.driver
            .store()
            .finish_script_run(script_run.id, SessionOutcome::Completed)
            .await?;
        info!(%workflow_id, session_id = %script_run.id, "session completed");
        Ok(SchedulerSignal::Done)
    }

    async fn candidate_events(
        &self,
        workflow: &Workflow,
        handler_name: &str,
    ) -> Result<Vec<crate::domain::Event>, SessionError> {
        let Some(consumer) = workflow
            .handler_config
            .consumers
            .iter()
            .find(|c| c.name == handler_name)
        else {
            return Ok(Vec::new());
        };
        Ok(self
            .driver
            .bus()
            .peek_pending(workflow.id, &consumer.topic, None)
            .await?)
    }

    async fn step_producer(
        &self,
        script_run: &mut ScriptRun,
        run: &mut HandlerRun,
    ) -> Result<Option<SchedulerSignal>, SessionError> {
        self.attach(script_run, run).await?;
        match self.driver.run_producer(run).await {
            Ok(()) => Ok(None),
            Err(e) => Ok(Some(self.fail(script_run, run, e).await?)),
        }
    }

    async fn step_consumer(
        &self,
        script_run: &mut ScriptRun,
        run: &mut HandlerRun,
        candidate_events: Vec<crate::domain::Event>,
    ) -> Result<Option<SchedulerSignal>, SessionError> {
        self.attach(script_run, run).await?;
        match self.driver.run_consumer(run, candidate_events).await {
            Ok(()) => Ok(None),
            Err(e) => Ok(Some(self.fail(script_run, run, e).await?)),
        }
    }

    async fn attach(&self, script_run: &mut ScriptRun, run: &HandlerRun) -> Result<(), SessionError> {
        self.driver
            .store()
            .append_handler_run_to_session(script_run.id, run.id)
            .await?;
        script_run.handler_run_ids.push(run.id);
        Ok(())
    }

    async fn fail(
        &self,
        script_run: &mut ScriptRun,
        run: &HandlerRun,
        err: HandlerError,
    ) -> Result<SchedulerSignal, SessionError> {
        let engine_error = err.into_engine_error(self.driver.classifier().as_ref());
        warn!(run_id = %run.id, error = %engine_error, "handler run failed");
        self.driver.store().fail_handler_run(run.id, engine_error.clone()).await?;

        let signal = Self::signal_for(engine_error.kind, engine_error.message.clone());
        let outcome = match &signal {
            SchedulerSignal::NeedsAttention { .. } | SchedulerSignal::Maintenance { .. } => {
                SessionOutcome::Suspended(engine_error.message.clone())
            }
            _ => SessionOutcome::Failed(engine_error.kind),
        };
        self.driver.store().finish_script_run(script_run.id, outcome).await?;
        Ok(signal)
    }

    fn signal_for(kind: ErrorKind, message: String) -> SchedulerSignal {
        match kind {
            ErrorKind::Network => SchedulerSignal::Retry {
                error: message,
                error_type: kind,
            },
            ErrorKind::Auth | ErrorKind::Permission | ErrorKind::Logic => {
                SchedulerSignal::NeedsAttention {
                    error: message,
                    error_type: kind,
                }
            }
            ErrorKind::PaymentRequired => SchedulerSignal::PaymentRequired,
            ErrorKind::Internal => SchedulerSignal::Maintenance { error: message },
        }
    }

    // -----------------------------------------------------------------
    // User-facing resolution API (spec.md §6). These assume the scheduler
    // is not simultaneously stepping the same workflow — callers are
    // responsible for only invoking them on paused/errored quiescent rows.
    // -----------------------------------------------------------------

    pub async fn pause_workflow(&self, workflow_id: Uuid) -> Result<(), SessionError> {
        self.driver
            .store()
            .update_workflow_fields(workflow_id, Box::new(|w| w.status = WorkflowStatus::Paused))
            .await?;
        Ok(())
    }

    pub async fn resume_workflow(&self, workflow_id: Uuid) -> Result<(), SessionError> {
        self.driver
            .store()
            .update_workflow_fields(workflow_id, Box::new(|w| w.resume()))
            .await?;
        Ok(())
    }

    pub async fn archive_workflow(&self, workflow_id: Uuid) -> Result<(), SessionError> {
        self.driver
            .store()
            .update_workflow_fields(workflow_id, Box::new(|w| w.status = WorkflowStatus::Archived))
            .await?;
        Ok(())
    }

    pub async fn unarchive_workflow(&self, workflow_id: Uuid) -> Result<(), SessionError> {
        self.driver
            .store()
            .update_workflow_fields(workflow_id, Box::new(|w| w.status = WorkflowStatus::Paused))
            .await?;
        Ok(())
    }

    pub async fn resolve_mutation_failed(&self, mutation_id: Uuid) -> Result<(), SessionError> {
        self.driver
            .store()
            .resolve_indeterminate_mutation(mutation_id, ResolvedBy::UserAssertFailed)
            .await?;
        Ok(())
    }

    pub async fn resolve_mutation_skipped(&self, mutation_id: Uuid) -> Result<(), SessionError> {
        self.driver
            .store()
            .resolve_indeterminate_mutation(mutation_id, ResolvedBy::UserSkip)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ConsumerConfig, HandlerConfig, MutationOutcome};
    use crate::external::classifier::HttpStatusClassifier;
    use crate::external::sandbox::test_support::ScriptedSandbox;
    use crate::external::sandbox::ProducerOutcome;
    use crate::external::tool::ToolRegistry;
    use crate::handler::ToolGate;
    use crate::persistence::MemoryEngineStore;

    async fn orchestrator(sandbox: ScriptedSandbox) -> (SessionOrchestrator, Arc<MemoryEngineStore>) {
        let store = Arc::new(MemoryEngineStore::new());
        let driver = Arc::new(HandlerDriver::new(
            store.clone(),
            Arc::new(ToolGate::new()),
            Arc::new(sandbox),
            ToolRegistry::new(),
            Arc::new(HttpStatusClassifier),
        ));
        (SessionOrchestrator::new(driver), store)
    }

    #[tokio::test]
    async fn scheduled_session_runs_producer_then_drains_consumer() {
        let sandbox = ScriptedSandbox {
            producer_outcome: ProducerOutcome {
                output_state: serde_json::json!({}),
                publish: vec![(
                    "inbound".into(),
                    crate::bus::OutgoingMessage {
                        message_id: "m1".into(),
                        title: "t".into(),
                        payload: serde_json::json!({}),
                    },
                )],
            },
            ..Default::default()
        };
        let (orchestrator, store) = orchestrator(sandbox).await;

        let mut workflow = Workflow::new(Uuid::now_v7(), "wf");
        workflow.status = WorkflowStatus::Active;
        workflow.handler_config = HandlerConfig {
            producers: vec!["watcher".into()],
            consumers: vec![ConsumerConfig {
                name: "biller".into(),
                topic: "inbound".into(),
            }],
        };
        let workflow_id = workflow.id;
        store.create_workflow(workflow).await.unwrap();

        let signal = orchestrator.run_scheduled_session(workflow_id).await.unwrap();
        assert!(matches!(signal, SchedulerSignal::Done));
        assert!(!orchestrator.is_running());

        let pending = store.peek_events(workflow_id, "inbound", Default::default()).await.unwrap();
        // The consumer committed with no intended mutation and consumed the event.
        assert!(pending.iter().all(|e| e.status != crate::domain::EventStatus::Pending));
    }

    #[tokio::test]
    async fn second_session_is_refused_while_one_is_in_flight() {
        let (orchestrator, store) = orchestrator(ScriptedSandbox::default()).await;
        let mut workflow = Workflow::new(Uuid::now_v7(), "wf");
        workflow.status = WorkflowStatus::Active;
        let workflow_id = workflow.id;
        store.create_workflow(workflow).await.unwrap();

        orchestrator.is_running.store(true, Ordering::SeqCst);
        let result = orchestrator.run_scheduled_session(workflow_id).await;
        assert!(matches!(result, Err(SessionError::AlreadyRunning)));
    }

    #[tokio::test]
    async fn logic_failure_suspends_the_session_with_needs_attention() {
        // A handler_config naming a consumer whose topic was never declared
        // as a producer output still drains fine (empty topic => no runs);
        // exercise the failure path instead via a producer sandbox error.
        let sandbox = ScriptedSandbox {
            producer_error: Some(crate::error::EngineError::logic("bad config")),
            ..Default::default()
        };
        let (orchestrator, store) = orchestrator(sandbox).await;
        let mut workflow = Workflow::new(Uuid::now_v7(), "wf");
        workflow.status = WorkflowStatus::Active;
        workflow.handler_config = HandlerConfig {
            producers: vec!["watcher".into()],
            consumers: vec![],
        };
        let workflow_id = workflow.id;
        store.create_workflow(workflow).await.unwrap();

        let signal = orchestrator.run_scheduled_session(workflow_id).await.unwrap();
        assert!(matches!(signal, SchedulerSignal::NeedsAttention { .. }));
        let _ = MutationOutcome::None;
    }
}
