//! # Workflow execution engine
//!
//! A local-first personal automation engine's workflow execution core: a
//! per-workflow scheduler, a session orchestrator enforcing single-threaded
//! execution per workflow, a producer/consumer handler state machine with
//! phase-scoped capabilities, an event/topic bus with reservation
//! semantics, a mutation ledger recording at most one external side effect
//! per consumer run (with crash reconciliation), a tool gate enforcing
//! phase/operation permissions, and a five-kind classified-error taxonomy
//! driving retry/escalation policy.
//!
//! ## Scope
//!
//! Everything this crate talks to outside itself — the UI, OAuth/credential
//! storage, concrete tool APIs (Gmail, Drive, ...), the sandbox VM that
//! actually runs handler code, the replicated store, the CLI shell, the
//! sync transport — is modeled only as a typed trait in [`external`]. No
//! concrete implementation of any of them ships here except test doubles.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Scheduler                           │
//! │  (candidate selection, retry backoff, global pause)          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     SessionOrchestrator                      │
//! │  (one session in flight engine-wide, builds the run plan)    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        HandlerDriver                          │
//! │  (phase state machine, tool gate, mutation ledger, bus)      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         EngineStore                           │
//! │  (in-memory or PostgreSQL-backed persistence façade)         │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod bus;
pub mod domain;
pub mod error;
pub mod external;
pub mod handler;
pub mod ledger;
pub mod persistence;
pub mod scheduler;
pub mod session;

use std::collections::HashSet;
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use external::{ErrorClassifier, Sandbox, ToolRegistry};
use handler::{HandlerDriver, ToolGate};
use ledger::Reconciler;
use persistence::EngineStore;
use scheduler::{GlobalPause, Scheduler};
use session::{SessionError, SessionOrchestrator};

/// How often the reconciliation loop re-scans for orphaned work (spec.md
/// §4.3 describes the scan, not its cadence — an open question resolved in
/// `DESIGN.md`).
const RECONCILE_INTERVAL: Duration = Duration::from_secs(30);

/// How long `close()` waits for an in-progress session to finish before
/// giving up and returning anyway (spec.md §4.7 "Shutdown").
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(30);
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Wires the scheduler, session orchestrator, handler driver, and
/// reconciler into one runnable engine instance. This is the crate's entry
/// point for an embedder; everything else is reachable through it.
pub struct Engine {
    orchestrator: Arc<SessionOrchestrator>,
    scheduler: Arc<Scheduler>,
    reconciler: Arc<Reconciler>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    pub fn new(
        store: Arc<dyn EngineStore>,
        gate: Arc<ToolGate>,
        sandbox: Arc<dyn Sandbox>,
        tools: ToolRegistry,
        classifier: Arc<dyn ErrorClassifier>,
    ) -> Self {
        let driver = Arc::new(HandlerDriver::new(
            Arc::clone(&store),
            gate,
            sandbox,
            tools,
            classifier,
        ));
        let orchestrator = Arc::new(SessionOrchestrator::new(driver));
        let pause = Arc::new(GlobalPause::new());
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&store),
            Arc::clone(&orchestrator),
            pause,
        ));
        let reconciler = Arc::new(Reconciler::new(store));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            orchestrator,
            scheduler,
            reconciler,
            shutdown_tx,
            shutdown_rx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Run one reconciliation pass to completion (spec.md §4.3: any mutation
    /// still `in_flight` from a prior crash is marked `indeterminate` and its
    /// run frozen at `mutated`) *before* resuming interrupted sessions
    /// (spec.md §4.5), then start the scheduler tick loop and the periodic
    /// reconciliation scan. Ordering matters: resumption only special-cases
    /// runs already at `mutated`/`emitting` — a run still at `mutating` whose
    /// mutation hasn't yet been reconciled would otherwise be resumed from
    /// scratch and could re-issue an external mutation of unknown outcome.
    pub async fn start(&self) -> Result<(), SessionError> {
        self.reconciler.scan_and_repair(&HashSet::new()).await?;
        self.orchestrator.resume_all_incomplete().await?;

        let scheduler_handle = Arc::clone(&self.scheduler).spawn_loop(self.shutdown_rx.clone());
        let live_workflow_ids = Arc::new(StdRwLock::new(HashSet::new()));
        let reconciler_handle = Arc::clone(&self.reconciler).spawn_loop(
            RECONCILE_INTERVAL,
            live_workflow_ids,
            self.shutdown_rx.clone(),
        );

        let mut tasks = self.tasks.lock();
        tasks.push(scheduler_handle);
        tasks.push(reconciler_handle);
        Ok(())
    }

    /// `close()` (spec.md §4.7): stop the ticker, then poll for up to
    /// `SHUTDOWN_GRACE_PERIOD` for the in-progress session (if any) to
    /// finish before returning.
    pub async fn close(&self) {
        let _ = self.shutdown_tx.send(true);

        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE_PERIOD;
        while self.orchestrator.is_running() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(SHUTDOWN_POLL_INTERVAL).await;
        }

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn orchestrator(&self) -> &Arc<SessionOrchestrator> {
        &self.orchestrator
    }

    // -----------------------------------------------------------------
    // User-facing resolution API (spec.md §6), delegated to the session
    // orchestrator.
    // -----------------------------------------------------------------

    pub async fn pause_workflow(&self, workflow_id: Uuid) -> Result<(), SessionError> {
        self.orchestrator.pause_workflow(workflow_id).await
    }

    pub async fn resume_workflow(&self, workflow_id: Uuid) -> Result<(), SessionError> {
        self.orchestrator.resume_workflow(workflow_id).await
    }

    pub async fn archive_workflow(&self, workflow_id: Uuid) -> Result<(), SessionError> {
        self.orchestrator.archive_workflow(workflow_id).await
    }

    pub async fn unarchive_workflow(&self, workflow_id: Uuid) -> Result<(), SessionError> {
        self.orchestrator.unarchive_workflow(workflow_id).await
    }

    pub async fn resolve_mutation_failed(&self, mutation_id: Uuid) -> Result<(), SessionError> {
        self.orchestrator.resolve_mutation_failed(mutation_id).await
    }

    pub async fn resolve_mutation_skipped(&self, mutation_id: Uuid) -> Result<(), SessionError> {
        self.orchestrator.resolve_mutation_skipped(mutation_id).await
    }
}

/// Convenience re-exports for embedders.
pub mod prelude {
    pub use crate::domain::{
        ConsumerConfig, Event, EventStatus, HandlerConfig, HandlerRun, HandlerState, HandlerStatus,
        HandlerType, IntendedMutation, Mutation, MutationOutcome, MutationStatus, Phase,
        PrepareResult, ResolvedBy, ScheduleSpec, ScriptRun, SessionOutcome, Topic, TriggerKind,
        Workflow, WorkflowStatus,
    };
    pub use crate::error::{EngineError, ErrorKind};
    pub use crate::external::{Connection, ConnectionManager, ConnectionStatus, ErrorClassifier, Sandbox, Tool, ToolRegistry};
    pub use crate::handler::{HandlerDriver, HandlerError, OperationKind, ToolGate};
    pub use crate::persistence::{EngineStore, MemoryEngineStore, PostgresEngineStore, StoreError};
    pub use crate::scheduler::{GlobalPause, Scheduler, SchedulerSignal};
    pub use crate::session::{SessionError, SessionOrchestrator};
    pub use crate::Engine;
}
