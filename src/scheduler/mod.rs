//! The scheduler (spec.md §4.7): a single periodic tick (~10s cadence) plus
//! an immediate re-tick after a productive session, candidate selection,
//! retry backoff, and the global payment-required pause.

pub mod backoff;
pub mod schedule;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::domain::Workflow;
use crate::error::ErrorKind;
use crate::persistence::{EngineStore, StoreError};
use crate::session::SessionOrchestrator;

/// How often the scheduler wakes on its own, absent a productive-session
/// nudge (spec.md §4.7).
pub const TICK_INTERVAL: Duration = Duration::from_secs(10);

/// Duration of a `payment_required` global pause (spec.md §4.7).
const GLOBAL_PAUSE_DURATION: Duration = Duration::from_secs(600);

/// The five signals a session hands back to the scheduler (spec.md §4.7).
#[derive(Debug, Clone)]
pub enum SchedulerSignal {
    Done,
    Retry {
        error: String,
        error_type: ErrorKind,
    },
    PaymentRequired,
    NeedsAttention {
        error: String,
        error_type: ErrorKind,
    },
    Maintenance {
        error: String,
    },
}

/// Engine-wide payment pause; "later of current and new" on repeated
/// `payment_required` signals (spec.md §4.7 never states the extension
/// policy for a pause already in effect; chosen so a second signal can
/// only lengthen, never shorten, the outage).
#[derive(Default)]
pub struct GlobalPause {
    until: Mutex<Option<DateTime<Utc>>>,
}

impl GlobalPause {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_paused(&self, now: DateTime<Utc>) -> bool {
        matches!(*self.until.lock(), Some(until) if until > now)
    }

    pub fn engage(&self, now: DateTime<Utc>) {
        let candidate = now + ChronoDuration::from_std(GLOBAL_PAUSE_DURATION).expect("fits");
        let mut until = self.until.lock();
        *until = Some(match *until {
            Some(existing) if existing > candidate => existing,
            _ => candidate,
        });
    }
}

/// The scheduler's own in-memory retry state, reset on process restart by
/// design (spec.md §5 "the in-memory retry-state map is owned by the
/// scheduler; no other component reads or writes it").
#[derive(Default)]
struct RetryState {
    consecutive_failures: Mutex<HashMap<Uuid, u32>>,
}

impl RetryState {
    fn increment(&self, workflow_id: Uuid) -> u32 {
        let mut map = self.consecutive_failures.lock();
        let count = map.entry(workflow_id).or_insert(0);
        *count += 1;
        *count
    }

    fn clear(&self, workflow_id: Uuid) {
        self.consecutive_failures.lock().remove(&workflow_id);
    }
}

pub struct Scheduler {
    store: Arc<dyn EngineStore>,
    orchestrator: Arc<SessionOrchestrator>,
    pause: Arc<GlobalPause>,
    retries: RetryState,
    notify: Notify,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn EngineStore>,
        orchestrator: Arc<SessionOrchestrator>,
        pause: Arc<GlobalPause>,
    ) -> Self {
        Self {
            store,
            orchestrator,
            pause,
            retries: RetryState::default(),
            notify: Notify::new(),
        }
    }

    /// Ask the scheduler to re-tick immediately rather than waiting for the
    /// next `TICK_INTERVAL` (spec.md §4.7 "plus immediate re-tick after a
    /// productive session").
    pub fn wake(&self) {
        self.notify.notify_one();
    }

    /// Candidate workflows due right now, after the gates that don't
    /// depend on a specific candidate (spec.md §4.7 "Gating in order":
    /// valid environment / no global pause / shutdown not requested are
    /// engine-wide; "no session in progress" is per-candidate and checked
    /// by the caller via `orchestrator.is_running()`).
    #[instrument(skip(self))]
    pub async fn candidates(&self) -> Result<Vec<Workflow>, StoreError> {
        let now = Utc::now();
        if self.pause.is_paused(now) {
            debug!("scheduler globally paused, skipping candidate selection");
            return Ok(Vec::new());
        }
        self.store.list_due_workflows(now).await
    }

    /// Run one tick: select candidates, hand the first to the orchestrator
    /// if none is already in flight, apply its signal. Returns `true` if a
    /// session actually ran (the caller should re-tick immediately).
    #[instrument(skip(self))]
    pub async fn tick(&self) -> bool {
        if self.orchestrator.is_running() {
            debug!("session already in progress, skipping tick");
            return false;
        }
        let candidates = match self.candidates().await {
            Ok(c) => c,
            Err(e) => {
                error!(error = %e, "candidate selection failed");
                return false;
            }
        };
        let Some(workflow) = candidates.into_iter().next() else {
            return false;
        };
        match self.orchestrator.run_scheduled_session(workflow.id).await {
            Ok(signal) => {
                if let Err(e) = self.apply_signal(workflow.id, signal).await {
                    error!(%workflow.id, error = %e, "failed to apply scheduler signal");
                }
                true
            }
            Err(e) => {
                warn!(%workflow.id, error = %e, "session failed to start");
                false
            }
        }
    }

    #[instrument(skip(self, signal))]
    pub async fn apply_signal(&self, workflow_id: Uuid, signal: SchedulerSignal) -> Result<(), StoreError> {
        match signal {
            SchedulerSignal::Done => {
                self.retries.clear(workflow_id);
                self.reschedule(workflow_id).await?;
            }
            SchedulerSignal::Retry { error, error_type } => {
                let count = self.retries.increment(workflow_id);
                if backoff::should_escalate(count) {
                    warn!(%workflow_id, count, "escalating after repeated retry failures");
                    self.retries.clear(workflow_id);
                    let message = format!("{error_type:?}: {error}");
                    self.store
                        .update_workflow_fields(workflow_id, Box::new(move |w| w.set_error(message)))
                        .await?;
                } else {
                    let delay = backoff::delay_for_attempt(count);
                    let next = Utc::now()
                        + ChronoDuration::from_std(delay).unwrap_or_else(|_| ChronoDuration::zero());
                    self.store
                        .update_workflow_fields(
                            workflow_id,
                            Box::new(move |w| w.next_run_timestamp = Some(next)),
                        )
                        .await?;
                }
            }
            SchedulerSignal::PaymentRequired => {
                info!(%workflow_id, "payment required, engaging global pause");
                self.pause.engage(Utc::now());
            }
            SchedulerSignal::NeedsAttention { error, error_type } => {
                self.retries.clear(workflow_id);
                let message = format!("{error_type:?}: {error}");
                self.store
                    .update_workflow_fields(workflow_id, Box::new(move |w| w.set_error(message)))
                    .await?;
            }
            SchedulerSignal::Maintenance { error } => {
                self.retries.clear(workflow_id);
                self.store
                    .update_workflow_fields(workflow_id, Box::new(move |w| {
                        w.maintenance = true;
                        w.set_error(error);
                    }))
                    .await?;
            }
        }
        Ok(())
    }

    async fn reschedule(&self, workflow_id: Uuid) -> Result<(), StoreError> {
        let workflow = self.store.get_workflow(workflow_id).await?;
        let Some(spec) = workflow.schedule.clone() else {
            return self
                .store
                .update_workflow_fields(workflow_id, Box::new(|w| w.next_run_timestamp = None))
                .await;
        };
        match schedule::next_run_after(&spec, Utc::now()) {
            Ok(next) => {
                self.store
                    .update_workflow_fields(
                        workflow_id,
                        Box::new(move |w| w.next_run_timestamp = Some(next)),
                    )
                    .await
            }
            Err(_) => {
                self.store
                    .update_workflow_fields(workflow_id, Box::new(|w| w.next_run_timestamp = None))
                    .await
            }
        }
    }

    /// Run ticks on `TICK_INTERVAL`, or immediately after `wake()`, until
    /// `shutdown` fires. Grounded on the worker pool's ticker/shutdown-
    /// channel pattern.
    pub fn spawn_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(TICK_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = self.notify.notified() => {}
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            debug!("scheduler loop: shutdown requested");
                            break;
                        }
                        continue;
                    }
                }
                if self.tick().await {
                    self.wake();
                }
            }
        })
    }
}
