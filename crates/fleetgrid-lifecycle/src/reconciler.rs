//! Lifecycle reconciler: holds cloud terminations until agents drain.
//!
//! ```text
//! intent ──► WarmPool  ──► complete(Abandon), not tracked
//!        └─► InService ──► agent known?  no ──► dropped
//!                                        yes ─► request_shutdown, record tracked
//!
//! poll   ──► agent gone          ──► complete(Abandon), record deleted
//!        ├─► agent stopped       ──► complete(Continue), record deleted
//!        ├─► tracked too long    ──► complete(Abandon), record deleted
//!        └─► still working       ──► heartbeat
//! ```
//!
//! A failed acknowledgement drops the record; the cloud's own hook
//! timeout takes over from there.

use std::sync::Arc;
use std::time::Duration;

use chrono::TimeDelta;
use fleet_core::{Clock, CoreResult, SystemClock, config::LifecycleSettings};
use fleetgrid_state::{AgentStatus, IntentOrigin, LifecycleRecord, TerminationIntent};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::LifecycleResult;
use crate::hook::{LifecycleAction, LifecycleHook};
use crate::store::LifecycleStore;

/// What became of an incoming termination intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentDisposition {
    /// Warm-pool instance, released immediately.
    Abandoned,
    /// No agent runs on the instance.
    Dropped,
    /// Shutdown requested and a record created.
    Tracked,
    /// A record already existed and was refreshed.
    AlreadyTracked,
}

/// Counts from one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub completed: usize,
    pub abandoned: usize,
    pub timed_out: usize,
    pub deferred: usize,
    pub ack_failures: usize,
    /// Resolved records that could not be deleted.
    pub delete_failures: usize,
}

#[derive(Debug, Clone)]
pub struct LifecycleServiceSettings {
    pub poll_interval: Duration,
    pub max_tracking: Duration,
    pub max_backoff: Duration,
}

impl Default for LifecycleServiceSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            max_tracking: Duration::from_secs(3600),
            max_backoff: Duration::from_secs(300),
        }
    }
}

impl LifecycleServiceSettings {
    pub fn from_config(lifecycle: &LifecycleSettings) -> CoreResult<Self> {
        Ok(Self {
            poll_interval: lifecycle.poll_interval()?,
            max_tracking: lifecycle.max_tracking()?,
            max_backoff: lifecycle.max_backoff()?,
        })
    }
}

/// Poll delay that doubles on failure up to a cap and resets on success.
#[derive(Debug, Clone)]
pub struct PollBackoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl PollBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        let max = max.max(base);
        Self {
            base,
            max,
            current: base,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn record_success(&mut self) {
        self.current = self.base;
    }

    pub fn record_failure(&mut self) {
        self.current = (self.current * 2).min(self.max);
    }
}

/// Reconciles cloud-initiated terminations with agent state.
#[derive(Clone)]
pub struct LifecycleService {
    store: Arc<dyn LifecycleStore>,
    hook: Arc<dyn LifecycleHook>,
    clock: Arc<dyn Clock>,
    settings: LifecycleServiceSettings,
}

impl LifecycleService {
    pub fn new(
        store: impl LifecycleStore + 'static,
        hook: Arc<dyn LifecycleHook>,
        settings: LifecycleServiceSettings,
    ) -> Self {
        Self {
            store: Arc::new(store),
            hook,
            clock: Arc::new(SystemClock),
            settings,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Act on one termination intent.
    pub async fn handle_intent(
        &self,
        intent: &TerminationIntent,
    ) -> LifecycleResult<IntentDisposition> {
        if intent.origin == IntentOrigin::WarmPool {
            if let Err(e) = self.hook.complete(intent, LifecycleAction::Abandon).await {
                warn!(instance = %intent.instance_id, error = %e, "failed to release warm-pool instance");
            }
            debug!(instance = %intent.instance_id, "warm-pool instance released");
            return Ok(IntentDisposition::Abandoned);
        }

        let Some(agent) = self.store.find_agent_by_instance_id(&intent.instance_id)? else {
            warn!(instance = %intent.instance_id, "termination for unknown instance, dropping");
            return Ok(IntentDisposition::Dropped);
        };

        let now = self.clock.now();
        self.store.update_agent_shutdown_flag(&agent.id, true, now)?;
        let existing = self.store.get_lifecycle_record(&agent.id)?;
        let disposition = if existing.is_some() {
            IntentDisposition::AlreadyTracked
        } else {
            IntentDisposition::Tracked
        };
        self.store.put_lifecycle_record(&LifecycleRecord {
            agent_id: agent.id.clone(),
            created_at: existing.map(|r| r.created_at).unwrap_or(now),
            updated_at: now,
            intent: intent.clone(),
        })?;

        info!(
            agent = %agent.id,
            instance = %intent.instance_id,
            ?disposition,
            "termination tracked, shutdown requested"
        );
        Ok(disposition)
    }

    /// Delete a finished record. A store error is logged and the pass
    /// moves on to the next record.
    fn forget(&self, agent_id: &str, report: &mut ReconcileReport) {
        if let Err(e) = self.store.delete_lifecycle_record(agent_id) {
            report.delete_failures += 1;
            error!(agent = %agent_id, error = %e, "failed to delete lifecycle record");
        }
    }

    /// Resolve or defer every tracked termination once.
    pub async fn reconcile(&self) -> LifecycleResult<ReconcileReport> {
        let now = self.clock.now();
        let max_tracking = TimeDelta::from_std(self.settings.max_tracking).unwrap_or(TimeDelta::MAX);
        let mut report = ReconcileReport::default();

        for record in self.store.list_lifecycle_records()? {
            let agent = self.store.get_agent(&record.agent_id)?;
            let action = match &agent {
                None => {
                    report.abandoned += 1;
                    Some(LifecycleAction::Abandon)
                }
                Some(a) if a.status == AgentStatus::Stopped => {
                    report.completed += 1;
                    Some(LifecycleAction::Continue)
                }
                Some(_) if now - record.created_at > max_tracking => {
                    report.timed_out += 1;
                    Some(LifecycleAction::Abandon)
                }
                Some(_) => None,
            };

            let acked = match action {
                Some(action) => self.hook.complete(&record.intent, action).await,
                None => self.hook.heartbeat(&record.intent).await,
            };

            match (action, acked) {
                (None, Ok(())) => {
                    report.deferred += 1;
                    debug!(agent = %record.agent_id, "termination deferred");
                }
                (Some(action), Ok(())) => {
                    info!(agent = %record.agent_id, ?action, "termination resolved");
                    self.forget(&record.agent_id, &mut report);
                }
                (_, Err(e)) => {
                    report.ack_failures += 1;
                    warn!(agent = %record.agent_id, error = %e, "lifecycle hook ack failed, record dropped");
                    self.forget(&record.agent_id, &mut report);
                }
            }
        }
        Ok(report)
    }

    /// Consume intents and poll tracked terminations until `shutdown`
    /// fires. Failed polls back off exponentially up to `max_backoff`.
    pub async fn run(
        &self,
        mut intents: mpsc::Receiver<TerminationIntent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(
            poll_secs = self.settings.poll_interval.as_secs(),
            "lifecycle reconciler started"
        );
        let mut backoff = PollBackoff::new(self.settings.poll_interval, self.settings.max_backoff);
        let mut next_poll = Instant::now() + backoff.current();
        let mut intents_open = true;

        loop {
            tokio::select! {
                intent = intents.recv(), if intents_open => match intent {
                    Some(intent) => {
                        if let Err(e) = self.handle_intent(&intent).await {
                            error!(instance = %intent.instance_id, error = %e, "failed to handle termination");
                        }
                    }
                    None => {
                        debug!("termination intent channel closed");
                        intents_open = false;
                    }
                },
                _ = tokio::time::sleep_until(next_poll) => {
                    match self.reconcile().await {
                        Ok(report) => {
                            backoff.record_success();
                            debug!(?report, "lifecycle reconcile complete");
                        }
                        Err(e) => {
                            backoff.record_failure();
                            error!(
                                error = %e,
                                retry_secs = backoff.current().as_secs(),
                                "lifecycle reconcile failed"
                            );
                        }
                    }
                    next_poll = Instant::now() + backoff.current();
                }
                _ = shutdown.changed() => {
                    info!("lifecycle reconciler shutting down");
                    break;
                }
            }
        }
    }
}
