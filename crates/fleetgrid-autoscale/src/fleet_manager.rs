//! Fleet-management capability: the backend that actually adds and removes
//! agents.
//!
//! The autoscaler only talks to the [`FleetManager`] trait. Which manager a
//! pool uses is configured per pool (first matching condition wins) and
//! turned into a live object by a [`FleetManagerFactory`], so embedders can
//! plug in cloud backends without touching the orchestrator.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::TimeDelta;
use fleet_core::{Clock, ConditionProperties, FleetManagerKind, LocalFleetSettings, PoolConfig};
use fleetgrid_state::{Agent, AgentFilter, AgentStatus, ScaleOutcome, ScaleResult, StateStore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{AutoscaleError, AutoscaleResult};

/// Adds and removes agents for a pool.
#[async_trait]
pub trait FleetManager: Send + Sync {
    /// Provision `count` new agents for `pool`.
    async fn expand_pool(
        &self,
        pool: &PoolConfig,
        agents: &[Agent],
        count: usize,
        cancel: &CancellationToken,
    ) -> anyhow::Result<ScaleResult>;

    /// Remove `count` agents from `pool`.
    async fn shrink_pool(
        &self,
        pool: &PoolConfig,
        agents: &[Agent],
        count: usize,
        cancel: &CancellationToken,
    ) -> anyhow::Result<ScaleResult>;

    /// Instances of `pool` that exist but are stopped.
    async fn num_stopped_instances(
        &self,
        pool: &PoolConfig,
        cancel: &CancellationToken,
    ) -> anyhow::Result<usize>;
}

/// Turns a configured manager kind into a live manager.
pub trait FleetManagerFactory: Send + Sync {
    fn create(&self, kind: &FleetManagerKind) -> AutoscaleResult<Arc<dyn FleetManager>>;
}

/// The manager `pool` should use right now; no match means no-op.
pub fn resolve_fleet_manager(
    pool: &PoolConfig,
    props: &ConditionProperties,
    factory: &dyn FleetManagerFactory,
) -> AutoscaleResult<Arc<dyn FleetManager>> {
    match pool.active_fleet_manager(props)? {
        Some(entry) => factory.create(&entry.manager),
        None => Ok(Arc::new(NoOpFleetManager)),
    }
}

// ── Factory ────────────────────────────────────────────────────────

/// Builds the built-in managers and any custom backends registered by name.
pub struct DefaultFleetManagerFactory {
    store: StateStore,
    clock: Arc<dyn Clock>,
    custom: HashMap<String, Arc<dyn FleetManager>>,
}

impl DefaultFleetManagerFactory {
    pub fn new(store: StateStore, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            custom: HashMap::new(),
        }
    }

    /// Register a backend for `type = "custom"` entries with this name.
    pub fn with_custom(mut self, name: impl Into<String>, manager: Arc<dyn FleetManager>) -> Self {
        self.custom.insert(name.into(), manager);
        self
    }
}

impl FleetManagerFactory for DefaultFleetManagerFactory {
    fn create(&self, kind: &FleetManagerKind) -> AutoscaleResult<Arc<dyn FleetManager>> {
        match kind {
            FleetManagerKind::NoOp => Ok(Arc::new(NoOpFleetManager)),
            FleetManagerKind::Local(settings) => Ok(Arc::new(LocalFleetManager::new(
                self.store.clone(),
                self.clock.clone(),
                settings.clone(),
            ))),
            FleetManagerKind::Custom { name, .. } => self
                .custom
                .get(name)
                .cloned()
                .ok_or_else(|| AutoscaleError::UnknownFleetManager(name.clone())),
        }
    }
}

// ── No-op ──────────────────────────────────────────────────────────

/// Logs what it was asked to do and does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpFleetManager;

#[async_trait]
impl FleetManager for NoOpFleetManager {
    async fn expand_pool(
        &self,
        pool: &PoolConfig,
        _agents: &[Agent],
        count: usize,
        _cancel: &CancellationToken,
    ) -> anyhow::Result<ScaleResult> {
        info!(pool = %pool.id, count, "no-op fleet manager asked to expand");
        Ok(ScaleResult::no_op(format!("No fleet manager, would add {count}")))
    }

    async fn shrink_pool(
        &self,
        pool: &PoolConfig,
        _agents: &[Agent],
        count: usize,
        _cancel: &CancellationToken,
    ) -> anyhow::Result<ScaleResult> {
        info!(pool = %pool.id, count, "no-op fleet manager asked to shrink");
        Ok(ScaleResult::no_op(format!("No fleet manager, would remove {count}")))
    }

    async fn num_stopped_instances(
        &self,
        _pool: &PoolConfig,
        _cancel: &CancellationToken,
    ) -> anyhow::Result<usize> {
        Ok(0)
    }
}

// ── Local ──────────────────────────────────────────────────────────

/// Manages agent records directly in the state store.
///
/// Expanding revives stopped agents before creating new ones; shrinking
/// asks the least busy agents to shut down gracefully.
pub struct LocalFleetManager {
    store: StateStore,
    clock: Arc<dyn Clock>,
    settings: LocalFleetSettings,
}

impl LocalFleetManager {
    pub fn new(store: StateStore, clock: Arc<dyn Clock>, settings: LocalFleetSettings) -> Self {
        Self {
            store,
            clock,
            settings,
        }
    }

    fn next_free_id(&self, pool: &PoolConfig, next: &mut usize) -> anyhow::Result<String> {
        loop {
            let id = format!("{}-{}-{:04}", self.settings.agent_prefix, pool.id, *next);
            *next += 1;
            if self.store.get_agent(&id)?.is_none() {
                return Ok(id);
            }
        }
    }
}

fn outcome_for(done: usize, requested: usize) -> ScaleOutcome {
    if done == requested {
        ScaleOutcome::Success
    } else if done > 0 {
        ScaleOutcome::PartialSuccess
    } else {
        ScaleOutcome::Failure
    }
}

#[async_trait]
impl FleetManager for LocalFleetManager {
    async fn expand_pool(
        &self,
        pool: &PoolConfig,
        _agents: &[Agent],
        count: usize,
        cancel: &CancellationToken,
    ) -> anyhow::Result<ScaleResult> {
        let now = self.clock.now();
        let stopped = self.store.find_agents(
            &AgentFilter::default()
                .pool(pool.id.clone())
                .status(AgentStatus::Stopped),
        )?;

        let mut revived = 0;
        for mut agent in stopped.into_iter().take(count) {
            if cancel.is_cancelled() {
                break;
            }
            agent.status = AgentStatus::Ok;
            agent.enabled = true;
            agent.request_shutdown = false;
            agent.updated_at = now;
            self.store.put_agent(&agent)?;
            debug!(pool = %pool.id, agent = %agent.id, "revived stopped agent");
            revived += 1;
        }

        let mut created = 0;
        let mut next = 0;
        while revived + created < count && !cancel.is_cancelled() {
            let id = self.next_free_id(pool, &mut next)?;
            let mut agent = Agent::new(id, now).with_pool(pool.id.clone());
            agent.logical_cores = self.settings.logical_cores;
            self.store.put_agent(&agent)?;
            debug!(pool = %pool.id, agent = %agent.id, "created agent");
            created += 1;
        }

        let added = revived + created;
        Ok(ScaleResult::new(
            outcome_for(added, count),
            added,
            0,
            format!("Added {added} of {count} agents ({revived} revived, {created} created)"),
        ))
    }

    async fn shrink_pool(
        &self,
        pool: &PoolConfig,
        agents: &[Agent],
        count: usize,
        cancel: &CancellationToken,
    ) -> anyhow::Result<ScaleResult> {
        let now = self.clock.now();
        let mut open: HashMap<&str, usize> = HashMap::new();
        let leases = self.store.find_leases(now, now + TimeDelta::seconds(1))?;
        let members: HashSet<&str> = agents.iter().map(|a| a.id.as_str()).collect();
        for lease in leases.iter().filter(|l| l.finish_time.is_none()) {
            if members.contains(lease.agent_id.as_str()) {
                *open.entry(lease.agent_id.as_str()).or_default() += 1;
            }
        }

        let mut candidates: Vec<&Agent> = agents.iter().filter(|a| !a.request_shutdown).collect();
        let busy = |a: &Agent| open.get(a.id.as_str()).copied().unwrap_or(0);
        candidates.sort_by(|x, y| busy(x).cmp(&busy(y)).then_with(|| x.id.cmp(&y.id)));

        let mut removed = 0;
        for agent in candidates.into_iter().take(count) {
            if cancel.is_cancelled() {
                break;
            }
            if self.store.update_agent_shutdown_flag(&agent.id, true, now)? {
                debug!(pool = %pool.id, agent = %agent.id, "requested agent shutdown");
                removed += 1;
            }
        }

        Ok(ScaleResult::new(
            outcome_for(removed, count),
            0,
            removed,
            format!("Requested shutdown of {removed} of {count} agents"),
        ))
    }

    async fn num_stopped_instances(
        &self,
        pool: &PoolConfig,
        _cancel: &CancellationToken,
    ) -> anyhow::Result<usize> {
        let stopped = self.store.find_agents(
            &AgentFilter::default()
                .pool(pool.id.clone())
                .status(AgentStatus::Stopped),
        )?;
        Ok(stopped.len())
    }
}
