//! Domain types for the fleetgrid state store.
//!
//! Agents, leases and job batches are owned by the farm; the autoscaler
//! only reads them and flips an agent's shutdown flag. Pool scale state
//! and lifecycle records are written by the control loops. All types are
//! serializable to/from JSON for storage in redb tables.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use fleet_core::types::PoolId;

/// Unique identifier for an agent.
pub type AgentId = String;

// ── Agent ──────────────────────────────────────────────────────────

/// A compute worker registered with the farm.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Agent {
    pub id: AgentId,
    pub enabled: bool,
    pub status: AgentStatus,
    /// Pools this agent is a member of.
    pub pools: BTreeSet<PoolId>,
    /// Set once a graceful shutdown has been requested.
    pub request_shutdown: bool,
    /// Cloud instance id, when the agent runs on a provisioned instance.
    pub instance_id: Option<String>,
    pub logical_cores: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Agent {
    /// An enabled, healthy agent with no pool memberships.
    pub fn new(id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            enabled: true,
            status: AgentStatus::Ok,
            pools: BTreeSet::new(),
            request_shutdown: false,
            instance_id: None,
            logical_cores: 8,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_pool(mut self, pool: impl Into<String>) -> Self {
        self.pools.insert(pool.into());
        self
    }

    pub fn in_pool(&self, pool: &str) -> bool {
        self.pools.contains(pool)
    }
}

/// Health of an agent as reported by the farm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Ok,
    Unhealthy,
    /// The agent has finished its work and gone offline.
    Stopped,
}

/// Criteria for `StateStore::find_agents`. Unset fields match anything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentFilter {
    pub pool: Option<PoolId>,
    pub enabled: Option<bool>,
    pub request_shutdown: Option<bool>,
    pub status: Option<AgentStatus>,
    /// Excludes agents in this status.
    pub not_status: Option<AgentStatus>,
}

impl AgentFilter {
    /// Enabled agents that are not stopped and have no pending shutdown.
    pub fn live() -> Self {
        Self::default()
            .enabled(true)
            .not_status(AgentStatus::Stopped)
            .request_shutdown(false)
    }

    pub fn pool(mut self, pool: impl Into<String>) -> Self {
        self.pool = Some(pool.into());
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    pub fn request_shutdown(mut self, request_shutdown: bool) -> Self {
        self.request_shutdown = Some(request_shutdown);
        self
    }

    pub fn status(mut self, status: AgentStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn not_status(mut self, status: AgentStatus) -> Self {
        self.not_status = Some(status);
        self
    }

    pub fn matches(&self, agent: &Agent) -> bool {
        self.pool.as_deref().is_none_or(|p| agent.in_pool(p))
            && self.enabled.is_none_or(|e| agent.enabled == e)
            && self.request_shutdown.is_none_or(|r| agent.request_shutdown == r)
            && self.status.is_none_or(|s| agent.status == s)
            && self.not_status.is_none_or(|s| agent.status != s)
    }
}

// ── Lease ──────────────────────────────────────────────────────────

/// A time-bounded assignment of work to an agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Lease {
    pub id: String,
    pub agent_id: AgentId,
    pub session_id: String,
    pub kind: LeaseKind,
    pub start_time: DateTime<Utc>,
    /// `None` while the lease is still running.
    pub finish_time: Option<DateTime<Utc>>,
}

impl Lease {
    /// Whether the lease covers any part of `[min, max)`.
    pub fn overlaps(&self, min: DateTime<Utc>, max: DateTime<Utc>) -> bool {
        self.start_time < max && self.finish_time.is_none_or(|f| f > min)
    }
}

/// What a lease was granted for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseKind {
    Job,
    Compute,
    Upgrade,
    Conform,
    Restart,
    Shutdown,
}

impl LeaseKind {
    /// Job and compute leases count as demand; the rest is housekeeping.
    pub fn is_job_work(self) -> bool {
        matches!(self, LeaseKind::Job | LeaseKind::Compute)
    }
}

// ── Jobs ───────────────────────────────────────────────────────────

/// A schedulable unit of a job, waiting for or running on an agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobBatch {
    pub job_id: String,
    pub batch_id: String,
    pub stream_id: String,
    /// Agent type requested; mapped to a pool by the stream config.
    pub agent_type: String,
    pub state: BatchState,
    pub job_created_at: DateTime<Utc>,
    /// When the batch became ready to run.
    pub ready_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Waiting,
    Ready,
    Running,
    Complete,
}

/// Per-stream mapping from agent type to pool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamConfig {
    pub id: String,
    pub agent_types: std::collections::BTreeMap<String, PoolId>,
}

impl JobBatch {
    pub fn table_key(&self) -> String {
        format!("{}:{}", self.job_id, self.batch_id)
    }
}

// ── Pool scale state ───────────────────────────────────────────────

/// Runtime bookkeeping the autoscaler keeps per pool.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PoolScaleState {
    pub pool_id: PoolId,
    pub last_scale_up_time: Option<DateTime<Utc>>,
    pub last_scale_down_time: Option<DateTime<Utc>>,
    pub last_agent_count: Option<usize>,
    pub last_desired_agent_count: Option<usize>,
    pub last_scale_result: Option<ScaleResult>,
}

impl PoolScaleState {
    pub fn new(pool_id: impl Into<String>) -> Self {
        Self {
            pool_id: pool_id.into(),
            ..Self::default()
        }
    }
}

/// Fields to change on a pool's scale state. `None` leaves a field as-is.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PoolScaleUpdate {
    pub last_scale_up_time: Option<DateTime<Utc>>,
    pub last_scale_down_time: Option<DateTime<Utc>>,
    pub last_agent_count: Option<usize>,
    pub last_desired_agent_count: Option<usize>,
    pub last_scale_result: Option<ScaleResult>,
}

impl PoolScaleUpdate {
    pub fn apply(&self, state: &mut PoolScaleState) {
        if let Some(t) = self.last_scale_up_time {
            state.last_scale_up_time = Some(t);
        }
        if let Some(t) = self.last_scale_down_time {
            state.last_scale_down_time = Some(t);
        }
        if let Some(n) = self.last_agent_count {
            state.last_agent_count = Some(n);
        }
        if let Some(n) = self.last_desired_agent_count {
            state.last_desired_agent_count = Some(n);
        }
        if let Some(r) = &self.last_scale_result {
            state.last_scale_result = Some(r.clone());
        }
    }
}

/// Outcome of one attempt to scale a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleOutcome {
    Success,
    PartialSuccess,
    Failure,
    NoOp,
}

impl fmt::Display for ScaleOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ScaleOutcome::Success => "success",
            ScaleOutcome::PartialSuccess => "partial_success",
            ScaleOutcome::Failure => "failure",
            ScaleOutcome::NoOp => "no_op",
        })
    }
}

/// Result of scaling a pool. Two results are equal when outcome and
/// counts match; the message is informational only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScaleResult {
    pub outcome: ScaleOutcome,
    pub agents_added_count: usize,
    pub agents_removed_count: usize,
    pub message: String,
}

impl ScaleResult {
    pub fn new(
        outcome: ScaleOutcome,
        agents_added_count: usize,
        agents_removed_count: usize,
        message: impl Into<String>,
    ) -> Self {
        Self {
            outcome,
            agents_added_count,
            agents_removed_count,
            message: message.into(),
        }
    }

    pub fn no_op(message: impl Into<String>) -> Self {
        Self::new(ScaleOutcome::NoOp, 0, 0, message)
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self::new(ScaleOutcome::Failure, 0, 0, message)
    }
}

impl PartialEq for ScaleResult {
    fn eq(&self, other: &Self) -> bool {
        self.outcome == other.outcome
            && self.agents_added_count == other.agents_added_count
            && self.agents_removed_count == other.agents_removed_count
    }
}

impl Eq for ScaleResult {}

impl fmt::Display for ScaleResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (+{} -{}): {}",
            self.outcome, self.agents_added_count, self.agents_removed_count, self.message
        )
    }
}

// ── Lifecycle ──────────────────────────────────────────────────────

/// Where a terminating instance came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentOrigin {
    /// The instance was serving the farm.
    InService,
    /// The instance was parked in a pre-provisioned idle pool.
    WarmPool,
}

/// Notice that the cloud is about to terminate an instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TerminationIntent {
    pub instance_id: String,
    pub origin: IntentOrigin,
    pub hook_name: String,
    pub hook_token: String,
    pub group_name: String,
}

/// A termination the reconciler is waiting on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LifecycleRecord {
    pub agent_id: AgentId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub intent: TerminationIntent,
}
