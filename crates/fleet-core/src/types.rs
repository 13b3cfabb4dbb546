//! Pool configuration types shared by the store, autoscaler and daemon.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::condition::{Condition, ConditionProperties};
use crate::duration::parse_duration;
use crate::error::CoreResult;

/// Unique identifier for a pool of agents.
pub type PoolId = String;

// ── Pool ───────────────────────────────────────────────────────────

/// Static configuration of an agent pool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PoolConfig {
    pub id: PoolId,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_true")]
    pub enable_autoscaling: bool,
    /// Overrides the fleet-wide scale-out cooldown (e.g. `"5m"`).
    #[serde(default)]
    pub scale_out_cooldown: Option<String>,
    /// Overrides the fleet-wide scale-in cooldown (e.g. `"20m"`).
    #[serde(default)]
    pub scale_in_cooldown: Option<String>,
    /// Sizing strategies, first matching condition wins.
    #[serde(default)]
    pub sizing: Vec<PoolSizeStrategyConfig>,
    /// Fleet managers, first matching condition wins.
    #[serde(default)]
    pub fleet_managers: Vec<FleetManagerConfig>,
}

fn default_true() -> bool {
    true
}

impl PoolConfig {
    /// A pool with autoscaling enabled and no strategies configured.
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            enable_autoscaling: true,
            scale_out_cooldown: None,
            scale_in_cooldown: None,
            sizing: Vec::new(),
            fleet_managers: Vec::new(),
        }
    }

    /// Effective scale-out cooldown given the fleet default.
    pub fn scale_out_cooldown_or(&self, default: Duration) -> CoreResult<Duration> {
        crate::duration::parse_duration_or(self.scale_out_cooldown.as_deref(), default)
    }

    /// Effective scale-in cooldown given the fleet default.
    pub fn scale_in_cooldown_or(&self, default: Duration) -> CoreResult<Duration> {
        crate::duration::parse_duration_or(self.scale_in_cooldown.as_deref(), default)
    }

    /// The first sizing entry whose condition holds, if any.
    pub fn active_sizing(
        &self,
        props: &ConditionProperties,
    ) -> CoreResult<Option<&PoolSizeStrategyConfig>> {
        first_match(&self.sizing, |c| c.condition.as_ref(), props)
    }

    /// The first fleet-manager entry whose condition holds, if any.
    pub fn active_fleet_manager(
        &self,
        props: &ConditionProperties,
    ) -> CoreResult<Option<&FleetManagerConfig>> {
        first_match(&self.fleet_managers, |c| c.condition.as_ref(), props)
    }
}

fn first_match<'a, T>(
    entries: &'a [T],
    condition: impl Fn(&T) -> Option<&Condition>,
    props: &ConditionProperties,
) -> CoreResult<Option<&'a T>> {
    for entry in entries {
        match condition(entry) {
            None => return Ok(Some(entry)),
            Some(cond) if cond.evaluate(props)? => return Ok(Some(entry)),
            Some(_) => {}
        }
    }
    Ok(None)
}

// ── Sizing strategies ──────────────────────────────────────────────

/// One entry in a pool's ordered list of sizing strategies.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PoolSizeStrategyConfig {
    #[serde(default)]
    pub condition: Option<Condition>,
    pub strategy: StrategyKind,
    /// Standing headroom added on top of the strategy's result.
    #[serde(default)]
    pub extra_agent_count: i32,
}

/// The closed set of pool sizing strategies.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StrategyKind {
    /// Never scales.
    NoOp,
    /// Sizes from historical lease utilization.
    LeaseUtilization(LeaseUtilizationSettings),
    /// Sizes from the depth of the ready job queue.
    JobQueue(JobQueueSettings),
    /// Reports busy/idle agents; never scales.
    UtilizationMetric,
    /// Reports job queue depth; never scales.
    JobQueueMetric(JobQueueSettings),
}

impl StrategyKind {
    pub fn name(&self) -> &'static str {
        match self {
            StrategyKind::NoOp => "no_op",
            StrategyKind::LeaseUtilization(_) => "lease_utilization",
            StrategyKind::JobQueue(_) => "job_queue",
            StrategyKind::UtilizationMetric => "utilization_metric",
            StrategyKind::JobQueueMetric(_) => "job_queue_metric",
        }
    }
}

/// Settings for the lease-utilization strategy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LeaseUtilizationSettings {
    /// Width of one sample bucket.
    pub sample_period: String,
    /// Number of buckets in the trailing window.
    pub num_samples: usize,
    /// Rank (from the bottom) of the sample used as the result.
    pub num_samples_for_result: usize,
    pub min_agents: u32,
    pub num_reserve_agents: u32,
}

impl Default for LeaseUtilizationSettings {
    fn default() -> Self {
        Self {
            sample_period: "60s".to_string(),
            num_samples: 10,
            num_samples_for_result: 9,
            min_agents: 1,
            num_reserve_agents: 5,
        }
    }
}

impl LeaseUtilizationSettings {
    pub fn sample_width(&self) -> CoreResult<Duration> {
        parse_duration(&self.sample_period)
    }
}

/// Settings for the job-queue strategy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct JobQueueSettings {
    pub scale_out_factor: f64,
    pub scale_in_factor: f64,
    /// Only jobs created within this window are considered.
    pub sampling_period: String,
    /// Batches ready for less than this are not yet counted as waiting.
    pub ready_time_threshold: String,
    pub min_agents: u32,
}

impl Default for JobQueueSettings {
    fn default() -> Self {
        Self {
            scale_out_factor: 0.25,
            scale_in_factor: 0.9,
            sampling_period: "1h".to_string(),
            ready_time_threshold: "45s".to_string(),
            min_agents: 0,
        }
    }
}

impl JobQueueSettings {
    pub fn sampling_period(&self) -> CoreResult<Duration> {
        parse_duration(&self.sampling_period)
    }

    pub fn ready_time_threshold(&self) -> CoreResult<Duration> {
        parse_duration(&self.ready_time_threshold)
    }
}

// ── Fleet managers ─────────────────────────────────────────────────

/// One entry in a pool's ordered list of fleet managers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FleetManagerConfig {
    #[serde(default)]
    pub condition: Option<Condition>,
    pub manager: FleetManagerKind,
}

/// The closed set of fleet-manager kinds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FleetManagerKind {
    /// Logs requests, changes nothing.
    NoOp,
    /// Adds and removes agent records in the local store.
    Local(LocalFleetSettings),
    /// A backend supplied by the embedding application.
    Custom {
        name: String,
        #[serde(default)]
        settings: serde_json::Value,
    },
}

/// Settings for the store-backed local fleet manager.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LocalFleetSettings {
    /// Prefix for the ids of agents created by this manager.
    pub agent_prefix: String,
    pub logical_cores: u32,
}

impl Default for LocalFleetSettings {
    fn default() -> Self {
        Self {
            agent_prefix: "local".to_string(),
            logical_cores: 8,
        }
    }
}
