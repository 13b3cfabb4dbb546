//! Pool sizing strategies.
//!
//! A strategy turns a pool's configuration, its current agents and the
//! farm-wide aggregations in the `TickContext` into a desired agent count.
//! Strategies never change anything; the fleet service decides what to do
//! with their answer.

pub mod extra_agents;
pub mod job_queue;
pub mod lease_utilization;
pub mod metric;

use std::collections::BTreeMap;

use async_trait::async_trait;
use fleet_core::{ConditionProperties, PoolConfig, StrategyKind};
use fleetgrid_state::Agent;
use serde::Serialize;

use crate::context::TickContext;
use crate::error::AutoscaleResult;

pub use extra_agents::ExtraAgentCountStrategy;
pub use job_queue::JobQueueStrategy;
pub use lease_utilization::LeaseUtilizationStrategy;
pub use metric::{JobQueueMetricStrategy, UtilizationMetricStrategy};

/// Current and desired size of a pool, plus free-form diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolSizeResult {
    pub current_agent_count: usize,
    pub desired_agent_count: usize,
    /// Diagnostic only; never used for control decisions.
    pub status: Option<BTreeMap<String, String>>,
}

impl PoolSizeResult {
    pub fn new(current_agent_count: usize, desired_agent_count: usize) -> Self {
        Self {
            current_agent_count,
            desired_agent_count,
            status: None,
        }
    }

    /// Attach a diagnostic entry.
    pub fn with_status(mut self, key: &str, value: impl ToString) -> Self {
        self.status
            .get_or_insert_with(BTreeMap::new)
            .insert(key.to_string(), value.to_string());
        self
    }
}

/// Computes how many agents a pool should have.
#[async_trait]
pub trait PoolSizeStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn calculate_pool_size(
        &self,
        pool: &PoolConfig,
        agents: &[Agent],
        ctx: &TickContext,
    ) -> AutoscaleResult<PoolSizeResult>;
}

/// Keeps the pool exactly as it is.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpStrategy;

#[async_trait]
impl PoolSizeStrategy for NoOpStrategy {
    fn name(&self) -> &'static str {
        "no_op"
    }

    async fn calculate_pool_size(
        &self,
        _pool: &PoolConfig,
        agents: &[Agent],
        _ctx: &TickContext,
    ) -> AutoscaleResult<PoolSizeResult> {
        Ok(PoolSizeResult::new(agents.len(), agents.len()))
    }
}

/// Build the strategy for one configured kind.
pub fn build_strategy(kind: &StrategyKind) -> AutoscaleResult<Box<dyn PoolSizeStrategy>> {
    Ok(match kind {
        StrategyKind::NoOp => Box::new(NoOpStrategy),
        StrategyKind::LeaseUtilization(settings) => {
            Box::new(LeaseUtilizationStrategy::new(settings.clone())?)
        }
        StrategyKind::JobQueue(settings) => Box::new(JobQueueStrategy::new(settings.clone())?),
        StrategyKind::UtilizationMetric => Box::new(UtilizationMetricStrategy),
        StrategyKind::JobQueueMetric(settings) => {
            Box::new(JobQueueMetricStrategy::new(settings.clone())?)
        }
    })
}

/// Pick and build the strategy a pool should use right now.
///
/// The first sizing entry whose condition holds wins; its
/// `extra_agent_count` wraps the strategy in an [`ExtraAgentCountStrategy`].
/// With no matching entry the pool is left alone.
pub fn resolve_strategy(
    pool: &PoolConfig,
    props: &ConditionProperties,
) -> AutoscaleResult<Box<dyn PoolSizeStrategy>> {
    let Some(entry) = pool.active_sizing(props)? else {
        return Ok(Box::new(NoOpStrategy));
    };
    let strategy = build_strategy(&entry.strategy)?;
    if entry.extra_agent_count == 0 {
        return Ok(strategy);
    }
    Ok(Box::new(ExtraAgentCountStrategy::new(
        strategy,
        entry.extra_agent_count,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use fleet_core::{Condition, LeaseUtilizationSettings, PoolSizeStrategyConfig};

    fn props(hour: u32) -> ConditionProperties {
        ConditionProperties::from_time(Utc.with_ymd_and_hms(2024, 5, 6, hour, 0, 0).unwrap())
    }

    fn entry(condition: Option<&str>, strategy: StrategyKind, extra: i32) -> PoolSizeStrategyConfig {
        PoolSizeStrategyConfig {
            condition: condition.map(|c| Condition::parse(c).unwrap()),
            strategy,
            extra_agent_count: extra,
        }
    }

    #[test]
    fn no_entries_resolve_to_no_op() {
        let pool = PoolConfig::new("win");
        assert_eq!(resolve_strategy(&pool, &props(12)).unwrap().name(), "no_op");
    }

    #[test]
    fn first_matching_entry_is_built() {
        let mut pool = PoolConfig::new("win");
        pool.sizing = vec![
            entry(Some("timeUtcHour < 6"), StrategyKind::UtilizationMetric, 0),
            entry(
                None,
                StrategyKind::LeaseUtilization(LeaseUtilizationSettings::default()),
                0,
            ),
        ];
        assert_eq!(
            resolve_strategy(&pool, &props(3)).unwrap().name(),
            "utilization_metric"
        );
        assert_eq!(
            resolve_strategy(&pool, &props(12)).unwrap().name(),
            "lease_utilization"
        );
    }

    #[test]
    fn extra_agents_wrap_the_strategy() {
        let mut pool = PoolConfig::new("win");
        pool.sizing = vec![entry(None, StrategyKind::NoOp, 3)];
        assert_eq!(
            resolve_strategy(&pool, &props(12)).unwrap().name(),
            "extra_agent_count"
        );
    }

    #[test]
    fn bad_settings_fail_resolution() {
        let mut pool = PoolConfig::new("win");
        pool.sizing = vec![entry(
            None,
            StrategyKind::LeaseUtilization(LeaseUtilizationSettings {
                sample_period: "whenever".to_string(),
                ..LeaseUtilizationSettings::default()
            }),
            0,
        )];
        assert!(resolve_strategy(&pool, &props(12)).is_err());
    }

    #[test]
    fn status_entries_accumulate() {
        let result = PoolSizeResult::new(2, 4)
            .with_status("a", 1)
            .with_status("b", "two");
        let status = result.status.unwrap();
        assert_eq!(status.get("a").map(String::as_str), Some("1"));
        assert_eq!(status.len(), 2);
    }
}
