//! fleet.toml configuration parser.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::downtime::{DowntimeSchedule, DowntimeWindow};
use crate::duration::parse_duration;
use crate::error::{CoreError, CoreResult};
use crate::types::PoolConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub fleet: FleetSettings,
    pub lifecycle: LifecycleSettings,
    pub api: ApiSettings,
    pub downtime: Vec<DowntimeWindow>,
    pub pools: Vec<PoolConfig>,
}

/// Settings for the fleet-size orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetSettings {
    /// Master switch for the whole deployment.
    pub autoscaling_enabled: bool,
    pub tick_interval: String,
    pub scale_out_cooldown: String,
    pub scale_in_cooldown: String,
    /// Upper bound on pools evaluated at the same time.
    pub max_concurrent_pools: usize,
}

impl Default for FleetSettings {
    fn default() -> Self {
        Self {
            autoscaling_enabled: true,
            tick_interval: "60s".to_string(),
            scale_out_cooldown: "2m".to_string(),
            scale_in_cooldown: "20m".to_string(),
            max_concurrent_pools: 10,
        }
    }
}

impl FleetSettings {
    pub fn tick_interval(&self) -> CoreResult<Duration> {
        parse_duration(&self.tick_interval)
    }

    pub fn scale_out_cooldown(&self) -> CoreResult<Duration> {
        parse_duration(&self.scale_out_cooldown)
    }

    pub fn scale_in_cooldown(&self) -> CoreResult<Duration> {
        parse_duration(&self.scale_in_cooldown)
    }
}

/// Settings for the termination lifecycle reconciler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleSettings {
    pub enabled: bool,
    pub poll_interval: String,
    /// Tracked terminations older than this are abandoned.
    pub max_tracking: String,
    /// Upper bound for the poll delay after repeated failures.
    pub max_backoff: String,
    /// Capacity of the inbound termination-intent queue.
    pub queue_capacity: usize,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval: "30s".to_string(),
            max_tracking: "1h".to_string(),
            max_backoff: "5m".to_string(),
            queue_capacity: 256,
        }
    }
}

impl LifecycleSettings {
    pub fn poll_interval(&self) -> CoreResult<Duration> {
        parse_duration(&self.poll_interval)
    }

    pub fn max_tracking(&self) -> CoreResult<Duration> {
        parse_duration(&self.max_tracking)
    }

    pub fn max_backoff(&self) -> CoreResult<Duration> {
        parse_duration(&self.max_backoff)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiSettings {
    pub port: u16,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self { port: 8480 }
    }
}

impl FleetConfig {
    pub fn from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> CoreResult<Self> {
        let config: FleetConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn downtime_schedule(&self) -> DowntimeSchedule {
        DowntimeSchedule::new(self.downtime.clone())
    }

    /// Check fleet-wide settings. Per-pool problems (bad cooldown strings,
    /// unknown managers) are reported when that pool is evaluated so one
    /// bad pool does not take the rest down.
    pub fn validate(&self) -> CoreResult<()> {
        self.fleet.tick_interval()?;
        self.fleet.scale_out_cooldown()?;
        self.fleet.scale_in_cooldown()?;
        if self.fleet.max_concurrent_pools == 0 {
            return Err(CoreError::Invalid(
                "fleet.max_concurrent_pools must be at least 1".to_string(),
            ));
        }

        self.lifecycle.poll_interval()?;
        self.lifecycle.max_tracking()?;
        self.lifecycle.max_backoff()?;
        if self.lifecycle.queue_capacity == 0 {
            return Err(CoreError::Invalid(
                "lifecycle.queue_capacity must be at least 1".to_string(),
            ));
        }

        for window in &self.downtime {
            if window.finish <= window.start {
                return Err(CoreError::Invalid(format!(
                    "downtime window starting {} ends before it starts",
                    window.start
                )));
            }
        }

        let mut seen = HashSet::new();
        for pool in &self.pools {
            if !seen.insert(pool.id.as_str()) {
                return Err(CoreError::Invalid(format!("duplicate pool id {:?}", pool.id)));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FleetManagerKind, StrategyKind};

    const SAMPLE: &str = r#"
[fleet]
tick_interval = "30s"
scale_out_cooldown = "1m"
max_concurrent_pools = 4

[lifecycle]
poll_interval = "15s"

[[downtime]]
start = "2024-06-01T00:00:00Z"
finish = "2024-06-01T04:00:00Z"
reason = "maintenance"

[[pools]]
id = "win-compile"
scale_in_cooldown = "30m"

[[pools.sizing]]
condition = "timeUtcHour >= 8 && timeUtcHour < 18"
extra_agent_count = 2
strategy = { type = "lease_utilization", num_samples = 20, num_samples_for_result = 18 }

[[pools.sizing]]
strategy = { type = "job_queue", scale_out_factor = 0.5 }

[[pools.fleet_managers]]
manager = { type = "local", agent_prefix = "win" }

[[pools]]
id = "linux-test"
enable_autoscaling = false
"#;

    #[test]
    fn test_parse_sample() {
        let config = FleetConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.fleet.tick_interval().unwrap(), Duration::from_secs(30));
        assert_eq!(config.fleet.scale_in_cooldown().unwrap(), Duration::from_secs(1200));
        assert_eq!(config.fleet.max_concurrent_pools, 4);
        assert_eq!(config.lifecycle.poll_interval().unwrap(), Duration::from_secs(15));
        assert_eq!(config.downtime.len(), 1);
        assert_eq!(config.pools.len(), 2);

        let pool = &config.pools[0];
        assert!(pool.enable_autoscaling);
        assert_eq!(pool.sizing.len(), 2);
        assert_eq!(pool.sizing[0].extra_agent_count, 2);
        match &pool.sizing[0].strategy {
            StrategyKind::LeaseUtilization(s) => {
                assert_eq!(s.num_samples, 20);
                assert_eq!(s.num_samples_for_result, 18);
                assert_eq!(s.num_reserve_agents, 5);
            }
            other => panic!("unexpected strategy {other:?}"),
        }
        match &pool.fleet_managers[0].manager {
            FleetManagerKind::Local(s) => assert_eq!(s.agent_prefix, "win"),
            other => panic!("unexpected manager {other:?}"),
        }
        assert!(!config.pools[1].enable_autoscaling);
    }

    #[test]
    fn test_parse_minimal() {
        let config = FleetConfig::from_toml_str("").unwrap();
        assert!(config.fleet.autoscaling_enabled);
        assert_eq!(config.fleet.max_concurrent_pools, 10);
        assert!(config.pools.is_empty());
    }

    #[test]
    fn rejects_duplicate_pools() {
        let err = FleetConfig::from_toml_str("[[pools]]\nid = \"a\"\n[[pools]]\nid = \"a\"\n");
        assert!(matches!(err, Err(CoreError::Invalid(_))));
    }

    #[test]
    fn rejects_bad_condition() {
        let toml_str = r#"
[[pools]]
id = "a"
[[pools.sizing]]
condition = "timeUtcHour >="
strategy = { type = "no_op" }
"#;
        assert!(FleetConfig::from_toml_str(toml_str).is_err());
    }

    #[test]
    fn rejects_bad_durations() {
        assert!(FleetConfig::from_toml_str("[fleet]\ntick_interval = \"often\"\n").is_err());
        assert!(FleetConfig::from_toml_str("[fleet]\nmax_concurrent_pools = 0\n").is_err());
    }

    #[test]
    fn round_trips_through_toml() {
        let config = FleetConfig::from_toml_str(SAMPLE).unwrap();
        let text = config.to_toml_string().unwrap();
        let again = FleetConfig::from_toml_str(&text).unwrap();
        assert_eq!(again.pools, config.pools);
    }

    #[test]
    fn example_config_parses() {
        let config =
            FleetConfig::from_toml_str(include_str!("../../../fleet.example.toml")).unwrap();
        assert_eq!(config.pools.len(), 2);
        assert_eq!(config.pools[0].sizing.len(), 2);
        assert!(matches!(
            config.pools[1].sizing[0].strategy,
            StrategyKind::UtilizationMetric
        ));
    }
}
