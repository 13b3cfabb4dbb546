//! Sizes a pool from how busy its agents have been recently.
//!
//! The trailing window `[now - N*width, now)` is cut into `N` buckets. Each
//! lease contributes the fraction of every bucket it covers, so one agent
//! busy for a whole bucket adds `1.0` to that bucket. Summing over a pool's
//! agents gives "agents worth of work" per bucket; the strategy then picks
//! a high percentile of those samples so short spikes do not drive scaling.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_core::{LeaseUtilizationSettings, PoolConfig};
use fleetgrid_state::{Agent, AgentId, Lease};

use crate::context::{SampleWindow, TickContext};
use crate::error::{AutoscaleError, AutoscaleResult};
use crate::strategy::{PoolSizeResult, PoolSizeStrategy};

/// Float noise from summing fractions must not round a whole agent up.
const EPSILON: f64 = 1e-9;

/// Per-bucket utilization of one agent, oldest bucket first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UtilizationSamples {
    pub job_work: Vec<f64>,
    pub other_work: Vec<f64>,
}

impl UtilizationSamples {
    fn zeroed(num_samples: usize) -> Self {
        Self {
            job_work: vec![0.0; num_samples],
            other_work: vec![0.0; num_samples],
        }
    }
}

pub type AgentSamples = HashMap<AgentId, UtilizationSamples>;

/// Attribute every lease to the buckets of the window starting at
/// `window_start`. Open leases are treated as ending at `now`.
pub fn compute_agent_samples(
    leases: &[Lease],
    window_start: DateTime<Utc>,
    width: Duration,
    num_samples: usize,
    now: DateTime<Utc>,
) -> AgentSamples {
    let mut samples = AgentSamples::new();
    let width_ms = width.as_millis() as f64;
    if width_ms <= 0.0 || num_samples == 0 {
        return samples;
    }
    let to_buckets = |t: DateTime<Utc>| (t - window_start).num_milliseconds() as f64 / width_ms;
    let limit = num_samples as f64;

    for lease in leases {
        let start = to_buckets(lease.start_time).max(0.0);
        let finish = to_buckets(lease.finish_time.unwrap_or(now).min(now)).min(limit);
        if finish <= start {
            continue;
        }

        let entry = samples
            .entry(lease.agent_id.clone())
            .or_insert_with(|| UtilizationSamples::zeroed(num_samples));
        let buckets = if lease.kind.is_job_work() {
            &mut entry.job_work
        } else {
            &mut entry.other_work
        };

        let first = start.floor() as usize;
        let last = (finish.ceil() as usize).min(num_samples);
        for (i, bucket) in buckets.iter_mut().enumerate().take(last).skip(first) {
            let lo = start.max(i as f64);
            let hi = finish.min(i as f64 + 1.0);
            if hi > lo {
                *bucket += hi - lo;
            }
        }
    }
    samples
}

/// Sizes a pool from a percentile of its historical job-work utilization.
#[derive(Debug, Clone)]
pub struct LeaseUtilizationStrategy {
    settings: LeaseUtilizationSettings,
    window: SampleWindow,
}

impl LeaseUtilizationStrategy {
    pub fn new(settings: LeaseUtilizationSettings) -> AutoscaleResult<Self> {
        let width = settings.sample_width()?;
        if width.is_zero() {
            return Err(AutoscaleError::InvalidSettings(
                "sample_period must be positive".to_string(),
            ));
        }
        if settings.num_samples == 0 {
            return Err(AutoscaleError::InvalidSettings(
                "num_samples must be at least 1".to_string(),
            ));
        }
        let window = SampleWindow {
            width,
            num_samples: settings.num_samples,
        };
        Ok(Self { settings, window })
    }

    /// Index into the ascending samples that yields the result.
    fn result_index(&self) -> usize {
        self.settings
            .num_samples_for_result
            .clamp(1, self.settings.num_samples)
            - 1
    }
}

#[async_trait]
impl PoolSizeStrategy for LeaseUtilizationStrategy {
    fn name(&self) -> &'static str {
        "lease_utilization"
    }

    async fn calculate_pool_size(
        &self,
        pool: &PoolConfig,
        agents: &[Agent],
        ctx: &TickContext,
    ) -> AutoscaleResult<PoolSizeResult> {
        let samples = ctx.agent_samples(self.window).await?;

        let mut pool_samples = vec![0.0; self.settings.num_samples];
        for agent in agents {
            if let Some(agent_samples) = samples.get(&agent.id) {
                for (total, v) in pool_samples.iter_mut().zip(&agent_samples.job_work) {
                    *total += v;
                }
            }
        }
        pool_samples.sort_by(f64::total_cmp);

        let chosen = pool_samples[self.result_index()];
        let max = pool_samples.last().copied().unwrap_or_default();
        let busy = (chosen - EPSILON).ceil().max(0.0) as usize;
        let reserve = self.settings.num_reserve_agents as usize;
        let min = self.settings.min_agents as usize;
        let desired = (busy + reserve).max(min);

        tracing::debug!(
            pool = %pool.id,
            sample = chosen,
            max_sample = max,
            current = agents.len(),
            desired,
            "lease utilization"
        );

        Ok(PoolSizeResult::new(agents.len(), desired)
            .with_status("sample", format!("{chosen:.2}"))
            .with_status("max_sample", format!("{max:.2}"))
            .with_status("reserve_agents", reserve)
            .with_status("min_agents", min))
    }
}
