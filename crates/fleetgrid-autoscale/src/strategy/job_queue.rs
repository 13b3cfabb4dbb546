//! Sizes a pool from the number of batches stuck waiting for an agent.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use fleet_core::{JobQueueSettings, PoolConfig, PoolId};
use fleetgrid_state::{Agent, BatchState, JobBatch, StreamConfig};

use crate::context::{QueueWindow, TickContext};
use crate::error::{AutoscaleError, AutoscaleResult};
use crate::strategy::{PoolSizeResult, PoolSizeStrategy};

/// Count, per pool, the ready batches that have been waiting at least
/// `threshold`. Batches whose stream or agent type maps to no pool are
/// skipped.
pub fn compute_queue_sizes(
    batches: &[JobBatch],
    streams: &[StreamConfig],
    now: DateTime<Utc>,
    threshold: Duration,
) -> AutoscaleResult<HashMap<PoolId, usize>> {
    let threshold =
        TimeDelta::from_std(threshold).map_err(|e| AutoscaleError::InvalidSettings(e.to_string()))?;
    let streams: HashMap<&str, &StreamConfig> =
        streams.iter().map(|s| (s.id.as_str(), s)).collect();

    let mut sizes = HashMap::new();
    for batch in batches {
        if batch.state != BatchState::Ready {
            continue;
        }
        let Some(ready_time) = batch.ready_time else {
            continue;
        };
        if now - ready_time < threshold {
            continue;
        }
        let Some(pool) = streams
            .get(batch.stream_id.as_str())
            .and_then(|s| s.agent_types.get(&batch.agent_type))
        else {
            continue;
        };
        *sizes.entry(pool.clone()).or_insert(0) += 1;
    }
    Ok(sizes)
}

/// Grows a pool in proportion to its waiting batches and decays it
/// geometrically once the queue is empty.
#[derive(Debug, Clone)]
pub struct JobQueueStrategy {
    settings: JobQueueSettings,
    window: QueueWindow,
}

impl JobQueueStrategy {
    pub fn new(settings: JobQueueSettings) -> AutoscaleResult<Self> {
        let window = queue_window(&settings)?;
        if settings.scale_out_factor.is_nan() || settings.scale_out_factor <= 0.0 {
            return Err(AutoscaleError::InvalidSettings(
                "scale_out_factor must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&settings.scale_in_factor) {
            return Err(AutoscaleError::InvalidSettings(
                "scale_in_factor must be between 0 and 1".to_string(),
            ));
        }
        Ok(Self { settings, window })
    }

    fn desired(&self, current: usize, queue: usize) -> usize {
        if queue > 0 {
            return current + (queue as f64 * self.settings.scale_out_factor).ceil() as usize;
        }
        let min = self.settings.min_agents as usize;
        if current <= min {
            return current;
        }
        let shrunk = (current as f64 * self.settings.scale_in_factor).floor() as usize;
        shrunk.clamp(min, current)
    }
}

pub(crate) fn queue_window(settings: &JobQueueSettings) -> AutoscaleResult<QueueWindow> {
    Ok(QueueWindow {
        sampling_period: settings.sampling_period()?,
        ready_time_threshold: settings.ready_time_threshold()?,
    })
}

/// Waiting batches for `pool`, zero while downtime is active.
pub(crate) async fn pool_queue_size(
    ctx: &TickContext,
    window: QueueWindow,
    pool: &PoolConfig,
) -> AutoscaleResult<usize> {
    if ctx.downtime_active() {
        return Ok(0);
    }
    let sizes = ctx.queue_sizes(window).await?;
    Ok(sizes.get(&pool.id).copied().unwrap_or(0))
}

#[async_trait]
impl PoolSizeStrategy for JobQueueStrategy {
    fn name(&self) -> &'static str {
        "job_queue"
    }

    async fn calculate_pool_size(
        &self,
        pool: &PoolConfig,
        agents: &[Agent],
        ctx: &TickContext,
    ) -> AutoscaleResult<PoolSizeResult> {
        let queue = pool_queue_size(ctx, self.window, pool).await?;
        let current = agents.len();
        let desired = self.desired(current, queue);
        tracing::debug!(pool = %pool.id, queue, current, desired, "job queue");
        Ok(PoolSizeResult::new(current, desired).with_status("queue_size", queue))
    }
}
