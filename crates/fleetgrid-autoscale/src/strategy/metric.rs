//! Strategies that only report pool load and never change the pool size.

use async_trait::async_trait;
use fleet_core::{JobQueueSettings, PoolConfig};
use fleetgrid_state::Agent;
use tracing::info;

use crate::context::{QueueWindow, TickContext};
use crate::error::AutoscaleResult;
use crate::strategy::job_queue::{pool_queue_size, queue_window};
use crate::strategy::{PoolSizeResult, PoolSizeStrategy};

/// Reports busy and idle agents (and their cores) for a pool.
#[derive(Debug, Default, Clone, Copy)]
pub struct UtilizationMetricStrategy;

#[async_trait]
impl PoolSizeStrategy for UtilizationMetricStrategy {
    fn name(&self) -> &'static str {
        "utilization_metric"
    }

    async fn calculate_pool_size(
        &self,
        pool: &PoolConfig,
        agents: &[Agent],
        ctx: &TickContext,
    ) -> AutoscaleResult<PoolSizeResult> {
        let busy_ids = ctx.busy_agents().await?;
        let (mut busy, mut busy_cores, mut idle, mut idle_cores) = (0usize, 0u64, 0usize, 0u64);
        for agent in agents {
            if busy_ids.contains(&agent.id) {
                busy += 1;
                busy_cores += u64::from(agent.logical_cores);
            } else {
                idle += 1;
                idle_cores += u64::from(agent.logical_cores);
            }
        }

        info!(
            pool = %pool.id,
            busy_agents = busy,
            idle_agents = idle,
            busy_cores,
            idle_cores,
            "pool utilization"
        );

        Ok(PoolSizeResult::new(agents.len(), agents.len())
            .with_status("busy_agents", busy)
            .with_status("idle_agents", idle)
            .with_status("busy_cores", busy_cores)
            .with_status("idle_cores", idle_cores))
    }
}

/// Reports the job queue depth of a pool.
#[derive(Debug, Clone)]
pub struct JobQueueMetricStrategy {
    window: QueueWindow,
}

impl JobQueueMetricStrategy {
    pub fn new(settings: JobQueueSettings) -> AutoscaleResult<Self> {
        Ok(Self {
            window: queue_window(&settings)?,
        })
    }
}

#[async_trait]
impl PoolSizeStrategy for JobQueueMetricStrategy {
    fn name(&self) -> &'static str {
        "job_queue_metric"
    }

    async fn calculate_pool_size(
        &self,
        pool: &PoolConfig,
        agents: &[Agent],
        ctx: &TickContext,
    ) -> AutoscaleResult<PoolSizeResult> {
        let queue = pool_queue_size(ctx, self.window, pool).await?;
        info!(pool = %pool.id, queue_size = queue, agents = agents.len(), "pool job queue");
        Ok(PoolSizeResult::new(agents.len(), agents.len()).with_status("queue_size", queue))
    }
}
