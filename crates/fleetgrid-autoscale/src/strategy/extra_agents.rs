//! Standing headroom on top of another strategy.

use async_trait::async_trait;
use fleet_core::PoolConfig;
use fleetgrid_state::Agent;

use crate::context::TickContext;
use crate::error::AutoscaleResult;
use crate::strategy::{PoolSizeResult, PoolSizeStrategy};

/// Adds `extra` agents (possibly negative) to the inner strategy's answer,
/// never going below zero.
pub struct ExtraAgentCountStrategy {
    inner: Box<dyn PoolSizeStrategy>,
    extra: i32,
}

impl ExtraAgentCountStrategy {
    pub fn new(inner: Box<dyn PoolSizeStrategy>, extra: i32) -> Self {
        Self { inner, extra }
    }
}

#[async_trait]
impl PoolSizeStrategy for ExtraAgentCountStrategy {
    fn name(&self) -> &'static str {
        "extra_agent_count"
    }

    async fn calculate_pool_size(
        &self,
        pool: &PoolConfig,
        agents: &[Agent],
        ctx: &TickContext,
    ) -> AutoscaleResult<PoolSizeResult> {
        let mut result = self.inner.calculate_pool_size(pool, agents, ctx).await?;
        let desired = result.desired_agent_count as i64 + i64::from(self.extra);
        result.desired_agent_count = desired.max(0) as usize;
        Ok(result
            .with_status("inner_strategy", self.inner.name())
            .with_status("extra_agents", self.extra))
    }
}
