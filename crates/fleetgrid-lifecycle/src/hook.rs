//! Acknowledgement side of a cloud lifecycle hook.

use async_trait::async_trait;
use fleetgrid_state::TerminationIntent;
use serde::Serialize;
use tracing::info;

/// How a pending termination should be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleAction {
    /// Work has drained; termination may proceed.
    Continue,
    /// Stop waiting; the cloud terminates the instance anyway.
    Abandon,
}

/// Talks back to the cloud about an outstanding termination.
#[async_trait]
pub trait LifecycleHook: Send + Sync {
    /// Resolve the hook; the cloud stops waiting for us.
    async fn complete(
        &self,
        intent: &TerminationIntent,
        action: LifecycleAction,
    ) -> anyhow::Result<()>;

    /// Ask the cloud to keep waiting.
    async fn heartbeat(&self, intent: &TerminationIntent) -> anyhow::Result<()>;
}

/// Logs acknowledgements without calling anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingLifecycleHook;

#[async_trait]
impl LifecycleHook for LoggingLifecycleHook {
    async fn complete(
        &self,
        intent: &TerminationIntent,
        action: LifecycleAction,
    ) -> anyhow::Result<()> {
        info!(
            instance = %intent.instance_id,
            hook = %intent.hook_name,
            group = %intent.group_name,
            ?action,
            "lifecycle hook completed"
        );
        Ok(())
    }

    async fn heartbeat(&self, intent: &TerminationIntent) -> anyhow::Result<()> {
        info!(instance = %intent.instance_id, hook = %intent.hook_name, "lifecycle hook heartbeat");
        Ok(())
    }
}
