//! The fleet-size control loop.
//!
//! Each tick loads every pool and its active agents, sizes all pools
//! concurrently (bounded by `max_concurrent_pools`) against one shared
//! [`TickContext`], and drives the selected fleet manager toward the
//! desired size. Pools are isolated from each other: an error in one is
//! reported in the [`TickReport`] and never stops the rest.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use fleet_core::{
    Clock, CoreResult, DowntimeSchedule, DowntimeSource, PoolConfig, PoolId, SystemClock,
    config::FleetSettings,
};
use fleetgrid_state::{
    Agent, AgentFilter, AgentStatus, PoolScaleUpdate, ScaleOutcome, ScaleResult, StateStore,
};
use serde::Serialize;
use tokio::sync::{Mutex, Semaphore, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::context::TickContext;
use crate::error::{AutoscaleError, AutoscaleResult};
use crate::fleet_manager::{
    DefaultFleetManagerFactory, FleetManager, FleetManagerFactory, resolve_fleet_manager,
};
use crate::strategy::{PoolSizeResult, resolve_strategy};

/// Fleet-wide knobs for the orchestrator.
#[derive(Debug, Clone)]
pub struct FleetServiceSettings {
    pub autoscaling_enabled: bool,
    pub scale_out_cooldown: Duration,
    pub scale_in_cooldown: Duration,
    pub max_concurrent_pools: usize,
}

impl Default for FleetServiceSettings {
    fn default() -> Self {
        Self {
            autoscaling_enabled: true,
            scale_out_cooldown: Duration::from_secs(120),
            scale_in_cooldown: Duration::from_secs(1200),
            max_concurrent_pools: 10,
        }
    }
}

impl FleetServiceSettings {
    pub fn from_config(fleet: &FleetSettings) -> CoreResult<Self> {
        Ok(Self {
            autoscaling_enabled: fleet.autoscaling_enabled,
            scale_out_cooldown: fleet.scale_out_cooldown()?,
            scale_in_cooldown: fleet.scale_in_cooldown()?,
            max_concurrent_pools: fleet.max_concurrent_pools.max(1),
        })
    }
}

/// What happened to one pool in a tick.
#[derive(Debug, Clone, Serialize)]
pub struct PoolTickResult {
    pub pool_id: PoolId,
    pub strategy: &'static str,
    pub size: Option<PoolSizeResult>,
    pub result: ScaleResult,
}

/// A pool whose evaluation failed.
#[derive(Debug, Clone, Serialize)]
pub struct PoolFailure {
    pub pool_id: PoolId,
    pub error: String,
}

/// Outcome of one pass over all pools.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TickReport {
    pub results: Vec<PoolTickResult>,
    pub failures: Vec<PoolFailure>,
}

impl TickReport {
    pub fn result_for(&self, pool_id: &str) -> Option<&PoolTickResult> {
        self.results.iter().find(|r| r.pool_id == pool_id)
    }
}

/// The fleet-size orchestrator.
#[derive(Clone)]
pub struct FleetService {
    store: StateStore,
    clock: Arc<dyn Clock>,
    downtime: Arc<dyn DowntimeSource>,
    managers: Option<Arc<dyn FleetManagerFactory>>,
    settings: FleetServiceSettings,
    /// One lock per pool; a pool is never evaluated by two passes at once.
    pool_locks: Arc<Mutex<HashMap<PoolId, Arc<Mutex<()>>>>>,
}

impl FleetService {
    pub fn new(store: StateStore, settings: FleetServiceSettings) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            downtime: Arc::new(DowntimeSchedule::new(Vec::new())),
            managers: None,
            settings,
            pool_locks: Arc::default(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_downtime(mut self, downtime: Arc<dyn DowntimeSource>) -> Self {
        self.downtime = downtime;
        self
    }

    /// Replace the built-in manager factory, e.g. to plug in a cloud backend.
    pub fn with_fleet_manager_factory(mut self, factory: Arc<dyn FleetManagerFactory>) -> Self {
        self.managers = Some(factory);
        self
    }

    pub fn settings(&self) -> &FleetServiceSettings {
        &self.settings
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    fn factory(&self) -> Arc<dyn FleetManagerFactory> {
        match &self.managers {
            Some(factory) => factory.clone(),
            None => Arc::new(DefaultFleetManagerFactory::new(
                self.store.clone(),
                self.clock.clone(),
            )),
        }
    }

    fn new_context(&self, cancel: &CancellationToken) -> TickContext {
        let now = self.clock.now();
        TickContext::new(
            self.store.clone(),
            now,
            self.downtime.is_active(now),
            cancel.clone(),
        )
    }

    /// Live agents of `pool_id`.
    fn pool_agents(&self, pool_id: &str) -> AutoscaleResult<Vec<Agent>> {
        Ok(self.store.find_agents(&AgentFilter::live().pool(pool_id))?)
    }

    async fn pool_lock(&self, pool_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.pool_locks.lock().await;
        locks.entry(pool_id.to_string()).or_default().clone()
    }

    /// Size and scale `pool` while holding its lock. Agents are read under
    /// the lock so a pass sees what an earlier pass on the same pool did.
    async fn evaluate_pool(
        &self,
        pool: &PoolConfig,
        ctx: &TickContext,
    ) -> AutoscaleResult<PoolTickResult> {
        let lock = self.pool_lock(&pool.id).await;
        let _guard = lock.lock().await;
        let agents = self.pool_agents(&pool.id)?;
        self.size_and_scale(pool, &agents, ctx).await
    }

    /// Evaluate and scale every pool once.
    pub async fn tick(&self, cancel: &CancellationToken) -> AutoscaleResult<TickReport> {
        if !self.settings.autoscaling_enabled {
            debug!("autoscaling disabled, skipping tick");
            return Ok(TickReport::default());
        }

        let ctx = Arc::new(self.new_context(cancel));
        let pools = self.store.list_pool_configs()?;
        debug!(
            pools = pools.len(),
            downtime = ctx.downtime_active(),
            "fleet tick"
        );

        let permits = Arc::new(Semaphore::new(self.settings.max_concurrent_pools));
        let mut tasks = JoinSet::new();
        let mut task_pools = HashMap::new();

        for pool in pools {
            let pool_id = pool.id.clone();
            let service = self.clone();
            let ctx = ctx.clone();
            let permits = permits.clone();
            let handle = tasks.spawn(async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|_| AutoscaleError::Cancelled)?;
                let cancel = ctx.cancel_token().clone();
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(AutoscaleError::Cancelled),
                    result = service.evaluate_pool(&pool, &ctx) => result,
                }
            });
            task_pools.insert(handle.id(), pool_id);
        }

        let mut report = TickReport::default();
        while let Some(joined) = tasks.join_next_with_id().await {
            match joined {
                Ok((_, Ok(result))) => report.results.push(result),
                Ok((id, Err(e))) => {
                    let pool_id = task_pools.remove(&id).unwrap_or_default();
                    warn!(pool = %pool_id, error = %e, "pool evaluation failed");
                    report.failures.push(PoolFailure {
                        pool_id,
                        error: e.to_string(),
                    });
                }
                Err(e) => {
                    let pool_id = task_pools.remove(&e.id()).unwrap_or_default();
                    error!(pool = %pool_id, error = %e, "pool evaluation panicked");
                    report.failures.push(PoolFailure {
                        pool_id,
                        error: e.to_string(),
                    });
                }
            }
        }

        report.results.sort_by(|a, b| a.pool_id.cmp(&b.pool_id));
        report.failures.sort_by(|a, b| a.pool_id.cmp(&b.pool_id));
        Ok(report)
    }

    /// Size and scale a single pool on demand.
    pub async fn calculate_and_scale(
        &self,
        pool_id: &str,
        cancel: &CancellationToken,
    ) -> AutoscaleResult<PoolTickResult> {
        let pool = self
            .store
            .get_pool_config(pool_id)?
            .ok_or_else(|| AutoscaleError::PoolNotFound(pool_id.to_string()))?;
        if !self.settings.autoscaling_enabled {
            return Ok(PoolTickResult {
                pool_id: pool.id,
                strategy: "none",
                size: None,
                result: ScaleResult::no_op("Autoscaling is disabled"),
            });
        }

        let ctx = self.new_context(cancel);
        self.evaluate_pool(&pool, &ctx).await
    }

    async fn size_and_scale(
        &self,
        pool: &PoolConfig,
        agents: &[Agent],
        ctx: &TickContext,
    ) -> AutoscaleResult<PoolTickResult> {
        let strategy = resolve_strategy(pool, ctx.properties())?;
        let manager = resolve_fleet_manager(pool, ctx.properties(), self.factory().as_ref())?;
        let size = strategy.calculate_pool_size(pool, agents, ctx).await?;
        let result = self
            .scale_pool(pool, agents, &size, manager.as_ref(), ctx)
            .await?;
        Ok(PoolTickResult {
            pool_id: pool.id.clone(),
            strategy: strategy.name(),
            size: Some(size),
            result,
        })
    }

    /// Move `pool` toward the size in `size` and record what happened.
    pub async fn scale_pool(
        &self,
        pool: &PoolConfig,
        agents: &[Agent],
        size: &PoolSizeResult,
        manager: &dyn FleetManager,
        ctx: &TickContext,
    ) -> AutoscaleResult<ScaleResult> {
        if !pool.enable_autoscaling {
            return Ok(ScaleResult::no_op("Autoscaling is disabled for this pool"));
        }
        let Some(state) = self.store.get_pool_state(&pool.id)? else {
            debug!(pool = %pool.id, "no scale state for pool");
            return Ok(ScaleResult::no_op("Pool has no scale state"));
        };

        let now = ctx.now();
        let current = size.current_agent_count;
        let desired = size.desired_agent_count;
        let mut update = PoolScaleUpdate {
            last_agent_count: Some(current),
            last_desired_agent_count: Some(desired),
            ..PoolScaleUpdate::default()
        };

        let result = if desired > current {
            let cooldown = pool.scale_out_cooldown_or(self.settings.scale_out_cooldown)?;
            if ctx.downtime_active() {
                ScaleResult::no_op("Downtime is active")
            } else if let Some(left) = cooldown_remaining(state.last_scale_up_time, cooldown, now) {
                debug!(pool = %pool.id, remaining_secs = left.num_seconds(), "scale-out cooldown");
                return Ok(ScaleResult::no_op(format!(
                    "Cooldown active, {}s remaining",
                    left.num_seconds()
                )));
            } else {
                update.last_scale_up_time = Some(now);
                self.scale_out(pool, agents, desired - current, manager, ctx)
                    .await?
            }
        } else if desired < current {
            let cooldown = pool.scale_in_cooldown_or(self.settings.scale_in_cooldown)?;
            if let Some(left) = cooldown_remaining(state.last_scale_down_time, cooldown, now) {
                debug!(pool = %pool.id, remaining_secs = left.num_seconds(), "scale-in cooldown");
                return Ok(ScaleResult::no_op(format!(
                    "Cooldown active, {}s remaining",
                    left.num_seconds()
                )));
            }
            update.last_scale_down_time = Some(now);
            let count = current - desired;
            match manager
                .shrink_pool(pool, agents, count, ctx.cancel_token())
                .await
            {
                Ok(result) => result,
                Err(e) => {
                    warn!(pool = %pool.id, count, error = %e, "shrink failed");
                    ScaleResult::failure(format!("Failed to remove {count} agents: {e}"))
                }
            }
        } else {
            ScaleResult::no_op("Pool is at desired size")
        };

        if ctx.cancel_token().is_cancelled() {
            return Err(AutoscaleError::Cancelled);
        }
        update.last_scale_result = Some(result.clone());
        self.store.update_pool_scale_state(&pool.id, &update)?;

        if state.last_scale_result.as_ref() == Some(&result) {
            debug!(pool = %pool.id, current, desired, result = %result, "pool scaled");
        } else {
            info!(pool = %pool.id, current, desired, result = %result, "pool scaled");
        }
        Ok(result)
    }

    /// Grow by `delta`, reusing agents with a pending shutdown first.
    async fn scale_out(
        &self,
        pool: &PoolConfig,
        agents: &[Agent],
        delta: usize,
        manager: &dyn FleetManager,
        ctx: &TickContext,
    ) -> AutoscaleResult<ScaleResult> {
        let pending = self.store.find_agents(
            &AgentFilter::default()
                .pool(pool.id.clone())
                .enabled(true)
                .not_status(AgentStatus::Stopped)
                .request_shutdown(true),
        )?;
        let mut cancelled = 0;
        for agent in pending.iter().take(delta) {
            if self
                .store
                .update_agent_shutdown_flag(&agent.id, false, ctx.now())?
            {
                debug!(pool = %pool.id, agent = %agent.id, "cancelled pending shutdown");
                cancelled += 1;
            }
        }

        let remaining = delta - cancelled;
        if remaining == 0 {
            return Ok(ScaleResult::new(
                ScaleOutcome::Success,
                cancelled,
                0,
                format!("Cancelled shutdown of {cancelled} agents"),
            ));
        }

        let result = match manager
            .expand_pool(pool, agents, remaining, ctx.cancel_token())
            .await
        {
            Ok(result) => result,
            Err(e) => {
                warn!(pool = %pool.id, count = remaining, error = %e, "expand failed");
                ScaleResult::failure(format!("Failed to add {remaining} agents: {e}"))
            }
        };
        if cancelled == 0 {
            return Ok(result);
        }

        let outcome = match result.outcome {
            ScaleOutcome::Failure | ScaleOutcome::NoOp => ScaleOutcome::PartialSuccess,
            other => other,
        };
        Ok(ScaleResult::new(
            outcome,
            result.agents_added_count + cancelled,
            result.agents_removed_count,
            format!(
                "Cancelled shutdown of {cancelled} agents; {}",
                result.message
            ),
        ))
    }

    /// Run ticks every `interval` until `shutdown` fires. A tick in flight
    /// when shutdown arrives is cancelled and awaited.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = interval.as_secs(),
            max_concurrent_pools = self.settings.max_concurrent_pools,
            "fleet service started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    let cancel = CancellationToken::new();
                    let mut tick = std::pin::pin!(self.tick(&cancel));
                    let outcome = tokio::select! {
                        outcome = &mut tick => Some(outcome),
                        _ = shutdown.changed() => None,
                    };
                    match outcome {
                        Some(Ok(report)) => {
                            debug!(
                                scaled = report.results.len(),
                                failed = report.failures.len(),
                                "fleet tick complete"
                            );
                        }
                        Some(Err(e)) => error!(error = %e, "fleet tick failed"),
                        None => {
                            cancel.cancel();
                            let _ = tick.await;
                            info!("fleet service shutting down");
                            break;
                        }
                    }
                }
                _ = shutdown.changed() => {
                    info!("fleet service shutting down");
                    break;
                }
            }
        }
    }
}

/// Time left before another scale in the same direction is allowed.
fn cooldown_remaining(
    last: Option<DateTime<Utc>>,
    cooldown: Duration,
    now: DateTime<Utc>,
) -> Option<TimeDelta> {
    let last = last?;
    let cooldown = TimeDelta::from_std(cooldown).unwrap_or(TimeDelta::MAX);
    let remaining = (last + cooldown) - now;
    (remaining > TimeDelta::zero()).then_some(remaining)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use fleet_core::{
        DowntimeWindow, FleetManagerConfig, FleetManagerKind, LeaseUtilizationSettings,
        ManualClock, PoolSizeStrategyConfig, StrategyKind,
    };
    use fleetgrid_state::{AgentStatus, PoolScaleState};
    use std::sync::Mutex;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 6, 12, 0, 0).unwrap()
    }

    /// Records requests and answers with a successful scale.
    #[derive(Default)]
    struct RecordingManager {
        expands: Mutex<Vec<usize>>,
        shrinks: Mutex<Vec<usize>>,
        fail: bool,
        /// Simulates a slow provisioning call.
        delay: Option<Duration>,
    }

    #[async_trait]
    impl FleetManager for RecordingManager {
        async fn expand_pool(
            &self,
            _pool: &PoolConfig,
            _agents: &[Agent],
            count: usize,
            _cancel: &CancellationToken,
        ) -> anyhow::Result<ScaleResult> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.expands.lock().unwrap().push(count);
            if self.fail {
                anyhow::bail!("cloud unavailable");
            }
            Ok(ScaleResult::new(ScaleOutcome::Success, count, 0, "expanded"))
        }

        async fn shrink_pool(
            &self,
            _pool: &PoolConfig,
            _agents: &[Agent],
            count: usize,
            _cancel: &CancellationToken,
        ) -> anyhow::Result<ScaleResult> {
            self.shrinks.lock().unwrap().push(count);
            Ok(ScaleResult::new(ScaleOutcome::Success, 0, count, "shrunk"))
        }

        async fn num_stopped_instances(
            &self,
            _pool: &PoolConfig,
            _cancel: &CancellationToken,
        ) -> anyhow::Result<usize> {
            Ok(0)
        }
    }

    struct Harness {
        store: StateStore,
        clock: Arc<ManualClock>,
        manager: Arc<RecordingManager>,
        service: FleetService,
    }

    fn harness_with(manager: RecordingManager, settings: FleetServiceSettings) -> Harness {
        let store = StateStore::open_in_memory().unwrap();
        let clock = Arc::new(ManualClock::new(start()));
        let manager = Arc::new(manager);
        let factory = DefaultFleetManagerFactory::new(store.clone(), clock.clone())
            .with_custom("recording", manager.clone());
        let service = FleetService::new(store.clone(), settings)
            .with_clock(clock.clone())
            .with_fleet_manager_factory(Arc::new(factory));
        Harness {
            store,
            clock,
            manager,
            service,
        }
    }

    fn harness() -> Harness {
        harness_with(RecordingManager::default(), FleetServiceSettings::default())
    }

    /// A pool sized by a no-op strategy plus `extra` agents, managed by
    /// the recording manager.
    fn pool(id: &str, extra: i32) -> PoolConfig {
        let mut pool = PoolConfig::new(id);
        pool.sizing = vec![PoolSizeStrategyConfig {
            condition: None,
            strategy: StrategyKind::NoOp,
            extra_agent_count: extra,
        }];
        pool.fleet_managers = vec![FleetManagerConfig {
            condition: None,
            manager: FleetManagerKind::Custom {
                name: "recording".to_string(),
                settings: serde_json::Value::Null,
            },
        }];
        pool
    }

    impl Harness {
        fn add_pool(&self, pool: &PoolConfig) {
            self.store.put_pool_config(pool).unwrap();
            self.store.put_pool_state(&PoolScaleState::new(&pool.id)).unwrap();
        }

        fn add_agents(&self, pool: &str, n: usize, request_shutdown: bool) {
            for i in 0..n {
                let mut agent =
                    Agent::new(format!("{pool}-{request_shutdown}-{i}"), start()).with_pool(pool);
                agent.request_shutdown = request_shutdown;
                self.store.put_agent(&agent).unwrap();
            }
        }

        fn state(&self, pool: &str) -> PoolScaleState {
            self.store.get_pool_state(pool).unwrap().unwrap()
        }
    }

    #[tokio::test]
    async fn scale_out_cooldown_is_idempotent() {
        let h = harness();
        h.add_pool(&pool("win", 2));
        h.add_agents("win", 1, false);

        let report = h.service.tick(&CancellationToken::new()).await.unwrap();
        let first = &report.result_for("win").unwrap().result;
        assert_eq!(first.outcome, ScaleOutcome::Success);
        assert_eq!(first.agents_added_count, 2);
        let after_first = h.state("win");
        assert_eq!(after_first.last_scale_up_time, Some(start()));

        h.clock.advance(TimeDelta::seconds(30));
        let report = h.service.tick(&CancellationToken::new()).await.unwrap();
        let second = &report.result_for("win").unwrap().result;
        assert_eq!(second.outcome, ScaleOutcome::NoOp);
        assert!(second.message.starts_with("Cooldown active"), "{}", second.message);
        assert!(second.message.contains("90s"), "{}", second.message);

        // The cooldown no-op must not overwrite the last real result.
        assert_eq!(h.state("win"), after_first);
        assert_eq!(*h.manager.expands.lock().unwrap(), vec![2]);
    }

    #[tokio::test]
    async fn pool_cooldown_override_wins() {
        let h = harness();
        let mut p = pool("win", 1);
        p.scale_out_cooldown = Some("10s".to_string());
        h.add_pool(&p);

        h.service.tick(&CancellationToken::new()).await.unwrap();
        h.clock.advance(TimeDelta::seconds(15));
        let report = h.service.tick(&CancellationToken::new()).await.unwrap();
        assert_eq!(
            report.result_for("win").unwrap().result.outcome,
            ScaleOutcome::Success
        );
        assert_eq!(*h.manager.expands.lock().unwrap(), vec![1, 1]);
    }

    #[tokio::test]
    async fn pending_shutdowns_are_cancelled_before_provisioning() {
        let h = harness();
        h.add_pool(&pool("win", 5));
        h.add_agents("win", 3, true);

        let report = h.service.tick(&CancellationToken::new()).await.unwrap();
        let result = &report.result_for("win").unwrap().result;
        assert_eq!(result.outcome, ScaleOutcome::Success);
        assert_eq!(result.agents_added_count, 5);
        assert_eq!(*h.manager.expands.lock().unwrap(), vec![2]);

        let pending = h
            .store
            .find_agents(&AgentFilter::default().pool("win").request_shutdown(true))
            .unwrap();
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn cancelled_shutdowns_cover_the_whole_delta() {
        let h = harness();
        h.add_pool(&pool("win", 2));
        h.add_agents("win", 4, true);

        let report = h.service.tick(&CancellationToken::new()).await.unwrap();
        let result = &report.result_for("win").unwrap().result;
        assert_eq!(result.agents_added_count, 2);
        assert!(h.manager.expands.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn expand_failure_after_cancelling_is_partial() {
        let h = harness_with(
            RecordingManager {
                fail: true,
                ..RecordingManager::default()
            },
            FleetServiceSettings::default(),
        );
        h.add_pool(&pool("win", 3));
        h.add_agents("win", 1, true);

        let report = h.service.tick(&CancellationToken::new()).await.unwrap();
        let result = &report.result_for("win").unwrap().result;
        assert_eq!(result.outcome, ScaleOutcome::PartialSuccess);
        assert_eq!(result.agents_added_count, 1);
        assert_eq!(
            h.state("win").last_scale_result.unwrap().outcome,
            ScaleOutcome::PartialSuccess
        );
    }

    #[tokio::test]
    async fn manager_errors_become_failures() {
        let h = harness_with(
            RecordingManager {
                fail: true,
                ..RecordingManager::default()
            },
            FleetServiceSettings::default(),
        );
        h.add_pool(&pool("win", 2));

        let report = h.service.tick(&CancellationToken::new()).await.unwrap();
        let result = &report.result_for("win").unwrap().result;
        assert_eq!(result.outcome, ScaleOutcome::Failure);
        assert!(result.message.contains("cloud unavailable"));
        assert!(report.failures.is_empty());
    }

    #[tokio::test]
    async fn one_bad_pool_does_not_stop_the_others() {
        let h = harness();
        h.add_pool(&pool("good", 1));

        let mut bad_settings = pool("bad-settings", 0);
        bad_settings.sizing[0].strategy = StrategyKind::LeaseUtilization(LeaseUtilizationSettings {
            sample_period: "sometimes".to_string(),
            ..LeaseUtilizationSettings::default()
        });
        h.add_pool(&bad_settings);

        let mut bad_manager = pool("bad-manager", 1);
        bad_manager.fleet_managers[0].manager = FleetManagerKind::Custom {
            name: "nowhere".to_string(),
            settings: serde_json::Value::Null,
        };
        h.add_pool(&bad_manager);

        let report = h.service.tick(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.results.len(), 1);
        assert_eq!(
            report.result_for("good").unwrap().result.outcome,
            ScaleOutcome::Success
        );
        assert!(h.state("good").last_scale_result.is_some());

        let failed: Vec<&str> = report.failures.iter().map(|f| f.pool_id.as_str()).collect();
        assert_eq!(failed, vec!["bad-manager", "bad-settings"]);
        assert!(h.state("bad-manager").last_scale_result.is_none());
    }

    #[tokio::test]
    async fn failing_evaluation_is_isolated_to_its_pool() {
        let h = harness();
        h.add_pool(&pool("good", 1));

        // Valid at construction; the sample window only overflows when the
        // strategy reads lease history during the tick.
        let mut overflow = pool("overflow", 0);
        overflow.sizing[0].strategy = StrategyKind::LeaseUtilization(LeaseUtilizationSettings {
            sample_period: "2000000000000h".to_string(),
            num_samples: 10,
            ..LeaseUtilizationSettings::default()
        });
        h.add_pool(&overflow);

        let report = h.service.tick(&CancellationToken::new()).await.unwrap();
        assert_eq!(
            report.result_for("good").unwrap().result.outcome,
            ScaleOutcome::Success
        );
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].pool_id, "overflow");
        assert!(h.state("overflow").last_scale_result.is_none());
        assert_eq!(*h.manager.expands.lock().unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn stopped_agents_are_not_capacity() {
        let h = harness();
        h.add_pool(&pool("win", 3));
        for i in 0..3 {
            let mut agent = Agent::new(format!("dead-{i}"), start()).with_pool("win");
            agent.status = AgentStatus::Stopped;
            agent.request_shutdown = true;
            h.store.put_agent(&agent).unwrap();
        }

        let report = h.service.tick(&CancellationToken::new()).await.unwrap();
        let first = report.result_for("win").unwrap();
        assert_eq!(first.size.as_ref().unwrap().current_agent_count, 0);
        assert_eq!(first.result.agents_added_count, 3);
        assert_eq!(*h.manager.expands.lock().unwrap(), vec![3]);
        // Stopped agents keep their shutdown flag.
        let flagged = h
            .store
            .find_agents(&AgentFilter::default().pool("win").request_shutdown(true))
            .unwrap();
        assert_eq!(flagged.len(), 3);

        h.clock.advance(TimeDelta::minutes(5));
        let report = h.service.tick(&CancellationToken::new()).await.unwrap();
        let second = report.result_for("win").unwrap();
        assert_eq!(second.size.as_ref().unwrap().current_agent_count, 0);
        assert_eq!(second.size.as_ref().unwrap().desired_agent_count, 3);
    }

    #[tokio::test]
    async fn manual_scale_waits_for_tick_on_same_pool() {
        let h = harness_with(
            RecordingManager {
                delay: Some(Duration::from_millis(100)),
                ..RecordingManager::default()
            },
            FleetServiceSettings::default(),
        );
        h.add_pool(&pool("win", 4));

        let cancel = CancellationToken::new();
        let (report, manual) = tokio::join!(
            h.service.tick(&cancel),
            h.service.calculate_and_scale("win", &cancel)
        );
        let periodic = report.unwrap().result_for("win").unwrap().result.clone();
        let manual = manual.unwrap().result;

        assert_eq!(*h.manager.expands.lock().unwrap(), vec![4]);
        let mut outcomes = vec![periodic.outcome, manual.outcome];
        outcomes.sort_by_key(|o| o.to_string());
        assert_eq!(outcomes, vec![ScaleOutcome::NoOp, ScaleOutcome::Success]);
        assert_eq!(periodic.agents_added_count + manual.agents_added_count, 4);
    }

    #[tokio::test]
    async fn downtime_blocks_scale_out() {
        let h = harness();
        let window = DowntimeWindow {
            start: start() - TimeDelta::hours(1),
            finish: start() + TimeDelta::hours(1),
            reason: Some("maintenance".to_string()),
        };
        let service = h
            .service
            .clone()
            .with_downtime(Arc::new(DowntimeSchedule::new(vec![window])));
        h.add_pool(&pool("win", 2));

        let report = service.tick(&CancellationToken::new()).await.unwrap();
        let result = &report.result_for("win").unwrap().result;
        assert_eq!(result.outcome, ScaleOutcome::NoOp);
        assert_eq!(result.message, "Downtime is active");
        assert_eq!(h.state("win").last_scale_result.unwrap().message, "Downtime is active");
        assert!(h.manager.expands.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn scale_in_respects_its_own_cooldown() {
        let h = harness();
        h.add_pool(&pool("win", -2));
        h.add_agents("win", 5, false);

        let report = h.service.tick(&CancellationToken::new()).await.unwrap();
        let result = &report.result_for("win").unwrap().result;
        assert_eq!(result.agents_removed_count, 2);
        assert_eq!(h.state("win").last_scale_down_time, Some(start()));
        assert_eq!(h.state("win").last_desired_agent_count, Some(3));

        h.clock.advance(TimeDelta::minutes(5));
        let report = h.service.tick(&CancellationToken::new()).await.unwrap();
        assert_eq!(
            report.result_for("win").unwrap().result.outcome,
            ScaleOutcome::NoOp
        );
        assert_eq!(*h.manager.shrinks.lock().unwrap(), vec![2]);
    }

    #[tokio::test]
    async fn missing_state_or_disabled_pool_is_a_no_op() {
        let h = harness();
        let orphan = pool("orphan", 3);
        h.store.put_pool_config(&orphan).unwrap();
        let mut disabled = pool("disabled", 3);
        disabled.enable_autoscaling = false;
        h.add_pool(&disabled);

        let report = h.service.tick(&CancellationToken::new()).await.unwrap();
        for id in ["orphan", "disabled"] {
            assert_eq!(
                report.result_for(id).unwrap().result.outcome,
                ScaleOutcome::NoOp
            );
        }
        assert!(h.state("disabled").last_scale_result.is_none());
        assert!(h.manager.expands.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn global_switch_disables_everything() {
        let h = harness_with(
            RecordingManager::default(),
            FleetServiceSettings {
                autoscaling_enabled: false,
                ..FleetServiceSettings::default()
            },
        );
        h.add_pool(&pool("win", 2));

        let report = h.service.tick(&CancellationToken::new()).await.unwrap();
        assert!(report.results.is_empty());

        let single = h
            .service
            .calculate_and_scale("win", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(single.result.message, "Autoscaling is disabled");
    }

    #[tokio::test]
    async fn calculate_and_scale_single_pool() {
        let h = harness();
        h.add_pool(&pool("win", 1));

        let result = h
            .service
            .calculate_and_scale("win", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.strategy, "extra_agent_count");
        assert_eq!(result.size.unwrap().desired_agent_count, 1);
        assert_eq!(result.result.agents_added_count, 1);

        assert!(matches!(
            h.service
                .calculate_and_scale("nope", &CancellationToken::new())
                .await,
            Err(AutoscaleError::PoolNotFound(_))
        ));
    }

    #[tokio::test]
    async fn cancelled_tick_persists_nothing() {
        let h = harness();
        h.add_pool(&pool("win", 2));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = h.service.tick(&cancel).await.unwrap();
        assert!(report.results.is_empty());
        assert_eq!(report.failures.len(), 1);
        assert_eq!(h.state("win"), PoolScaleState::new("win"));
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let h = harness();
        let (tx, rx) = watch::channel(false);
        let service = h.service.clone();
        let handle =
            tokio::spawn(async move { service.run(Duration::from_millis(10), rx).await });
        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[test]
    fn cooldown_math() {
        let now = start();
        let cooldown = Duration::from_secs(120);
        assert_eq!(cooldown_remaining(None, cooldown, now), None);
        assert_eq!(
            cooldown_remaining(Some(now - TimeDelta::seconds(20)), cooldown, now),
            Some(TimeDelta::seconds(100))
        );
        assert_eq!(
            cooldown_remaining(Some(now - TimeDelta::seconds(120)), cooldown, now),
            None
        );
    }
}
