//! Per-tick evaluation context.
//!
//! A `TickContext` is created once per orchestrator tick (or per manual
//! `calculate_and_scale` call) and shared by every pool evaluated in it.
//! It pins the evaluation time, carries the cancellation token, and
//! memoizes the farm-wide aggregations that several pools need: lease
//! utilization samples, job queue sizes and the set of busy agents. Each
//! aggregation is computed at most once per context, no matter how many
//! pools ask for it concurrently.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use fleet_core::{ConditionProperties, PoolId};
use fleetgrid_state::{AgentId, StateStore};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{AutoscaleError, AutoscaleResult};
use crate::strategy::job_queue::compute_queue_sizes;
use crate::strategy::lease_utilization::{AgentSamples, compute_agent_samples};

/// Identifies one lease sampling window: bucket width and bucket count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SampleWindow {
    pub width: Duration,
    pub num_samples: usize,
}

/// Identifies one job queue query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueWindow {
    pub sampling_period: Duration,
    pub ready_time_threshold: Duration,
}

type Memo<K, V> = Mutex<HashMap<K, Arc<OnceCell<Arc<V>>>>>;

/// Shared state for one evaluation pass over the pools.
pub struct TickContext {
    store: StateStore,
    now: DateTime<Utc>,
    properties: ConditionProperties,
    downtime_active: bool,
    cancel: CancellationToken,
    lease_samples: Memo<SampleWindow, AgentSamples>,
    queue_sizes: Memo<QueueWindow, HashMap<PoolId, usize>>,
    busy_agents: OnceCell<Arc<HashSet<AgentId>>>,
    fills: AtomicUsize,
}

impl TickContext {
    pub fn new(
        store: StateStore,
        now: DateTime<Utc>,
        downtime_active: bool,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            now,
            properties: ConditionProperties::from_time(now),
            downtime_active,
            cancel,
            lease_samples: Mutex::new(HashMap::new()),
            queue_sizes: Mutex::new(HashMap::new()),
            busy_agents: OnceCell::new(),
            fills: AtomicUsize::new(0),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub fn properties(&self) -> &ConditionProperties {
        &self.properties
    }

    pub fn downtime_active(&self) -> bool {
        self.downtime_active
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Number of aggregations actually computed (as opposed to served
    /// from the memo) in this context.
    pub fn cache_fills(&self) -> usize {
        self.fills.load(Ordering::Relaxed)
    }

    fn check_cancelled(&self) -> AutoscaleResult<()> {
        if self.cancel.is_cancelled() {
            return Err(AutoscaleError::Cancelled);
        }
        Ok(())
    }

    /// Per-agent lease utilization samples over the trailing window.
    pub async fn agent_samples(&self, window: SampleWindow) -> AutoscaleResult<Arc<AgentSamples>> {
        memoized(&self.lease_samples, window, || {
            self.check_cancelled()?;
            let span = window_span(window)?;
            let window_start = self.now - span;
            let leases = self.store.find_leases(window_start, self.now)?;
            self.fills.fetch_add(1, Ordering::Relaxed);
            debug!(leases = leases.len(), ?window, "aggregating lease utilization");
            Ok(compute_agent_samples(
                &leases,
                window_start,
                window.width,
                window.num_samples,
                self.now,
            ))
        })
        .await
    }

    /// Number of stalled ready batches per pool.
    pub async fn queue_sizes(
        &self,
        window: QueueWindow,
    ) -> AutoscaleResult<Arc<HashMap<PoolId, usize>>> {
        memoized(&self.queue_sizes, window, || {
            self.check_cancelled()?;
            let period = to_delta(window.sampling_period)?;
            let batches = self.store.find_job_batches(self.now - period)?;
            let streams = self.store.list_streams()?;
            self.fills.fetch_add(1, Ordering::Relaxed);
            debug!(batches = batches.len(), streams = streams.len(), "aggregating job queue");
            compute_queue_sizes(&batches, &streams, self.now, window.ready_time_threshold)
        })
        .await
    }

    /// Agents currently holding an open job-work lease.
    pub async fn busy_agents(&self) -> AutoscaleResult<Arc<HashSet<AgentId>>> {
        let busy = self
            .busy_agents
            .get_or_try_init(|| async {
                self.check_cancelled()?;
                let leases = self.store.find_leases(self.now, self.now + TimeDelta::seconds(1))?;
                self.fills.fetch_add(1, Ordering::Relaxed);
                let busy: HashSet<AgentId> = leases
                    .into_iter()
                    .filter(|l| l.finish_time.is_none() && l.kind.is_job_work())
                    .map(|l| l.agent_id)
                    .collect();
                Ok::<_, AutoscaleError>(Arc::new(busy))
            })
            .await?;
        Ok(busy.clone())
    }
}

/// Compute `init` at most once per `key`, sharing the result with every
/// concurrent and later caller.
async fn memoized<K, V>(
    memo: &Memo<K, V>,
    key: K,
    init: impl FnOnce() -> AutoscaleResult<V>,
) -> AutoscaleResult<Arc<V>>
where
    K: Eq + Hash,
{
    let cell = {
        let mut map = memo.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(key).or_default().clone()
    };
    let value = cell
        .get_or_try_init(|| async move { init().map(Arc::new) })
        .await?;
    Ok(value.clone())
}

fn to_delta(d: Duration) -> AutoscaleResult<TimeDelta> {
    TimeDelta::from_std(d).map_err(|e| AutoscaleError::InvalidSettings(e.to_string()))
}

fn window_span(window: SampleWindow) -> AutoscaleResult<TimeDelta> {
    let count = u32::try_from(window.num_samples)
        .map_err(|_| AutoscaleError::InvalidSettings("too many samples".to_string()))?;
    let span = window
        .width
        .checked_mul(count)
        .ok_or_else(|| AutoscaleError::InvalidSettings("sample window overflows".to_string()))?;
    to_delta(span)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use fleetgrid_state::{Lease, LeaseKind};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 6, 12, 0, 0).unwrap()
    }

    fn context(store: StateStore) -> TickContext {
        TickContext::new(store, now(), false, CancellationToken::new())
    }

    #[tokio::test]
    async fn lease_samples_are_computed_once() {
        let store = StateStore::open_in_memory().unwrap();
        let ctx = Arc::new(context(store));
        let window = SampleWindow {
            width: Duration::from_secs(60),
            num_samples: 10,
        };

        let (a, b) = tokio::join!(ctx.agent_samples(window), ctx.agent_samples(window));
        a.unwrap();
        b.unwrap();
        ctx.agent_samples(window).await.unwrap();
        assert_eq!(ctx.cache_fills(), 1);

        let other = SampleWindow {
            width: Duration::from_secs(30),
            num_samples: 10,
        };
        ctx.agent_samples(other).await.unwrap();
        assert_eq!(ctx.cache_fills(), 2);
    }

    #[tokio::test]
    async fn busy_agents_only_count_open_job_leases() {
        let store = StateStore::open_in_memory().unwrap();
        let lease = |id: &str, agent: &str, kind, finish: Option<DateTime<Utc>>| Lease {
            id: id.to_string(),
            agent_id: agent.to_string(),
            session_id: "s".to_string(),
            kind,
            start_time: now() - TimeDelta::minutes(10),
            finish_time: finish,
        };
        store.put_lease(&lease("l1", "busy", LeaseKind::Job, None)).unwrap();
        store.put_lease(&lease("l2", "upgrading", LeaseKind::Upgrade, None)).unwrap();
        store
            .put_lease(&lease("l3", "done", LeaseKind::Job, Some(now() - TimeDelta::minutes(1))))
            .unwrap();

        let ctx = context(store);
        let busy = ctx.busy_agents().await.unwrap();
        assert_eq!(busy.len(), 1);
        assert!(busy.contains("busy"));
    }

    #[tokio::test]
    async fn cancelled_context_refuses_work() {
        let store = StateStore::open_in_memory().unwrap();
        let cancel = CancellationToken::new();
        let ctx = TickContext::new(store, now(), false, cancel.clone());
        cancel.cancel();

        let window = SampleWindow {
            width: Duration::from_secs(60),
            num_samples: 10,
        };
        assert!(matches!(
            ctx.agent_samples(window).await,
            Err(AutoscaleError::Cancelled)
        ));
    }

    #[test]
    fn properties_follow_now() {
        let ctx = context(StateStore::open_in_memory().unwrap());
        assert_eq!(ctx.properties().get("timeUtcHour"), Some("12"));
        assert_eq!(ctx.properties().get("timeUtcDayOfWeek"), Some("monday"));
    }
}
