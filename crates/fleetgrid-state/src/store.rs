//! StateStore — redb-backed state persistence for fleetgrid.
//!
//! Provides typed CRUD over agents, pools, leases, job batches, streams and
//! lifecycle records. All values are JSON-serialized into redb's `&[u8]`
//! value columns. The store supports both on-disk and in-memory backends
//! (the latter for testing).

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use fleet_core::PoolConfig;
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type Table = TableDefinition<'static, &'static str, &'static [u8]>;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        for table in [AGENTS, POOLS, POOL_STATES, LEASES, JOB_BATCHES, STREAMS, LIFECYCLE] {
            txn.open_table(table).map_err(map_err!(Table))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic helpers ────────────────────────────────────────────

    fn put_json<T: Serialize>(&self, def: Table, key: &str, value: &T) -> StateResult<()> {
        let value = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            table
                .insert(key, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get_json<T: DeserializeOwned>(&self, def: Table, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn list_json<T: DeserializeOwned>(&self, def: Table) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?);
        }
        Ok(results)
    }

    fn delete_key(&self, def: Table, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    /// Read, modify and write back one record inside a single write
    /// transaction. Returns `None` if the record does not exist.
    fn update_json<T, R>(
        &self,
        def: Table,
        key: &str,
        f: impl FnOnce(&mut T) -> R,
    ) -> StateResult<Option<R>>
    where
        T: Serialize + DeserializeOwned,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let result;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            let current: Option<T> = table
                .get(key)
                .map_err(map_err!(Read))?
                .map(|guard| serde_json::from_slice(guard.value()))
                .transpose()
                .map_err(map_err!(Deserialize))?;
            let Some(mut value) = current else {
                return Ok(None);
            };
            result = f(&mut value);
            let bytes = serde_json::to_vec(&value).map_err(map_err!(Serialize))?;
            table
                .insert(key, bytes.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(Some(result))
    }

    // ── Agents ─────────────────────────────────────────────────────

    /// Insert or update an agent.
    pub fn put_agent(&self, agent: &Agent) -> StateResult<()> {
        self.put_json(AGENTS, &agent.id, agent)
    }

    pub fn get_agent(&self, agent_id: &str) -> StateResult<Option<Agent>> {
        self.get_json(AGENTS, agent_id)
    }

    /// All agents matching `filter`.
    pub fn find_agents(&self, filter: &AgentFilter) -> StateResult<Vec<Agent>> {
        let mut agents: Vec<Agent> = self.list_json(AGENTS)?;
        agents.retain(|a| filter.matches(a));
        Ok(agents)
    }

    /// Look up the agent running on a cloud instance.
    pub fn find_agent_by_instance_id(&self, instance_id: &str) -> StateResult<Option<Agent>> {
        let agents: Vec<Agent> = self.list_json(AGENTS)?;
        Ok(agents
            .into_iter()
            .find(|a| a.instance_id.as_deref() == Some(instance_id)))
    }

    /// Set an agent's shutdown flag. Returns true if the flag changed.
    pub fn update_agent_shutdown_flag(
        &self,
        agent_id: &str,
        request_shutdown: bool,
        now: DateTime<Utc>,
    ) -> StateResult<bool> {
        let changed = self.update_json(AGENTS, agent_id, |agent: &mut Agent| {
            let changed = agent.request_shutdown != request_shutdown;
            agent.request_shutdown = request_shutdown;
            if changed {
                agent.updated_at = now;
            }
            changed
        })?;
        debug!(agent = %agent_id, request_shutdown, ?changed, "agent shutdown flag updated");
        Ok(changed.unwrap_or(false))
    }

    /// Set an agent's status. Returns false if the agent does not exist.
    pub fn update_agent_status(
        &self,
        agent_id: &str,
        status: AgentStatus,
        now: DateTime<Utc>,
    ) -> StateResult<bool> {
        let found = self.update_json(AGENTS, agent_id, |agent: &mut Agent| {
            agent.status = status;
            agent.updated_at = now;
        })?;
        Ok(found.is_some())
    }

    /// Delete an agent. Returns true if it existed.
    pub fn delete_agent(&self, agent_id: &str) -> StateResult<bool> {
        self.delete_key(AGENTS, agent_id)
    }

    // ── Pools ──────────────────────────────────────────────────────

    pub fn put_pool_config(&self, pool: &PoolConfig) -> StateResult<()> {
        self.put_json(POOLS, &pool.id, pool)
    }

    pub fn get_pool_config(&self, pool_id: &str) -> StateResult<Option<PoolConfig>> {
        self.get_json(POOLS, pool_id)
    }

    pub fn list_pool_configs(&self) -> StateResult<Vec<PoolConfig>> {
        self.list_json(POOLS)
    }

    /// Replace the stored pool configs with `pools`, creating empty scale
    /// state for new pools and keeping existing state untouched.
    pub fn sync_pool_configs(&self, pools: &[PoolConfig]) -> StateResult<()> {
        let keep: HashSet<&str> = pools.iter().map(|p| p.id.as_str()).collect();
        let stale: Vec<String> = self
            .list_pool_configs()?
            .into_iter()
            .map(|p| p.id)
            .filter(|id| !keep.contains(id.as_str()))
            .collect();

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut configs = txn.open_table(POOLS).map_err(map_err!(Table))?;
            let mut states = txn.open_table(POOL_STATES).map_err(map_err!(Table))?;
            for id in &stale {
                configs.remove(id.as_str()).map_err(map_err!(Write))?;
                states.remove(id.as_str()).map_err(map_err!(Write))?;
            }
            for pool in pools {
                let value = serde_json::to_vec(pool).map_err(map_err!(Serialize))?;
                configs
                    .insert(pool.id.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
                let has_state = states.get(pool.id.as_str()).map_err(map_err!(Read))?.is_some();
                if !has_state {
                    let state = serde_json::to_vec(&PoolScaleState::new(pool.id.clone()))
                        .map_err(map_err!(Serialize))?;
                    states
                        .insert(pool.id.as_str(), state.as_slice())
                        .map_err(map_err!(Write))?;
                }
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(pools = pools.len(), removed = stale.len(), "pool configs synced");
        Ok(())
    }

    // ── Pool scale state ───────────────────────────────────────────

    pub fn put_pool_state(&self, state: &PoolScaleState) -> StateResult<()> {
        self.put_json(POOL_STATES, &state.pool_id, state)
    }

    pub fn get_pool_state(&self, pool_id: &str) -> StateResult<Option<PoolScaleState>> {
        self.get_json(POOL_STATES, pool_id)
    }

    /// Apply `update` to a pool's scale state. Returns false if the pool
    /// has no state record.
    pub fn update_pool_scale_state(
        &self,
        pool_id: &str,
        update: &PoolScaleUpdate,
    ) -> StateResult<bool> {
        let found = self.update_json(POOL_STATES, pool_id, |state: &mut PoolScaleState| {
            update.apply(state)
        })?;
        Ok(found.is_some())
    }

    // ── Leases ─────────────────────────────────────────────────────

    pub fn put_lease(&self, lease: &Lease) -> StateResult<()> {
        self.put_json(LEASES, &lease.id, lease)
    }

    /// All leases overlapping `[min_time, max_time)`, open leases included.
    pub fn find_leases(
        &self,
        min_time: DateTime<Utc>,
        max_time: DateTime<Utc>,
    ) -> StateResult<Vec<Lease>> {
        let mut leases: Vec<Lease> = self.list_json(LEASES)?;
        leases.retain(|l| l.overlaps(min_time, max_time));
        Ok(leases)
    }

    // ── Jobs ───────────────────────────────────────────────────────

    pub fn put_job_batch(&self, batch: &JobBatch) -> StateResult<()> {
        self.put_json(JOB_BATCHES, &batch.table_key(), batch)
    }

    /// Batches whose job was created at or after `created_after`.
    pub fn find_job_batches(&self, created_after: DateTime<Utc>) -> StateResult<Vec<JobBatch>> {
        let mut batches: Vec<JobBatch> = self.list_json(JOB_BATCHES)?;
        batches.retain(|b| b.job_created_at >= created_after);
        Ok(batches)
    }

    pub fn put_stream(&self, stream: &StreamConfig) -> StateResult<()> {
        self.put_json(STREAMS, &stream.id, stream)
    }

    pub fn list_streams(&self) -> StateResult<Vec<StreamConfig>> {
        self.list_json(STREAMS)
    }

    // ── Lifecycle records ──────────────────────────────────────────

    pub fn put_lifecycle_record(&self, record: &LifecycleRecord) -> StateResult<()> {
        self.put_json(LIFECYCLE, &record.agent_id, record)
    }

    pub fn get_lifecycle_record(&self, agent_id: &str) -> StateResult<Option<LifecycleRecord>> {
        self.get_json(LIFECYCLE, agent_id)
    }

    pub fn list_lifecycle_records(&self) -> StateResult<Vec<LifecycleRecord>> {
        self.list_json(LIFECYCLE)
    }

    /// Delete a lifecycle record. Returns true if it existed.
    pub fn delete_lifecycle_record(&self, agent_id: &str) -> StateResult<bool> {
        self.delete_key(LIFECYCLE, agent_id)
    }
}
