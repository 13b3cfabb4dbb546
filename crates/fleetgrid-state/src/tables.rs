//! redb table definitions for the fleetgrid state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Agents keyed by `{agent_id}`.
pub const AGENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("agents");

/// Pool configs keyed by `{pool_id}`.
pub const POOLS: TableDefinition<&str, &[u8]> = TableDefinition::new("pools");

/// Autoscaler bookkeeping keyed by `{pool_id}`.
pub const POOL_STATES: TableDefinition<&str, &[u8]> = TableDefinition::new("pool_states");

/// Leases keyed by `{lease_id}`.
pub const LEASES: TableDefinition<&str, &[u8]> = TableDefinition::new("leases");

/// Job batches keyed by `{job_id}:{batch_id}`.
pub const JOB_BATCHES: TableDefinition<&str, &[u8]> = TableDefinition::new("job_batches");

/// Stream configs keyed by `{stream_id}`.
pub const STREAMS: TableDefinition<&str, &[u8]> = TableDefinition::new("streams");

/// Pending termination records keyed by `{agent_id}`.
pub const LIFECYCLE: TableDefinition<&str, &[u8]> = TableDefinition::new("lifecycle");
