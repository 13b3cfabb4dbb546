//! fleetgrid-state — embedded state store for fleetgrid.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for agents, pools, leases, job batches and lifecycle records.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Writes the control loops make go through narrow update calls
//! (`update_agent_shutdown_flag`, `update_pool_scale_state`) that read and
//! write inside one transaction, so concurrent loops never clobber each
//! other with stale copies.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
