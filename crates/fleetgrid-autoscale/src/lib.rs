//! fleetgrid-autoscale — pool sizing and the fleet-size control loop.
//!
//! Every tick the [`FleetService`] asks each pool's active sizing strategy
//! how many agents the pool should have, then drives the pool's fleet
//! manager toward that number.
//!
//! # Scaling Algorithm
//!
//! ```text
//! strategy = first sizing entry whose condition matches now (else no-op)
//! desired  = strategy(pool, agents, tick context) + extra_agent_count
//! delta    = desired - current
//!
//! if delta > 0:
//!     downtime active                  -> NoOp("Downtime is active")
//!     within scale-out cooldown        -> NoOp("Cooldown active"), not persisted
//!     cancel up to delta pending shutdowns, expand by the remainder
//!
//! if delta < 0:
//!     within scale-in cooldown         -> NoOp("Cooldown active"), not persisted
//!     shrink by -delta
//!
//! persist last counts and result
//! ```
//!
//! Strategies:
//!
//! - `lease_utilization`: a high percentile of recent per-bucket lease
//!   utilization, plus reserve agents, floored at `min_agents`.
//! - `job_queue`: grows with stalled ready batches, decays geometrically
//!   toward `min_agents` when the queue is empty.
//! - `utilization_metric` / `job_queue_metric`: report only.
//! - `no_op`: keeps the pool as it is.

pub mod context;
pub mod error;
pub mod fleet_manager;
pub mod service;
pub mod strategy;

pub use context::{QueueWindow, SampleWindow, TickContext};
pub use error::{AutoscaleError, AutoscaleResult};
pub use fleet_manager::{
    DefaultFleetManagerFactory, FleetManager, FleetManagerFactory, LocalFleetManager,
    NoOpFleetManager, resolve_fleet_manager,
};
pub use service::{FleetService, FleetServiceSettings, PoolFailure, PoolTickResult, TickReport};
pub use strategy::{PoolSizeResult, PoolSizeStrategy, resolve_strategy};
