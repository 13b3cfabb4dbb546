//! fleet-core — shared configuration and primitives for fleetgrid.
//!
//! Holds everything the autoscaler, lifecycle reconciler and daemon agree
//! on but that carries no persistence: the `fleet.toml` schema, the pool
//! sizing / fleet-manager configuration variants, the clock abstraction,
//! condition expressions evaluated against time properties, and the
//! downtime schedule.

pub mod clock;
pub mod condition;
pub mod config;
pub mod downtime;
pub mod duration;
pub mod error;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use condition::{Condition, ConditionProperties};
pub use config::FleetConfig;
pub use downtime::{DowntimeSchedule, DowntimeSource, DowntimeWindow};
pub use duration::parse_duration;
pub use error::{CoreError, CoreResult};
pub use types::*;
