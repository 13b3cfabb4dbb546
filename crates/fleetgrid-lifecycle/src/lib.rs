//! fleetgrid-lifecycle — graceful handling of cloud-initiated terminations.
//!
//! When the cloud wants to terminate an instance that runs a farm agent,
//! the reconciler asks the agent to shut down gracefully and holds the
//! cloud's lifecycle hook open until the agent has stopped (or the wait
//! has gone on too long).
//!
//! # Architecture
//!
//! ```text
//! POST /api/v1/lifecycle/events ──► parse_hook_message()
//!                                        │
//!                              mpsc<TerminationIntent>
//!                                        │
//!                                LifecycleService::run
//!                                  ├── handle_intent()  → LifecycleRecord
//!                                  └── reconcile()      → LifecycleHook ack
//! ```

pub mod error;
pub mod event;
pub mod hook;
pub mod reconciler;
pub mod store;

pub use error::{LifecycleError, LifecycleResult};
pub use event::parse_hook_message;
pub use hook::{LifecycleAction, LifecycleHook, LoggingLifecycleHook};
pub use reconciler::{
    IntentDisposition, LifecycleService, LifecycleServiceSettings, PollBackoff, ReconcileReport,
};
pub use store::LifecycleStore;
