//! Autoscaler error types.

use thiserror::Error;

/// Errors that can abort the evaluation of a pool.
#[derive(Debug, Error)]
pub enum AutoscaleError {
    #[error("pool not found: {0}")]
    PoolNotFound(String),

    #[error("configuration error: {0}")]
    Config(#[from] fleet_core::CoreError),

    #[error("invalid strategy settings: {0}")]
    InvalidSettings(String),

    #[error("unknown fleet manager: {0}")]
    UnknownFleetManager(String),

    #[error("evaluation cancelled")]
    Cancelled,

    #[error("state store error: {0}")]
    State(#[from] fleetgrid_state::StateError),
}

pub type AutoscaleResult<T> = Result<T, AutoscaleError>;
