//! Lifecycle reconciler error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("invalid lifecycle message: {0}")]
    InvalidMessage(String),

    #[error("malformed lifecycle message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(#[from] fleet_core::CoreError),

    #[error("state store error: {0}")]
    State(#[from] fleetgrid_state::StateError),
}

pub type LifecycleResult<T> = Result<T, LifecycleError>;
