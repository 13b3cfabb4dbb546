//! fleetgrid-api — REST API for fleetgrid.
//!
//! Provides axum route handlers for inspecting pools and agents, triggering
//! a scale pass by hand, and feeding lifecycle-hook notifications to the
//! termination reconciler.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/pools` | List pools with their scale state |
//! | GET | `/api/v1/pools/{id}` | Get one pool |
//! | POST | `/api/v1/pools/{id}/scale` | Size and scale a pool now |
//! | GET | `/api/v1/agents` | List agents (`?pool=&status=&request_shutdown=`) |
//! | GET | `/api/v1/lifecycle/records` | Terminations being tracked |
//! | POST | `/api/v1/lifecycle/events` | Submit a lifecycle-hook notification |
//! | GET | `/metrics` | Prometheus exposition |

pub mod handlers;
pub mod prometheus;

use axum::Router;
use axum::routing::{get, post};
use fleetgrid_autoscale::FleetService;
use fleetgrid_state::{StateStore, TerminationIntent};
use tokio::sync::mpsc;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: StateStore,
    pub fleet: FleetService,
    /// Producer side of the lifecycle reconciler's intent queue.
    pub intents: mpsc::Sender<TerminationIntent>,
}

/// Build the complete API router (REST + metrics).
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/pools", get(handlers::list_pools))
        .route("/pools/{id}", get(handlers::get_pool))
        .route("/pools/{id}/scale", post(handlers::scale_pool))
        .route("/agents", get(handlers::list_agents))
        .route("/lifecycle/records", get(handlers::list_lifecycle_records))
        .route("/lifecycle/events", post(handlers::post_lifecycle_event))
        .with_state(state.clone());

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/metrics", get(handlers::prometheus_metrics).with_state(state))
}
