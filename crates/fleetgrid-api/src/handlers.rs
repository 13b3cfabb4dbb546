//! REST API handlers.
//!
//! Each handler reads via `StateStore` (or drives the fleet service) and
//! returns JSON responses.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use fleet_core::PoolConfig;
use fleetgrid_autoscale::AutoscaleError;
use fleetgrid_lifecycle::parse_hook_message;
use fleetgrid_state::{AgentFilter, AgentStatus, PoolScaleState, StateResult, StateStore};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

fn internal_error(e: impl ToString) -> axum::response::Response {
    error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response()
}

// ── Pools ──────────────────────────────────────────────────────

/// A pool's configuration alongside its runtime bookkeeping.
#[derive(Debug, Serialize)]
pub struct PoolView {
    pub config: PoolConfig,
    pub state: Option<PoolScaleState>,
    pub active_agents: usize,
}

fn pool_view(store: &StateStore, config: PoolConfig) -> StateResult<PoolView> {
    let state = store.get_pool_state(&config.id)?;
    let active_agents = store
        .find_agents(&AgentFilter::live().pool(config.id.clone()))?
        .len();
    Ok(PoolView {
        config,
        state,
        active_agents,
    })
}

/// GET /api/v1/pools
pub async fn list_pools(State(state): State<ApiState>) -> impl IntoResponse {
    let views: StateResult<Vec<PoolView>> = state.store.list_pool_configs().and_then(|pools| {
        pools
            .into_iter()
            .map(|p| pool_view(&state.store, p))
            .collect()
    });
    match views {
        Ok(views) => ApiResponse::ok(views).into_response(),
        Err(e) => internal_error(e),
    }
}

/// GET /api/v1/pools/{id}
pub async fn get_pool(State(state): State<ApiState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.store.get_pool_config(&id) {
        Ok(Some(config)) => match pool_view(&state.store, config) {
            Ok(view) => ApiResponse::ok(view).into_response(),
            Err(e) => internal_error(e),
        },
        Ok(None) => error_response("pool not found", StatusCode::NOT_FOUND).into_response(),
        Err(e) => internal_error(e),
    }
}

/// POST /api/v1/pools/{id}/scale
///
/// Runs one sizing-and-scaling pass for the pool right away.
pub async fn scale_pool(State(state): State<ApiState>, Path(id): Path<String>) -> impl IntoResponse {
    match state
        .fleet
        .calculate_and_scale(&id, &CancellationToken::new())
        .await
    {
        Ok(result) => {
            info!(pool = %id, result = %result.result, "manual scale");
            ApiResponse::ok(result).into_response()
        }
        Err(AutoscaleError::PoolNotFound(_)) => {
            error_response("pool not found", StatusCode::NOT_FOUND).into_response()
        }
        Err(e @ (AutoscaleError::Config(_)
        | AutoscaleError::InvalidSettings(_)
        | AutoscaleError::UnknownFleetManager(_))) => {
            error_response(&e.to_string(), StatusCode::UNPROCESSABLE_ENTITY).into_response()
        }
        Err(e) => internal_error(e),
    }
}

// ── Agents ─────────────────────────────────────────────────────

/// Query parameters for `GET /api/v1/agents`.
#[derive(Debug, Default, Deserialize)]
pub struct AgentQuery {
    pub pool: Option<String>,
    pub status: Option<AgentStatus>,
    pub request_shutdown: Option<bool>,
}

/// GET /api/v1/agents
pub async fn list_agents(
    State(state): State<ApiState>,
    Query(query): Query<AgentQuery>,
) -> impl IntoResponse {
    let filter = AgentFilter {
        pool: query.pool,
        enabled: None,
        request_shutdown: query.request_shutdown,
        status: query.status,
        not_status: None,
    };
    match state.store.find_agents(&filter) {
        Ok(agents) => ApiResponse::ok(agents).into_response(),
        Err(e) => internal_error(e),
    }
}

// ── Lifecycle ──────────────────────────────────────────────────

/// GET /api/v1/lifecycle/records
pub async fn list_lifecycle_records(State(state): State<ApiState>) -> impl IntoResponse {
    match state.store.list_lifecycle_records() {
        Ok(records) => ApiResponse::ok(records).into_response(),
        Err(e) => internal_error(e),
    }
}

/// POST /api/v1/lifecycle/events
///
/// Accepts a raw lifecycle-hook notification and queues the termination
/// intent it carries for the reconciler.
pub async fn post_lifecycle_event(State(state): State<ApiState>, body: String) -> impl IntoResponse {
    let intent = match parse_hook_message(&body) {
        Ok(Some(intent)) => intent,
        Ok(None) => {
            return ApiResponse::ok(serde_json::json!({ "status": "ignored" })).into_response();
        }
        Err(e) => return error_response(&e.to_string(), StatusCode::BAD_REQUEST).into_response(),
    };

    let instance_id = intent.instance_id.clone();
    match state.intents.try_send(intent) {
        Ok(()) => (
            StatusCode::ACCEPTED,
            ApiResponse::ok(serde_json::json!({
                "status": "queued",
                "instance_id": instance_id,
            })),
        )
            .into_response(),
        Err(TrySendError::Full(_)) => {
            warn!(instance = %instance_id, "termination intent queue full");
            error_response("intent queue full", StatusCode::SERVICE_UNAVAILABLE).into_response()
        }
        Err(TrySendError::Closed(_)) => {
            error_response("lifecycle reconciler not running", StatusCode::SERVICE_UNAVAILABLE)
                .into_response()
        }
    }
}

// ── Prometheus ─────────────────────────────────────────────────

/// GET /metrics
pub async fn prometheus_metrics(State(state): State<ApiState>) -> impl IntoResponse {
    let pools = state.store.list_pool_configs().unwrap_or_default();
    let states: Vec<PoolScaleState> = pools
        .iter()
        .filter_map(|p| state.store.get_pool_state(&p.id).ok().flatten())
        .collect();
    let tracked = state
        .store
        .list_lifecycle_records()
        .map(|r| r.len())
        .unwrap_or_default();

    let body = crate::prometheus::render_prometheus(&states, tracked);
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use fleetgrid_autoscale::{FleetService, FleetServiceSettings};
    use fleetgrid_state::{Agent, TerminationIntent};
    use tokio::sync::mpsc;

    fn test_state() -> (ApiState, mpsc::Receiver<TerminationIntent>) {
        let store = StateStore::open_in_memory().unwrap();
        let (tx, rx) = mpsc::channel(1);
        let fleet = FleetService::new(store.clone(), FleetServiceSettings::default());
        (
            ApiState {
                store,
                fleet,
                intents: tx,
            },
            rx,
        )
    }

    const TERMINATING: &str = r#"{
        "LifecycleTransition": "autoscaling:EC2_INSTANCE_TERMINATING",
        "EC2InstanceId": "i-1",
        "LifecycleHookName": "drain",
        "LifecycleActionToken": "tok",
        "AutoScalingGroupName": "agents"
    }"#;

    #[tokio::test]
    async fn list_pools_empty() {
        let (state, _rx) = test_state();
        let resp = list_pools(State(state)).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn get_nonexistent_pool() {
        let (state, _rx) = test_state();
        let resp = get_pool(State(state), Path("nope".to_string()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn get_pool_counts_active_agents() {
        let (state, _rx) = test_state();
        state.store.sync_pool_configs(&[PoolConfig::new("win")]).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 5, 6, 12, 0, 0).unwrap();
        state.store.put_agent(&Agent::new("a1", now).with_pool("win")).unwrap();

        let view = pool_view(&state.store, PoolConfig::new("win")).unwrap();
        assert_eq!(view.active_agents, 1);
        assert!(view.state.is_some());

        let resp = get_pool(State(state), Path("win".to_string()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn scale_unknown_pool_is_not_found() {
        let (state, _rx) = test_state();
        let resp = scale_pool(State(state), Path("nope".to_string()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn scale_pool_runs_a_pass() {
        let (state, _rx) = test_state();
        state.store.sync_pool_configs(&[PoolConfig::new("win")]).unwrap();
        let resp = scale_pool(State(state.clone()), Path("win".to_string()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        let pool_state = state.store.get_pool_state("win").unwrap().unwrap();
        assert!(pool_state.last_scale_result.is_some());
    }

    #[tokio::test]
    async fn lifecycle_event_is_queued() {
        let (state, mut rx) = test_state();
        let resp = post_lifecycle_event(State(state), TERMINATING.to_string())
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        assert_eq!(rx.recv().await.unwrap().instance_id, "i-1");
    }

    #[tokio::test]
    async fn lifecycle_event_backpressure() {
        let (state, _rx) = test_state();
        let first = post_lifecycle_event(State(state.clone()), TERMINATING.to_string())
            .await
            .into_response();
        assert_eq!(first.status(), StatusCode::ACCEPTED);
        let second = post_lifecycle_event(State(state), TERMINATING.to_string())
            .await
            .into_response();
        assert_eq!(second.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn lifecycle_test_notification_is_ignored() {
        let (state, mut rx) = test_state();
        let body = r#"{"Event": "autoscaling:TEST_NOTIFICATION"}"#.to_string();
        let resp = post_lifecycle_event(State(state), body).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn lifecycle_event_rejects_garbage() {
        let (state, _rx) = test_state();
        let resp = post_lifecycle_event(State(state), "{".to_string())
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn prometheus_endpoint_returns_text() {
        let (state, _rx) = test_state();
        let resp = prometheus_metrics(State(state)).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        let content_type = resp.headers().get("content-type").unwrap().to_str().unwrap();
        assert!(content_type.contains("text/plain"));
    }
}
