//! HTTP API handlers and routing.
//!
//! A small internal surface: health, a manual tick trigger, the current
//! state record, and the interruption webhook the provisioner calls when a
//! spot instance is about to be reclaimed.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::orchestrator::TickOutcome;
use crate::state::AppState;
use crate::store::{ClusterState, StoreError};

/// Create the API router with all routes and middleware.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/tick", post(trigger_tick))
        .route("/v1/state", get(get_state))
        .route("/v1/interruptions", post(report_interruption))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check response.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
    pub timestamp: String,
}

/// Basic health check - is the service running?
///
/// Does not check dependencies; a tick that cannot reach its collaborators
/// reports that through its own outcome instead.
async fn healthz() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: "autoscaler".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
    })
}

/// Run one tick inline and report what it did. Failures fold into the
/// outcome, so this always answers 200.
async fn trigger_tick(State(state): State<AppState>) -> Json<TickOutcome> {
    info!("Manual tick triggered");
    Json(state.orchestrator().run_tick().await)
}

/// The current cluster state record, as persisted.
async fn get_state(State(state): State<AppState>) -> Result<Json<ClusterState>, ApiError> {
    let record = state.store().get().await?;
    Ok(Json(record))
}

/// Interruption notice payload.
#[derive(Debug, Deserialize)]
#[cfg_attr(test, derive(serde::Serialize))]
pub struct InterruptionNotice {
    pub instance_id: String,
}

/// Interruption webhook. Acknowledge immediately and handle in the
/// background; the caller's reclaim window is too short to spend waiting on
/// a drain.
async fn report_interruption(
    State(state): State<AppState>,
    Json(notice): Json<InterruptionNotice>,
) -> StatusCode {
    info!(instance = %notice.instance_id, "Interruption notice accepted");
    let orchestrator = state.orchestrator().clone();
    tokio::spawn(async move {
        orchestrator.handle_interruption(&notice.instance_id).await;
    });
    StatusCode::ACCEPTED
}

/// Error envelope for API responses.
#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorBody { error: self.message })).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::{
        HttpBlobStore, HttpComputeProvider, HttpOrchestrationApi, PrometheusMetrics,
    };
    use crate::engine::ScalingPolicy;
    use crate::orchestrator::{Collaborators, Orchestrator, OrchestratorSettings};
    use crate::retry::RetryPolicy;
    use crate::store::MemoryStateStore;
    use std::sync::Arc;
    use std::time::Duration;

    fn app_state() -> AppState {
        // Collaborators point at a closed port; ticks against them fail
        // fast, which is exactly what the errored-outcome test wants.
        let retry = RetryPolicy::no_retry(Duration::from_millis(100));
        let store = Arc::new(MemoryStateStore::new("test", Utc::now()));
        let orchestrator = Arc::new(Orchestrator::new(
            OrchestratorSettings {
                policy: ScalingPolicy {
                    min_nodes: 1,
                    max_nodes: 3,
                    scale_up_cpu: 70.0,
                    scale_down_cpu: 30.0,
                    pending_threshold: 0.0,
                    scale_up_cooldown: Duration::from_secs(300),
                    scale_down_cooldown: Duration::from_secs(600),
                },
                verify_timeout: Duration::from_secs(600),
                lock_ttl: Duration::from_secs(300),
                drain_grace: Duration::ZERO,
                join_token_key: "node-token".to_string(),
            },
            Collaborators {
                store: store.clone(),
                metrics: Arc::new(PrometheusMetrics::new("http://127.0.0.1:1", "up", "up", retry)),
                compute: Arc::new(HttpComputeProvider::new(
                    "http://127.0.0.1:1",
                    "test",
                    vec![],
                    "",
                    retry,
                )),
                orch: Arc::new(HttpOrchestrationApi::new("http://127.0.0.1:1", "", false, retry)),
                blob: Arc::new(HttpBlobStore::new("http://127.0.0.1:1", retry)),
            },
        ));
        AppState::new(orchestrator, store)
    }

    #[tokio::test]
    async fn healthz_returns_ok() {
        let response = healthz().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn get_state_returns_the_record() {
        let state = app_state();
        let Json(record) = get_state(State(state)).await.unwrap();

        assert_eq!(record.cluster, "test");
        assert!(!record.scaling_in_progress);
    }

    #[tokio::test]
    async fn trigger_tick_folds_collaborator_failure_into_the_outcome() {
        let state = app_state();
        let Json(outcome) = trigger_tick(State(state)).await;

        // Inventory is unreachable, so the tick errors instead of panicking
        // or surfacing a 500.
        assert!(matches!(outcome, TickOutcome::Errored { .. }));
    }

    #[tokio::test]
    async fn interruption_notice_is_accepted() {
        let state = app_state();
        let status = report_interruption(
            State(state),
            Json(InterruptionNotice {
                instance_id: "i-spot".to_string(),
            }),
        )
        .await;

        assert_eq!(status, StatusCode::ACCEPTED);
    }
}
