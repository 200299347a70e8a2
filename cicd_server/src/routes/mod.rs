//! CI/CD HTTP routes.

pub mod api;
pub mod stream;
pub mod webhook;

use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::de::DeserializeOwned;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::error::CicdError;
use crate::orchestrator::Orchestrator;

/// Request timeout for everything except log streams and artifact transfers.
const API_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared state for route handlers.
#[derive(Clone)]
pub struct CicdRouterState {
    pub engine: Arc<Orchestrator>,
}

/// Build the engine's Axum router. Paths are absolute (`/cicd/...`).
pub fn cicd_router(engine: Arc<Orchestrator>) -> Router {
    let state = CicdRouterState { engine };

    let api = Router::new()
        .route("/cicd/health", get(health))
        // Webhooks
        .route(
            "/cicd/webhooks/{pipeline_id}/{token}",
            post(webhook::pipeline_webhook),
        )
        .route(
            "/cicd/freestyle/webhook/{token}",
            post(webhook::freestyle_webhook),
        )
        // Pipelines
        .route(
            "/cicd/pipelines",
            get(api::list_pipelines).post(api::create_pipeline),
        )
        .route(
            "/cicd/pipelines/{id}",
            get(api::get_pipeline)
                .put(api::update_pipeline)
                .delete(api::delete_pipeline),
        )
        .route("/cicd/pipelines/{id}/trigger", post(api::trigger_pipeline))
        .route("/cicd/pipelines/{id}/runs", get(api::list_runs))
        .route(
            "/cicd/runs/{run_id}",
            get(api::get_run).delete(api::delete_run),
        )
        .route("/cicd/runs/{run_id}/cancel", post(api::cancel_run))
        .route("/cicd/runs/{run_id}/logs", get(api::run_logs))
        .route("/cicd/runs/{run_id}/jobs/{job}/logs", get(api::job_logs))
        // Freestyle
        .route(
            "/cicd/freestyle/jobs",
            get(api::list_freestyle_jobs).post(api::create_freestyle_job),
        )
        .route(
            "/cicd/freestyle/jobs/{id}",
            get(api::get_freestyle_job)
                .put(api::update_freestyle_job)
                .delete(api::delete_freestyle_job),
        )
        .route(
            "/cicd/freestyle/jobs/{id}/trigger",
            post(api::trigger_freestyle_job),
        )
        .route("/cicd/freestyle/jobs/{id}/builds", get(api::list_builds))
        .route(
            "/cicd/freestyle/builds/{build_id}",
            get(api::get_build).delete(api::delete_build),
        )
        .route(
            "/cicd/freestyle/builds/{build_id}/cancel",
            post(api::cancel_build),
        )
        .route("/cicd/freestyle/builds/{build_id}/logs", get(api::build_logs))
        // Hosts and credentials
        .route("/cicd/hosts", get(api::list_hosts).post(api::create_host))
        .route(
            "/cicd/hosts/{id}",
            get(api::get_host).put(api::update_host).delete(api::delete_host),
        )
        .route("/cicd/hosts/{id}/test", post(api::test_host))
        .route(
            "/cicd/credentials",
            get(api::list_credentials).post(api::create_credential),
        )
        .route(
            "/cicd/credentials/{id}",
            get(api::get_credential)
                .put(api::update_credential)
                .delete(api::delete_credential),
        )
        // Notifications
        .route(
            "/cicd/notifications",
            get(api::list_notifications).post(api::create_notification),
        )
        .route(
            "/cicd/notifications/{id}",
            get(api::get_notification)
                .put(api::update_notification)
                .delete(api::delete_notification),
        )
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            API_TIMEOUT,
        ));

    let long_lived = Router::new()
        .route("/cicd/runs/{run_id}/logs/stream", get(stream::run_log_stream))
        .route(
            "/cicd/freestyle/builds/{build_id}/logs/stream",
            get(stream::build_log_stream),
        )
        .route(
            "/cicd/runs/{run_id}/artifacts",
            get(api::list_artifacts).post(stream::upload_artifact),
        )
        .route(
            "/cicd/artifacts/{id}",
            get(stream::download_artifact).delete(api::delete_artifact),
        );

    api.merge(long_lived)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(
    axum::extract::State(state): axum::extract::State<CicdRouterState>,
) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "active": state.engine.gateway.active_count(),
    }))
}

impl CicdError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            CicdError::Definition(_) | CicdError::Validation(_) | CicdError::Yaml(_) => {
                StatusCode::BAD_REQUEST
            }
            CicdError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            CicdError::NotFound(_) => StatusCode::NOT_FOUND,
            CicdError::InvalidState(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for CicdError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("Request failed: {self}");
        } else {
            tracing::debug!(status = status.as_u16(), "Request rejected: {self}");
        }
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

/// Parse an optional JSON body; an empty body yields the default.
pub(crate) fn json_or_default<T: DeserializeOwned + Default>(body: &[u8]) -> Result<T, CicdError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body)
        .map_err(|e| CicdError::Validation(format!("invalid request body: {e}")))
}
