//! HTTP route handlers.

use std::sync::Arc;

use axum::{
    Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post, put},
};
use serde::{Deserialize, Serialize};

use crate::controller::TickOutcome;
use crate::service::{AdmissionService, HealthSnapshot, ServiceError};
use crate::status::{Health, LimiterStatus};
use crate::version::VersionInfo;

#[derive(Debug, Serialize)]
pub struct HealthCheckResponse {
    pub status: Health,
    pub version: VersionInfo,
    pub limiters: Vec<LimiterStatus>,
}

impl From<HealthSnapshot> for HealthCheckResponse {
    fn from(snapshot: HealthSnapshot) -> Self {
        Self {
            status: snapshot.state,
            version: snapshot.version,
            limiters: snapshot.limiters,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SetLimitRequest {
    pub limit: i64,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = match &self {
            ServiceError::UnknownLimiter(_) => StatusCode::NOT_FOUND,
            ServiceError::Limit(_) | ServiceError::Config(_) => StatusCode::BAD_REQUEST,
            ServiceError::DuplicateLimiter(_) | ServiceError::NoPolicySource(_) => {
                StatusCode::CONFLICT
            }
            ServiceError::Controller(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

async fn health_check(State(service): State<Arc<AdmissionService>>) -> Json<HealthCheckResponse> {
    Json(service.health().into())
}

async fn list_limiters(State(service): State<Arc<AdmissionService>>) -> Json<Vec<LimiterStatus>> {
    Json(service.statuses())
}

async fn get_limiter(
    State(service): State<Arc<AdmissionService>>,
    Path(name): Path<String>,
) -> Result<Json<LimiterStatus>, ServiceError> {
    service.status(&name).map(Json)
}

async fn set_limit(
    State(service): State<Arc<AdmissionService>>,
    Path(name): Path<String>,
    Json(request): Json<SetLimitRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let resize = service.set_limit(&name, request.limit)?;
    let status = service.status(&name)?;
    Ok(Json(serde_json::json!({ "resize": resize, "status": status })))
}

async fn refresh_limiter(
    State(service): State<Arc<AdmissionService>>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ServiceError> {
    // The fetch and the bridge wait both block.
    let worker = Arc::clone(&service);
    let lookup = name.clone();
    let outcome = match tokio::task::spawn_blocking(move || worker.refresh(&lookup)).await {
        Ok(result) => result?,
        Err(e) => {
            tracing::error!(limiter = %name, error = %e, "Refresh task failed");
            return Ok((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": "refresh task failed" })),
            ));
        }
    };

    let body = match outcome {
        TickOutcome::Applied(resize) => serde_json::json!({ "outcome": "applied", "resize": resize }),
        TickOutcome::Deferred(limit) => serde_json::json!({ "outcome": "deferred", "limit": limit }),
        TickOutcome::FetchFailed(error) => {
            serde_json::json!({ "outcome": "fetch_failed", "error": error })
        }
        TickOutcome::ApplyFailed(error) => {
            serde_json::json!({ "outcome": "apply_failed", "error": error })
        }
    };
    Ok((StatusCode::OK, Json(body)))
}

async fn shutdown(State(service): State<Arc<AdmissionService>>) -> impl IntoResponse {
    tracing::info!("Shutdown requested via HTTP");
    service.trigger_shutdown();
    (StatusCode::OK, Json(serde_json::json!({})))
}

pub fn routes(service: Arc<AdmissionService>) -> Router {
    Router::new()
        .route("/health-check", get(health_check))
        .route("/limiters", get(list_limiters))
        .route("/limiters/{name}", get(get_limiter))
        .route("/limiters/{name}/limit", put(set_limit))
        .route("/limiters/{name}/refresh", post(refresh_limiter))
        .route("/shutdown", post(shutdown))
        .with_state(service)
}
