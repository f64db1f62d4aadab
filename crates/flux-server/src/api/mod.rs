//! HTTP surface: admin API plus the worker transport
//!
//! Routes live under `/v1/...` with JSON bodies; event and command streams
//! are SSE. Errors map [`FluxError`] kinds onto status codes and serialize
//! as `{error, kind}`.

mod executions;
mod schedules;
mod secrets;
mod workers;
mod workflows;

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{routing::get, Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use flux_core::{ErrorKind, FluxError, SecretsStore};
use flux_storage::ScheduleStore;

use crate::catalog::CatalogService;
use crate::executions::ExecutionService;
use crate::gateway::ServerGateway;
use crate::registry::WorkerRegistry;
use crate::signals::Signals;

/// Shared state for all routes.
#[derive(Clone)]
pub struct AppState {
    pub catalog: Arc<CatalogService>,
    pub executions: Arc<ExecutionService>,
    pub schedules: Arc<dyn ScheduleStore>,
    pub secrets: Arc<dyn SecretsStore>,
    pub registry: Arc<WorkerRegistry>,
    pub gateway: Arc<ServerGateway>,
    pub signals: Arc<Signals>,
}

/// Standard error response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub kind: String,
}

/// Response wrapper for list endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListResponse<T> {
    pub data: Vec<T>,
}

impl<T> From<Vec<T>> for ListResponse<T> {
    fn from(data: Vec<T>) -> Self {
        Self { data }
    }
}

/// Axum-facing wrapper so handlers can `?` on [`FluxError`].
pub struct ApiError(pub FluxError);

impl From<FluxError> for ApiError {
    fn from(error: FluxError) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0.kind {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound | ErrorKind::SecretMissing => StatusCode::NOT_FOUND,
            ErrorKind::Conflict | ErrorKind::Cancelled => StatusCode::CONFLICT,
            ErrorKind::NoWorkerAvailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::WorkerDisconnected => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorResponse {
            error: self.0.message.clone(),
            kind: self.0.kind.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Assemble the full router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .merge(workflows::routes(state.clone()))
        .merge(executions::routes(state.clone()))
        .merge(schedules::routes(state.clone()))
        .merge(secrets::routes(state.clone()))
        .merge(workers::routes(state))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
