//! Workflow catalog routes

use std::collections::BTreeSet;

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use flux_core::ResourceRequest;
use flux_storage::CatalogEntry;

use super::{ApiResult, AppState, ListResponse};

#[derive(Debug, Deserialize)]
pub struct RegisterWorkflowRequest {
    pub name: String,
    /// Workflow definition blob, base64 encoded.
    pub source: String,
    #[serde(default)]
    pub imports: BTreeSet<String>,
    #[serde(default)]
    pub resource_request: ResourceRequest,
}

#[derive(Debug, Serialize)]
pub struct RegisteredWorkflowResponse {
    pub name: String,
    pub version: u32,
}

#[derive(Debug, Serialize)]
pub struct WorkflowResponse {
    pub name: String,
    pub version: u32,
    pub imports: BTreeSet<String>,
    pub resource_request: ResourceRequest,
    pub created_at: DateTime<Utc>,
}

impl From<CatalogEntry> for WorkflowResponse {
    fn from(entry: CatalogEntry) -> Self {
        Self {
            name: entry.name,
            version: entry.version,
            imports: entry.imports,
            resource_request: entry.resource_request,
            created_at: entry.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct WorkflowSummary {
    pub name: String,
    pub version: u32,
}

#[derive(Debug, Deserialize)]
pub struct VersionQuery {
    pub version: Option<u32>,
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/workflows", post(register_workflow).get(list_workflows))
        .route("/v1/workflows/:name", get(get_workflow))
        .with_state(state)
}

/// POST /v1/workflows - register a workflow (next monotonic version)
async fn register_workflow(
    State(state): State<AppState>,
    Json(request): Json<RegisterWorkflowRequest>,
) -> ApiResult<Json<RegisteredWorkflowResponse>> {
    let source = BASE64
        .decode(&request.source)
        .map_err(|e| flux_core::FluxError::validation(format!("source must be base64: {e}")))?;

    let entry = state
        .catalog
        .register(
            &request.name,
            source,
            request.imports,
            request.resource_request,
        )
        .await?;
    Ok(Json(RegisteredWorkflowResponse {
        name: entry.name,
        version: entry.version,
    }))
}

/// GET /v1/workflows - list latest versions
async fn list_workflows(
    State(state): State<AppState>,
) -> ApiResult<Json<ListResponse<WorkflowSummary>>> {
    let entries = state.catalog.list().await?;
    Ok(Json(
        entries
            .into_iter()
            .map(|(name, version)| WorkflowSummary { name, version })
            .collect::<Vec<_>>()
            .into(),
    ))
}

/// GET /v1/workflows/{name}?version= - fetch a workflow record
async fn get_workflow(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<VersionQuery>,
) -> ApiResult<Json<WorkflowResponse>> {
    let entry = state.catalog.get(&name, query.version).await?;
    Ok(Json(entry.into()))
}
