//! Secrets routes
//!
//! Values are encrypted at rest; `list` returns names only.

use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use super::{ApiResult, AppState, ListResponse};

#[derive(Debug, Deserialize)]
pub struct SetSecretRequest {
    pub value: String,
}

#[derive(Debug, Serialize)]
pub struct SecretResponse {
    pub name: String,
    pub value: String,
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/secrets", get(list_secrets))
        .route(
            "/v1/secrets/:name",
            get(get_secret).put(set_secret).delete(delete_secret),
        )
        .with_state(state)
}

/// GET /v1/secrets - names only
async fn list_secrets(State(state): State<AppState>) -> ApiResult<Json<ListResponse<String>>> {
    Ok(Json(state.secrets.list().await?.into()))
}

/// GET /v1/secrets/{name}
async fn get_secret(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<SecretResponse>> {
    let values = state.secrets.get(std::slice::from_ref(&name)).await?;
    let value = values.get(&name).cloned().unwrap_or_default();
    Ok(Json(SecretResponse { name, value }))
}

/// PUT /v1/secrets/{name}
async fn set_secret(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(request): Json<SetSecretRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    state.secrets.put(&name, &request.value).await?;
    Ok(Json(serde_json::json!({"name": name})))
}

/// DELETE /v1/secrets/{name}
async fn delete_secret(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    state.secrets.delete(&name).await?;
    Ok(Json(serde_json::json!({"deleted": name})))
}
