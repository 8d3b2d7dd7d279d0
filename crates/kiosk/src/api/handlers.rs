//! HTTP handlers over the instance service.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};

use crate::instance::{
    CreateInstanceRequest, HealthResponse, InstanceDetails, LogsResponse,
};

use super::error::ApiResult;
use super::state::AppState;

/// `GET /health`
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(state.instances.health().await)
}

/// `POST /api/instances`
///
/// Returns the settled record: `201` for a running instance, and also `201`
/// when creation failed but left an observable `error` record, so clients see
/// the diagnostic through the normal instance shape.
pub async fn create_instance(
    State(state): State<AppState>,
    Json(request): Json<CreateInstanceRequest>,
) -> ApiResult<(StatusCode, Json<InstanceDetails>)> {
    let instance = state.instances.create(request).await?;
    Ok((StatusCode::CREATED, Json(instance.into())))
}

/// `GET /api/instances`
pub async fn list_instances(State(state): State<AppState>) -> Json<Vec<InstanceDetails>> {
    let instances = state.instances.list().await;
    Json(instances.into_iter().map(InstanceDetails::from).collect())
}

/// `GET /api/instances/{id}`
pub async fn get_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<InstanceDetails>> {
    let instance = state.instances.get(&id).await?;
    Ok(Json(instance.into()))
}

/// `GET /api/instances/{id}/logs`
pub async fn get_instance_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<LogsResponse>> {
    let logs = state.instances.logs(&id).await?;
    Ok(Json(LogsResponse {
        instance_id: id,
        logs: String::from_utf8_lossy(&logs).into_owned(),
    }))
}

/// `DELETE /api/instances/{id}`
pub async fn delete_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.instances.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}
