use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use server_manager::{
    BuildStatus, FleetSnapshot, ManagerError, NewServer, PlayerPosition, ServerMetrics, ServerProperties,
    ServerState, ServerType,
};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CommandRequest {
    pub command: String,
}

#[derive(Debug, Deserialize)]
pub struct MemoryRequest {
    pub memory: u32,
}

pub async fn list_servers(State(state): State<Arc<AppState>>) -> Json<FleetSnapshot> {
    Json(state.supervisor.fleet())
}

pub async fn create_server(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<NewServer>,
) -> Result<(StatusCode, Json<ServerState>), ApiError> {
    let server = state.supervisor.create_server(payload).await?;
    Ok((StatusCode::CREATED, Json(server)))
}

pub async fn get_server(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<ServerState>, ApiError> {
    Ok(Json(state.supervisor.server(id)?))
}

pub async fn delete_server(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.supervisor.delete_server(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn start_server(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.supervisor.start_server(id).await?;
    Ok(StatusCode::ACCEPTED)
}

pub async fn stop_server(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.supervisor.stop_server(id).await?;
    Ok(StatusCode::ACCEPTED)
}

pub async fn send_command(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<CommandRequest>,
) -> Result<StatusCode, ApiError> {
    state.supervisor.send_command(id, &payload.command).await?;
    Ok(StatusCode::ACCEPTED)
}

pub async fn get_logs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<String>>, ApiError> {
    Ok(Json(state.supervisor.get_logs(id).await?))
}

pub async fn get_properties(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<ServerProperties>, ApiError> {
    Ok(Json(state.supervisor.get_server_properties(id).await?))
}

pub async fn update_properties(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(properties): Json<ServerProperties>,
) -> Result<StatusCode, ApiError> {
    state.supervisor.set_server_properties(id, properties).await?;
    Ok(StatusCode::OK)
}

pub async fn update_memory(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<MemoryRequest>,
) -> Result<StatusCode, ApiError> {
    state.supervisor.set_server_memory(id, payload.memory).await?;
    Ok(StatusCode::OK)
}

/// Called by the companion plugin.
pub async fn report_metrics(
    State(state): State<Arc<AppState>>,
    Json(metrics): Json<ServerMetrics>,
) -> Result<StatusCode, ApiError> {
    state.supervisor.report_metrics(metrics).await?;
    Ok(StatusCode::OK)
}

pub async fn update_positions(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(positions): Json<Vec<PlayerPosition>>,
) -> Result<StatusCode, ApiError> {
    state.supervisor.update_player_positions(id, positions).await?;
    Ok(StatusCode::OK)
}

pub async fn list_jars(State(state): State<Arc<AppState>>) -> Json<HashMap<ServerType, Vec<String>>> {
    Json(state.supervisor.available_jars())
}

pub async fn build_status(
    State(state): State<Arc<AppState>>,
    Path((server_type, version)): Path<(String, String)>,
) -> Result<Json<Option<BuildStatus>>, ApiError> {
    let server_type: ServerType = server_type.parse().map_err(ApiError::BadRequest)?;
    Ok(Json(state.supervisor.build_status(server_type, &version)))
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Manager(#[from] ManagerError),
    #[error("{0}")]
    BadRequest(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Manager(err) => match err {
                ManagerError::NotFound(_) => StatusCode::NOT_FOUND,
                ManagerError::InvalidState(_)
                | ManagerError::AlreadyBuilding { .. }
                | ManagerError::PortInUse(_) => StatusCode::CONFLICT,
                ManagerError::InvalidConfig(_) => StatusCode::BAD_REQUEST,
                ManagerError::NoWorldsToBackup => StatusCode::UNPROCESSABLE_ENTITY,
                ManagerError::BinaryUnavailable(_) => StatusCode::BAD_GATEWAY,
                ManagerError::ProcessSpawn(_) | ManagerError::Io(_) | ManagerError::Other(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
        };

        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("Internal error: {:#}", self);
            "Internal server error".to_string()
        } else {
            self.to_string()
        };

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}
