use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use server_manager::{Backup, BackupConfig};
use std::sync::Arc;
use uuid::Uuid;

use crate::{routes::servers::ApiError, state::AppState};

pub async fn get_backup_config(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<BackupConfig>, ApiError> {
    Ok(Json(state.supervisor.get_backup_config(id)?))
}

pub async fn update_backup_config(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(config): Json<BackupConfig>,
) -> Result<Json<BackupConfig>, ApiError> {
    state.supervisor.set_backup_config(id, config.clone()).await?;
    Ok(Json(config))
}

pub async fn list_backups(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<Backup>>, ApiError> {
    Ok(Json(state.supervisor.list_backups(id)?))
}

pub async fn create_backup(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<Backup>), ApiError> {
    let backup = state.supervisor.create_backup(id).await?;
    Ok((StatusCode::CREATED, Json(backup)))
}

pub async fn delete_backup(
    State(state): State<Arc<AppState>>,
    Path((id, backup_id)): Path<(Uuid, Uuid)>,
) -> Result<StatusCode, ApiError> {
    state.supervisor.delete_backup(id, backup_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
