use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use server_manager::{NewPortal, Portal, PortalUpdate, PortalView};
use std::sync::Arc;
use uuid::Uuid;

use crate::{routes::servers::ApiError, state::AppState};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortalQuery {
    pub server_id: Option<Uuid>,
}

pub async fn list_portals(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PortalQuery>,
) -> Json<Vec<PortalView>> {
    Json(state.supervisor.list_portals(query.server_id))
}

pub async fn create_portal(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<NewPortal>,
) -> Result<(StatusCode, Json<Portal>), ApiError> {
    let portal = state.supervisor.create_portal(payload)?;
    Ok((StatusCode::CREATED, Json(portal)))
}

pub async fn update_portal(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(update): Json<PortalUpdate>,
) -> Result<Json<Portal>, ApiError> {
    Ok(Json(state.supervisor.update_portal(id, update)?))
}

pub async fn delete_portal(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.supervisor.delete_portal(id)?;
    Ok(StatusCode::NO_CONTENT)
}
