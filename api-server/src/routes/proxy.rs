use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::{routes::servers::ApiError, state::AppState};

#[derive(Debug, Serialize, Deserialize)]
pub struct ProxyPort {
    pub port: u16,
}

pub async fn get_port(State(state): State<Arc<AppState>>) -> Json<ProxyPort> {
    Json(ProxyPort {
        port: state.supervisor.bungeecord_port(),
    })
}

pub async fn update_port(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ProxyPort>,
) -> Result<Json<ProxyPort>, ApiError> {
    state.supervisor.set_bungeecord_port(payload.port).await?;
    Ok(Json(payload))
}
