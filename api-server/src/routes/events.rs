use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use server_manager::FleetEvent;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

use crate::state::AppState;

/// Console input sent by a dashboard over the event socket.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConsoleInput {
    server_id: Uuid,
    command: String,
}

pub async fn events_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_events_socket(socket, state))
}

async fn handle_events_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let mut rx = state.supervisor.subscribe();

    let initial = FleetEvent::Servers(state.supervisor.servers());
    if send_event(&mut sender, &initial).await.is_err() {
        return;
    }

    // Push fleet events to the client
    let supervisor = state.supervisor.clone();
    let mut send_task = tokio::spawn(async move {
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!("Event socket lagged by {} events, resyncing", skipped);
                    FleetEvent::Servers(supervisor.servers())
                }
                Err(RecvError::Closed) => break,
            };
            if send_event(&mut sender, &event).await.is_err() {
                break;
            }
        }
    });

    // Forward console input to the server's stdin
    let mut receive_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            let Message::Text(text) = msg else {
                continue;
            };
            match serde_json::from_str::<ConsoleInput>(&text) {
                Ok(input) => {
                    if let Err(e) = state.supervisor.send_command(input.server_id, &input.command).await {
                        tracing::warn!("Console input for {} rejected: {}", input.server_id, e);
                    }
                }
                Err(e) => tracing::debug!("Ignoring malformed socket message: {}", e),
            }
        }
    });

    tokio::select! {
        _ = (&mut send_task) => receive_task.abort(),
        _ = (&mut receive_task) => send_task.abort(),
    };
}

async fn send_event<S>(sender: &mut S, event: &FleetEvent) -> Result<(), ()>
where
    S: futures::Sink<Message> + Unpin,
{
    let payload = serde_json::to_string(event).map_err(|e| {
        tracing::error!("Failed to encode event: {}", e);
    })?;
    sender.send(Message::Text(payload)).await.map_err(|_| ())
}
