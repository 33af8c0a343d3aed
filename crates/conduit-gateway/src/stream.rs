use crate::server::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Query string of `GET /ws/progress`.
#[derive(Debug, Default, Deserialize)]
pub struct ProgressQuery {
    /// Only forward events of this workflow.
    pub workflow_id: Option<Uuid>,
}

/// Upgrade and forward progress events as JSON text frames.
pub async fn progress_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(filter): Query<ProgressQuery>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| stream_progress(socket, state, filter.workflow_id))
}

/// Forwards progress events as JSON text frames until either side closes.
async fn stream_progress(socket: WebSocket, state: Arc<AppState>, filter: Option<Uuid>) {
    let subscriber_id = Uuid::new_v4();
    let events = BroadcastStream::new(state.orchestrator.progress().subscribe());
    let (mut ws_sender, mut ws_receiver) = socket.split();
    info!(subscriber_id = %subscriber_id, workflow_id = ?filter, "Progress subscriber connected");

    let mut send_task = tokio::spawn(async move {
        let mut events = events;
        while let Some(item) = events.next().await {
            let event = match item {
                Ok(event) => event,
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(subscriber_id = %subscriber_id, skipped, "Progress subscriber lagging");
                    continue;
                }
            };
            if filter.is_some_and(|id| id != event.workflow_id) {
                continue;
            }
            let Ok(text) = serde_json::to_string(&event) else {
                continue;
            };
            if ws_sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    // Inbound frames are ignored; reading only detects the close.
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            if let Message::Close(_) = msg {
                break;
            }
            debug!(subscriber_id = %subscriber_id, "Ignoring inbound frame");
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }
    info!(subscriber_id = %subscriber_id, "Progress subscriber disconnected");
}
