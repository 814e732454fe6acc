use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::{IntoResponse, Response},
};
use futures::stream::BoxStream;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::handlers::{ApiError, AppState};
use crate::registry::ProgressEvent;

/// Upgrade to a progress feed for one run. Unknown runs are rejected with
/// 404 before the upgrade.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> Response {
    match state.engine.stream_progress(&run_id).await {
        Ok(events) => ws.on_upgrade(move |socket| handle_ws(socket, run_id, events)),
        Err(e) => ApiError(e).into_response(),
    }
}

async fn handle_ws(socket: WebSocket, run_id: String, mut events: BoxStream<'static, ProgressEvent>) {
    info!("WebSocket connected for run {}", run_id);
    let (mut sender, mut receiver) = socket.split();

    let run_id_send = run_id.clone();
    let send_task = tokio::spawn(async move {
        while let Some(event) = events.next().await {
            let json = match serde_json::to_string(&event) {
                Ok(j) => j,
                Err(e) => {
                    warn!(run_id = %run_id_send, "Dropping unserializable event: {}", e);
                    continue;
                }
            };
            if sender.send(Message::Text(json)).await.is_err() {
                return;
            }
        }
        // Feed exhausted: the run is finished or not executing.
        let _ = sender.send(Message::Close(None)).await;
    });

    let recv_task = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Close(_)) => break,
                Ok(Message::Ping(_)) => debug!("Received ping"),
                Err(e) => {
                    warn!("WebSocket receive error: {}", e);
                    break;
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = send_task => {},
        _ = recv_task => {},
    }

    info!("WebSocket disconnected for run {}", run_id);
}
