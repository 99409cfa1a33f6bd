//! WebSocket endpoint and hub statistics.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use tracing::debug;

use crate::hub::{Hub, HubStats};
use crate::state::AppState;

/// Mounted at the root: `/ws/ws/{client_id}`.
pub fn socket_routes() -> Router<Arc<AppState>> {
    Router::new().route("/ws/ws/{client_id}", get(connect))
}

/// Mounted under `/api`.
pub fn api_routes() -> Router<Arc<AppState>> {
    Router::new().route("/ws/stats", get(stats))
}

async fn connect(
    ws: WebSocketUpgrade,
    Path(client_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let hub = state.hub.clone();
    ws.on_upgrade(move |socket| session(hub, client_id, socket))
}

/// Pump one connection until either side closes.
async fn session(hub: Arc<Hub>, client_id: String, socket: WebSocket) {
    let (mut sender, mut receiver) = socket.split();
    let (conn_id, mut outbound) = hub.connect(&client_id);

    // Ends when the hub drops this client or the socket rejects a write.
    let mut writer = tokio::spawn(async move {
        while let Some(text) = outbound.recv().await {
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    let reader = async {
        while let Some(Ok(message)) = receiver.next().await {
            match message {
                Message::Text(text) => hub.handle_message(&client_id, text.as_str()),
                Message::Close(_) => break,
                _ => {}
            }
        }
    };

    tokio::select! {
        _ = &mut writer => debug!("Writer for {} finished", client_id),
        _ = reader => debug!("Reader for {} finished", client_id),
    }
    writer.abort();
    hub.disconnect(&client_id, conn_id);
}

/// GET /api/ws/stats
async fn stats(State(state): State<Arc<AppState>>) -> Json<HubStats> {
    Json(state.hub.stats())
}
