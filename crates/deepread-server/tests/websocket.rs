//! Live progress over a real WebSocket connection on an ephemeral port.

use std::sync::Arc;
use std::time::Duration;

use deepread_core::DeepReadConfig;
use deepread_runtime::{Invoker, Orchestrator, TaskStatus, TaskUpdate};
use deepread_server::{build_router, AppState};
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;

type Socket =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn start_server(dir: &std::path::Path) -> (String, Arc<AppState>) {
    let config = DeepReadConfig::with_defaults(dir).unwrap();
    let orchestrator = Arc::new(Orchestrator::new(
        config,
        Invoker::new(Duration::from_secs(5), Vec::new()),
    ));
    let state = Arc::new(AppState::new(orchestrator));
    let app = build_router(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("ws://{}", addr), state)
}

async fn next_json(socket: &mut Socket) -> serde_json::Value {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("timed out waiting for a message")
            .unwrap()
            .unwrap();
        if let Message::Text(text) = message {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

async fn send_json(socket: &mut Socket, value: serde_json::Value) {
    socket.send(Message::Text(value.to_string())).await.unwrap();
}

#[tokio::test]
async fn test_live_task_progress() {
    let dir = tempfile::tempdir().unwrap();
    let (base, state) = start_server(dir.path()).await;
    let registry = state.orchestrator.registry().clone();
    let task = registry.create("nlp_20240101_000000_a.pdf", "extract_only", serde_json::json!({}));

    let (mut socket, _) = tokio_tungstenite::connect_async(format!("{}/ws/ws/client-1", base))
        .await
        .unwrap();
    send_json(
        &mut socket,
        serde_json::json!({"type": "subscribe", "task_id": task.task_id}),
    )
    .await;
    let confirmed = next_json(&mut socket).await;
    assert_eq!(confirmed["type"], "subscription_confirmed");
    assert_eq!(confirmed["task_id"], task.task_id.as_str());

    registry.update(
        &task.task_id,
        TaskUpdate::status(TaskStatus::Processing).progress(50),
    );
    registry.update(
        &task.task_id,
        TaskUpdate::status(TaskStatus::Completed).result(serde_json::json!({"ok": true})),
    );

    let processing = next_json(&mut socket).await;
    assert_eq!(processing["type"], "task_update");
    assert_eq!(processing["status"], "processing");
    assert_eq!(processing["progress"], 50);
    assert!(processing["timestamp"].is_string());

    let completed = next_json(&mut socket).await;
    assert_eq!(completed["type"], "task_update");
    assert_eq!(completed["status"], "completed");
    assert_eq!(completed["progress"], 100);

    let done = next_json(&mut socket).await;
    assert_eq!(done["type"], "task_completed");
    assert_eq!(done["success"], true);
    assert_eq!(done["result"]["ok"], true);

    send_json(
        &mut socket,
        serde_json::json!({"type": "unsubscribe", "task_id": task.task_id}),
    )
    .await;
    assert_eq!(next_json(&mut socket).await["type"], "unsubscription_confirmed");

    send_json(&mut socket, serde_json::json!({"type": "ping"})).await;
    assert_eq!(next_json(&mut socket).await["type"], "pong");

    socket.close(None).await.unwrap();
    for _ in 0..50 {
        if state.hub.stats().connected_clients == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(state.hub.stats().connected_clients, 0);
}
