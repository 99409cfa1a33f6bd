//! WebSocket hub: per-client subscriptions and event fan-out.
//!
//! Each connected client owns a bounded outbound queue drained by its socket
//! writer. Delivery uses `try_send`, so a full or closed queue never blocks
//! the hub; such a client is dropped as if it had disconnected.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use deepread_runtime::{Event, EventBus};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Outbound messages queued per client before it is considered stalled.
pub const DEFAULT_CLIENT_BUFFER: usize = 256;

/// Messages a client may send.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    Subscribe { task_id: String },
    Unsubscribe { task_id: String },
    Ping,
}

#[derive(Debug, Clone, Serialize)]
pub struct HubStats {
    pub connected_clients: usize,
    pub total_subscriptions: usize,
}

struct Client {
    conn_id: u64,
    tx: mpsc::Sender<String>,
    subscriptions: HashSet<String>,
}

pub struct Hub {
    clients: RwLock<HashMap<String, Client>>,
    next_conn: AtomicU64,
    buffer: usize,
}

impl Hub {
    pub fn new(buffer: usize) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            next_conn: AtomicU64::new(1),
            buffer: buffer.max(1),
        }
    }

    /// Register a connection under `client_id`, replacing any previous one.
    ///
    /// Returns the connection id (used to disconnect without racing a
    /// reconnect) and the receiver the socket writer drains.
    pub fn connect(&self, client_id: &str) -> (u64, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(self.buffer);
        let conn_id = self.next_conn.fetch_add(1, Ordering::Relaxed);
        let previous = self.clients.write().insert(
            client_id.to_string(),
            Client {
                conn_id,
                tx,
                subscriptions: HashSet::new(),
            },
        );
        if previous.is_some() {
            warn!("Client {} reconnected; previous connection replaced", client_id);
        }
        info!("WebSocket client connected: {}", client_id);
        (conn_id, rx)
    }

    /// Remove the client if `conn_id` is still its live connection.
    pub fn disconnect(&self, client_id: &str, conn_id: u64) {
        let mut clients = self.clients.write();
        if clients.get(client_id).map(|c| c.conn_id) == Some(conn_id) {
            clients.remove(client_id);
            info!("WebSocket client disconnected: {}", client_id);
        }
    }

    /// Apply one inbound text frame from `client_id`.
    pub fn handle_message(&self, client_id: &str, text: &str) {
        let message: ControlMessage = match serde_json::from_str(text) {
            Ok(m) => m,
            Err(e) => {
                debug!("Ignoring malformed message from {}: {}", client_id, e);
                self.send_to(
                    client_id,
                    serde_json::json!({
                        "type": "error",
                        "message": format!("Invalid message: {}", e),
                        "timestamp": Utc::now(),
                    }),
                );
                return;
            }
        };

        let reply = match message {
            ControlMessage::Subscribe { task_id } => {
                if let Some(client) = self.clients.write().get_mut(client_id) {
                    client.subscriptions.insert(task_id.clone());
                }
                debug!("{} subscribed to {}", client_id, task_id);
                serde_json::json!({
                    "type": "subscription_confirmed",
                    "task_id": task_id,
                    "timestamp": Utc::now(),
                })
            }
            ControlMessage::Unsubscribe { task_id } => {
                if let Some(client) = self.clients.write().get_mut(client_id) {
                    client.subscriptions.remove(&task_id);
                }
                debug!("{} unsubscribed from {}", client_id, task_id);
                serde_json::json!({
                    "type": "unsubscription_confirmed",
                    "task_id": task_id,
                    "timestamp": Utc::now(),
                })
            }
            ControlMessage::Ping => serde_json::json!({
                "type": "pong",
                "timestamp": Utc::now(),
            }),
        };
        self.send_to(client_id, reply);
    }

    fn send_to(&self, client_id: &str, message: serde_json::Value) {
        let text = message.to_string();
        let failed = match self.clients.read().get(client_id) {
            Some(client) => client.tx.try_send(text).is_err(),
            None => false,
        };
        if failed {
            self.drop_clients(&[client_id.to_string()]);
        }
    }

    /// Route one bus event to its subscribers, or to everyone for broadcasts.
    pub fn dispatch(&self, event: &Event) {
        let text = match serde_json::to_string(event) {
            Ok(t) => t,
            Err(e) => {
                warn!("Failed to serialize {} event: {}", event.kind(), e);
                return;
            }
        };

        let mut failed = Vec::new();
        {
            let clients = self.clients.read();
            for (client_id, client) in clients.iter() {
                let wanted = event.is_broadcast()
                    || event
                        .task_id()
                        .is_some_and(|t| client.subscriptions.contains(t));
                if wanted && client.tx.try_send(text.clone()).is_err() {
                    failed.push(client_id.clone());
                }
            }
        }
        self.drop_clients(&failed);
    }

    fn drop_clients(&self, client_ids: &[String]) {
        if client_ids.is_empty() {
            return;
        }
        let mut clients = self.clients.write();
        for client_id in client_ids {
            if clients.remove(client_id).is_some() {
                warn!("Dropping WebSocket client {}: send failed", client_id);
            }
        }
    }

    /// Forward every bus event to the hub until the bus sink closes.
    pub fn spawn_bridge(self: &Arc<Self>, bus: &EventBus) -> JoinHandle<()> {
        let mut events = bus.subscribe();
        let hub = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                hub.dispatch(&event);
            }
            debug!("Event bridge stopped");
        })
    }

    pub fn stats(&self) -> HubStats {
        let clients = self.clients.read();
        HubStats {
            connected_clients: clients.len(),
            total_subscriptions: clients.values().map(|c| c.subscriptions.len()).sum(),
        }
    }
}
