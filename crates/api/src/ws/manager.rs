//! Registry of open browser WebSocket connections.

use std::collections::HashMap;

use axum::body::Bytes;
use axum::extract::ws::Message;
use canvasflow_core::types::Timestamp;
use canvasflow_events::PlatformEvent;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

/// Outbound frames for one connection.
pub type WsSender = mpsc::UnboundedSender<Message>;

struct WsConnection {
    sender: WsSender,
    connected_at: Timestamp,
}

/// All open connections keyed by a per-connection id. Shared as
/// `Arc<WsManager>`.
#[derive(Default)]
pub struct WsManager {
    connections: RwLock<HashMap<Uuid, WsConnection>>,
}

impl WsManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection; frames queued for it arrive on the receiver.
    pub async fn add(&self) -> (Uuid, mpsc::UnboundedReceiver<Message>) {
        let (sender, rx) = mpsc::unbounded_channel();
        let conn_id = Uuid::new_v4();
        self.connections.write().await.insert(
            conn_id,
            WsConnection {
                sender,
                connected_at: chrono::Utc::now(),
            },
        );
        (conn_id, rx)
    }

    pub async fn remove(&self, conn_id: Uuid) {
        if let Some(conn) = self.connections.write().await.remove(&conn_id) {
            let secs = (chrono::Utc::now() - conn.connected_at).num_seconds();
            tracing::debug!(conn_id = %conn_id, connected_secs = secs, "WebSocket connection removed");
        }
    }

    /// Queue `message` on every connection. Returns how many accepted it;
    /// closed ones are skipped and removed when their socket loop ends.
    pub async fn broadcast(&self, message: Message) -> usize {
        self.connections
            .read()
            .await
            .values()
            .filter(|conn| conn.sender.send(message.clone()).is_ok())
            .count()
    }

    /// Send `event` as a JSON text frame to every connection.
    pub async fn broadcast_event(&self, event: &PlatformEvent) -> usize {
        match serde_json::to_string(event) {
            Ok(text) => self.broadcast(Message::Text(text.into())).await,
            Err(e) => {
                tracing::warn!(event_type = %event.event_type, error = %e, "Failed to encode event");
                0
            }
        }
    }

    pub async fn ping_all(&self) -> usize {
        self.broadcast(Message::Ping(Bytes::new())).await
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Queue a Close frame everywhere and forget every connection.
    pub async fn shutdown_all(&self) {
        let mut conns = self.connections.write().await;
        for conn in conns.values() {
            let _ = conn.sender.send(Message::Close(None));
        }
        tracing::info!(count = conns.len(), "Closed all WebSocket connections");
        conns.clear();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
