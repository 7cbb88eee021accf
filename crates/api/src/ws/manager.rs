use std::collections::HashMap;

use axum::body::Bytes;
use axum::extract::ws::Message;
use forge_core::types::{JobId, Timestamp};
use tokio::sync::{mpsc, RwLock};

/// Channel sender half for pushing control frames to a WebSocket connection.
pub type WsSender = mpsc::UnboundedSender<Message>;

/// Metadata for a single progress stream.
pub struct WsConnection {
    /// Caller identifier resolved by the access gate.
    pub caller: String,
    /// Job whose progress this connection streams.
    pub job_id: JobId,
    /// Channel sender for outbound control frames (ping, close).
    pub sender: WsSender,
    /// When this connection was established.
    pub connected_at: Timestamp,
}

/// Tracks every open progress stream so the server can ping them and close
/// them on shutdown. Progress events themselves travel through the
/// publisher, not through this map.
///
/// Thread-safe via interior `RwLock`; designed to be wrapped in `Arc`.
pub struct WsManager {
    connections: RwLock<HashMap<String, WsConnection>>,
}

impl WsManager {
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Register a new connection.
    ///
    /// Returns the receiver half of the control channel so the caller can
    /// forward its frames to the WebSocket sink.
    pub async fn add(
        &self,
        conn_id: String,
        caller: String,
        job_id: JobId,
    ) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = WsConnection {
            caller,
            job_id,
            sender: tx,
            connected_at: chrono::Utc::now(),
        };
        self.connections.write().await.insert(conn_id, conn);
        rx
    }

    /// Remove a connection by its ID.
    pub async fn remove(&self, conn_id: &str) {
        self.connections.write().await.remove(conn_id);
    }

    /// Return the current number of active connections.
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Number of connections streaming `job_id`.
    pub async fn job_connection_count(&self, job_id: JobId) -> usize {
        self.connections
            .read()
            .await
            .values()
            .filter(|conn| conn.job_id == job_id)
            .count()
    }

    /// Send a Close frame to every connection, then clear the map.
    ///
    /// Used during graceful shutdown.
    pub async fn shutdown_all(&self) {
        let mut conns = self.connections.write().await;
        let count = conns.len();
        for (conn_id, conn) in conns.iter() {
            tracing::debug!(
                conn_id = %conn_id,
                caller = %conn.caller,
                job_id = %conn.job_id,
                open_secs = (chrono::Utc::now() - conn.connected_at).num_seconds(),
                "Closing progress stream",
            );
            let _ = conn.sender.send(Message::Close(None));
        }
        conns.clear();
        tracing::info!(count, "Closed all WebSocket connections");
    }

    /// Send a Ping frame to every connected client.
    ///
    /// Connections whose channels are closed are skipped; they are removed
    /// when their handler exits.
    pub async fn ping_all(&self) {
        let conns = self.connections.read().await;
        for conn in conns.values() {
            let _ = conn.sender.send(Message::Ping(Bytes::new()));
        }
    }
}

impl Default for WsManager {
    fn default() -> Self {
        Self::new()
    }
}
