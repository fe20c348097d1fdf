use std::collections::{HashMap, HashSet};

use axum::body::Bytes;
use axum::extract::ws::Message;
use tokio::sync::{mpsc, RwLock};

use reqcollab_core::protocol::{ChannelMessage, CollabEvent, PresenceEvent, SyncEvent};
use reqcollab_core::types::{ClientId, DocumentId, Timestamp, UserId};

/// Channel sender half for pushing frames to a relay socket.
pub type RelaySender = mpsc::UnboundedSender<Message>;

/// Metadata for a single relay socket.
pub struct RelayConnection {
    pub document_id: DocumentId,
    /// Channel sender for outbound frames to this socket.
    pub sender: RelaySender,
    /// Client sessions seen sending on this socket; their frames are not
    /// echoed back to it.
    pub client_ids: HashSet<ClientId>,
    /// Users that joined through this socket and have not left.
    pub user_ids: HashSet<UserId>,
    pub connected_at: Timestamp,
}

/// Manages all relay sockets.
///
/// Thread-safe via interior `RwLock`; designed to be wrapped in `Arc` and
/// shared across the application.
pub struct ConnectionManager {
    connections: RwLock<HashMap<String, RelayConnection>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Register a new socket for `document_id`.
    ///
    /// Returns both halves of the outbound channel: the sender for tasks
    /// that push frames, the receiver for the task that owns the sink.
    pub async fn add(
        &self,
        conn_id: String,
        document_id: DocumentId,
    ) -> (RelaySender, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = RelayConnection {
            document_id,
            sender: tx.clone(),
            client_ids: HashSet::new(),
            user_ids: HashSet::new(),
            connected_at: chrono::Utc::now(),
        };
        self.connections.write().await.insert(conn_id, conn);
        (tx, rx)
    }

    /// Remove a socket, returning what it had registered.
    pub async fn remove(&self, conn_id: &str) -> Option<RelayConnection> {
        self.connections.write().await.remove(conn_id)
    }

    /// Note the sender and the users an inbound frame speaks for.
    pub async fn record(&self, conn_id: &str, message: &ChannelMessage) {
        let mut conns = self.connections.write().await;
        let Some(conn) = conns.get_mut(conn_id) else {
            return;
        };
        conn.client_ids.insert(message.client_id);
        match &message.event {
            CollabEvent::Presence(PresenceEvent::Join { presence })
            | CollabEvent::Sync(SyncEvent::State { presence, .. }) => {
                conn.user_ids.insert(presence.user_id.clone());
            }
            CollabEvent::Presence(PresenceEvent::Leave { user_id }) => {
                conn.user_ids.remove(user_id);
            }
            _ => {}
        }
    }

    /// Whether `client_id` has sent frames through `conn_id`.
    pub async fn originated(&self, conn_id: &str, client_id: ClientId) -> bool {
        self.connections
            .read()
            .await
            .get(conn_id)
            .is_some_and(|conn| conn.client_ids.contains(&client_id))
    }

    /// Whether any socket on `document_id` still speaks for `user_id`.
    pub async fn user_connected(&self, document_id: &str, user_id: &str) -> bool {
        self.connections
            .read()
            .await
            .values()
            .any(|conn| conn.document_id == document_id && conn.user_ids.contains(user_id))
    }

    /// Return the current number of sockets.
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn count_for_document(&self, document_id: &str) -> usize {
        self.connections
            .read()
            .await
            .values()
            .filter(|conn| conn.document_id == document_id)
            .count()
    }

    /// Send a Close frame to every socket, then clear the map.
    pub async fn shutdown_all(&self) {
        let mut conns = self.connections.write().await;
        let count = conns.len();
        for conn in conns.values() {
            let _ = conn.sender.send(Message::Close(None));
        }
        conns.clear();
        tracing::info!(count, "Closed all relay connections");
    }

    /// Send a Ping frame to every socket.
    pub async fn ping_all(&self) {
        let conns = self.connections.read().await;
        for conn in conns.values() {
            let _ = conn.sender.send(Message::Ping(Bytes::new()));
        }
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}
