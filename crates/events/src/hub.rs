//! In-process channels backed by `tokio::sync::broadcast`.
//!
//! [`LocalHub`] keeps one broadcast per document. Everything published on a
//! document's channel reaches every subscriber of that document, including
//! the publisher; sessions recognise their own echoes by client id. The
//! relay hosts its document channels on a hub, and tests use it to connect
//! several sessions without a network.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, watch, RwLock};

use reqcollab_core::collaboration::validate_document_id;
use reqcollab_core::protocol::ChannelMessage;
use reqcollab_core::types::DocumentId;

use crate::channel::{
    ConnectionStatus, Outbound, RealtimeChannel, Transport, TransportError, TransportSignal,
    DEFAULT_CAPACITY,
};

struct HubOutbound {
    signals: broadcast::Sender<TransportSignal>,
}

impl Outbound for HubOutbound {
    fn send(&self, message: ChannelMessage) -> Result<(), TransportError> {
        // A send error only means there are zero subscribers.
        let _ = self.signals.send(TransportSignal::Message(message));
        Ok(())
    }
}

struct HubEntry {
    channel: RealtimeChannel,
    signals: broadcast::Sender<TransportSignal>,
    status: watch::Sender<ConnectionStatus>,
}

/// In-process fan-out for document channels.
///
/// Thread-safe via interior `RwLock`; designed to be wrapped in `Arc` and
/// shared.
pub struct LocalHub {
    capacity: usize,
    channels: RwLock<HashMap<DocumentId, HubEntry>>,
}

impl LocalHub {
    /// Create a hub whose channels buffer `capacity` signals.
    ///
    /// When a buffer is full the oldest unconsumed signals are dropped and
    /// slow subscribers observe [`TransportSignal::Lagged`].
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// Return the channel for `document_id`, creating it on first use.
    pub async fn channel(&self, document_id: &str) -> Result<RealtimeChannel, TransportError> {
        if let Some(entry) = self.channels.read().await.get(document_id) {
            return Ok(entry.channel.clone());
        }

        validate_document_id(document_id)?;
        let mut channels = self.channels.write().await;
        let entry = channels.entry(document_id.to_string()).or_insert_with(|| {
            let (signals, _) = broadcast::channel(self.capacity);
            let (status, status_rx) = watch::channel(ConnectionStatus::Connected);
            let outbound = Arc::new(HubOutbound {
                signals: signals.clone(),
            });
            tracing::debug!(document_id = %document_id, "Opened hub channel");
            HubEntry {
                channel: RealtimeChannel::new(
                    document_id.to_string(),
                    outbound,
                    signals.clone(),
                    status_rx,
                ),
                signals,
                status,
            }
        });
        Ok(entry.channel.clone())
    }

    /// Simulate losing the channel: publishing fails until
    /// [`set_online`](Self::set_online). Returns false for unknown documents.
    pub async fn set_offline(&self, document_id: &str) -> bool {
        self.set_status(document_id, ConnectionStatus::Disconnected, TransportSignal::Disconnected)
            .await
    }

    /// Bring a channel back after [`set_offline`](Self::set_offline).
    /// Subscribers see `Connected { resumed: true }`.
    pub async fn set_online(&self, document_id: &str) -> bool {
        self.set_status(
            document_id,
            ConnectionStatus::Connected,
            TransportSignal::Connected { resumed: true },
        )
        .await
    }

    async fn set_status(
        &self,
        document_id: &str,
        status: ConnectionStatus,
        signal: TransportSignal,
    ) -> bool {
        let channels = self.channels.read().await;
        let Some(entry) = channels.get(document_id) else {
            return false;
        };
        entry.status.send_replace(status);
        let _ = entry.signals.send(signal);
        true
    }

    /// Number of subscribers on a document's channel.
    pub async fn subscriber_count(&self, document_id: &str) -> usize {
        self.channels
            .read()
            .await
            .get(document_id)
            .map_or(0, |entry| entry.signals.receiver_count())
    }

    pub async fn document_count(&self) -> usize {
        self.channels.read().await.len()
    }

    /// Ids of every open channel, sorted.
    pub async fn documents(&self) -> Vec<DocumentId> {
        let mut ids: Vec<DocumentId> = self.channels.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Drop channels nobody subscribes to any more. Returns how many were
    /// removed.
    pub async fn remove_idle(&self) -> usize {
        let mut channels = self.channels.write().await;
        let before = channels.len();
        channels.retain(|_, entry| entry.signals.receiver_count() > 0);
        let removed = before - channels.len();
        if removed > 0 {
            tracing::debug!(removed, "Removed idle hub channels");
        }
        removed
    }

    /// Tell every subscriber the hub is going away.
    pub async fn shutdown_all(&self) {
        let mut channels = self.channels.write().await;
        let count = channels.len();
        for entry in channels.values() {
            entry.status.send_replace(ConnectionStatus::Disconnected);
            let _ = entry.signals.send(TransportSignal::Disconnected);
        }
        channels.clear();
        tracing::info!(count, "Closed all hub channels");
    }
}

impl Default for LocalHub {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[async_trait]
impl Transport for LocalHub {
    async fn connect(&self, document_id: &str) -> Result<RealtimeChannel, TransportError> {
        self.channel(document_id).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
