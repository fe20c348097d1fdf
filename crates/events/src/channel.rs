//! The per-document channel shared by every transport.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use reqcollab_core::error::CoreError;
use reqcollab_core::protocol::ChannelMessage;
use reqcollab_core::types::DocumentId;

/// Default buffer capacity for a channel's signal broadcast.
pub const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The channel is not connected. Publishing is at-most-once, so callers
    /// log this and rely on the next heartbeat or sync.
    #[error("Realtime channel for document {0} is unavailable")]
    Unavailable(DocumentId),

    #[error(transparent)]
    Core(#[from] CoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
}

/// What a channel subscriber receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportSignal {
    Message(ChannelMessage),
    /// The channel is up. `resumed` is true after a reconnect, when the
    /// subscriber should re-sync.
    Connected { resumed: bool },
    Disconnected,
    /// The subscriber fell behind and `n` signals were dropped.
    Lagged(u64),
}

/// Where published messages go.
pub(crate) trait Outbound: Send + Sync {
    fn send(&self, message: ChannelMessage) -> Result<(), TransportError>;
}

/// A handle to one document's channel. Cheap to clone; every clone shares
/// the same underlying subscription.
#[derive(Clone)]
pub struct RealtimeChannel {
    document_id: DocumentId,
    outbound: Arc<dyn Outbound>,
    signals: broadcast::Sender<TransportSignal>,
    status: watch::Receiver<ConnectionStatus>,
}

impl std::fmt::Debug for RealtimeChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeChannel")
            .field("document_id", &self.document_id)
            .field("status", &*self.status.borrow())
            .finish()
    }
}

impl RealtimeChannel {
    pub(crate) fn new(
        document_id: DocumentId,
        outbound: Arc<dyn Outbound>,
        signals: broadcast::Sender<TransportSignal>,
        status: watch::Receiver<ConnectionStatus>,
    ) -> Self {
        Self {
            document_id,
            outbound,
            signals,
            status,
        }
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    /// Publish a message to every participant. No acknowledgement.
    pub fn publish(&self, message: ChannelMessage) -> Result<(), TransportError> {
        if self.status() != ConnectionStatus::Connected {
            return Err(TransportError::Unavailable(self.document_id.clone()));
        }
        self.outbound.send(message)
    }

    /// Receive signals from this point on.
    pub fn subscribe(&self) -> broadcast::Receiver<TransportSignal> {
        self.signals.subscribe()
    }

    /// Run `handler` for every signal, in arrival order, on one task. The
    /// task ends when the channel is dropped or the handle is aborted.
    pub fn on_event<F>(&self, mut handler: F) -> JoinHandle<()>
    where
        F: FnMut(TransportSignal) + Send + 'static,
    {
        let mut rx = self.subscribe();
        let document_id = self.document_id.clone();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(signal) => handler(signal),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(document_id = %document_id, skipped = n, "Channel subscriber lagged");
                        handler(TransportSignal::Lagged(n));
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Wait until the channel reports `wanted`.
    pub async fn wait_for_status(&self, wanted: ConnectionStatus) {
        let mut status = self.status.clone();
        // Only fails if the transport dropped the sender, in which case the
        // status will never change again.
        let _ = status.wait_for(|s| *s == wanted).await;
    }
}

/// Opens document channels.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open (or return the cached) channel for `document_id`. Idempotent.
    async fn connect(&self, document_id: &str) -> Result<RealtimeChannel, TransportError>;
}
