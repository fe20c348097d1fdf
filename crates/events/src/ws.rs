//! WebSocket client transport.
//!
//! Each document gets its own connection to the relay at
//! `{base_url}/ws/documents/{document_id}`. A background task owns the
//! socket: it forwards published messages as JSON text frames, decodes
//! incoming frames into [`TransportSignal::Message`]s and reconnects with a
//! fixed delay when the connection drops.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use reqcollab_core::collaboration::validate_document_id;
use reqcollab_core::protocol::ChannelMessage;
use reqcollab_core::types::DocumentId;

use crate::channel::{
    ConnectionStatus, Outbound, RealtimeChannel, Transport, TransportError, TransportSignal,
    DEFAULT_CAPACITY,
};

/// Reconnection delay after a WebSocket failure.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Messages queued for the socket task before publishing reports
/// unavailability.
const OUTBOUND_CAPACITY: usize = 256;

struct SocketOutbound {
    document_id: DocumentId,
    sender: mpsc::Sender<ChannelMessage>,
}

impl Outbound for SocketOutbound {
    fn send(&self, message: ChannelMessage) -> Result<(), TransportError> {
        self.sender.try_send(message).map_err(|e| {
            tracing::warn!(document_id = %self.document_id, error = %e, "Outbound queue rejected message");
            TransportError::Unavailable(self.document_id.clone())
        })
    }
}

/// Connects document channels to a relay over WebSocket.
pub struct WsTransport {
    base_url: String,
    reconnect_delay: Duration,
    channels: Mutex<HashMap<DocumentId, RealtimeChannel>>,
    cancel: CancellationToken,
}

impl WsTransport {
    /// `base_url` is the relay's root, e.g. `ws://127.0.0.1:3000`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            reconnect_delay: RECONNECT_DELAY,
            channels: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn url_for(&self, document_id: &str) -> String {
        format!("{}/ws/documents/{}", self.base_url, document_id)
    }

    /// Close every socket and stop reconnecting.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self, document_id: &str) -> Result<RealtimeChannel, TransportError> {
        let mut channels = self.channels.lock().await;
        if let Some(channel) = channels.get(document_id) {
            return Ok(channel.clone());
        }
        validate_document_id(document_id)?;

        let (signals, _) = broadcast::channel(DEFAULT_CAPACITY);
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Connecting);
        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_CAPACITY);

        let channel = RealtimeChannel::new(
            document_id.to_string(),
            Arc::new(SocketOutbound {
                document_id: document_id.to_string(),
                sender: out_tx,
            }),
            signals.clone(),
            status_rx,
        );

        let link = SocketLink {
            url: self.url_for(document_id),
            document_id: document_id.to_string(),
            reconnect_delay: self.reconnect_delay,
            signals,
            status: status_tx,
            outbound: out_rx,
            cancel: self.cancel.child_token(),
        };
        tokio::spawn(link.run());

        channels.insert(document_id.to_string(), channel.clone());
        Ok(channel)
    }
}

/// The state owned by one document's socket task.
struct SocketLink {
    url: String,
    document_id: DocumentId,
    reconnect_delay: Duration,
    signals: broadcast::Sender<TransportSignal>,
    status: watch::Sender<ConnectionStatus>,
    outbound: mpsc::Receiver<ChannelMessage>,
    cancel: CancellationToken,
}

impl SocketLink {
    /// Connect, run the session, and reconnect until cancelled.
    async fn run(mut self) {
        let mut connected_before = false;

        while !self.cancel.is_cancelled() {
            self.status.send_replace(ConnectionStatus::Connecting);
            tracing::info!(url = %self.url, "Connecting to relay WebSocket");

            let attempt = tokio::select! {
                _ = self.cancel.cancelled() => break,
                attempt = connect_async(self.url.as_str()) => attempt,
            };

            match attempt {
                Ok((ws_stream, _response)) => {
                    // Anything queued for the previous connection is stale;
                    // the resumed session re-syncs instead.
                    while self.outbound.try_recv().is_ok() {}

                    self.status.send_replace(ConnectionStatus::Connected);
                    let _ = self.signals.send(TransportSignal::Connected {
                        resumed: connected_before,
                    });
                    connected_before = true;
                    tracing::info!(document_id = %self.document_id, "Relay WebSocket connected");

                    self.run_session(ws_stream).await;

                    self.status.send_replace(ConnectionStatus::Disconnected);
                    let _ = self.signals.send(TransportSignal::Disconnected);
                    tracing::warn!(document_id = %self.document_id, "Relay WebSocket session ended");
                }
                Err(e) => {
                    self.status.send_replace(ConnectionStatus::Disconnected);
                    tracing::error!(url = %self.url, error = %e, "Relay WebSocket connection failed");
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.reconnect_delay) => {}
            }
        }

        self.status.send_replace(ConnectionStatus::Disconnected);
        tracing::debug!(document_id = %self.document_id, "Relay WebSocket task stopped");
    }

    /// Drive one connection: forward outbound messages and decode inbound
    /// frames via `tokio::select!`.
    async fn run_session(
        &mut self,
        ws_stream: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
    ) {
        let (mut sink, mut stream) = ws_stream.split();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
                outgoing = self.outbound.recv() => {
                    let Some(message) = outgoing else { break };
                    let json = match message.encode() {
                        Ok(json) => json,
                        Err(e) => {
                            tracing::warn!(error = %e, "Dropping unencodable message");
                            continue;
                        }
                    };
                    if let Err(e) = sink.send(Message::Text(json)).await {
                        tracing::error!(error = %e, "Failed to send to relay");
                        break;
                    }
                }
                incoming = stream.next() => {
                    match incoming {
                        Some(Ok(Message::Text(text))) => self.handle_incoming(&text),
                        Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                            // Handled automatically by tungstenite.
                        }
                        Some(Ok(Message::Close(frame))) => {
                            tracing::info!(?frame, "Relay closed WebSocket");
                            break;
                        }
                        Some(Ok(_)) => {
                            // Binary / Frame -- ignore.
                        }
                        Some(Err(e)) => {
                            tracing::error!(error = %e, "Relay WebSocket receive error");
                            break;
                        }
                        None => {
                            tracing::info!("Relay WebSocket stream exhausted");
                            break;
                        }
                    }
                }
            }
        }
    }

    fn handle_incoming(&self, text: &str) {
        match ChannelMessage::decode_for(text, &self.document_id) {
            Ok(message) => {
                let _ = self.signals.send(TransportSignal::Message(message));
            }
            Err(e) => {
                tracing::warn!(error = %e, "Dropping malformed relay frame");
            }
        }
    }
}
