use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use reqcollab_core::collaboration::validate_document_id;
use reqcollab_core::protocol::{ChannelMessage, PresenceEvent, SyncEvent};
use reqcollab_events::{RealtimeChannel, TransportSignal};

use crate::error::AppResult;
use crate::relay::RelaySender;
use crate::state::AppState;

/// GET /ws/documents/{document_id} -- upgrade to a relay socket.
///
/// The document id is checked before the upgrade so a bad id gets a plain
/// 400 instead of a socket that closes immediately.
pub async fn relay_handler(
    ws: WebSocketUpgrade,
    Path(document_id): Path<String>,
    State(state): State<AppState>,
) -> AppResult<impl IntoResponse> {
    validate_document_id(&document_id)?;
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, document_id, state)))
}

/// Bridge one socket to its document's channel.
///
///   1. Joins the document channel and makes sure an observer follows it.
///   2. Spawns a sender task that owns the sink.
///   3. Spawns a forwarder that pushes channel events to the socket,
///      skipping the ones this socket sent.
///   4. Publishes every valid inbound frame on the channel.
///   5. On close, publishes `presence.leave` for the users that joined
///      through this socket and are not connected elsewhere.
async fn handle_socket(socket: WebSocket, document_id: String, state: AppState) {
    let channel = match state.hub.channel(&document_id).await {
        Ok(channel) => channel,
        Err(e) => {
            tracing::warn!(document_id = %document_id, error = %e, "Relay channel unavailable");
            return;
        }
    };
    if let Err(e) = state.observers.observe(&document_id).await {
        tracing::warn!(document_id = %document_id, error = %e, "Failed to observe document");
    }

    let conn_id = uuid::Uuid::new_v4().to_string();
    tracing::info!(conn_id = %conn_id, document_id = %document_id, "Relay socket connected");

    let signals = channel.subscribe();
    let (tx, mut rx) = state.connections.add(conn_id.clone(), document_id.clone()).await;
    let (mut sink, mut stream) = socket.split();

    // Sender task: forward queued frames to the WebSocket sink.
    let sender_conn_id = conn_id.clone();
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sink.send(msg).await.is_err() {
                tracing::debug!(conn_id = %sender_conn_id, "Relay sink closed");
                break;
            }
        }
    });

    let forward_task = tokio::spawn(forward_channel(
        state.clone(),
        channel.clone(),
        signals,
        conn_id.clone(),
        tx,
    ));

    // Receiver loop: validate and publish inbound frames.
    while let Some(result) = stream.next().await {
        match result {
            Ok(Message::Text(text)) => {
                match ChannelMessage::decode_for(text.as_str(), &document_id) {
                    Ok(message) => {
                        state.connections.record(&conn_id, &message).await;
                        if let Err(e) = channel.publish(message) {
                            tracing::debug!(conn_id = %conn_id, error = %e, "Relay publish failed");
                        }
                    }
                    Err(e) => {
                        tracing::warn!(conn_id = %conn_id, error = %e, "Dropped malformed frame");
                    }
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(Message::Pong(_)) => {
                tracing::trace!(conn_id = %conn_id, "Pong received");
            }
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(conn_id = %conn_id, error = %e, "Relay receive error");
                break;
            }
        }
    }

    // Clean up: announce departures, then stop the tasks.
    if let Some(conn) = state.connections.remove(&conn_id).await {
        let mut users: Vec<_> = conn.user_ids.into_iter().collect();
        users.sort();
        for user_id in users {
            if state.connections.user_connected(&document_id, &user_id).await {
                continue;
            }
            tracing::info!(document_id = %document_id, user_id = %user_id, "Socket closed, user left");
            let message = ChannelMessage::new(
                document_id.clone(),
                state.relay_id,
                state.clock.now(),
                PresenceEvent::Leave { user_id },
            );
            if let Err(e) = channel.publish(message) {
                tracing::debug!(conn_id = %conn_id, error = %e, "Relay publish failed");
            }
        }
    }
    forward_task.abort();
    send_task.abort();
    tracing::info!(conn_id = %conn_id, "Relay socket disconnected");
}

/// Push channel events to one socket until either side goes away.
async fn forward_channel(
    state: AppState,
    channel: RealtimeChannel,
    mut signals: broadcast::Receiver<TransportSignal>,
    conn_id: String,
    tx: RelaySender,
) {
    loop {
        let message = match signals.recv().await {
            Ok(TransportSignal::Message(message)) => message,
            Ok(_) => continue,
            Err(RecvError::Lagged(skipped)) => {
                // Frames were lost for this socket; have every peer re-announce.
                tracing::warn!(conn_id = %conn_id, skipped, "Relay forwarder lagged, requesting sync");
                let request = ChannelMessage::new(
                    channel.document_id().to_string(),
                    state.relay_id,
                    state.clock.now(),
                    SyncEvent::Request,
                );
                let _ = channel.publish(request);
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        if state.connections.originated(&conn_id, message.client_id).await {
            continue;
        }
        let text = match message.encode() {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(conn_id = %conn_id, error = %e, "Failed to encode frame");
                continue;
            }
        };
        if tx.send(Message::Text(text.into())).is_err() {
            break;
        }
    }
}
