//! `reqcollab-watch` -- join a document through the relay and log what
//! happens in it.
//!
//! # Environment variables
//!
//! | Variable      | Required | Default                | Description                   |
//! |---------------|----------|------------------------|-------------------------------|
//! | `RELAY_URL`   | no       | `ws://127.0.0.1:3000`  | Relay root URL                |
//! | `DOCUMENT_ID` | yes      | --                     | Document to join              |
//! | `USER_ID`     | yes      | --                     | Identity to join as           |
//! | `USER_NAME`   | no       | value of `USER_ID`     | Display name                  |
//!
//! Timing knobs are read by `CollabSettings::from_env`.

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use reqcollab_client::heartbeat::start_heartbeat;
use reqcollab_client::SessionRegistry;
use reqcollab_core::clock::SystemClock;
use reqcollab_core::presence::PresenceIdentity;
use reqcollab_core::replica::ReplicaNotice;
use reqcollab_core::settings::CollabSettings;
use reqcollab_events::WsTransport;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "reqcollab_client=info,reqcollab_watch=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let relay_url =
        std::env::var("RELAY_URL").unwrap_or_else(|_| "ws://127.0.0.1:3000".to_string());
    let document_id = std::env::var("DOCUMENT_ID").context("DOCUMENT_ID is required")?;
    let user_id = std::env::var("USER_ID").context("USER_ID is required")?;
    let user_name = std::env::var("USER_NAME").unwrap_or_else(|_| user_id.clone());
    let settings = CollabSettings::from_env().context("invalid collaboration settings")?;

    tracing::info!(
        relay_url = %relay_url,
        document_id = %document_id,
        user_id = %user_id,
        "Starting reqcollab-watch"
    );

    let transport = Arc::new(WsTransport::new(relay_url));
    let registry = Arc::new(SessionRegistry::new(
        transport.clone(),
        settings,
        Arc::new(SystemClock),
    ));
    let handle = registry
        .open(&document_id, PresenceIdentity::new(user_id, user_name))
        .await
        .context("failed to open document")?;

    let cancel = CancellationToken::new();
    let heartbeat = start_heartbeat(registry.clone(), cancel.clone());
    let mut notices = handle.subscribe_notices();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Ctrl+C received, leaving document");
                break;
            }
            notice = notices.recv() => match notice {
                Ok(ReplicaNotice::Conflict(change)) => {
                    tracing::info!(?change, "Conflict changed");
                }
                Ok(ReplicaNotice::LockLost(lock)) => {
                    tracing::warn!(entity_id = %lock.entity_id, "Lock lost to an earlier grant");
                }
                Ok(ReplicaNotice::PeerEvicted(user_id)) => {
                    tracing::info!(user_id = %user_id, "Peer timed out");
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Notice stream lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }

        let users: Vec<String> = handle.active_users().into_iter().map(|u| u.user_name).collect();
        tracing::info!(users = ?users, locks = handle.locks_by_entity().len(), "Document state");
    }

    cancel.cancel();
    registry.close_all().await;
    transport.shutdown();
    let _ = heartbeat.await;
    Ok(())
}
