use std::sync::Arc;

use uuid::Uuid;

use reqcollab_client::SessionRegistry;
use reqcollab_core::clock::SharedClock;
use reqcollab_core::settings::CollabSettings;
use reqcollab_core::types::ClientId;
use reqcollab_events::{LocalHub, Transport};

use crate::config::ServerConfig;
use crate::relay::ConnectionManager;

/// Shared application state available to all Axum handlers via `State<AppState>`.
///
/// This is cheaply cloneable (inner data is behind `Arc` or is already `Clone`).
#[derive(Clone)]
pub struct AppState {
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// In-process channels, one per document with at least one socket.
    pub hub: Arc<LocalHub>,
    /// Read-only sessions that follow each relayed document; they back the
    /// HTTP views.
    pub observers: Arc<SessionRegistry>,
    /// Relay WebSocket connections.
    pub connections: Arc<ConnectionManager>,
    pub clock: SharedClock,
    /// Client id stamped on events the relay publishes itself.
    pub relay_id: ClientId,
}

impl AppState {
    pub fn new(config: ServerConfig, settings: CollabSettings, clock: SharedClock) -> Self {
        let hub = Arc::new(LocalHub::default());
        let transport: Arc<dyn Transport> = hub.clone();
        let observers = Arc::new(SessionRegistry::new(transport, settings, Arc::clone(&clock)));
        Self {
            config: Arc::new(config),
            hub,
            observers,
            connections: Arc::new(ConnectionManager::new()),
            clock,
            relay_id: Uuid::new_v4(),
        }
    }
}
