pub mod collaboration;
pub mod health;

use axum::routing::get;
use axum::Router;

use crate::relay;
use crate::state::AppState;

/// Relay socket routes, mounted at the root.
///
/// ```text
/// GET /ws/documents/{document_id}   -> relay_handler (WebSocket upgrade)
/// ```
pub fn relay_routes() -> Router<AppState> {
    Router::new().route("/ws/documents/{document_id}", get(relay::relay_handler))
}

/// Build the `/api/v1` route tree.
pub fn api_routes() -> Router<AppState> {
    Router::new().nest("/documents", collaboration::router())
}
