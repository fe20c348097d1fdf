use axum::routing::get;
use axum::Router;

use crate::handlers::collaboration;
use crate::state::AppState;

/// Collaboration routes mounted at `/documents`.
///
/// ```text
/// GET /{document_id}/presence             -> get_presence
/// GET /{document_id}/locks                -> list_locks
/// GET /{document_id}/locks/{entity_id}    -> get_lock
/// GET /{document_id}/conflicts            -> list_conflicts
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/{document_id}/presence", get(collaboration::get_presence))
        .route("/{document_id}/locks", get(collaboration::list_locks))
        .route(
            "/{document_id}/locks/{entity_id}",
            get(collaboration::get_lock),
        )
        .route("/{document_id}/conflicts", get(collaboration::list_conflicts))
}
