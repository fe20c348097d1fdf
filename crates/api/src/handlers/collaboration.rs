//! Read views over the relay's observer replicas.
//!
//! Each handler reports what the relay currently knows about one document:
//! who is present, which entities are locked and where editors overlap. A
//! document nobody is connected to has no observer and reads as empty.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::Json;

use reqcollab_client::DocumentSession;
use reqcollab_core::collaboration::{validate_document_id, validate_entity_id};
use reqcollab_core::replica::DocumentSnapshot;

use crate::error::{AppError, AppResult};
use crate::response::DataResponse;
use crate::state::AppState;

/// Look up the observer for a validated document id.
async fn observer(
    state: &AppState,
    document_id: &str,
) -> AppResult<Option<Arc<DocumentSession>>> {
    validate_document_id(document_id)?;
    Ok(state.observers.session(document_id).await)
}

async fn snapshot(state: &AppState, document_id: &str) -> AppResult<Option<DocumentSnapshot>> {
    Ok(observer(state, document_id).await?.map(|s| s.snapshot()))
}

/// GET /api/v1/documents/{document_id}/presence
pub async fn get_presence(
    State(state): State<AppState>,
    Path(document_id): Path<String>,
) -> AppResult<impl IntoResponse> {
    let users = snapshot(&state, &document_id)
        .await?
        .map(|s| s.users)
        .unwrap_or_default();
    Ok(Json(DataResponse { data: users }))
}

/// GET /api/v1/documents/{document_id}/locks
///
/// Live locks ordered by entity id.
pub async fn list_locks(
    State(state): State<AppState>,
    Path(document_id): Path<String>,
) -> AppResult<impl IntoResponse> {
    let locks = snapshot(&state, &document_id)
        .await?
        .map(|s| s.locks)
        .unwrap_or_default();
    Ok(Json(DataResponse { data: locks }))
}

/// GET /api/v1/documents/{document_id}/locks/{entity_id}
///
/// Returns 404 when the entity is not locked.
pub async fn get_lock(
    State(state): State<AppState>,
    Path((document_id, entity_id)): Path<(String, String)>,
) -> AppResult<impl IntoResponse> {
    validate_entity_id(&entity_id)?;
    let lock = observer(&state, &document_id)
        .await?
        .and_then(|s| s.lock_for(&entity_id))
        .ok_or_else(|| AppError::NotFound(format!("No active lock on '{entity_id}'")))?;
    Ok(Json(DataResponse { data: lock }))
}

/// GET /api/v1/documents/{document_id}/conflicts
pub async fn list_conflicts(
    State(state): State<AppState>,
    Path(document_id): Path<String>,
) -> AppResult<impl IntoResponse> {
    let conflicts = snapshot(&state, &document_id)
        .await?
        .map(|s| s.conflicts)
        .unwrap_or_default();
    Ok(Json(DataResponse { data: conflicts }))
}
