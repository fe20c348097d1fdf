//! The facade UI components talk to.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, watch};

use reqcollab_core::collaboration::EntityType;
use reqcollab_core::conflict::{ConflictSignal, EditingIntent};
use reqcollab_core::error::{CoreError, LockDenied, LockError};
use reqcollab_core::locks::EntityLock;
use reqcollab_core::persistence::{PersistenceApi, VersionedRow};
use reqcollab_core::presence::{CursorPosition, SelectionRange, UserPresence};
use reqcollab_core::replica::ReplicaNotice;
use reqcollab_core::types::{EntityId, UserId};

use crate::error::SaveError;
use crate::session::DocumentSession;

/// One user's view of a shared document session. Holds no state of its
/// own; clones are cheap and share the session.
#[derive(Clone)]
pub struct CollabHandle {
    session: Arc<DocumentSession>,
    user_id: UserId,
}

impl CollabHandle {
    pub(crate) fn new(session: Arc<DocumentSession>, user_id: UserId) -> Self {
        Self { session, user_id }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn document_id(&self) -> &str {
        self.session.document_id()
    }

    pub fn session(&self) -> &Arc<DocumentSession> {
        &self.session
    }

    // -----------------------------------------------------------------------
    // Presence
    // -----------------------------------------------------------------------

    /// Move the cursor. Broadcast is fire-and-forget.
    pub fn update_cursor(
        &self,
        cursor: Option<CursorPosition>,
        selection: Option<SelectionRange>,
    ) -> Option<UserPresence> {
        let selection = selection.map(SelectionRange::normalized);
        self.session
            .with_replica(|r, now| r.update_cursor(&self.user_id, cursor, selection, now))
    }

    /// Mark the user idle or back.
    pub fn set_active(&self, is_active: bool) -> Option<UserPresence> {
        self.session
            .with_replica(|r, now| r.set_active(&self.user_id, is_active, now))
    }

    pub fn active_users(&self) -> Vec<UserPresence> {
        self.session.read(|r, _| r.active_users())
    }

    pub fn leave(&self) -> Option<UserPresence> {
        self.session.leave_user(&self.user_id)
    }

    // -----------------------------------------------------------------------
    // Locks
    // -----------------------------------------------------------------------

    /// Take the edit lock. Fails with [`LockError::Denied`] while someone
    /// else holds it, and with [`LockError::Invalid`] for an entity id peers
    /// would reject or after this handle has left.
    pub fn acquire_lock(
        &self,
        entity_id: &str,
        entity_type: EntityType,
    ) -> Result<EntityLock, LockError> {
        let result = self
            .session
            .with_replica(|r, now| r.acquire_lock(entity_id, entity_type, &self.user_id, now));
        match &result {
            Err(LockError::Denied(denied)) => {
                tracing::debug!(user_id = %self.user_id, %denied, "Lock denied");
            }
            Err(LockError::Invalid(e)) => {
                tracing::warn!(user_id = %self.user_id, entity_id = %entity_id, error = %e, "Lock request rejected");
            }
            Ok(_) => {}
        }
        result
    }

    pub fn renew_lock(&self, entity_id: &str) -> Result<EntityLock, LockError> {
        self.session
            .with_replica(|r, now| r.renew_lock(entity_id, &self.user_id, now))
    }

    pub fn release_lock(&self, entity_id: &str) -> bool {
        self.session
            .with_replica(|r, _| r.release_lock(entity_id, &self.user_id))
    }

    pub fn lock_for(&self, entity_id: &str) -> Option<EntityLock> {
        self.session.read(|r, now| r.lock_for(entity_id, now))
    }

    pub fn locks_by_entity(&self) -> HashMap<EntityId, EntityLock> {
        self.session.read(|r, now| r.locks_by_entity(now))
    }

    // -----------------------------------------------------------------------
    // Editing intents and conflicts
    // -----------------------------------------------------------------------

    pub fn begin_editing(
        &self,
        entity_id: &str,
        entity_type: EntityType,
    ) -> Result<EditingIntent, CoreError> {
        self.session
            .with_replica(|r, now| r.begin_editing(&self.user_id, entity_id, entity_type, now))
    }

    pub fn end_editing(&self, entity_id: &str) -> bool {
        self.session
            .with_replica(|r, now| r.end_editing(&self.user_id, entity_id, now))
    }

    pub fn conflicts_by_entity(&self) -> HashMap<EntityId, ConflictSignal> {
        self.session.read(|r, now| r.conflicts_by_entity(now))
    }

    /// The latest conflict set; bursts of changes coalesce into one update.
    pub fn subscribe_conflicts(&self) -> watch::Receiver<Vec<ConflictSignal>> {
        self.session.subscribe_conflicts()
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<ReplicaNotice> {
        self.session.subscribe_notices()
    }

    // -----------------------------------------------------------------------
    // Save
    // -----------------------------------------------------------------------

    /// Commit `fields` through the persistence API, then close the editor
    /// and release the lock.
    ///
    /// Refused while another user holds a live lock on the entity. A stale
    /// `expected_version` fails with `VersionConflict` and leaves the
    /// editor and lock in place so the user can reconcile.
    pub async fn save_entity(
        &self,
        persistence: &dyn PersistenceApi,
        entity_id: &str,
        expected_version: i64,
        fields: serde_json::Value,
    ) -> Result<VersionedRow, SaveError> {
        if let Some(lock) = self.lock_for(entity_id) {
            if lock.owner_user_id != self.user_id {
                return Err(SaveError::Locked(LockDenied {
                    entity_id: entity_id.to_string(),
                    current_owner: Some(lock.owner_user_id),
                    expires_at: Some(lock.expires_at),
                }));
            }
        }

        let row = persistence
            .update_row(entity_id, expected_version, fields)
            .await?;

        self.end_editing(entity_id);
        self.release_lock(entity_id);
        tracing::debug!(
            user_id = %self.user_id,
            entity_id = %entity_id,
            version = row.version,
            "Saved entity"
        );
        Ok(row)
    }
}
