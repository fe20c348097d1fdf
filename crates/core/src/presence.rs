//! Per-document presence: who is connected and where their cursor is.

use std::collections::HashMap;

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::collaboration::{color_for, validate_color, validate_user_name};
use crate::error::CoreError;
use crate::types::{DocumentId, Timestamp, UserId};

/// Caret position inside a block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub block_id: String,
    pub offset: u32,
}

/// Selected span inside a block; `start <= end` after normalisation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionRange {
    pub block_id: String,
    pub start: u32,
    pub end: u32,
}

impl SelectionRange {
    pub fn normalized(mut self) -> Self {
        if self.start > self.end {
            std::mem::swap(&mut self.start, &mut self.end);
        }
        self
    }

    pub fn is_collapsed(&self) -> bool {
        self.start == self.end
    }
}

/// Identity a client presents when it joins a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceIdentity {
    pub user_id: UserId,
    pub user_name: String,
    /// Cursor colour; a palette colour is picked when absent.
    #[serde(default)]
    pub color: Option<String>,
}

impl PresenceIdentity {
    pub fn new(user_id: impl Into<UserId>, user_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            user_name: user_name.into(),
            color: None,
        }
    }

    pub fn with_color(mut self, color: impl Into<String>) -> Self {
        self.color = Some(color.into());
        self
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.user_id.is_empty() {
            return Err(CoreError::Validation("user_id must not be empty".into()));
        }
        validate_user_name(&self.user_name)?;
        if let Some(color) = &self.color {
            validate_color(color)?;
        }
        Ok(())
    }
}

/// A connected user's live state within one document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPresence {
    pub user_id: UserId,
    pub user_name: String,
    pub color: String,
    pub cursor: Option<CursorPosition>,
    pub selection: Option<SelectionRange>,
    pub is_active: bool,
    pub last_seen: Timestamp,
}

impl UserPresence {
    pub fn from_identity(identity: PresenceIdentity, now: Timestamp) -> Self {
        let color = identity
            .color
            .unwrap_or_else(|| color_for(&identity.user_id).to_string());
        Self {
            user_id: identity.user_id,
            user_name: identity.user_name,
            color,
            cursor: None,
            selection: None,
            is_active: true,
            last_seen: now,
        }
    }

    /// Stand-in for a user referenced by a lock or intent whose presence
    /// record is gone.
    pub fn placeholder(user_id: &str, now: Timestamp) -> Self {
        Self {
            user_id: user_id.to_string(),
            user_name: user_id.to_string(),
            color: color_for(user_id).to_string(),
            cursor: None,
            selection: None,
            is_active: false,
            last_seen: now,
        }
    }

    pub fn identity(&self) -> PresenceIdentity {
        PresenceIdentity {
            user_id: self.user_id.clone(),
            user_name: self.user_name.clone(),
            color: Some(self.color.clone()),
        }
    }
}

/// Presence records for a single document, keyed by user.
#[derive(Debug)]
pub struct PresenceStore {
    document_id: DocumentId,
    users: HashMap<UserId, UserPresence>,
}

impl PresenceStore {
    pub fn new(document_id: impl Into<DocumentId>) -> Self {
        Self {
            document_id: document_id.into(),
            users: HashMap::new(),
        }
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    /// Register a session. Re-joining replaces the previous record.
    pub fn join(&mut self, identity: PresenceIdentity, now: Timestamp) -> UserPresence {
        let presence = UserPresence::from_identity(identity, now);
        self.upsert(presence.clone());
        presence
    }

    /// Store a full record as received from its owner.
    pub fn upsert(&mut self, presence: UserPresence) {
        self.users.insert(presence.user_id.clone(), presence);
    }

    /// Overwrite a user's cursor and selection. Returns `None` for unknown users.
    pub fn update_cursor(
        &mut self,
        user_id: &str,
        cursor: Option<CursorPosition>,
        selection: Option<SelectionRange>,
        now: Timestamp,
    ) -> Option<&UserPresence> {
        let presence = self.users.get_mut(user_id)?;
        presence.cursor = cursor;
        presence.selection = selection.map(SelectionRange::normalized);
        presence.is_active = true;
        presence.last_seen = now;
        Some(presence)
    }

    /// Record a heartbeat. Returns `false` for unknown users.
    pub fn touch(&mut self, user_id: &str, now: Timestamp) -> bool {
        match self.users.get_mut(user_id) {
            Some(presence) => {
                presence.last_seen = now;
                true
            }
            None => false,
        }
    }

    /// Mark a user idle or active without touching the cursor.
    pub fn set_active(&mut self, user_id: &str, is_active: bool, now: Timestamp) -> bool {
        match self.users.get_mut(user_id) {
            Some(presence) => {
                presence.is_active = is_active;
                presence.last_seen = now;
                true
            }
            None => false,
        }
    }

    /// Remove a user's presence.
    pub fn leave(&mut self, user_id: &str) -> Option<UserPresence> {
        self.users.remove(user_id)
    }

    /// Remove every record not seen within `timeout` and return their ids.
    pub fn evict_stale(&mut self, now: Timestamp, timeout: Duration) -> Vec<UserId> {
        let cutoff = now - timeout;
        let mut evicted: Vec<UserId> = self
            .users
            .values()
            .filter(|p| p.last_seen < cutoff)
            .map(|p| p.user_id.clone())
            .collect();
        evicted.sort();
        for user_id in &evicted {
            self.users.remove(user_id);
        }
        evicted
    }

    pub fn get(&self, user_id: &str) -> Option<&UserPresence> {
        self.users.get(user_id)
    }

    /// Users currently marked active, ordered by user id.
    pub fn get_active_users(&self) -> Vec<UserPresence> {
        let mut users: Vec<UserPresence> =
            self.users.values().filter(|p| p.is_active).cloned().collect();
        users.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        users
    }

    /// Every record, active or idle, ordered by user id.
    pub fn users(&self) -> Vec<UserPresence> {
        let mut users: Vec<UserPresence> = self.users.values().cloned().collect();
        users.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        users
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}
