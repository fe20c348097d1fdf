//! Events exchanged on a document channel.
//!
//! Every frame on the wire is one [`ChannelMessage`] serialized as JSON.
//! The event itself is a closed set of variants: the outer [`CollabEvent`]
//! is adjacently tagged by `"kind"`, and each inner enum is internally
//! tagged by a dotted `"type"` so a browser client can route on it.
//! Anything that does not decode into these variants is a
//! [`CoreError::MalformedEvent`] and gets dropped at the boundary.

use serde::{Deserialize, Serialize};

use crate::collaboration::validate_entity_id;
use crate::conflict::EditingIntent;
use crate::error::CoreError;
use crate::locks::EntityLock;
use crate::presence::{CursorPosition, SelectionRange, UserPresence};
use crate::types::{ClientId, DocumentId, EntityId, Timestamp, UserId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PresenceEvent {
    /// Owner announces (or re-announces) its full presence record.
    #[serde(rename = "presence.join")]
    Join { presence: UserPresence },

    /// Owner moved its cursor or changed activity.
    #[serde(rename = "presence.update")]
    Update {
        user_id: UserId,
        cursor: Option<CursorPosition>,
        selection: Option<SelectionRange>,
        is_active: bool,
    },

    /// Owner is still connected.
    #[serde(rename = "presence.heartbeat")]
    Heartbeat { user_id: UserId },

    /// Owner left, or the relay saw its socket close.
    #[serde(rename = "presence.leave")]
    Leave { user_id: UserId },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum LockEvent {
    #[serde(rename = "lock.acquired")]
    Acquired { lock: EntityLock },

    #[serde(rename = "lock.renewed")]
    Renewed { lock: EntityLock },

    #[serde(rename = "lock.released")]
    Released { entity_id: EntityId, user_id: UserId },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum IntentEvent {
    #[serde(rename = "intent.begin")]
    Begin { intent: EditingIntent },

    #[serde(rename = "intent.refresh")]
    Refresh { user_id: UserId, entity_id: EntityId },

    #[serde(rename = "intent.end")]
    End { user_id: UserId, entity_id: EntityId },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SyncEvent {
    /// Ask every peer to re-announce its own state (sent after reconnect).
    #[serde(rename = "sync.request")]
    Request,

    /// A peer's complete self-owned state.
    #[serde(rename = "sync.state")]
    State {
        presence: UserPresence,
        locks: Vec<EntityLock>,
        intent: Option<EditingIntent>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "event", rename_all = "snake_case")]
pub enum CollabEvent {
    Presence(PresenceEvent),
    Lock(LockEvent),
    Intent(IntentEvent),
    Sync(SyncEvent),
}

impl CollabEvent {
    /// The user whose state this event describes, if any.
    pub fn subject(&self) -> Option<&str> {
        match self {
            CollabEvent::Presence(PresenceEvent::Join { presence }) => Some(presence.user_id.as_str()),
            CollabEvent::Presence(
                PresenceEvent::Update { user_id, .. }
                | PresenceEvent::Heartbeat { user_id }
                | PresenceEvent::Leave { user_id },
            ) => Some(user_id.as_str()),
            CollabEvent::Lock(LockEvent::Acquired { lock } | LockEvent::Renewed { lock }) => {
                Some(lock.owner_user_id.as_str())
            }
            CollabEvent::Lock(LockEvent::Released { user_id, .. }) => Some(user_id.as_str()),
            CollabEvent::Intent(IntentEvent::Begin { intent }) => Some(intent.user_id.as_str()),
            CollabEvent::Intent(
                IntentEvent::Refresh { user_id, .. } | IntentEvent::End { user_id, .. },
            ) => Some(user_id.as_str()),
            CollabEvent::Sync(SyncEvent::State { presence, .. }) => Some(presence.user_id.as_str()),
            CollabEvent::Sync(SyncEvent::Request) => None,
        }
    }

    /// Short dotted name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            CollabEvent::Presence(PresenceEvent::Join { .. }) => "presence.join",
            CollabEvent::Presence(PresenceEvent::Update { .. }) => "presence.update",
            CollabEvent::Presence(PresenceEvent::Heartbeat { .. }) => "presence.heartbeat",
            CollabEvent::Presence(PresenceEvent::Leave { .. }) => "presence.leave",
            CollabEvent::Lock(LockEvent::Acquired { .. }) => "lock.acquired",
            CollabEvent::Lock(LockEvent::Renewed { .. }) => "lock.renewed",
            CollabEvent::Lock(LockEvent::Released { .. }) => "lock.released",
            CollabEvent::Intent(IntentEvent::Begin { .. }) => "intent.begin",
            CollabEvent::Intent(IntentEvent::Refresh { .. }) => "intent.refresh",
            CollabEvent::Intent(IntentEvent::End { .. }) => "intent.end",
            CollabEvent::Sync(SyncEvent::Request) => "sync.request",
            CollabEvent::Sync(SyncEvent::State { .. }) => "sync.state",
        }
    }

    fn validate(&self) -> Result<(), CoreError> {
        if let Some(user_id) = self.subject() {
            if user_id.is_empty() {
                return Err(CoreError::MalformedEvent(format!(
                    "{} carries an empty user_id",
                    self.name()
                )));
            }
        }
        let entity_ids: Vec<&str> = match self {
            CollabEvent::Lock(LockEvent::Acquired { lock } | LockEvent::Renewed { lock }) => {
                vec![lock.entity_id.as_str()]
            }
            CollabEvent::Lock(LockEvent::Released { entity_id, .. })
            | CollabEvent::Intent(
                IntentEvent::Refresh { entity_id, .. } | IntentEvent::End { entity_id, .. },
            ) => vec![entity_id.as_str()],
            CollabEvent::Intent(IntentEvent::Begin { intent }) => vec![intent.entity_id.as_str()],
            CollabEvent::Sync(SyncEvent::State { locks, intent, .. }) => locks
                .iter()
                .map(|l| l.entity_id.as_str())
                .chain(intent.iter().map(|i| i.entity_id.as_str()))
                .collect(),
            CollabEvent::Presence(_) | CollabEvent::Sync(SyncEvent::Request) => Vec::new(),
        };
        for entity_id in entity_ids {
            validate_entity_id(entity_id)
                .map_err(|e| CoreError::MalformedEvent(format!("{}: {e}", self.name())))?;
        }
        Ok(())
    }
}

impl From<PresenceEvent> for CollabEvent {
    fn from(event: PresenceEvent) -> Self {
        CollabEvent::Presence(event)
    }
}

impl From<LockEvent> for CollabEvent {
    fn from(event: LockEvent) -> Self {
        CollabEvent::Lock(event)
    }
}

impl From<IntentEvent> for CollabEvent {
    fn from(event: IntentEvent) -> Self {
        CollabEvent::Intent(event)
    }
}

impl From<SyncEvent> for CollabEvent {
    fn from(event: SyncEvent) -> Self {
        CollabEvent::Sync(event)
    }
}

/// Envelope for one event on a document channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelMessage {
    pub document_id: DocumentId,
    /// Sending client session; lets a client skip its own echoes.
    pub client_id: ClientId,
    pub sent_at: Timestamp,
    pub event: CollabEvent,
}

impl ChannelMessage {
    pub fn new(
        document_id: impl Into<DocumentId>,
        client_id: ClientId,
        sent_at: Timestamp,
        event: impl Into<CollabEvent>,
    ) -> Self {
        Self {
            document_id: document_id.into(),
            client_id,
            sent_at,
            event: event.into(),
        }
    }

    pub fn encode(&self) -> Result<String, CoreError> {
        serde_json::to_string(self)
            .map_err(|e| CoreError::Internal(format!("Failed to encode channel message: {e}")))
    }

    /// Parse and validate one frame.
    pub fn decode(raw: &str) -> Result<Self, CoreError> {
        let message: Self =
            serde_json::from_str(raw).map_err(|e| CoreError::MalformedEvent(e.to_string()))?;
        if message.document_id.is_empty() {
            return Err(CoreError::MalformedEvent("empty document_id".into()));
        }
        message.event.validate()?;
        Ok(message)
    }

    /// Decode a frame that must belong to `document_id`.
    pub fn decode_for(raw: &str, document_id: &str) -> Result<Self, CoreError> {
        let message = Self::decode(raw)?;
        if message.document_id != document_id {
            return Err(CoreError::MalformedEvent(format!(
                "frame for document '{}' arrived on channel '{document_id}'",
                message.document_id
            )));
        }
        Ok(message)
    }
}
