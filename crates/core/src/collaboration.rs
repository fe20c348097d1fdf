//! Collaboration constants, entity kinds, and validation.
//!
//! Shared by the replica, the client facade and the relay so that every
//! participant agrees on lock durations, entity kinds and what a valid
//! presence record looks like.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

// ---------------------------------------------------------------------------
// Lock duration constants
// ---------------------------------------------------------------------------

/// Default lock time-to-live in seconds.
pub const DEFAULT_LOCK_TTL_SECS: i64 = 30;

/// Maximum allowed lock time-to-live in seconds (10 minutes).
pub const MAX_LOCK_TTL_SECS: i64 = 600;

/// Minimum lock time-to-live in seconds.
pub const MIN_LOCK_TTL_SECS: i64 = 5;

/// How often a client renews the locks it is still editing under (seconds).
pub const DEFAULT_LOCK_RENEW_INTERVAL_SECS: i64 = 10;

// ---------------------------------------------------------------------------
// Presence constants
// ---------------------------------------------------------------------------

/// How often a client announces it is still connected (seconds).
pub const DEFAULT_PRESENCE_HEARTBEAT_SECS: i64 = 10;

/// Presence records not refreshed for this many seconds are evicted.
pub const DEFAULT_PRESENCE_TIMEOUT_SECS: i64 = 30;

/// Window in which two editing intents on one entity count as concurrent.
pub const DEFAULT_CONFLICT_WINDOW_SECS: i64 = 5;

/// Longest accepted entity id.
pub const MAX_ENTITY_ID_LEN: usize = 128;

/// Longest accepted display name.
pub const MAX_USER_NAME_LEN: usize = 80;

/// Cursor colours handed out when a user joins without one.
pub const PRESENCE_COLORS: &[&str] = &[
    "#e11d48", "#2563eb", "#16a34a", "#d97706", "#7c3aed", "#0891b2", "#db2777", "#4d7c0f",
];

// ---------------------------------------------------------------------------
// Entity types
// ---------------------------------------------------------------------------

/// The kinds of entity that can be locked or edited inline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntityType {
    Cell,
    TextBlock,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Cell => "cell",
            EntityType::TextBlock => "text-block",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cell" => Ok(EntityType::Cell),
            "text-block" => Ok(EntityType::TextBlock),
            other => Err(CoreError::Validation(format!(
                "Invalid entity_type '{other}'. Must be one of: cell, text-block"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Validation helpers
// ---------------------------------------------------------------------------

/// Validate an entity id: non-empty, bounded, no whitespace.
pub fn validate_entity_id(entity_id: &str) -> Result<(), CoreError> {
    if entity_id.is_empty() {
        return Err(CoreError::Validation("entity_id must not be empty".into()));
    }
    if entity_id.len() > MAX_ENTITY_ID_LEN {
        return Err(CoreError::Validation(format!(
            "entity_id must be at most {MAX_ENTITY_ID_LEN} characters, got {}",
            entity_id.len()
        )));
    }
    if entity_id.chars().any(char::is_whitespace) {
        return Err(CoreError::Validation(format!(
            "entity_id '{entity_id}' must not contain whitespace"
        )));
    }
    Ok(())
}

/// Document ids appear in relay URLs, so they are restricted to ASCII
/// letters, digits, `-`, `_` and `.`.
pub fn validate_document_id(document_id: &str) -> Result<(), CoreError> {
    if document_id.is_empty() || document_id.len() > MAX_ENTITY_ID_LEN {
        return Err(CoreError::Validation(format!(
            "document_id must be 1 to {MAX_ENTITY_ID_LEN} characters"
        )));
    }
    if !document_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(CoreError::Validation(format!(
            "document_id '{document_id}' contains invalid characters"
        )));
    }
    Ok(())
}

/// Validate a lock TTL in seconds.
pub fn validate_lock_ttl(secs: i64) -> Result<(), CoreError> {
    if secs < MIN_LOCK_TTL_SECS {
        return Err(CoreError::Validation(format!(
            "Lock TTL must be at least {MIN_LOCK_TTL_SECS} seconds, got {secs}"
        )));
    }
    if secs > MAX_LOCK_TTL_SECS {
        return Err(CoreError::Validation(format!(
            "Lock TTL must be at most {MAX_LOCK_TTL_SECS} seconds, got {secs}"
        )));
    }
    Ok(())
}

/// Validate a display name.
pub fn validate_user_name(name: &str) -> Result<(), CoreError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(CoreError::Validation("user_name must not be blank".into()));
    }
    if trimmed.chars().count() > MAX_USER_NAME_LEN {
        return Err(CoreError::Validation(format!(
            "user_name must be at most {MAX_USER_NAME_LEN} characters"
        )));
    }
    Ok(())
}

/// Validate a `#rrggbb` colour.
pub fn validate_color(color: &str) -> Result<(), CoreError> {
    let valid = color.len() == 7
        && color.starts_with('#')
        && color[1..].chars().all(|c| c.is_ascii_hexdigit());
    if valid {
        Ok(())
    } else {
        Err(CoreError::Validation(format!(
            "color must be a #rrggbb hex value, got '{color}'"
        )))
    }
}

/// Pick a stable palette colour for a user.
pub fn color_for(user_id: &str) -> &'static str {
    let hash = user_id
        .bytes()
        .fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(u32::from(b)));
    PRESENCE_COLORS[hash as usize % PRESENCE_COLORS.len()]
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
