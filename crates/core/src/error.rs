use crate::types::{EntityId, Timestamp, UserId};

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Malformed event: {0}")]
    MalformedEvent(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Outcome of a lock request that could not be granted.
///
/// This is an expected result ("someone else is editing"), not a failure.
/// `current_owner` is `None` when a renewal targets a lock that no longer
/// exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockDenied {
    pub entity_id: EntityId,
    pub current_owner: Option<UserId>,
    pub expires_at: Option<Timestamp>,
}

impl std::fmt::Display for LockDenied {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.current_owner {
            Some(owner) => write!(f, "Entity {} is being edited by {owner}", self.entity_id),
            None => write!(f, "No active lock on entity {}", self.entity_id),
        }
    }
}

impl std::error::Error for LockDenied {}

/// Why a lock action did not go through.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// Another user holds the lock, or the lock to renew is gone.
    #[error(transparent)]
    Denied(#[from] LockDenied),

    /// The request itself is invalid: a bad entity id, or a user who has
    /// not joined the document through this replica.
    #[error(transparent)]
    Invalid(#[from] CoreError),
}

impl LockError {
    /// The denial, when the request was valid but someone else won.
    pub fn denied(&self) -> Option<&LockDenied> {
        match self {
            LockError::Denied(denied) => Some(denied),
            LockError::Invalid(_) => None,
        }
    }
}
