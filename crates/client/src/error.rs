use reqcollab_core::error::{CoreError, LockDenied};
use reqcollab_core::persistence::PersistenceError;
use reqcollab_events::TransportError;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Why [`CollabHandle::save_entity`](crate::CollabHandle::save_entity)
/// did not commit.
#[derive(Debug, thiserror::Error)]
pub enum SaveError {
    /// Someone else holds a live lock on the entity.
    #[error(transparent)]
    Locked(#[from] LockDenied),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}
