//! Domain model for real-time document collaboration.
//!
//! Everything in this crate is synchronous and free of I/O so the
//! transport, the client facade and the relay service can share the same
//! state containers and wire protocol:
//!
//! - [`presence::PresenceStore`] -- who is in a document and where their cursor is.
//! - [`locks::LockManager`] -- exclusive, time-bounded edit locks per entity.
//! - [`conflict::ConflictDetector`] -- advisory signals for concurrent editing.
//! - [`replica::DocumentReplica`] -- the three containers plus the rules for
//!   applying local actions and remote events.
//! - [`protocol`] -- the tagged events exchanged on a document channel.

pub mod clock;
pub mod collaboration;
pub mod conflict;
pub mod error;
pub mod locks;
pub mod persistence;
pub mod presence;
pub mod protocol;
pub mod replica;
pub mod settings;
pub mod types;
