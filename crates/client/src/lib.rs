//! Client-side collaboration sessions.
//!
//! A [`SessionRegistry`] keeps one [`DocumentSession`] (replica plus
//! channel) per document and hands out [`CollabHandle`]s. UI components hold
//! handles; handles for the same document share one subscription.
//! [`heartbeat::start_heartbeat`] drives the periodic reconciliation tick.

pub mod error;
pub mod handle;
pub mod heartbeat;
pub mod registry;
pub mod session;

pub use error::{SaveError, SessionError};
pub use handle::CollabHandle;
pub use registry::SessionRegistry;
pub use session::DocumentSession;
