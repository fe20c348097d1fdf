//! WebSocket relay: one in-process channel per document, bridged to every
//! socket connected to that document.

pub mod connections;
pub mod handler;
pub mod heartbeat;

pub use connections::{ConnectionManager, RelayConnection, RelaySender};
pub use handler::relay_handler;
pub use heartbeat::start_heartbeat;
