//! Realtime transport for document channels.
//!
//! - [`RealtimeChannel`] -- one logical channel per document: publish
//!   fire-and-forget, receive [`TransportSignal`]s in arrival order.
//! - [`Transport`] -- opens channels; implemented by [`LocalHub`]
//!   (in-process, also used by the relay) and [`WsTransport`] (WebSocket
//!   client to the relay).

pub mod channel;
pub mod hub;
pub mod ws;

pub use channel::{ConnectionStatus, RealtimeChannel, Transport, TransportError, TransportSignal};
pub use hub::LocalHub;
pub use ws::WsTransport;
