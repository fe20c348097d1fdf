//! Collaboration relay library.
//!
//! Exposes the building blocks (config, state, error handling, routes,
//! WebSocket relay) so integration tests and the binary entrypoint can both
//! access them.

pub mod config;
pub mod error;
pub mod handlers;
pub mod relay;
pub mod response;
pub mod routes;
pub mod state;
