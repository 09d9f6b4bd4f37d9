//! Shared signaling protocol for Moshimoshi
//!
//! Every WebSocket frame is a JSON object tagged by `type`. Clients send
//! [`ClientMessage`]s; the server answers each request with exactly one
//! [`ServerMessage::Response`] and may push other [`ServerMessage`]s at any
//! time.

pub mod messages;
pub mod types;

pub use messages::*;
pub use types::*;
