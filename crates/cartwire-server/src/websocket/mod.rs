//! WebSocket connection handling.
//!
//! - [`transport`]: the frame-level boundary and its adapters
//! - [`clients`]: the [`ClientManager`](clients::ClientManager) lifecycle
//! - [`heartbeat`]: per-connection liveness ticker
//! - [`handler`]: inbound message dispatch

pub mod clients;
pub mod handler;
pub mod heartbeat;
pub mod transport;
