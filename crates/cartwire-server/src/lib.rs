//! # cartwire-server
//!
//! Axum HTTP + WebSocket front end of the cartwire backbone.
//!
//! - [`websocket`]: transport boundary, client lifecycle, heartbeat and
//!   inbound dispatch
//! - [`server`]: [`CartwireServer`] wiring and the HTTP routes
//!   (`/health`, `/stats`, `/metrics`, `/ws`)
//! - [`metrics`]: Prometheus recorder and metric names
//! - [`shutdown`]: graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod errors;
pub mod health;
pub mod metrics;
pub mod server;
pub mod shutdown;
pub mod websocket;

pub use errors::{ClientError, DispatchError, TransportError};
pub use server::{AppState, CartwireServer, ServerStats};
pub use shutdown::{DrainReport, ShutdownCoordinator};
pub use websocket::clients::{ClientConfig, ClientManager, ClientStats, InboundHandler};
pub use websocket::handler::Dispatcher;
pub use websocket::transport::{
    ChannelPeer, ChannelTransport, Frame, MessageSink, MessageSource, split_websocket,
};
