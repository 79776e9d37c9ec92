//! # cartwire-hub
//!
//! Delivery plumbing between domain managers and live connections.
//!
//! - [`connection`]: per-connection handle with a bounded outbound channel
//! - [`hub`]: connection registry indexed by ID, session and user, plus
//!   scoped fan-out
//! - [`queue`]: priority queue with retries, acks and an optional store

#![deny(unsafe_code)]

pub mod connection;
pub mod errors;
pub mod hub;
pub mod queue;

pub use connection::{ClientConnection, ConnectionSnapshot, ConnectionState, Outbound, SendFailure};
pub use errors::QueueError;
pub use hub::{DeliveryReport, Hub, HubStats, Publisher};
pub use queue::{
    AckOutcome, MemoryQueueStore, QueueConfig, QueueEntry, QueueStats, QueueStore,
    ReliableQueue,
};
