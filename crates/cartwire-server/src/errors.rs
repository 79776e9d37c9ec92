//! Server error types.

use cartwire_core::{ConnectionId, MessageType, NotificationId};
use cartwire_sync::CartError;
use thiserror::Error;

/// Failures of the client lifecycle manager.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ClientError {
    /// The connection limit is reached.
    #[error("connection limit of {0} reached")]
    CapacityExceeded(usize),

    /// The connection's outbound channel is full.
    #[error("outbound channel full for connection {0}")]
    ChannelFull(ConnectionId),

    /// The connection is unknown or already closed.
    #[error("connection not connected: {0}")]
    NotConnected(ConnectionId),

    /// The manager has been stopped.
    #[error("client manager is shutting down")]
    ShuttingDown,
}

impl ClientError {
    /// Stable wire code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::CapacityExceeded(_) => "capacity_exceeded",
            Self::ChannelFull(_) => "channel_full",
            Self::NotConnected(_) => "not_connected",
            Self::ShuttingDown => "shutting_down",
        }
    }
}

/// Failures reported by a transport half.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The transport is closed.
    #[error("transport closed")]
    Closed,

    /// A binary frame did not hold UTF-8 text.
    #[error("binary frame is not valid UTF-8")]
    InvalidUtf8,

    /// The underlying WebSocket failed.
    #[error("websocket error: {0}")]
    WebSocket(#[from] axum::Error),
}

/// Reasons an inbound request is refused. Each maps to an `error` reply.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The connection lacks a permission, or its session was revoked.
    #[error("permission denied: {0}")]
    PermissionDenied(&'static str),

    /// The request needs an authenticated user.
    #[error("authentication required")]
    NotAuthenticated,

    /// Clients may not send this message type.
    #[error("message type {0} is not accepted from clients")]
    Unsupported(MessageType),

    /// No active notification with this ID is addressed to the user.
    #[error("notification not found: {0}")]
    NotificationNotFound(NotificationId),

    /// The cart manager refused the request.
    #[error(transparent)]
    Cart(#[from] CartError),

    /// The connection could not be updated.
    #[error(transparent)]
    Client(#[from] ClientError),
}

impl DispatchError {
    /// Stable wire code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::PermissionDenied(_) => "permission_denied",
            Self::NotAuthenticated => "not_authenticated",
            Self::Unsupported(_) => "unsupported_message_type",
            Self::NotificationNotFound(_) => "notification_not_found",
            Self::Cart(e) => e.code(),
            Self::Client(e) => e.code(),
        }
    }
}

/// Result type for lifecycle operations.
pub type Result<T> = std::result::Result<T, ClientError>;
