//! # cartwire-core
//!
//! Shared vocabulary for the cartwire real-time backbone.
//!
//! - [`envelope`]: the [`Envelope`] exchanged with every connection, its
//!   [`Priority`] and delivery [`Scope`]
//! - [`payload`]: the typed [`Payload`] union tagged by [`MessageType`]
//! - [`models`]: money, auth levels, carts, inventory events, notifications
//! - [`ids`]: branded ID newtypes
//! - [`logging`]: subscriber setup

#![deny(unsafe_code)]

pub mod envelope;
pub mod ids;
pub mod logging;
pub mod models;
pub mod payload;

pub use envelope::{Envelope, EnvelopeError, Priority, Scope};
pub use ids::{ConnectionId, MessageId, NotificationId, SessionId, UserId};
pub use models::{
    AlertSeverity, AlertType, AuthLevel, CartItem, CartItemInput, CartLineRef,
    CartQuantityChange, CartState, InventoryAlert, InventoryUpdate, InventoryUpdateKind, Money,
    Notification, NotificationAction, NotificationType,
};
pub use payload::{MessageType, Payload};
