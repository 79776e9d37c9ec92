//! Typed payload union.
//!
//! Every envelope carries exactly one [`Payload`]. Its serde tag is the wire
//! `type` field and its content is the wire `data` object, so the message
//! type and the shape of `data` can never disagree.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{ConnectionId, NotificationId, SessionId, UserId};
use crate::models::{
    AuthLevel, CartItemInput, CartLineRef, CartQuantityChange, CartState, InventoryAlert,
    InventoryUpdate, Notification,
};

/// Wire names of every envelope type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Server greeting after a socket is accepted.
    Connect,
    /// Server notice that a connection is being closed.
    Disconnect,
    /// Client credential presentation.
    Auth,
    /// Credential accepted.
    AuthSuccess,
    /// Credential rejected.
    AuthFailed,
    /// Chat text.
    Chat,
    /// Client request to add an item.
    CartAdd,
    /// Client request to remove a line.
    CartRemove,
    /// Client request to change a line quantity.
    CartUpdateQuantity,
    /// Client request to clear the cart.
    CartClear,
    /// Client request for the current cart.
    CartGet,
    /// Full cart state pushed by the server.
    CartUpdate,
    /// Stock movement.
    InventoryUpdate,
    /// Threshold breach.
    InventoryAlert,
    /// User notification.
    Notification,
    /// Client marks a notification read.
    NotificationRead,
    /// Client acknowledges a message that required one.
    Ack,
    /// Error reply.
    Error,
    /// Liveness probe.
    Ping,
    /// Liveness reply.
    Pong,
}

impl MessageType {
    /// Every type, in declaration order.
    pub const ALL: [Self; 20] = [
        Self::Connect,
        Self::Disconnect,
        Self::Auth,
        Self::AuthSuccess,
        Self::AuthFailed,
        Self::Chat,
        Self::CartAdd,
        Self::CartRemove,
        Self::CartUpdateQuantity,
        Self::CartClear,
        Self::CartGet,
        Self::CartUpdate,
        Self::InventoryUpdate,
        Self::InventoryAlert,
        Self::Notification,
        Self::NotificationRead,
        Self::Ack,
        Self::Error,
        Self::Ping,
        Self::Pong,
    ];

    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Disconnect => "disconnect",
            Self::Auth => "auth",
            Self::AuthSuccess => "auth_success",
            Self::AuthFailed => "auth_failed",
            Self::Chat => "chat",
            Self::CartAdd => "cart_add",
            Self::CartRemove => "cart_remove",
            Self::CartUpdateQuantity => "cart_update_quantity",
            Self::CartClear => "cart_clear",
            Self::CartGet => "cart_get",
            Self::CartUpdate => "cart_update",
            Self::InventoryUpdate => "inventory_update",
            Self::InventoryAlert => "inventory_alert",
            Self::Notification => "notification",
            Self::NotificationRead => "notification_read",
            Self::Ack => "ack",
            Self::Error => "error",
            Self::Ping => "ping",
            Self::Pong => "pong",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| s.to_owned())
    }
}

/// Payload with no fields. Serializes as `{}`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Empty {}

/// Server greeting.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectInfo {
    /// Assigned connection ID.
    pub connection_id: ConnectionId,
    /// Session the connection belongs to.
    pub session_id: SessionId,
    /// Server clock at accept time.
    pub server_time: DateTime<Utc>,
}

/// Reason a connection is being closed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisconnectInfo {
    /// Short machine-readable reason.
    pub reason: String,
}

/// Credential presented by a client.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthRequest {
    /// Bearer credential; empty means anonymous.
    #[serde(default)]
    pub token: String,
}

/// Accepted credential.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthGranted {
    /// Authenticated user, absent for anonymous sessions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    /// Session the grant applies to.
    pub session_id: SessionId,
    /// Granted level.
    pub auth_level: AuthLevel,
    /// Granted permissions.
    pub permissions: Vec<String>,
    /// Session expiry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Chat text.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Message body.
    pub text: String,
    /// Filled by the server from the sending connection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<UserId>,
}

/// Reference to a notification.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRef {
    /// Notification being referenced.
    pub notification_id: NotificationId,
}

/// Acknowledgment of a message that required one.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckBody {
    /// The `ack_id` of the acknowledged envelope.
    pub ack_id: String,
}

/// Error reply body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Stable snake_case code.
    pub code: String,
    /// Human-readable detail.
    pub message: String,
}

impl ErrorBody {
    /// Build an error body.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Payload of an envelope, tagged by message type.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Payload {
    /// See [`MessageType::Connect`].
    Connect(ConnectInfo),
    /// See [`MessageType::Disconnect`].
    Disconnect(DisconnectInfo),
    /// See [`MessageType::Auth`].
    Auth(AuthRequest),
    /// See [`MessageType::AuthSuccess`].
    AuthSuccess(AuthGranted),
    /// See [`MessageType::AuthFailed`].
    AuthFailed(ErrorBody),
    /// See [`MessageType::Chat`].
    Chat(ChatMessage),
    /// See [`MessageType::CartAdd`].
    CartAdd(CartItemInput),
    /// See [`MessageType::CartRemove`].
    CartRemove(CartLineRef),
    /// See [`MessageType::CartUpdateQuantity`].
    CartUpdateQuantity(CartQuantityChange),
    /// See [`MessageType::CartClear`].
    CartClear(Empty),
    /// See [`MessageType::CartGet`].
    CartGet(Empty),
    /// See [`MessageType::CartUpdate`].
    CartUpdate(CartState),
    /// See [`MessageType::InventoryUpdate`].
    InventoryUpdate(InventoryUpdate),
    /// See [`MessageType::InventoryAlert`].
    InventoryAlert(InventoryAlert),
    /// See [`MessageType::Notification`].
    Notification(Notification),
    /// See [`MessageType::NotificationRead`].
    NotificationRead(NotificationRef),
    /// See [`MessageType::Ack`].
    Ack(AckBody),
    /// See [`MessageType::Error`].
    Error(ErrorBody),
    /// See [`MessageType::Ping`].
    Ping(Empty),
    /// See [`MessageType::Pong`].
    Pong(Empty),
}

impl Payload {
    /// The message type this payload is tagged with.
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Connect(_) => MessageType::Connect,
            Self::Disconnect(_) => MessageType::Disconnect,
            Self::Auth(_) => MessageType::Auth,
            Self::AuthSuccess(_) => MessageType::AuthSuccess,
            Self::AuthFailed(_) => MessageType::AuthFailed,
            Self::Chat(_) => MessageType::Chat,
            Self::CartAdd(_) => MessageType::CartAdd,
            Self::CartRemove(_) => MessageType::CartRemove,
            Self::CartUpdateQuantity(_) => MessageType::CartUpdateQuantity,
            Self::CartClear(_) => MessageType::CartClear,
            Self::CartGet(_) => MessageType::CartGet,
            Self::CartUpdate(_) => MessageType::CartUpdate,
            Self::InventoryUpdate(_) => MessageType::InventoryUpdate,
            Self::InventoryAlert(_) => MessageType::InventoryAlert,
            Self::Notification(_) => MessageType::Notification,
            Self::NotificationRead(_) => MessageType::NotificationRead,
            Self::Ack(_) => MessageType::Ack,
            Self::Error(_) => MessageType::Error,
            Self::Ping(_) => MessageType::Ping,
            Self::Pong(_) => MessageType::Pong,
        }
    }

    /// Split into the wire `data` object.
    pub(crate) fn to_data(&self) -> serde_json::Result<Value> {
        let mut tagged = serde_json::to_value(self)?;
        Ok(tagged
            .get_mut("data")
            .map(Value::take)
            .unwrap_or_else(|| Value::Object(serde_json::Map::new())))
    }

    /// Rebuild from a known type and its wire `data` object.
    pub(crate) fn from_data(message_type: MessageType, data: Value) -> serde_json::Result<Self> {
        let data = if data.is_null() {
            Value::Object(serde_json::Map::new())
        } else {
            data
        };
        serde_json::from_value(serde_json::json!({
            "type": message_type.as_str(),
            "data": data,
        }))
    }
}
