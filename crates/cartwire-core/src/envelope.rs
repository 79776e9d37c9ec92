//! The message envelope exchanged between the core and every connection.
//!
//! An [`Envelope`] is immutable once built: builder methods consume `self`.
//! Its delivery target is a single [`Scope`], so "session and user at once"
//! is unrepresentable. On the wire it is flat JSON:
//!
//! ```text
//! {id, type, priority, timestamp, session_id?, user_id?, channel?,
//!  data:{...}, metadata?:{...}, requires_ack?, ack_id?}
//! ```
//!
//! Decoding fills a fresh ID, `normal` priority and the current time when
//! those fields are absent.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::ids::{MessageId, SessionId, UserId};
use crate::payload::{ErrorBody, MessageType, Payload};

// ─────────────────────────────────────────────────────────────────────────────
// Priority & scope
// ─────────────────────────────────────────────────────────────────────────────

/// Delivery priority, ordered from least to most urgent.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Background information.
    Low,
    /// Default.
    #[default]
    Normal,
    /// Should overtake normal traffic.
    High,
    /// Must overtake everything.
    Critical,
}

impl Priority {
    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery target of an envelope.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum Scope {
    /// Every live connection.
    #[default]
    Broadcast,
    /// Every connection of one session.
    Session(SessionId),
    /// Every connection of one authenticated user.
    User(UserId),
}

impl Scope {
    /// Whether a connection of `session_id`, signed in as `user_id` if any,
    /// is an addressee.
    pub fn covers(&self, session_id: &SessionId, user_id: Option<&UserId>) -> bool {
        match self {
            Self::Broadcast => true,
            Self::Session(id) => id == session_id,
            Self::User(id) => user_id == Some(id),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Broadcast => f.write_str("broadcast"),
            Self::Session(id) => write!(f, "session:{id}"),
            Self::User(id) => write!(f, "user:{id}"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Failure to decode or encode an envelope.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// Not JSON, or not an envelope-shaped object.
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
    /// The `type` field names no known message type.
    #[error("unknown message type: {0}")]
    UnknownType(String),
    /// The `data` object does not match the declared type.
    #[error("invalid {message_type} payload: {source}")]
    InvalidPayload {
        /// Declared type.
        message_type: MessageType,
        /// Underlying decode error.
        #[source]
        source: serde_json::Error,
    },
    /// Both `session_id` and `user_id` were set.
    #[error("envelope targets both a session and a user")]
    ConflictingScope,
}

impl EnvelopeError {
    /// Stable wire code used in `error` replies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Malformed(_) => "invalid_message",
            Self::UnknownType(_) => "unknown_message_type",
            Self::InvalidPayload { .. } => "invalid_payload",
            Self::ConflictingScope => "conflicting_scope",
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Envelope
// ─────────────────────────────────────────────────────────────────────────────

/// Typed, versioned unit of communication.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(try_from = "WireEnvelope")]
pub struct Envelope {
    id: MessageId,
    payload: Payload,
    priority: Priority,
    timestamp: DateTime<Utc>,
    scope: Scope,
    channel: Option<String>,
    metadata: Option<Map<String, Value>>,
    requires_ack: bool,
    ack_id: Option<String>,
}

impl Envelope {
    /// Build a broadcast envelope with normal priority, a fresh ID and the
    /// current time.
    pub fn new(payload: Payload) -> Self {
        Self {
            id: MessageId::new(),
            payload,
            priority: Priority::Normal,
            timestamp: Utc::now(),
            scope: Scope::Broadcast,
            channel: None,
            metadata: None,
            requires_ack: false,
            ack_id: None,
        }
    }

    /// Build an `error` envelope.
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(Payload::Error(ErrorBody::new(code, message)))
    }

    /// Set the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Replace the delivery scope.
    #[must_use]
    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    /// Target every connection of a session.
    #[must_use]
    pub fn to_session(self, session_id: SessionId) -> Self {
        self.with_scope(Scope::Session(session_id))
    }

    /// Target every connection of a user.
    #[must_use]
    pub fn to_user(self, user_id: UserId) -> Self {
        self.with_scope(Scope::User(user_id))
    }

    /// Label the envelope with a channel.
    #[must_use]
    pub fn on_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    /// Add one metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        let _ = self
            .metadata
            .get_or_insert_with(Map::new)
            .insert(key.into(), value);
        self
    }

    /// Require the client to acknowledge; the ack ID is the envelope ID.
    #[must_use]
    pub fn requiring_ack(mut self) -> Self {
        self.requires_ack = true;
        self.ack_id = Some(self.id.to_string());
        self
    }

    /// Envelope ID.
    pub fn id(&self) -> &MessageId {
        &self.id
    }

    /// Typed payload.
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Consume and return the payload.
    pub fn into_payload(self) -> Payload {
        self.payload
    }

    /// Message type derived from the payload.
    pub fn message_type(&self) -> MessageType {
        self.payload.message_type()
    }

    /// Priority.
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Creation time.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Delivery scope.
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Channel label.
    pub fn channel(&self) -> Option<&str> {
        self.channel.as_deref()
    }

    /// Metadata map.
    pub fn metadata(&self) -> Option<&Map<String, Value>> {
        self.metadata.as_ref()
    }

    /// Whether the client must acknowledge.
    pub fn requires_ack(&self) -> bool {
        self.requires_ack
    }

    /// Acknowledgment ID.
    pub fn ack_id(&self) -> Option<&str> {
        self.ack_id.as_deref()
    }

    /// Decode from wire JSON, distinguishing malformed input from unknown
    /// types and bad payloads.
    pub fn from_json(text: &str) -> Result<Self, EnvelopeError> {
        let wire: WireEnvelope = serde_json::from_str(text)?;
        Self::try_from(wire)
    }

    /// Encode to wire JSON.
    pub fn to_json(&self) -> Result<String, EnvelopeError> {
        let wire = WireEnvelope::from_envelope(self)?;
        Ok(serde_json::to_string(&wire)?)
    }
}

impl Serialize for Envelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        WireEnvelope::from_envelope(self)
            .map_err(serde::ser::Error::custom)?
            .serialize(serializer)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Wire form
// ─────────────────────────────────────────────────────────────────────────────

fn is_false(b: &bool) -> bool {
    !*b
}

#[derive(Serialize, Deserialize)]
struct WireEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<MessageId>,
    #[serde(rename = "type")]
    message_type: String,
    #[serde(default)]
    priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    session_id: Option<SessionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    user_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    channel: Option<String>,
    #[serde(default)]
    data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    metadata: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "is_false")]
    requires_ack: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ack_id: Option<String>,
}

impl WireEnvelope {
    fn from_envelope(env: &Envelope) -> Result<Self, EnvelopeError> {
        let (session_id, user_id) = match &env.scope {
            Scope::Broadcast => (None, None),
            Scope::Session(id) => (Some(id.clone()), None),
            Scope::User(id) => (None, Some(id.clone())),
        };
        Ok(Self {
            id: Some(env.id.clone()),
            message_type: env.message_type().as_str().to_owned(),
            priority: env.priority,
            timestamp: Some(env.timestamp),
            session_id,
            user_id,
            channel: env.channel.clone(),
            data: env.payload.to_data()?,
            metadata: env.metadata.clone(),
            requires_ack: env.requires_ack,
            ack_id: env.ack_id.clone(),
        })
    }
}

impl TryFrom<WireEnvelope> for Envelope {
    type Error = EnvelopeError;

    fn try_from(wire: WireEnvelope) -> Result<Self, Self::Error> {
        let message_type: MessageType = wire
            .message_type
            .parse()
            .map_err(EnvelopeError::UnknownType)?;
        let scope = match (wire.session_id, wire.user_id) {
            (Some(_), Some(_)) => return Err(EnvelopeError::ConflictingScope),
            (Some(session), None) => Scope::Session(session),
            (None, Some(user)) => Scope::User(user),
            (None, None) => Scope::Broadcast,
        };
        let payload = Payload::from_data(message_type, wire.data)
            .map_err(|source| EnvelopeError::InvalidPayload { message_type, source })?;
        Ok(Self {
            id: wire.id.unwrap_or_default(),
            payload,
            priority: wire.priority,
            timestamp: wire.timestamp.unwrap_or_else(Utc::now),
            scope,
            channel: wire.channel,
            metadata: wire.metadata,
            requires_ack: wire.requires_ack,
            ack_id: wire.ack_id,
        })
    }
}
