//! Per-connection handle shared between the hub and the lifecycle manager.
//!
//! A [`ClientConnection`] owns the sending half of the connection's bounded
//! outbound channel and its lifecycle state. The write loop that drains the
//! channel lives with whoever accepted the socket.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use cartwire_core::{AuthLevel, ConnectionId, SessionId, UserId};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Lifecycle of a connection. `Disconnected` is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Accepted, not yet registered.
    Connecting,
    /// Registered and receiving broadcasts.
    Connected,
    /// Bound to an authenticated user.
    Authenticated,
    /// Closed.
    Disconnected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Authenticated => "authenticated",
            Self::Disconnected => "disconnected",
        })
    }
}

/// Item on a connection's outbound channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outbound {
    /// Serialized envelope, shared across every recipient of a fan-out.
    Text(Arc<String>),
    /// Heartbeat probe.
    Ping,
}

/// Why a non-blocking send failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendFailure {
    /// The outbound channel is at capacity.
    Full,
    /// The write loop has gone away or the connection is closed.
    Closed,
}

#[derive(Debug)]
struct Identity {
    state: ConnectionState,
    user_id: Option<UserId>,
    auth_level: AuthLevel,
    permissions: BTreeSet<String>,
}

/// A live client socket as seen by the core.
pub struct ClientConnection {
    id: ConnectionId,
    session_id: SessionId,
    identity: Mutex<Identity>,
    tx: mpsc::Sender<Outbound>,
    cancel: CancellationToken,
    connected_at: DateTime<Utc>,
    last_activity: Mutex<Instant>,
    sent_messages: AtomicU64,
    dropped_messages: AtomicU64,
}

impl fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConnection")
            .field("id", &self.id)
            .field("session_id", &self.session_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ClientConnection {
    /// Create a connection in the `Connecting` state.
    pub fn new(
        id: ConnectionId,
        session_id: SessionId,
        tx: mpsc::Sender<Outbound>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            session_id,
            identity: Mutex::new(Identity {
                state: ConnectionState::Connecting,
                user_id: None,
                auth_level: AuthLevel::Anonymous,
                permissions: BTreeSet::new(),
            }),
            tx,
            cancel,
            connected_at: Utc::now(),
            last_activity: Mutex::new(Instant::now()),
            sent_messages: AtomicU64::new(0),
            dropped_messages: AtomicU64::new(0),
        }
    }

    /// Create a connection with a fresh channel of `capacity`, returning the
    /// receiving half for the write loop.
    pub fn channel(
        session_id: SessionId,
        capacity: usize,
        cancel: CancellationToken,
    ) -> (Arc<Self>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let conn = Arc::new(Self::new(ConnectionId::new(), session_id, tx, cancel));
        (conn, rx)
    }

    /// Connection ID.
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Owning session.
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Bound user, once authenticated.
    pub fn user_id(&self) -> Option<UserId> {
        self.identity.lock().user_id.clone()
    }

    /// Current auth level.
    pub fn auth_level(&self) -> AuthLevel {
        self.identity.lock().auth_level
    }

    /// Whether the connection holds `permission`. Admins hold every
    /// permission.
    pub fn has_permission(&self, permission: &str) -> bool {
        let identity = self.identity.lock();
        identity.auth_level == AuthLevel::Admin || identity.permissions.contains(permission)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.identity.lock().state
    }

    /// Whether the connection reached `Disconnected`.
    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Disconnected
    }

    /// Token cancelled when the connection closes.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// `Connecting → Connected`. Returns whether the transition happened.
    pub fn mark_connected(&self) -> bool {
        let mut identity = self.identity.lock();
        if identity.state == ConnectionState::Connecting {
            identity.state = ConnectionState::Connected;
            true
        } else {
            false
        }
    }

    /// Apply an auth grant.
    ///
    /// A grant with a user moves to `Authenticated`; a grant without one
    /// moves back to `Connected`. Returns `false` if the connection is not
    /// connected.
    pub fn apply_auth(
        &self,
        user_id: Option<UserId>,
        auth_level: AuthLevel,
        permissions: impl IntoIterator<Item = String>,
    ) -> bool {
        let mut identity = self.identity.lock();
        if !matches!(
            identity.state,
            ConnectionState::Connected | ConnectionState::Authenticated
        ) {
            return false;
        }
        identity.state = if user_id.is_some() {
            ConnectionState::Authenticated
        } else {
            ConnectionState::Connected
        };
        identity.user_id = user_id;
        identity.auth_level = auth_level;
        identity.permissions = permissions.into_iter().collect();
        true
    }

    /// Move to `Disconnected` and cancel the connection's tasks.
    ///
    /// Returns `true` only for the call that performed the transition.
    pub fn close(&self) -> bool {
        let was_open = {
            let mut identity = self.identity.lock();
            std::mem::replace(&mut identity.state, ConnectionState::Disconnected)
                != ConnectionState::Disconnected
        };
        self.cancel.cancel();
        was_open
    }

    /// Non-blocking enqueue of a serialized envelope.
    pub fn try_send_text(&self, text: Arc<String>) -> Result<(), SendFailure> {
        self.try_send(Outbound::Text(text))
    }

    /// Non-blocking enqueue of a heartbeat probe.
    pub fn try_send_ping(&self) -> Result<(), SendFailure> {
        self.try_send(Outbound::Ping)
    }

    fn try_send(&self, item: Outbound) -> Result<(), SendFailure> {
        if self.is_closed() {
            return Err(SendFailure::Closed);
        }
        match self.tx.try_send(item) {
            Ok(()) => {
                let _ = self.sent_messages.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
                Err(match e {
                    TrySendError::Full(_) => SendFailure::Full,
                    TrySendError::Closed(_) => SendFailure::Closed,
                })
            }
        }
    }

    /// Record inbound traffic.
    pub fn mark_activity(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Time since the last inbound traffic.
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Accept time.
    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Items accepted onto the outbound channel.
    pub fn sent_count(&self) -> u64 {
        self.sent_messages.load(Ordering::Relaxed)
    }

    /// Items refused by the outbound channel.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Read-only copy for stats and admin views.
    pub fn snapshot(&self) -> ConnectionSnapshot {
        let identity = self.identity.lock();
        ConnectionSnapshot {
            connection_id: self.id.clone(),
            session_id: self.session_id.clone(),
            user_id: identity.user_id.clone(),
            auth_level: identity.auth_level,
            state: identity.state,
            connected_at: self.connected_at,
            sent_messages: self.sent_count(),
            dropped_messages: self.drop_count(),
        }
    }
}

/// Point-in-time copy of a connection's observable fields.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSnapshot {
    /// Connection ID.
    pub connection_id: ConnectionId,
    /// Owning session.
    pub session_id: SessionId,
    /// Bound user.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    /// Auth level.
    pub auth_level: AuthLevel,
    /// Lifecycle state.
    pub state: ConnectionState,
    /// Accept time.
    pub connected_at: DateTime<Utc>,
    /// Items accepted onto the outbound channel.
    pub sent_messages: u64,
    /// Items refused by the outbound channel.
    pub dropped_messages: u64,
}
