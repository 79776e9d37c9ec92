//! Connection registry and fan-out.
//!
//! The [`Hub`] indexes live connections by ID, session and user under one
//! lock. Fan-out serializes the envelope once, snapshots the recipients,
//! releases the lock, then offers the shared text to each recipient with a
//! non-blocking send. A recipient whose channel is full or closed is closed
//! and unregistered; the others are unaffected.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use cartwire_core::{ConnectionId, Envelope, Scope, SessionId, UserId};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::connection::{ClientConnection, ConnectionSnapshot, SendFailure};

/// Relay for every fan-out, e.g. to other server instances.
pub trait Publisher: Send + Sync {
    /// Called once per fan-out after local delivery.
    fn publish(&self, envelope: &Envelope);
}

/// Outcome of one fan-out.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryReport {
    /// Connections selected.
    pub recipients: usize,
    /// Connections that accepted the message.
    pub delivered: usize,
    /// Connections dropped because they could not accept it.
    pub dropped: usize,
}

impl DeliveryReport {
    /// Whether the fan-out counts as delivered for `scope`.
    ///
    /// Targeted scopes need at least one recipient to accept. A global
    /// broadcast succeeds unless a recipient was dropped without any other
    /// recipient accepting.
    pub fn is_delivered(&self, scope: &Scope) -> bool {
        match scope {
            Scope::Broadcast => self.delivered > 0 || self.dropped == 0,
            Scope::Session(_) | Scope::User(_) => self.delivered > 0,
        }
    }
}

/// Read-only counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HubStats {
    /// Registered connections.
    pub connections: usize,
    /// Distinct sessions with at least one connection.
    pub sessions: usize,
    /// Distinct users with at least one connection.
    pub users: usize,
    /// Messages accepted by recipients since start.
    pub delivered_total: u64,
    /// Recipients dropped since start.
    pub dropped_total: u64,
}

#[derive(Default)]
struct Registry {
    connections: HashMap<ConnectionId, Arc<ClientConnection>>,
    by_session: HashMap<SessionId, HashSet<ConnectionId>>,
    by_user: HashMap<UserId, HashSet<ConnectionId>>,
    user_of: HashMap<ConnectionId, UserId>,
}

impl Registry {
    fn index_user(&mut self, user_id: UserId, connection_id: ConnectionId) {
        self.unindex_user(&connection_id);
        let _ = self
            .by_user
            .entry(user_id.clone())
            .or_default()
            .insert(connection_id.clone());
        let _ = self.user_of.insert(connection_id, user_id);
    }

    fn unindex_user(&mut self, connection_id: &ConnectionId) {
        let Some(user_id) = self.user_of.remove(connection_id) else {
            return;
        };
        if let Some(ids) = self.by_user.get_mut(&user_id) {
            let _ = ids.remove(connection_id);
            if ids.is_empty() {
                let _ = self.by_user.remove(&user_id);
            }
        }
    }

    fn lookup(&self, ids: Option<&HashSet<ConnectionId>>) -> Vec<Arc<ClientConnection>> {
        ids.into_iter()
            .flatten()
            .filter_map(|id| self.connections.get(id).cloned())
            .collect()
    }

    fn targets(&self, scope: &Scope) -> Vec<Arc<ClientConnection>> {
        match scope {
            Scope::Broadcast => self.connections.values().cloned().collect(),
            Scope::Session(session_id) => self.lookup(self.by_session.get(session_id)),
            Scope::User(user_id) => self.lookup(self.by_user.get(user_id)),
        }
    }
}

/// Authoritative set of live connections.
#[derive(Default)]
pub struct Hub {
    registry: RwLock<Registry>,
    publisher: Option<Arc<dyn Publisher>>,
    delivered_total: AtomicU64,
    dropped_total: AtomicU64,
}

impl Hub {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a hub that relays every fan-out to `publisher`.
    pub fn with_publisher(publisher: Arc<dyn Publisher>) -> Self {
        Self {
            publisher: Some(publisher),
            ..Self::default()
        }
    }

    // ── Registration ────────────────────────────────────────────────

    /// Register a connection. Registering an ID twice is a no-op and
    /// returns `false`.
    pub fn register(&self, connection: Arc<ClientConnection>) -> bool {
        let id = connection.id().clone();
        let mut reg = self.registry.write();
        if reg.connections.contains_key(&id) {
            return false;
        }
        let _ = reg
            .by_session
            .entry(connection.session_id().clone())
            .or_default()
            .insert(id.clone());
        if let Some(user_id) = connection.user_id() {
            reg.index_user(user_id, id.clone());
        }
        let _ = reg.connections.insert(id.clone(), connection);
        debug!(conn_id = %id, total = reg.connections.len(), "connection registered");
        true
    }

    /// Remove a connection from every index. Unknown IDs are a no-op.
    pub fn unregister(&self, connection_id: &ConnectionId) -> Option<Arc<ClientConnection>> {
        let mut reg = self.registry.write();
        let connection = reg.connections.remove(connection_id)?;
        let session_id = connection.session_id();
        if let Some(ids) = reg.by_session.get_mut(session_id) {
            let _ = ids.remove(connection_id);
            if ids.is_empty() {
                let _ = reg.by_session.remove(session_id);
            }
        }
        reg.unindex_user(connection_id);
        debug!(conn_id = %connection_id, total = reg.connections.len(), "connection unregistered");
        Some(connection)
    }

    /// Re-index a registered connection under `user_id`, replacing any
    /// previous binding. Returns `false` for unknown connections.
    pub fn bind_user(&self, connection_id: &ConnectionId, user_id: &UserId) -> bool {
        let mut reg = self.registry.write();
        if !reg.connections.contains_key(connection_id) {
            return false;
        }
        reg.index_user(user_id.clone(), connection_id.clone());
        true
    }

    /// Handle for one connection.
    pub fn get(&self, connection_id: &ConnectionId) -> Option<Arc<ClientConnection>> {
        self.registry.read().connections.get(connection_id).cloned()
    }

    /// Handles for every registered connection.
    pub fn connections(&self) -> Vec<Arc<ClientConnection>> {
        self.registry.read().connections.values().cloned().collect()
    }

    // ── Fan-out ─────────────────────────────────────────────────────

    /// Deliver to the envelope's own scope.
    pub fn broadcast(&self, envelope: &Envelope) -> DeliveryReport {
        self.broadcast_to_scopes(std::slice::from_ref(envelope.scope()), envelope)
    }

    /// Deliver to every connection.
    pub fn broadcast_all(&self, envelope: &Envelope) -> DeliveryReport {
        self.broadcast_to_scopes(&[Scope::Broadcast], envelope)
    }

    /// Deliver to every connection of a session.
    pub fn broadcast_to_session(&self, session_id: &SessionId, envelope: &Envelope) -> DeliveryReport {
        self.broadcast_to_scopes(&[Scope::Session(session_id.clone())], envelope)
    }

    /// Deliver to every connection of a user.
    pub fn broadcast_to_user(&self, user_id: &UserId, envelope: &Envelope) -> DeliveryReport {
        self.broadcast_to_scopes(&[Scope::User(user_id.clone())], envelope)
    }

    /// Deliver to the union of several scopes, at most once per connection.
    pub fn broadcast_to_scopes(&self, scopes: &[Scope], envelope: &Envelope) -> DeliveryReport {
        let targets = self.snapshot_targets(scopes);
        self.deliver(targets, envelope)
    }

    /// Deliver to the connections of `scope` accepted by `filter`.
    ///
    /// The filter runs after the registry lock is released.
    pub fn broadcast_where(
        &self,
        scope: &Scope,
        envelope: &Envelope,
        filter: impl Fn(&ClientConnection) -> bool,
    ) -> DeliveryReport {
        let targets = self
            .snapshot_targets(std::slice::from_ref(scope))
            .into_iter()
            .filter(|c| filter(c))
            .collect();
        self.deliver(targets, envelope)
    }

    fn snapshot_targets(&self, scopes: &[Scope]) -> Vec<Arc<ClientConnection>> {
        let reg = self.registry.read();
        let mut seen = HashSet::new();
        scopes
            .iter()
            .flat_map(|scope| reg.targets(scope))
            .filter(|c| seen.insert(c.id().clone()))
            .collect()
    }

    fn deliver(&self, targets: Vec<Arc<ClientConnection>>, envelope: &Envelope) -> DeliveryReport {
        let text = match envelope.to_json() {
            Ok(text) => Arc::new(text),
            Err(e) => {
                warn!(message_type = %envelope.message_type(), error = %e, "failed to serialize envelope");
                return DeliveryReport::default();
            }
        };

        let mut report = DeliveryReport {
            recipients: targets.len(),
            ..DeliveryReport::default()
        };
        let mut failed = Vec::new();
        for conn in targets {
            match conn.try_send_text(Arc::clone(&text)) {
                Ok(()) => report.delivered += 1,
                Err(failure) => {
                    let reason = match failure {
                        SendFailure::Full => "outbound buffer full",
                        SendFailure::Closed => "outbound channel closed",
                    };
                    warn!(
                        conn_id = %conn.id(),
                        session_id = %conn.session_id(),
                        reason,
                        "dropping slow or dead connection"
                    );
                    report.dropped += 1;
                    failed.push(conn);
                }
            }
        }

        for conn in failed {
            let _ = conn.close();
            let _ = self.unregister(conn.id());
        }

        let _ = self
            .delivered_total
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        let _ = self
            .dropped_total
            .fetch_add(report.dropped as u64, Ordering::Relaxed);

        if let Some(publisher) = &self.publisher {
            publisher.publish(envelope);
        }

        debug!(
            message_type = %envelope.message_type(),
            scope = %envelope.scope(),
            recipients = report.recipients,
            delivered = report.delivered,
            dropped = report.dropped,
            "fan-out complete"
        );
        report
    }

    // ── Snapshots ───────────────────────────────────────────────────

    /// Registered connections.
    pub fn connection_count(&self) -> usize {
        self.registry.read().connections.len()
    }

    /// Copies of the connections of a session.
    pub fn connections_by_session(&self, session_id: &SessionId) -> Vec<ConnectionSnapshot> {
        self.snapshot_targets(&[Scope::Session(session_id.clone())])
            .iter()
            .map(|c| c.snapshot())
            .collect()
    }

    /// Copies of the connections of a user.
    pub fn connections_by_user(&self, user_id: &UserId) -> Vec<ConnectionSnapshot> {
        self.snapshot_targets(&[Scope::User(user_id.clone())])
            .iter()
            .map(|c| c.snapshot())
            .collect()
    }

    /// Current counters.
    pub fn stats(&self) -> HubStats {
        let reg = self.registry.read();
        HubStats {
            connections: reg.connections.len(),
            sessions: reg.by_session.len(),
            users: reg.by_user.len(),
            delivered_total: self.delivered_total.load(Ordering::Relaxed),
            dropped_total: self.dropped_total.load(Ordering::Relaxed),
        }
    }

    /// Close and unregister every connection.
    pub fn close_all(&self) -> usize {
        let drained: Vec<Arc<ClientConnection>> = {
            let mut reg = self.registry.write();
            reg.by_session.clear();
            reg.by_user.clear();
            reg.user_of.clear();
            reg.connections.drain().map(|(_, c)| c).collect()
        };
        for conn in &drained {
            let _ = conn.close();
        }
        if !drained.is_empty() {
            info!(count = drained.len(), "closed all connections");
        }
        drained.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Outbound;
    use cartwire_core::payload::{ChatMessage, Empty};
    use cartwire_core::{AuthLevel, Payload};
    use parking_lot::Mutex;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn connect(
        hub: &Hub,
        session: &str,
        user: Option<&str>,
        capacity: usize,
    ) -> (Arc<ClientConnection>, mpsc::Receiver<Outbound>) {
        let (conn, rx) =
            ClientConnection::channel(SessionId::from(session), capacity, CancellationToken::new());
        assert!(conn.mark_connected());
        if let Some(u) = user {
            assert!(conn.apply_auth(Some(UserId::from(u)), AuthLevel::Authenticated, Vec::new()));
        }
        assert!(hub.register(conn.clone()));
        (conn, rx)
    }

    fn ping() -> Envelope {
        Envelope::new(Payload::Ping(Empty {}))
    }

    fn received(rx: &mut mpsc::Receiver<Outbound>) -> usize {
        let mut n = 0;
        while rx.try_recv().is_ok() {
            n += 1;
        }
        n
    }

    #[test]
    fn register_is_idempotent() {
        let hub = Hub::new();
        let (conn, _rx) = connect(&hub, "s1", None, 4);
        assert!(!hub.register(conn));
        assert_eq!(hub.connection_count(), 1);
    }

    #[test]
    fn unregister_twice_is_a_no_op() {
        let hub = Hub::new();
        let (conn, _rx) = connect(&hub, "s1", Some("u1"), 4);
        assert!(hub.unregister(conn.id()).is_some());
        assert!(hub.unregister(conn.id()).is_none());
        let stats = hub.stats();
        assert_eq!(stats.connections, 0);
        assert_eq!(stats.sessions, 0);
        assert_eq!(stats.users, 0);
    }

    #[test]
    fn session_fan_out_only_reaches_session() {
        let hub = Hub::new();
        let (_a, mut rx_a) = connect(&hub, "s1", None, 4);
        let (_b, mut rx_b) = connect(&hub, "s1", None, 4);
        let (_c, mut rx_c) = connect(&hub, "s2", None, 4);

        let report = hub.broadcast_to_session(&SessionId::from("s1"), &ping());
        assert_eq!(report.delivered, 2);
        assert_eq!(received(&mut rx_a), 1);
        assert_eq!(received(&mut rx_b), 1);
        assert_eq!(received(&mut rx_c), 0);
    }

    #[test]
    fn user_fan_out_spans_sessions() {
        let hub = Hub::new();
        let (_a, mut rx_a) = connect(&hub, "s1", Some("u1"), 4);
        let (_b, mut rx_b) = connect(&hub, "s2", Some("u1"), 4);
        let (_c, mut rx_c) = connect(&hub, "s3", Some("u2"), 4);

        let report = hub.broadcast_to_user(&UserId::from("u1"), &ping());
        assert_eq!(report.delivered, 2);
        assert_eq!(received(&mut rx_a), 1);
        assert_eq!(received(&mut rx_b), 1);
        assert_eq!(received(&mut rx_c), 0);
    }

    #[test]
    fn full_buffer_drops_only_that_connection() {
        let hub = Hub::new();
        let mut receivers = Vec::new();
        let mut conns = Vec::new();
        for _ in 0..5 {
            let (conn, rx) = connect(&hub, "S", None, 1);
            conns.push(conn);
            receivers.push(rx);
        }
        conns[2].try_send_ping().unwrap();

        let report = hub.broadcast_to_session(&SessionId::from("S"), &ping());
        assert_eq!(report.recipients, 5);
        assert_eq!(report.delivered, 4);
        assert_eq!(report.dropped, 1);
        assert!(conns[2].is_closed());
        assert!(hub.get(conns[2].id()).is_none());
        assert_eq!(hub.connection_count(), 4);
        for (i, rx) in receivers.iter_mut().enumerate() {
            if i != 2 {
                assert_eq!(received(rx), 1);
            }
        }
    }

    #[test]
    fn union_of_scopes_delivers_once_per_connection() {
        let hub = Hub::new();
        let (_a, mut rx_a) = connect(&hub, "s1", Some("u1"), 4);
        let (_b, mut rx_b) = connect(&hub, "s2", Some("u1"), 4);

        let scopes = [
            Scope::Session(SessionId::from("s1")),
            Scope::User(UserId::from("u1")),
        ];
        let report = hub.broadcast_to_scopes(&scopes, &ping());
        assert_eq!(report.recipients, 2);
        assert_eq!(received(&mut rx_a), 1);
        assert_eq!(received(&mut rx_b), 1);
    }

    #[test]
    fn broadcast_uses_envelope_scope() {
        let hub = Hub::new();
        let (_a, mut rx_a) = connect(&hub, "s1", None, 4);
        let (_b, mut rx_b) = connect(&hub, "s2", None, 4);
        let env = ping().to_session(SessionId::from("s2"));
        let _ = hub.broadcast(&env);
        assert_eq!(received(&mut rx_a), 0);
        assert_eq!(received(&mut rx_b), 1);
    }

    #[test]
    fn broadcast_where_filters_recipients() {
        let hub = Hub::new();
        let (a, mut rx_a) = connect(&hub, "s1", None, 4);
        let (_b, mut rx_b) = connect(&hub, "s2", None, 4);
        let keep = a.id().clone();
        let report = hub.broadcast_where(&Scope::Broadcast, &ping(), |c| *c.id() == keep);
        assert_eq!(report.delivered, 1);
        assert_eq!(received(&mut rx_a), 1);
        assert_eq!(received(&mut rx_b), 0);
    }

    #[test]
    fn bind_user_reindexes() {
        let hub = Hub::new();
        let (conn, mut rx) = connect(&hub, "s1", None, 4);
        assert!(hub.bind_user(conn.id(), &UserId::from("u1")));
        assert_eq!(hub.connections_by_user(&UserId::from("u1")).len(), 1);
        assert!(hub.bind_user(conn.id(), &UserId::from("u2")));
        assert!(hub.connections_by_user(&UserId::from("u1")).is_empty());
        let _ = hub.broadcast_to_user(&UserId::from("u2"), &ping());
        assert_eq!(received(&mut rx), 1);
        assert!(!hub.bind_user(&ConnectionId::from("missing"), &UserId::from("u1")));
    }

    #[test]
    fn empty_broadcast_counts_as_delivered_but_targeted_does_not() {
        let hub = Hub::new();
        let report = hub.broadcast_all(&ping());
        assert!(report.is_delivered(&Scope::Broadcast));
        let report = hub.broadcast_to_user(&UserId::from("nobody"), &ping());
        assert!(!report.is_delivered(&Scope::User(UserId::from("nobody"))));
    }

    #[test]
    fn snapshots_are_copies() {
        let hub = Hub::new();
        let (conn, _rx) = connect(&hub, "s1", None, 4);
        let snaps = hub.connections_by_session(&SessionId::from("s1"));
        let _ = hub.unregister(conn.id());
        assert_eq!(snaps.len(), 1);
        assert!(hub.connections_by_session(&SessionId::from("s1")).is_empty());
    }

    struct Recorder(Mutex<Vec<String>>);

    impl Publisher for Recorder {
        fn publish(&self, envelope: &Envelope) {
            self.0.lock().push(envelope.message_type().to_string());
        }
    }

    #[test]
    fn publisher_sees_every_fan_out() {
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let hub = Hub::with_publisher(recorder.clone());
        let chat = Envelope::new(Payload::Chat(ChatMessage {
            text: "hi".into(),
            sender_id: None,
        }));
        let _ = hub.broadcast_all(&chat);
        let _ = hub.broadcast_to_session(&SessionId::from("none"), &ping());
        assert_eq!(*recorder.0.lock(), vec!["chat".to_string(), "ping".to_string()]);
    }

    #[test]
    fn close_all_empties_registry() {
        let hub = Hub::new();
        let (a, _ra) = connect(&hub, "s1", None, 4);
        let (b, _rb) = connect(&hub, "s2", Some("u"), 4);
        assert_eq!(hub.close_all(), 2);
        assert!(a.is_closed() && b.is_closed());
        assert_eq!(hub.stats(), HubStats::default());
    }
}
