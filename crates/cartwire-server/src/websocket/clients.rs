//! Client lifecycle manager.
//!
//! Every accepted transport gets three tasks: a read loop bounded by the
//! heartbeat timeout, a single write loop bounded by the write timeout, and
//! a heartbeat ticker. Whichever task notices a failure first closes the
//! connection; the others observe its cancellation token and exit.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use cartwire_auth::default_permissions;
use cartwire_core::payload::{ConnectInfo, DisconnectInfo};
use cartwire_core::{AuthLevel, ConnectionId, Envelope, Payload, SessionId, UserId};
use cartwire_hub::{ClientConnection, Hub, Outbound, SendFailure};
use cartwire_settings::ServerSettings;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::errors::{ClientError, Result};
use crate::metrics::{
    WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_REJECTED_TOTAL, WS_CONNECTIONS_TOTAL,
    WS_DISCONNECTIONS_TOTAL,
};
use crate::websocket::heartbeat::{HeartbeatResult, run_heartbeat};
use crate::websocket::transport::{Frame, MessageSink, MessageSource};

/// Receives every inbound text frame of every connection.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    /// Handle one text frame from `connection`.
    async fn handle(&self, clients: &ClientManager, connection: &Arc<ClientConnection>, text: &str);
}

/// Lifecycle settings.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Maximum live connections.
    pub max_connections: usize,
    /// Capacity of each outbound channel.
    pub outbound_buffer: usize,
    /// Ping interval.
    pub heartbeat_interval: Duration,
    /// Silence tolerated before a connection is considered dead. Also the
    /// read deadline.
    pub heartbeat_timeout: Duration,
    /// Deadline for one transport write.
    pub write_timeout: Duration,
    /// Inactivity after which the idle sweep closes a connection.
    pub idle_timeout: Duration,
    /// Idle sweep interval.
    pub cleanup_interval: Duration,
    /// Largest accepted inbound text frame.
    pub max_message_bytes: usize,
}

impl From<&ServerSettings> for ClientConfig {
    fn from(s: &ServerSettings) -> Self {
        Self {
            max_connections: s.max_connections,
            outbound_buffer: s.outbound_buffer,
            heartbeat_interval: s.heartbeat_interval(),
            heartbeat_timeout: s.heartbeat_timeout(),
            write_timeout: s.write_timeout(),
            idle_timeout: s.idle_timeout(),
            cleanup_interval: s.cleanup_interval(),
            max_message_bytes: s.max_message_bytes,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::from(&ServerSettings::default())
    }
}

/// Read-only counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientStats {
    /// Live connections.
    pub connections: usize,
    /// Connections accepted since start.
    pub accepted_total: u64,
    /// Connections refused at the limit since start.
    pub rejected_total: u64,
    /// Connections closed since start.
    pub closed_total: u64,
    /// Inbound text frames since start.
    pub inbound_total: u64,
}

/// Owns the per-connection tasks and the connection limit.
pub struct ClientManager {
    config: ClientConfig,
    hub: Arc<Hub>,
    handler: Arc<dyn InboundHandler>,
    cancel: CancellationToken,
    admission: Mutex<()>,
    accepted_total: AtomicU64,
    rejected_total: AtomicU64,
    closed_total: AtomicU64,
    inbound_total: AtomicU64,
}

impl ClientManager {
    /// Create a manager that registers connections with `hub` and routes
    /// inbound frames to `handler`.
    pub fn new(config: ClientConfig, hub: Arc<Hub>, handler: Arc<dyn InboundHandler>) -> Self {
        Self {
            config,
            hub,
            handler,
            cancel: CancellationToken::new(),
            admission: Mutex::new(()),
            accepted_total: AtomicU64::new(0),
            rejected_total: AtomicU64::new(0),
            closed_total: AtomicU64::new(0),
            inbound_total: AtomicU64::new(0),
        }
    }

    /// Active configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Shared hub.
    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    // ── Admission ───────────────────────────────────────────────────

    /// Accept a transport for `session_id`.
    ///
    /// The connection starts with the anonymous grant. It is registered with
    /// the hub, its read, write and heartbeat tasks are spawned, and a
    /// `connect` greeting is queued.
    #[instrument(skip_all, fields(session_id = %session_id))]
    pub fn add_connection<S, K>(
        self: &Arc<Self>,
        source: S,
        sink: K,
        session_id: SessionId,
    ) -> Result<Arc<ClientConnection>>
    where
        S: MessageSource + 'static,
        K: MessageSink + 'static,
    {
        if self.cancel.is_cancelled() {
            return Err(ClientError::ShuttingDown);
        }

        let (conn, rx) = ClientConnection::channel(
            session_id.clone(),
            self.config.outbound_buffer,
            self.cancel.child_token(),
        );

        {
            let _admit = self.admission.lock();
            if self.hub.connection_count() >= self.config.max_connections {
                let _ = self.rejected_total.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(WS_CONNECTIONS_REJECTED_TOTAL).increment(1);
                warn!(max = self.config.max_connections, "connection limit reached");
                return Err(ClientError::CapacityExceeded(self.config.max_connections));
            }
            let _ = conn.mark_connected();
            let _ = conn.apply_auth(
                None,
                AuthLevel::Anonymous,
                default_permissions(AuthLevel::Anonymous),
            );
            let _ = self.hub.register(Arc::clone(&conn));
        }

        let _ = self.accepted_total.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(WS_CONNECTIONS_TOTAL).increment(1);
        metrics::gauge!(WS_CONNECTIONS_ACTIVE).set(self.hub.connection_count() as f64);

        let greeting = Envelope::new(Payload::Connect(ConnectInfo {
            connection_id: conn.id().clone(),
            session_id,
            server_time: Utc::now(),
        }));
        if let Err(e) = self.send_to(&conn, &greeting) {
            warn!(conn_id = %conn.id(), error = %e, "failed to queue greeting");
        }

        let _ = tokio::spawn(write_loop(
            Arc::clone(self),
            Arc::clone(&conn),
            rx,
            Box::new(sink),
        ));
        let _ = tokio::spawn(read_loop(
            Arc::clone(self),
            Arc::clone(&conn),
            Box::new(source),
        ));
        let manager = Arc::clone(self);
        let hb_conn = Arc::clone(&conn);
        let _ = tokio::spawn(async move {
            let interval = manager.config.heartbeat_interval;
            let timeout = manager.config.heartbeat_timeout;
            match run_heartbeat(Arc::clone(&hb_conn), interval, timeout).await {
                HeartbeatResult::TimedOut => {
                    warn!(conn_id = %hb_conn.id(), "heartbeat timed out");
                    let _ = manager.finish(&hb_conn, "heartbeat_timeout");
                }
                HeartbeatResult::ChannelClosed => {
                    let _ = manager.finish(&hb_conn, "channel_closed");
                }
                HeartbeatResult::Cancelled => {}
            }
        });

        info!(conn_id = %conn.id(), "client connected");
        Ok(conn)
    }

    // ── Messaging ───────────────────────────────────────────────────

    /// Queue `envelope` on one connection's outbound channel.
    pub fn send_message(&self, connection_id: &ConnectionId, envelope: &Envelope) -> Result<()> {
        let conn = self
            .hub
            .get(connection_id)
            .ok_or_else(|| ClientError::NotConnected(connection_id.clone()))?;
        self.send_to(&conn, envelope)
    }

    /// Queue `envelope` on `conn`'s outbound channel.
    pub fn send_to(&self, conn: &ClientConnection, envelope: &Envelope) -> Result<()> {
        let text = match envelope.to_json() {
            Ok(text) => Arc::new(text),
            Err(e) => {
                warn!(conn_id = %conn.id(), error = %e, "failed to serialize envelope");
                return Ok(());
            }
        };
        conn.try_send_text(text).map_err(|failure| match failure {
            SendFailure::Full => ClientError::ChannelFull(conn.id().clone()),
            SendFailure::Closed => ClientError::NotConnected(conn.id().clone()),
        })
    }

    // ── Identity ────────────────────────────────────────────────────

    /// Apply an auth grant to a connection and re-index it under the user.
    #[instrument(skip_all, fields(conn_id = %connection_id))]
    pub fn authenticate(
        &self,
        connection_id: &ConnectionId,
        user_id: Option<UserId>,
        auth_level: AuthLevel,
        permissions: Vec<String>,
    ) -> Result<()> {
        let conn = self
            .hub
            .get(connection_id)
            .ok_or_else(|| ClientError::NotConnected(connection_id.clone()))?;
        if !conn.apply_auth(user_id.clone(), auth_level, permissions) {
            return Err(ClientError::NotConnected(connection_id.clone()));
        }
        if let Some(user_id) = &user_id {
            let _ = self.hub.bind_user(connection_id, user_id);
        }
        info!(auth_level = %auth_level, user_id = ?user_id, "connection authenticated");
        Ok(())
    }

    // ── Teardown ────────────────────────────────────────────────────

    /// Close a connection after queueing a `disconnect` notice. Unknown IDs
    /// return `false`.
    pub fn remove_connection(&self, connection_id: &ConnectionId, reason: &str) -> bool {
        let Some(conn) = self.hub.get(connection_id) else {
            return false;
        };
        let notice = Envelope::new(Payload::Disconnect(DisconnectInfo {
            reason: reason.to_string(),
        }));
        let _ = self.send_to(&conn, &notice);
        self.finish(&conn, reason)
    }

    /// Close `conn` and unregister it. Only the first call for a connection
    /// has any effect.
    pub(crate) fn finish(&self, conn: &ClientConnection, reason: &str) -> bool {
        if !conn.close() {
            return false;
        }
        let _ = self.hub.unregister(conn.id());
        let _ = self.closed_total.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(WS_DISCONNECTIONS_TOTAL, "reason" => reason.to_string()).increment(1);
        metrics::gauge!(WS_CONNECTIONS_ACTIVE).set(self.hub.connection_count() as f64);
        info!(
            conn_id = %conn.id(),
            session_id = %conn.session_id(),
            reason,
            "client disconnected"
        );
        true
    }

    /// Close connections idle for longer than the idle timeout.
    pub fn sweep_idle(&self) -> usize {
        let mut closed = 0;
        for conn in self.hub.connections() {
            if conn.idle_for() >= self.config.idle_timeout && self.finish(&conn, "idle_timeout") {
                closed += 1;
            }
        }
        if closed > 0 {
            info!(closed, "idle connections swept");
        }
        closed
    }

    /// Close every connection and refuse new ones.
    pub fn stop(&self) -> usize {
        self.cancel.cancel();
        let mut closed = 0;
        for conn in self.hub.connections() {
            if self.finish(&conn, "server_shutdown") {
                closed += 1;
            }
        }
        info!(closed, "client manager stopped");
        closed
    }

    // ── Introspection ───────────────────────────────────────────────

    /// Handle for one live connection.
    pub fn connection(&self, connection_id: &ConnectionId) -> Option<Arc<ClientConnection>> {
        self.hub.get(connection_id)
    }

    /// Live connections.
    pub fn connection_count(&self) -> usize {
        self.hub.connection_count()
    }

    /// Current counters.
    pub fn stats(&self) -> ClientStats {
        ClientStats {
            connections: self.hub.connection_count(),
            accepted_total: self.accepted_total.load(Ordering::Relaxed),
            rejected_total: self.rejected_total.load(Ordering::Relaxed),
            closed_total: self.closed_total.load(Ordering::Relaxed),
            inbound_total: self.inbound_total.load(Ordering::Relaxed),
        }
    }

    /// Spawn the idle sweep. Cancelling `cancel` also stops the manager.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = time::interval(manager.config.cleanup_interval);
            let _ = ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let _ = manager.sweep_idle();
                    }
                    () = cancel.cancelled() => break,
                }
            }
            let _ = manager.stop();
            debug!("client idle sweep stopped");
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Per-connection tasks
// ─────────────────────────────────────────────────────────────────────────────

async fn read_loop(
    manager: Arc<ClientManager>,
    conn: Arc<ClientConnection>,
    mut source: Box<dyn MessageSource>,
) {
    let cancel = conn.cancel_token().clone();
    let deadline = manager.config.heartbeat_timeout;
    let reason = loop {
        let next = tokio::select! {
            next = time::timeout(deadline, source.read_message()) => next,
            () = cancel.cancelled() => return,
        };
        let frame = match next {
            Err(_) => break "read_timeout",
            Ok(Err(e)) => {
                warn!(conn_id = %conn.id(), error = %e, "read failed");
                break "read_error";
            }
            Ok(Ok(None | Some(Frame::Close))) => break "peer_closed",
            Ok(Ok(Some(frame))) => frame,
        };

        conn.mark_activity();
        let Frame::Text(text) = frame else {
            continue;
        };
        let _ = manager.inbound_total.fetch_add(1, Ordering::Relaxed);
        if text.len() > manager.config.max_message_bytes {
            warn!(conn_id = %conn.id(), bytes = text.len(), "inbound message too large");
            let reply = Envelope::error(
                "message_too_large",
                format!("message exceeds {} bytes", manager.config.max_message_bytes),
            );
            let _ = manager.send_to(&conn, &reply);
            continue;
        }
        manager.handler.handle(&manager, &conn, &text).await;
    };
    let _ = manager.finish(&conn, reason);
}

async fn write_loop(
    manager: Arc<ClientManager>,
    conn: Arc<ClientConnection>,
    mut rx: mpsc::Receiver<Outbound>,
    mut sink: Box<dyn MessageSink>,
) {
    let cancel = conn.cancel_token().clone();
    let deadline = manager.config.write_timeout;
    loop {
        let item = tokio::select! {
            biased;
            item = rx.recv() => item,
            () = cancel.cancelled() => None,
        };
        let Some(item) = item else {
            break;
        };
        if let Err(reason) = write_one(sink.as_mut(), item, deadline).await {
            warn!(conn_id = %conn.id(), reason, "write failed");
            let _ = manager.finish(&conn, reason);
            break;
        }
    }

    // flush what was queued before the close, e.g. a disconnect notice
    while let Ok(item) = rx.try_recv() {
        if write_one(sink.as_mut(), item, deadline).await.is_err() {
            break;
        }
    }
    let _ = time::timeout(deadline, sink.close()).await;
    let _ = manager.finish(&conn, "write_closed");
}

async fn write_one(
    sink: &mut dyn MessageSink,
    item: Outbound,
    deadline: Duration,
) -> std::result::Result<(), &'static str> {
    let frame = match item {
        Outbound::Text(text) => Frame::Text(Arc::unwrap_or_clone(text)),
        Outbound::Ping => Frame::Ping,
    };
    match time::timeout(deadline, sink.write_message(frame)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(_)) => Err("write_error"),
        Err(_) => Err("write_timeout"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::transport::{ChannelPeer, ChannelTransport};
    use assert_matches::assert_matches;
    use cartwire_core::MessageType;
    use cartwire_hub::ConnectionState;

    /// Echoes every text frame back as a chat message.
    struct Echo;

    #[async_trait]
    impl InboundHandler for Echo {
        async fn handle(&self, clients: &ClientManager, conn: &Arc<ClientConnection>, text: &str) {
            let reply = Envelope::new(Payload::Chat(cartwire_core::payload::ChatMessage {
                text: text.to_string(),
                sender_id: None,
            }));
            let _ = clients.send_message(conn.id(), &reply);
        }
    }

    fn config() -> ClientConfig {
        ClientConfig {
            max_connections: 2,
            outbound_buffer: 8,
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(15),
            max_message_bytes: 64,
        }
    }

    fn manager(config: ClientConfig) -> Arc<ClientManager> {
        Arc::new(ClientManager::new(config, Arc::new(Hub::new()), Arc::new(Echo)))
    }

    fn connect(manager: &Arc<ClientManager>, session: &str) -> (Arc<ClientConnection>, ChannelPeer) {
        let (transport, peer) = ChannelTransport::new(16);
        let conn = manager
            .add_connection(transport.source, transport.sink, SessionId::from(session))
            .unwrap();
        (conn, peer)
    }

    async fn next_envelope(peer: &mut ChannelPeer) -> Envelope {
        let text = peer.recv_text().await.unwrap();
        Envelope::from_json(&text).unwrap()
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn greets_with_connect() {
        let manager = manager(config());
        let (conn, mut peer) = connect(&manager, "s1");

        let greeting = next_envelope(&mut peer).await;
        assert_eq!(greeting.message_type(), MessageType::Connect);
        assert_matches!(greeting.payload(), Payload::Connect(info) if info.connection_id == *conn.id());
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert_eq!(manager.connection_count(), 1);
    }

    #[tokio::test]
    async fn capacity_is_enforced() {
        let manager = manager(config());
        let _a = connect(&manager, "s1");
        let _b = connect(&manager, "s2");

        let (transport, _peer) = ChannelTransport::new(4);
        let err = manager
            .add_connection(transport.source, transport.sink, SessionId::from("s3"))
            .unwrap_err();
        assert_matches!(err, ClientError::CapacityExceeded(2));
        assert_eq!(manager.stats().rejected_total, 1);
    }

    #[tokio::test]
    async fn inbound_text_reaches_handler() {
        let manager = manager(config());
        let (_conn, mut peer) = connect(&manager, "s1");
        let _ = next_envelope(&mut peer).await;

        peer.send_text("hi").await.unwrap();
        let reply = next_envelope(&mut peer).await;
        assert_matches!(reply.payload(), Payload::Chat(chat) if chat.text == "hi");
        assert_eq!(manager.stats().inbound_total, 1);
    }

    #[tokio::test]
    async fn oversized_message_gets_error() {
        let manager = manager(config());
        let (conn, mut peer) = connect(&manager, "s1");
        let _ = next_envelope(&mut peer).await;

        peer.send_text("x".repeat(65)).await.unwrap();
        let reply = next_envelope(&mut peer).await;
        assert_matches!(reply.payload(), Payload::Error(body) if body.code == "message_too_large");
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn peer_hang_up_unregisters() {
        let manager = manager(config());
        let (conn, mut peer) = connect(&manager, "s1");
        peer.hang_up();
        settle().await;

        assert!(conn.is_closed());
        assert_eq!(manager.connection_count(), 0);
        assert_eq!(manager.stats().closed_total, 1);
    }

    #[tokio::test]
    async fn send_message_to_unknown_connection() {
        let manager = manager(config());
        let err = manager
            .send_message(&ConnectionId::from("nope"), &Envelope::new(Payload::Ping(Default::default())))
            .unwrap_err();
        assert_matches!(err, ClientError::NotConnected(_));
    }

    #[tokio::test]
    async fn send_message_reports_full_channel() {
        let mut cfg = config();
        cfg.outbound_buffer = 1;
        cfg.write_timeout = Duration::from_secs(3600);
        let manager = manager(cfg);
        let (transport, _peer) = ChannelTransport::new(1);
        let conn = manager
            .add_connection(transport.source, transport.sink, SessionId::from("s1"))
            .unwrap();

        let ping = Envelope::new(Payload::Ping(Default::default()));
        let mut outcome = Ok(());
        for _ in 0..8 {
            outcome = manager.send_message(conn.id(), &ping);
            if outcome.is_err() {
                break;
            }
        }
        assert_matches!(outcome, Err(ClientError::ChannelFull(_)));
    }

    #[tokio::test]
    async fn authenticate_binds_user() {
        let manager = manager(config());
        let (conn, _peer) = connect(&manager, "s1");

        manager
            .authenticate(
                conn.id(),
                Some(UserId::from("u1")),
                AuthLevel::Authenticated,
                vec!["cart:write".into()],
            )
            .unwrap();

        assert_eq!(conn.state(), ConnectionState::Authenticated);
        assert!(conn.has_permission("cart:write"));
        assert_eq!(manager.hub().connections_by_user(&UserId::from("u1")).len(), 1);
    }

    #[tokio::test]
    async fn remove_connection_sends_notice_and_is_idempotent() {
        let manager = manager(config());
        let (conn, mut peer) = connect(&manager, "s1");
        let _ = next_envelope(&mut peer).await;

        assert!(manager.remove_connection(conn.id(), "kicked"));
        assert!(!manager.remove_connection(conn.id(), "kicked"));

        let notice = next_envelope(&mut peer).await;
        assert_matches!(notice.payload(), Payload::Disconnect(info) if info.reason == "kicked");
        assert_eq!(manager.connection_count(), 0);
        assert_eq!(manager.stats().closed_total, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_is_dropped() {
        let manager = manager(config());
        let (conn, _peer) = connect(&manager, "s1");

        time::sleep(Duration::from_secs(31)).await;
        settle().await;

        assert!(conn.is_closed());
        assert_eq!(manager.connection_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn pongs_keep_peer_alive() {
        let manager = manager(config());
        let (conn, peer) = connect(&manager, "s1");

        for _ in 0..6 {
            time::sleep(Duration::from_secs(10)).await;
            peer.send(Frame::Pong).await.unwrap();
            settle().await;
        }
        assert!(!conn.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_writer_hits_write_deadline() {
        let manager = manager(config());
        let (transport, peer) = ChannelTransport::new(1);
        let conn = manager
            .add_connection(transport.source, transport.sink, SessionId::from("s1"))
            .unwrap();

        // the greeting fills the peer inbox; the next write blocks
        let ping = Envelope::new(Payload::Ping(Default::default()));
        manager.send_message(conn.id(), &ping).unwrap();
        time::sleep(Duration::from_secs(6)).await;
        settle().await;

        assert!(conn.is_closed());
        drop(peer);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_sweep_closes_quiet_connections() {
        let mut cfg = config();
        cfg.heartbeat_timeout = Duration::from_secs(3600);
        cfg.idle_timeout = Duration::from_secs(20);
        let manager = manager(cfg);
        let (conn, _peer) = connect(&manager, "s1");

        time::advance(Duration::from_secs(21)).await;
        assert_eq!(manager.sweep_idle(), 1);
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn stop_closes_everything_and_refuses_new() {
        let manager = manager(config());
        let (a, _pa) = connect(&manager, "s1");
        let (b, _pb) = connect(&manager, "s2");

        assert_eq!(manager.stop(), 2);
        assert!(a.is_closed() && b.is_closed());

        let (transport, _peer) = ChannelTransport::new(4);
        let err = manager
            .add_connection(transport.source, transport.sink, SessionId::from("s3"))
            .unwrap_err();
        assert_matches!(err, ClientError::ShuttingDown);
    }

    #[tokio::test(start_paused = true)]
    async fn background_sweep_stops_on_cancel() {
        let manager = manager(config());
        let cancel = CancellationToken::new();
        let handle = manager.start(cancel.clone());
        cancel.cancel();
        handle.await.unwrap();
    }
}
