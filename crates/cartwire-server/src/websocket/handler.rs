//! Inbound message dispatch.
//!
//! Parses each text frame as an [`Envelope`] and routes it by message type
//! to the auth, cart, notification and queue managers. Refusals become
//! `error` replies on the sending connection; nothing here closes a
//! connection.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use cartwire_auth::{SessionAuthManager, permissions};
use cartwire_core::payload::{AuthGranted, AuthRequest, ChatMessage, Empty, ErrorBody};
use cartwire_core::{AuthLevel, Envelope, Payload, UserId};
use cartwire_hub::{AckOutcome, ClientConnection, ReliableQueue};
use cartwire_sync::{CartError, CartManager, NotificationManager};
use tracing::{Span, debug, instrument, warn};

use crate::errors::DispatchError;
use crate::metrics::{WS_DISPATCH_DURATION_SECONDS, WS_ERRORS_TOTAL, WS_MESSAGES_RECEIVED_TOTAL};
use crate::websocket::clients::{ClientManager, InboundHandler};

type DispatchResult = Result<Option<Envelope>, DispatchError>;

/// Routes client requests to the managers that own the state.
pub struct Dispatcher {
    auth: Arc<SessionAuthManager>,
    carts: Arc<CartManager>,
    notifications: Arc<NotificationManager>,
    queue: Arc<ReliableQueue>,
}

impl Dispatcher {
    /// Create a dispatcher over the shared managers.
    pub fn new(
        auth: Arc<SessionAuthManager>,
        carts: Arc<CartManager>,
        notifications: Arc<NotificationManager>,
        queue: Arc<ReliableQueue>,
    ) -> Self {
        Self {
            auth,
            carts,
            notifications,
            queue,
        }
    }

    async fn dispatch(
        &self,
        clients: &ClientManager,
        conn: &ClientConnection,
        envelope: Envelope,
    ) -> DispatchResult {
        let session_id = conn.session_id();
        match envelope.payload() {
            Payload::Ping(_) => Ok(Some(Envelope::new(Payload::Pong(Empty::default())))),
            Payload::Pong(_) => Ok(None),
            Payload::Auth(request) => self.authenticate(clients, conn, request),
            Payload::CartAdd(input) => {
                self.authorize(conn, permissions::CART_WRITE)?;
                let _ = self.carts.add_item(session_id, input.clone())?;
                Ok(None)
            }
            Payload::CartRemove(line) => {
                self.authorize(conn, permissions::CART_WRITE)?;
                let _ = self.carts.remove_item(
                    session_id,
                    &line.product_id,
                    line.variant_id.as_deref(),
                )?;
                Ok(None)
            }
            Payload::CartUpdateQuantity(change) => {
                self.authorize(conn, permissions::CART_WRITE)?;
                let _ = self.carts.update_quantity(
                    session_id,
                    &change.product_id,
                    change.variant_id.as_deref(),
                    change.quantity,
                )?;
                Ok(None)
            }
            Payload::CartClear(_) => {
                self.authorize(conn, permissions::CART_WRITE)?;
                match self.carts.clear_cart(session_id) {
                    Ok(_) => Ok(None),
                    Err(CartError::CartNotFound(_)) => Ok(Some(self.cart_reply(conn))),
                    Err(e) => Err(e.into()),
                }
            }
            Payload::CartGet(_) => {
                self.authorize(conn, permissions::CART_READ)?;
                Ok(Some(self.cart_reply(conn)))
            }
            Payload::Chat(chat) => {
                self.authorize(conn, permissions::CHAT_WRITE)?;
                self.relay_chat(clients, conn, &envelope, chat);
                Ok(None)
            }
            Payload::NotificationRead(read) => {
                let user_id = self.require_user(conn).ok();
                if self
                    .notifications
                    .mark_read(session_id, user_id.as_ref(), &read.notification_id)
                {
                    return Ok(None);
                }
                match user_id {
                    Some(_) => Err(DispatchError::NotificationNotFound(read.notification_id.clone())),
                    None => Err(DispatchError::NotAuthenticated),
                }
            }
            Payload::Ack(ack) => {
                let user_id = conn.user_id();
                match self
                    .queue
                    .acknowledge_from(&ack.ack_id, session_id, user_id.as_ref())
                    .await
                {
                    AckOutcome::Acknowledged => {}
                    AckOutcome::Unknown => {
                        debug!(ack_id = %ack.ack_id, "ack for unknown or settled message");
                    }
                    AckOutcome::NotAddressee => {
                        warn!(ack_id = %ack.ack_id, "ack from a connection outside the message scope");
                    }
                }
                let _ = self.auth.touch(session_id);
                Ok(None)
            }
            Payload::Connect(_)
            | Payload::Disconnect(_)
            | Payload::AuthSuccess(_)
            | Payload::AuthFailed(_)
            | Payload::CartUpdate(_)
            | Payload::InventoryUpdate(_)
            | Payload::InventoryAlert(_)
            | Payload::Notification(_)
            | Payload::Error(_) => Err(DispatchError::Unsupported(envelope.message_type())),
        }
    }

    // ── Auth ────────────────────────────────────────────────────────

    fn authenticate(
        &self,
        clients: &ClientManager,
        conn: &ClientConnection,
        request: &AuthRequest,
    ) -> DispatchResult {
        let result = self.auth.authenticate_token(&request.token);
        if !result.valid {
            let (code, message) = match &result.error {
                Some(e) => (e.code(), e.to_string()),
                None => ("invalid_token", "credential rejected".to_string()),
            };
            warn!(conn_id = %conn.id(), code, "authentication failed");
            return Ok(Some(Envelope::new(Payload::AuthFailed(ErrorBody::new(
                code, message,
            )))));
        }

        let session_id = conn.session_id().clone();
        if result.session_id.as_ref().is_some_and(|claimed| *claimed != session_id) {
            debug!("credential names another session, keeping the connection's");
        }

        let session = self.auth.create_session(
            result.user_id.clone(),
            session_id.clone(),
            result.auth_level,
            result.permissions.clone(),
        );
        clients.authenticate(
            conn.id(),
            result.user_id.clone(),
            result.auth_level,
            result.permissions.clone(),
        )?;

        if let Some(user_id) = &result.user_id {
            let _ = self.carts.link_user(&session_id, user_id);
            match self.carts.merge_cart_states(user_id, &session_id) {
                Ok(_) | Err(CartError::CartNotFound(_)) => {}
                Err(e) => warn!(error = %e, "cart merge on login failed"),
            }
        }

        Ok(Some(Envelope::new(Payload::AuthSuccess(AuthGranted {
            user_id: result.user_id,
            session_id,
            auth_level: result.auth_level,
            permissions: result.permissions,
            expires_at: Some(session.expires_at()),
        }))))
    }

    /// Check `permission` against the session record when one exists,
    /// otherwise against the connection's own grant. Success refreshes the
    /// session's activity.
    fn authorize(&self, conn: &ClientConnection, permission: &'static str) -> Result<(), DispatchError> {
        let session_id = conn.session_id();
        let allowed = if self.auth.get_session(session_id).is_some() {
            self.auth.check_permission(session_id, permission)
        } else {
            conn.has_permission(permission)
        };
        if allowed {
            Ok(())
        } else {
            Err(DispatchError::PermissionDenied(permission))
        }
    }

    fn require_user(&self, conn: &ClientConnection) -> Result<UserId, DispatchError> {
        let Some(user_id) = conn.user_id() else {
            return Err(DispatchError::NotAuthenticated);
        };
        if !self.auth.check_auth_level(conn.session_id(), AuthLevel::Authenticated) {
            return Err(DispatchError::NotAuthenticated);
        }
        Ok(user_id)
    }

    // ── Replies ─────────────────────────────────────────────────────

    fn cart_reply(&self, conn: &ClientConnection) -> Envelope {
        let session_id = conn.session_id();
        let state = self
            .carts
            .get_state(session_id)
            .unwrap_or_else(|_| self.carts.empty_state(session_id));
        Envelope::new(Payload::CartUpdate(state)).on_channel("cart")
    }

    fn relay_chat(
        &self,
        clients: &ClientManager,
        conn: &ClientConnection,
        inbound: &Envelope,
        chat: &ChatMessage,
    ) {
        let mut outbound = Envelope::new(Payload::Chat(ChatMessage {
            text: chat.text.clone(),
            sender_id: conn.user_id(),
        }))
        .with_priority(inbound.priority())
        .with_scope(inbound.scope().clone());
        if let Some(channel) = inbound.channel() {
            outbound = outbound.on_channel(channel);
        }
        let report = clients.hub().broadcast(&outbound);
        debug!(
            scope = %inbound.scope(),
            delivered = report.delivered,
            "chat relayed"
        );
    }
}

#[async_trait]
impl InboundHandler for Dispatcher {
    #[instrument(skip_all, fields(conn_id = %conn.id(), message_type))]
    async fn handle(&self, clients: &ClientManager, conn: &Arc<ClientConnection>, text: &str) {
        let started = Instant::now();
        let reply = match Envelope::from_json(text) {
            Ok(envelope) => {
                let message_type = envelope.message_type();
                let _ = Span::current().record("message_type", message_type.as_str());
                metrics::counter!(WS_MESSAGES_RECEIVED_TOTAL, "message_type" => message_type.as_str())
                    .increment(1);
                match self.dispatch(clients, conn, envelope).await {
                    Ok(reply) => reply,
                    Err(e) => {
                        debug!(code = e.code(), error = %e, "request refused");
                        Some(Envelope::error(e.code(), e.to_string()))
                    }
                }
            }
            Err(e) => {
                warn!(code = e.code(), error = %e, "unparseable inbound message");
                Some(Envelope::error(e.code(), e.to_string()))
            }
        };

        if let Some(reply) = reply {
            if let Payload::Error(body) = reply.payload() {
                metrics::counter!(WS_ERRORS_TOTAL, "code" => body.code.clone()).increment(1);
            }
            if let Err(e) = clients.send_to(conn, &reply) {
                warn!(error = %e, "failed to queue reply");
            }
        }
        metrics::histogram!(WS_DISPATCH_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
    }
}
