//! End-to-end tests driving real WebSocket clients against a bound server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use cartwire_core::payload::{AuthRequest, ChatMessage, Empty};
use cartwire_core::{
    CartItemInput, Envelope, MessageType, Money, Notification, NotificationType, Payload,
    Priority, Scope, SessionId, UserId,
};
use cartwire_server::CartwireServer;
use cartwire_settings::CartwireSettings;
use cartwire_sync::{ProductRef, StockMovement};

const TIMEOUT: Duration = Duration::from_secs(5);

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Boot a server on an ephemeral port with its background tasks running.
async fn boot_server() -> (Arc<CartwireServer>, SocketAddr) {
    boot_server_with(CartwireSettings::default()).await
}

async fn boot_server_with(mut settings: CartwireSettings) -> (Arc<CartwireServer>, SocketAddr) {
    settings.server.host = "127.0.0.1".into();
    settings.server.port = 0;
    settings.server.max_connections = 8;
    let server = Arc::new(CartwireServer::new(settings));
    let _tasks = server.start_background_tasks();
    let (addr, _handle) = server.listen().await.unwrap();
    (server, addr)
}

async fn connect(addr: SocketAddr, session: &str) -> WsStream {
    let url = format!("ws://{addr}/ws?session_id={session}");
    let (mut ws, _) = connect_async(url).await.unwrap();
    let greeting = next_envelope(&mut ws).await;
    assert_eq!(greeting.message_type(), MessageType::Connect);
    ws
}

async fn send(ws: &mut WsStream, envelope: Envelope) {
    let text = envelope.to_json().unwrap();
    ws.send(Message::Text(text.into())).await.unwrap();
}

/// Next envelope, skipping transport-level probes.
async fn next_envelope(ws: &mut WsStream) -> Envelope {
    loop {
        let msg = timeout(TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for a message")
            .expect("stream ended")
            .unwrap();
        match msg {
            Message::Text(text) => return Envelope::from_json(text.as_str()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => {}
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

/// Next envelope of `message_type`, skipping others.
async fn next_of(ws: &mut WsStream, message_type: MessageType) -> Envelope {
    loop {
        let envelope = next_envelope(ws).await;
        if envelope.message_type() == message_type {
            return envelope;
        }
    }
}

fn token(user: &str) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none"}"#);
    let claims = json!({ "user_id": user });
    format!("{header}.{}.sig", URL_SAFE_NO_PAD.encode(claims.to_string()))
}

async fn login(ws: &mut WsStream, user: &str) {
    let auth = Envelope::new(Payload::Auth(AuthRequest { token: token(user) }));
    send(ws, auth).await;
    let reply = next_of(ws, MessageType::AuthSuccess).await;
    assert!(matches!(reply.payload(), Payload::AuthSuccess(g) if g.user_id == Some(UserId::from(user))));
}

// ── Tests ──

#[tokio::test]
async fn greeting_and_ping() {
    let (server, addr) = boot_server().await;
    let mut ws = connect(addr, "s-ping").await;
    assert_eq!(server.clients().connection_count(), 1);

    send(&mut ws, Envelope::new(Payload::Ping(Empty::default()))).await;
    let reply = next_envelope(&mut ws).await;
    assert_eq!(reply.message_type(), MessageType::Pong);
    server.shutdown().shutdown();
}

#[tokio::test]
async fn malformed_input_keeps_connection_open() {
    let (server, addr) = boot_server().await;
    let mut ws = connect(addr, "s-bad").await;

    ws.send(Message::Text("{nope".into())).await.unwrap();
    let reply = next_envelope(&mut ws).await;
    assert!(matches!(reply.payload(), Payload::Error(body) if body.code == "invalid_message"));

    send(&mut ws, Envelope::new(Payload::Ping(Empty::default()))).await;
    assert_eq!(next_envelope(&mut ws).await.message_type(), MessageType::Pong);
    server.shutdown().shutdown();
}

#[tokio::test]
async fn oversized_messages_are_refused() {
    let mut settings = CartwireSettings::default();
    settings.server.max_message_bytes = 1024;
    let (server, addr) = boot_server_with(settings).await;
    let mut ws = connect(addr, "s-big").await;

    // over the payload limit but within the transport limit: error reply
    ws.send(Message::Text("x".repeat(2 * 1024).into())).await.unwrap();
    let reply = next_envelope(&mut ws).await;
    assert!(matches!(reply.payload(), Payload::Error(body) if body.code == "message_too_large"));

    // over the transport limit: the socket is dropped
    let _ = ws.send(Message::Text("x".repeat(64 * 1024).into())).await;
    let closed = timeout(TIMEOUT, async {
        loop {
            match ws.next().await {
                None | Some(Err(_) | Ok(Message::Close(_))) => break,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(closed.is_ok());
    server.shutdown().shutdown();
}

#[tokio::test]
async fn cart_changes_reach_every_tab_of_the_session() {
    let (server, addr) = boot_server().await;
    let mut tab1 = connect(addr, "s-tabs").await;
    let mut tab2 = connect(addr, "s-tabs").await;
    let mut stranger = connect(addr, "s-other").await;

    let add = CartItemInput::new("sku-1", 2, Money::from_cents(1_250));
    send(&mut tab1, Envelope::new(Payload::CartAdd(add))).await;

    for tab in [&mut tab1, &mut tab2] {
        let update = next_of(tab, MessageType::CartUpdate).await;
        let Payload::CartUpdate(state) = update.payload() else {
            unreachable!();
        };
        assert_eq!(state.items.len(), 1);
        assert_eq!(state.subtotal, Money::from_cents(2_500));
    }

    // the other session only hears its own pong
    send(&mut stranger, Envelope::new(Payload::Ping(Empty::default()))).await;
    assert_eq!(next_envelope(&mut stranger).await.message_type(), MessageType::Pong);
    server.shutdown().shutdown();
}

#[tokio::test]
async fn login_merges_carts_across_devices() {
    let (server, addr) = boot_server().await;
    let mut phone = connect(addr, "s-phone").await;
    let mut laptop = connect(addr, "s-laptop").await;

    login(&mut phone, "shopper").await;
    let add = CartItemInput::new("sku-phone", 1, Money::from_cents(500));
    send(&mut phone, Envelope::new(Payload::CartAdd(add))).await;
    let _ = next_of(&mut phone, MessageType::CartUpdate).await;

    let add = CartItemInput::new("sku-laptop", 1, Money::from_cents(700));
    send(&mut laptop, Envelope::new(Payload::CartAdd(add))).await;
    let _ = next_of(&mut laptop, MessageType::CartUpdate).await;

    login(&mut laptop, "shopper").await;
    let merged = server.carts().get_state(&SessionId::from("s-laptop")).unwrap();
    assert_eq!(merged.items.len(), 2);
    assert_eq!(merged.user_id, Some(UserId::from("shopper")));
    assert!(server.carts().get_state(&SessionId::from("s-phone")).is_err());
    server.shutdown().shutdown();
}

#[tokio::test]
async fn chat_relays_between_users() {
    let (server, addr) = boot_server().await;
    let mut alice = connect(addr, "s-alice").await;
    let mut bob = connect(addr, "s-bob").await;
    login(&mut alice, "alice").await;
    login(&mut bob, "bob").await;

    let chat = ChatMessage {
        text: "is this still in stock?".into(),
        sender_id: None,
    };
    send(
        &mut alice,
        Envelope::new(Payload::Chat(chat)).to_user(UserId::from("bob")),
    )
    .await;

    let received = next_of(&mut bob, MessageType::Chat).await;
    let Payload::Chat(chat) = received.payload() else {
        unreachable!();
    };
    assert_eq!(chat.sender_id, Some(UserId::from("alice")));
    server.shutdown().shutdown();
}

#[tokio::test]
async fn inventory_updates_fan_out_to_everyone() {
    let (server, addr) = boot_server().await;
    let mut a = connect(addr, "s-a").await;
    let mut b = connect(addr, "s-b").await;

    let movement = StockMovement::new(ProductRef::new("sku-9"), 10, 3);
    assert!(server.inventory().broadcast_stock_change(movement));

    for ws in [&mut a, &mut b] {
        let update = next_of(ws, MessageType::InventoryUpdate).await;
        let Payload::InventoryUpdate(update) = update.payload() else {
            unreachable!();
        };
        assert_eq!(update.product_id, "sku-9");
        assert_eq!(update.new_quantity, 3);
    }
    server.shutdown().shutdown();
}

#[tokio::test]
async fn urgent_notification_arrives_through_the_queue() {
    let (server, addr) = boot_server().await;
    let mut ws = connect(addr, "s-notify").await;
    login(&mut ws, "buyer").await;

    let notification = Notification::new(
        NotificationType::Alert,
        "orders",
        "Payment failed",
        "Update your card",
    )
    .with_priority(Priority::High);
    let id = server
        .notifications()
        .send_notification(notification, Scope::User(UserId::from("buyer")))
        .await;

    let envelope = next_of(&mut ws, MessageType::Notification).await;
    let Payload::Notification(received) = envelope.payload() else {
        unreachable!();
    };
    assert_eq!(received.id.as_ref(), Some(&id));
    assert_eq!(envelope.priority(), Priority::High);
    server.shutdown().shutdown();
}

#[tokio::test]
async fn shutdown_closes_open_sockets() {
    let (server, addr) = boot_server().await;
    let mut ws = connect(addr, "s-bye").await;

    server.shutdown().shutdown();

    let closed = timeout(TIMEOUT, async {
        loop {
            match ws.next().await {
                None | Some(Err(_) | Ok(Message::Close(_))) => break,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(closed.is_ok());

    let drained = timeout(TIMEOUT, async {
        while server.clients().connection_count() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(drained.is_ok());
}
