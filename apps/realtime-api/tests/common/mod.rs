#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::time;
use tokio_tungstenite::{tungstenite, MaybeTlsStream, WebSocketStream};

use realtime_api::auth::identity::IdentityClaims;
use realtime_api::config::Config;
use realtime_api::db::messages::MessageStore;
use realtime_api::RealtimeServices;

pub const TEST_IDENTITY_SECRET: &str = "test-identity-secret";
pub const TEST_BRIDGE_SECRET: &str = "test-bridge-secret";
pub const TEST_ORIGIN: &str = "http://localhost:3000";

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Configuration with both secrets set and fast sweeps.
pub fn test_config() -> Config {
    Config {
        allowed_origins: vec![TEST_ORIGIN.to_string()],
        identity_secret: Some(TEST_IDENTITY_SECRET.to_string()),
        bridge_secret: Some(TEST_BRIDGE_SECRET.to_string()),
        idle_timeout: Duration::from_secs(60),
        ping_interval: Duration::from_secs(60),
        typing_ttl: Duration::from_secs(5),
        presence_grace: Duration::ZERO,
        ..Config::default()
    }
}

/// Mint an identity token as the auth service would.
pub fn mint_identity(user_id: &str, name: &str) -> String {
    mint_identity_expiring(user_id, name, chrono::Duration::seconds(300))
}

pub fn mint_expired_identity(user_id: &str) -> String {
    mint_identity_expiring(user_id, "Expired User", chrono::Duration::seconds(-300))
}

fn mint_identity_expiring(user_id: &str, name: &str, ttl: chrono::Duration) -> String {
    let claims = IdentityClaims {
        sub: user_id.to_string(),
        name: name.to_string(),
        picture: Some(format!("/avatars/{user_id}.png")),
        exp: (chrono::Utc::now() + ttl).timestamp(),
    };
    jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(TEST_IDENTITY_SECRET.as_bytes()),
    )
    .expect("mint test identity")
}

/// Start the services and serve them on an ephemeral port.
pub async fn start_server(
    config: Config,
    store: Option<Arc<dyn MessageStore>>,
) -> (SocketAddr, RealtimeServices) {
    let services = RealtimeServices::start(config, store);
    let app = services.app();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (addr, services)
}

/// Open a gateway connection and consume the `ready` greeting.
pub async fn connect(addr: SocketAddr, token: Option<&str>) -> (WsStream, Value) {
    let url = match token {
        Some(token) => format!("ws://{addr}/realtime?token={token}"),
        None => format!("ws://{addr}/realtime"),
    };
    let (mut ws, _) = tokio_tungstenite::connect_async(&url)
        .await
        .expect("ws connect");

    let ready = next_event(&mut ws).await;
    assert_eq!(ready["event"], "ready");
    (ws, ready["data"].clone())
}

pub async fn send_event(ws: &mut WsStream, event: &str, data: Value) {
    let frame = serde_json::json!({ "event": event, "data": data });
    send_raw(ws, &frame.to_string()).await;
}

pub async fn send_raw(ws: &mut WsStream, text: &str) {
    ws.send(tungstenite::Message::Text(text.to_string().into()))
        .await
        .expect("ws send");
}

/// Next server event, skipping control frames.
pub async fn next_event(ws: &mut WsStream) -> Value {
    loop {
        let msg = time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timeout waiting for event")
            .expect("stream ended")
            .expect("ws read error");

        match msg {
            tungstenite::Message::Text(text) => {
                return serde_json::from_str(&text).expect("parse event");
            }
            tungstenite::Message::Ping(_) | tungstenite::Message::Pong(_) => continue,
            other => panic!("expected a text frame, got: {other:?}"),
        }
    }
}

/// Assert nothing but control frames arrives within `window`.
pub async fn expect_silence(ws: &mut WsStream, window: Duration) {
    let deadline = time::Instant::now() + window;
    loop {
        match time::timeout_at(deadline, ws.next()).await {
            Err(_elapsed) => return,
            Ok(Some(Ok(tungstenite::Message::Ping(_) | tungstenite::Message::Pong(_)))) => {}
            Ok(other) => panic!("expected silence, got: {other:?}"),
        }
    }
}

/// Read until the server closes; returns the close code if a frame was sent.
pub async fn expect_close(ws: &mut WsStream) -> Option<u16> {
    loop {
        let msg = time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timeout waiting for close");
        match msg {
            Some(Ok(tungstenite::Message::Close(frame))) => {
                return frame.map(|f| u16::from(f.code));
            }
            Some(Ok(_)) => continue,
            Some(Err(_)) | None => return None,
        }
    }
}

/// Let the hub apply frames already written by other connections.
pub async fn settle() {
    time::sleep(Duration::from_millis(100)).await;
}

/// Poll until the hub reports `expected` open connections.
pub async fn wait_for_connections(services: &RealtimeServices, expected: usize) {
    let hub = services.state().hub;
    for _ in 0..50 {
        if hub.stats().await.map(|s| s.connections) == Ok(expected) {
            return;
        }
        time::sleep(Duration::from_millis(20)).await;
    }
    panic!("hub never reached {expected} connections");
}
