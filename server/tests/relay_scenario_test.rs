//! End-to-end tests for the relay over real WebSocket connections.
//!
//! These tests bind the router to a random local port and drive it with
//! `tokio-tungstenite` clients:
//! - Tent join, peer discovery and presence events
//! - Direct and broadcast signaling with `sender_channel` tagging
//! - Heartbeats and routing error reports
//! - Observer snapshots followed by live presence events
//! - Handshake rejection and connect-time close codes

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use goldenhorde_relay::auth::DevAuthenticator;
use goldenhorde_relay::broadcast::GroupBroadcaster;
use goldenhorde_relay::cache::MemoryCache;
use goldenhorde_relay::config::Config;
use goldenhorde_relay::membership::TentMembership;
use goldenhorde_relay::presence::{PresenceCache, PresenceTtl};
use goldenhorde_relay::routes::{create_router, AppState};
use goldenhorde_relay::session::Relay;
use goldenhorde_relay::store::{MemoryTentStore, StoreResult, TentStore};
use goldenhorde_relay::types::{HordeId, Tent, TentId, TentParticipant};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long a test waits for a frame before giving up.
const FRAME_TIMEOUT: Duration = Duration::from_secs(2);

// ============================================================================
// Test Helpers
// ============================================================================

fn tent(id: &str) -> Tent {
    Tent {
        id: TentId::new(id),
        name: format!("Tent {id}"),
        horde_id: HordeId::new("1"),
    }
}

/// Development configuration: identities come from `?username=`.
fn dev_config() -> Config {
    Config {
        port: 0,
        unsafe_no_auth: true,
        auth_tokens: Vec::new(),
        auth_url: None,
        presence_ttl: PresenceTtl::default(),
        cache_sweep_interval: Duration::from_secs(60),
        tents: vec![tent("7"), tent("8")],
    }
}

/// Spawns a test server on a random available port.
async fn spawn_test_server(config: Config) -> (SocketAddr, AppState) {
    serve(AppState::new(config).unwrap()).await
}

async fn serve(state: AppState) -> (SocketAddr, AppState) {
    let app = create_router(state.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (addr, state)
}

async fn join_tent(addr: SocketAddr, tent_id: &str, username: &str) -> Client {
    let url = format!("ws://{addr}/ws/voice_chat/{tent_id}/?username={username}");
    let (client, _) = connect_async(url).await.expect("handshake should succeed");
    client
}

async fn observe(addr: SocketAddr, username: &str) -> Client {
    let url = format!("ws://{addr}/ws/tent-events/?username={username}");
    let (client, _) = connect_async(url).await.expect("handshake should succeed");
    client
}

/// Reads the next text frame as JSON.
async fn next_json(client: &mut Client) -> Value {
    loop {
        let frame = timeout(FRAME_TIMEOUT, client.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("connection closed")
            .expect("websocket error");
        match frame {
            Message::Text(_) => return serde_json::from_str(frame.to_text().unwrap()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

/// Asserts that nothing arrives within a short window.
async fn assert_silent(client: &mut Client) {
    let result = timeout(Duration::from_millis(150), client.next()).await;
    assert!(result.is_err(), "unexpected frame: {result:?}");
}

async fn send_json(client: &mut Client, value: Value) {
    client.send(Message::text(value.to_string())).await.unwrap();
}

// ============================================================================
// Tent sessions
// ============================================================================

#[tokio::test]
async fn two_users_discover_each_other_and_signal() {
    let (addr, _state) = spawn_test_server(dev_config()).await;

    let mut alice = join_tent(addr, "7", "alice").await;
    assert_eq!(
        next_json(&mut alice).await,
        json!({"type": "connect_info", "username": "alice", "other_users": []})
    );

    let mut bob = join_tent(addr, "7", "bob").await;
    assert_eq!(
        next_json(&mut bob).await,
        json!({"type": "connect_info", "username": "bob", "other_users": ["alice"]})
    );
    assert_eq!(
        next_json(&mut alice).await,
        json!({"type": "user_joined", "tent_id": "7", "username": "bob"})
    );

    send_json(
        &mut bob,
        json!({"type": "offer", "target_user": "alice", "sdp": "v=0"}),
    )
    .await;
    let offer = next_json(&mut alice).await;
    assert_eq!(offer["type"], "offer");
    assert_eq!(offer["target_user"], "alice");
    assert_eq!(offer["sdp"], "v=0");
    let bob_channel = offer["sender_channel"].as_str().unwrap().to_string();
    assert!(bob_channel.starts_with("relay."));
    assert_silent(&mut bob).await;

    send_json(&mut alice, json!({"type": "mute", "muted": true})).await;
    let broadcast = next_json(&mut bob).await;
    assert_eq!(broadcast["type"], "mute");
    assert_eq!(broadcast["muted"], true);
    assert!(broadcast["sender_channel"].is_string());
    assert_ne!(broadcast["sender_channel"], bob_channel.as_str());
    assert_silent(&mut alice).await;
}

#[tokio::test]
async fn signal_payload_is_forwarded_verbatim() {
    let (addr, _state) = spawn_test_server(dev_config()).await;
    let mut alice = join_tent(addr, "7", "alice").await;
    next_json(&mut alice).await;
    let mut bob = join_tent(addr, "7", "bob").await;
    next_json(&mut bob).await;
    next_json(&mut alice).await;

    let sent = r#"{"type":"offer","target_user":"alice","seq":123456789012345678901234567890,"zeta":1.50,"alpha":{"b":2,"a":1}}"#;
    bob.send(Message::text(sent)).await.unwrap();

    let frame = timeout(FRAME_TIMEOUT, alice.next()).await.unwrap().unwrap().unwrap();
    let received = frame.to_text().unwrap();
    let prefix = format!("{},\"sender_channel\":\"relay.", &sent[..sent.len() - 1]);
    assert!(received.starts_with(&prefix), "{received}");
}

#[tokio::test]
async fn ping_is_answered_with_verbatim_ts() {
    let (addr, _state) = spawn_test_server(dev_config()).await;
    let mut alice = join_tent(addr, "7", "alice").await;
    next_json(&mut alice).await;

    alice
        .send(Message::text(r#"{"type":"ping","ts":1700000000.250}"#))
        .await
        .unwrap();
    let frame = timeout(FRAME_TIMEOUT, alice.next()).await.unwrap().unwrap().unwrap();
    assert_eq!(frame.to_text().unwrap(), r#"{"type":"pong","ts":1700000000.250}"#);

    send_json(&mut alice, json!({"type": "ping"})).await;
    assert_eq!(next_json(&mut alice).await, json!({"type": "pong", "ts": null}));
}

#[tokio::test]
async fn routing_failures_are_reported_to_sender() {
    let (addr, state) = spawn_test_server(dev_config()).await;
    let mut alice = join_tent(addr, "7", "alice").await;
    next_json(&mut alice).await;

    send_json(&mut alice, json!({"type": "offer", "target_user": "mallory"})).await;
    assert_eq!(
        next_json(&mut alice).await,
        json!({
            "type": "error",
            "target_user": "mallory",
            "message": "mallory is not a participant of this tent"
        })
    );

    // A participant row without a live channel
    let bob = state
        .relay
        .membership
        .join(&TentId::new("7"), "bob")
        .await;
    assert!(bob.is_ok());
    send_json(&mut alice, json!({"type": "offer", "target_user": "bob"})).await;
    assert_eq!(
        next_json(&mut alice).await,
        json!({
            "type": "error",
            "target_user": "bob",
            "message": "bob is not currently connected"
        })
    );
}

#[tokio::test]
async fn malformed_frames_are_dropped_without_closing() {
    let (addr, _state) = spawn_test_server(dev_config()).await;
    let mut alice = join_tent(addr, "7", "alice").await;
    next_json(&mut alice).await;

    alice.send(Message::text("not json")).await.unwrap();
    alice.send(Message::text("[1, 2, 3]")).await.unwrap();
    send_json(&mut alice, json!({"type": "offer", "target_user": 42})).await;
    assert_silent(&mut alice).await;

    send_json(&mut alice, json!({"type": "ping", "ts": 1})).await;
    assert_eq!(next_json(&mut alice).await, json!({"type": "pong", "ts": 1}));
}

#[tokio::test]
async fn leaving_notifies_remaining_peers_and_clears_presence() {
    let (addr, state) = spawn_test_server(dev_config()).await;
    let mut alice = join_tent(addr, "7", "alice").await;
    next_json(&mut alice).await;
    let mut bob = join_tent(addr, "7", "bob").await;
    next_json(&mut bob).await;
    next_json(&mut alice).await;

    assert!(state.relay.presence.get_channel("bob").await.is_some());

    bob.close(None).await.unwrap();
    assert_eq!(
        next_json(&mut alice).await,
        json!({"type": "user_left", "tent_id": "7", "username": "bob"})
    );
    assert!(state.relay.presence.get_channel("bob").await.is_none());
    assert!(state.relay.presence.get_tent("bob").await.is_none());
    assert!(!state
        .relay
        .membership
        .is_participant(&TentId::new("7"), "bob")
        .await
        .unwrap());
}

#[tokio::test]
async fn tents_are_isolated() {
    let (addr, _state) = spawn_test_server(dev_config()).await;
    let mut alice = join_tent(addr, "7", "alice").await;
    next_json(&mut alice).await;
    let mut carol = join_tent(addr, "8", "carol").await;
    assert_eq!(
        next_json(&mut carol).await,
        json!({"type": "connect_info", "username": "carol", "other_users": []})
    );

    send_json(&mut carol, json!({"type": "hello"})).await;
    assert_silent(&mut alice).await;
}

#[tokio::test]
async fn unknown_tent_is_closed_with_4004() {
    let (addr, state) = spawn_test_server(dev_config()).await;
    let mut dave = join_tent(addr, "99", "dave").await;

    let frame = timeout(FRAME_TIMEOUT, dave.next()).await.unwrap().unwrap().unwrap();
    match frame {
        Message::Close(Some(close)) => assert_eq!(u16::from(close.code), 4004),
        other => panic!("expected close frame, got {other:?}"),
    }

    assert!(state.relay.presence.get_channel("dave").await.is_none());
    assert_eq!(state.relay.broadcaster.group_size("voice:99"), 0);
}

// ============================================================================
// Observers
// ============================================================================

#[tokio::test]
async fn observer_gets_snapshot_then_events() {
    let (addr, _state) = spawn_test_server(dev_config()).await;
    let mut alice = join_tent(addr, "7", "alice").await;
    next_json(&mut alice).await;
    let mut bob = join_tent(addr, "7", "bob").await;
    next_json(&mut bob).await;
    next_json(&mut alice).await;

    let mut watcher = observe(addr, "watcher").await;
    assert_eq!(
        next_json(&mut watcher).await,
        json!({"type": "current_tent_users", "tents": {"7": ["alice", "bob"]}})
    );

    let mut carol = join_tent(addr, "8", "carol").await;
    next_json(&mut carol).await;
    assert_eq!(
        next_json(&mut watcher).await,
        json!({"type": "user_joined", "tent_id": "8", "username": "carol"})
    );

    bob.close(None).await.unwrap();
    assert_eq!(
        next_json(&mut watcher).await,
        json!({"type": "user_left", "tent_id": "7", "username": "bob"})
    );
    assert_eq!(next_json(&mut alice).await["type"], "user_left");

    send_json(&mut watcher, json!({"type": "offer", "target_user": "alice"})).await;
    assert_silent(&mut alice).await;
    assert_silent(&mut watcher).await;
}

/// Store whose full participant listing takes a while.
struct SlowSnapshotStore {
    inner: MemoryTentStore,
    delay: Duration,
}

#[async_trait]
impl TentStore for SlowSnapshotStore {
    async fn get_tent(&self, tent_id: &TentId) -> StoreResult<Option<Tent>> {
        self.inner.get_tent(tent_id).await
    }

    async fn get_or_create_participant(
        &self,
        tent_id: &TentId,
        username: &str,
    ) -> StoreResult<TentParticipant> {
        self.inner.get_or_create_participant(tent_id, username).await
    }

    async fn delete_participant(&self, tent_id: &TentId, username: &str) -> StoreResult<bool> {
        self.inner.delete_participant(tent_id, username).await
    }

    async fn list_participants_excluding(
        &self,
        tent_id: &TentId,
        username: &str,
    ) -> StoreResult<Vec<String>> {
        self.inner.list_participants_excluding(tent_id, username).await
    }

    async fn participant_exists(&self, tent_id: &TentId, username: &str) -> StoreResult<bool> {
        self.inner.participant_exists(tent_id, username).await
    }

    async fn list_all_participants(&self) -> StoreResult<Vec<TentParticipant>> {
        tokio::time::sleep(self.delay).await;
        self.inner.list_all_participants().await
    }

    fn backend_name(&self) -> &'static str {
        "slow"
    }
}

#[tokio::test]
async fn observer_snapshot_precedes_events_published_while_reading_it() {
    let config = dev_config();
    let store = SlowSnapshotStore {
        inner: MemoryTentStore::with_tents(config.tents.iter().cloned()),
        delay: Duration::from_millis(300),
    };
    let relay = Relay::new(
        GroupBroadcaster::new(),
        PresenceCache::new(Arc::new(MemoryCache::new()), config.presence_ttl),
        TentMembership::new(Arc::new(store)),
    );
    let (addr, _state) =
        serve(AppState::with_components(config, relay, Arc::new(DevAuthenticator))).await;

    let mut watcher = observe(addr, "watcher").await;
    // Let the observer join its group and start reading the store.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let mut alice = join_tent(addr, "7", "alice").await;
    next_json(&mut alice).await;

    let first = next_json(&mut watcher).await;
    assert_eq!(first["type"], "current_tent_users");
    assert_eq!(first["tents"]["7"], json!(["alice"]));
    assert_eq!(
        next_json(&mut watcher).await,
        json!({"type": "user_joined", "tent_id": "7", "username": "alice"})
    );
}

// ============================================================================
// Handshake authentication
// ============================================================================

#[tokio::test]
async fn anonymous_handshake_is_rejected() {
    let (addr, state) = spawn_test_server(dev_config()).await;

    for url in [
        format!("ws://{addr}/ws/voice_chat/7/"),
        format!("ws://{addr}/ws/tent-events/"),
    ] {
        match connect_async(url.as_str()).await {
            Err(WsError::Http(response)) => assert_eq!(response.status(), 401, "{url}"),
            other => panic!("expected 401 for {url}, got {other:?}"),
        }
    }
    assert_eq!(state.relay.broadcaster.channel_count(), 0);
}

#[tokio::test]
async fn token_header_authenticates() {
    let mut config = dev_config();
    config.unsafe_no_auth = false;
    config.auth_tokens = vec![("tok-alice".to_string(), "alice".to_string())];
    let (addr, _state) = spawn_test_server(config).await;

    let mut request = format!("ws://{addr}/ws/voice_chat/7/")
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert(AUTHORIZATION, "Token tok-alice".parse().unwrap());
    let (mut alice, _) = connect_async(request).await.expect("handshake should succeed");
    assert_eq!(next_json(&mut alice).await["username"], "alice");

    // ?username= is not trusted outside unsafe mode
    match connect_async(format!("ws://{addr}/ws/voice_chat/7/?username=alice")).await {
        Err(WsError::Http(response)) => assert_eq!(response.status(), 401),
        other => panic!("expected 401, got {other:?}"),
    }

    let (mut bob, _) = connect_async(format!("ws://{addr}/ws/tent-events/?token=tok-alice"))
        .await
        .expect("query token should be accepted");
    assert_eq!(next_json(&mut bob).await["type"], "current_tent_users");
}
