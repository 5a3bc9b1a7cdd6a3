//! HTTP route handlers for the relay.
//!
//! This module provides the HTTP API endpoints:
//!
//! - `GET /ws/voice_chat/{tent_id}/` - Tent session (presence and signaling)
//! - `GET /ws/tent-events/` - Horde-wide presence observer
//! - `GET /health` - Health check endpoint
//!
//! Both WebSocket paths also match without the trailing slash.
//!
//! # Architecture
//!
//! All routes share application state through [`AppState`], which contains:
//! - Configuration (including auth settings)
//! - The [`Relay`] collaborators every session works against
//! - The authenticator chain used on every handshake
//! - Server start time for uptime reporting
//!
//! Credentials are checked before the upgrade: anonymous handshakes get a
//! `401` and never reach a session. Tent existence is checked after the
//! upgrade by the session itself, which closes the socket with code `4004`.
//!
//! # Example
//!
//! ```rust,no_run
//! use goldenhorde_relay::routes::{create_router, AppState};
//! use goldenhorde_relay::config::Config;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::from_env().expect("failed to load config");
//!     let state = AppState::new(config).expect("failed to build state");
//!     let app = create_router(state);
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:8000").await.unwrap();
//!     axum::serve(listener, app).await.unwrap();
//! }
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, CloseFrame, Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, trace, warn};

use crate::auth::{AuthChain, Authenticator, ConnectQuery, Credentials, DevAuthenticator, StaticTokenAuthenticator};
use crate::broadcast::{GroupBroadcaster, Outbox};
use crate::cache::MemoryCache;
use crate::config::Config;
use crate::error::{RelayError, Result};
use crate::hub::ObserverSession;
use crate::identity::{AuthError, IdentityClient, RemoteAuthenticator};
use crate::membership::TentMembership;
use crate::message::Dispatch;
use crate::presence::PresenceCache;
use crate::session::{Relay, TentSession};
use crate::store::MemoryTentStore;
use crate::types::{ChannelId, Identity, TentId};

// ============================================================================
// Application State
// ============================================================================

/// Shared application state for all route handlers.
///
/// Cloned for each request handler; every field is a cheap handle onto
/// shared server-wide resources.
#[derive(Clone)]
pub struct AppState {
    /// Server configuration.
    pub config: Arc<Config>,

    /// Broadcaster, presence cache and membership shared by all sessions.
    pub relay: Relay,

    /// Resolves handshake credentials to an identity.
    pub authenticator: Arc<dyn Authenticator>,

    /// In-process cache behind the presence layer, when one is used.
    pub cache: Option<MemoryCache>,

    /// Identity endpoint client, when `GOLDENHORDE_AUTH_URL` is set.
    pub identity: Option<IdentityClient>,

    /// Server start time for uptime calculation.
    pub start_time: Instant,
}

impl AppState {
    /// Creates application state backed by the in-memory cache and store.
    ///
    /// The store is seeded with the configured tents. The authenticator
    /// chain tries the static token table, then the identity endpoint, and
    /// in unsafe mode falls back to the `username` query parameter.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Configuration`] if the identity client cannot be
    /// built.
    pub fn new(config: Config) -> std::result::Result<Self, AuthError> {
        let cache = MemoryCache::new();
        let store = MemoryTentStore::with_tents(config.tents.iter().cloned());
        let relay = Relay::new(
            GroupBroadcaster::new(),
            PresenceCache::new(Arc::new(cache.clone()), config.presence_ttl),
            TentMembership::new(Arc::new(store)),
        );

        let identity = config
            .auth_url
            .as_deref()
            .map(IdentityClient::new)
            .transpose()?;

        let mut chain = AuthChain::new();
        if !config.auth_tokens.is_empty() {
            chain = chain.with(Arc::new(StaticTokenAuthenticator::new(
                config.auth_tokens.iter().cloned(),
            )));
        }
        if let Some(client) = &identity {
            chain = chain.with(Arc::new(RemoteAuthenticator::new(client.clone())));
        }
        if config.unsafe_no_auth {
            chain = chain.with(Arc::new(DevAuthenticator));
        }

        let mut state = Self::with_components(config, relay, Arc::new(chain));
        state.cache = Some(cache);
        state.identity = identity;
        Ok(state)
    }

    /// Creates application state with custom collaborators.
    ///
    /// Useful for testing or when other cache or store backends are used.
    #[must_use]
    pub fn with_components(
        config: Config,
        relay: Relay,
        authenticator: Arc<dyn Authenticator>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            relay,
            authenticator,
            cache: None,
            identity: None,
            start_time: Instant::now(),
        }
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &"<Config>")
            .field("relay", &self.relay)
            .field("authenticator", &self.authenticator.name())
            .field("start_time", &self.start_time)
            .finish()
    }
}

// ============================================================================
// Router
// ============================================================================

/// Creates the application router with all routes configured.
///
/// # Example
///
/// ```rust,no_run
/// use goldenhorde_relay::routes::{create_router, AppState};
/// use goldenhorde_relay::config::Config;
///
/// let config = Config::from_env().expect("failed to load config");
/// let state = AppState::new(config).expect("failed to build state");
/// let router = create_router(state);
/// ```
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/ws/voice_chat/{tent_id}", get(get_voice_chat))
        .route("/ws/voice_chat/{tent_id}/", get(get_voice_chat))
        .route("/ws/tent-events", get(get_tent_events))
        .route("/ws/tent-events/", get(get_tent_events))
        .route("/health", get(get_health))
        .layer(TraceLayer::new_for_http().make_span_with(request_span))
        .with_state(state)
}

/// Request span without the query string, which may carry a token.
fn request_span(request: &axum::http::Request<axum::body::Body>) -> tracing::Span {
    tracing::debug_span!(
        "request",
        method = %request.method(),
        path = %request.uri().path(),
    )
}

// ============================================================================
// Error Response Types
// ============================================================================

/// JSON error response body.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<String>,
}

impl ErrorResponse {
    fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: None,
        }
    }

    fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

fn auth_required() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(ErrorResponse::new("authentication required").with_code("auth_required")),
    )
        .into_response()
}

/// Resolves the handshake to a user, or the `401` response to send instead.
async fn authenticate(
    state: &AppState,
    headers: &HeaderMap,
    query: &ConnectQuery,
) -> std::result::Result<Identity, Response> {
    let credentials = Credentials::from_request(headers, query);
    let identity = state.authenticator.authenticate(&credentials).await;
    if identity.is_anonymous() {
        debug!(has_token = credentials.token.is_some(), "Rejecting anonymous WebSocket handshake");
        return Err(auth_required());
    }
    Ok(identity)
}

// ============================================================================
// GET /ws/voice_chat/{tent_id} - Tent Session
// ============================================================================

/// GET /ws/voice_chat/{tent_id} - Tent session endpoint.
///
/// # Authentication
///
/// `Authorization: Token <t>` / `Bearer <t>` header, or `?token=<t>`. In
/// unsafe mode `?username=<name>` is trusted as well.
///
/// # WebSocket Protocol
///
/// The first frame is `connect_info`. Inbound frames are `ping` or signaling
/// payloads, routed directly when they carry `target_user` and broadcast to
/// the tent otherwise.
///
/// # Responses
///
/// - `101 Switching Protocols` - WebSocket upgrade successful
/// - `401 Unauthorized` - No valid credentials
/// - `404 Not Found` - Tent id is not a word
/// - `426 Upgrade Required` - Not a WebSocket handshake
async fn get_voice_chat(
    State(state): State<AppState>,
    Path(raw_tent_id): Path<String>,
    Query(query): Query<ConnectQuery>,
    headers: HeaderMap,
    ws: std::result::Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let Some(tent_id) = TentId::parse(&raw_tent_id) else {
        debug!(tent_id = %raw_tent_id, "Rejecting malformed tent id");
        return (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new("tent not found").with_code("tent_not_found")),
        )
            .into_response();
    };

    let identity = match authenticate(&state, &headers, &query).await {
        Ok(identity) => identity,
        Err(response) => return response,
    };

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    info!(tent_id = %tent_id, username = identity.username(), "Tent client connecting");

    ws.on_upgrade(move |socket| {
        let (channel, outbox) = state.relay.broadcaster.register();
        let session = TentSession::new(state.relay.clone(), tent_id, channel);
        pump(socket, state.relay, session, outbox, identity)
    })
}

// ============================================================================
// GET /ws/tent-events - Presence Observer
// ============================================================================

/// GET /ws/tent-events - Observer endpoint.
///
/// Same authentication as the tent endpoint. The first frame is
/// `current_tent_users`, followed by every `user_joined` / `user_left`.
async fn get_tent_events(
    State(state): State<AppState>,
    Query(query): Query<ConnectQuery>,
    headers: HeaderMap,
    ws: std::result::Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let identity = match authenticate(&state, &headers, &query).await {
        Ok(identity) => identity,
        Err(response) => return response,
    };

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    info!(username = identity.username(), "Observer client connecting");

    ws.on_upgrade(move |socket| {
        let (channel, outbox) = state.relay.broadcaster.register();
        let session = ObserverSession::new(state.relay.clone(), channel);
        pump(socket, state.relay, session, outbox, identity)
    })
}

// ============================================================================
// Transport pump
// ============================================================================

/// The part of a session the transport drives.
#[async_trait]
trait Pumped: Send {
    fn channel(&self) -> &ChannelId;

    /// Connects the session. A returned frame is written before the outbox.
    async fn connect(&mut self, identity: &Identity) -> Result<Option<Dispatch>>;

    async fn receive(&mut self, text: &str) -> Result<()>;

    async fn disconnect(&mut self, code: Option<u16>);
}

#[async_trait]
impl Pumped for TentSession {
    fn channel(&self) -> &ChannelId {
        TentSession::channel(self)
    }

    async fn connect(&mut self, identity: &Identity) -> Result<Option<Dispatch>> {
        TentSession::connect(self, identity).await.map(|()| None)
    }

    async fn receive(&mut self, text: &str) -> Result<()> {
        TentSession::receive(self, text).await
    }

    async fn disconnect(&mut self, code: Option<u16>) {
        TentSession::disconnect(self, code).await;
    }
}

#[async_trait]
impl Pumped for ObserverSession {
    fn channel(&self) -> &ChannelId {
        ObserverSession::channel(self)
    }

    async fn connect(&mut self, identity: &Identity) -> Result<Option<Dispatch>> {
        ObserverSession::connect(self, identity).await
    }

    async fn receive(&mut self, text: &str) -> Result<()> {
        ObserverSession::receive(self, text).await
    }

    async fn disconnect(&mut self, code: Option<u16>) {
        ObserverSession::disconnect(self, code).await;
    }
}

/// Drives one upgraded connection until either side closes it.
///
/// The session connects before the writer starts, so its first frames wait
/// in the outbox. A greeting returned by `connect` goes out ahead of them.
/// The read loop awaits each `receive` before reading the next frame.
async fn pump<S: Pumped>(
    socket: WebSocket,
    relay: Relay,
    mut session: S,
    mut outbox: Outbox,
    identity: Identity,
) {
    let (mut sender, mut receiver) = socket.split();
    let channel = session.channel().clone();

    let greeting = match session.connect(&identity).await {
        Ok(greeting) => greeting,
        Err(err) => {
            warn!(channel = %channel, error = %err, "Closing connection after failed connect");
            relay.broadcaster.unregister(&channel);
            let frame = CloseFrame {
                code: err.close_code(),
                reason: close_reason(&err).into(),
            };
            if let Err(err) = sender.send(Message::Close(Some(frame))).await {
                debug!(channel = %channel, error = %err, "Failed to send close frame");
            }
            return;
        }
    };

    if let Some(greeting) = greeting {
        trace!(channel = %channel, "Sending greeting to WebSocket client");
        if let Err(err) = sender.send(Message::Text(greeting.text.into())).await {
            debug!(channel = %channel, error = %err, "Failed to send greeting");
        }
    }

    // Forward outbox frames to the client
    let forward_channel = channel.clone();
    let forward_task = tokio::spawn(async move {
        while let Some(dispatch) = outbox.recv().await {
            trace!(channel = %forward_channel, "Sending frame to WebSocket client");
            if let Err(err) = sender.send(Message::Text(dispatch.text.clone().into())).await {
                debug!(channel = %forward_channel, error = %err, "Failed to send frame to WebSocket client");
                break;
            }
        }
    });

    let mut close_code = None;
    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                if let Err(err) = session.receive(text.as_str()).await {
                    debug!(channel = %channel, error = %err, "Inbound frame dropped");
                }
            }
            Ok(Message::Close(frame)) => {
                close_code = frame.map(|frame| frame.code);
                debug!(channel = %channel, code = ?close_code, "WebSocket client sent close frame");
                break;
            }
            Ok(Message::Ping(data)) => {
                // axum handles pong automatically
                trace!(data_len = data.len(), "Received ping");
            }
            Ok(_) => {
                // Binary and pong frames carry nothing for the relay
            }
            Err(err) => {
                debug!(channel = %channel, error = %err, "WebSocket error");
                break;
            }
        }
    }

    session.disconnect(close_code).await;
    // Dropping the registry's sender ends the writer once the outbox drains.
    relay.broadcaster.unregister(&channel);
    if let Err(err) = forward_task.await {
        debug!(channel = %channel, error = %err, "Writer task ended abnormally");
    }
}

fn close_reason(err: &RelayError) -> &'static str {
    match err {
        RelayError::AuthRequired => "authentication required",
        RelayError::TentNotFound(_) => "tent not found",
        _ => "internal error",
    }
}

// ============================================================================
// GET /health - Health Check
// ============================================================================

/// Response body for health check endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Server status (always "ok" if responding).
    pub status: String,

    /// Number of registered WebSocket channels.
    pub connections: usize,

    /// Number of non-empty broadcast groups.
    pub groups: usize,

    /// Server uptime in seconds.
    pub uptime_seconds: u64,
}

/// GET /health - Health check endpoint.
///
/// No authentication required.
///
/// # Response
///
/// ```json
/// {
///   "status": "ok",
///   "connections": 12,
///   "groups": 4,
///   "uptime_seconds": 3600
/// }
/// ```
async fn get_health(State(state): State<AppState>) -> Json<HealthResponse> {
    let broadcaster = &state.relay.broadcaster;

    Json(HealthResponse {
        status: "ok".to_string(),
        connections: broadcaster.channel_count(),
        groups: broadcaster.group_count(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
    })
}

// ============================================================================
// Tests
// ============================================================================
