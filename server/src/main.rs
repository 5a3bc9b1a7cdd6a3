//! Golden Horde relay - Main entry point.
//!
//! This binary starts the relay with:
//! - Structured JSON logging for production
//! - Graceful shutdown handling (SIGTERM/SIGINT)
//! - Background sweep of expired presence entries
//!
//! # Configuration
//!
//! See [`goldenhorde_relay::config`] for environment variable configuration.
//!
//! # Example
//!
//! ```bash
//! # Development mode (identity from ?username=)
//! GOLDENHORDE_UNSAFE_NO_AUTH=true GOLDENHORDE_TENTS="1:1:Lobby" \
//!     cargo run --bin goldenhorde-relay
//!
//! # Production mode
//! GOLDENHORDE_AUTH_URL="https://hordes.example" \
//! GOLDENHORDE_TENTS="1:1:Lobby,2:1:War Room" \
//! PORT=8000 \
//! cargo run --release --bin goldenhorde-relay
//! ```

use std::process::ExitCode;

use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use goldenhorde_relay::config::Config;
use goldenhorde_relay::routes::{create_router, AppState};

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize structured logging
    init_logging();

    // Load configuration
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "Failed to load configuration");
            eprintln!("Error: {err}");
            eprintln!();
            eprintln!("Required environment variables (when auth enabled, at least one):");
            eprintln!("  GOLDENHORDE_AUTH_TOKENS      - Format: token1:user1,token2:user2");
            eprintln!("  GOLDENHORDE_AUTH_URL         - Base URL of the identity API");
            eprintln!();
            eprintln!("Optional environment variables:");
            eprintln!("  PORT                         - HTTP server port (default: 8000)");
            eprintln!("  RUST_LOG                     - Log level filter (default: info)");
            eprintln!("  GOLDENHORDE_UNSAFE_NO_AUTH   - Trust ?username= (dev only, set to 'true')");
            eprintln!("  GOLDENHORDE_TENTS            - Format: id:horde_id:name,...");
            eprintln!("  WS_CACHE_TTL                 - Default presence TTL in seconds (default: 3600)");
            eprintln!("  WS_CACHE_EXTENDED_TTL        - Active presence TTL in seconds (default: 86400)");
            eprintln!("  GOLDENHORDE_CACHE_SWEEP_SECS - Expired entry sweep interval (default: 60)");
            return ExitCode::from(1);
        }
    };

    // Log startup information
    let auth_mode = if config.unsafe_no_auth {
        "disabled (UNSAFE)"
    } else {
        "enabled"
    };
    info!(
        port = config.port,
        auth_mode = auth_mode,
        static_token_count = config.auth_tokens.len(),
        remote_identity = config.auth_url.is_some(),
        tent_count = config.tents.len(),
        default_ttl_secs = config.presence_ttl.default.as_secs(),
        active_ttl_secs = config.presence_ttl.active.as_secs(),
        "Golden Horde relay starting"
    );

    // Create application state
    let state = match AppState::new(config.clone()) {
        Ok(state) => state,
        Err(err) => {
            error!(error = %err, "Failed to initialize application state");
            return ExitCode::from(1);
        }
    };

    // Make sure the identity endpoint answers before accepting connections
    if let Some(identity) = &state.identity {
        match identity.probe_with_retry().await {
            Ok(()) => info!(base_url = identity.base_url(), "Identity endpoint reachable"),
            Err(err) => {
                error!(error = %err, base_url = identity.base_url(), "Identity endpoint unreachable");
                return ExitCode::from(1);
            }
        }
    }

    // Spawn presence cache sweep task
    let cleanup_handle = state
        .cache
        .as_ref()
        .map(|cache| cache.spawn_cleanup_task(config.cache_sweep_interval));
    info!(
        interval_secs = config.cache_sweep_interval.as_secs(),
        "Presence cache sweep task started"
    );

    let presence = state.relay.presence.clone();

    // Create router
    let app = create_router(state);

    // Bind to address
    let bind_addr = format!("0.0.0.0:{}", config.port);
    let listener = match TcpListener::bind(&bind_addr).await {
        Ok(listener) => {
            info!(
                port = config.port,
                address = %bind_addr,
                "Server listening"
            );
            listener
        }
        Err(err) => {
            error!(
                error = %err,
                address = %bind_addr,
                "Failed to bind to address"
            );
            return ExitCode::from(1);
        }
    };

    // Start server with graceful shutdown
    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());

    info!("Server ready to accept connections");

    // Run the server
    if let Err(err) = server.await {
        error!(error = %err, "Server error");
        return ExitCode::from(1);
    }

    // Shutdown cleanup
    info!("Server shutting down gracefully");

    if let Some(handle) = cleanup_handle {
        handle.abort();
        info!("Presence cache sweep task stopped");
    }

    let purged = presence.purge(false).await;
    if purged > 0 {
        warn!(purged, "Purged presence entries left behind by open connections");
    }

    info!("Server shutdown complete");
    ExitCode::SUCCESS
}

/// Initialize structured logging with tracing.
///
/// Configures JSON-formatted output with:
/// - Environment-based log level filtering via RUST_LOG
/// - Default log level of `info`
/// - Target and level information
fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug,axum::rejection=trace"));

    let json_layer = fmt::layer()
        .json()
        .with_target(true)
        .with_level(true)
        .with_file(false)
        .with_line_number(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .init();
}

/// Creates a future that resolves when a shutdown signal is received.
///
/// Listens for:
/// - SIGTERM (container orchestrator shutdown)
/// - SIGINT (Ctrl+C)
///
/// If a handler cannot be installed, that signal is simply never observed.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
