//! Server configuration module.
//!
//! Parses configuration from environment variables for the relay.
//!
//! # Environment Variables
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `GOLDENHORDE_AUTH_TOKENS` | Yes* | - | Format: `token1:user1,token2:user2` |
//! | `GOLDENHORDE_AUTH_URL` | Yes* | - | Base URL of the web application's identity API |
//! | `PORT` | No | 8000 | HTTP server port |
//! | `GOLDENHORDE_UNSAFE_NO_AUTH` | No | false | Trust `?username=` (dev only) |
//! | `WS_CACHE_TTL` | No | 3600 | Default presence TTL, seconds |
//! | `WS_CACHE_EXTENDED_TTL` | No | 86400 | Active presence TTL, seconds |
//! | `GOLDENHORDE_CACHE_SWEEP_SECS` | No | 60 | Expired presence sweep interval |
//! | `GOLDENHORDE_TENTS` | No | - | Format: `id:horde_id:name,...` |
//!
//! *At least one of the two is required unless `GOLDENHORDE_UNSAFE_NO_AUTH=true`

use std::env;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use crate::presence::{PresenceTtl, ACTIVE_TTL_SECS, DEFAULT_TTL_SECS};
use crate::types::{HordeId, Tent, TentId};

/// Default HTTP server port.
const DEFAULT_PORT: u16 = 8000;

/// Default interval between expired-entry sweeps.
const DEFAULT_SWEEP_SECS: u64 = 60;

const VAR_UNSAFE_NO_AUTH: &str = "GOLDENHORDE_UNSAFE_NO_AUTH";
const VAR_AUTH_TOKENS: &str = "GOLDENHORDE_AUTH_TOKENS";
const VAR_AUTH_URL: &str = "GOLDENHORDE_AUTH_URL";
const VAR_CACHE_TTL: &str = "WS_CACHE_TTL";
const VAR_CACHE_EXTENDED_TTL: &str = "WS_CACHE_EXTENDED_TTL";
const VAR_SWEEP_SECS: &str = "GOLDENHORDE_CACHE_SWEEP_SECS";
const VAR_TENTS: &str = "GOLDENHORDE_TENTS";

/// Errors that can occur when parsing configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    /// Environment variable has invalid format.
    #[error("invalid format for {var}: {message}")]
    InvalidFormat { var: String, message: String },

    /// Port number is invalid.
    #[error("invalid port number: {0}")]
    InvalidPort(#[from] std::num::ParseIntError),

    /// Configuration validation failed.
    #[error("configuration validation failed: {0}")]
    ValidationError(String),
}

/// Server configuration parsed from environment variables.
#[derive(Clone)]
pub struct Config {
    /// HTTP server port.
    pub port: u16,

    /// When true, identities are taken from `?username=` (development only).
    pub unsafe_no_auth: bool,

    /// Static `(token, username)` pairs.
    pub auth_tokens: Vec<(String, String)>,

    /// Base URL of the identity endpoint.
    pub auth_url: Option<String>,

    /// Presence TTL tiers.
    pub presence_ttl: PresenceTtl,

    /// Interval between expired presence entry sweeps.
    pub cache_sweep_interval: Duration,

    /// Tents to seed the in-memory store with.
    pub tents: Vec<Tent>,
}

impl Config {
    /// Parse configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - Neither `GOLDENHORDE_AUTH_TOKENS` nor `GOLDENHORDE_AUTH_URL` is set
    ///   (when `GOLDENHORDE_UNSAFE_NO_AUTH` is not true)
    /// - Environment variables have invalid format
    /// - Port number is not a valid u16
    /// - TTL tiers are zero or inverted
    ///
    /// # Example
    ///
    /// ```no_run
    /// use goldenhorde_relay::config::Config;
    ///
    /// let config = Config::from_env().expect("Failed to load config");
    /// println!("Relay will listen on port {}", config.port);
    /// ```
    pub fn from_env() -> Result<Self, ConfigError> {
        let unsafe_no_auth = parse_bool_env(VAR_UNSAFE_NO_AUTH);
        let port = parse_port()?;
        let auth_tokens = parse_auth_tokens()?;
        let auth_url = env::var(VAR_AUTH_URL).ok().filter(|url| !url.trim().is_empty());
        let presence_ttl = PresenceTtl {
            default: Duration::from_secs(parse_u64_env(VAR_CACHE_TTL, DEFAULT_TTL_SECS)?),
            active: Duration::from_secs(parse_u64_env(VAR_CACHE_EXTENDED_TTL, ACTIVE_TTL_SECS)?),
        };
        let cache_sweep_interval =
            Duration::from_secs(parse_u64_env(VAR_SWEEP_SECS, DEFAULT_SWEEP_SECS)?);
        let tents = parse_tents()?;

        let config = Self {
            port,
            unsafe_no_auth,
            auth_tokens,
            auth_url,
            presence_ttl,
            cache_sweep_interval,
            tents,
        };

        config.validate()?;

        if config.unsafe_no_auth {
            warn!(
                "GOLDENHORDE_UNSAFE_NO_AUTH is enabled - identities are taken from the query string. \
                 Do not use in production!"
            );
        }

        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.presence_ttl.default.is_zero() || self.presence_ttl.active.is_zero() {
            return Err(ConfigError::ValidationError(
                "presence TTLs must be greater than zero".to_string(),
            ));
        }

        if self.presence_ttl.active < self.presence_ttl.default {
            return Err(ConfigError::ValidationError(format!(
                "{VAR_CACHE_EXTENDED_TTL} must not be shorter than {VAR_CACHE_TTL}"
            )));
        }

        if self.cache_sweep_interval.is_zero() {
            return Err(ConfigError::ValidationError(format!(
                "{VAR_SWEEP_SECS} must be greater than zero"
            )));
        }

        if self.unsafe_no_auth {
            return Ok(());
        }

        if self.auth_tokens.is_empty() && self.auth_url.is_none() {
            return Err(ConfigError::MissingEnvVar(format!(
                "{VAR_AUTH_TOKENS} or {VAR_AUTH_URL}"
            )));
        }

        Ok(())
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("port", &self.port)
            .field("unsafe_no_auth", &self.unsafe_no_auth)
            .field("auth_tokens", &self.auth_tokens.len())
            .field("auth_url", &self.auth_url)
            .field("presence_ttl", &self.presence_ttl)
            .field("cache_sweep_interval", &self.cache_sweep_interval)
            .field("tents", &self.tents.len())
            .finish()
    }
}

/// Parse a boolean environment variable.
///
/// Returns `true` if the variable is set to "true" (case-insensitive),
/// `false` otherwise.
fn parse_bool_env(name: &str) -> bool {
    env::var(name)
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Parse the PORT environment variable.
///
/// Returns the default port if not set.
fn parse_port() -> Result<u16, ConfigError> {
    match env::var("PORT") {
        Ok(port_str) => Ok(port_str.parse()?),
        Err(env::VarError::NotPresent) => Ok(DEFAULT_PORT),
        Err(env::VarError::NotUnicode(_)) => Err(ConfigError::InvalidFormat {
            var: "PORT".to_string(),
            message: "contains invalid unicode".to_string(),
        }),
    }
}

fn parse_u64_env(name: &str, default: u64) -> Result<u64, ConfigError> {
    match env::var(name) {
        Ok(value) if value.trim().is_empty() => Ok(default),
        Ok(value) => value.trim().parse().map_err(|_| ConfigError::InvalidFormat {
            var: name.to_string(),
            message: format!("expected a whole number of seconds, got '{value}'"),
        }),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(env::VarError::NotUnicode(_)) => Err(ConfigError::InvalidFormat {
            var: name.to_string(),
            message: "contains invalid unicode".to_string(),
        }),
    }
}

/// Parse the GOLDENHORDE_AUTH_TOKENS environment variable.
///
/// Expected format: `token1:user1,token2:user2`. Token values are never
/// echoed back in errors.
fn parse_auth_tokens() -> Result<Vec<(String, String)>, ConfigError> {
    let tokens_str = match env::var(VAR_AUTH_TOKENS) {
        Ok(s) if !s.is_empty() => s,
        _ => return Ok(Vec::new()),
    };

    let mut tokens = Vec::new();

    for (index, pair) in tokens_str.split(',').enumerate() {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }

        let Some((token, username)) = pair.split_once(':') else {
            return Err(ConfigError::InvalidFormat {
                var: VAR_AUTH_TOKENS.to_string(),
                message: format!("entry {index}: expected 'token:username' format"),
            });
        };

        let token = token.trim();
        let username = username.trim();

        if token.is_empty() {
            return Err(ConfigError::InvalidFormat {
                var: VAR_AUTH_TOKENS.to_string(),
                message: format!("entry {index}: token cannot be empty"),
            });
        }

        if username.is_empty() {
            return Err(ConfigError::InvalidFormat {
                var: VAR_AUTH_TOKENS.to_string(),
                message: format!("entry {index}: username cannot be empty"),
            });
        }

        tokens.push((token.to_string(), username.to_string()));
    }

    Ok(tokens)
}

/// Parse the GOLDENHORDE_TENTS environment variable.
///
/// Expected format: `id:horde_id:name,...`. The name may be omitted, in
/// which case it defaults to `Tent <id>`.
fn parse_tents() -> Result<Vec<Tent>, ConfigError> {
    let tents_str = match env::var(VAR_TENTS) {
        Ok(s) if !s.is_empty() => s,
        _ => return Ok(Vec::new()),
    };

    let mut tents = Vec::new();

    for entry in tents_str.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }

        let mut parts = entry.splitn(3, ':').map(str::trim);
        let id = parts.next().unwrap_or_default();
        let horde = parts.next().unwrap_or_default();
        let name = parts.next().filter(|name| !name.is_empty());

        let Some(id) = TentId::parse(id) else {
            return Err(ConfigError::InvalidFormat {
                var: VAR_TENTS.to_string(),
                message: format!("invalid tent id in '{entry}'"),
            });
        };

        if horde.is_empty() {
            return Err(ConfigError::InvalidFormat {
                var: VAR_TENTS.to_string(),
                message: format!("expected 'id:horde_id[:name]' format, got '{entry}'"),
            });
        }

        tents.push(Tent {
            name: name.map_or_else(|| format!("Tent {id}"), str::to_string),
            id,
            horde_id: HordeId::new(horde),
        });
    }

    Ok(tents)
}
