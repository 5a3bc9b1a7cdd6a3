//! Remote identity resolution against the web application.
//!
//! The web application owns user accounts and their API tokens. The relay
//! asks it who a token belongs to via `GET {base}/api/auth/me/` with an
//! `Authorization: Token <t>` header; a 200 response carries the username.
//!
//! # Architecture
//!
//! - [`IdentityClient`] performs the HTTP exchange with a fixed request
//!   timeout and reports failures as [`AuthError`]
//! - [`RemoteAuthenticator`] adapts the client to the
//!   [`Authenticator`] trait, mapping every failure to anonymous
//!
//! At startup [`IdentityClient::probe_with_retry`] checks the endpoint is
//! reachable, retrying with exponential backoff and jitter.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::auth::{Authenticator, Credentials};
use crate::types::Identity;

/// Timeout for identity requests.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Path of the identity endpoint, relative to the base URL.
const IDENTITY_PATH: &str = "/api/auth/me/";

/// Maximum number of attempts for the startup probe.
const MAX_RETRY_ATTEMPTS: u32 = 5;

/// Base delay for exponential backoff (100ms).
const BASE_BACKOFF_MS: u64 = 100;

/// Maximum delay cap for exponential backoff (10 seconds).
const MAX_BACKOFF_MS: u64 = 10_000;

/// Maximum jitter added to a backoff delay (100ms).
const MAX_JITTER_MS: u64 = 100;

/// Failures talking to the identity endpoint.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The token was refused (401 or 403).
    #[error("token rejected")]
    Rejected,

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("identity endpoint unavailable: {0}")]
    Unavailable(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("client configuration error: {0}")]
    Configuration(String),

    #[error("all {attempts} attempts failed: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },
}

#[derive(Debug, Deserialize)]
struct MeResponse {
    username: String,
}

/// HTTP client for the identity endpoint.
#[derive(Debug, Clone)]
pub struct IdentityClient {
    http_client: Client,
    base_url: String,
}

impl IdentityClient {
    /// Creates a client for the application at `base_url`.
    ///
    /// Trailing slashes on `base_url` are ignored.
    pub fn new(base_url: impl Into<String>) -> Result<Self, AuthError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let http_client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| AuthError::Configuration(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            http_client,
            base_url,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self) -> String {
        format!("{}{IDENTITY_PATH}", self.base_url)
    }

    /// Returns the username owning `token`.
    ///
    /// # Errors
    ///
    /// - [`AuthError::Rejected`] - the application refused the token
    /// - [`AuthError::Timeout`] / [`AuthError::Unavailable`] - transport failure
    /// - [`AuthError::InvalidResponse`] - unexpected status or body
    pub async fn resolve(&self, token: &str) -> Result<String, AuthError> {
        let response = self
            .http_client
            .get(self.endpoint())
            .header("Authorization", format!("Token {token}"))
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            debug!(status = %status, "Identity endpoint rejected token");
            return Err(AuthError::Rejected);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "Unexpected response from identity endpoint");
            return Err(AuthError::InvalidResponse(format!(
                "unexpected status {status}: {body}"
            )));
        }

        let me: MeResponse = response
            .json()
            .await
            .map_err(|e| AuthError::InvalidResponse(format!("failed to parse identity: {e}")))?;
        if me.username.is_empty() {
            return Err(AuthError::InvalidResponse("empty username".into()));
        }

        debug!(username = %me.username, "Token resolved");
        Ok(me.username)
    }

    /// Checks that the endpoint answers at all.
    ///
    /// An unauthenticated request is expected to be refused; any response
    /// below 500 counts as reachable.
    pub async fn probe(&self) -> Result<(), AuthError> {
        let response = self
            .http_client
            .get(self.endpoint())
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        if status.is_server_error() {
            return Err(AuthError::Unavailable(format!("status {status}")));
        }
        Ok(())
    }

    /// Probes the endpoint with retries, for use during startup.
    ///
    /// Delays follow `min(2^attempt * 100ms + random(0, 100ms), 10s)`.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::RetriesExhausted`] once every attempt failed.
    pub async fn probe_with_retry(&self) -> Result<(), AuthError> {
        let mut last_error = String::new();

        for attempt in 0..MAX_RETRY_ATTEMPTS {
            match self.probe().await {
                Ok(()) => {
                    if attempt > 0 {
                        info!(attempt = attempt + 1, "Identity endpoint reachable after retry");
                    }
                    return Ok(());
                }
                Err(e) => {
                    last_error = e.to_string();

                    if attempt < MAX_RETRY_ATTEMPTS - 1 {
                        let delay = calculate_backoff_delay(attempt);
                        warn!(
                            attempt = attempt + 1,
                            max_attempts = MAX_RETRY_ATTEMPTS,
                            delay_ms = delay.as_millis(),
                            error = %e,
                            "Identity endpoint probe failed, retrying"
                        );
                        sleep(delay).await;
                    } else {
                        error!(
                            attempts = MAX_RETRY_ATTEMPTS,
                            error = %e,
                            "Identity endpoint probe failed, no more retries"
                        );
                    }
                }
            }
        }

        Err(AuthError::RetriesExhausted {
            attempts: MAX_RETRY_ATTEMPTS,
            last_error,
        })
    }
}

fn map_transport_error(e: reqwest::Error) -> AuthError {
    if e.is_timeout() {
        AuthError::Timeout(REQUEST_TIMEOUT)
    } else if e.is_connect() {
        AuthError::Unavailable(format!("connection failed: {e}"))
    } else {
        AuthError::Unavailable(format!("request failed: {e}"))
    }
}

/// Backoff delay before retry number `attempt` (zero-indexed).
fn calculate_backoff_delay(attempt: u32) -> Duration {
    let exponential_ms = BASE_BACKOFF_MS.saturating_mul(2u64.saturating_pow(attempt));
    let jitter_ms = rand::rng().random_range(0..=MAX_JITTER_MS);
    let total_ms = exponential_ms.saturating_add(jitter_ms).min(MAX_BACKOFF_MS);
    Duration::from_millis(total_ms)
}

/// [`Authenticator`] backed by the identity endpoint.
#[derive(Debug, Clone)]
pub struct RemoteAuthenticator {
    client: IdentityClient,
}

impl RemoteAuthenticator {
    pub fn new(client: IdentityClient) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &IdentityClient {
        &self.client
    }
}

#[async_trait]
impl Authenticator for RemoteAuthenticator {
    async fn authenticate(&self, credentials: &Credentials) -> Identity {
        let Some(token) = credentials.token.as_deref() else {
            return Identity::Anonymous;
        };
        match self.client.resolve(token).await {
            Ok(username) => Identity::user(username),
            Err(AuthError::Rejected) => Identity::Anonymous,
            Err(err) => {
                warn!(error = %err, "Identity lookup failed, treating connection as anonymous");
                Identity::Anonymous
            }
        }
    }

    fn name(&self) -> &'static str {
        "remote"
    }
}
