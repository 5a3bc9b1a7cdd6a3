//! Connection authentication.
//!
//! Every WebSocket handshake is resolved to an [`Identity`] before upgrade.
//! Credentials are read from the `Authorization` header (`Token <t>` or
//! `Bearer <t>`) or, for clients that cannot set headers on a WebSocket
//! handshake, from the `token` query parameter.
//!
//! # Authenticators
//!
//! - [`StaticTokenAuthenticator`] - fixed token table from configuration
//! - [`RemoteAuthenticator`](crate::identity::RemoteAuthenticator) - asks the
//!   web application who a token belongs to
//! - [`DevAuthenticator`] - trusts `?username=`, only in unsafe mode
//! - [`AuthChain`] - first non-anonymous answer wins
//!
//! Authenticators never fail: anything that cannot be resolved is
//! [`Identity::Anonymous`]. Tokens are never logged.
//!
//! # Example
//!
//! ```rust
//! use goldenhorde_relay::auth::{Authenticator, Credentials, StaticTokenAuthenticator};
//! use goldenhorde_relay::types::Identity;
//!
//! # tokio_test::block_on(async {
//! let auth = StaticTokenAuthenticator::new([("s3cret".to_string(), "alice".to_string())]);
//! let identity = auth.authenticate(&Credentials::with_token("s3cret")).await;
//! assert_eq!(identity, Identity::user("alice"));
//! # });
//! ```

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use axum::http::{header::AUTHORIZATION, HeaderMap};
use serde::Deserialize;
use subtle::ConstantTimeEq;
use tracing::{debug, trace};

use crate::types::Identity;

/// Authorization schemes accepted in the `Authorization` header.
const TOKEN_SCHEMES: [&str; 2] = ["Token", "Bearer"];

/// Query parameters accepted on both WebSocket endpoints.
#[derive(Debug, Default, Deserialize)]
pub struct ConnectQuery {
    /// Access token, used when the header is absent.
    pub token: Option<String>,

    /// Claimed username. Only honored by [`DevAuthenticator`].
    pub username: Option<String>,
}

/// Credentials presented on a handshake.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub token: Option<String>,
    pub username_hint: Option<String>,
}

impl Credentials {
    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
            username_hint: None,
        }
    }

    /// Reads credentials from the handshake. The header wins over the query.
    pub fn from_request(headers: &HeaderMap, query: &ConnectQuery) -> Self {
        let header_token = headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_authorization);
        let query_token = query
            .token
            .as_deref()
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(str::to_string);

        Self {
            token: header_token.or(query_token),
            username_hint: query
                .username
                .as_deref()
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("username_hint", &self.username_hint)
            .finish()
    }
}

/// Extracts the token from an `Authorization` header value.
fn parse_authorization(value: &str) -> Option<String> {
    let (scheme, token) = value.trim().split_once(' ')?;
    let token = token.trim();
    let known = TOKEN_SCHEMES
        .iter()
        .any(|known| known.eq_ignore_ascii_case(scheme));
    (known && !token.is_empty()).then(|| token.to_string())
}

/// Resolves handshake credentials to an identity.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, credentials: &Credentials) -> Identity;

    fn name(&self) -> &'static str;
}

// ============================================================================
// Static token table
// ============================================================================

/// Authenticates against a fixed `token -> username` table.
#[derive(Clone)]
pub struct StaticTokenAuthenticator {
    tokens: Vec<(String, String)>,
}

impl StaticTokenAuthenticator {
    pub fn new(tokens: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            tokens: tokens.into_iter().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    fn lookup(&self, presented: &str) -> Option<&str> {
        // Compare against every entry so timing does not reveal the match position.
        let mut found = None;
        for (token, username) in &self.tokens {
            if bool::from(token.as_bytes().ct_eq(presented.as_bytes())) {
                found = Some(username.as_str());
            }
        }
        found
    }
}

impl fmt::Debug for StaticTokenAuthenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticTokenAuthenticator")
            .field("tokens", &self.tokens.len())
            .finish()
    }
}

#[async_trait]
impl Authenticator for StaticTokenAuthenticator {
    async fn authenticate(&self, credentials: &Credentials) -> Identity {
        let Some(token) = credentials.token.as_deref() else {
            return Identity::Anonymous;
        };
        match self.lookup(token) {
            Some(username) => {
                trace!(username, "Static token accepted");
                Identity::user(username)
            }
            None => {
                debug!("Static token rejected");
                Identity::Anonymous
            }
        }
    }

    fn name(&self) -> &'static str {
        "static"
    }
}

// ============================================================================
// Unsafe development mode
// ============================================================================

/// Trusts the `username` query parameter. For local development only.
#[derive(Debug, Clone, Default)]
pub struct DevAuthenticator;

#[async_trait]
impl Authenticator for DevAuthenticator {
    async fn authenticate(&self, credentials: &Credentials) -> Identity {
        match credentials.username_hint.as_deref() {
            Some(username) => Identity::user(username),
            None => Identity::Anonymous,
        }
    }

    fn name(&self) -> &'static str {
        "dev"
    }
}

// ============================================================================
// Chain
// ============================================================================

/// Tries each authenticator in order and returns the first user identity.
#[derive(Clone, Default)]
pub struct AuthChain {
    links: Vec<Arc<dyn Authenticator>>,
}

impl AuthChain {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.links.push(authenticator);
        self
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}

impl fmt::Debug for AuthChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<_> = self.links.iter().map(|link| link.name()).collect();
        f.debug_struct("AuthChain").field("links", &names).finish()
    }
}

#[async_trait]
impl Authenticator for AuthChain {
    async fn authenticate(&self, credentials: &Credentials) -> Identity {
        for link in &self.links {
            let identity = link.authenticate(credentials).await;
            if !identity.is_anonymous() {
                trace!(authenticator = link.name(), "Credentials resolved");
                return identity;
            }
        }
        Identity::Anonymous
    }

    fn name(&self) -> &'static str {
        "chain"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(authorization: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_str(authorization).unwrap());
        headers
    }

    fn table() -> StaticTokenAuthenticator {
        StaticTokenAuthenticator::new([
            ("tok-alice".to_string(), "alice".to_string()),
            ("tok-bob".to_string(), "bob".to_string()),
        ])
    }

    #[test]
    fn parses_token_and_bearer_schemes() {
        assert_eq!(parse_authorization("Token abc"), Some("abc".into()));
        assert_eq!(parse_authorization("Bearer abc"), Some("abc".into()));
        assert_eq!(parse_authorization("token  abc "), Some("abc".into()));
    }

    #[test]
    fn rejects_other_schemes() {
        assert_eq!(parse_authorization("Basic abc"), None);
        assert_eq!(parse_authorization("Token"), None);
        assert_eq!(parse_authorization("Token "), None);
        assert_eq!(parse_authorization(""), None);
    }

    #[test]
    fn header_wins_over_query() {
        let query = ConnectQuery {
            token: Some("from-query".into()),
            username: None,
        };
        let creds = Credentials::from_request(&headers("Token from-header"), &query);
        assert_eq!(creds.token.as_deref(), Some("from-header"));
    }

    #[test]
    fn query_token_is_fallback() {
        let query = ConnectQuery {
            token: Some("from-query".into()),
            username: Some("alice".into()),
        };
        let creds = Credentials::from_request(&HeaderMap::new(), &query);
        assert_eq!(creds.token.as_deref(), Some("from-query"));
        assert_eq!(creds.username_hint.as_deref(), Some("alice"));
    }

    #[test]
    fn blank_values_are_ignored() {
        let query = ConnectQuery {
            token: Some("  ".into()),
            username: Some("".into()),
        };
        assert_eq!(
            Credentials::from_request(&HeaderMap::new(), &query),
            Credentials::default()
        );
    }

    #[test]
    fn debug_redacts_token() {
        let debug = format!("{:?}", Credentials::with_token("super-secret"));
        assert!(!debug.contains("super-secret"));
        assert!(debug.contains("<redacted>"));
    }

    #[tokio::test]
    async fn static_table_resolves_known_tokens() {
        let auth = table();
        assert_eq!(
            auth.authenticate(&Credentials::with_token("tok-bob")).await,
            Identity::user("bob")
        );
    }

    #[tokio::test]
    async fn static_table_rejects_unknown_or_missing() {
        let auth = table();
        assert!(auth
            .authenticate(&Credentials::with_token("tok-bo"))
            .await
            .is_anonymous());
        assert!(auth.authenticate(&Credentials::default()).await.is_anonymous());
    }

    #[tokio::test]
    async fn dev_mode_uses_username_hint() {
        let creds = Credentials {
            token: None,
            username_hint: Some("carol".into()),
        };
        assert_eq!(DevAuthenticator.authenticate(&creds).await, Identity::user("carol"));
        assert!(DevAuthenticator
            .authenticate(&Credentials::default())
            .await
            .is_anonymous());
    }

    #[tokio::test]
    async fn chain_returns_first_user() {
        let chain = AuthChain::new()
            .with(Arc::new(table()))
            .with(Arc::new(DevAuthenticator));

        assert_eq!(
            chain.authenticate(&Credentials::with_token("tok-alice")).await,
            Identity::user("alice")
        );
        let creds = Credentials {
            token: Some("bogus".into()),
            username_hint: Some("dave".into()),
        };
        assert_eq!(chain.authenticate(&creds).await, Identity::user("dave"));
    }

    #[tokio::test]
    async fn empty_chain_is_anonymous() {
        let chain = AuthChain::new();
        assert!(chain.is_empty());
        assert!(chain
            .authenticate(&Credentials::with_token("anything"))
            .await
            .is_anonymous());
    }

    #[test]
    fn static_debug_hides_tokens() {
        let debug = format!("{:?}", table());
        assert!(!debug.contains("tok-alice"));
    }
}
