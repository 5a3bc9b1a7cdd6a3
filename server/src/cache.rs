//! Key-value cache with per-key expiry.
//!
//! The relay uses a cache to map usernames to their live channel and current
//! tent. The cache is an external collaborator: anything implementing
//! [`CacheBackend`] can be plugged in (a Redis client in a multi-instance
//! deployment). [`MemoryCache`] is the in-process implementation used for
//! single-instance deployments and tests.
//!
//! # Expiry
//!
//! Every entry carries an absolute expiry instant. Expired entries are never
//! returned: they are removed lazily when touched, and in bulk by
//! [`MemoryCache::cleanup_expired`] (usually driven by
//! [`MemoryCache::spawn_cleanup_task`]).
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use goldenhorde_relay::cache::{CacheBackend, MemoryCache};
//!
//! #[tokio::main]
//! async fn main() {
//!     let cache = MemoryCache::new();
//!     cache.set("channel:alice", "relay.abc", Duration::from_secs(60)).await.unwrap();
//!
//!     assert_eq!(
//!         cache.get("channel:alice").await.unwrap().as_deref(),
//!         Some("relay.abc")
//!     );
//!
//!     // Extending a missing key does not create it.
//!     assert!(!cache.extend("channel:bob", Duration::from_secs(60)).await.unwrap());
//! }
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Transport-level failures against a cache backend.
///
/// A missing key is never an error; these only describe the backend being
/// unreachable or misbehaving.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// The backend could not be reached.
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),

    /// The backend answered with something unusable.
    #[error("cache backend returned an invalid response: {0}")]
    InvalidResponse(String),
}

pub type CacheResult<T> = Result<T, CacheError>;

/// Operations the relay needs from a cache.
///
/// Each call is independently atomic for its key. No cross-key transactions
/// are required, and implementations must tolerate concurrent callers.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Returns the live value for `key`, or `None` if absent or expired.
    async fn get(&self, key: &str) -> CacheResult<Option<String>>;

    /// Stores `value` under `key`, replacing any existing entry.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<()>;

    /// Removes `key`. Returns `true` if a live entry was removed.
    async fn delete(&self, key: &str) -> CacheResult<bool>;

    /// Pushes the expiry of an existing entry out to at least `now + ttl`.
    ///
    /// Returns `false` without creating anything if the key is absent. An
    /// entry whose current expiry is already later keeps it.
    async fn extend(&self, key: &str, ttl: Duration) -> CacheResult<bool>;

    /// Lists the live keys starting with `prefix`.
    async fn keys_with_prefix(&self, prefix: &str) -> CacheResult<Vec<String>>;

    /// Short name used in logs.
    fn backend_name(&self) -> &'static str;
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: String,
    expires_at: Instant,
}

impl CacheEntry {
    fn new(value: String, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    fn remaining_ttl(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }
}

/// In-process [`CacheBackend`] backed by a `HashMap` behind a `RwLock`.
///
/// Cloning is cheap and every clone shares the same entries.
#[derive(Debug, Clone, Default)]
pub struct MemoryCache {
    entries: Arc<RwLock<HashMap<String, CacheEntry>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the remaining lifetime of a live entry.
    pub async fn ttl(&self, key: &str) -> Option<Duration> {
        let entries = self.entries.read().await;
        entries
            .get(key)
            .filter(|entry| !entry.is_expired())
            .map(CacheEntry::remaining_ttl)
    }

    /// Number of stored entries, including expired ones not yet swept.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Removes every expired entry and returns how many were dropped.
    pub async fn cleanup_expired(&self) -> usize {
        let mut entries = self.entries.write().await;
        let initial_len = entries.len();

        entries.retain(|_, entry| !entry.is_expired());

        let removed = initial_len - entries.len();
        if removed > 0 {
            debug!(
                removed_count = removed,
                remaining_count = entries.len(),
                "Cleaned up expired cache entries"
            );
        }
        removed
    }

    /// Spawns a background task that sweeps expired entries every
    /// `cleanup_interval`. The task runs until aborted.
    pub fn spawn_cleanup_task(&self, cleanup_interval: Duration) -> tokio::task::JoinHandle<()> {
        let cache = self.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(cleanup_interval);

            loop {
                interval.tick().await;
                cache.cleanup_expired().await;
            }
        })
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some(entry) if !entry.is_expired() => return Ok(Some(entry.value.clone())),
                Some(_) => {}
                None => return Ok(None),
            }
        }

        // Expired: drop it while we're here.
        let mut entries = self.entries.write().await;
        if entries.get(key).is_some_and(CacheEntry::is_expired) {
            entries.remove(key);
            trace!(key, "Removed expired cache entry on read");
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<()> {
        let mut entries = self.entries.write().await;
        entries.insert(key.to_string(), CacheEntry::new(value.to_string(), ttl));
        trace!(key, ttl_secs = ttl.as_secs(), "Cache entry set");
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        let mut entries = self.entries.write().await;
        Ok(entries
            .remove(key)
            .is_some_and(|entry| !entry.is_expired()))
    }

    async fn extend(&self, key: &str, ttl: Duration) -> CacheResult<bool> {
        let mut entries = self.entries.write().await;

        let Some(entry) = entries.get_mut(key) else {
            return Ok(false);
        };

        if entry.is_expired() {
            entries.remove(key);
            return Ok(false);
        }

        let candidate = Instant::now() + ttl;
        if candidate > entry.expires_at {
            entry.expires_at = candidate;
        }
        trace!(
            key,
            remaining_secs = entry.remaining_ttl().as_secs(),
            "Cache entry extended"
        );
        Ok(true)
    }

    async fn keys_with_prefix(&self, prefix: &str) -> CacheResult<Vec<String>> {
        let entries = self.entries.read().await;
        Ok(entries
            .iter()
            .filter(|(key, entry)| key.starts_with(prefix) && !entry.is_expired())
            .map(|(key, _)| key.clone())
            .collect())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
