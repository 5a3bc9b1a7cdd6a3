//! Username-keyed presence tracking on top of a [`CacheBackend`].
//!
//! Two key families are maintained per user:
//!
//! - `channel:<username>` - the channel currently used to reach the user
//! - `tent:<username>` - the tent the user is currently in
//!
//! Absence of an entry means "not connected" and is never an error. Backend
//! failures are logged and reported as a failed operation (`None`/`false`)
//! so that callers can carry on in a degraded mode: presence tracking is
//! best-effort and never fatal to a connection.
//!
//! # TTL tiers
//!
//! Entries written with the default tier expire quickly if the session never
//! heartbeats. Sessions use the active tier at connect time and every ping
//! re-applies it, so a live session can outlast any single TTL window.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::cache::CacheBackend;
use crate::types::{ChannelId, TentId};

/// Default TTL tier (1 hour).
pub const DEFAULT_TTL_SECS: u64 = 3600;

/// Active TTL tier (24 hours).
pub const ACTIVE_TTL_SECS: u64 = 86_400;

const CHANNEL_PREFIX: &str = "channel:";
const TENT_PREFIX: &str = "tent:";

/// TTL tiers applied to presence entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceTtl {
    /// Lifetime of entries for sessions that never heartbeat.
    pub default: Duration,
    /// Lifetime applied at connect time and refreshed on every ping.
    pub active: Duration,
}

impl Default for PresenceTtl {
    fn default() -> Self {
        Self {
            default: Duration::from_secs(DEFAULT_TTL_SECS),
            active: Duration::from_secs(ACTIVE_TTL_SECS),
        }
    }
}

pub fn channel_key(username: &str) -> String {
    format!("{CHANNEL_PREFIX}{username}")
}

pub fn tent_key(username: &str) -> String {
    format!("{TENT_PREFIX}{username}")
}

/// Presence cache shared by every session in the process.
#[derive(Clone)]
pub struct PresenceCache {
    backend: Arc<dyn CacheBackend>,
    ttl: PresenceTtl,
}

impl PresenceCache {
    pub fn new(backend: Arc<dyn CacheBackend>, ttl: PresenceTtl) -> Self {
        Self { backend, ttl }
    }

    pub fn ttl(&self) -> PresenceTtl {
        self.ttl
    }

    pub fn default_ttl(&self) -> Duration {
        self.ttl.default
    }

    pub fn active_ttl(&self) -> Duration {
        self.ttl.active
    }

    // ------------------------------------------------------------------
    // channel:<username>
    // ------------------------------------------------------------------

    /// Records the channel used to reach `username`. Returns `false` if the
    /// backend failed.
    pub async fn set_channel(&self, username: &str, channel: &ChannelId, ttl: Duration) -> bool {
        self.set(&channel_key(username), channel.as_str(), ttl).await
    }

    pub async fn get_channel(&self, username: &str) -> Option<ChannelId> {
        self.get(&channel_key(username))
            .await
            .map(ChannelId::from_raw)
    }

    pub async fn delete_channel(&self, username: &str) -> bool {
        self.delete(&channel_key(username)).await
    }

    /// Returns `false` if there was no entry to extend (or the backend failed).
    pub async fn extend_channel_ttl(&self, username: &str, ttl: Duration) -> bool {
        self.extend(&channel_key(username), ttl).await
    }

    // ------------------------------------------------------------------
    // tent:<username>
    // ------------------------------------------------------------------

    pub async fn set_tent(&self, username: &str, tent_id: &TentId, ttl: Duration) -> bool {
        self.set(&tent_key(username), tent_id.as_str(), ttl).await
    }

    pub async fn get_tent(&self, username: &str) -> Option<TentId> {
        self.get(&tent_key(username)).await.map(TentId::new)
    }

    pub async fn delete_tent(&self, username: &str) -> bool {
        self.delete(&tent_key(username)).await
    }

    pub async fn extend_tent_ttl(&self, username: &str, ttl: Duration) -> bool {
        self.extend(&tent_key(username), ttl).await
    }

    /// Refreshes both entries for `username` with the active tier.
    pub async fn heartbeat(&self, username: &str) -> (bool, bool) {
        let channel = self.extend_channel_ttl(username, self.ttl.active).await;
        let tent = self.extend_tent_ttl(username, self.ttl.active).await;
        (channel, tent)
    }

    /// Removes every presence entry, or just counts them when `dry_run`.
    ///
    /// Returns the number of entries removed (or that would be removed).
    pub async fn purge(&self, dry_run: bool) -> usize {
        let mut purged = 0;

        for prefix in [CHANNEL_PREFIX, TENT_PREFIX] {
            let keys = match self.backend.keys_with_prefix(prefix).await {
                Ok(keys) => keys,
                Err(err) => {
                    warn!(
                        backend = self.backend.backend_name(),
                        prefix,
                        error = %err,
                        "Could not scan presence entries"
                    );
                    continue;
                }
            };

            for key in keys {
                if dry_run {
                    debug!(key = %key, "Would purge presence entry");
                    purged += 1;
                } else if self.delete(&key).await {
                    purged += 1;
                }
            }
        }

        info!(purged, dry_run, "Presence purge finished");
        purged
    }

    // ------------------------------------------------------------------
    // Backend calls, degraded on failure
    // ------------------------------------------------------------------

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> bool {
        match self.backend.set(key, value, ttl).await {
            Ok(()) => true,
            Err(err) => {
                warn!(backend = self.backend.backend_name(), key, error = %err, "Presence write failed");
                false
            }
        }
    }

    async fn get(&self, key: &str) -> Option<String> {
        match self.backend.get(key).await {
            Ok(value) => value,
            Err(err) => {
                warn!(backend = self.backend.backend_name(), key, error = %err, "Presence read failed");
                None
            }
        }
    }

    async fn delete(&self, key: &str) -> bool {
        match self.backend.delete(key).await {
            Ok(removed) => removed,
            Err(err) => {
                warn!(backend = self.backend.backend_name(), key, error = %err, "Presence delete failed");
                false
            }
        }
    }

    async fn extend(&self, key: &str, ttl: Duration) -> bool {
        match self.backend.extend(key, ttl).await {
            Ok(extended) => extended,
            Err(err) => {
                warn!(backend = self.backend.backend_name(), key, error = %err, "Presence extend failed");
                false
            }
        }
    }
}

impl std::fmt::Debug for PresenceCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresenceCache")
            .field("backend", &self.backend.backend_name())
            .field("ttl", &self.ttl)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::cache::{CacheError, CacheResult, MemoryCache};
    use async_trait::async_trait;

    /// A backend that fails every call, for exercising degraded paths.
    pub(crate) struct UnreachableCache;

    #[async_trait]
    impl CacheBackend for UnreachableCache {
        async fn get(&self, _key: &str) -> CacheResult<Option<String>> {
            Err(CacheError::Unavailable("connection refused".into()))
        }

        async fn set(&self, _key: &str, _value: &str, _ttl: Duration) -> CacheResult<()> {
            Err(CacheError::Unavailable("connection refused".into()))
        }

        async fn delete(&self, _key: &str) -> CacheResult<bool> {
            Err(CacheError::Unavailable("connection refused".into()))
        }

        async fn extend(&self, _key: &str, _ttl: Duration) -> CacheResult<bool> {
            Err(CacheError::Unavailable("connection refused".into()))
        }

        async fn keys_with_prefix(&self, _prefix: &str) -> CacheResult<Vec<String>> {
            Err(CacheError::Unavailable("connection refused".into()))
        }

        fn backend_name(&self) -> &'static str {
            "unreachable"
        }
    }

    fn presence() -> (PresenceCache, MemoryCache) {
        let backend = MemoryCache::new();
        let cache = PresenceCache::new(Arc::new(backend.clone()), PresenceTtl::default());
        (cache, backend)
    }

    #[test]
    fn key_families() {
        assert_eq!(channel_key("alice"), "channel:alice");
        assert_eq!(tent_key("alice"), "tent:alice");
    }

    #[test]
    fn default_tiers_match_documented_values() {
        let ttl = PresenceTtl::default();
        assert_eq!(ttl.default, Duration::from_secs(3600));
        assert_eq!(ttl.active, Duration::from_secs(86_400));
    }

    #[tokio::test]
    async fn channel_round_trip() {
        let (cache, _) = presence();
        let channel = ChannelId::from_raw("relay.1");

        assert!(cache.set_channel("alice", &channel, cache.active_ttl()).await);
        assert_eq!(cache.get_channel("alice").await, Some(channel));

        assert!(cache.delete_channel("alice").await);
        assert_eq!(cache.get_channel("alice").await, None);
    }

    #[tokio::test]
    async fn tent_round_trip() {
        let (cache, _) = presence();

        assert!(cache.set_tent("alice", &TentId::new("7"), cache.active_ttl()).await);
        assert_eq!(cache.get_tent("alice").await, Some(TentId::new("7")));
        assert!(cache.delete_tent("alice").await);
        assert_eq!(cache.get_tent("alice").await, None);
    }

    #[tokio::test]
    async fn absent_keys_are_not_errors() {
        let (cache, _) = presence();

        assert_eq!(cache.get_channel("ghost").await, None);
        assert_eq!(cache.get_tent("ghost").await, None);
        assert!(!cache.delete_channel("ghost").await);
        assert!(!cache.delete_tent("ghost").await);
        assert!(!cache.extend_channel_ttl("ghost", cache.active_ttl()).await);
        assert!(!cache.extend_tent_ttl("ghost", cache.active_ttl()).await);
    }

    #[tokio::test]
    async fn heartbeat_never_creates_entries() {
        let (cache, backend) = presence();

        assert_eq!(cache.heartbeat("alice").await, (false, false));
        assert!(backend.is_empty().await);
    }

    #[tokio::test]
    async fn heartbeat_promotes_default_tier_to_active() {
        let (cache, backend) = presence();
        let channel = ChannelId::from_raw("relay.1");

        cache.set_channel("alice", &channel, cache.default_ttl()).await;
        cache.set_tent("alice", &TentId::new("7"), cache.default_ttl()).await;

        assert_eq!(cache.heartbeat("alice").await, (true, true));

        let remaining = backend.ttl("channel:alice").await.unwrap();
        assert!(remaining > Duration::from_secs(DEFAULT_TTL_SECS));
    }

    #[tokio::test]
    async fn last_writer_wins_for_channel() {
        let (cache, _) = presence();

        cache
            .set_channel("alice", &ChannelId::from_raw("relay.first"), cache.active_ttl())
            .await;
        cache
            .set_channel("alice", &ChannelId::from_raw("relay.second"), cache.active_ttl())
            .await;

        assert_eq!(
            cache.get_channel("alice").await,
            Some(ChannelId::from_raw("relay.second"))
        );
    }

    #[tokio::test]
    async fn backend_failure_degrades_to_absent() {
        let cache = PresenceCache::new(Arc::new(UnreachableCache), PresenceTtl::default());
        let channel = ChannelId::from_raw("relay.1");

        assert!(!cache.set_channel("alice", &channel, cache.active_ttl()).await);
        assert_eq!(cache.get_channel("alice").await, None);
        assert!(!cache.delete_channel("alice").await);
        assert_eq!(cache.heartbeat("alice").await, (false, false));
        assert_eq!(cache.purge(false).await, 0);
    }

    #[tokio::test]
    async fn purge_removes_only_presence_keys() {
        let (cache, backend) = presence();
        backend.set("unrelated", "x", Duration::from_secs(60)).await.unwrap();
        cache
            .set_channel("alice", &ChannelId::from_raw("relay.1"), cache.active_ttl())
            .await;
        cache.set_tent("alice", &TentId::new("7"), cache.active_ttl()).await;
        cache
            .set_channel("bob", &ChannelId::from_raw("relay.2"), cache.active_ttl())
            .await;

        assert_eq!(cache.purge(true).await, 3);
        assert_eq!(backend.len().await, 4);

        assert_eq!(cache.purge(false).await, 3);
        assert_eq!(backend.len().await, 1);
        assert!(backend.get("unrelated").await.unwrap().is_some());
    }
}
