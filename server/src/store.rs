//! Persistence collaborator for tents and tent participants.
//!
//! Tents and their participant rows belong to the web application's
//! database; the relay only needs a narrow slice of it, captured by
//! [`TentStore`]. [`MemoryTentStore`] implements it entirely in memory using
//! maps guarded by `tokio::sync::RwLock`:
//!
//! - **Not durable**: all state is lost on process restart.
//! - **Single-process consistency**: the (tent, username) uniqueness
//!   constraint is enforced under the participants write lock, so concurrent
//!   joins for the same pair collapse into one row.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, trace};

use crate::types::{Tent, TentId, TentParticipant};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait TentStore: Send + Sync {
    /// Looks a tent up by id. `Ok(None)` means it does not exist.
    async fn get_tent(&self, tent_id: &TentId) -> StoreResult<Option<Tent>>;

    /// Returns the participant row for the pair, creating it if needed.
    ///
    /// The tent must exist; otherwise `StoreError::NotFound`.
    async fn get_or_create_participant(
        &self,
        tent_id: &TentId,
        username: &str,
    ) -> StoreResult<TentParticipant>;

    /// Deletes the participant row. Returns `true` if a row was removed.
    async fn delete_participant(&self, tent_id: &TentId, username: &str) -> StoreResult<bool>;

    /// Lists the usernames in a tent, oldest join first, excluding `username`.
    async fn list_participants_excluding(
        &self,
        tent_id: &TentId,
        username: &str,
    ) -> StoreResult<Vec<String>>;

    async fn participant_exists(&self, tent_id: &TentId, username: &str) -> StoreResult<bool>;

    /// Every participant row across every tent.
    async fn list_all_participants(&self) -> StoreResult<Vec<TentParticipant>>;

    fn backend_name(&self) -> &'static str;
}

/// In-memory [`TentStore`].
#[derive(Debug, Clone, Default)]
pub struct MemoryTentStore {
    tents: Arc<RwLock<HashMap<TentId, Tent>>>,
    // Keyed by tent, then username. BTreeMap keeps snapshot output stable.
    participants: Arc<RwLock<BTreeMap<TentId, HashMap<String, TentParticipant>>>>,
}

impl MemoryTentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store pre-populated with `tents`.
    pub fn with_tents(tents: impl IntoIterator<Item = Tent>) -> Self {
        let tents = tents
            .into_iter()
            .map(|tent| (tent.id.clone(), tent))
            .collect();
        Self {
            tents: Arc::new(RwLock::new(tents)),
            participants: Arc::default(),
        }
    }

    /// Adds or replaces a tent.
    pub async fn insert_tent(&self, tent: Tent) {
        debug!(tent_id = %tent.id, horde_id = %tent.horde_id, "Registering tent");
        self.tents.write().await.insert(tent.id.clone(), tent);
    }

    /// Removes a tent together with its participant rows.
    pub async fn remove_tent(&self, tent_id: &TentId) -> bool {
        let removed = self.tents.write().await.remove(tent_id).is_some();
        self.participants.write().await.remove(tent_id);
        removed
    }

    pub async fn tent_count(&self) -> usize {
        self.tents.read().await.len()
    }
}

#[async_trait]
impl TentStore for MemoryTentStore {
    async fn get_tent(&self, tent_id: &TentId) -> StoreResult<Option<Tent>> {
        Ok(self.tents.read().await.get(tent_id).cloned())
    }

    async fn get_or_create_participant(
        &self,
        tent_id: &TentId,
        username: &str,
    ) -> StoreResult<TentParticipant> {
        if !self.tents.read().await.contains_key(tent_id) {
            return Err(StoreError::NotFound(format!("tent {tent_id}")));
        }

        let mut participants = self.participants.write().await;
        let row = participants
            .entry(tent_id.clone())
            .or_default()
            .entry(username.to_string())
            .or_insert_with(|| {
                trace!(tent_id = %tent_id, username, "Creating participant row");
                TentParticipant {
                    tent_id: tent_id.clone(),
                    username: username.to_string(),
                    joined_at: Utc::now(),
                }
            });
        Ok(row.clone())
    }

    async fn delete_participant(&self, tent_id: &TentId, username: &str) -> StoreResult<bool> {
        let mut participants = self.participants.write().await;
        let Some(rows) = participants.get_mut(tent_id) else {
            return Ok(false);
        };
        let removed = rows.remove(username).is_some();
        if rows.is_empty() {
            participants.remove(tent_id);
        }
        Ok(removed)
    }

    async fn list_participants_excluding(
        &self,
        tent_id: &TentId,
        username: &str,
    ) -> StoreResult<Vec<String>> {
        let participants = self.participants.read().await;
        let mut rows: Vec<&TentParticipant> = participants
            .get(tent_id)
            .map(|rows| rows.values().filter(|row| row.username != username).collect())
            .unwrap_or_default();
        rows.sort_by(|a, b| {
            a.joined_at
                .cmp(&b.joined_at)
                .then_with(|| a.username.cmp(&b.username))
        });
        Ok(rows.into_iter().map(|row| row.username.clone()).collect())
    }

    async fn participant_exists(&self, tent_id: &TentId, username: &str) -> StoreResult<bool> {
        Ok(self
            .participants
            .read()
            .await
            .get(tent_id)
            .is_some_and(|rows| rows.contains_key(username)))
    }

    async fn list_all_participants(&self) -> StoreResult<Vec<TentParticipant>> {
        let participants = self.participants.read().await;
        Ok(participants
            .values()
            .flat_map(|rows| rows.values().cloned())
            .collect())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
