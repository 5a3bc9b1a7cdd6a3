//! Tent membership operations over the participant store.
//!
//! This is the source of truth for who is in a tent. It deliberately keeps
//! no cache of its own: every call goes to the [`TentStore`]. Routing
//! (which channel reaches a user) is the presence cache's business.

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, trace};

use crate::store::{StoreError, TentStore};
use crate::types::TentId;

#[derive(Debug, Error)]
pub enum MembershipError {
    /// The tent id does not resolve to an existing tent.
    #[error("tent {0} not found")]
    TentNotFound(TentId),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type MembershipResult<T> = Result<T, MembershipError>;

/// Point-in-time listing of every tent's participants.
pub type TentSnapshot = BTreeMap<TentId, Vec<String>>;

#[derive(Clone)]
pub struct TentMembership {
    store: Arc<dyn TentStore>,
}

impl TentMembership {
    pub fn new(store: Arc<dyn TentStore>) -> Self {
        Self { store }
    }

    /// Returns whether the tent exists.
    pub async fn tent_exists(&self, tent_id: &TentId) -> MembershipResult<bool> {
        Ok(self.store.get_tent(tent_id).await?.is_some())
    }

    /// Adds `username` to the tent. Joining twice is a no-op.
    pub async fn join(&self, tent_id: &TentId, username: &str) -> MembershipResult<()> {
        match self.store.get_or_create_participant(tent_id, username).await {
            Ok(row) => {
                debug!(tent_id = %tent_id, username, joined_at = %row.joined_at, "Participant joined");
                Ok(())
            }
            Err(StoreError::NotFound(_)) => Err(MembershipError::TentNotFound(tent_id.clone())),
            Err(err) => Err(err.into()),
        }
    }

    /// Removes `username` from the tent. Leaving when absent is not an error.
    pub async fn leave(&self, tent_id: &TentId, username: &str) -> MembershipResult<()> {
        let removed = self.store.delete_participant(tent_id, username).await?;
        trace!(tent_id = %tent_id, username, removed, "Participant left");
        Ok(())
    }

    /// Lists the tent's participants other than `username`.
    pub async fn list_others(&self, tent_id: &TentId, username: &str) -> MembershipResult<Vec<String>> {
        Ok(self
            .store
            .list_participants_excluding(tent_id, username)
            .await?)
    }

    pub async fn is_participant(&self, tent_id: &TentId, username: &str) -> MembershipResult<bool> {
        Ok(self.store.participant_exists(tent_id, username).await?)
    }

    /// Groups every participant row by tent.
    ///
    /// Usernames within a tent are ordered by join time.
    pub async fn snapshot(&self) -> MembershipResult<TentSnapshot> {
        let mut rows = self.store.list_all_participants().await?;
        rows.sort_by(|a, b| {
            a.joined_at
                .cmp(&b.joined_at)
                .then_with(|| a.username.cmp(&b.username))
        });

        let mut snapshot = TentSnapshot::new();
        for row in rows {
            snapshot.entry(row.tent_id).or_default().push(row.username);
        }
        Ok(snapshot)
    }
}

impl std::fmt::Debug for TentMembership {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TentMembership")
            .field("store", &self.store.backend_name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryTentStore;
    use crate::types::{HordeId, Tent};

    fn membership(tent_ids: &[&str]) -> TentMembership {
        let store = MemoryTentStore::with_tents(tent_ids.iter().map(|id| Tent {
            id: TentId::new(*id),
            name: format!("Tent {id}"),
            horde_id: HordeId::new("1"),
        }));
        TentMembership::new(Arc::new(store))
    }

    #[tokio::test]
    async fn join_unknown_tent_is_not_found() {
        let membership = membership(&[]);
        let err = membership.join(&TentId::new("7"), "alice").await.unwrap_err();
        assert!(matches!(err, MembershipError::TentNotFound(ref id) if id.as_str() == "7"));
    }

    #[tokio::test]
    async fn join_is_idempotent() {
        let membership = membership(&["7"]);
        let tent = TentId::new("7");

        membership.join(&tent, "alice").await.unwrap();
        membership.join(&tent, "alice").await.unwrap();
        membership.join(&tent, "bob").await.unwrap();

        assert_eq!(membership.list_others(&tent, "bob").await.unwrap(), vec!["alice"]);
    }

    #[tokio::test]
    async fn leave_twice_is_not_an_error() {
        let membership = membership(&["7"]);
        let tent = TentId::new("7");

        membership.join(&tent, "alice").await.unwrap();
        membership.leave(&tent, "alice").await.unwrap();
        membership.leave(&tent, "alice").await.unwrap();

        assert!(!membership.is_participant(&tent, "alice").await.unwrap());
        assert!(membership.snapshot().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_others_excludes_caller() {
        let membership = membership(&["7"]);
        let tent = TentId::new("7");

        membership.join(&tent, "alice").await.unwrap();
        assert!(membership.list_others(&tent, "alice").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn every_member_sees_each_other_exactly_once() {
        let membership = membership(&["7"]);
        let tent = TentId::new("7");
        let users = ["alice", "bob", "carol"];

        for user in users {
            membership.join(&tent, user).await.unwrap();
        }

        for viewer in users {
            let others = membership.list_others(&tent, viewer).await.unwrap();
            for user in users.iter().filter(|u| **u != viewer) {
                assert_eq!(others.iter().filter(|o| o == user).count(), 1);
            }
            assert!(!others.iter().any(|o| o == viewer));
        }
    }

    #[tokio::test]
    async fn tent_exists_checks_store() {
        let membership = membership(&["7"]);
        assert!(membership.tent_exists(&TentId::new("7")).await.unwrap());
        assert!(!membership.tent_exists(&TentId::new("8")).await.unwrap());
    }

    #[tokio::test]
    async fn snapshot_groups_by_tent() {
        let membership = membership(&["7", "8"]);

        membership.join(&TentId::new("7"), "alice").await.unwrap();
        membership.join(&TentId::new("8"), "carol").await.unwrap();
        membership.join(&TentId::new("7"), "bob").await.unwrap();

        let snapshot = membership.snapshot().await.unwrap();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[&TentId::new("7")].len(), 2);
        assert!(snapshot[&TentId::new("7")].contains(&"alice".to_string()));
        assert!(snapshot[&TentId::new("7")].contains(&"bob".to_string()));
        assert_eq!(snapshot[&TentId::new("8")], vec!["carol".to_string()]);
    }
}
