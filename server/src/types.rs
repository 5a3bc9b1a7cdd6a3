//! Shared domain types for the relay.
//!
//! Tents and hordes are owned by the surrounding application; the relay only
//! references them by identifier. Channels are the relay's own unit of
//! delivery: one per live WebSocket connection.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a tent, as extracted from the connection path.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TentId(String);

impl TentId {
    /// Creates a tent id from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Parses a tent id from a path segment.
    ///
    /// Accepts one or more Unicode word characters: letters, digits and `_`,
    /// the same set a `\w+` route pattern matches. ASCII punctuation,
    /// whitespace and `/` are rejected.
    pub fn parse(segment: &str) -> Option<Self> {
        let valid = !segment.is_empty()
            && segment
                .chars()
                .all(|c| c.is_alphanumeric() || c == '_');
        valid.then(|| Self(segment.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of the horde that owns a tent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HordeId(String);

impl HordeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HordeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque name of one live transport connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(String);

impl ChannelId {
    /// Generates a fresh, process-unique channel id.
    pub fn generate() -> Self {
        Self(format!("relay.{}", Uuid::new_v4().simple()))
    }

    /// Wraps an existing channel name (e.g. one read back from the cache).
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A voice room within a horde.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tent {
    pub id: TentId,
    pub name: String,
    pub horde_id: HordeId,
}

/// A (tent, user) membership record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TentParticipant {
    pub tent_id: TentId,
    pub username: String,
    pub joined_at: DateTime<Utc>,
}

/// Result of resolving a connection's credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    /// An authenticated user with a stable username.
    User { username: String },
    /// No valid credentials were presented.
    Anonymous,
}

impl Identity {
    pub fn user(username: impl Into<String>) -> Self {
        Self::User {
            username: username.into(),
        }
    }

    /// Returns the username, or `None` for anonymous connections.
    pub fn username(&self) -> Option<&str> {
        match self {
            Self::User { username } => Some(username),
            Self::Anonymous => None,
        }
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, Self::Anonymous)
    }
}
