//! Error types for the relay.
//!
//! This module defines the failure taxonomy of a tent session. Only a few of
//! these end a connection; the rest are reported back to the sender as an
//! `error` message, or swallowed and logged.
//!
//! # Error Types
//!
//! - [`RelayError::AuthRequired`] - anonymous connection attempt (fatal)
//! - [`RelayError::TentNotFound`] - unknown tent at connect (fatal, unwinds)
//! - [`RelayError::NotAParticipant`] - direct-message target not in the tent
//! - [`RelayError::TargetNotConnected`] - direct-message target has no live channel
//! - [`RelayError::CacheBackend`] - presence cache unreachable (only from direct backend use; sessions degrade instead)
//! - [`RelayError::MalformedMessage`] - inbound payload could not be interpreted (dropped)
//! - [`RelayError::Store`] - participant store failure
//!
//! # Example
//!
//! ```rust
//! use goldenhorde_relay::error::RelayError;
//!
//! let err = RelayError::not_a_participant("bob");
//! assert!(!err.is_fatal());
//! assert_eq!(err.to_string(), "bob is not a participant of this tent");
//! ```

use thiserror::Error;

use crate::cache::CacheError;
use crate::store::StoreError;
use crate::types::TentId;

/// WebSocket close code sent when credentials are missing or invalid.
pub const CLOSE_AUTH_REQUIRED: u16 = 4001;

/// WebSocket close code sent when the requested tent does not exist.
pub const CLOSE_TENT_NOT_FOUND: u16 = 4004;

/// WebSocket close code for unexpected server-side failures (RFC 6455).
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// Failures a tent or observer session can run into.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The connection did not resolve to an authenticated user.
    #[error("authentication required")]
    AuthRequired,

    /// The tent id in the connection path does not name an existing tent.
    #[error("tent {0} does not exist")]
    TentNotFound(TentId),

    /// A direct message named a user who is not a member of the tent.
    #[error("{target} is not a participant of this tent")]
    NotAParticipant {
        /// The username from `target_user`.
        target: String,
    },

    /// A direct message named a member with no live channel.
    #[error("{target} is not currently connected")]
    TargetNotConnected {
        /// The username from `target_user`.
        target: String,
    },

    /// The presence cache could not be reached.
    ///
    /// Sessions never return this: [`PresenceCache`](crate::presence::PresenceCache)
    /// logs backend failures and carries on. The variant lets code that talks
    /// to a [`CacheBackend`](crate::cache::CacheBackend) directly use `?` on a
    /// [`CacheError`]; it is neither fatal nor reported to the client.
    #[error("presence cache unavailable: {0}")]
    CacheBackend(#[from] CacheError),

    /// The inbound payload was not a JSON object of the expected shape.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// The participant store failed.
    #[error("participant store failure: {0}")]
    Store(#[from] StoreError),
}

impl RelayError {
    pub fn not_a_participant(target: impl Into<String>) -> Self {
        Self::NotAParticipant {
            target: target.into(),
        }
    }

    pub fn target_not_connected(target: impl Into<String>) -> Self {
        Self::TargetNotConnected {
            target: target.into(),
        }
    }

    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedMessage(reason.into())
    }

    /// Returns `true` if this error must close the connection.
    ///
    /// Only connect-time failures are fatal. Everything raised while a
    /// session is active is reported or dropped and the session continues.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::AuthRequired | Self::TentNotFound(_) | Self::Store(_)
        )
    }

    /// Returns `true` if this error is reported back to the sender as an
    /// `error` message.
    pub fn is_reportable(&self) -> bool {
        matches!(
            self,
            Self::NotAParticipant { .. } | Self::TargetNotConnected { .. }
        )
    }

    /// The WebSocket close code used when this error ends a connection.
    pub fn close_code(&self) -> u16 {
        match self {
            Self::AuthRequired => CLOSE_AUTH_REQUIRED,
            Self::TentNotFound(_) => CLOSE_TENT_NOT_FOUND,
            _ => CLOSE_INTERNAL_ERROR,
        }
    }
}

/// A specialized Result type for session operations.
pub type Result<T> = std::result::Result<T, RelayError>;
