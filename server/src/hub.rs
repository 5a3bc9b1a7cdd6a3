//! Horde-wide presence observers.
//!
//! Observers join the singleton [`OBSERVER_GROUP`] and receive a
//! `current_tent_users` snapshot on connect. After that they get every
//! `user_joined` / `user_left` event published by tent sessions, unchanged.
//! The snapshot is point-in-time; clients replay later events on top of it.
//!
//! The group is joined before the snapshot is read, so events published
//! while the store is queried already sit in the outbox. The snapshot is
//! therefore handed back from [`ObserverSession::connect`] instead of being
//! queued, and the transport writes it ahead of the outbox.

use tracing::{debug, info, trace};

use crate::broadcast::OBSERVER_GROUP;
use crate::error::{RelayError, Result};
use crate::membership::MembershipError;
use crate::message::{ControlMessage, Dispatch, Inbound};
use crate::session::{Relay, SessionState};
use crate::types::{ChannelId, Identity};

/// One observer connection.
#[derive(Debug)]
pub struct ObserverSession {
    relay: Relay,
    channel: ChannelId,
    state: SessionState,
}

impl ObserverSession {
    pub fn new(relay: Relay, channel: ChannelId) -> Self {
        Self {
            relay,
            channel,
            state: SessionState::Connecting,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn channel(&self) -> &ChannelId {
        &self.channel
    }

    /// Joins the observer group and returns the participant snapshot.
    ///
    /// The returned frame must reach the client before anything in the
    /// channel's outbox. `None` means the session was already connected.
    pub async fn connect(&mut self, identity: &Identity) -> Result<Option<Dispatch>> {
        if self.state != SessionState::Connecting {
            return Ok(None);
        }
        let Some(username) = identity.username() else {
            debug!("Rejecting anonymous observer");
            self.state = SessionState::Closed;
            return Err(RelayError::AuthRequired);
        };

        self.relay.broadcaster.join_group(OBSERVER_GROUP, &self.channel);

        let tents = match self.relay.membership.snapshot().await {
            Ok(tents) => tents,
            Err(err) => {
                self.relay.broadcaster.leave_group(OBSERVER_GROUP, &self.channel);
                self.state = SessionState::Closed;
                return Err(match err {
                    MembershipError::TentNotFound(id) => RelayError::TentNotFound(id),
                    MembershipError::Store(err) => RelayError::Store(err),
                });
            }
        };

        let tent_count = tents.len();
        let snapshot = match Dispatch::system(ControlMessage::CurrentTentUsers { tents }) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                self.relay.broadcaster.leave_group(OBSERVER_GROUP, &self.channel);
                self.state = SessionState::Closed;
                return Err(err);
            }
        };
        self.state = SessionState::Active;
        info!(username, channel = %self.channel, tent_count, "Observer connected");
        Ok(Some(snapshot))
    }

    /// Answers pings. Every other frame is ignored.
    pub async fn receive(&mut self, text: &str) -> Result<()> {
        if self.state != SessionState::Active {
            return Ok(());
        }
        match Inbound::parse(text)? {
            Inbound::Ping { ts } => self.relay.reply(&self.channel, ControlMessage::Pong { ts }),
            _ => {
                trace!(channel = %self.channel, "Ignoring observer frame");
                Ok(())
            }
        }
    }

    pub async fn disconnect(&mut self, code: Option<u16>) {
        let previous = std::mem::replace(&mut self.state, SessionState::Closed);
        if previous == SessionState::Active {
            self.relay.broadcaster.leave_group(OBSERVER_GROUP, &self.channel);
            info!(channel = %self.channel, code = ?code, "Observer disconnected");
        }
    }
}
