//! Per-connection state machine for tent voice sessions.
//!
//! A [`TentSession`] drives one user's connection to one tent:
//!
//! ```text
//! Connecting --connect()--> Active --disconnect()--> Closed
//!      \                                              ^
//!       `--------------- connect() fails ------------'
//! ```
//!
//! The session never touches the socket. Everything it sends goes through
//! the [`GroupBroadcaster`], including frames addressed to its own channel,
//! so a transport only has to drain the channel's outbox.
//!
//! Calls on one session are sequential: the transport awaits each
//! [`TentSession::receive`] before reading the next frame.

use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use crate::broadcast::{tent_group, GroupBroadcaster, OBSERVER_GROUP};
use crate::error::{RelayError, Result};
use crate::membership::{MembershipError, TentMembership};
use crate::message::{ControlMessage, Dispatch, Inbound, Outbound};
use crate::presence::PresenceCache;
use crate::types::{ChannelId, Identity, TentId};

/// Shared collaborators handed to every session.
#[derive(Debug, Clone)]
pub struct Relay {
    pub broadcaster: GroupBroadcaster,
    pub presence: PresenceCache,
    pub membership: TentMembership,
}

impl Relay {
    pub fn new(
        broadcaster: GroupBroadcaster,
        presence: PresenceCache,
        membership: TentMembership,
    ) -> Self {
        Self {
            broadcaster,
            presence,
            membership,
        }
    }

    /// Sends a relay-generated frame to one channel.
    pub(crate) fn reply(&self, channel: &ChannelId, message: ControlMessage) -> Result<()> {
        let dispatch = Dispatch::system(message)?;
        self.broadcaster.send_direct(channel, Arc::new(dispatch));
        Ok(())
    }

    /// Publishes a presence event to the tent group and the observer group.
    ///
    /// The originating channel is skipped in both.
    pub(crate) fn publish_presence(&self, origin: &ChannelId, tent_id: &TentId, event: ControlMessage) -> Result<()> {
        let dispatch = Arc::new(Dispatch::new(Some(origin.clone()), event)?);
        let tent_peers = self
            .broadcaster
            .broadcast(&tent_group(tent_id), Arc::clone(&dispatch));
        let observers = self.broadcaster.broadcast(OBSERVER_GROUP, dispatch);
        trace!(tent_id = %tent_id, tent_peers, observers, "Presence event published");
        Ok(())
    }
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active,
    Closed,
}

/// One user's connection to one tent.
#[derive(Debug)]
pub struct TentSession {
    relay: Relay,
    tent_id: TentId,
    channel: ChannelId,
    group: String,
    username: Option<String>,
    state: SessionState,
}

impl TentSession {
    /// Creates a session for an already registered channel.
    pub fn new(relay: Relay, tent_id: TentId, channel: ChannelId) -> Self {
        let group = tent_group(&tent_id);
        Self {
            relay,
            tent_id,
            channel,
            group,
            username: None,
            state: SessionState::Connecting,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn tent_id(&self) -> &TentId {
        &self.tent_id
    }

    pub fn channel(&self) -> &ChannelId {
        &self.channel
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    /// Brings the session from `Connecting` to `Active`.
    ///
    /// On error the session is `Closed` and every registration made so far
    /// has been rolled back. Only [`RelayError::is_fatal`] errors are
    /// returned.
    pub async fn connect(&mut self, identity: &Identity) -> Result<()> {
        if self.state != SessionState::Connecting {
            debug!(channel = %self.channel, state = ?self.state, "Ignoring connect in wrong state");
            return Ok(());
        }

        let Some(username) = identity.username().map(str::to_string) else {
            debug!(tent_id = %self.tent_id, "Rejecting anonymous tent connection");
            self.state = SessionState::Closed;
            return Err(RelayError::AuthRequired);
        };

        let presence = &self.relay.presence;
        presence
            .set_channel(&username, &self.channel, presence.active_ttl())
            .await;
        self.relay.broadcaster.join_group(&self.group, &self.channel);

        if let Err(err) = self.enter_tent(&username).await {
            warn!(
                tent_id = %self.tent_id,
                username = %username,
                error = %err,
                "Tent connection refused"
            );
            self.unwind(&username).await;
            self.state = SessionState::Closed;
            return Err(err);
        }

        self.state = SessionState::Active;
        self.username = Some(username.clone());
        info!(tent_id = %self.tent_id, username = %username, channel = %self.channel, "Joined tent");

        let joined = ControlMessage::UserJoined {
            tent_id: self.tent_id.clone(),
            username,
        };
        if let Err(err) = self.relay.publish_presence(&self.channel, &self.tent_id, joined) {
            warn!(tent_id = %self.tent_id, error = %err, "Could not publish user_joined");
        }
        Ok(())
    }

    /// Handles one inbound text frame.
    ///
    /// Routing failures are reported to the sender as an `error` frame and
    /// return `Ok`. Malformed frames are dropped and returned as
    /// [`RelayError::MalformedMessage`] for the caller to log.
    pub async fn receive(&mut self, text: &str) -> Result<()> {
        let Some(username) = self.active_username() else {
            trace!(channel = %self.channel, state = ?self.state, "Dropping frame outside active state");
            return Ok(());
        };

        let result = match Inbound::parse(text)? {
            Inbound::Ping { ts } => self.heartbeat(&username, ts).await,
            Inbound::Direct {
                target_user,
                payload,
            } => self.send_to_peer(&username, &target_user, payload).await,
            Inbound::Broadcast { payload } => self.broadcast_signal(&username, payload),
        };

        match result {
            Err(err) if err.is_reportable() => {
                debug!(username = %username, error = %err, "Signal not delivered");
                let target_user = match &err {
                    RelayError::NotAParticipant { target } | RelayError::TargetNotConnected { target } => {
                        target.clone()
                    }
                    _ => String::new(),
                };
                self.relay.reply(
                    &self.channel,
                    ControlMessage::Error {
                        target_user,
                        message: err.to_string(),
                    },
                )
            }
            other => other,
        }
    }

    /// Tears the session down.
    ///
    /// Every cleanup step is attempted regardless of the outcome of the
    /// previous ones. Calling this on a session that never became active
    /// only marks it closed.
    pub async fn disconnect(&mut self, code: Option<u16>) {
        let previous = std::mem::replace(&mut self.state, SessionState::Closed);
        let (SessionState::Active, Some(username)) = (previous, self.username.clone()) else {
            trace!(channel = %self.channel, state = ?previous, "Disconnect on inactive session");
            return;
        };

        let presence = &self.relay.presence;
        let channel_removed = presence.delete_channel(&username).await;
        let tent_removed = presence.delete_tent(&username).await;
        self.relay.broadcaster.leave_group(&self.group, &self.channel);
        if let Err(err) = self.relay.membership.leave(&self.tent_id, &username).await {
            warn!(tent_id = %self.tent_id, username = %username, error = %err, "Could not remove participant");
        }

        let left = ControlMessage::UserLeft {
            tent_id: self.tent_id.clone(),
            username: username.clone(),
        };
        if let Err(err) = self.relay.publish_presence(&self.channel, &self.tent_id, left) {
            warn!(tent_id = %self.tent_id, error = %err, "Could not publish user_left");
        }

        info!(
            tent_id = %self.tent_id,
            username = %username,
            code = ?code,
            channel_removed,
            tent_removed,
            "Left tent"
        );
    }

    // ========================================================================
    // Connect steps
    // ========================================================================

    /// Resolves the tent, persists membership, records the
    /// current tent and greets the caller.
    async fn enter_tent(&self, username: &str) -> Result<()> {
        let membership = &self.relay.membership;
        let fatal = |err: MembershipError| match err {
            MembershipError::TentNotFound(id) => RelayError::TentNotFound(id),
            MembershipError::Store(err) => RelayError::Store(err),
        };

        if !membership.tent_exists(&self.tent_id).await.map_err(fatal)? {
            return Err(RelayError::TentNotFound(self.tent_id.clone()));
        }
        membership.join(&self.tent_id, username).await.map_err(fatal)?;

        let presence = &self.relay.presence;
        presence
            .set_tent(username, &self.tent_id, presence.active_ttl())
            .await;

        let other_users = match membership.list_others(&self.tent_id, username).await {
            Ok(others) => others,
            Err(err) => {
                // The row was already written; drop it again before bailing out.
                if let Err(leave_err) = membership.leave(&self.tent_id, username).await {
                    warn!(
                        tent_id = %self.tent_id,
                        username,
                        error = %leave_err,
                        "Could not roll back participant row"
                    );
                }
                return Err(fatal(err));
            }
        };

        self.relay.reply(
            &self.channel,
            ControlMessage::ConnectInfo {
                username: username.to_string(),
                other_users,
            },
        )
    }

    /// Rolls back the cache and group registration of a failed connect.
    async fn unwind(&self, username: &str) {
        let presence = &self.relay.presence;
        // A concurrent session for the same user may own the entries by now.
        if presence.get_channel(username).await.as_ref() == Some(&self.channel) {
            presence.delete_channel(username).await;
            if presence.get_tent(username).await.as_ref() == Some(&self.tent_id) {
                presence.delete_tent(username).await;
            }
        }
        self.relay.broadcaster.leave_group(&self.group, &self.channel);
    }

    // ========================================================================
    // Inbound dispatch
    // ========================================================================

    fn active_username(&self) -> Option<String> {
        match self.state {
            SessionState::Active => self.username.clone(),
            _ => None,
        }
    }

    async fn heartbeat(&self, username: &str, ts: Option<Box<serde_json::value::RawValue>>) -> Result<()> {
        let (channel_extended, tent_extended) = self.relay.presence.heartbeat(username).await;
        trace!(username, channel_extended, tent_extended, "Heartbeat");
        self.relay.reply(&self.channel, ControlMessage::Pong { ts })
    }

    async fn send_to_peer(
        &self,
        username: &str,
        target: &str,
        payload: serde_json::Map<String, serde_json::Value>,
    ) -> Result<()> {
        let is_member = match self.relay.membership.is_participant(&self.tent_id, target).await {
            Ok(is_member) => is_member,
            Err(err) => {
                warn!(tent_id = %self.tent_id, target, error = %err, "Membership check failed");
                false
            }
        };
        if !is_member {
            return Err(RelayError::not_a_participant(target));
        }

        let Some(target_channel) = self.relay.presence.get_channel(target).await else {
            return Err(RelayError::target_not_connected(target));
        };

        let dispatch = Dispatch::new(
            Some(self.channel.clone()),
            Outbound::signal(payload, &self.channel),
        )?;
        let delivered = self
            .relay
            .broadcaster
            .send_direct(&target_channel, Arc::new(dispatch));
        trace!(from = username, to = target, delivered, "Direct signal");
        Ok(())
    }

    fn broadcast_signal(
        &self,
        username: &str,
        payload: serde_json::Map<String, serde_json::Value>,
    ) -> Result<()> {
        let dispatch = Dispatch::new(
            Some(self.channel.clone()),
            Outbound::signal(payload, &self.channel),
        )?;
        let delivered = self.relay.broadcaster.broadcast(&self.group, Arc::new(dispatch));
        trace!(from = username, group = %self.group, delivered, "Broadcast signal");
        Ok(())
    }
}
