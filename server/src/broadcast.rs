//! Group fan-out for connected channels.
//!
//! This module provides the delivery layer behind every tent and observer
//! session. Each live connection registers a channel and receives an
//! [`Outbox`]; the transport drains that outbox into its socket.
//!
//! # Architecture
//!
//! - **Channel registry**: channel id to the sending half of its outbox
//! - **Group membership**: group name to the set of channel ids subscribed
//!
//! Both maps are [`DashMap`]s, so joins, leaves, and fan-out on different
//! groups never contend on a single lock. Fan-out takes a copy of the
//! group's members before sending, which makes delivery best-effort: a
//! channel that leaves mid-dispatch is silently skipped.
//!
//! Group membership is local to this process.
//!
//! Outboxes are bounded. A channel whose client stops reading fills up
//! after [`DEFAULT_OUTBOX_CAPACITY`] frames; further frames for it are
//! dropped and logged, and other channels are unaffected.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use goldenhorde_relay::broadcast::{tent_group, GroupBroadcaster};
//! use goldenhorde_relay::message::{ControlMessage, Dispatch};
//! use goldenhorde_relay::types::TentId;
//!
//! let broadcaster = GroupBroadcaster::new();
//! let (channel, mut outbox) = broadcaster.register();
//! let group = tent_group(&TentId::new("7"));
//! broadcaster.join_group(&group, &channel);
//!
//! let pong = Dispatch::system(ControlMessage::Pong { ts: None }).unwrap();
//! assert_eq!(broadcaster.broadcast(&group, Arc::new(pong)), 1);
//! assert!(outbox.try_recv().is_ok());
//! ```

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc::{self, error::TrySendError, Receiver, Sender};
use tracing::{debug, trace, warn};

use crate::message::Dispatch;
use crate::types::{ChannelId, TentId};

/// Name of the horde-wide observer group.
pub const OBSERVER_GROUP: &str = "tent-events";

/// Frames a single outbox holds before new frames are dropped.
pub const DEFAULT_OUTBOX_CAPACITY: usize = 1000;

/// Receiving half of a channel's outbox.
pub type Outbox = Receiver<Arc<Dispatch>>;

/// Name of the per-tent fan-out group.
pub fn tent_group(tent_id: &TentId) -> String {
    format!("voice:{tent_id}")
}

#[derive(Debug, Default)]
struct Registry {
    channels: DashMap<ChannelId, Sender<Arc<Dispatch>>>,
    groups: DashMap<String, HashSet<ChannelId>>,
}

/// Process-wide channel registry and group fan-out.
///
/// `GroupBroadcaster` is cheap to clone; clones share the same registry.
#[derive(Debug, Clone)]
pub struct GroupBroadcaster {
    registry: Arc<Registry>,
    capacity: usize,
}

impl Default for GroupBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl GroupBroadcaster {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_OUTBOX_CAPACITY)
    }

    /// Creates a broadcaster whose outboxes hold at most `capacity` frames.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is 0.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "outbox capacity must be greater than 0");
        Self {
            registry: Arc::new(Registry::default()),
            capacity,
        }
    }

    /// Frames each outbox holds before new frames are dropped.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Registers a new channel and returns its id and outbox.
    pub fn register(&self) -> (ChannelId, Outbox) {
        let channel = ChannelId::generate();
        let (sender, outbox) = mpsc::channel(self.capacity);
        self.registry.channels.insert(channel.clone(), sender);
        debug!(channel = %channel, channels = self.channel_count(), "Channel registered");
        (channel, outbox)
    }

    /// Drops a channel and removes it from every group it is still in.
    ///
    /// Once the last sender is gone the channel's outbox reports closed.
    pub fn unregister(&self, channel: &ChannelId) {
        self.registry.channels.remove(channel);
        self.registry.groups.retain(|_, members| {
            members.remove(channel);
            !members.is_empty()
        });
        debug!(channel = %channel, channels = self.channel_count(), "Channel unregistered");
    }

    /// Adds a channel to a group. Joining twice is a no-op.
    pub fn join_group(&self, group: &str, channel: &ChannelId) {
        let inserted = self
            .registry
            .groups
            .entry(group.to_string())
            .or_default()
            .insert(channel.clone());
        trace!(group, channel = %channel, inserted, "Joined group");
    }

    /// Removes a channel from a group. Leaving a group not joined is a no-op.
    pub fn leave_group(&self, group: &str, channel: &ChannelId) {
        let removed = self
            .registry
            .groups
            .get_mut(group)
            .is_some_and(|mut members| members.remove(channel));
        self.registry
            .groups
            .remove_if(group, |_, members| members.is_empty());
        trace!(group, channel = %channel, removed, "Left group");
    }

    /// Delivers `dispatch` to every channel in `group` except its origin.
    ///
    /// Returns the number of channels the frame was handed to.
    pub fn broadcast(&self, group: &str, dispatch: Arc<Dispatch>) -> usize {
        let members: Vec<ChannelId> = match self.registry.groups.get(group) {
            Some(members) => members.iter().cloned().collect(),
            None => {
                trace!(group, "Broadcast to empty group");
                return 0;
            }
        };

        let delivered = members
            .iter()
            .filter(|channel| dispatch.origin.as_ref() != Some(*channel))
            .filter(|channel| self.deliver(channel, Arc::clone(&dispatch)))
            .count();

        trace!(group, members = members.len(), delivered, "Broadcast dispatched");
        delivered
    }

    /// Delivers `dispatch` to one channel. Returns `false` if the channel is
    /// gone or its outbox is full; the frame is then dropped.
    pub fn send_direct(&self, channel: &ChannelId, dispatch: Arc<Dispatch>) -> bool {
        let delivered = self.deliver(channel, dispatch);
        if !delivered {
            trace!(channel = %channel, "Direct send dropped");
        }
        delivered
    }

    /// Returns `true` if the channel is a member of the group.
    #[must_use]
    pub fn is_member(&self, group: &str, channel: &ChannelId) -> bool {
        self.registry
            .groups
            .get(group)
            .is_some_and(|members| members.contains(channel))
    }

    #[must_use]
    pub fn group_size(&self, group: &str) -> usize {
        self.registry
            .groups
            .get(group)
            .map_or(0, |members| members.len())
    }

    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.registry.channels.len()
    }

    /// Number of non-empty groups.
    #[must_use]
    pub fn group_count(&self) -> usize {
        self.registry.groups.len()
    }

    fn deliver(&self, channel: &ChannelId, dispatch: Arc<Dispatch>) -> bool {
        // Clone the sender so no map guard is held while sending.
        let Some(sender) = self
            .registry
            .channels
            .get(channel)
            .map(|entry| entry.value().clone())
        else {
            return false;
        };
        match sender.try_send(dispatch) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(channel = %channel, capacity = self.capacity, "Outbox full, dropping frame");
                false
            }
            Err(TrySendError::Closed(_)) => {
                trace!(channel = %channel, "Outbox closed, dropping frame");
                false
            }
        }
    }
}
