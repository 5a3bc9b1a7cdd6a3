//! Wire messages exchanged with tent and observer clients.
//!
//! Inbound text frames are parsed into the closed set of kinds in
//! [`Inbound`]; anything else is rejected as malformed. Outbound frames are
//! either relay-generated [`ControlMessage`]s or forwarded signaling payloads.
//! Forwarded payloads keep their key order and the exact text of their
//! numbers.
//!
//! # Example
//!
//! ```rust
//! use goldenhorde_relay::message::Inbound;
//!
//! let msg = Inbound::parse(r#"{"type":"ping","ts":1712345678.25}"#).unwrap();
//! assert!(matches!(msg, Inbound::Ping { .. }));
//!
//! let msg = Inbound::parse(r#"{"type":"offer","target_user":"bob","sdp":"v=0"}"#).unwrap();
//! assert!(matches!(msg, Inbound::Direct { ref target_user, .. } if target_user == "bob"));
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use serde_json::{Map, Value};

use crate::error::{RelayError, Result};
use crate::types::{ChannelId, TentId};

/// Field appended to every forwarded payload.
pub const SENDER_CHANNEL_FIELD: &str = "sender_channel";

const TYPE_FIELD: &str = "type";
const TARGET_FIELD: &str = "target_user";
const PING_TYPE: &str = "ping";

// ============================================================================
// Inbound
// ============================================================================

/// A parsed inbound message.
#[derive(Debug, Clone)]
pub enum Inbound {
    /// Heartbeat. `ts` is kept as the raw JSON token so it can be echoed
    /// byte-for-byte.
    Ping { ts: Option<Box<RawValue>> },

    /// Signal for one named peer. `payload` is the whole inbound object.
    Direct {
        target_user: String,
        payload: Map<String, Value>,
    },

    /// Signal for every other peer in the tent.
    Broadcast { payload: Map<String, Value> },
}

#[derive(Deserialize)]
struct PingEnvelope {
    #[serde(default)]
    ts: Option<Box<RawValue>>,
}

impl Inbound {
    /// Parses one inbound text frame.
    ///
    /// `type == "ping"` takes precedence over `target_user`.
    pub fn parse(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)
            .map_err(|err| RelayError::malformed(format!("invalid JSON: {err}")))?;
        let Value::Object(payload) = value else {
            return Err(RelayError::malformed("expected a JSON object"));
        };

        if payload.get(TYPE_FIELD).and_then(Value::as_str) == Some(PING_TYPE) {
            let envelope: PingEnvelope = serde_json::from_str(text)
                .map_err(|err| RelayError::malformed(format!("invalid ping: {err}")))?;
            return Ok(Self::Ping { ts: envelope.ts });
        }

        match payload.get(TARGET_FIELD) {
            None | Some(Value::Null) => Ok(Self::Broadcast { payload }),
            Some(Value::String(target)) if !target.is_empty() => Ok(Self::Direct {
                target_user: target.clone(),
                payload,
            }),
            Some(_) => Err(RelayError::malformed(
                "target_user must be a non-empty string",
            )),
        }
    }
}

// ============================================================================
// Outbound
// ============================================================================

/// Snapshot of participants, keyed by tent.
pub type TentUsers = BTreeMap<TentId, Vec<String>>;

/// Messages generated by the relay itself.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    ConnectInfo {
        username: String,
        other_users: Vec<String>,
    },
    Pong {
        ts: Option<Box<RawValue>>,
    },
    Error {
        target_user: String,
        message: String,
    },
    UserJoined {
        tent_id: TentId,
        username: String,
    },
    UserLeft {
        tent_id: TentId,
        username: String,
    },
    CurrentTentUsers {
        tents: TentUsers,
    },
}

/// Anything written to a client socket.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum Outbound {
    Control(ControlMessage),
    Signal(Map<String, Value>),
}

impl Outbound {
    /// Wraps a signaling payload, tagging it with the sending channel.
    pub fn signal(mut payload: Map<String, Value>, sender: &ChannelId) -> Self {
        payload.insert(
            SENDER_CHANNEL_FIELD.to_string(),
            Value::String(sender.as_str().to_string()),
        );
        Self::Signal(payload)
    }
}

impl From<ControlMessage> for Outbound {
    fn from(msg: ControlMessage) -> Self {
        Self::Control(msg)
    }
}

/// A serialized outbound frame, shared by every recipient of one fan-out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatch {
    /// Channel whose action produced this frame, if any. Group fan-out skips it.
    pub origin: Option<ChannelId>,
    /// JSON text of the frame.
    pub text: String,
}

impl Dispatch {
    pub fn new(origin: Option<ChannelId>, message: impl Into<Outbound>) -> Result<Self> {
        let text = serde_json::to_string(&message.into())
            .map_err(|err| RelayError::malformed(format!("unserializable frame: {err}")))?;
        Ok(Self { origin, text })
    }

    /// A frame not attributed to any channel.
    pub fn system(message: impl Into<Outbound>) -> Result<Self> {
        Self::new(None, message)
    }
}
