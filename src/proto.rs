//! Wire envelope and event tags for the duplex io channel.
//!
//! Every frame in both directions is a JSON object `{"name": .., "payload": ..}`.
//! Frames that do not decode as that shape are degraded to a `raw` event
//! carrying the original text, never dropped.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Closed set of event tags carried over the channel.
///
/// Lifecycle: `scan`, `login`, `logout`, `reset`, `shutdown`. Liveness:
/// `ding`, `dong`, `heartbeat`. Data: `message`, `update`, `error`. `sys` is
/// server-originated; `raw` wraps frames that failed to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IoEventName {
    Scan,
    Login,
    Logout,
    Reset,
    Shutdown,
    Ding,
    Dong,
    Heartbeat,
    Message,
    Update,
    Error,
    Sys,
    Raw,
}

impl fmt::Display for IoEventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            IoEventName::Scan => "scan",
            IoEventName::Login => "login",
            IoEventName::Logout => "logout",
            IoEventName::Reset => "reset",
            IoEventName::Shutdown => "shutdown",
            IoEventName::Ding => "ding",
            IoEventName::Dong => "dong",
            IoEventName::Heartbeat => "heartbeat",
            IoEventName::Message => "message",
            IoEventName::Update => "update",
            IoEventName::Error => "error",
            IoEventName::Sys => "sys",
            IoEventName::Raw => "raw",
        };
        f.write_str(tag)
    }
}

/// A single unit of application communication: a tagged payload.
///
/// Immutable once constructed; forwarded exactly once to its destination
/// (the socket for outbound events, the subscriber sequence for inbound).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IoEvent {
    pub name: IoEventName,
    #[serde(default)]
    pub payload: Value,
}

impl IoEvent {
    /// Creates an event with the given tag and payload.
    pub fn new(name: IoEventName, payload: impl Into<Value>) -> Self {
        Self {
            name,
            payload: payload.into(),
        }
    }

    /// Wraps raw frame text as a `raw` event.
    pub fn raw(text: &str) -> Self {
        Self {
            name: IoEventName::Raw,
            payload: Value::String(text.to_string()),
        }
    }

    /// Decodes an inbound frame, degrading to `raw` when the text is not a
    /// well-formed envelope.
    pub fn from_frame(text: &str) -> Self {
        serde_json::from_str(text).unwrap_or_else(|_| Self::raw(text))
    }

    /// Encodes the event as wire text.
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
