//! WebSocket Message Types
//!
//! Wire formats exchanged between the hub and its clients.
//!
//! Hub → client: `{"channel": "...", "type": "...", "data": ...}`
//!
//! Client → hub: `{"type": "subscribe", "channel": "..."}` or
//! `{"type": "unsubscribe", "channel": "..."}`. Anything else is ignored.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Topic that addresses every registered connection regardless of subscription
pub const BROADCAST_TOPIC: &str = "*";

/// An encoded outbound message.
///
/// Encoded once per delivery attempt and shared by every recipient.
pub type Frame = Arc<str>;

/// A message published through the hub
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Topic the message is addressed to (`*` reaches everyone)
    pub channel: String,
    /// Caller-defined payload discriminator
    #[serde(rename = "type")]
    pub kind: String,
    /// Arbitrary JSON payload
    pub data: Value,
}

impl Message {
    pub fn new(channel: impl Into<String>, kind: impl Into<String>, data: Value) -> Self {
        Self {
            channel: channel.into(),
            kind: kind.into(),
            data,
        }
    }

    /// Whether this message targets every connection
    pub fn is_broadcast(&self) -> bool {
        self.channel == BROADCAST_TOPIC
    }

    /// Encode into a shareable wire frame
    pub fn encode(&self) -> Result<Frame, serde_json::Error> {
        serde_json::to_string(self).map(Frame::from)
    }
}

/// Control frames sent from client to hub
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Start receiving messages for a channel or pattern
    Subscribe { channel: String },
    /// Stop receiving messages for a channel or pattern
    Unsubscribe { channel: String },
}

impl ClientMessage {
    /// Parse a text or binary payload. Returns `None` for anything that is
    /// not a well-formed control frame.
    pub fn parse(payload: &[u8]) -> Option<Self> {
        serde_json::from_slice(payload).ok()
    }
}
