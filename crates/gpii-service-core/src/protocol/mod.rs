//! The wire protocol spoken with the user process: length-prefixed JSON
//! frames carrying tagged messages.
//!
//! A message is `{"type": <string>, "payload": <any JSON>}`. The transport
//! layer only interprets a handful of reserved types ([`Message::PING`],
//! [`Message::PONG`], [`Message::ERROR`], [`Message::HELLO`]); everything
//! else is republished on the event bus untouched.

mod framing;

pub use framing::{FrameCodec, MessageCodec, MAX_FRAME_SIZE};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A tagged message exchanged with the user process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Message tag; unknown tags are forwarded, never rejected.
    #[serde(rename = "type")]
    pub kind: String,

    /// Arbitrary JSON payload.
    #[serde(default)]
    pub payload: Value,
}

impl Message {
    /// Liveness probe; answered with [`Self::PONG`] carrying the same payload.
    pub const PING: &'static str = "ping";
    /// Reply to [`Self::PING`].
    pub const PONG: &'static str = "pong";
    /// Reported by either side; a transport no-op, still republished.
    pub const ERROR: &'static str = "error";
    /// Heartbeat, sent at 1 Hz while the child is connected.
    pub const HELLO: &'static str = "hello";

    /// Build a message.
    #[must_use]
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }
}

/// Errors produced while framing or parsing protocol traffic.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// A frame length exceeded the protocol cap.
    #[error("frame of {size} bytes exceeds maximum {max}")]
    FrameTooLarge {
        /// Claimed or actual frame size.
        size: usize,
        /// The enforced cap.
        max: usize,
    },

    /// The stream failed underneath the codec.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A frame did not hold valid message JSON.
    #[error("invalid message frame: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn message_serializes_with_type_tag() {
        let msg = Message::new("hello", json!({"cwd": "C:\\Users\\a"}));
        let text = serde_json::to_string(&msg).unwrap();
        assert!(text.starts_with(r#"{"type":"hello""#));
        let back: Message = serde_json::from_str(&text).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn missing_payload_defaults_to_null() {
        let msg: Message = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(msg.kind, "ping");
        assert!(msg.payload.is_null());
    }
}
