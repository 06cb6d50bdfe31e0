//! Realtime wire envelopes.
//!
//! Every frame is one JSON object carrying a `type` discriminator. Inbound
//! frames are decoded once into [`ServerFrame`]; discriminators this client
//! does not understand decode to [`ServerFrame::Unknown`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Frames sent by the client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientFrame {
    /// Liveness check; the server answers with [`ServerFrame::Pong`].
    Ping,
}

/// Frames received from the server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerFrame {
    /// Liveness reply.
    Pong,
    /// Application message. The payload is opaque to this crate.
    Message {
        #[serde(default)]
        data: Value,
    },
    /// Any other discriminator.
    #[serde(other)]
    Unknown,
}

impl ClientFrame {
    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl ServerFrame {
    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
