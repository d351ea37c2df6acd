//! JSON wire frames. Every payload carries a `type` discriminator; the
//! server ignores anything it does not recognize, and so do we.

use serde::{Deserialize, Serialize};

use crate::error::ChannelError;

/// Frames this client transmits.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    Message { sender: String, content: String },
    ClearHistory,
}

impl OutboundFrame {
    pub fn message(sender: impl Into<String>, content: impl Into<String>) -> Self {
        Self::Message {
            sender: sender.into(),
            content: content.into(),
        }
    }

    pub fn encode(&self) -> Result<String, ChannelError> {
        serde_json::to_string(self).map_err(|e| ChannelError::MalformedFrame(e.to_string()))
    }
}

/// Frames the server transmits.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundFrame {
    Message { sender: String, content: String },
    Error { content: String },
    System { content: String },
}

impl InboundFrame {
    pub fn decode(raw: &str) -> Result<Self, ChannelError> {
        serde_json::from_str(raw).map_err(|e| ChannelError::MalformedFrame(e.to_string()))
    }
}
