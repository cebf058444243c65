use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{ProtoError, Result};

/// Numeric channel identifier.
pub type ChannelId = u32;

/// Longest accepted display name, in characters.
pub const MAX_NAME_LEN: usize = 32;

/// A request sent by a client.
///
/// Unknown fields are ignored. The `type` tag is accepted in lower, Title or
/// UPPER case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    /// Enter a channel. From the lobby this must carry `user_name`; from
    /// inside a channel it is a switch (or a rejoin of the same channel).
    #[serde(alias = "Join", alias = "JOIN")]
    Join {
        channel_id: ChannelId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Chat text for the sender's current channel. The client's timestamp
    /// orders the text within its broadcast window and is required.
    #[serde(alias = "Message", alias = "MESSAGE")]
    Message { text: String, timestamp: u64 },
}

impl ClientMessage {
    /// Parse one frame payload.
    pub fn from_slice(payload: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }

    /// Serialize into a frame payload.
    pub fn to_bytes(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn timestamp(&self) -> Option<u64> {
        match self {
            Self::Join { timestamp, .. } => *timestamp,
            Self::Message { timestamp, .. } => Some(*timestamp),
        }
    }
}

/// Check a display name, returning it trimmed.
pub fn validate_name(name: &str) -> Result<&str> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(ProtoError::NameRequired);
    }
    let len = trimmed.chars().count();
    if len > MAX_NAME_LEN {
        return Err(ProtoError::NameTooLong {
            len,
            max: MAX_NAME_LEN,
        });
    }
    Ok(trimmed)
}
