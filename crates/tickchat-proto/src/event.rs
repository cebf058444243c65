use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::message::ChannelId;

/// Whether an event came from a user or from the server itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    User,
    System,
}

/// Membership changes announced as system events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemEvent {
    Join,
    Leave,
    Rejoin,
}

impl SystemEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Join => "join",
            Self::Leave => "leave",
            Self::Rejoin => "rejoin",
        }
    }
}

/// One entry of a broadcast batch.
///
/// `event` holds the chat text for user events and the event name for system
/// events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub user_name: String,
    pub event: String,
    pub timestamp: u64,
    pub channel_id: ChannelId,
}

impl ServerEvent {
    pub fn user(
        user_name: impl Into<String>,
        text: impl Into<String>,
        timestamp: u64,
        channel_id: ChannelId,
    ) -> Self {
        Self {
            kind: EventKind::User,
            user_name: user_name.into(),
            event: text.into(),
            timestamp,
            channel_id,
        }
    }

    pub fn system(
        user_name: impl Into<String>,
        event: SystemEvent,
        timestamp: u64,
        channel_id: ChannelId,
    ) -> Self {
        Self {
            kind: EventKind::System,
            user_name: user_name.into(),
            event: event.as_str().to_string(),
            timestamp,
            channel_id,
        }
    }
}

/// Serialize events, in the given order, as one JSON array payload.
pub fn encode_batch<'a, I>(events: I) -> Result<Bytes>
where
    I: IntoIterator<Item = &'a ServerEvent>,
{
    let events: Vec<&ServerEvent> = events.into_iter().collect();
    Ok(Bytes::from(serde_json::to_vec(&events)?))
}

/// `{"type":"error","message":...}` frame sent before a refusal or eviction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "error")]
pub struct ErrorFrame {
    pub message: String,
}

impl ErrorFrame {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn to_bytes(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }
}

/// Client-visible refusal reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// The server's connection pool is at capacity.
    PoolFull,
    /// The requested channel is at capacity.
    ChannelFull,
    /// The connection sat in the lobby without joining.
    LobbyTimeout,
    /// A lobby join carried no display name.
    NameRequired,
    /// A lobby join carried an overlong display name.
    NameTooLong,
}

impl ErrorCode {
    pub fn message(self) -> &'static str {
        match self {
            Self::PoolFull => "Server is full.",
            Self::ChannelFull => "The channel is full.",
            Self::LobbyTimeout => "Lobby timeout.",
            Self::NameRequired => "A user name is required.",
            Self::NameTooLong => "The user name is too long.",
        }
    }

    pub fn frame(self) -> ErrorFrame {
        ErrorFrame::new(self.message())
    }

    /// Encoded error frame payload.
    pub fn payload(self) -> Bytes {
        self.frame().to_bytes().unwrap_or_default()
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.message())
    }
}

/// Anything the server can send to a client.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum ServerFrame {
    Batch(Vec<ServerEvent>),
    Error(ErrorFrame),
}

impl ServerFrame {
    pub fn from_slice(payload: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_wire_shape() {
        let events = [
            ServerEvent::system("alice", SystemEvent::Join, 5, 2),
            ServerEvent::user("alice", "hi", 7, 2),
        ];
        let bytes = encode_batch(&events).unwrap();
        assert_eq!(
            std::str::from_utf8(&bytes).unwrap(),
            concat!(
                r#"[{"type":"system","user_name":"alice","event":"join","timestamp":5,"channel_id":2},"#,
                r#"{"type":"user","user_name":"alice","event":"hi","timestamp":7,"channel_id":2}]"#
            )
        );
    }

    #[test]
    fn error_frames_match_fixed_messages() {
        assert_eq!(
            ErrorCode::PoolFull.payload().as_ref(),
            br#"{"type":"error","message":"Server is full."}"#
        );
        assert_eq!(
            ErrorCode::ChannelFull.payload().as_ref(),
            br#"{"type":"error","message":"The channel is full."}"#
        );
        assert_eq!(
            ErrorCode::LobbyTimeout.payload().as_ref(),
            br#"{"type":"error","message":"Lobby timeout."}"#
        );
    }

    #[test]
    fn server_frame_distinguishes_batch_from_error() {
        let batch = ServerFrame::from_slice(
            br#"[{"type":"user","user_name":"bob","event":"yo","timestamp":1,"channel_id":9}]"#,
        )
        .unwrap();
        assert!(matches!(batch, ServerFrame::Batch(ref events) if events[0].event == "yo"));

        let error = ServerFrame::from_slice(br#"{"type":"error","message":"Lobby timeout."}"#)
            .unwrap();
        assert_eq!(error, ServerFrame::Error(ErrorFrame::new("Lobby timeout.")));
    }
}
