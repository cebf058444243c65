use std::time::Duration;

/// Errors that can occur during frame encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The declared or supplied payload exceeds the allowed maximum.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer closed the connection (possibly mid-frame).
    #[error("connection closed")]
    ConnectionClosed,

    /// The peer stopped draining its socket and the write could not finish.
    #[error("write timed out after {0:?}")]
    WriteTimeout(Duration),

    /// Queued outbound bytes would exceed the per-connection limit.
    #[error("outbound queue full ({queued} bytes queued, limit {limit})")]
    Backlogged { queued: usize, limit: usize },
}

impl FrameError {
    /// True when the peer went away (EOF, reset, or broken pipe).
    pub fn is_disconnect(&self) -> bool {
        match self {
            Self::ConnectionClosed => true,
            Self::Io(err) => matches!(
                err.kind(),
                std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, FrameError>;
