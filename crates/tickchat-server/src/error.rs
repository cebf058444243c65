use tickchat_proto::ErrorCode;

/// Errors that can occur while running the chat server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Transport-level error (bind, poller, registration).
    #[error("transport error: {0}")]
    Transport(#[from] tickchat_transport::TransportError),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] tickchat_frame::FrameError),

    /// Protocol (JSON schema) error.
    #[error("protocol error: {0}")]
    Proto(#[from] tickchat_proto::ProtoError),

    /// A request was refused with a client-visible reason.
    #[error("refused: {0}")]
    Refused(ErrorCode),

    /// A channel worker thread could not be started.
    #[error("failed to spawn worker for channel {channel}: {source}")]
    WorkerSpawn {
        channel: u32,
        source: std::io::Error,
    },

    /// A configuration value could not be understood.
    #[error("invalid setting {0:?}")]
    InvalidSetting(String),
}

pub type Result<T> = std::result::Result<T, ServerError>;
