/// Errors raised while parsing or producing protocol messages.
#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    /// The payload is not UTF-8 JSON of a known message shape.
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    /// A display name was required but missing or blank.
    #[error("user name is required")]
    NameRequired,

    /// A display name exceeds the allowed length.
    #[error("user name is {len} characters, max {max}")]
    NameTooLong { len: usize, max: usize },
}

pub type Result<T> = std::result::Result<T, ProtoError>;
