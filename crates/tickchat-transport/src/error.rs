use std::net::SocketAddr;

/// Errors that can occur in transport and multiplexer operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Failed to bind to the specified address.
    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    /// Failed to connect to the specified address.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        source: std::io::Error,
    },

    /// Failed to accept an incoming connection.
    #[error("failed to accept connection: {0}")]
    Accept(std::io::Error),

    /// An I/O error occurred on the transport stream.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The readiness facility could not be created.
    #[error("failed to create poller: {0}")]
    Poller(std::io::Error),

    /// Registering or deregistering a descriptor failed.
    #[error("failed to update interest for token {token}: {source}")]
    Interest { token: u64, source: std::io::Error },

    /// Waiting for readiness failed.
    #[error("poll failed: {0}")]
    Poll(std::io::Error),

    /// The multiplexer is already tracking `capacity` descriptors.
    #[error("pool full ({capacity} descriptors)")]
    PoolFull { capacity: usize },

    /// The token is reserved or already registered.
    #[error("token {0} is reserved or already in use")]
    TokenInUse(u64),

    /// The token is not tracked by this multiplexer.
    #[error("token {0} is not registered")]
    UnknownToken(u64),
}

impl TransportError {
    /// True for the recoverable capacity condition.
    pub fn is_pool_full(&self) -> bool {
        matches!(self, Self::PoolFull { .. })
    }
}

/// A source the multiplexer refused to track, handed back to the caller.
#[derive(Debug)]
pub struct Rejected<S> {
    pub error: TransportError,
    pub source: S,
}

impl<S> Rejected<S> {
    pub(crate) fn new(error: TransportError, source: S) -> Self {
        Self { error, source }
    }

    /// Split into the error and the returned source.
    pub fn into_parts(self) -> (TransportError, S) {
        (self.error, self.source)
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;
