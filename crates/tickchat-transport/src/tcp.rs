use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::{debug, info};

use crate::error::{Result, TransportError};

/// Non-blocking TCP listening socket.
///
/// The listener is meant to be registered with a [`crate::Multiplexer`]; every
/// accepted stream is switched to non-blocking mode with `TCP_NODELAY` set so
/// it can be driven by the same readiness loop.
pub struct TcpTransport {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl TcpTransport {
    /// Bind and listen on `addr` (`host:port`).
    ///
    /// Port `0` asks the OS for an ephemeral port; use [`Self::local_addr`] to
    /// find out which one was picked.
    pub fn bind(addr: impl ToSocketAddrs + std::fmt::Display) -> Result<Self> {
        let display = addr.to_string();
        let listener = TcpListener::bind(&addr).map_err(|source| TransportError::Bind {
            addr: display.clone(),
            source,
        })?;
        listener
            .set_nonblocking(true)
            .map_err(|source| TransportError::Bind {
                addr: display.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;

        info!(%local_addr, "listening on tcp");

        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Accept one pending connection.
    ///
    /// Returns `Ok(None)` when no connection is waiting.
    pub fn accept(&self) -> Result<Option<(TcpStream, SocketAddr)>> {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    stream.set_nonblocking(true)?;
                    stream.set_nodelay(true)?;
                    debug!(%peer, "accepted connection");
                    return Ok(Some((stream, peer)));
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(None),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(TransportError::Accept(err)),
            }
        }
    }

    /// Connect to a listening server (blocking), optionally bounding the
    /// connect with `timeout`.
    pub fn connect(addr: SocketAddr, timeout: Option<Duration>) -> Result<TcpStream> {
        let stream = match timeout {
            Some(timeout) => TcpStream::connect_timeout(&addr, timeout),
            None => TcpStream::connect(addr),
        }
        .map_err(|source| TransportError::Connect { addr, source })?;
        stream.set_nodelay(true)?;
        debug!(%addr, "connected to tcp server");
        Ok(stream)
    }

    /// The address this listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Transport name for diagnostics.
    pub fn transport_name(&self) -> &'static str {
        "tcp"
    }
}

#[cfg(unix)]
impl std::os::fd::AsRawFd for TcpTransport {
    fn as_raw_fd(&self) -> std::os::fd::RawFd {
        self.listener.as_raw_fd()
    }
}

impl std::fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransport")
            .field("local_addr", &self.local_addr)
            .finish()
    }
}
