//! TCP transport and connection multiplexing for tickchat.
//!
//! This is the lowest layer of the server:
//! - [`TcpTransport`]: a non-blocking listening socket
//! - [`Multiplexer`]: a bounded, level-triggered readiness set that owns the
//!   descriptors registered with it
//! - [`Waker`]: a descriptor other threads can signal to cut a poll short
//!
//! The multiplexer and waker are Linux-only (`epoll`, `eventfd`).

pub mod error;
pub mod tcp;

#[cfg(target_os = "linux")]
pub mod multiplexer;
#[cfg(target_os = "linux")]
pub mod waker;

pub use error::{Rejected, Result, TransportError};
pub use tcp::TcpTransport;

#[cfg(target_os = "linux")]
pub use multiplexer::{Multiplexer, Readiness, Token, LISTENER, WAKER};
#[cfg(target_os = "linux")]
pub use waker::Waker;
