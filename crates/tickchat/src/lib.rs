//! Real-time, channel-based chat over length-prefixed TCP.
//!
//! Clients connect, claim a display name, join a numbered channel and exchange
//! text messages that every member receives in timestamp order.
//!
//! # Crate Structure
//!
//! - [`transport`]: TCP listener, `epoll` multiplexer and wakeup descriptor
//! - [`frame`]: 4-byte big-endian length-prefixed framing
//! - [`proto`]: the JSON messages clients and server exchange
//! - [`server`]: scheduler, connection pump, channels and lobby (behind the
//!   `server` feature)

/// Re-export transport types.
pub mod transport {
    pub use tickchat_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use tickchat_frame::*;
}

/// Re-export message schema types.
pub mod proto {
    pub use tickchat_proto::*;
}

/// Re-export server types (requires `server` feature).
#[cfg(feature = "server")]
pub mod server {
    pub use tickchat_server::*;
}
