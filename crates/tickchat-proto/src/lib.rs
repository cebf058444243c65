//! Message schema for tickchat.
//!
//! Every frame payload is UTF-8 JSON. Clients send [`ClientMessage`]s; the
//! server answers with batches of [`ServerEvent`]s (a JSON array per broadcast
//! window) or a single [`ErrorFrame`].

pub mod error;
pub mod event;
pub mod message;

pub use error::{ProtoError, Result};
pub use event::{
    encode_batch, ErrorCode, ErrorFrame, EventKind, ServerEvent, ServerFrame, SystemEvent,
};
pub use message::{validate_name, ChannelId, ClientMessage, MAX_NAME_LEN};
