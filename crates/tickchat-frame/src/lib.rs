//! Length-prefixed message framing for tickchat.
//!
//! Every message on the wire is a 4-byte big-endian payload length followed by
//! the payload. Zero-length frames are skipped. Inbound payloads are capped
//! (16 KiB by default); outbound payloads are not, so a batch broadcast can be
//! larger than any single client message.
//!
//! Readers accumulate partial input per connection and only ever hand out
//! complete frames.

pub mod codec;
pub mod error;
pub mod reader;
#[cfg(feature = "async")]
pub mod tokio_codec;
pub mod writer;

pub use codec::{
    decode_frame, encode_frame, FrameConfig, DEFAULT_MAX_PAYLOAD, DEFAULT_MAX_QUEUED,
    DEFAULT_WRITE_TIMEOUT, HEADER_SIZE,
};
pub use error::{FrameError, Result};
pub use reader::{FrameReader, MAX_BURST};
#[cfg(feature = "async")]
pub use tokio_codec::ChatCodec;
pub use writer::{broadcast, write_frame, FrameQueue, FrameWriter};
