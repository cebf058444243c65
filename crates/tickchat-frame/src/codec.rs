use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};

/// Frame header: big-endian payload length (4 bytes).
pub const HEADER_SIZE: usize = 4;

/// Default maximum inbound payload size: 16 KiB.
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024;

/// Default time a blocking writer keeps retrying a socket that is not draining.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_millis(250);

/// Default cap on outbound bytes queued for one slow reader: 1 MiB.
pub const DEFAULT_MAX_QUEUED: usize = 1024 * 1024;

/// Encode one frame into the wire format.
///
/// Wire format:
/// ```text
/// ┌──────────────┬─────────────────┐
/// │ Length       │ Payload         │
/// │ (4B BE)      │ (Length bytes)  │
/// └──────────────┴─────────────────┘
/// ```
///
/// An empty payload encodes to nothing: a zero-length frame carries no message.
pub fn encode_frame(payload: &[u8], dst: &mut BytesMut) -> Result<()> {
    if payload.is_empty() {
        return Ok(());
    }
    let len = u32::try_from(payload.len()).map_err(|_| FrameError::PayloadTooLarge {
        size: payload.len(),
        max: u32::MAX as usize,
    })?;
    dst.reserve(HEADER_SIZE + payload.len());
    dst.put_u32(len);
    dst.put_slice(payload);
    Ok(())
}

/// Decode the next frame from a buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete frame yet.
/// Zero-length frames are consumed and skipped. On success, consumes the frame
/// bytes from the buffer.
pub fn decode_frame(src: &mut BytesMut, max_payload: usize) -> Result<Option<Bytes>> {
    loop {
        if src.len() < HEADER_SIZE {
            return Ok(None); // Need more data
        }

        let mut header = [0u8; HEADER_SIZE];
        header.copy_from_slice(&src[..HEADER_SIZE]);
        let payload_len = u32::from_be_bytes(header) as usize;

        if payload_len == 0 {
            src.advance(HEADER_SIZE);
            continue;
        }

        if payload_len > max_payload {
            return Err(FrameError::PayloadTooLarge {
                size: payload_len,
                max: max_payload,
            });
        }

        let total = HEADER_SIZE + payload_len;
        if src.len() < total {
            return Ok(None); // Need more data
        }

        src.advance(HEADER_SIZE);
        return Ok(Some(src.split_to(payload_len).freeze()));
    }
}

/// Configuration for the frame codec.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum inbound payload size in bytes. Default: 16 KiB.
    pub max_payload_size: usize,
    /// How long a blocking [`crate::write_frame`] keeps retrying a full
    /// socket buffer.
    pub write_timeout: Duration,
    /// Most bytes a [`crate::FrameQueue`] holds before refusing more.
    pub max_queued: usize,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            max_queued: DEFAULT_MAX_QUEUED,
        }
    }
}
