use std::io::{ErrorKind, Read};

use bytes::{Bytes, BytesMut};
use tracing::trace;

use crate::codec::{decode_frame, FrameConfig};
use crate::error::{FrameError, Result};

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Upper bound on bytes pulled from one source per [`FrameReader::read_available`].
///
/// Level-triggered readiness reports the source again if more is pending, so a
/// peer that never lets the socket run dry cannot pin the loop.
pub const MAX_BURST: usize = 256 * 1024;

/// Per-connection accumulation buffer.
///
/// The reader does not own the stream: the caller lends it for each read, which
/// lets one connection record hold both the socket and its pending bytes.
/// Callers always get complete frames; partial frames stay buffered.
#[derive(Debug)]
pub struct FrameReader {
    buf: BytesMut,
    config: FrameConfig,
    eof: bool,
}

impl FrameReader {
    /// Create a new frame reader with default configuration.
    pub fn new() -> Self {
        Self::with_config(FrameConfig::default())
    }

    /// Create a new frame reader with explicit configuration.
    pub fn with_config(config: FrameConfig) -> Self {
        Self {
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            config,
            eof: false,
        }
    }

    /// Drain every byte `src` has ready and return all complete frames.
    ///
    /// Meant for non-blocking sources: reading stops at `WouldBlock`. An empty
    /// vector means nothing complete arrived yet. End of stream is reported as
    /// [`FrameError::ConnectionClosed`] once no complete frame is left to hand
    /// out; an oversized frame is [`FrameError::PayloadTooLarge`].
    pub fn read_available<R: Read>(&mut self, src: &mut R) -> Result<Vec<Bytes>> {
        if self.eof {
            return Err(FrameError::ConnectionClosed);
        }
        self.fill_from(src)?;

        let mut frames = Vec::new();
        loop {
            match self.next_frame() {
                Ok(Some(frame)) => frames.push(frame),
                Ok(None) => break,
                Err(FrameError::ConnectionClosed) if !frames.is_empty() => break,
                Err(err) => return Err(err),
            }
        }
        Ok(frames)
    }

    /// Pull everything `src` has ready into the buffer without decoding.
    ///
    /// Returns the number of bytes read. Stops at `WouldBlock`, at end of
    /// stream, or after [`MAX_BURST`] bytes.
    pub fn fill_from<R: Read>(&mut self, src: &mut R) -> Result<usize> {
        if self.eof {
            return Ok(0);
        }

        let mut chunk = [0u8; READ_CHUNK_SIZE];
        let mut burst = 0usize;
        while burst < MAX_BURST {
            match src.read(&mut chunk) {
                Ok(0) => {
                    self.eof = true;
                    break;
                }
                Ok(n) => {
                    self.buf.extend_from_slice(&chunk[..n]);
                    burst += n;
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
        trace!(burst, pending = self.buf.len(), eof = self.eof, "filled");
        Ok(burst)
    }

    /// Decode the next complete frame already in the buffer.
    ///
    /// `Ok(None)` means more input is needed. Once the source has reached end
    /// of stream and no complete frame is left, this is
    /// [`FrameError::ConnectionClosed`].
    pub fn next_frame(&mut self) -> Result<Option<Bytes>> {
        match decode_frame(&mut self.buf, self.config.max_payload_size)? {
            Some(frame) => Ok(Some(frame)),
            None if self.eof => Err(FrameError::ConnectionClosed),
            None => Ok(None),
        }
    }

    /// Read the next complete frame (blocking).
    ///
    /// Returns `Err(FrameError::ConnectionClosed)` when EOF is reached.
    pub fn read_frame<R: Read>(&mut self, src: &mut R) -> Result<Bytes> {
        loop {
            if let Some(frame) = decode_frame(&mut self.buf, self.config.max_payload_size)? {
                return Ok(frame);
            }
            if self.eof {
                return Err(FrameError::ConnectionClosed);
            }

            let mut chunk = [0u8; READ_CHUNK_SIZE];
            let read = match src.read(&mut chunk) {
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            };

            if read == 0 {
                self.eof = true;
                continue;
            }

            self.buf.extend_from_slice(&chunk[..read]);
        }
    }

    /// Bytes received but not yet part of a complete frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// True once the source reported end of stream.
    pub fn is_eof(&self) -> bool {
        self.eof
    }

    /// Drop any buffered bytes.
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Update maximum payload size for subsequent frame decoding.
    pub fn set_max_payload_size(&mut self, max_payload_size: usize) {
        self.config.max_payload_size = max_payload_size;
    }

    /// Current frame reader configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new()
    }
}
