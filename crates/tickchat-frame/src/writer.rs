use std::io::{ErrorKind, Write};
use std::time::{Duration, Instant};

use bytes::{Buf, BytesMut};
use tracing::{debug, trace};

use crate::codec::{encode_frame, FrameConfig};
use crate::error::{FrameError, Result};

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;
const RETRY_BACKOFF: Duration = Duration::from_millis(1);

/// Encode `payload` and write the whole frame to `dst`.
///
/// Non-blocking sinks that report `WouldBlock` are retried until `timeout`
/// elapses, then the write fails with [`FrameError::WriteTimeout`]. An empty
/// payload writes nothing.
pub fn write_frame<W: Write + ?Sized>(dst: &mut W, payload: &[u8], timeout: Duration) -> Result<()> {
    let mut buf = BytesMut::with_capacity(payload.len() + crate::codec::HEADER_SIZE);
    encode_frame(payload, &mut buf)?;
    write_encoded(dst, &buf, timeout)
}

/// Queue one payload for every target and push as much of each queue as its
/// sink takes without blocking. Returns the keys that failed.
///
/// The frame is encoded once. A failing target does not stop delivery to the
/// rest; callers decide what to do with the returned keys (usually schedule
/// them for removal). Targets left with queued bytes are not failures.
pub fn broadcast<'a, K, W, I>(targets: I, payload: &[u8]) -> Result<Vec<K>>
where
    W: Write + ?Sized + 'a,
    I: IntoIterator<Item = (K, &'a mut FrameQueue, &'a mut W)>,
{
    let mut buf = BytesMut::with_capacity(payload.len() + crate::codec::HEADER_SIZE);
    encode_frame(payload, &mut buf)?;

    let mut failed = Vec::new();
    let mut backed_up = 0usize;
    for (key, queue, dst) in targets {
        match queue
            .push_encoded(&buf)
            .and_then(|()| queue.flush_to(dst))
        {
            Ok(true) => {}
            Ok(false) => backed_up += 1,
            Err(err) => {
                debug!(error = %err, "broadcast target failed");
                failed.push(key);
            }
        }
    }
    trace!(backed_up, failed = failed.len(), bytes = buf.len(), "broadcast");
    Ok(failed)
}

/// Encoded frames waiting for a non-blocking sink to drain.
///
/// Frames are appended whole. The limit bounds what may pile up behind a slow
/// reader: an empty queue always takes one frame, however large.
#[derive(Debug)]
pub struct FrameQueue {
    buf: BytesMut,
    limit: usize,
}

impl FrameQueue {
    /// Queue holding at most `limit` bytes.
    pub fn new(limit: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            limit,
        }
    }

    /// Encode `payload` onto the back of the queue.
    pub fn push(&mut self, payload: &[u8]) -> Result<()> {
        if payload.is_empty() {
            return Ok(());
        }
        self.admit(payload.len() + crate::codec::HEADER_SIZE)?;
        encode_frame(payload, &mut self.buf)
    }

    /// Append a frame that is already encoded.
    pub fn push_encoded(&mut self, frame: &[u8]) -> Result<()> {
        self.admit(frame.len())?;
        self.buf.extend_from_slice(frame);
        Ok(())
    }

    fn admit(&self, extra: usize) -> Result<()> {
        if !self.buf.is_empty() && self.buf.len().saturating_add(extra) > self.limit {
            return Err(FrameError::Backlogged {
                queued: self.buf.len(),
                limit: self.limit,
            });
        }
        Ok(())
    }

    /// Write queued bytes until the sink would block.
    ///
    /// Returns `true` once the queue is empty.
    pub fn flush_to<W: Write + ?Sized>(&mut self, dst: &mut W) -> Result<bool> {
        while !self.buf.is_empty() {
            match dst.write(&self.buf) {
                Ok(0) => return Err(FrameError::ConnectionClosed),
                Ok(n) => self.buf.advance(n),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(false),
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
        Ok(true)
    }

    /// Bytes still waiting.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}

fn write_encoded<W: Write + ?Sized>(dst: &mut W, bytes: &[u8], timeout: Duration) -> Result<()> {
    let started = Instant::now();
    let mut offset = 0usize;
    while offset < bytes.len() {
        match dst.write(&bytes[offset..]) {
            Ok(0) => return Err(FrameError::ConnectionClosed),
            Ok(n) => offset += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                if started.elapsed() >= timeout {
                    return Err(FrameError::WriteTimeout(timeout));
                }
                std::thread::sleep(RETRY_BACKOFF);
            }
            Err(err) => return Err(FrameError::Io(err)),
        }
    }

    loop {
        match dst.flush() {
            Ok(()) => return Ok(()),
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                if started.elapsed() >= timeout {
                    return Err(FrameError::WriteTimeout(timeout));
                }
                std::thread::sleep(RETRY_BACKOFF);
            }
            Err(err) => return Err(FrameError::Io(err)),
        }
    }
}

/// Writes complete frames to an owned `Write` stream.
pub struct FrameWriter<T> {
    inner: T,
    buf: BytesMut,
    config: FrameConfig,
}

impl<T: Write> FrameWriter<T> {
    /// Create a new frame writer with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new frame writer with explicit configuration.
    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            config,
        }
    }

    /// Encode and send one payload.
    pub fn send(&mut self, payload: &[u8]) -> Result<()> {
        self.buf.clear();
        encode_frame(payload, &mut self.buf)?;
        write_encoded(&mut self.inner, &self.buf, self.config.write_timeout)
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Consume the writer and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Current frame writer configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use bytes::BytesMut;

    use super::*;
    use crate::codec::decode_frame;

    fn decode_all(bytes: &[u8]) -> Vec<Vec<u8>> {
        let mut wire = BytesMut::from(bytes);
        let mut frames = Vec::new();
        while let Some(frame) = decode_frame(&mut wire, usize::MAX).unwrap() {
            frames.push(frame.to_vec());
        }
        frames
    }

    #[test]
    fn write_multiple_frames() {
        let mut writer = FrameWriter::new(Cursor::new(Vec::<u8>::new()));

        writer.send(b"one").unwrap();
        writer.send(b"two").unwrap();
        writer.send(b"three").unwrap();

        let wire = writer.into_inner().into_inner();
        assert_eq!(
            decode_all(&wire),
            vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]
        );
    }

    #[test]
    fn outbound_frames_may_exceed_inbound_limit() {
        let payload = vec![b'x'; crate::codec::DEFAULT_MAX_PAYLOAD * 2];
        let mut sink = Vec::new();
        write_frame(&mut sink, &payload, Duration::from_millis(10)).unwrap();
        assert_eq!(sink.len(), payload.len() + crate::codec::HEADER_SIZE);
    }

    #[test]
    fn empty_payload_writes_nothing() {
        let mut sink = Vec::new();
        write_frame(&mut sink, b"", Duration::from_millis(10)).unwrap();
        assert!(sink.is_empty());
    }

    #[test]
    fn handles_interrupted_and_would_block() {
        let mut sink = FlakyWriter {
            interrupted: false,
            blocked: false,
            data: Vec::new(),
        };
        write_frame(&mut sink, b"retry", Duration::from_secs(1)).unwrap();
        assert_eq!(decode_all(&sink.data), vec![b"retry".to_vec()]);
    }

    #[test]
    fn stalled_sink_times_out() {
        let mut sink = StalledWriter;
        let started = Instant::now();
        let err = write_frame(&mut sink, b"stuck", Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, FrameError::WriteTimeout(_)));
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn connection_closed_when_write_returns_zero() {
        let mut writer = FrameWriter::new(ZeroWriter);
        let err = writer.send(b"x").unwrap_err();
        assert!(matches!(err, FrameError::ConnectionClosed));
    }

    #[test]
    fn broadcast_reports_failed_targets_and_keeps_going() {
        let mut first = Vec::new();
        let mut broken = ZeroWriter;
        let mut stalled = StalledWriter;
        let mut last = Vec::new();
        let mut queues: Vec<FrameQueue> = (0..4).map(|_| FrameQueue::new(1024)).collect();

        let sinks: Vec<&mut dyn Write> = vec![&mut first, &mut broken, &mut stalled, &mut last];
        let targets = queues
            .iter_mut()
            .zip(sinks)
            .enumerate()
            .map(|(key, (queue, sink))| (key, queue, sink));
        let started = Instant::now();
        let failed = broadcast(targets, b"[]").unwrap();

        assert_eq!(failed, vec![1]);
        assert!(started.elapsed() < Duration::from_millis(200));
        assert_eq!(decode_all(&first), vec![b"[]".to_vec()]);
        assert_eq!(decode_all(&last), vec![b"[]".to_vec()]);
        assert!(queues[0].is_empty());
        assert_eq!(queues[2].len(), 2 + crate::codec::HEADER_SIZE);
    }

    #[test]
    fn queue_holds_bytes_until_sink_drains() {
        let mut queue = FrameQueue::new(64);
        queue.push(b"first").unwrap();
        queue.push(b"").unwrap();
        queue.push(b"second").unwrap();

        let mut gate = GatedWriter {
            budget: 7,
            data: Vec::new(),
        };
        assert!(!queue.flush_to(&mut gate).unwrap());
        assert_eq!(gate.data.len(), 7);

        gate.budget = usize::MAX;
        assert!(queue.flush_to(&mut gate).unwrap());
        assert!(queue.is_empty());
        assert_eq!(
            decode_all(&gate.data),
            vec![b"first".to_vec(), b"second".to_vec()]
        );
    }

    #[test]
    fn queue_refuses_past_its_limit() {
        let mut queue = FrameQueue::new(16);
        queue.push(b"twelve bytes").unwrap();
        let err = queue.push(b"x").unwrap_err();
        assert!(matches!(err, FrameError::Backlogged { queued: 16, limit: 16 }));
        assert_eq!(queue.len(), 16);

        let mut small = FrameQueue::new(4);
        small.push(b"bigger than the limit").unwrap();
        assert!(small.push(b"x").is_err());
    }

    struct GatedWriter {
        budget: usize,
        data: Vec<u8>,
    }

    impl Write for GatedWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            if self.budget == 0 {
                return Err(std::io::Error::from(ErrorKind::WouldBlock));
            }
            let n = buf.len().min(self.budget);
            self.budget -= n;
            self.data.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    struct FlakyWriter {
        interrupted: bool,
        blocked: bool,
        data: Vec<u8>,
    }

    impl Write for FlakyWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            if !self.interrupted {
                self.interrupted = true;
                return Err(std::io::Error::from(ErrorKind::Interrupted));
            }
            if !self.blocked {
                self.blocked = true;
                return Err(std::io::Error::from(ErrorKind::WouldBlock));
            }
            // Accept a few bytes at a time.
            let n = buf.len().min(3);
            self.data.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    struct StalledWriter;

    impl Write for StalledWriter {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Err(std::io::Error::from(ErrorKind::WouldBlock))
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    struct ZeroWriter;

    impl Write for ZeroWriter {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Ok(0)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }
}
