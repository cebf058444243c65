use std::net::{SocketAddr, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};
use bytes::Bytes;
use tickchat_frame::{FrameConfig, FrameQueue, FrameReader};
use tickchat_proto::{ChannelId, ErrorCode};
use tracing::debug;

/// Server-assigned connection identifier. Never reused within a process.
pub type ConnId = u64;

// 0 and u64::MAX are reserved multiplexer tokens.
static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_conn_id() -> ConnId {
    NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed)
}

/// Where a connection currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Group {
    Lobby,
    Channel(ChannelId),
}

/// One client socket together with its per-connection state.
///
/// Owned by exactly one pump at a time; moving a client between the lobby and
/// channels moves this value, unsent output included.
pub struct Connection {
    id: ConnId,
    stream: TcpStream,
    reader: FrameReader,
    outbox: FrameQueue,
    name: Option<String>,
    group: Group,
    peer: SocketAddr,
    accepted_at: u64,
}

impl Connection {
    pub fn new(
        id: ConnId,
        stream: TcpStream,
        peer: SocketAddr,
        frame: FrameConfig,
        accepted_at: u64,
    ) -> Self {
        Self {
            id,
            stream,
            outbox: FrameQueue::new(frame.max_queued),
            reader: FrameReader::with_config(frame),
            name: None,
            group: Group::Lobby,
            peer,
            accepted_at,
        }
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    /// Display name, once claimed by a lobby join.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Display name, or an empty string for connections that never claimed one.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or_default()
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = Some(name.into());
    }

    pub fn group(&self) -> Group {
        self.group
    }

    pub fn set_group(&mut self, group: Group) {
        self.group = group;
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Epoch milliseconds at which the server accepted this connection.
    pub fn accepted_at(&self) -> u64 {
        self.accepted_at
    }

    /// Pull whatever the socket has ready into the frame buffer.
    pub fn fill(&mut self) -> tickchat_frame::Result<usize> {
        self.reader.fill_from(&mut self.stream)
    }

    /// Next complete frame already buffered, if any.
    pub fn next_frame(&mut self) -> tickchat_frame::Result<Option<Bytes>> {
        self.reader.next_frame()
    }

    /// True when bytes are waiting in the frame buffer.
    pub fn has_buffered(&self) -> bool {
        self.reader.buffered() > 0 || self.reader.is_eof()
    }

    /// Queue one frame and write as much as the socket takes right now.
    ///
    /// Never blocks. Whatever the socket refuses stays queued for
    /// [`Self::flush`]; a queue past its limit is an error.
    pub fn send(&mut self, payload: &[u8]) -> tickchat_frame::Result<()> {
        self.outbox.push(payload)?;
        self.outbox.flush_to(&mut self.stream)?;
        Ok(())
    }

    /// Write queued output until the socket would block. `true` once drained.
    pub fn flush(&mut self) -> tickchat_frame::Result<bool> {
        self.outbox.flush_to(&mut self.stream)
    }

    /// True while output is waiting for the socket to drain.
    pub fn has_pending_output(&self) -> bool {
        !self.outbox.is_empty()
    }

    /// Send an error frame to a connection about to be dropped, logging when
    /// it cannot be written in full.
    pub fn refuse(&mut self, code: ErrorCode) -> bool {
        match self.send(&code.payload()) {
            Ok(()) if !self.has_pending_output() => true,
            Ok(()) => {
                debug!(conn = self.id, peer = %self.peer, ?code, "refusal only partly written");
                false
            }
            Err(err) => {
                debug!(conn = self.id, peer = %self.peer, ?code, error = %err, "refusal not delivered");
                false
            }
        }
    }

    pub(crate) fn outbound(&mut self) -> (&mut FrameQueue, &mut TcpStream) {
        (&mut self.outbox, &mut self.stream)
    }
}

impl AsRawFd for Connection {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("group", &self.group)
            .field("peer", &self.peer)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::net::TcpListener;
    use std::time::Duration;

    use super::*;

    /// A server-side connection plus the client end of its socket.
    pub(crate) fn connected_pair() -> (Connection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("loopback bind should succeed");
        let addr = listener.local_addr().expect("listener should have an address");
        let client = TcpStream::connect(addr).expect("client should connect");
        let (server, peer) = listener.accept().expect("listener should accept");
        server
            .set_nonblocking(true)
            .expect("server stream should go non-blocking");
        let conn = Connection::new(next_conn_id(), server, peer, FrameConfig::default(), 0);
        (conn, client)
    }

    #[test]
    fn ids_are_unique_and_never_reserved() {
        let a = next_conn_id();
        let b = next_conn_id();
        assert_ne!(a, b);
        assert_ne!(a, 0);
        assert_ne!(b, u64::MAX);
    }

    #[test]
    fn new_connection_starts_in_lobby_without_name() {
        let (mut conn, _client) = connected_pair();
        assert_eq!(conn.group(), Group::Lobby);
        assert!(conn.name().is_none());
        assert_eq!(conn.display_name(), "");

        conn.set_name("carol");
        conn.set_group(Group::Channel(4));
        assert_eq!(conn.name(), Some("carol"));
        assert_eq!(conn.group(), Group::Channel(4));
    }

    #[test]
    fn frames_flow_both_ways() {
        use std::io::Write;

        let (mut conn, mut client) = connected_pair();
        let mut wire = bytes::BytesMut::new();
        tickchat_frame::encode_frame(b"from client", &mut wire).unwrap();
        client.write_all(&wire).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        let frame = loop {
            conn.fill().unwrap();
            if let Some(frame) = conn.next_frame().unwrap() {
                break frame;
            }
            assert!(std::time::Instant::now() < deadline, "frame never arrived");
            std::thread::sleep(Duration::from_millis(5));
        };
        assert_eq!(frame.as_ref(), b"from client");

        conn.send(b"from server").unwrap();
        let mut reader = FrameReader::new();
        assert_eq!(
            reader.read_frame(&mut client).unwrap().as_ref(),
            b"from server"
        );
    }

    #[test]
    fn send_queues_instead_of_blocking_on_a_slow_reader() {
        let (mut conn, mut client) = connected_pair();
        let payload = vec![b'z'; 64 * 1024];

        let mut sent = 0usize;
        while !conn.has_pending_output() {
            assert!(sent < 1_000, "socket never filled up");
            let started = std::time::Instant::now();
            conn.send(&payload).unwrap();
            assert!(started.elapsed() < Duration::from_millis(100));
            sent += 1;
        }
        assert!(!conn.flush().unwrap());

        let reader = std::thread::spawn(move || {
            let mut frames = FrameReader::new();
            for _ in 0..sent {
                let frame = frames.read_frame(&mut client).unwrap();
                assert_eq!(frame.len(), 64 * 1024);
            }
        });

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !conn.flush().unwrap() {
            assert!(std::time::Instant::now() < deadline, "queue never drained");
            std::thread::sleep(Duration::from_millis(2));
        }
        assert!(!conn.has_pending_output());
        reader.join().unwrap();
    }

    #[test]
    fn refuse_reports_delivery() {
        use std::net::Shutdown;

        let (mut conn, mut client) = connected_pair();
        assert!(conn.refuse(ErrorCode::ChannelFull));
        let frame = FrameReader::new().read_frame(&mut client).unwrap();
        assert_eq!(frame, ErrorCode::ChannelFull.payload());

        conn.outbound().1.shutdown(Shutdown::Write).unwrap();
        assert!(!conn.refuse(ErrorCode::ChannelFull));
    }
}
