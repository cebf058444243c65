use std::collections::HashSet;
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use tickchat_frame::{FrameConfig, FrameQueue};
use tickchat_proto::{ChannelId, ClientMessage, ErrorCode};
use tickchat_transport::{
    Multiplexer, Readiness, Rejected, TcpTransport, Waker, LISTENER, WAKER,
};
use tracing::{debug, trace, warn};

use crate::clock::now_ms;
use crate::connection::{next_conn_id, ConnId, Connection, Group};
use crate::error::Result;

/// A decoded client request, interpreted against the sender's group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Lobby connection asking to enter a channel under a display name.
    Join {
        channel: ChannelId,
        name: Option<String>,
        timestamp: Option<u64>,
    },
    /// In-channel connection asking to move to another channel.
    Switch {
        channel: ChannelId,
        timestamp: Option<u64>,
    },
    /// Chat text.
    Message { text: String, timestamp: u64 },
}

impl Request {
    pub fn from_message(message: ClientMessage, group: Group) -> Self {
        match (message, group) {
            (
                ClientMessage::Join {
                    channel_id,
                    user_name,
                    timestamp,
                },
                Group::Lobby,
            ) => Self::Join {
                channel: channel_id,
                name: user_name,
                timestamp,
            },
            (
                ClientMessage::Join {
                    channel_id,
                    timestamp,
                    ..
                },
                Group::Channel(_),
            ) => Self::Switch {
                channel: channel_id,
                timestamp,
            },
            (ClientMessage::Message { text, timestamp }, _) => Self::Message { text, timestamp },
        }
    }
}

/// Extension points of a [`ConnectionPump`].
pub trait RequestHandler {
    /// A new connection was accepted and registered.
    fn on_accept(&mut self, _pump: &mut ConnectionPump, _id: ConnId) {}

    /// One well-formed request arrived.
    fn on_request(&mut self, pump: &mut ConnectionPump, from: ConnId, request: Request);

    /// A connection was removed by deferred deletion; it closes when dropped.
    fn on_close(&mut self, _conn: Connection) {}
}

/// Owns a set of connections and turns their readiness into requests.
///
/// A connection that errors, hangs up, or sends a broken frame is only
/// *marked*; [`ConnectionPump::resolve_deletion`] removes marked connections in
/// one batch, so handlers never see a connection vanish mid-dispatch.
///
/// Writes never block: output a socket will not take yet stays queued on its
/// connection and is flushed when the socket reports writable.
pub struct ConnectionPump {
    label: String,
    mux: Multiplexer<Connection>,
    listener: Option<TcpTransport>,
    waker: Option<Arc<Waker>>,
    frame: FrameConfig,
    doomed: HashSet<ConnId>,
    backlog: Vec<ConnId>,
    flushing: HashSet<ConnId>,
    woken: bool,
}

impl ConnectionPump {
    pub fn new(label: impl Into<String>, capacity: usize, frame: FrameConfig) -> Result<Self> {
        Ok(Self {
            label: label.into(),
            mux: Multiplexer::new(capacity)?,
            listener: None,
            waker: None,
            frame,
            doomed: HashSet::new(),
            backlog: Vec::new(),
            flushing: HashSet::new(),
            woken: false,
        })
    }

    /// Accept new connections from `listener` during dispatch.
    pub fn with_listener(mut self, listener: TcpTransport) -> Result<Self> {
        self.mux.watch_listener(&listener)?;
        self.listener = Some(listener);
        Ok(self)
    }

    /// Let other threads cut [`Self::poll`] short through `waker`.
    pub fn with_waker(mut self, waker: Arc<Waker>) -> Result<Self> {
        self.mux.watch_waker(waker.as_ref())?;
        self.waker = Some(waker);
        Ok(self)
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Listening address, when this pump accepts connections.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().map(TcpTransport::local_addr)
    }

    /// Wait for readiness, then dispatch everything ready to `handler`.
    ///
    /// Connections holding already-buffered frames make the wait non-blocking.
    pub fn pump<H: RequestHandler>(
        &mut self,
        timeout: Option<Duration>,
        handler: &mut H,
    ) -> Result<usize> {
        let timeout = if self.backlog.is_empty() {
            timeout
        } else {
            Some(Duration::ZERO)
        };
        let ready = self.mux.poll(timeout)?;
        self.dispatch(handler);
        Ok(ready)
    }

    /// Handle the ready list of the most recent poll.
    pub fn dispatch<H: RequestHandler>(&mut self, handler: &mut H) {
        for id in std::mem::take(&mut self.backlog) {
            self.deliver(id, handler);
        }

        let ready: Vec<Readiness> = self.mux.ready().collect();
        for readiness in ready {
            match readiness.token {
                LISTENER => self.accept_pending(handler),
                WAKER => self.reset_waker(),
                id if self.doomed.contains(&id) => {}
                id if readiness.error => {
                    debug!(pump = %self.label, conn = id, "socket error");
                    self.mark(id);
                }
                id => {
                    if readiness.writable {
                        self.flush_output(id);
                    }
                    if readiness.readable {
                        self.receive(id, handler);
                    } else if readiness.hangup {
                        debug!(pump = %self.label, conn = id, "peer hung up");
                        self.mark(id);
                    }
                }
            }
        }
    }

    /// True if the waker fired since the last call.
    pub fn take_wakeup(&mut self) -> bool {
        std::mem::take(&mut self.woken)
    }

    fn reset_waker(&mut self) {
        if let Some(waker) = &self.waker {
            if let Err(err) = waker.reset() {
                warn!(pump = %self.label, error = %err, "failed to reset waker");
            }
        }
        self.woken = true;
    }

    fn accept_pending<H: RequestHandler>(&mut self, handler: &mut H) {
        loop {
            let accepted = match &self.listener {
                Some(listener) => listener.accept(),
                None => return,
            };
            let (stream, peer) = match accepted {
                Ok(Some(accepted)) => accepted,
                Ok(None) => return,
                Err(err) => {
                    warn!(pump = %self.label, error = %err, "accept failed");
                    return;
                }
            };

            if self.mux.is_full() {
                self.refuse(stream, peer);
                continue;
            }

            let id = next_conn_id();
            let conn = Connection::new(id, stream, peer, self.frame.clone(), now_ms());
            match self.mux.add(id, conn) {
                Ok(()) => {
                    debug!(pump = %self.label, conn = id, %peer, "connection accepted");
                    handler.on_accept(self, id);
                }
                Err(rejected) => {
                    let (err, mut conn) = rejected.into_parts();
                    warn!(pump = %self.label, %peer, error = %err, "could not register connection");
                    conn.refuse(ErrorCode::PoolFull);
                }
            }
        }
    }

    fn refuse(&self, mut stream: TcpStream, peer: SocketAddr) {
        debug!(pump = %self.label, %peer, capacity = self.mux.capacity(), "pool full, refusing");
        let mut out = FrameQueue::new(self.frame.max_queued);
        let written = out
            .push(&ErrorCode::PoolFull.payload())
            .and_then(|()| out.flush_to(&mut stream));
        match written {
            Ok(true) => {}
            Ok(false) => debug!(pump = %self.label, %peer, "refusal only partly written"),
            Err(err) => debug!(pump = %self.label, %peer, error = %err, "refusal not delivered"),
        }
    }

    fn flush_output(&mut self, id: ConnId) {
        let Some(conn) = self.mux.get_mut(id) else {
            return;
        };
        if let Err(err) = conn.flush() {
            debug!(pump = %self.label, conn = id, error = %err, "flush failed");
            self.mark(id);
            return;
        }
        self.sync_output(id);
    }

    /// Watch `id` for writability exactly while it has output queued.
    fn sync_output(&mut self, id: ConnId) {
        let Some(conn) = self.mux.get(id) else {
            return;
        };
        let pending = conn.has_pending_output();
        if pending == self.flushing.contains(&id) {
            return;
        }
        match self.mux.set_writable(id, pending) {
            Ok(()) => {
                if pending {
                    trace!(pump = %self.label, conn = id, "output backed up");
                    self.flushing.insert(id);
                } else {
                    self.flushing.remove(&id);
                }
            }
            Err(err) => {
                warn!(pump = %self.label, conn = id, error = %err, "could not change write interest");
                self.mark(id);
            }
        }
    }

    fn receive<H: RequestHandler>(&mut self, id: ConnId, handler: &mut H) {
        let filled = match self.mux.get_mut(id) {
            Some(conn) => conn.fill(),
            None => return,
        };
        if let Err(err) = filled {
            debug!(pump = %self.label, conn = id, error = %err, "read failed");
            self.mark(id);
            return;
        }
        self.deliver(id, handler);
    }

    /// Hand buffered frames of `id` to `handler` one at a time.
    ///
    /// Stops as soon as the handler moves the connection out of this pump; the
    /// remaining frames travel with it.
    fn deliver<H: RequestHandler>(&mut self, id: ConnId, handler: &mut H) {
        loop {
            if self.doomed.contains(&id) {
                return;
            }
            let Some(conn) = self.mux.get_mut(id) else {
                return;
            };
            let frame = match conn.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => return,
                Err(err) => {
                    if err.is_disconnect() {
                        debug!(pump = %self.label, conn = id, "connection closed by peer");
                    } else {
                        warn!(pump = %self.label, conn = id, error = %err, "framing error");
                    }
                    self.mark(id);
                    return;
                }
            };
            let group = conn.group();

            match ClientMessage::from_slice(&frame) {
                Ok(message) => {
                    trace!(pump = %self.label, conn = id, bytes = frame.len(), "request");
                    handler.on_request(self, id, Request::from_message(message, group));
                }
                Err(err) => {
                    warn!(pump = %self.label, conn = id, error = %err, "dropping malformed message");
                }
            }
        }
    }

    /// Schedule `id` for removal at the next [`Self::resolve_deletion`].
    pub fn mark(&mut self, id: ConnId) {
        if self.mux.contains(id) {
            self.doomed.insert(id);
        }
    }

    pub fn is_marked(&self, id: ConnId) -> bool {
        self.doomed.contains(&id)
    }

    /// Remove every marked connection and pass each to `on_close`.
    pub fn resolve_deletion<H: RequestHandler>(&mut self, handler: &mut H) -> usize {
        if self.doomed.is_empty() {
            return 0;
        }
        let mut removed = 0;
        for id in std::mem::take(&mut self.doomed) {
            self.flushing.remove(&id);
            match self.mux.remove(id) {
                Ok(conn) => {
                    debug!(pump = %self.label, conn = id, peer = %conn.peer(), "connection removed");
                    handler.on_close(conn);
                    removed += 1;
                }
                Err(err) => trace!(pump = %self.label, conn = id, error = %err, "already gone"),
            }
        }
        removed
    }

    /// Take ownership of a connection handed over from elsewhere.
    pub fn attach(&mut self, conn: Connection) -> std::result::Result<(), Rejected<Connection>> {
        let id = conn.id();
        let buffered = conn.has_buffered();
        self.mux.add(id, conn)?;
        if buffered {
            self.backlog.push(id);
        }
        self.sync_output(id);
        Ok(())
    }

    /// Give up a connection without closing it.
    pub fn detach(&mut self, id: ConnId) -> Option<Connection> {
        self.doomed.remove(&id);
        self.flushing.remove(&id);
        self.backlog.retain(|pending| *pending != id);
        self.mux.remove(id).ok()
    }

    /// Send one frame to `id`; a failed write marks the connection.
    pub fn send_to(&mut self, id: ConnId, payload: &[u8]) -> bool {
        let Some(conn) = self.mux.get_mut(id) else {
            return false;
        };
        match conn.send(payload) {
            Ok(()) => {
                self.sync_output(id);
                true
            }
            Err(err) => {
                debug!(pump = %self.label, conn = id, error = %err, "send failed");
                self.mark(id);
                false
            }
        }
    }

    /// Send one frame to every live connection; failed writes mark their
    /// connection. Returns how many failed.
    pub fn broadcast(&mut self, payload: &[u8]) -> usize {
        let doomed = &self.doomed;
        let targets = self
            .mux
            .iter_mut()
            .filter(|(id, _)| !doomed.contains(id))
            .map(|(id, conn)| {
                let (queue, stream) = conn.outbound();
                (id, queue, stream)
            });
        let failed = match tickchat_frame::broadcast(targets, payload) {
            Ok(failed) => failed,
            Err(err) => {
                warn!(pump = %self.label, error = %err, "broadcast payload rejected");
                return 0;
            }
        };
        let count = failed.len();
        for id in failed {
            self.mark(id);
        }
        let flushing = &self.flushing;
        let changed: Vec<ConnId> = self
            .mux
            .iter()
            .filter(|(id, conn)| conn.has_pending_output() != flushing.contains(id))
            .map(|(id, _)| id)
            .collect();
        for id in changed {
            self.sync_output(id);
        }
        count
    }

    pub fn get(&self, id: ConnId) -> Option<&Connection> {
        self.mux.get(id)
    }

    pub fn get_mut(&mut self, id: ConnId) -> Option<&mut Connection> {
        self.mux.get_mut(id)
    }

    pub fn connections(&self) -> impl Iterator<Item = &Connection> {
        self.mux.iter().map(|(_, conn)| conn)
    }

    pub fn ids(&self) -> Vec<ConnId> {
        self.mux.tokens().collect()
    }

    pub fn len(&self) -> usize {
        self.mux.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mux.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.mux.capacity()
    }

    pub fn is_full(&self) -> bool {
        self.mux.is_full()
    }
}

impl std::fmt::Debug for ConnectionPump {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPump")
            .field("label", &self.label)
            .field("connections", &self.mux.len())
            .field("capacity", &self.mux.capacity())
            .field("marked", &self.doomed.len())
            .field("flushing", &self.flushing.len())
            .finish()
    }
}
