use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use tracing::{debug, trace};

use crate::error::{Rejected, Result, TransportError};

/// Identifies a registered descriptor in readiness reports.
pub type Token = u64;

/// Reserved token for the listening socket.
pub const LISTENER: Token = 0;

/// Reserved token for the wakeup descriptor.
pub const WAKER: Token = u64::MAX;

const READ_INTEREST: u32 = (libc::EPOLLIN | libc::EPOLLRDHUP) as u32;

/// One entry of the ready list produced by [`Multiplexer::poll`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub token: Token,
    /// Data (or EOF) can be read without blocking.
    pub readable: bool,
    /// The send buffer has room. Only reported while write interest is on.
    pub writable: bool,
    /// The peer hung up or shut down its write half.
    pub hangup: bool,
    /// The descriptor is in an error state.
    pub error: bool,
}

/// Bounded, level-triggered readiness set over `epoll`.
///
/// The multiplexer owns every source added to it: removing a token hands the
/// source back, and dropping the multiplexer deregisters and closes whatever is
/// still tracked. The listening socket and the waker are borrowed, registered
/// under reserved tokens, and never count against `capacity`.
pub struct Multiplexer<S: AsRawFd> {
    epfd: OwnedFd,
    capacity: usize,
    sources: HashMap<Token, S>,
    reserved: Vec<(Token, RawFd)>,
    events: Vec<libc::epoll_event>,
    ready: usize,
}

impl<S: AsRawFd> Multiplexer<S> {
    /// Create the readiness facility with room for `capacity` sources.
    pub fn new(capacity: usize) -> Result<Self> {
        // SAFETY: epoll_create1 has no pointer arguments; the returned descriptor
        // is checked before being wrapped.
        let raw = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if raw < 0 {
            return Err(TransportError::Poller(io::Error::last_os_error()));
        }
        // SAFETY: `raw` is a freshly created descriptor owned by nobody else.
        let epfd = unsafe { OwnedFd::from_raw_fd(raw) };

        let slots = capacity.saturating_add(2).max(1);
        Ok(Self {
            epfd,
            capacity,
            sources: HashMap::with_capacity(capacity),
            reserved: Vec::new(),
            events: vec![libc::epoll_event { events: 0, u64: 0 }; slots],
            ready: 0,
        })
    }

    /// Register the listening socket under [`LISTENER`].
    pub fn watch_listener(&mut self, listener: &impl AsRawFd) -> Result<()> {
        self.watch_reserved(LISTENER, listener.as_raw_fd())
    }

    /// Register a wakeup descriptor under [`WAKER`].
    pub fn watch_waker(&mut self, waker: &impl AsRawFd) -> Result<()> {
        self.watch_reserved(WAKER, waker.as_raw_fd())
    }

    fn watch_reserved(&mut self, token: Token, fd: RawFd) -> Result<()> {
        if self.reserved.iter().any(|(t, _)| *t == token) {
            return Err(TransportError::TokenInUse(token));
        }
        self.ctl(libc::EPOLL_CTL_ADD, fd, token, libc::EPOLLIN as u32)
            .map_err(|source| TransportError::Interest { token, source })?;
        self.reserved.push((token, fd));
        Ok(())
    }

    /// Take ownership of `source` and watch it for input.
    ///
    /// At capacity this fails with [`TransportError::PoolFull`] and the source
    /// is handed back untouched.
    pub fn add(&mut self, token: Token, source: S) -> std::result::Result<(), Rejected<S>> {
        if token == LISTENER || token == WAKER || self.sources.contains_key(&token) {
            return Err(Rejected::new(TransportError::TokenInUse(token), source));
        }
        if self.sources.len() >= self.capacity {
            return Err(Rejected::new(
                TransportError::PoolFull {
                    capacity: self.capacity,
                },
                source,
            ));
        }

        if let Err(err) = self.ctl(libc::EPOLL_CTL_ADD, source.as_raw_fd(), token, READ_INTEREST) {
            return Err(Rejected::new(
                TransportError::Interest { token, source: err },
                source,
            ));
        }

        trace!(token, fd = source.as_raw_fd(), "registered source");
        self.sources.insert(token, source);
        Ok(())
    }

    /// Stop watching `token` and return its source without closing it.
    pub fn remove(&mut self, token: Token) -> Result<S> {
        let source = self
            .sources
            .remove(&token)
            .ok_or(TransportError::UnknownToken(token))?;
        if let Err(err) = self.ctl(libc::EPOLL_CTL_DEL, source.as_raw_fd(), token, 0) {
            if !is_already_gone(&err) {
                debug!(token, error = %err, "deregistration failed");
            }
        }
        Ok(source)
    }

    /// Turn write readiness reporting for `token` on or off.
    ///
    /// Sources are added watching input only; callers holding unsent output
    /// switch this on until the backlog drains.
    pub fn set_writable(&mut self, token: Token, writable: bool) -> Result<()> {
        let fd = self
            .sources
            .get(&token)
            .ok_or(TransportError::UnknownToken(token))?
            .as_raw_fd();
        let interest = if writable {
            READ_INTEREST | libc::EPOLLOUT as u32
        } else {
            READ_INTEREST
        };
        self.ctl(libc::EPOLL_CTL_MOD, fd, token, interest)
            .map_err(|source| TransportError::Interest { token, source })
    }

    /// Block up to `timeout` (forever when `None`) and return the ready count.
    ///
    /// A signal interrupting the wait reports zero ready descriptors.
    pub fn poll(&mut self, timeout: Option<Duration>) -> Result<usize> {
        let timeout_ms = match timeout {
            Some(timeout) => i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX),
            None => -1,
        };
        let max_events = i32::try_from(self.events.len()).unwrap_or(i32::MAX);

        // SAFETY: `events` is a valid, writable buffer of `max_events` entries
        // and `epfd` is an open epoll descriptor owned by `self`.
        let n = unsafe {
            libc::epoll_wait(
                self.epfd.as_raw_fd(),
                self.events.as_mut_ptr(),
                max_events,
                timeout_ms,
            )
        };
        if n < 0 {
            self.ready = 0;
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(TransportError::Poll(err));
        }

        self.ready = n as usize;
        Ok(self.ready)
    }

    /// The ready list from the most recent [`Self::poll`].
    pub fn ready(&self) -> impl Iterator<Item = Readiness> + '_ {
        self.events[..self.ready].iter().map(|event| {
            let flags = event.events;
            let token = event.u64;
            Readiness {
                token,
                readable: flags & libc::EPOLLIN as u32 != 0,
                writable: flags & libc::EPOLLOUT as u32 != 0,
                hangup: flags & (libc::EPOLLHUP | libc::EPOLLRDHUP) as u32 != 0,
                error: flags & libc::EPOLLERR as u32 != 0,
            }
        })
    }

    /// Borrow a tracked source.
    pub fn get(&self, token: Token) -> Option<&S> {
        self.sources.get(&token)
    }

    /// Mutably borrow a tracked source.
    pub fn get_mut(&mut self, token: Token) -> Option<&mut S> {
        self.sources.get_mut(&token)
    }

    /// True when `token` is tracked.
    pub fn contains(&self, token: Token) -> bool {
        self.sources.contains_key(&token)
    }

    /// Tokens of every tracked source (reserved tokens excluded).
    pub fn tokens(&self) -> impl Iterator<Item = Token> + '_ {
        self.sources.keys().copied()
    }

    /// Iterate over tracked sources.
    pub fn iter(&self) -> impl Iterator<Item = (Token, &S)> {
        self.sources.iter().map(|(token, source)| (*token, source))
    }

    /// Iterate mutably over tracked sources.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Token, &mut S)> {
        self.sources
            .iter_mut()
            .map(|(token, source)| (*token, source))
    }

    /// Number of tracked sources.
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    /// True when no sources are tracked.
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Maximum number of tracked sources.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// True when another [`Self::add`] would fail with `PoolFull`.
    pub fn is_full(&self) -> bool {
        self.sources.len() >= self.capacity
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, token: Token, interest: u32) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interest,
            u64: token,
        };
        // SAFETY: `event` outlives the call, `epfd` is owned by `self` and `fd`
        // belongs to a source that is still alive.
        let rc = unsafe { libc::epoll_ctl(self.epfd.as_raw_fd(), op, fd, &mut event) };
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}

impl<S: AsRawFd> Drop for Multiplexer<S> {
    fn drop(&mut self) {
        for (token, source) in self.sources.drain() {
            let mut event = libc::epoll_event { events: 0, u64: 0 };
            // SAFETY: same invariants as `ctl`; failures are tolerated below.
            let rc = unsafe {
                libc::epoll_ctl(
                    self.epfd.as_raw_fd(),
                    libc::EPOLL_CTL_DEL,
                    source.as_raw_fd(),
                    &mut event,
                )
            };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if !is_already_gone(&err) {
                    debug!(token, error = %err, "deregistration on drop failed");
                }
            }
            drop(source);
        }
    }
}

impl<S: AsRawFd> std::fmt::Debug for Multiplexer<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("epfd", &self.epfd.as_raw_fd())
            .field("capacity", &self.capacity)
            .field("tracked", &self.sources.len())
            .finish()
    }
}

fn is_already_gone(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(libc::ENOENT) | Some(libc::EBADF))
}
