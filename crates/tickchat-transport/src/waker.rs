use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use crate::error::{Result, TransportError};

/// Cross-thread wakeup for a thread blocked in [`crate::Multiplexer::poll`].
///
/// Backed by a non-blocking `eventfd`. Any number of [`Waker::wake`] calls
/// between two polls collapse into a single readiness event; the polling side
/// calls [`Waker::reset`] once it has seen it.
#[derive(Debug)]
pub struct Waker {
    fd: OwnedFd,
}

impl Waker {
    pub fn new() -> Result<Self> {
        // SAFETY: eventfd has no pointer arguments; the descriptor is checked
        // before being wrapped.
        let raw = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if raw < 0 {
            return Err(TransportError::Poller(io::Error::last_os_error()));
        }
        // SAFETY: `raw` is a fresh descriptor not owned elsewhere.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        Ok(Self { fd })
    }

    /// Make the waker readable.
    pub fn wake(&self) -> Result<()> {
        let one: u64 = 1;
        // SAFETY: writes exactly 8 bytes from a live stack value to an owned eventfd.
        let rc = unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                (&one as *const u64).cast::<libc::c_void>(),
                std::mem::size_of::<u64>(),
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            // Counter saturated: the waker is already readable.
            if err.kind() != io::ErrorKind::WouldBlock {
                return Err(TransportError::Io(err));
            }
        }
        Ok(())
    }

    /// Clear pending wakeups.
    pub fn reset(&self) -> Result<()> {
        let mut value: u64 = 0;
        // SAFETY: reads exactly 8 bytes into a live stack value from an owned eventfd.
        let rc = unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                (&mut value as *mut u64).cast::<libc::c_void>(),
                std::mem::size_of::<u64>(),
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::WouldBlock {
                return Err(TransportError::Io(err));
            }
        }
        Ok(())
    }
}

impl AsRawFd for Waker {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
