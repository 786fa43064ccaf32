//! Completion channel descriptors.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use crate::utils::interop::from_libc_ret;

/// Semaphore-mode `eventfd`: one `signal` per event, one `wait` consumes it.
#[derive(Debug)]
pub(super) struct EventFd(OwnedFd);

impl EventFd {
    pub fn new() -> io::Result<Self> {
        // SAFETY: FFI.
        let fd = from_libc_ret(unsafe {
            libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_SEMAPHORE)
        })?;
        // SAFETY: `eventfd` returned a fresh descriptor that nothing else owns.
        Ok(Self(unsafe { OwnedFd::from_raw_fd(fd) }))
    }

    pub fn signal(&self) -> io::Result<()> {
        let one = 1u64;
        // SAFETY: FFI, writing 8 bytes from a valid `u64`.
        let n = unsafe { libc::write(self.as_raw_fd(), (&one as *const u64).cast(), 8) };
        if n == 8 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    /// Consume one event if the descriptor is readable right now, whatever
    /// its blocking mode. Returns whether an event was taken.
    pub fn try_take(&self) -> io::Result<bool> {
        let mut pfd = libc::pollfd {
            fd: self.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        // SAFETY: FFI, one valid `pollfd`.
        if from_libc_ret(unsafe { libc::poll(&mut pfd, 1, 0) })? == 0 {
            return Ok(false);
        }
        wait(self.as_raw_fd()).map(|_| true)
    }
}

impl AsRawFd for EventFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

/// Consume one event from the descriptor. Blocks unless the descriptor is
/// `O_NONBLOCK`.
///
/// Takes a raw descriptor so that the caller can wait without holding the
/// fabric lock.
pub(super) fn wait(fd: RawFd) -> io::Result<()> {
    let mut value = 0u64;
    loop {
        // SAFETY: FFI, reading 8 bytes into a valid `u64`.
        let n = unsafe { libc::read(fd, (&mut value as *mut u64).cast(), 8) };
        if n == 8 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}
