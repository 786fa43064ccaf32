//! File descriptor helpers for descriptors handed out by the verbs layer,
//! such as completion channel descriptors.

use std::io;
use std::os::fd::RawFd;

use crate::utils::interop::from_libc_ret;

/// Close a descriptor.
pub fn close(fd: RawFd) -> io::Result<()> {
    // SAFETY: FFI.
    from_libc_ret(unsafe { libc::close(fd) }).map(|_| ())
}

/// Current file status flags (`F_GETFL`).
pub fn get_flags(fd: RawFd) -> io::Result<i32> {
    // SAFETY: FFI.
    from_libc_ret(unsafe { libc::fcntl(fd, libc::F_GETFL) })
}

/// Add `mode` (e.g. `O_NONBLOCK`) to the file status flags. Existing flags
/// are kept.
pub fn set_flags(fd: RawFd, mode: i32) -> io::Result<()> {
    let flags = get_flags(fd)?;
    // SAFETY: FFI.
    from_libc_ret(unsafe { libc::fcntl(fd, libc::F_SETFL, flags | mode) }).map(|_| ())
}
