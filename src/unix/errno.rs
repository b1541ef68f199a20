//! A thin errno wrapper for raw OS and ALSA return values.

use crate::libc as c;
use std::fmt;
use std::io;

/// A raw OS error, as returned through negative C return values.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Errno(c::c_int);

impl Errno {
    /// Operation would block.
    pub const EAGAIN: Errno = Errno(libc::EAGAIN);
    /// Broken pipe. ALSA reuses this for capture overruns.
    pub const EPIPE: Errno = Errno(libc::EPIPE);
    /// Stream is suspended.
    pub const ESTRPIPE: Errno = Errno(libc::ESTRPIPE);
    /// I/O error.
    pub const EIO: Errno = Errno(libc::EIO);
    /// File descriptor in bad state.
    pub const EBADFD: Errno = Errno(libc::EBADFD);
    /// No such device.
    pub const ENODEV: Errno = Errno(libc::ENODEV);
    /// Device or resource busy.
    pub const EBUSY: Errno = Errno(libc::EBUSY);
    /// Interrupted system call.
    pub const EINTR: Errno = Errno(libc::EINTR);

    /// Construct an errno from a positive error number.
    pub fn from_i32(value: i32) -> Self {
        Self(value)
    }

    /// Read the last errno reported for the current thread.
    pub fn last() -> Self {
        Self(io::Error::last_os_error().raw_os_error().unwrap_or(0))
    }

    /// The raw error number.
    pub fn raw(self) -> i32 {
        self.0
    }
}

impl fmt::Debug for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Errno({}, {})", self.0, io::Error::from_raw_os_error(self.0))
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        io::Error::from_raw_os_error(self.0).fmt(f)
    }
}

impl std::error::Error for Errno {}
