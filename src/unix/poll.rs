//! Unix-related types needed to deal with polling.

use crate::libc as c;
use crate::unix::errno::Errno;
use std::os::unix::io::{AsRawFd, RawFd};

bitflags::bitflags! {
    /// Event flags for use with [poll].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PollFlags: c::c_short {
        /// There is data to read.
        const POLLIN = c::POLLIN;
        /// There is some exceptional condition on the file descriptor.
        const POLLPRI = c::POLLPRI;
        /// Writing is now possible.
        const POLLOUT = c::POLLOUT;
        /// Error condition.
        const POLLERR = c::POLLERR;
        /// Hang up.
        const POLLHUP = c::POLLHUP;
        /// Invalid request.
        const POLLNVAL = c::POLLNVAL;
    }
}

/// `poll` waits for one of a set of file descriptors to become ready to
/// perform I/O.
/// ([`poll(2)`](http://pubs.opengroup.org/onlinepubs/9699919799/functions/poll.html))
///
/// `fds` contains all [PollFd]s to poll. The function will return as soon as
/// any event occurs for any of them.
///
/// The `timeout` argument specifies the number of milliseconds that `poll()`
/// should block waiting for a file descriptor to become ready. Specifying a
/// negative value in timeout means an infinite timeout. Specifying a timeout
/// of zero causes `poll()` to return immediately, even if no file
/// descriptors are ready.
pub fn poll(fds: &mut [PollFd], timeout: c::c_int) -> Result<c::c_int, Errno> {
    let res = unsafe {
        c::poll(
            fds.as_mut_ptr() as *mut c::pollfd,
            fds.len() as c::nfds_t,
            timeout,
        )
    };

    if res < 0 {
        return Err(Errno::last());
    }

    Ok(res)
}

/// This is a wrapper around `libc::pollfd`.
#[repr(transparent)]
#[derive(Clone, Copy, Debug)]
pub struct PollFd {
    pollfd: c::pollfd,
}

impl PartialEq for PollFd {
    fn eq(&self, other: &Self) -> bool {
        self.pollfd.fd == other.pollfd.fd
            && self.pollfd.events == other.pollfd.events
            && self.pollfd.revents == other.pollfd.revents
    }
}

impl Eq for PollFd {}

impl std::hash::Hash for PollFd {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.pollfd.fd.hash(state);
        self.pollfd.events.hash(state);
        self.pollfd.revents.hash(state);
    }
}

impl PollFd {
    /// Creates a new `PollFd` specifying the events of interest for a given
    /// file descriptor.
    pub fn new(fd: RawFd, events: PollFlags) -> PollFd {
        PollFd {
            pollfd: c::pollfd {
                fd,
                events: events.bits(),
                revents: PollFlags::empty().bits(),
            },
        }
    }

    /// Returns the events that occurred in the last call to [poll].
    pub fn revents(self) -> Option<PollFlags> {
        PollFlags::from_bits(self.pollfd.revents)
    }

    /// Overwrite the returned events.
    ///
    /// Used when revents are delivered out of band, like after demangling
    /// through the PCM layer.
    pub fn set_revents(&mut self, revents: PollFlags) {
        self.pollfd.revents = revents.bits();
    }

    /// Clear the returned events before a new wait.
    pub fn clear_revents(&mut self) {
        self.pollfd.revents = 0;
    }
}

impl AsRawFd for PollFd {
    fn as_raw_fd(&self) -> RawFd {
        self.pollfd.fd
    }
}
