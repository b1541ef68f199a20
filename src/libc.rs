//! libc specifics
//!
//! These are all re-exports from the [libc crate] and are intended for local
//! use w/ APIs that use a C-like ABI, like [ALSA][crate::pcm].
//!
//! [libc crate]: https://crates.io/crates/libc

pub use ::libc::eventfd;
pub use ::libc::free;
pub use ::libc::nfds_t;
pub use ::libc::EFD_NONBLOCK;
pub use ::libc::{c_char, c_int, c_long, c_short, c_uint, c_ulong, c_void};
pub use ::libc::{clock_getres, clock_gettime, timespec, CLOCK_MONOTONIC};
pub use ::libc::{poll, pollfd, POLLERR, POLLHUP, POLLIN, POLLNVAL, POLLOUT, POLLPRI};
pub use ::libc::{read, write};
pub use ::libc::{sched_get_priority_max, sched_get_priority_min, sched_param, SCHED_RR};
