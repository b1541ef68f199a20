//! Monotonic clock access and rate limiting for log sites.

use crate::libc as c;
use std::mem;

/// Microseconds per second.
pub const USEC_PER_SEC: u64 = 1_000_000;
/// Microseconds per millisecond.
pub const USEC_PER_MSEC: u64 = 1_000;
/// Nanoseconds per microsecond.
pub const NSEC_PER_USEC: u64 = 1_000;

/// Read the monotonic clock, in microseconds.
pub fn monotonic_usec() -> u64 {
    unsafe {
        let mut ts = mem::MaybeUninit::<c::timespec>::uninit();

        if c::clock_gettime(c::CLOCK_MONOTONIC, ts.as_mut_ptr()) < 0 {
            return 0;
        }

        timespec_usec(&ts.assume_init())
    }
}

/// Load a timespec as microseconds.
pub fn timespec_usec(ts: &c::timespec) -> u64 {
    if ts.tv_sec < 0 {
        return 0;
    }

    ts.tv_sec as u64 * USEC_PER_SEC + ts.tv_nsec as u64 / NSEC_PER_USEC
}

/// Test whether the kernel exposes high resolution timers.
///
/// Timer-based scheduling is pointless when the monotonic clock only ticks
/// at jiffy granularity, so the engine downgrades to interrupt-driven
/// scheduling when this returns `false`.
pub fn hrtimer_available() -> bool {
    unsafe {
        let mut ts = mem::MaybeUninit::<c::timespec>::uninit();

        if c::clock_getres(c::CLOCK_MONOTONIC, ts.as_mut_ptr()) < 0 {
            return false;
        }

        let ts = ts.assume_init();
        ts.tv_sec == 0 && (ts.tv_nsec as u64) < 2 * USEC_PER_MSEC * NSEC_PER_USEC
    }
}

/// A token bucket for rate limited log sites.
///
/// Allows `burst` events per `interval` microseconds and reports how many
/// were suppressed once the interval rolls over.
#[derive(Debug)]
pub struct Ratelimit {
    interval: u64,
    burst: u32,
    begin: u64,
    n_printed: u32,
    n_missed: u32,
}

impl Ratelimit {
    /// Construct a new rate limit window.
    pub fn new(interval: u64, burst: u32) -> Self {
        Self {
            interval,
            burst,
            begin: 0,
            n_printed: 0,
            n_missed: 0,
        }
    }

    /// Whether the caller may emit its event now.
    pub fn check(&mut self) -> bool {
        self.check_at(monotonic_usec())
    }

    fn check_at(&mut self, now: u64) -> bool {
        if self.begin == 0 || now >= self.begin + self.interval {
            if self.n_missed > 0 {
                tracing::debug!(suppressed = self.n_missed, "rate limited events");
            }

            self.begin = now;
            self.n_printed = 0;
            self.n_missed = 0;
        }

        if self.n_printed < self.burst {
            self.n_printed += 1;
            return true;
        }

        self.n_missed += 1;
        false
    }
}
