use crate::unix::Errno;
use thiserror::Error;

/// Errors raised by the capture driver.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A raw system error.
    #[error("system error: {0}")]
    Sys(#[from] Errno),
    /// Opening or negotiating the capture device failed.
    #[error(transparent)]
    Open(#[from] crate::pcm::OpenError),
    /// Resuming a suspended device failed; the source stays suspended.
    #[error("resume failed: {0}")]
    Resume(#[from] crate::capture::ResumeError),
    /// The sample specification is not expressible on this device.
    #[error("unsupported sample specification")]
    UnsupportedSampleSpec,
    /// The device reservation is held by another application.
    #[error("device reservation is held by another application")]
    ReservationBusy,
    /// The I/O thread is no longer processing messages.
    #[error("the I/O thread has shut down")]
    ThreadGone,
    /// The requested state transition is not allowed.
    #[error("invalid state transition")]
    InvalidTransition,
}

/// The re-exported result type.
pub type Result<T, E = Error> = ::std::result::Result<T, E>;
