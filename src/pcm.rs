//! The thin PCM surface the capture engine is written against.
//!
//! The engine never touches `snd_pcm_*` directly; it drives a
//! [CapturePcm], obtained from a [PcmOpener]. The `alsa` feature provides
//! the real backend ([crate::alsa::AlsaOpener]); tests install a mock.

use crate::sample::SampleSpec;
use crate::unix::poll::{PollFd, PollFlags};
use crate::unix::Errno;
use thiserror::Error;

/// Errors raised while opening and negotiating a capture device.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum OpenError {
    /// The device could not be opened at all.
    #[error("error opening PCM device {device}: {source}")]
    Device {
        /// The ALSA device string.
        device: String,
        /// The underlying error.
        #[source]
        source: Errno,
    },
    /// Hardware parameter negotiation failed.
    #[error("failed to set hardware parameters: {0}")]
    HwParams(#[source] Errno),
    /// Software parameter installation failed.
    #[error("failed to set software parameters: {0}")]
    SwParams(#[source] Errno),
    /// The device cannot express the requested sample specification.
    #[error("device does not support the requested sample specification")]
    UnsupportedSpec,
}

/// Hardware ring geometry and access mode, requested or negotiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HwParams {
    /// The sample specification.
    pub sample_spec: SampleSpec,
    /// Number of ring fragments (periods).
    pub nfragments: u32,
    /// Frames per fragment.
    pub period_frames: u64,
    /// Memory-mapped access.
    pub use_mmap: bool,
    /// Timer-based scheduling requested for this handle.
    pub use_tsched: bool,
}

impl HwParams {
    /// Size of one fragment, in bytes.
    pub fn fragment_size(&self) -> u64 {
        self.period_frames * self.sample_spec.frame_size() as u64
    }

    /// Size of the hardware ring, in bytes.
    pub fn hwbuf_size(&self) -> u64 {
        self.fragment_size() * self.nfragments as u64
    }
}

/// Coarse PCM runtime states, for poll error recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum PcmState {
    /// Device is set up but not started.
    Prepared,
    /// Device is capturing.
    Running,
    /// The ring overran; data was lost.
    Xrun,
    /// The device is suspended by power management.
    Suspended,
    /// The device went away.
    Disconnected,
    /// Anything else.
    Other,
}

/// A window into the device's mmap'ed ring buffer.
///
/// Returned by [CapturePcm::mmap_begin]; `ptr` addresses the first
/// readable byte of the window. The caller must hand the window back with
/// [CapturePcm::mmap_commit] before requesting the next one.
#[derive(Debug)]
pub struct MmapArea {
    /// First readable byte of the window.
    pub ptr: *mut u8,
    /// Ring offset, in frames, to pass to `mmap_commit`.
    pub offset: u64,
    /// Number of readable frames in the window.
    pub frames: u64,
}

/// An opened capture PCM.
///
/// After the I/O thread is spawned the handle is owned by it exclusively;
/// all methods take `&mut self` and implementations may assume
/// single-threaded use.
pub trait CapturePcm: Send {
    /// The canonical device name this handle was opened with.
    fn device_name(&self) -> &str;

    /// The coarse runtime state.
    fn state(&mut self) -> PcmState;

    /// Number of frames ready to be read.
    fn avail(&mut self) -> Result<u64, Errno>;

    /// Capture delay, in frames: how long ago the newest readable frame
    /// was recorded.
    fn delay(&mut self) -> Result<i64, Errno>;

    /// The device's timestamp of the last position update, in µs of the
    /// monotonic clock; 0 when the device did not set one.
    fn htimestamp(&mut self) -> Result<u64, Errno>;

    /// Start capturing.
    fn start(&mut self) -> Result<(), Errno>;

    /// Stop capturing and drop buffered frames. Best effort, used on
    /// teardown only.
    fn stop(&mut self);

    /// Install software parameters: wake the poller once `avail_min_frames`
    /// are ready, timestamps enabled.
    fn set_sw_params(&mut self, avail_min_frames: u64) -> Result<(), Errno>;

    /// Map up to `frames` readable frames for direct access.
    fn mmap_begin(&mut self, frames: u64) -> Result<MmapArea, Errno>;

    /// Hand a mapped window back to the kernel. Returns the number of
    /// frames actually committed.
    fn mmap_commit(&mut self, offset: u64, frames: u64) -> Result<u64, Errno>;

    /// Read up to `frames` interleaved frames into `buf`. Returns the
    /// number of frames read.
    fn readi(&mut self, buf: &mut [u8], frames: u64) -> Result<u64, Errno>;

    /// Recover from a transient stream error (`EPIPE`, `ESTRPIPE`).
    fn recover(&mut self, err: Errno) -> Result<(), Errno>;

    /// The descriptors to wait on for this handle.
    fn pollfds(&mut self) -> Result<Vec<PollFd>, Errno>;

    /// Demangle the revents of a wait on [CapturePcm::pollfds].
    fn revents(&mut self, fds: &mut [PollFd]) -> Result<PollFlags, Errno>;
}

/// Opens capture PCMs.
///
/// `exact` is set when reopening after a suspend: the negotiated
/// parameters have to match `requested` exactly or resume fails, so the
/// opener must not silently substitute geometry. A fresh open is free to
/// hand back whatever the device actually granted.
pub trait PcmOpener: Send {
    /// Open `device` for capture and negotiate `requested`.
    fn open(
        &mut self,
        device: &str,
        requested: &HwParams,
        exact: bool,
    ) -> Result<(Box<dyn CapturePcm>, HwParams), OpenError>;
}
