//! The capture engine: hardware ring geometry, the timer-scheduled read
//! loop, overrun recovery and the main-thread handle.
//!
//! One [CaptureSource] owns one device and one I/O thread. After
//! construction the PCM handle belongs to the I/O thread exclusively; the
//! main thread only talks to it through the message queue. The mixer
//! bridge and the device reservation stay on the main thread.

use crate::config::{Config, DEFAULT_TSCHED_WATERMARK_USEC};
use crate::memblock::{MemChunk, Memblock, Mempool};
use crate::mixer::{MixerBridge, MixerElement, MixerEventMask};
use crate::pcm::{CapturePcm, HwParams, OpenError, PcmOpener, PcmState};
use crate::reserve::{reserve_name, HookResult, Reservation, ReserveManager};
use crate::rtpoll::{RtPoll, RtPollItem};
use crate::sample::SampleSpec;
use crate::smoother::Smoother;
use crate::source::{Source, SourceFlags, SourceOutput, SourceState};
use crate::thread_mq::{thread_mq, ControlMessage, EngineMessage, IoMq, MainMq};
use crate::time::{hrtimer_available, monotonic_usec, Ratelimit, USEC_PER_MSEC, USEC_PER_SEC};
use crate::unix::poll::PollFlags;
use crate::unix::Errno;
use crate::volume::ChannelVolumes;
use crate::{Error, Result};
use std::sync::mpsc::channel;
use std::sync::Once;
use std::thread;
use thiserror::Error as ThisError;

/// Additive watermark growth bound, and the step for raising the minimal
/// latency once the watermark saturates.
pub const TSCHED_WATERMARK_STEP_USEC: u64 = 10 * USEC_PER_MSEC;
/// Lower bound for the sleep floor.
pub const TSCHED_MIN_SLEEP_USEC: u64 = 10 * USEC_PER_MSEC;
/// Lower bound for the wakeup floor.
pub const TSCHED_MIN_WAKEUP_USEC: u64 = 4 * USEC_PER_MSEC;
/// Smallest latency a dynamic-latency source will advertise.
pub const ABSOLUTE_MIN_LATENCY_USEC: u64 = 500;

/// Cap on inner read iterations per wakeup, so one starved consumer cannot
/// pin the thread in the read loop forever.
const MAX_READ_ITERATIONS: u32 = 10;

static SPURIOUS_WAKEUP: Once = Once::new();

/// Why resuming a suspended source failed.
#[derive(Debug, ThisError)]
#[non_exhaustive]
pub enum ResumeError {
    /// Reopening the device failed.
    #[error(transparent)]
    Open(#[from] OpenError),
    /// The device no longer grants the original access mode.
    #[error("couldn't get original access mode")]
    AccessModeChanged,
    /// The device no longer grants the original sample spec.
    #[error("couldn't restore original sample settings")]
    SampleSpecChanged,
    /// The device no longer grants the original ring geometry.
    #[error("couldn't restore original fragment settings")]
    GeometryChanged,
    /// Installing software parameters failed.
    #[error("failed to set software parameters: {0}")]
    SwParams(#[source] Errno),
    /// Rebuilding the poll descriptors failed.
    #[error("failed to build poll descriptors: {0}")]
    PollFds(#[source] Errno),
    /// Starting the stream failed.
    #[error("failed to start: {0}")]
    Start(#[source] Errno),
}

/// A snapshot of the I/O thread's timing state, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingInfo {
    /// Bytes successfully posted downstream since creation. Never resets.
    pub read_count: u64,
    /// Current wakeup watermark, in bytes.
    pub tsched_watermark: u64,
    /// Bytes of the hardware buffer intentionally left idle.
    pub hwbuf_unused: u64,
    /// Sleep floor, in bytes.
    pub min_sleep: u64,
    /// Wakeup floor, in bytes.
    pub min_wakeup: u64,
    /// Current minimal latency, in µs.
    pub min_latency: u64,
    /// Current maximal latency, in µs.
    pub max_latency: u64,
    /// Whether the PCM handle is open.
    pub pcm_open: bool,
    /// Whether the smoother is paused.
    pub smoother_paused: bool,
}

/// The watermark/latency controller.
///
/// Pure arithmetic over the ring geometry; the I/O thread owns one and
/// feeds overrun events and latency requests into it.
#[derive(Debug, Clone)]
pub struct LatencyControl {
    sample_spec: SampleSpec,
    /// Timer-based scheduling active.
    pub use_tsched: bool,
    /// Size of the hardware ring, in bytes.
    pub hwbuf_size: u64,
    /// Bytes of the ring intentionally left idle to bound latency.
    pub hwbuf_unused: u64,
    /// Bytes remaining-to-record below which a read is forced.
    pub tsched_watermark: u64,
    /// Sleep floor, in bytes.
    pub min_sleep: u64,
    /// Wakeup floor, in bytes.
    pub min_wakeup: u64,
    /// Additive bound for watermark growth, in bytes.
    pub watermark_step: u64,
    /// Smallest advertised latency, in µs.
    pub min_latency: u64,
    /// Largest advertised latency, in µs.
    pub max_latency: u64,
    /// Latency requested by downstream, if any.
    pub requested_latency: Option<u64>,
}

impl LatencyControl {
    /// Construct a controller over a ring of `hwbuf_size` bytes.
    pub fn new(
        sample_spec: SampleSpec,
        hwbuf_size: u64,
        tsched_watermark: u64,
        use_tsched: bool,
    ) -> Self {
        let hwbuf_usec = sample_spec.bytes_to_usec(hwbuf_size);

        let (min_latency, max_latency) = if use_tsched {
            (ABSOLUTE_MIN_LATENCY_USEC, hwbuf_usec)
        } else {
            (hwbuf_usec, hwbuf_usec)
        };

        let mut ctl = Self {
            sample_spec,
            use_tsched,
            hwbuf_size,
            hwbuf_unused: 0,
            tsched_watermark,
            min_sleep: 0,
            min_wakeup: 0,
            watermark_step: sample_spec.usec_to_bytes(TSCHED_WATERMARK_STEP_USEC),
            min_latency,
            max_latency,
            requested_latency: None,
        };

        if use_tsched {
            ctl.fix_min_sleep_wakeup();
            ctl.fix_tsched_watermark();
        }

        ctl
    }

    fn frame_size(&self) -> u64 {
        self.sample_spec.frame_size() as u64
    }

    /// The sample spec all byte/time arithmetic is done in.
    pub fn sample_spec(&self) -> SampleSpec {
        self.sample_spec
    }

    /// The requested latency, clamped into the advertised range.
    pub fn requested_latency(&self) -> Option<u64> {
        self.requested_latency
            .map(|l| l.max(self.min_latency).min(self.max_latency))
    }

    /// Clamp the sleep and wakeup floors into
    /// `[frame_size, (hwbuf_size - hwbuf_unused) / 2]`, frame aligned.
    pub fn fix_min_sleep_wakeup(&mut self) {
        let max_use = self.hwbuf_size - self.hwbuf_unused;
        let max_use_2 = self.sample_spec.frame_align(max_use / 2);

        self.min_sleep = self
            .sample_spec
            .usec_to_bytes(TSCHED_MIN_SLEEP_USEC)
            .min(max_use_2)
            .max(self.frame_size());

        self.min_wakeup = self
            .sample_spec
            .usec_to_bytes(TSCHED_MIN_WAKEUP_USEC)
            .min(max_use_2)
            .max(self.frame_size());
    }

    /// Clamp the watermark into
    /// `[min_wakeup, (hwbuf_size - hwbuf_unused) - min_sleep]`.
    pub fn fix_tsched_watermark(&mut self) {
        let max_use = self.hwbuf_size - self.hwbuf_unused;

        if self.tsched_watermark > max_use.saturating_sub(self.min_sleep) {
            self.tsched_watermark = max_use.saturating_sub(self.min_sleep);
        }

        if self.tsched_watermark < self.min_wakeup {
            self.tsched_watermark = self.min_wakeup;
        }
    }

    /// Split the buffer time into `(sleep, process)` budgets.
    ///
    /// `sleep + process` equals the requested latency, or the full buffer
    /// time when nothing was requested.
    pub fn hw_sleep_time(&self) -> (u64, u64) {
        let usec = self
            .requested_latency()
            .unwrap_or_else(|| self.sample_spec.bytes_to_usec(self.hwbuf_size));

        let mut wm = self.sample_spec.bytes_to_usec(self.tsched_watermark);

        if wm > usec {
            wm = usec / 2;
        }

        (usec - wm, wm)
    }

    /// Recompute `hwbuf_unused` and the floors after a latency change and
    /// return the `avail_min` to install, in frames.
    pub fn update_sw_params(&mut self) -> u64 {
        self.hwbuf_unused = 0;

        if self.use_tsched {
            if let Some(latency) = self.requested_latency() {
                tracing::debug!("latency set to {:.2}ms", latency as f64 / USEC_PER_MSEC as f64);

                // We need at least one frame in the used part.
                let b = self.sample_spec.usec_to_bytes(latency).max(self.frame_size());

                self.hwbuf_unused = if b < self.hwbuf_size {
                    self.hwbuf_size - b
                } else {
                    0
                };
            }

            self.fix_min_sleep_wakeup();
            self.fix_tsched_watermark();
        }

        tracing::debug!("hwbuf_unused={}", self.hwbuf_unused);

        let mut avail_min = 1;

        if self.use_tsched {
            let (sleep, _) = self.hw_sleep_time();
            avail_min += self.sample_spec.usec_to_bytes(sleep) / self.frame_size();
        }

        avail_min
    }

    /// Feedback after an overrun: grow the watermark, or once that is
    /// saturated, raise the minimal latency.
    pub fn adjust_after_overrun(&mut self) {
        let old_watermark = self.tsched_watermark;

        // First, just try to increase the watermark.
        self.tsched_watermark = (self.tsched_watermark * 2)
            .min(self.tsched_watermark + self.watermark_step);
        self.fix_tsched_watermark();

        if old_watermark != self.tsched_watermark {
            tracing::info!(
                "Increasing wakeup watermark to {:.2} ms",
                self.sample_spec.bytes_to_usec(self.tsched_watermark) as f64
                    / USEC_PER_MSEC as f64
            );
            return;
        }

        // The watermark cannot grow any further, so raise the latency.
        let old_min_latency = self.min_latency;
        let new_min_latency = (old_min_latency * 2)
            .min(old_min_latency + TSCHED_WATERMARK_STEP_USEC)
            .min(self.max_latency);

        if old_min_latency != new_min_latency {
            tracing::info!(
                "Increasing minimal latency to {:.2} ms",
                new_min_latency as f64 / USEC_PER_MSEC as f64
            );
            self.min_latency = new_min_latency;
            return;
        }

        // Both knobs are at their stops; the kernel will keep dropping
        // frames until the consumer catches up.
        tracing::warn!("Watermark and minimal latency saturated after overrun");
    }
}

struct Fatal;

enum Flow {
    Continue,
    Finish,
}

/// Everything the I/O thread owns.
struct IoThread {
    mq: IoMq,
    rtpoll: RtPoll,
    alsa_item: Option<RtPollItem>,
    pcm: Option<Box<dyn CapturePcm>>,
    opener: Box<dyn PcmOpener>,
    output: Box<dyn SourceOutput>,
    pool: Mempool,
    smoother: Smoother,
    lat: LatencyControl,
    sample_spec: SampleSpec,
    nfragments: u32,
    fragment_size: u64,
    use_mmap: bool,
    use_tsched: bool,
    read_count: u64,
    state: SourceState,
    device_name: String,
    realtime_priority: Option<i32>,
    overrun_limit: Ratelimit,
    avail_limit: Ratelimit,
    wakeup_limit: Ratelimit,
}

impl IoThread {
    fn frame_size(&self) -> u64 {
        self.sample_spec.frame_size() as u64
    }

    /// The PCM handle. Only called while the source is opened, where the
    /// handle is guaranteed to be present.
    fn pcm(&mut self) -> &mut dyn CapturePcm {
        match self.pcm.as_deref_mut() {
            Some(pcm) => pcm,
            None => unreachable!("pcm handle present while the source is opened"),
        }
    }

    fn try_recover(&mut self, call: &str, err: Errno) -> Result<(), Fatal> {
        tracing::debug!("{}: {}", call, err);

        // The handle is blocking and reads are driven from avail(), so
        // EAGAIN must never surface here. A non-blocking transport would
        // violate that precondition; fail loudly instead of spinning.
        if err == Errno::EAGAIN {
            tracing::error!("{}: unexpected EAGAIN from a blocking PCM handle", call);
            debug_assert!(err != Errno::EAGAIN);
            return Err(Fatal);
        }

        if err == Errno::EPIPE {
            tracing::debug!("{}: Buffer overrun!", call);
        }

        if let Err(e) = self.pcm().recover(err) {
            tracing::error!("{}: {}", call, e);
            return Err(Fatal);
        }

        if let Err(e) = self.pcm().start() {
            tracing::warn!("failed to restart after recovery: {}", e);
        }

        Ok(())
    }

    /// `snd_pcm_avail` with a plausibility clamp.
    ///
    /// An overrun legitimately reports more than the ring size, and the
    /// read loop relies on seeing that; only truly insane values (several
    /// buffers worth) are clamped as driver bugs.
    fn safe_avail(&mut self) -> Result<u64, Errno> {
        let n = self.pcm().avail()?;
        let max_frames = self.lat.hwbuf_size / self.frame_size();

        if n >= max_frames * 3 {
            if self.avail_limit.check() {
                tracing::warn!(
                    "snd_pcm_avail() returned {} frames, which is exceptionally large (buffer is {} frames); clamping",
                    n,
                    max_frames
                );
            }
            return Ok(max_frames);
        }

        Ok(n)
    }

    /// `snd_pcm_delay` with the same plausibility clamp.
    fn safe_delay(&mut self) -> Result<u64, Errno> {
        let d = self.pcm().delay()?;
        let max_frames = self.lat.hwbuf_size / self.frame_size();

        if d < 0 {
            return Ok(0);
        }

        Ok((d as u64).min(max_frames))
    }

    fn check_left_to_record(&mut self, n_bytes: u64) -> u64 {
        let rec_space = self.lat.hwbuf_size - self.lat.hwbuf_unused;

        // <= here: an overrun only happens after the last sample was
        // overwritten, not already when the buffer is exactly full.
        if n_bytes <= rec_space {
            return rec_space - n_bytes;
        }

        if self.overrun_limit.check() {
            tracing::info!("Overrun!");
        }

        if self.use_tsched {
            self.lat.adjust_after_overrun();
        }

        0
    }

    fn log_spurious_wakeup(&mut self) {
        let device = self.device_name.clone();
        SPURIOUS_WAKEUP.call_once(|| {
            tracing::error!(
                "ALSA woke us up to read new data from device '{}', but there was actually nothing to read! \
                 Most likely this is a bug in the ALSA driver. We were woken up with POLLIN set, however \
                 a subsequent snd_pcm_avail() returned 0 or another value < min_avail.",
                device
            );
        });
    }

    fn mmap_read(&mut self, mut polled: bool) -> Result<(u64, bool), Fatal> {
        let mut work_done = false;
        let mut left_to_record;
        let mut j = 0;

        let (max_sleep_usec, process_usec) = if self.use_tsched {
            self.lat.hw_sleep_time()
        } else {
            (0, 0)
        };

        loop {
            let n_frames = match self.safe_avail() {
                Ok(n) => n,
                Err(e) => {
                    self.try_recover("snd_pcm_avail", e)?;
                    continue;
                }
            };

            let mut n_bytes = n_frames * self.frame_size();
            left_to_record = self.check_left_to_record(n_bytes);

            if self.use_tsched
                && !polled
                && self.sample_spec.bytes_to_usec(left_to_record)
                    > process_usec + max_sleep_usec / 2
            {
                // Too early, the ring can absorb a lot more.
                break;
            }

            if n_bytes == 0 {
                if polled {
                    self.log_spurious_wakeup();
                }
                break;
            }

            j += 1;
            if j > MAX_READ_ITERATIONS {
                break;
            }

            polled = false;

            loop {
                let frames = n_bytes / self.frame_size();

                let area = match self.pcm().mmap_begin(frames) {
                    Ok(area) => area,
                    Err(e) => {
                        self.try_recover("snd_pcm_mmap_begin", e)?;
                        continue;
                    }
                };

                // Cap the chunk so a consumer that has to copy it still
                // fits it into one pool slot.
                let frames = area
                    .frames
                    .min(self.pool.block_size_max() as u64 / self.frame_size());
                let len = (frames * self.frame_size()) as usize;

                // Zero copy: wrap the DMA window, post it, and release our
                // reference before the window goes back to the kernel.
                let chunk = MemChunk {
                    memblock: unsafe { Memblock::new_fixed(area.ptr as *const u8, len) },
                    index: 0,
                    length: len,
                };
                self.output.post(&chunk);
                drop(chunk);

                match self.pcm().mmap_commit(area.offset, frames) {
                    Ok(_) => {}
                    Err(e) => {
                        self.try_recover("snd_pcm_mmap_commit", e)?;
                        continue;
                    }
                }

                work_done = true;
                self.read_count += frames * self.frame_size();

                if frames * self.frame_size() >= n_bytes {
                    break;
                }

                n_bytes -= frames * self.frame_size();
            }
        }

        let sleep_usec = self
            .sample_spec
            .bytes_to_usec(left_to_record)
            .saturating_sub(process_usec);

        Ok((sleep_usec, work_done))
    }

    fn unix_read(&mut self, mut polled: bool) -> Result<(u64, bool), Fatal> {
        let mut work_done = false;
        let mut left_to_record;
        let mut j = 0;

        let (max_sleep_usec, process_usec) = if self.use_tsched {
            self.lat.hw_sleep_time()
        } else {
            (0, 0)
        };

        loop {
            let n_frames = match self.safe_avail() {
                Ok(n) => n,
                Err(e) => {
                    self.try_recover("snd_pcm_avail", e)?;
                    continue;
                }
            };

            let mut n_bytes = n_frames * self.frame_size();
            left_to_record = self.check_left_to_record(n_bytes);

            if self.use_tsched
                && !polled
                && self.sample_spec.bytes_to_usec(left_to_record)
                    > process_usec + max_sleep_usec / 2
            {
                break;
            }

            if n_bytes == 0 {
                if polled {
                    self.log_spurious_wakeup();
                }
                break;
            }

            j += 1;
            if j > MAX_READ_ITERATIONS {
                break;
            }

            polled = false;

            loop {
                let mut block = self.pool.allocate();
                let frames = (block.len() as u64 / self.frame_size())
                    .min(n_bytes / self.frame_size());

                let read = self.pcm().readi(block.as_mut_slice(), frames);

                let frames_read = match read {
                    Ok(n) => n,
                    Err(e) => {
                        drop(block);
                        self.try_recover("snd_pcm_readi", e)?;
                        continue;
                    }
                };

                let len = (frames_read * self.frame_size()) as usize;
                let chunk = MemChunk {
                    memblock: block.freeze(),
                    index: 0,
                    length: len,
                };
                self.output.post(&chunk);
                drop(chunk);

                work_done = true;
                self.read_count += len as u64;

                if len as u64 >= n_bytes {
                    break;
                }

                n_bytes -= len as u64;
            }
        }

        let sleep_usec = self
            .sample_spec
            .bytes_to_usec(left_to_record)
            .saturating_sub(process_usec);

        Ok((sleep_usec, work_done))
    }

    fn update_smoother(&mut self) {
        let delay = match self.safe_delay() {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!("Failed to get delay: {}", e);
                return;
            }
        };

        let mut now1 = match self.pcm().htimestamp() {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!("Failed to get timestamp: {}", e);
                0
            }
        };

        let position = self.read_count + delay * self.frame_size();

        // A zero timestamp means the driver did not set one; fall back to
        // the system clock.
        if now1 == 0 {
            now1 = monotonic_usec();
        }

        let now2 = self.sample_spec.bytes_to_usec(position);
        self.smoother.put(now1, now2);
    }

    fn source_latency(&self) -> u64 {
        let now1 = monotonic_usec();
        let now2 = self.smoother.get(now1);
        let read_usec = self.sample_spec.bytes_to_usec(self.read_count);
        now2.saturating_sub(read_usec)
    }

    fn build_pollfd(&mut self) -> Result<(), Errno> {
        if let Some(item) = self.alsa_item.take() {
            self.rtpoll.item_free(item);
        }

        let fds = self.pcm().pollfds()?;
        self.alsa_item = Some(self.rtpoll.item_new(fds));
        Ok(())
    }

    fn update_sw_params(&mut self) -> Result<(), Errno> {
        let avail_min = self.lat.update_sw_params();
        tracing::debug!("setting avail_min={}", avail_min);

        if let Err(e) = self.pcm().set_sw_params(avail_min) {
            tracing::error!("Failed to set software parameters: {}", e);
            return Err(e);
        }

        Ok(())
    }

    fn suspend(&mut self) {
        self.smoother.pause(monotonic_usec());

        self.pcm = None;

        if let Some(item) = self.alsa_item.take() {
            self.rtpoll.item_free(item);
        }

        tracing::info!("Device suspended...");
    }

    fn unsuspend(&mut self) -> Result<(), ResumeError> {
        tracing::info!("Trying resume...");

        let requested = HwParams {
            sample_spec: self.sample_spec,
            nfragments: self.nfragments,
            period_frames: self.fragment_size / self.frame_size(),
            use_mmap: self.use_mmap,
            use_tsched: self.use_tsched,
        };

        let (pcm, granted) = self.opener.open(&self.device_name, &requested, true)?;

        if granted.use_mmap != self.use_mmap || granted.use_tsched != self.use_tsched {
            tracing::warn!("Resume failed, couldn't get original access mode.");
            return Err(ResumeError::AccessModeChanged);
        }

        if granted.sample_spec != self.sample_spec {
            tracing::warn!("Resume failed, couldn't restore original sample settings.");
            return Err(ResumeError::SampleSpecChanged);
        }

        if granted.nfragments != self.nfragments || granted.fragment_size() != self.fragment_size {
            tracing::warn!(
                "Resume failed, couldn't restore original fragment settings. (Old: {}*{}, New: {}*{})",
                self.nfragments,
                self.fragment_size,
                granted.nfragments,
                granted.fragment_size()
            );
            return Err(ResumeError::GeometryChanged);
        }

        self.pcm = Some(pcm);

        if let Err(e) = self.finish_unsuspend() {
            self.pcm = None;
            if let Some(item) = self.alsa_item.take() {
                self.rtpoll.item_free(item);
            }
            return Err(e);
        }

        tracing::info!("Resumed successfully...");
        Ok(())
    }

    fn finish_unsuspend(&mut self) -> Result<(), ResumeError> {
        self.update_sw_params().map_err(ResumeError::SwParams)?;
        self.build_pollfd().map_err(ResumeError::PollFds)?;
        self.pcm().start().map_err(ResumeError::Start)?;
        self.smoother.resume(monotonic_usec());
        Ok(())
    }

    fn handle_set_state(&mut self, new_state: SourceState) -> Result<()> {
        match new_state {
            SourceState::Suspended => {
                self.suspend();
            }

            SourceState::Idle | SourceState::Running => {
                if self.state == SourceState::Init {
                    self.build_pollfd().map_err(Error::Sys)?;

                    if let Err(e) = self.pcm().start() {
                        return Err(Error::Sys(e));
                    }
                }

                if self.state == SourceState::Suspended {
                    self.unsuspend().map_err(Error::Resume)?;
                }
            }

            SourceState::Unlinked | SourceState::Init | SourceState::Invalid => {}
        }

        self.state = new_state;
        Ok(())
    }

    fn timing_info(&self) -> TimingInfo {
        TimingInfo {
            read_count: self.read_count,
            tsched_watermark: self.lat.tsched_watermark,
            hwbuf_unused: self.lat.hwbuf_unused,
            min_sleep: self.lat.min_sleep,
            min_wakeup: self.lat.min_wakeup,
            min_latency: self.lat.min_latency,
            max_latency: self.lat.max_latency,
            pcm_open: self.pcm.is_some(),
            smoother_paused: self.smoother.is_paused(),
        }
    }

    fn handle_message(&mut self, msg: ControlMessage) -> Flow {
        match msg {
            ControlMessage::Shutdown => return Flow::Finish,

            ControlMessage::SetState { state, reply } => {
                let result = self.handle_set_state(state);
                let _ = reply.send(result);
            }

            ControlMessage::GetLatency { reply } => {
                let latency = if self.pcm.is_some() {
                    self.source_latency()
                } else {
                    0
                };
                let _ = reply.send(latency);
            }

            ControlMessage::GetLatencyRange { reply } => {
                let _ = reply.send((self.lat.min_latency, self.lat.max_latency));
            }

            ControlMessage::GetTimingInfo { reply } => {
                let _ = reply.send(self.timing_info());
            }

            ControlMessage::SetRequestedLatency(latency) => {
                self.lat.requested_latency = latency;

                if self.pcm.is_some() {
                    let _ = self.update_sw_params();
                }
            }
        }

        Flow::Continue
    }

    fn recover_from_poll(&mut self, revents: PollFlags) -> Result<(), Fatal> {
        tracing::warn!(
            "Poll error on device {}: {:?}",
            self.device_name,
            revents
        );

        let err = match self.pcm().state() {
            PcmState::Xrun => Errno::EPIPE,
            PcmState::Suspended => Errno::ESTRPIPE,
            state => {
                tracing::error!(
                    "Could not recover from POLLERR|POLLHUP|POLLNVAL, pcm state is {:?}",
                    state
                );
                return Err(Fatal);
            }
        };

        if let Err(e) = self.pcm().recover(err) {
            tracing::error!("Recovery after poll error failed: {}", e);
            return Err(Fatal);
        }

        Ok(())
    }

    fn run(mut self) {
        tracing::debug!("Thread starting up");

        if let Some(priority) = self.realtime_priority {
            make_realtime(priority);
        }

        let _mq_item = self.rtpoll.item_new(vec![self.mq.pollfd()]);
        let mut revents = PollFlags::empty();

        loop {
            while let Some(msg) = self.mq.try_recv() {
                match self.handle_message(msg) {
                    Flow::Continue => {}
                    Flow::Finish => {
                        // Drop whatever is still buffered before the
                        // handle is closed.
                        if let Some(pcm) = self.pcm.as_deref_mut() {
                            pcm.stop();
                        }

                        tracing::debug!("Thread shutting down");
                        return;
                    }
                }
            }

            if self.state.is_opened() {
                let polled = revents.contains(PollFlags::POLLIN);

                let read = if self.use_mmap {
                    self.mmap_read(polled)
                } else {
                    self.unix_read(polled)
                };

                let (sleep_usec, work_done) = match read {
                    Ok(r) => r,
                    Err(Fatal) => return self.fail(),
                };

                if work_done {
                    self.update_smoother();
                }

                if self.use_tsched {
                    // Convert from the sound card time domain to the
                    // system time domain, and distrust the conversion:
                    // wake on whatever comes first.
                    let cusec = self.smoother.translate(monotonic_usec(), sleep_usec);
                    self.rtpoll.set_timer_relative(sleep_usec.min(cusec));
                }
            } else if self.use_tsched {
                self.rtpoll.set_timer_disabled();
            }

            if let Err(e) = self.rtpoll.run() {
                tracing::error!("poll failed: {}", e);
                return self.fail();
            }

            if self.state.is_opened() && self.alsa_item.is_some() {
                revents = {
                    let item = match self.alsa_item.as_ref() {
                        Some(item) => item,
                        None => unreachable!(),
                    };
                    let mut fds = self.rtpoll.item_fds(item).to_vec();

                    match self.pcm().revents(&mut fds) {
                        Ok(r) => r,
                        Err(e) => {
                            tracing::error!("snd_pcm_poll_descriptors_revents() failed: {}", e);
                            return self.fail();
                        }
                    }
                };

                if revents.intersects(!PollFlags::POLLIN) {
                    if self.recover_from_poll(revents).is_err() {
                        return self.fail();
                    }

                    if let Err(e) = self.pcm().start() {
                        tracing::error!("failed to restart after poll error: {}", e);
                        return self.fail();
                    }
                } else if !revents.is_empty() && self.use_tsched && self.wakeup_limit.check() {
                    tracing::debug!("Wakeup from ALSA!");
                }
            } else {
                revents = PollFlags::empty();
            }
        }
    }

    /// The fatal exit: ask the main thread to unload us, then keep
    /// draining the queue until the shutdown message arrives so nothing
    /// the main thread sent in the meantime is lost.
    fn fail(self) {
        self.mq.post(EngineMessage::UnloadModule);
        self.mq.wait_for_shutdown();
        tracing::debug!("Thread shutting down");
    }
}

fn make_realtime(priority: i32) {
    unsafe {
        let min = libc::sched_get_priority_min(libc::SCHED_RR);
        let max = libc::sched_get_priority_max(libc::SCHED_RR);

        if min < 0 || max < min {
            tracing::warn!("SCHED_RR not available on this system");
            return;
        }

        let param = libc::sched_param {
            sched_priority: priority.min(max).max(min),
        };

        let r = libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_RR, &param);

        if r == 0 {
            tracing::info!("Successfully enabled SCHED_RR scheduling for the I/O thread");
        } else {
            tracing::warn!(
                "pthread_setschedparam() failed: {}",
                Errno::from_i32(r)
            );
        }
    }
}

/// The main-thread handle of one capture source.
///
/// Construction opens the device, negotiates parameters and spawns the
/// I/O thread; afterwards all interaction with the device goes through
/// messages. Dropping the handle shuts the thread down and closes the
/// device.
pub struct CaptureSource {
    source: Source,
    mixer: Option<MixerBridge>,
    mq: MainMq,
    thread: Option<thread::JoinHandle<()>>,
    device_name: String,
    reserve_mgr: Option<Box<dyn ReserveManager>>,
    reservation: Option<Box<dyn Reservation>>,
    reservation_name: Option<String>,
}

impl CaptureSource {
    /// Open `config`'s device through `opener` and start capturing into
    /// `output`.
    ///
    /// `mixer_elem` attaches hardware volume/mute when the device has a
    /// usable capture element; `reserve` arbitrates device ownership with
    /// peers (pass `None` in system mode).
    pub fn new(
        config: Config,
        mut opener: Box<dyn PcmOpener>,
        mixer_elem: Option<Box<dyn MixerElement>>,
        reserve: Option<Box<dyn ReserveManager>>,
        output: Box<dyn SourceOutput>,
    ) -> Result<Self> {
        let requested_ss = config.sample_spec;

        if !requested_ss.is_valid() || requested_ss.channels != config.channel_map.channels() {
            return Err(Error::UnsupportedSampleSpec);
        }

        let frame_size = requested_ss.frame_size() as u64;
        let mut use_mmap = config.mmap;
        let mut use_tsched = config.tsched;

        if use_tsched && !hrtimer_available() {
            tracing::info!(
                "Disabling timer-based scheduling because high-resolution timers are not available from the kernel."
            );
            use_tsched = false;
        }

        let device = config.effective_device();

        // We are the resuming owner; grab the device before opening it.
        let reservation_name = reserve.as_ref().and_then(|_| reserve_name(&device));
        let reservation = match (&reserve, &reservation_name) {
            (Some(mgr), Some(rname)) => Some(
                mgr.acquire(rname)
                    .map_err(|_| Error::ReservationBusy)?,
            ),
            _ => None,
        };

        let period_frames = (config.fragment_size as u64 / frame_size).max(1);

        // Under timer scheduling the ring is sized from the tsched buffer
        // target instead of the fragment settings.
        let nfragments = if use_tsched {
            ((config.tsched_buffer_size as u64 / frame_size) / period_frames)
                .max(2)
                .min(u32::MAX as u64) as u32
        } else {
            config.fragments.max(2)
        };

        let requested_hw = HwParams {
            sample_spec: requested_ss,
            nfragments,
            period_frames,
            use_mmap,
            use_tsched,
        };

        let (mut pcm, granted) = opener.open(&device, &requested_hw, false)?;
        let device_name = pcm.device_name().to_owned();

        tracing::info!("Successfully opened device {}.", device_name);

        if use_mmap && !granted.use_mmap {
            tracing::info!("Device doesn't support mmap(), falling back to UNIX read/write mode.");
            use_mmap = false;
        }

        if use_tsched && (!granted.use_mmap || !granted.use_tsched) {
            tracing::info!(
                "Cannot enable timer-based scheduling, falling back to sound IRQ scheduling."
            );
            use_tsched = false;
        }

        if use_mmap {
            tracing::info!("Successfully enabled mmap() mode.");
        }

        if use_tsched {
            tracing::info!("Successfully enabled timer-based scheduling mode.");
        }

        // The device may have tweaked the sample spec, so recompute
        // everything that depends on it.
        let ss = granted.sample_spec;
        let fragment_size = granted.fragment_size();
        let hwbuf_size = granted.hwbuf_size();

        let (name, _namereg_fail) = config.resolve_source_name(&device_name);

        let mut flags = SourceFlags::HARDWARE | SourceFlags::LATENCY;
        if use_tsched {
            flags |= SourceFlags::DYNAMIC_LATENCY;
        }

        let mut source = Source::new(name, ss, config.channel_map, flags);

        // Carry the watermark through the requested spec so a device that
        // tweaked the rate keeps the same watermark duration.
        let tsched_watermark = ss.usec_to_bytes_round_up(
            requested_ss.bytes_to_usec_round_up(config.tsched_watermark as u64),
        );

        let mut lat = LatencyControl::new(ss, hwbuf_size, tsched_watermark, use_tsched);

        tracing::info!(
            "Using {} fragments of size {} bytes, buffer time is {:.2}ms",
            granted.nfragments,
            fragment_size,
            ss.bytes_to_usec(hwbuf_size) as f64 / USEC_PER_MSEC as f64
        );

        if use_tsched {
            tracing::info!(
                "Time scheduling watermark is {:.2}ms",
                ss.bytes_to_usec(lat.tsched_watermark) as f64 / USEC_PER_MSEC as f64
            );
        }

        let avail_min = lat.update_sw_params();
        pcm.set_sw_params(avail_min)
            .map_err(|e| Error::Open(OpenError::SwParams(e)))?;

        let mixer = mixer_elem.map(|elem| MixerBridge::setup(elem, &mut source, config.ignore_db));

        let (main_mq, io_mq) = thread_mq().map_err(Error::Sys)?;

        let io = IoThread {
            mq: io_mq,
            rtpoll: RtPoll::new(),
            alsa_item: None,
            pcm: Some(pcm),
            opener,
            output,
            pool: Mempool::new(),
            smoother: Smoother::new(2 * DEFAULT_TSCHED_WATERMARK_USEC),
            lat,
            sample_spec: ss,
            nfragments: granted.nfragments,
            fragment_size,
            use_mmap,
            use_tsched,
            read_count: 0,
            state: SourceState::Init,
            device_name: device_name.clone(),
            realtime_priority: if config.realtime_scheduling {
                Some(config.realtime_priority)
            } else {
                None
            },
            overrun_limit: Ratelimit::new(10 * USEC_PER_SEC, 5),
            avail_limit: Ratelimit::new(10 * USEC_PER_SEC, 5),
            wakeup_limit: Ratelimit::new(10 * USEC_PER_SEC, 5),
        };

        let thread = thread::Builder::new()
            .name("alsa-source".into())
            .spawn(move || io.run())
            .map_err(|e| {
                Error::Sys(Errno::from_i32(e.raw_os_error().unwrap_or(libc::EAGAIN)))
            })?;

        let mut capture = Self {
            source,
            mixer,
            mq: main_mq,
            thread: Some(thread),
            device_name,
            reserve_mgr: reserve,
            reservation,
            reservation_name,
        };

        capture.sync_initial_mixer_state(config.volume, config.muted);

        Ok(capture)
    }

    fn sync_initial_mixer_state(&mut self, volume: Option<ChannelVolumes>, muted: Option<bool>) {
        let bridge = match &mut self.mixer {
            Some(bridge) => bridge,
            None => return,
        };

        if let Some(v) = volume {
            self.source.virtual_volume = v;
            if bridge.has_hw_volume() {
                if let Err(e) = bridge.set_volume(&mut self.source) {
                    tracing::error!("Unable to set volume: {}", e);
                }
            } else {
                self.source.soft_volume = v;
            }
        } else if bridge.has_hw_volume() {
            if let Err(e) = bridge.get_volume(&mut self.source) {
                tracing::error!("Unable to read volume: {}", e);
            }
        }

        if let Some(m) = muted {
            self.source.muted = m;
            if bridge.has_hw_mute() {
                if let Err(e) = bridge.set_mute(&mut self.source) {
                    tracing::error!("Unable to set switch: {}", e);
                }
            }
        } else if bridge.has_hw_mute() {
            if let Err(e) = bridge.get_mute(&mut self.source) {
                tracing::error!("Unable to get switch: {}", e);
            }
        }
    }

    /// The main-thread source object.
    pub fn source(&self) -> &Source {
        &self.source
    }

    /// The canonical device name the source was opened with.
    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// Move the source to a new state.
    ///
    /// Reservation handling happens here on the main thread; the device
    /// side of the transition is executed by the I/O thread and this call
    /// waits for its outcome. On a failed resume the source stays
    /// suspended.
    pub fn set_state(&mut self, new_state: SourceState) -> Result<()> {
        let old_state = self.source.state();

        if old_state == new_state {
            return Ok(());
        }

        if matches!(new_state, SourceState::Init | SourceState::Invalid) {
            return Err(Error::InvalidTransition);
        }

        if old_state == SourceState::Unlinked {
            return Err(Error::InvalidTransition);
        }

        let mut reacquired = false;

        if old_state.is_opened() && new_state == SourceState::Suspended {
            self.reservation = None;
        } else if old_state == SourceState::Suspended && new_state.is_opened() {
            self.acquire_reservation()?;
            reacquired = true;
        }

        let (reply, rx) = channel();
        self.mq.post(ControlMessage::SetState {
            state: new_state,
            reply,
        })?;

        match rx.recv() {
            Err(_) => {
                if reacquired {
                    self.reservation = None;
                }
                Err(Error::ThreadGone)
            }
            Ok(Err(e)) => {
                if reacquired {
                    self.reservation = None;
                }
                Err(e)
            }
            Ok(Ok(())) => {
                self.source.set_state(new_state);

                if reacquired {
                    // The original driver never reloads the hardware
                    // volume inside the resume path; resynchronize it here
                    // where the mixer lives instead.
                    if let Some(bridge) = &mut self.mixer {
                        if bridge.has_hw_volume() {
                            if let Err(e) = bridge.get_volume(&mut self.source) {
                                tracing::error!("Unable to read volume: {}", e);
                            }
                        }
                    }
                }

                Ok(())
            }
        }
    }

    fn acquire_reservation(&mut self) -> Result<()> {
        let (mgr, rname) = match (&self.reserve_mgr, &self.reservation_name) {
            (Some(mgr), Some(rname)) => (mgr, rname),
            _ => return Ok(()),
        };

        if self.reservation.is_some() {
            return Ok(());
        }

        match mgr.acquire(rname) {
            Ok(handle) => {
                self.reservation = Some(handle);
                Ok(())
            }
            Err(_) => Err(Error::ReservationBusy),
        }
    }

    /// Suspend or resume the source.
    pub fn suspend(&mut self, suspend: bool) -> Result<()> {
        if suspend {
            if self.source.state().is_opened() {
                return self.set_state(SourceState::Suspended);
            }
        } else if self.source.state() == SourceState::Suspended {
            return self.set_state(SourceState::Running);
        }

        Ok(())
    }

    /// The smoothed source latency, in µs. Zero while suspended.
    pub fn get_latency(&self) -> Result<u64> {
        let (reply, rx) = channel();
        self.mq.post(ControlMessage::GetLatency { reply })?;
        rx.recv().map_err(|_| Error::ThreadGone)
    }

    /// The current dynamic latency range, in µs.
    pub fn latency_range(&self) -> Result<(u64, u64)> {
        let (reply, rx) = channel();
        self.mq.post(ControlMessage::GetLatencyRange { reply })?;
        rx.recv().map_err(|_| Error::ThreadGone)
    }

    /// A timing snapshot from the I/O thread.
    pub fn timing_info(&self) -> Result<TimingInfo> {
        let (reply, rx) = channel();
        self.mq.post(ControlMessage::GetTimingInfo { reply })?;
        rx.recv().map_err(|_| Error::ThreadGone)
    }

    /// Tell the engine what end-to-end latency downstream wants, or `None`
    /// to let it batch as lazily as the ring allows.
    pub fn set_requested_latency(&mut self, latency: Option<u64>) -> Result<()> {
        self.mq.post(ControlMessage::SetRequestedLatency(latency))
    }

    /// Set the source volume, through the hardware when possible.
    pub fn set_volume(&mut self, volume: ChannelVolumes) -> Result<()> {
        self.source.virtual_volume = volume;

        match &mut self.mixer {
            Some(bridge) if bridge.has_hw_volume() => {
                bridge.set_volume(&mut self.source).map_err(Error::Sys)
            }
            _ => {
                self.source.soft_volume = volume;
                Ok(())
            }
        }
    }

    /// Read the current volume, refreshing from the hardware when possible.
    pub fn get_volume(&mut self) -> Result<ChannelVolumes> {
        if let Some(bridge) = &mut self.mixer {
            if bridge.has_hw_volume() {
                bridge.get_volume(&mut self.source).map_err(Error::Sys)?;
            }
        }

        Ok(self.source.virtual_volume)
    }

    /// Set the mute state, through the capture switch when possible.
    pub fn set_mute(&mut self, muted: bool) -> Result<()> {
        self.source.muted = muted;

        match &mut self.mixer {
            Some(bridge) if bridge.has_hw_mute() => {
                bridge.set_mute(&mut self.source).map_err(Error::Sys)
            }
            _ => Ok(()),
        }
    }

    /// Read the mute state, refreshing from the hardware when possible.
    pub fn get_mute(&mut self) -> Result<bool> {
        if let Some(bridge) = &mut self.mixer {
            if bridge.has_hw_mute() {
                bridge.get_mute(&mut self.source).map_err(Error::Sys)?;
            }
        }

        Ok(self.source.muted)
    }

    /// Feed a mixer event into the bridge. Wired to the mixer descriptor
    /// watcher by the embedding main loop.
    pub fn mixer_event(&mut self, mask: MixerEventMask) {
        if let Some(bridge) = &mut self.mixer {
            bridge.on_event(mask, &mut self.source);
        }
    }

    /// Process pending engine notifications.
    ///
    /// Returns `true` when the I/O thread hit a fatal error and asked to
    /// be unloaded; the owner should drop the source.
    pub fn process_messages(&mut self) -> bool {
        let mut unload = false;

        while let Some(msg) = self.mq.try_recv() {
            match msg {
                EngineMessage::UnloadModule => unload = true,
            }
        }

        unload
    }

    /// Answer pending release requests from reservation peers.
    ///
    /// A request is answered OK after a successful suspend, and CANCEL
    /// when suspending failed; wired to the embedding main loop.
    pub fn process_reserve_requests(&mut self) {
        let mut handle = match self.reservation.take() {
            Some(handle) => handle,
            None => return,
        };

        while let Some(request) = handle.try_recv_release() {
            match self.set_state(SourceState::Suspended) {
                Ok(()) => {
                    request.respond(HookResult::Ok);
                    // Suspending released the reservation; the handle is
                    // dropped below.
                    return;
                }
                Err(e) => {
                    tracing::warn!("refusing to yield device: {}", e);
                    request.respond(HookResult::Cancel);
                }
            }
        }

        self.reservation = Some(handle);
    }
}

impl Drop for CaptureSource {
    fn drop(&mut self) {
        // Unlink first so the I/O thread stops reading, then drain and
        // join. The PCM handle is closed when the thread drops it.
        let _ = self.set_state(SourceState::Unlinked);

        if let Some(thread) = self.thread.take() {
            let _ = self.mq.post(ControlMessage::Shutdown);

            if thread.join().is_err() {
                tracing::error!("I/O thread panicked during shutdown");
            }
        }

        self.reservation = None;
    }
}
