//! A mock PCM backend driving the capture engine without hardware.
//!
//! The mock produces frames in real time from a simulated microphone:
//! `avail()` grows with the wall clock once the stream is started, reads
//! consume it, and the harness can inject errors, spurious wakeups and
//! renegotiation results.

#![allow(dead_code)]

use alsa_capture::memblock::MemChunk;
use alsa_capture::mixer::{MixerChannel, MixerElement};
use alsa_capture::pcm::{CapturePcm, HwParams, MmapArea, OpenError, PcmOpener, PcmState};
use alsa_capture::sample::{ChannelPosition, SampleFormat, SampleSpec};
use alsa_capture::source::SourceOutput;
use alsa_capture::unix::poll::{PollFd, PollFlags};
use alsa_capture::unix::Errno;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

pub fn spec() -> SampleSpec {
    SampleSpec::new(SampleFormat::S16Le, 44100, 2).unwrap()
}

/// Shared state between the harness (test thread) and the mock PCM
/// (engine thread).
pub struct MockShared {
    /// Total frames the simulated microphone will ever produce.
    pub tone_frames: u64,
    /// Constant reported capture delay, in frames.
    pub delay_frames: u64,
    /// When set, `avail()` fails with this errno.
    pub avail_error: Option<Errno>,
    /// When set, `recover()` fails with this errno.
    pub recover_error: Option<Errno>,
    /// Override for what the opener grants; defaults to the request.
    pub grant: Option<HwParams>,
    /// When set, opening fails outright.
    pub open_error: bool,

    started_at: Option<Instant>,
    consumed: u64,
    frame_size: u64,
    rate: u32,
    hwbuf_frames: u64,
    ring: Vec<u8>,
    pipe: Option<(RawFd, RawFd)>,

    /// Every `(request, exact)` pair the opener saw.
    pub opens: Vec<(HwParams, bool)>,
    pub start_calls: u32,
    pub recover_calls: u32,
    pub sw_params: Vec<u64>,
}

impl MockShared {
    fn produced(&self) -> u64 {
        let started = match self.started_at {
            Some(t) => t,
            None => return 0,
        };

        let frames = started.elapsed().as_micros() as u64 * self.rate as u64 / 1_000_000;
        frames.min(self.tone_frames)
    }

    fn avail_frames(&self) -> u64 {
        // The kernel side of an overrun keeps counting a while past the
        // ring size before erroring out.
        (self.produced() - self.consumed).min(self.hwbuf_frames * 2)
    }
}

impl Drop for MockShared {
    fn drop(&mut self) {
        if let Some((r, w)) = self.pipe.take() {
            unsafe {
                libc::close(r);
                libc::close(w);
            }
        }
    }
}

#[derive(Clone)]
pub struct MockHarness {
    pub shared: Arc<Mutex<MockShared>>,
}

impl MockHarness {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Mutex::new(MockShared {
                tone_frames: u64::MAX,
                delay_frames: 0,
                avail_error: None,
                recover_error: None,
                grant: None,
                open_error: false,
                started_at: None,
                consumed: 0,
                frame_size: 4,
                rate: 44100,
                hwbuf_frames: 8192,
                ring: Vec::new(),
                pipe: None,
                opens: Vec::new(),
                start_calls: 0,
                recover_calls: 0,
                sw_params: Vec::new(),
            })),
        }
    }

    pub fn opener(&self) -> Box<dyn PcmOpener> {
        Box::new(MockOpener {
            shared: self.shared.clone(),
        })
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut MockShared) -> R) -> R {
        f(&mut self.shared.lock().unwrap())
    }

    /// Wake the engine with POLLIN even though nothing is available.
    pub fn inject_spurious_wakeup(&self) {
        let shared = self.shared.lock().unwrap();
        if let Some((_, w)) = shared.pipe {
            unsafe {
                libc::write(w, b"x".as_ptr() as *const libc::c_void, 1);
            }
        }
    }
}

struct MockOpener {
    shared: Arc<Mutex<MockShared>>,
}

impl PcmOpener for MockOpener {
    fn open(
        &mut self,
        device: &str,
        requested: &HwParams,
        exact: bool,
    ) -> Result<(Box<dyn CapturePcm>, HwParams), OpenError> {
        let mut shared = self.shared.lock().unwrap();
        shared.opens.push((*requested, exact));

        if shared.open_error {
            return Err(OpenError::Device {
                device: device.to_owned(),
                source: Errno::from_i32(libc::EBUSY),
            });
        }

        let granted = shared.grant.unwrap_or(*requested);

        shared.frame_size = granted.sample_spec.frame_size() as u64;
        shared.rate = granted.sample_spec.rate;
        shared.hwbuf_frames = granted.period_frames * granted.nfragments as u64;
        shared.ring = vec![0u8; (shared.hwbuf_frames * shared.frame_size) as usize];
        shared.consumed = 0;
        shared.started_at = None;

        if let Some((r, w)) = shared.pipe.take() {
            unsafe {
                libc::close(r);
                libc::close(w);
            }
        }

        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        shared.pipe = Some((fds[0], fds[1]));

        drop(shared);

        Ok((
            Box::new(MockPcm {
                shared: self.shared.clone(),
                device_name: device.to_owned(),
            }),
            granted,
        ))
    }
}

struct MockPcm {
    shared: Arc<Mutex<MockShared>>,
    device_name: String,
}

impl CapturePcm for MockPcm {
    fn device_name(&self) -> &str {
        &self.device_name
    }

    fn state(&mut self) -> PcmState {
        PcmState::Running
    }

    fn avail(&mut self) -> Result<u64, Errno> {
        let shared = self.shared.lock().unwrap();

        if let Some(e) = shared.avail_error {
            return Err(e);
        }

        Ok(shared.avail_frames())
    }

    fn delay(&mut self) -> Result<i64, Errno> {
        Ok(self.shared.lock().unwrap().delay_frames as i64)
    }

    fn htimestamp(&mut self) -> Result<u64, Errno> {
        // No driver timestamp; the engine falls back to the system clock.
        Ok(0)
    }

    fn start(&mut self) -> Result<(), Errno> {
        let mut shared = self.shared.lock().unwrap();
        shared.start_calls += 1;

        if shared.started_at.is_none() {
            shared.started_at = Some(Instant::now());
        }

        Ok(())
    }

    fn stop(&mut self) {}

    fn set_sw_params(&mut self, avail_min_frames: u64) -> Result<(), Errno> {
        self.shared.lock().unwrap().sw_params.push(avail_min_frames);
        Ok(())
    }

    fn mmap_begin(&mut self, frames: u64) -> Result<MmapArea, Errno> {
        let mut shared = self.shared.lock().unwrap();

        let offset = shared.consumed % shared.hwbuf_frames;
        let contiguous = shared.hwbuf_frames - offset;
        let frames = frames
            .min(shared.avail_frames())
            .min(contiguous)
            .max(1);

        let byte_offset = (offset * shared.frame_size) as usize;
        let ptr = shared.ring[byte_offset..].as_mut_ptr();

        Ok(MmapArea {
            ptr,
            offset,
            frames,
        })
    }

    fn mmap_commit(&mut self, _offset: u64, frames: u64) -> Result<u64, Errno> {
        let mut shared = self.shared.lock().unwrap();
        shared.consumed += frames;
        Ok(frames)
    }

    fn readi(&mut self, buf: &mut [u8], frames: u64) -> Result<u64, Errno> {
        let mut shared = self.shared.lock().unwrap();

        let frames = frames
            .min(shared.avail_frames())
            .min(buf.len() as u64 / shared.frame_size)
            .max(1);

        let len = (frames * shared.frame_size) as usize;
        for b in &mut buf[..len] {
            *b = 0;
        }

        shared.consumed += frames;
        Ok(frames)
    }

    fn recover(&mut self, _err: Errno) -> Result<(), Errno> {
        let mut shared = self.shared.lock().unwrap();
        shared.recover_calls += 1;

        if let Some(e) = shared.recover_error {
            return Err(e);
        }

        // Drop the backlog, like a device restart would.
        shared.consumed = shared.produced();
        Ok(())
    }

    fn pollfds(&mut self) -> Result<Vec<PollFd>, Errno> {
        let shared = self.shared.lock().unwrap();
        let (r, _) = shared.pipe.expect("pipe created at open");
        Ok(vec![PollFd::new(r, PollFlags::POLLIN)])
    }

    fn revents(&mut self, fds: &mut [PollFd]) -> Result<PollFlags, Errno> {
        let revents = fds
            .first()
            .and_then(|fd| fd.revents())
            .unwrap_or(PollFlags::empty());

        if revents.contains(PollFlags::POLLIN) {
            // Drain the wake byte so it only fires once.
            let shared = self.shared.lock().unwrap();
            if let Some((r, _)) = shared.pipe {
                let mut b = [0u8; 8];
                unsafe {
                    libc::read(r, b.as_mut_ptr() as *mut libc::c_void, b.len());
                }
            }
        }

        Ok(revents & PollFlags::POLLIN)
    }
}

/// Collects posted chunks, optionally blocking the engine to simulate a
/// stalled consumer.
#[derive(Clone, Default)]
pub struct Collector {
    inner: Arc<CollectorInner>,
}

#[derive(Default)]
struct CollectorInner {
    state: Mutex<CollectorState>,
    cond: Condvar,
}

#[derive(Default)]
struct CollectorState {
    bytes: u64,
    chunks: u64,
    fixed_chunks: u64,
    stall: Option<Duration>,
}

impl Collector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn output(&self) -> Box<dyn SourceOutput> {
        Box::new(CollectorOutput {
            inner: self.inner.clone(),
        })
    }

    /// Make the next post block for `d`, simulating a stalled consumer.
    pub fn stall_next(&self, d: Duration) {
        self.inner.state.lock().unwrap().stall = Some(d);
    }

    pub fn bytes(&self) -> u64 {
        self.inner.state.lock().unwrap().bytes
    }

    pub fn chunks(&self) -> u64 {
        self.inner.state.lock().unwrap().chunks
    }

    pub fn fixed_chunks(&self) -> u64 {
        self.inner.state.lock().unwrap().fixed_chunks
    }

    /// Wait until at least `bytes` have been posted.
    pub fn wait_for_bytes(&self, bytes: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock().unwrap();

        while state.bytes < bytes {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }

            let (s, _) = self
                .inner
                .cond
                .wait_timeout(state, deadline - now)
                .unwrap();
            state = s;
        }

        true
    }
}

struct CollectorOutput {
    inner: Arc<CollectorInner>,
}

impl SourceOutput for CollectorOutput {
    fn post(&mut self, chunk: &MemChunk) {
        let stall = {
            let mut state = self.inner.state.lock().unwrap();
            state.bytes += chunk.length as u64;
            state.chunks += 1;
            if chunk.memblock.is_fixed() {
                state.fixed_chunks += 1;
            }
            state.stall.take()
        };

        self.inner.cond.notify_all();

        if let Some(d) = stall {
            std::thread::sleep(d);
        }
    }
}

/// A mixer element with a configurable range, for the degradation
/// scenarios.
pub struct MockMixer {
    pub range: (i64, i64),
    pub db_range: Option<(i64, i64)>,
    pub volume: i64,
    pub switch: bool,
}

impl MockMixer {
    pub fn with_levels(min: i64, max: i64) -> Self {
        Self {
            range: (min, max),
            db_range: None,
            volume: min,
            switch: true,
        }
    }
}

impl MixerElement for MockMixer {
    fn has_capture_volume(&self) -> bool {
        true
    }

    fn capture_volume_range(&mut self) -> Result<(i64, i64), Errno> {
        Ok(self.range)
    }

    fn capture_db_range(&mut self) -> Result<(i64, i64), Errno> {
        self.db_range.ok_or(Errno::from_i32(libc::ENOTSUP))
    }

    fn capture_volume(&mut self, _ch: MixerChannel) -> Result<i64, Errno> {
        Ok(self.volume)
    }

    fn set_capture_volume(&mut self, _ch: MixerChannel, value: i64) -> Result<(), Errno> {
        self.volume = value;
        Ok(())
    }

    fn set_capture_volume_all(&mut self, value: i64) -> Result<(), Errno> {
        self.volume = value;
        Ok(())
    }

    fn capture_db(&mut self, _ch: MixerChannel) -> Result<i64, Errno> {
        Ok(self.volume)
    }

    fn set_capture_db(&mut self, _ch: MixerChannel, value: i64, _r: bool) -> Result<(), Errno> {
        self.volume = value;
        Ok(())
    }

    fn set_capture_db_all(&mut self, value: i64, _r: bool) -> Result<(), Errno> {
        self.volume = value;
        Ok(())
    }

    fn has_capture_switch(&self) -> bool {
        true
    }

    fn capture_switch(&mut self) -> Result<bool, Errno> {
        Ok(self.switch)
    }

    fn set_capture_switch_all(&mut self, on: bool) -> Result<(), Errno> {
        self.switch = on;
        Ok(())
    }

    fn channel_for_position(&self, _pos: ChannelPosition) -> Option<MixerChannel> {
        Some(MixerChannel::MONO)
    }
}
