//! End-to-end scenarios for the capture engine against the mock backend.

mod common;

use alsa_capture::capture::CaptureSource;
use alsa_capture::config::Config;
use alsa_capture::reserve::{HookResult, LocalReserveManager, ReserveManager};
use alsa_capture::sample::ChannelMap;
use alsa_capture::source::{SourceFlags, SourceState};
use alsa_capture::Error;
use common::{spec, Collector, MockHarness, MockMixer};
use std::time::{Duration, Instant};

/// 4 fragments of 8 KiB, 44100/s16le/stereo, tsched + mmap.
fn config() -> Config {
    let mut config = Config::new(spec(), ChannelMap::stereo())
        .device("hw:0")
        .fragments(4)
        .fragment_size(8192);

    // Size the tsched ring like the fragment settings so the hardware
    // buffer is 4 * 8192 bytes either way.
    config.tsched_buffer_size = 4 * 8192;
    config
}

fn wait_until(timeout: Duration, mut f: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;

    while Instant::now() < deadline {
        if f() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }

    f()
}

#[test]
fn cold_start_posts_the_whole_tone() {
    let harness = MockHarness::new();
    harness.with(|s| {
        // 100 ms of tone, reported with a steady 20 ms capture delay.
        s.tone_frames = 4410;
        s.delay_frames = 882;
    });

    let collector = Collector::new();
    let mut source = CaptureSource::new(
        config(),
        harness.opener(),
        None,
        None,
        collector.output(),
    )
    .unwrap();

    assert_eq!(source.source().state(), SourceState::Init);
    assert!(source
        .source()
        .flags()
        .contains(SourceFlags::HARDWARE | SourceFlags::LATENCY));

    source.set_state(SourceState::Running).unwrap();

    // 4410 frames * 4 bytes.
    assert!(collector.wait_for_bytes(17640, Duration::from_secs(3)));

    // The smoothed latency tracks the reported capture delay.
    let latency = source.get_latency().unwrap();
    assert!(
        (10_000..=40_000).contains(&latency),
        "latency was {}µs",
        latency
    );

    // Nothing beyond the tone is ever posted, and the counter matches.
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(collector.bytes(), 17640);
    assert!(collector.chunks() >= 1);

    let timing = source.timing_info().unwrap();
    assert_eq!(timing.read_count, 17640);
    assert!(timing.pcm_open);
    assert!(!timing.smoother_paused);

    // The mmap path posts zero-copy wrappers.
    assert_eq!(collector.fixed_chunks(), collector.chunks());
}

#[test]
fn overrun_adaptation_grows_the_watermark() {
    let harness = MockHarness::new();
    let collector = Collector::new();

    let mut source = CaptureSource::new(
        config(),
        harness.opener(),
        None,
        None,
        collector.output(),
    )
    .unwrap();

    let initial = source.timing_info().unwrap().tsched_watermark;

    // The first post stalls half a second while the device keeps
    // producing, overrunning the ring.
    collector.stall_next(Duration::from_millis(500));
    source.set_state(SourceState::Running).unwrap();

    assert!(wait_until(Duration::from_secs(3), || {
        source
            .timing_info()
            .map(|t| t.tsched_watermark >= initial * 2)
            .unwrap_or(false)
    }));

    // Still alive and still capturing.
    assert!(source.get_latency().is_ok());
    let before = collector.bytes();
    assert!(wait_until(Duration::from_secs(2), || collector.bytes() > before));

    let timing = source.timing_info().unwrap();
    assert!(timing.min_latency >= 500);
    assert!(timing.min_latency <= timing.max_latency);
}

#[test]
fn suspend_resume_preserves_geometry_and_read_count() {
    let harness = MockHarness::new();
    harness.with(|s| s.delay_frames = 441);
    let collector = Collector::new();

    let mut source = CaptureSource::new(
        config(),
        harness.opener(),
        None,
        None,
        collector.output(),
    )
    .unwrap();

    source.set_state(SourceState::Running).unwrap();
    assert!(collector.wait_for_bytes(4, Duration::from_secs(3)));

    let before = source.timing_info().unwrap().read_count;

    source.set_state(SourceState::Suspended).unwrap();
    let timing = source.timing_info().unwrap();
    assert!(!timing.pcm_open);
    assert!(timing.smoother_paused);
    assert_eq!(source.get_latency().unwrap(), 0);

    std::thread::sleep(Duration::from_millis(200));

    source.set_state(SourceState::Running).unwrap();

    let (first, second) = harness.with(|s| {
        assert_eq!(s.opens.len(), 2);
        (s.opens[0], s.opens[1])
    });

    // The reopen is exact and re-negotiates the original geometry.
    assert!(!first.1);
    assert!(second.1);
    assert_eq!(second.0.nfragments, first.0.nfragments);
    assert_eq!(second.0.period_frames, first.0.period_frames);
    assert_eq!(second.0.sample_spec, first.0.sample_spec);
    assert_eq!(second.0.use_mmap, first.0.use_mmap);
    assert_eq!(second.0.use_tsched, first.0.use_tsched);

    // read_count resumes from its previous value.
    let timing = source.timing_info().unwrap();
    assert!(timing.read_count >= before);
    assert!(timing.pcm_open);
    assert!(!timing.smoother_paused);

    let target = collector.bytes() + 4;
    assert!(wait_until(Duration::from_secs(3), || collector.bytes() >= target));
}

#[test]
fn resume_fails_when_geometry_changed() {
    let harness = MockHarness::new();
    let collector = Collector::new();

    let mut source = CaptureSource::new(
        config(),
        harness.opener(),
        None,
        None,
        collector.output(),
    )
    .unwrap();

    source.set_state(SourceState::Running).unwrap();
    source.set_state(SourceState::Suspended).unwrap();

    // The device comes back with a different fragment layout.
    harness.with(|s| {
        let mut granted = s.opens[0].0;
        granted.nfragments = 2;
        s.grant = Some(granted);
    });

    match source.set_state(SourceState::Running) {
        Err(Error::Resume(_)) => {}
        other => panic!("expected resume failure, got {:?}", other.map(|_| ())),
    }

    // The source stays suspended.
    assert_eq!(source.source().state(), SourceState::Suspended);
    assert!(!source.timing_info().unwrap().pcm_open);
}

#[test]
fn two_level_mixer_degrades_to_software_volume() {
    let harness = MockHarness::new();
    let collector = Collector::new();

    let source = CaptureSource::new(
        config(),
        harness.opener(),
        Some(Box::new(MockMixer::with_levels(0, 1))),
        None,
        collector.output(),
    )
    .unwrap();

    let flags = source.source().flags();
    assert!(!flags.contains(SourceFlags::HW_VOLUME_CTRL));
    assert!(!flags.contains(SourceFlags::DECIBEL_VOLUME));
    // The capture switch is still usable.
    assert!(flags.contains(SourceFlags::HW_MUTE_CTRL));
}

#[test]
fn spurious_pollin_is_ignored() {
    let harness = MockHarness::new();
    harness.with(|s| s.tone_frames = 0);
    let collector = Collector::new();

    let mut source = CaptureSource::new(
        config(),
        harness.opener(),
        None,
        None,
        collector.output(),
    )
    .unwrap();

    source.set_state(SourceState::Running).unwrap();
    std::thread::sleep(Duration::from_millis(20));

    harness.inject_spurious_wakeup();
    std::thread::sleep(Duration::from_millis(100));

    // No data was posted and the loop is still responsive.
    assert_eq!(collector.bytes(), 0);
    assert_eq!(collector.chunks(), 0);
    assert!(source.get_latency().is_ok());
}

#[test]
fn fatal_recover_failure_requests_unload_without_deadlock() {
    let harness = MockHarness::new();
    harness.with(|s| {
        s.avail_error = Some(alsa_capture::unix::Errno::EPIPE);
        s.recover_error = Some(alsa_capture::unix::Errno::EIO);
    });
    let collector = Collector::new();

    let mut source = CaptureSource::new(
        config(),
        harness.opener(),
        None,
        None,
        collector.output(),
    )
    .unwrap();

    source.set_state(SourceState::Running).unwrap();

    // The I/O thread posts UNLOAD_MODULE and parks waiting for shutdown.
    assert!(wait_until(Duration::from_secs(3), || source.process_messages()));
    assert!(harness.with(|s| s.recover_calls >= 1));

    // Teardown drains the parked thread without deadlocking.
    drop(source);
}

#[test]
fn reservation_yields_to_a_peer_and_blocks_resume() {
    let mgr = LocalReserveManager::new();
    let harness = MockHarness::new();
    let collector = Collector::new();

    let mut source = CaptureSource::new(
        config(),
        harness.opener(),
        None,
        Some(Box::new(mgr.clone())),
        collector.output(),
    )
    .unwrap();

    source.set_state(SourceState::Running).unwrap();

    // While we are running, peers are locked out.
    assert!(mgr.acquire("Audio0").is_err());

    // A peer asks for the device; we suspend and yield.
    let rx = mgr.request_release("Audio0", false).unwrap();
    source.process_reserve_requests();
    assert_eq!(rx.recv().unwrap(), HookResult::Ok);
    assert_eq!(source.source().state(), SourceState::Suspended);

    let peer = mgr.acquire("Audio0").unwrap();

    // Resume fails while the peer holds the device.
    match source.set_state(SourceState::Running) {
        Err(Error::ReservationBusy) => {}
        other => panic!("expected reservation failure, got {:?}", other.map(|_| ())),
    }
    assert_eq!(source.source().state(), SourceState::Suspended);

    // Once the peer lets go, resume works and the lockout is ours again.
    drop(peer);
    source.set_state(SourceState::Running).unwrap();
    assert!(mgr.acquire("Audio0").is_err());
}

#[test]
fn requested_latency_reconfigures_the_ring() {
    let harness = MockHarness::new();
    // A silent device keeps the watermark feedback out of the picture.
    harness.with(|s| s.tone_frames = 0);
    let collector = Collector::new();

    let mut source = CaptureSource::new(
        config(),
        harness.opener(),
        None,
        None,
        collector.output(),
    )
    .unwrap();

    source.set_state(SourceState::Running).unwrap();
    assert_eq!(source.timing_info().unwrap().hwbuf_unused, 0);

    // 20 ms of 44100 Hz stereo s16 is 3528 bytes; the rest of the ring is
    // parked.
    source.set_requested_latency(Some(20_000)).unwrap();
    assert!(wait_until(Duration::from_secs(1), || {
        source
            .timing_info()
            .map(|t| t.hwbuf_unused == 4 * 8192 - 3528)
            .unwrap_or(false)
    }));

    // Software parameters were reinstalled for the new wake budget.
    assert!(harness.with(|s| s.sw_params.len() >= 2));

    source.set_requested_latency(None).unwrap();
    assert!(wait_until(Duration::from_secs(1), || {
        source
            .timing_info()
            .map(|t| t.hwbuf_unused == 0)
            .unwrap_or(false)
    }));
}

#[test]
fn copy_mode_capture_without_tsched() {
    let harness = MockHarness::new();
    harness.with(|s| s.tone_frames = 4410);
    let collector = Collector::new();

    let mut source = CaptureSource::new(
        config().mmap(false).tsched(false),
        harness.opener(),
        None,
        None,
        collector.output(),
    )
    .unwrap();

    assert!(!source
        .source()
        .flags()
        .contains(SourceFlags::DYNAMIC_LATENCY));

    source.set_state(SourceState::Running).unwrap();

    // Interrupt-driven mode wakes on the device descriptor; stand in for
    // the period interrupts.
    let posted = wait_until(Duration::from_secs(3), || {
        harness.inject_spurious_wakeup();
        collector.bytes() >= 17640
    });

    assert!(posted);
    // The copy path allocates fresh blocks, never fixed wrappers.
    assert_eq!(collector.fixed_chunks(), 0);
    assert_eq!(collector.bytes(), 17640);
}
