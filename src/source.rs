//! The minimal source object surface the capture engine drives.
//!
//! The full routing registry lives in the server core; the driver only
//! needs the state machine, the latency bookkeeping and the volume fields
//! the mixer bridge operates on, plus a downstream consumer to post chunks
//! to.

use crate::memblock::MemChunk;
use crate::sample::{ChannelMap, SampleSpec};
use crate::volume::{ChannelVolumes, Volume};
use std::fmt;

bitflags::bitflags! {
    /// Capabilities advertised by a source.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SourceFlags: u32 {
        /// Backed by real hardware.
        const HARDWARE = 1 << 0;
        /// Latency can be queried.
        const LATENCY = 1 << 1;
        /// Volume is applied in hardware.
        const HW_VOLUME_CTRL = 1 << 2;
        /// The hardware volume is calibrated in dB.
        const DECIBEL_VOLUME = 1 << 3;
        /// Mute is applied in hardware.
        const HW_MUTE_CTRL = 1 << 4;
        /// Latency can be adjusted while running.
        const DYNAMIC_LATENCY = 1 << 5;
    }
}

/// Lifecycle states of a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceState {
    /// Created but not yet started.
    Init,
    /// Open, no consumer attached.
    Idle,
    /// Open and delivering data.
    Running,
    /// Device closed, state preserved for resume.
    Suspended,
    /// Removed from the registry; terminal.
    Unlinked,
    /// Error placeholder; never a valid target.
    Invalid,
}

impl SourceState {
    /// Whether the device is open in this state.
    pub fn is_opened(self) -> bool {
        matches!(self, SourceState::Idle | SourceState::Running)
    }
}

impl fmt::Display for SourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let id = match self {
            SourceState::Init => "INIT",
            SourceState::Idle => "IDLE",
            SourceState::Running => "RUNNING",
            SourceState::Suspended => "SUSPENDED",
            SourceState::Unlinked => "UNLINKED",
            SourceState::Invalid => "INVALID",
        };

        f.write_str(id)
    }
}

/// Downstream consumer of captured chunks.
///
/// `post` is called from the I/O thread, in capture order. For mmap
/// captures the chunk wraps the device's DMA region; a consumer that wants
/// to keep the data past the call has to copy it or clone the memblock and
/// honor the [fixed block contract][crate::memblock::Memblock::new_fixed].
pub trait SourceOutput: Send {
    /// Deliver one chunk of captured audio.
    fn post(&mut self, chunk: &MemChunk);
}

/// The main-thread view of a capture source.
///
/// Everything here is owned by the main thread; the I/O thread keeps its
/// own copies of the fields it needs and is updated through messages only.
pub struct Source {
    name: String,
    sample_spec: SampleSpec,
    channel_map: ChannelMap,
    flags: SourceFlags,
    state: SourceState,
    /// The volume the user asked for: soft volume times hardware volume.
    pub virtual_volume: ChannelVolumes,
    /// The residual applied in software on top of the hardware volume.
    pub soft_volume: ChannelVolumes,
    /// Current mute state.
    pub muted: bool,
    /// Normalized volume that maps to 0 dB on the hardware scale.
    pub base_volume: Volume,
    /// Number of discrete hardware steps, when volume is not in dB.
    pub n_volume_steps: u32,
}

impl Source {
    /// Construct a source in [SourceState::Init].
    pub fn new(
        name: String,
        sample_spec: SampleSpec,
        channel_map: ChannelMap,
        flags: SourceFlags,
    ) -> Self {
        let channels = sample_spec.channels;

        Self {
            name,
            sample_spec,
            channel_map,
            flags,
            state: SourceState::Init,
            virtual_volume: ChannelVolumes::norm(channels),
            soft_volume: ChannelVolumes::norm(channels),
            muted: false,
            base_volume: Volume::NORM,
            n_volume_steps: 0,
        }
    }

    /// The registered name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The negotiated sample specification.
    pub fn sample_spec(&self) -> SampleSpec {
        self.sample_spec
    }

    /// The channel map.
    pub fn channel_map(&self) -> &ChannelMap {
        &self.channel_map
    }

    /// The advertised capabilities.
    pub fn flags(&self) -> SourceFlags {
        self.flags
    }

    /// Extend the advertised capabilities.
    pub fn add_flags(&mut self, flags: SourceFlags) {
        self.flags |= flags;
    }

    /// The current lifecycle state.
    pub fn state(&self) -> SourceState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: SourceState) {
        self.state = state;
    }
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Source")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("sample_spec", &self.sample_spec)
            .field("flags", &self.flags)
            .finish()
    }
}
