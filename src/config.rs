//! Driver configuration, mirroring the module argument table.

use crate::sample::{ChannelMap, SampleSpec};
use crate::time::{USEC_PER_MSEC, USEC_PER_SEC};
use crate::volume::ChannelVolumes;

/// Default ALSA device string.
pub const DEFAULT_DEVICE: &str = "default";
/// Default number of ring fragments.
pub const DEFAULT_NFRAGMENTS: u32 = 4;
/// Default length of one fragment.
pub const DEFAULT_FRAGMENT_MSEC: u64 = 25;
/// Nominal buffer target under timer-based scheduling.
pub const DEFAULT_TSCHED_BUFFER_USEC: u64 = 2 * USEC_PER_SEC;
/// Initial wakeup watermark under timer-based scheduling.
pub const DEFAULT_TSCHED_WATERMARK_USEC: u64 = 20 * USEC_PER_MSEC;

/// Configuration for one capture source.
///
/// Built with the consuming setters, mirroring the module arguments:
///
/// ```
/// use alsa_capture::config::Config;
/// use alsa_capture::sample::{ChannelMap, SampleFormat, SampleSpec};
///
/// # fn main() -> anyhow::Result<()> {
/// let spec = SampleSpec::new(SampleFormat::S16Le, 44100, 2)?;
///
/// let config = Config::new(spec, ChannelMap::stereo())
///     .device("hw:0")
///     .fragments(4)
///     .tsched(false);
/// # Ok(()) }
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// ALSA device string.
    pub device: String,
    /// Symbolic device id; resolved to `hw:<id>` when set.
    pub device_id: Option<String>,
    /// Explicit source name; used verbatim.
    pub source_name: Option<String>,
    /// Legacy name alias; still gets the `alsa_input.` prefix.
    pub name: Option<String>,
    /// Requested sample specification.
    pub sample_spec: SampleSpec,
    /// Requested channel map.
    pub channel_map: ChannelMap,
    /// Number of ring fragments.
    pub fragments: u32,
    /// Size of one fragment, in bytes.
    pub fragment_size: u32,
    /// Nominal buffer target when tsched is active, in bytes.
    pub tsched_buffer_size: u32,
    /// Initial watermark, in bytes.
    pub tsched_watermark: u32,
    /// Enable mmap access; auto-disabled when unsupported.
    pub mmap: bool,
    /// Enable timer-based scheduling; disabled without hrtimers.
    pub tsched: bool,
    /// Skip dB probing even when the mixer supports it.
    pub ignore_db: bool,
    /// Run the I/O thread at realtime priority.
    pub realtime_scheduling: bool,
    /// Priority to use when realtime scheduling is enabled.
    pub realtime_priority: i32,
    /// Initial volume to apply once the mixer is up.
    pub volume: Option<ChannelVolumes>,
    /// Initial mute state to apply once the mixer is up.
    pub muted: Option<bool>,
}

impl Config {
    /// Construct a configuration with the stock defaults for `sample_spec`.
    pub fn new(sample_spec: SampleSpec, channel_map: ChannelMap) -> Self {
        let fragment_size = sample_spec
            .usec_to_bytes(DEFAULT_FRAGMENT_MSEC * USEC_PER_MSEC)
            .max(sample_spec.frame_size() as u64) as u32;

        Self {
            device: DEFAULT_DEVICE.to_owned(),
            device_id: None,
            source_name: None,
            name: None,
            sample_spec,
            channel_map,
            fragments: DEFAULT_NFRAGMENTS,
            fragment_size,
            tsched_buffer_size: sample_spec.usec_to_bytes(DEFAULT_TSCHED_BUFFER_USEC) as u32,
            tsched_watermark: sample_spec.usec_to_bytes(DEFAULT_TSCHED_WATERMARK_USEC) as u32,
            mmap: true,
            tsched: true,
            ignore_db: false,
            realtime_scheduling: false,
            realtime_priority: 5,
            volume: None,
            muted: None,
        }
    }

    /// Set the ALSA device string.
    pub fn device(self, device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            ..self
        }
    }

    /// Set the symbolic device id.
    pub fn device_id(self, id: impl Into<String>) -> Self {
        Self {
            device_id: Some(id.into()),
            ..self
        }
    }

    /// Set an explicit source name.
    pub fn source_name(self, name: impl Into<String>) -> Self {
        Self {
            source_name: Some(name.into()),
            ..self
        }
    }

    /// Set the number of ring fragments.
    pub fn fragments(self, fragments: u32) -> Self {
        Self { fragments, ..self }
    }

    /// Set the fragment size, in bytes.
    pub fn fragment_size(self, fragment_size: u32) -> Self {
        Self {
            fragment_size,
            ..self
        }
    }

    /// Enable or disable mmap access.
    pub fn mmap(self, mmap: bool) -> Self {
        Self { mmap, ..self }
    }

    /// Enable or disable timer-based scheduling.
    pub fn tsched(self, tsched: bool) -> Self {
        Self { tsched, ..self }
    }

    /// Skip dB probing.
    pub fn ignore_db(self, ignore_db: bool) -> Self {
        Self { ignore_db, ..self }
    }

    /// The device string to actually open.
    pub fn effective_device(&self) -> String {
        match &self.device_id {
            Some(id) => format!("hw:{}", id),
            None => self.device.clone(),
        }
    }

    /// The name to register the source under and whether name mangling on
    /// collision is forbidden.
    pub fn resolve_source_name(&self, device_name: &str) -> (String, bool) {
        if let Some(n) = &self.source_name {
            return (n.clone(), true);
        }

        if let Some(n) = &self.name {
            return (format!("alsa_input.{}", n), true);
        }

        let n = self.device_id.as_deref().unwrap_or(device_name);
        (format!("alsa_input.{}", n), false)
    }
}
