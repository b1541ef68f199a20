//! Sample specifications and the byte/time arithmetic built on them.

use crate::time::USEC_PER_SEC;
use crate::{Error, Result};
use std::fmt;

/// Maximum number of channels a source can carry.
pub const CHANNELS_MAX: usize = 32;

/// A supported interleaved sample format.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[non_exhaustive]
pub enum SampleFormat {
    /// Unsigned 8 bit.
    U8,
    /// Signed 16 bit, little endian.
    S16Le,
    /// Signed 16 bit, big endian.
    S16Be,
    /// Signed 32 bit, little endian.
    S32Le,
    /// Signed 32 bit, big endian.
    S32Be,
    /// 32 bit float, little endian.
    F32Le,
    /// 32 bit float, big endian.
    F32Be,
}

impl SampleFormat {
    /// Size of a single sample, in bytes.
    pub fn sample_size(self) -> usize {
        match self {
            SampleFormat::U8 => 1,
            SampleFormat::S16Le | SampleFormat::S16Be => 2,
            SampleFormat::S32Le | SampleFormat::S32Be => 4,
            SampleFormat::F32Le | SampleFormat::F32Be => 4,
        }
    }
}

impl fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let id = match self {
            SampleFormat::U8 => "u8",
            SampleFormat::S16Le => "s16le",
            SampleFormat::S16Be => "s16be",
            SampleFormat::S32Le => "s32le",
            SampleFormat::S32Be => "s32be",
            SampleFormat::F32Le => "float32le",
            SampleFormat::F32Be => "float32be",
        };

        f.write_str(id)
    }
}

/// A negotiated sample specification.
///
/// Immutable once the device has accepted it; every byte/time conversion in
/// the engine goes through one of the methods here.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct SampleSpec {
    /// The sample format.
    pub format: SampleFormat,
    /// Frames per second.
    pub rate: u32,
    /// Number of interleaved channels.
    pub channels: u8,
}

impl SampleSpec {
    /// Construct a validated sample specification.
    ///
    /// # Examples
    ///
    /// ```
    /// use alsa_capture::sample::{SampleFormat, SampleSpec};
    ///
    /// # fn main() -> anyhow::Result<()> {
    /// let spec = SampleSpec::new(SampleFormat::S16Le, 44100, 2)?;
    /// assert_eq!(spec.frame_size(), 4);
    /// # Ok(()) }
    /// ```
    pub fn new(format: SampleFormat, rate: u32, channels: u8) -> Result<Self> {
        let spec = Self {
            format,
            rate,
            channels,
        };

        if !spec.is_valid() {
            return Err(Error::UnsupportedSampleSpec);
        }

        Ok(spec)
    }

    /// Whether rate and channel count are usable.
    pub fn is_valid(&self) -> bool {
        self.rate > 0
            && self.rate <= 768_000
            && self.channels > 0
            && (self.channels as usize) <= CHANNELS_MAX
    }

    /// Size of one interleaved frame, in bytes.
    pub fn frame_size(&self) -> usize {
        self.format.sample_size() * self.channels as usize
    }

    /// Round `bytes` down to a whole number of frames.
    pub fn frame_align(&self, bytes: u64) -> u64 {
        bytes - bytes % self.frame_size() as u64
    }

    /// Playback time of `bytes`, rounded down to whole microseconds.
    pub fn bytes_to_usec(&self, bytes: u64) -> u64 {
        let frames = bytes / self.frame_size() as u64;
        frames * USEC_PER_SEC / self.rate as u64
    }

    /// Playback time of `bytes`, rounded up to whole microseconds.
    pub fn bytes_to_usec_round_up(&self, bytes: u64) -> u64 {
        let frames = (bytes + self.frame_size() as u64 - 1) / self.frame_size() as u64;
        (frames * USEC_PER_SEC + self.rate as u64 - 1) / self.rate as u64
    }

    /// Bytes needed for `usec` of audio, rounded down, frame aligned.
    pub fn usec_to_bytes(&self, usec: u64) -> u64 {
        let frames = usec * self.rate as u64 / USEC_PER_SEC;
        frames * self.frame_size() as u64
    }

    /// Bytes needed for `usec` of audio, rounded up, frame aligned.
    pub fn usec_to_bytes_round_up(&self, usec: u64) -> u64 {
        let frames = (usec * self.rate as u64 + USEC_PER_SEC - 1) / USEC_PER_SEC;
        frames * self.frame_size() as u64
    }
}

impl fmt::Display for SampleSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ch {}Hz {}", self.channels, self.rate, self.format)
    }
}

/// A speaker position, used to map source channels onto mixer channels.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ChannelPosition {
    /// Single channel.
    Mono,
    /// Front left.
    FrontLeft,
    /// Front right.
    FrontRight,
    /// Front center.
    FrontCenter,
    /// Rear left.
    RearLeft,
    /// Rear right.
    RearRight,
    /// Rear center.
    RearCenter,
    /// Low frequency effects.
    Lfe,
    /// Side left.
    SideLeft,
    /// Side right.
    SideRight,
}

/// An ordered assignment of positions to interleaved channels.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ChannelMap {
    channels: u8,
    positions: [ChannelPosition; CHANNELS_MAX],
}

impl ChannelMap {
    /// A single mono channel.
    pub fn mono() -> Self {
        Self::from_positions(&[ChannelPosition::Mono])
    }

    /// The standard stereo pair.
    pub fn stereo() -> Self {
        Self::from_positions(&[ChannelPosition::FrontLeft, ChannelPosition::FrontRight])
    }

    /// Build a map from an explicit position list.
    ///
    /// Lists longer than [CHANNELS_MAX] are truncated.
    pub fn from_positions(positions: &[ChannelPosition]) -> Self {
        let mut map = Self {
            channels: 0,
            positions: [ChannelPosition::Mono; CHANNELS_MAX],
        };

        for (i, p) in positions.iter().take(CHANNELS_MAX).enumerate() {
            map.positions[i] = *p;
            map.channels = i as u8 + 1;
        }

        map
    }

    /// Number of mapped channels.
    pub fn channels(&self) -> u8 {
        self.channels
    }

    /// The mapped positions, in channel order.
    pub fn positions(&self) -> &[ChannelPosition] {
        &self.positions[..self.channels as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> SampleSpec {
        SampleSpec::new(SampleFormat::S16Le, 44100, 2).unwrap()
    }

    #[test]
    fn frame_size_follows_format_and_channels() {
        assert_eq!(spec().frame_size(), 4);
        let s = SampleSpec::new(SampleFormat::F32Le, 48000, 6).unwrap();
        assert_eq!(s.frame_size(), 24);
    }

    #[test]
    fn byte_time_conversions_roundtrip() {
        let s = spec();

        // One second of audio.
        let bytes = s.rate as u64 * s.frame_size() as u64;
        assert_eq!(s.bytes_to_usec(bytes), USEC_PER_SEC);
        assert_eq!(s.usec_to_bytes(USEC_PER_SEC), bytes);

        // Round up covers the sub-frame remainder.
        assert_eq!(s.usec_to_bytes_round_up(1), s.frame_size() as u64);
        assert!(s.bytes_to_usec_round_up(1) >= 1);
    }

    #[test]
    fn frame_align_rounds_down() {
        let s = spec();
        assert_eq!(s.frame_align(17), 16);
        assert_eq!(s.frame_align(16), 16);
    }

    #[test]
    fn rejects_silly_specs() {
        assert!(SampleSpec::new(SampleFormat::S16Le, 0, 2).is_err());
        assert!(SampleSpec::new(SampleFormat::S16Le, 44100, 0).is_err());
    }
}
