//! The mixer bridge: hardware capture volume/mute mediated into the
//! source's normalized volume model.
//!
//! The bridge probes the element's raw and dB ranges, decides whether the
//! hardware control is usable at all, and afterwards translates every
//! volume read/write. Writes are read back and the residual between what
//! was asked for and what the hardware granted is pushed into the soft
//! volume, so `virtual volume = soft x hardware` holds exactly.

use crate::sample::{ChannelPosition, CHANNELS_MAX};
use crate::source::{Source, SourceFlags};
use crate::unix::Errno;
use crate::volume::{ChannelVolumes, Volume};

/// A mixer element channel id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MixerChannel(pub u32);

impl MixerChannel {
    /// The mono/joined channel all unified writes go to.
    pub const MONO: MixerChannel = MixerChannel(0);
}

bitflags::bitflags! {
    /// Event classes reported for a mixer element.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MixerEventMask: u32 {
        /// A control value changed.
        const VALUE = 1 << 0;
        /// The element disappeared.
        const REMOVE = 1 << 1;
    }
}

/// A simple mixer element with capture controls.
///
/// The real implementation wraps `snd_mixer_elem_t`; tests provide mocks.
/// dB values are in hundredths of a dB throughout, matching the wire
/// format of the control API.
pub trait MixerElement: Send {
    /// Whether the element has a capture volume control.
    fn has_capture_volume(&self) -> bool;
    /// The raw volume range.
    fn capture_volume_range(&mut self) -> Result<(i64, i64), Errno>;
    /// The dB range, when calibrated.
    fn capture_db_range(&mut self) -> Result<(i64, i64), Errno>;
    /// Raw volume of one channel.
    fn capture_volume(&mut self, ch: MixerChannel) -> Result<i64, Errno>;
    /// Set the raw volume of one channel.
    fn set_capture_volume(&mut self, ch: MixerChannel, value: i64) -> Result<(), Errno>;
    /// Set the raw volume of all channels.
    fn set_capture_volume_all(&mut self, value: i64) -> Result<(), Errno>;
    /// dB volume of one channel.
    fn capture_db(&mut self, ch: MixerChannel) -> Result<i64, Errno>;
    /// Set the dB volume of one channel, rounding up when `round_up`.
    fn set_capture_db(&mut self, ch: MixerChannel, value: i64, round_up: bool)
        -> Result<(), Errno>;
    /// Set the dB volume of all channels.
    fn set_capture_db_all(&mut self, value: i64, round_up: bool) -> Result<(), Errno>;
    /// Whether the element has a capture switch.
    fn has_capture_switch(&self) -> bool;
    /// The capture switch state.
    fn capture_switch(&mut self) -> Result<bool, Errno>;
    /// Flip the capture switch on all channels.
    fn set_capture_switch_all(&mut self, on: bool) -> Result<(), Errno>;
    /// The mixer channel a speaker position maps to, if the element has
    /// one for it.
    fn channel_for_position(&self, pos: ChannelPosition) -> Option<MixerChannel>;
}

/// The probed hardware volume model and the element it talks to.
pub struct MixerBridge {
    elem: Box<dyn MixerElement>,
    hw_volume_min: i64,
    hw_volume_max: i64,
    hw_db_min: i64,
    hw_db_max: i64,
    hw_db_supported: bool,
    hw_volume_supported: bool,
    separate_channels: bool,
    mixer_map: [MixerChannel; CHANNELS_MAX],
    /// Last volume read back from or written to the hardware.
    pub hardware_volume: ChannelVolumes,
}

impl MixerBridge {
    /// Probe `elem` and wire the usable controls into `source`'s flags.
    pub fn setup(elem: Box<dyn MixerElement>, source: &mut Source, ignore_db: bool) -> Self {
        let channels = source.sample_spec().channels;

        let mut bridge = Self {
            hw_volume_min: 0,
            hw_volume_max: 0,
            hw_db_min: 0,
            hw_db_max: 0,
            hw_db_supported: false,
            hw_volume_supported: false,
            separate_channels: false,
            mixer_map: [MixerChannel::MONO; CHANNELS_MAX],
            hardware_volume: ChannelVolumes::muted(channels),
            elem,
        };

        bridge.probe(source, ignore_db);
        bridge
    }

    fn probe(&mut self, source: &mut Source, ignore_db: bool) {
        if self.elem.has_capture_volume() {
            let mut suitable = false;

            match self.elem.capture_volume_range() {
                Err(_) => {
                    tracing::info!(
                        "Failed to get volume range. Falling back to software volume control."
                    );
                }
                Ok((min, max)) if min >= max => {
                    tracing::warn!(
                        "Your kernel driver is broken: it reports a volume range from {} to {} which makes no sense.",
                        min,
                        max
                    );
                }
                Ok((min, max)) => {
                    tracing::info!("Volume ranges from {} to {}.", min, max);
                    self.hw_volume_min = min;
                    self.hw_volume_max = max;
                    suitable = true;
                }
            }

            if suitable {
                let db_range = if ignore_db {
                    Err(Errno::from_i32(libc::ENOTSUP))
                } else {
                    self.elem.capture_db_range()
                };

                match db_range {
                    Err(_) => {
                        tracing::info!("Mixer doesn't support dB information or data is ignored.");
                    }
                    Ok((min, max)) if min >= max => {
                        tracing::warn!(
                            "Your kernel driver is broken: it reports a dB range from {:.2} to {:.2} which makes no sense.",
                            min as f64 / 100.0,
                            max as f64 / 100.0
                        );
                    }
                    Ok((min, max)) => {
                        tracing::info!(
                            "Volume ranges from {:.2} dB to {:.2} dB.",
                            min as f64 / 100.0,
                            max as f64 / 100.0
                        );
                        self.hw_db_min = min;
                        self.hw_db_max = max;
                        self.hw_db_supported = true;

                        if max > 0 {
                            source.base_volume = Volume::from_db(-(max as f64) / 100.0);
                            tracing::info!(
                                "Fixing base volume to {:.2} dB",
                                source.base_volume.to_db()
                            );
                        } else {
                            tracing::info!("No particular base volume set, fixing to 0 dB");
                        }
                    }
                }

                if !self.hw_db_supported && self.hw_volume_max - self.hw_volume_min < 3 {
                    tracing::info!(
                        "Device has less than 4 volume levels. Falling back to software volume control."
                    );
                    suitable = false;
                }
            }

            if suitable {
                self.separate_channels = self.calc_mixer_map(source);
                self.hw_volume_supported = true;

                let mut flags = SourceFlags::HW_VOLUME_CTRL;
                if self.hw_db_supported {
                    flags |= SourceFlags::DECIBEL_VOLUME;
                }
                source.add_flags(flags);

                tracing::info!(
                    "Using hardware volume control. Hardware dB scale {}.",
                    if self.hw_db_supported {
                        "supported"
                    } else {
                        "not supported"
                    }
                );

                if !self.hw_db_supported {
                    source.n_volume_steps = (self.hw_volume_max - self.hw_volume_min + 1) as u32;
                }
            } else {
                tracing::info!("Using software volume control.");
            }
        }

        if self.elem.has_capture_switch() {
            source.add_flags(SourceFlags::HW_MUTE_CTRL);
        } else {
            tracing::info!("Using software mute control.");
        }
    }

    /// Resolve every source channel to a mixer channel. Falls back to the
    /// unified strategy when any position has no hardware counterpart.
    fn calc_mixer_map(&mut self, source: &Source) -> bool {
        for (i, pos) in source.channel_map().positions().iter().enumerate() {
            match self.elem.channel_for_position(*pos) {
                Some(ch) => self.mixer_map[i] = ch,
                None => return false,
            }
        }

        true
    }

    /// Whether volume is applied in hardware.
    pub fn has_hw_volume(&self) -> bool {
        self.hw_volume_supported
    }

    /// Whether mute is applied in hardware.
    pub fn has_hw_mute(&self) -> bool {
        self.elem.has_capture_switch()
    }

    /// Whether the dB scale is in use.
    pub fn db_supported(&self) -> bool {
        self.hw_db_supported
    }

    /// Map a raw hardware volume onto the normalized scale.
    pub fn from_alsa(&self, alsa_vol: i64) -> Volume {
        let norm = Volume::NORM.0 as f64;
        let span = (self.hw_volume_max - self.hw_volume_min) as f64;
        let v = ((alsa_vol - self.hw_volume_min) as f64 * norm / span).round();
        Volume(v.max(0.0) as u32)
    }

    /// Map a normalized volume onto the raw hardware scale.
    pub fn to_alsa(&self, vol: Volume) -> i64 {
        let norm = Volume::NORM.0 as f64;
        let span = (self.hw_volume_max - self.hw_volume_min) as f64;
        let alsa_vol = (vol.0 as f64 * span / norm).round() as i64 + self.hw_volume_min;
        alsa_vol.clamp(self.hw_volume_min, self.hw_volume_max)
    }

    fn db_to_alsa(&self, vol: Volume) -> i64 {
        let db = vol.to_db();

        if !db.is_finite() {
            return self.hw_db_min;
        }

        ((db * 100.0).round() as i64 + self.hw_db_max).clamp(self.hw_db_min, self.hw_db_max)
    }

    fn db_from_alsa(&self, alsa_db: i64) -> Volume {
        Volume::from_db((alsa_db - self.hw_db_max) as f64 / 100.0)
    }

    fn read_channel(&mut self, ch: MixerChannel) -> Result<Volume, Errno> {
        if self.hw_db_supported {
            let v = self.elem.capture_db(ch)?;
            Ok(self.db_from_alsa(v))
        } else {
            let v = self.elem.capture_volume(ch)?;
            Ok(self.from_alsa(v))
        }
    }

    /// Read the hardware volume into the source.
    ///
    /// On an out-of-band hardware change the virtual volume follows, and
    /// under the dB model the soft volume is reset since the residual no
    /// longer applies.
    pub fn get_volume(&mut self, source: &mut Source) -> Result<(), Errno> {
        let channels = source.sample_spec().channels;
        let mut r = ChannelVolumes::muted(channels);

        if self.separate_channels {
            for i in 0..channels as usize {
                let v = self.read_channel(self.mixer_map[i])?;
                r.set(i, v);
            }
        } else {
            let v = self.read_channel(MixerChannel::MONO)?;
            r = ChannelVolumes::with_volume(channels, v);
        }

        tracing::debug!("Read hardware volume: {:?}", r.values());

        if self.hardware_volume != r {
            source.virtual_volume = r;
            self.hardware_volume = r;

            if self.hw_db_supported {
                // The residual was computed against the old hardware state.
                source.soft_volume = ChannelVolumes::norm(channels);
            }
        }

        Ok(())
    }

    fn write_channel(&mut self, ch: MixerChannel, vol: Volume) -> Result<Volume, Errno> {
        if self.hw_db_supported {
            let alsa_vol = self.db_to_alsa(vol);
            self.elem.set_capture_db(ch, alsa_vol, true)?;
            let actual = self.elem.capture_db(ch)?;
            Ok(self.db_from_alsa(actual))
        } else {
            let alsa_vol = self.to_alsa(vol);
            self.elem.set_capture_volume(ch, alsa_vol)?;
            let actual = self.elem.capture_volume(ch)?;
            Ok(self.from_alsa(actual))
        }
    }

    /// Write the source's virtual volume to the hardware.
    ///
    /// The value actually granted is read back; with a dB scale the
    /// residual goes into the soft volume, otherwise the virtual volume is
    /// snapped to what the hardware can do.
    pub fn set_volume(&mut self, source: &mut Source) -> Result<(), Errno> {
        let channels = source.sample_spec().channels;
        let mut r = ChannelVolumes::muted(channels);

        if self.separate_channels {
            for i in 0..channels as usize {
                let actual = self.write_channel(self.mixer_map[i], source.virtual_volume.get(i))?;
                r.set(i, actual);
            }
        } else {
            let vol = source.virtual_volume.max();

            let actual = if self.hw_db_supported {
                let alsa_vol = self.db_to_alsa(vol);
                self.elem.set_capture_db_all(alsa_vol, true)?;
                let v = self.elem.capture_db(MixerChannel::MONO)?;
                self.db_from_alsa(v)
            } else {
                let alsa_vol = self.to_alsa(vol);
                self.elem.set_capture_volume_all(alsa_vol)?;
                let v = self.elem.capture_volume(MixerChannel::MONO)?;
                self.from_alsa(v)
            };

            r = ChannelVolumes::with_volume(channels, actual);
        }

        self.hardware_volume = r;

        if self.hw_db_supported {
            // Match exactly what the user requested by software.
            source.soft_volume = source.virtual_volume.divide(&self.hardware_volume);

            tracing::debug!("Requested volume: {:?}", source.virtual_volume.values());
            tracing::debug!("Got hardware volume: {:?}", self.hardware_volume.values());
            tracing::debug!("Calculated software volume: {:?}", source.soft_volume.values());
        } else {
            // We can't match exactly what was requested, so at least
            // report what we got.
            source.virtual_volume = r;
        }

        Ok(())
    }

    /// Read the capture switch into the source's mute state.
    pub fn get_mute(&mut self, source: &mut Source) -> Result<(), Errno> {
        let sw = self.elem.capture_switch()?;
        source.muted = !sw;
        Ok(())
    }

    /// Write the source's mute state to the capture switch.
    pub fn set_mute(&mut self, source: &mut Source) -> Result<(), Errno> {
        self.elem.set_capture_switch_all(!source.muted)
    }

    /// React to a mixer event: value changes re-read volume and mute,
    /// element removal is ignored.
    pub fn on_event(&mut self, mask: MixerEventMask, source: &mut Source) {
        if mask.contains(MixerEventMask::REMOVE) {
            return;
        }

        if mask.contains(MixerEventMask::VALUE) {
            if self.hw_volume_supported {
                if let Err(e) = self.get_volume(source) {
                    tracing::error!("Unable to read volume: {}", e);
                }
            }

            if self.has_hw_mute() {
                if let Err(e) = self.get_mute(source) {
                    tracing::error!("Unable to get switch: {}", e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::{ChannelMap, SampleFormat, SampleSpec};

    struct FakeElem {
        range: (i64, i64),
        db_range: Option<(i64, i64)>,
        volumes: std::collections::HashMap<u32, i64>,
        switch: bool,
        has_switch: bool,
        separate: bool,
    }

    impl FakeElem {
        fn new(range: (i64, i64), db_range: Option<(i64, i64)>) -> Self {
            Self {
                range,
                db_range,
                volumes: Default::default(),
                switch: true,
                has_switch: true,
                separate: true,
            }
        }
    }

    impl MixerElement for FakeElem {
        fn has_capture_volume(&self) -> bool {
            true
        }

        fn capture_volume_range(&mut self) -> Result<(i64, i64), Errno> {
            Ok(self.range)
        }

        fn capture_db_range(&mut self) -> Result<(i64, i64), Errno> {
            self.db_range.ok_or(Errno::from_i32(libc::ENOTSUP))
        }

        fn capture_volume(&mut self, ch: MixerChannel) -> Result<i64, Errno> {
            Ok(*self.volumes.get(&ch.0).unwrap_or(&self.range.0))
        }

        fn set_capture_volume(&mut self, ch: MixerChannel, value: i64) -> Result<(), Errno> {
            self.volumes.insert(ch.0, value);
            Ok(())
        }

        fn set_capture_volume_all(&mut self, value: i64) -> Result<(), Errno> {
            self.volumes.insert(MixerChannel::MONO.0, value);
            Ok(())
        }

        fn capture_db(&mut self, ch: MixerChannel) -> Result<i64, Errno> {
            self.capture_volume(ch)
        }

        fn set_capture_db(
            &mut self,
            ch: MixerChannel,
            value: i64,
            _round_up: bool,
        ) -> Result<(), Errno> {
            // Hardware granularity of 1.5 dB.
            self.volumes.insert(ch.0, value - value.rem_euclid(150));
            Ok(())
        }

        fn set_capture_db_all(&mut self, value: i64, round_up: bool) -> Result<(), Errno> {
            self.set_capture_db(MixerChannel::MONO, value, round_up)
        }

        fn has_capture_switch(&self) -> bool {
            self.has_switch
        }

        fn capture_switch(&mut self) -> Result<bool, Errno> {
            Ok(self.switch)
        }

        fn set_capture_switch_all(&mut self, on: bool) -> Result<(), Errno> {
            self.switch = on;
            Ok(())
        }

        fn channel_for_position(&self, _pos: ChannelPosition) -> Option<MixerChannel> {
            if self.separate {
                Some(MixerChannel(0))
            } else {
                None
            }
        }
    }

    fn source() -> Source {
        let ss = SampleSpec::new(SampleFormat::S16Le, 44100, 2).unwrap();
        Source::new("test".into(), ss, ChannelMap::stereo(), SourceFlags::HARDWARE)
    }

    #[test]
    fn two_level_control_degrades_to_software() {
        let mut s = source();
        let bridge = MixerBridge::setup(Box::new(FakeElem::new((0, 1), None)), &mut s, false);
        assert!(!bridge.has_hw_volume());
        assert!(!s.flags().contains(SourceFlags::HW_VOLUME_CTRL));
        assert_eq!(s.n_volume_steps, 0);
    }

    #[test]
    fn inverted_range_degrades_to_software() {
        let mut s = source();
        let bridge = MixerBridge::setup(Box::new(FakeElem::new((10, 10), None)), &mut s, false);
        assert!(!bridge.has_hw_volume());
    }

    #[test]
    fn raw_range_maps_linearly() {
        let mut s = source();
        let bridge = MixerBridge::setup(Box::new(FakeElem::new((0, 100), None)), &mut s, false);
        assert!(bridge.has_hw_volume());
        assert!(!bridge.db_supported());
        assert_eq!(s.n_volume_steps, 101);

        assert_eq!(bridge.from_alsa(0), Volume::MUTED);
        assert_eq!(bridge.from_alsa(100), Volume::NORM);
        assert_eq!(bridge.to_alsa(Volume::NORM), 100);
        // Out of range requests are clamped.
        assert_eq!(bridge.to_alsa(Volume(Volume::NORM.0 * 2)), 100);
    }

    #[test]
    fn db_base_volume_compensates_gain() {
        let mut s = source();
        let bridge = MixerBridge::setup(
            Box::new(FakeElem::new((0, 100), Some((-6000, 1200)))),
            &mut s,
            false,
        );
        assert!(bridge.db_supported());
        assert!(s.flags().contains(SourceFlags::DECIBEL_VOLUME));
        // Base volume maps 1.0 to 0 dB: -12 dB on the normalized scale.
        assert!((s.base_volume.to_db() + 12.0).abs() < 0.05);
    }

    #[test]
    fn ignore_db_skips_the_probe() {
        let mut s = source();
        let bridge = MixerBridge::setup(
            Box::new(FakeElem::new((0, 100), Some((-6000, 0)))),
            &mut s,
            true,
        );
        assert!(bridge.has_hw_volume());
        assert!(!bridge.db_supported());
    }

    #[test]
    fn set_volume_pushes_residual_into_soft_volume() {
        let mut s = source();
        let mut bridge = MixerBridge::setup(
            Box::new(FakeElem::new((0, 100), Some((-6000, 0)))),
            &mut s,
            false,
        );

        // Ask for -2 dB; the fake hardware rounds down to -3 dB.
        s.virtual_volume = ChannelVolumes::with_volume(2, Volume::from_db(-2.0));
        bridge.set_volume(&mut s).unwrap();

        assert!((bridge.hardware_volume.get(0).to_db() + 3.0).abs() < 0.05);
        // Soft volume makes up the missing +1 dB.
        assert!((s.soft_volume.get(0).to_db() - 1.0).abs() < 0.05);
    }

    #[test]
    fn mute_follows_the_switch() {
        let mut s = source();
        let mut bridge =
            MixerBridge::setup(Box::new(FakeElem::new((0, 100), None)), &mut s, false);

        s.muted = true;
        bridge.set_mute(&mut s).unwrap();
        bridge.get_mute(&mut s).unwrap();
        assert!(s.muted);
    }

    #[test]
    fn remove_event_is_ignored() {
        let mut s = source();
        let mut bridge =
            MixerBridge::setup(Box::new(FakeElem::new((0, 100), None)), &mut s, false);
        let before = s.virtual_volume;
        bridge.on_event(MixerEventMask::REMOVE, &mut s);
        assert_eq!(s.virtual_volume, before);
    }
}
