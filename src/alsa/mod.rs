//! The raw ALSA backend.
//!
//! Implements [CapturePcm][crate::pcm::CapturePcm] over `snd_pcm_*` and
//! [MixerElement][crate::mixer::MixerElement] over `snd_mixer_selem_*`.
//! Everything here is Linux-only and lives behind the `alsa` cargo
//! feature; the engine itself never touches these types directly.
// Documentation: https://www.alsa-project.org/alsa-doc/alsa-lib/

mod pcm;
pub use self::pcm::{AlsaOpener, AlsaPcm};

mod mixer;
pub use self::mixer::AlsaMixerElement;
