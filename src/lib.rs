//! An ALSA capture source driver for a modular audio server.
//!
//! The crate bridges a kernel PCM capture device to a server-wide routing
//! fabric: it opens a capture device, runs a dedicated realtime I/O thread
//! that pulls audio frames out of the hardware ring buffer, timestamps them
//! against a smoothed clock and posts them as reference-counted memory
//! chunks to a downstream consumer. Hardware volume and mute are mediated
//! through a mixer element, and exclusive device access is arbitrated with
//! peer processes through a reservation contract.
//!
//! The capture engine itself is written against the [`pcm::CapturePcm`]
//! trait and is fully exercisable without hardware; the raw ALSA backend
//! lives behind the `alsa` cargo feature.
//!
//! # Examples
//!
//! ```no_run
//! use alsa_capture::capture::CaptureSource;
//! use alsa_capture::config::Config;
//! use alsa_capture::memblock::MemChunk;
//! use alsa_capture::sample::{ChannelMap, SampleFormat, SampleSpec};
//! use alsa_capture::source::{SourceOutput, SourceState};
//!
//! struct Printer;
//!
//! impl SourceOutput for Printer {
//!     fn post(&mut self, chunk: &MemChunk) {
//!         println!("{} bytes captured", chunk.length);
//!     }
//! }
//!
//! # #[cfg(feature = "alsa")]
//! # fn main() -> anyhow::Result<()> {
//! let spec = SampleSpec::new(SampleFormat::S16Le, 44100, 2)?;
//! let config = Config::new(spec, ChannelMap::stereo());
//!
//! let mut source = CaptureSource::new(
//!     config,
//!     Box::new(alsa_capture::alsa::AlsaOpener::new()),
//!     None,
//!     None,
//!     Box::new(Printer),
//! )?;
//!
//! source.set_state(SourceState::Running)?;
//! # Ok(()) }
//! # #[cfg(not(feature = "alsa"))]
//! # fn main() {}
//! ```

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(clippy::len_without_is_empty)]

#[macro_use]
#[doc(hidden)]
mod macros;

#[macro_use]
pub mod unix;

pub mod libc;

cfg_alsa! {
    pub mod alsa;
}

pub mod capture;
pub mod config;
pub mod memblock;
pub mod mixer;
pub mod pcm;
pub mod reserve;
pub mod rtpoll;
pub mod sample;
pub mod smoother;
pub mod source;
pub mod thread_mq;
pub mod time;
pub mod volume;

mod error;
pub use self::error::{Error, Result};
