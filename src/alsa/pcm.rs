use crate::libc as c;
use crate::pcm::{CapturePcm, HwParams, MmapArea, OpenError, PcmOpener, PcmState};
use crate::sample::{SampleFormat, SampleSpec};
use crate::time::timespec_usec;
use crate::unix::poll::{PollFd, PollFlags};
use crate::unix::Errno;
use alsa_sys as alsa;
use std::ffi::{CStr, CString};
use std::mem;
use std::ptr;

// Open mode bits from <alsa/pcm.h>; the sys crate only exports the
// function surface.
const SND_PCM_NO_AUTO_RESAMPLE: c::c_int = 0x0001_0000;
const SND_PCM_NO_AUTO_CHANNELS: c::c_int = 0x0002_0000;
const SND_PCM_NO_AUTO_FORMAT: c::c_int = 0x0004_0000;

fn format_to_alsa(format: SampleFormat) -> alsa::snd_pcm_format_t {
    match format {
        SampleFormat::U8 => alsa::SND_PCM_FORMAT_U8,
        SampleFormat::S16Le => alsa::SND_PCM_FORMAT_S16_LE,
        SampleFormat::S16Be => alsa::SND_PCM_FORMAT_S16_BE,
        SampleFormat::S32Le => alsa::SND_PCM_FORMAT_S32_LE,
        SampleFormat::S32Be => alsa::SND_PCM_FORMAT_S32_BE,
        SampleFormat::F32Le => alsa::SND_PCM_FORMAT_FLOAT_LE,
        SampleFormat::F32Be => alsa::SND_PCM_FORMAT_FLOAT_BE,
    }
}

/// An opened ALSA capture PCM.
pub struct AlsaPcm {
    handle: ptr::NonNull<alsa::snd_pcm_t>,
    device_name: String,
    frame_size: u64,
}

// Safety: the handle is owned by exactly one thread at a time; ownership
// moves to the I/O thread at spawn and all methods take `&mut self`, so
// calls are never concurrent.
unsafe impl Send for AlsaPcm {}

impl Drop for AlsaPcm {
    fn drop(&mut self) {
        unsafe { alsa::snd_pcm_close(self.handle.as_ptr()) };
    }
}

impl CapturePcm for AlsaPcm {
    fn device_name(&self) -> &str {
        &self.device_name
    }

    fn state(&mut self) -> PcmState {
        let state = unsafe { alsa::snd_pcm_state(self.handle.as_ptr()) };

        match state {
            alsa::SND_PCM_STATE_PREPARED => PcmState::Prepared,
            alsa::SND_PCM_STATE_RUNNING => PcmState::Running,
            alsa::SND_PCM_STATE_XRUN => PcmState::Xrun,
            alsa::SND_PCM_STATE_SUSPENDED => PcmState::Suspended,
            alsa::SND_PCM_STATE_DISCONNECTED => PcmState::Disconnected,
            _ => PcmState::Other,
        }
    }

    fn avail(&mut self) -> Result<u64, Errno> {
        unsafe { Ok(errno!(alsa::snd_pcm_avail(self.handle.as_ptr()))? as u64) }
    }

    fn delay(&mut self) -> Result<i64, Errno> {
        unsafe {
            let mut delay = mem::MaybeUninit::uninit();
            errno!(alsa::snd_pcm_delay(
                self.handle.as_ptr(),
                delay.as_mut_ptr()
            ))?;
            Ok(delay.assume_init() as i64)
        }
    }

    fn htimestamp(&mut self) -> Result<u64, Errno> {
        unsafe {
            let mut status = mem::MaybeUninit::uninit();
            errno!(alsa::snd_pcm_status_malloc(status.as_mut_ptr()))?;
            let status = status.assume_init();

            if let Err(e) = errno!(alsa::snd_pcm_status(self.handle.as_ptr(), status)) {
                alsa::snd_pcm_status_free(status);
                return Err(e);
            }

            let mut htstamp = c::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            };
            alsa::snd_pcm_status_get_htstamp(status, &mut htstamp as *mut _ as *mut _);
            alsa::snd_pcm_status_free(status);

            Ok(timespec_usec(&htstamp))
        }
    }

    fn start(&mut self) -> Result<(), Errno> {
        unsafe {
            errno!(alsa::snd_pcm_start(self.handle.as_ptr()))?;
            Ok(())
        }
    }

    fn stop(&mut self) {
        unsafe {
            let _ = alsa::snd_pcm_drop(self.handle.as_ptr());
        }
    }

    fn set_sw_params(&mut self, avail_min_frames: u64) -> Result<(), Errno> {
        unsafe {
            let mut params = mem::MaybeUninit::uninit();
            errno!(alsa::snd_pcm_sw_params_malloc(params.as_mut_ptr()))?;
            let params = params.assume_init();

            let result = (|| {
                errno!(alsa::snd_pcm_sw_params_current(self.handle.as_ptr(), params))?;
                errno!(alsa::snd_pcm_sw_params_set_avail_min(
                    self.handle.as_ptr(),
                    params,
                    avail_min_frames as alsa::snd_pcm_uframes_t
                ))?;
                errno!(alsa::snd_pcm_sw_params_set_tstamp_mode(
                    self.handle.as_ptr(),
                    params,
                    alsa::SND_PCM_TSTAMP_ENABLE
                ))?;
                errno!(alsa::snd_pcm_sw_params(self.handle.as_ptr(), params))?;
                Ok(())
            })();

            alsa::snd_pcm_sw_params_free(params);
            result
        }
    }

    fn mmap_begin(&mut self, frames: u64) -> Result<MmapArea, Errno> {
        unsafe {
            let mut areas = mem::MaybeUninit::uninit();
            let mut offset = mem::MaybeUninit::uninit();
            let mut frames = frames as alsa::snd_pcm_uframes_t;

            errno!(alsa::snd_pcm_mmap_begin(
                self.handle.as_ptr(),
                areas.as_mut_ptr(),
                offset.as_mut_ptr(),
                &mut frames
            ))?;

            let areas = areas.assume_init();
            let offset = offset.assume_init();
            let area = &*areas;

            // Multiples of 8 bit, and a single interleaved buffer.
            assert!(area.first % 8 == 0 && area.step % 8 == 0);
            assert_eq!(area.first / 8, 0);
            assert_eq!((area.step / 8) as u64, self.frame_size);

            let ptr = (area.addr as *mut u8).add((offset as u64 * self.frame_size) as usize);

            Ok(MmapArea {
                ptr,
                offset: offset as u64,
                frames: frames as u64,
            })
        }
    }

    fn mmap_commit(&mut self, offset: u64, frames: u64) -> Result<u64, Errno> {
        unsafe {
            Ok(errno!(alsa::snd_pcm_mmap_commit(
                self.handle.as_ptr(),
                offset as alsa::snd_pcm_uframes_t,
                frames as alsa::snd_pcm_uframes_t
            ))? as u64)
        }
    }

    fn readi(&mut self, buf: &mut [u8], frames: u64) -> Result<u64, Errno> {
        let frames = frames.min(buf.len() as u64 / self.frame_size);

        unsafe {
            Ok(errno!(alsa::snd_pcm_readi(
                self.handle.as_ptr(),
                buf.as_mut_ptr() as *mut c::c_void,
                frames as alsa::snd_pcm_uframes_t
            ))? as u64)
        }
    }

    fn recover(&mut self, err: Errno) -> Result<(), Errno> {
        unsafe {
            errno!(alsa::snd_pcm_recover(
                self.handle.as_ptr(),
                -err.raw(),
                1
            ))?;
            Ok(())
        }
    }

    fn pollfds(&mut self) -> Result<Vec<PollFd>, Errno> {
        unsafe {
            let count = alsa::snd_pcm_poll_descriptors_count(self.handle.as_ptr());

            if count < 0 {
                return Err(Errno::from_i32(-count));
            }

            let mut fds = vec![
                c::pollfd {
                    fd: -1,
                    events: 0,
                    revents: 0,
                };
                count as usize
            ];

            let result = errno!(alsa::snd_pcm_poll_descriptors(
                self.handle.as_ptr(),
                fds.as_mut_ptr(),
                fds.len() as c::c_uint
            ))?;

            fds.truncate(result as usize);

            Ok(fds
                .into_iter()
                .map(|fd| PollFd::new(fd.fd, PollFlags::from_bits_truncate(fd.events)))
                .collect())
        }
    }

    fn revents(&mut self, fds: &mut [PollFd]) -> Result<PollFlags, Errno> {
        unsafe {
            let mut revents = mem::MaybeUninit::uninit();

            // NB: PollFd is `#[repr(transparent)]` around pollfd.
            errno!(alsa::snd_pcm_poll_descriptors_revents(
                self.handle.as_ptr(),
                fds.as_mut_ptr() as *mut c::pollfd,
                fds.len() as c::c_uint,
                revents.as_mut_ptr()
            ))?;

            Ok(PollFlags::from_bits_truncate(
                revents.assume_init() as c::c_short
            ))
        }
    }
}

/// Opens ALSA capture devices and negotiates hardware parameters.
#[derive(Debug, Default)]
pub struct AlsaOpener;

impl AlsaOpener {
    /// Construct an opener.
    pub fn new() -> Self {
        Self
    }
}

impl PcmOpener for AlsaOpener {
    fn open(
        &mut self,
        device: &str,
        requested: &HwParams,
        exact: bool,
    ) -> Result<(Box<dyn CapturePcm>, HwParams), OpenError> {
        let cdev = CString::new(device).map_err(|_| OpenError::Device {
            device: device.to_owned(),
            source: Errno::from_i32(libc::EINVAL),
        })?;

        unsafe {
            if exact {
                // The device may have been redefined while we were
                // suspended.
                alsa::snd_config_update_free_global();
            }

            let mut handle = mem::MaybeUninit::uninit();

            errno!(alsa::snd_pcm_open(
                handle.as_mut_ptr(),
                cdev.as_ptr(),
                alsa::SND_PCM_STREAM_CAPTURE,
                SND_PCM_NO_AUTO_RESAMPLE | SND_PCM_NO_AUTO_CHANNELS | SND_PCM_NO_AUTO_FORMAT
            ))
            .map_err(|source| OpenError::Device {
                device: device.to_owned(),
                source,
            })?;

            let handle = ptr::NonNull::new_unchecked(handle.assume_init());

            match negotiate(handle, requested, exact) {
                Ok(granted) => {
                    let name = alsa::snd_pcm_name(handle.as_ptr());
                    let device_name = if name.is_null() {
                        device.to_owned()
                    } else {
                        CStr::from_ptr(name).to_string_lossy().into_owned()
                    };

                    let pcm = AlsaPcm {
                        handle,
                        device_name,
                        frame_size: granted.sample_spec.frame_size() as u64,
                    };

                    Ok((Box::new(pcm), granted))
                }
                Err(e) => {
                    alsa::snd_pcm_close(handle.as_ptr());
                    Err(e)
                }
            }
        }
    }
}

/// Install hardware parameters as close to `requested` as the device
/// allows, downgrading mmap when unsupported.
unsafe fn negotiate(
    handle: ptr::NonNull<alsa::snd_pcm_t>,
    requested: &HwParams,
    exact: bool,
) -> Result<HwParams, OpenError> {
    let pcm = handle.as_ptr();
    let ss = requested.sample_spec;

    let mut params = mem::MaybeUninit::uninit();
    errno!(alsa::snd_pcm_hw_params_malloc(params.as_mut_ptr())).map_err(OpenError::HwParams)?;
    let params = params.assume_init();

    let result = (|| {
        errno!(alsa::snd_pcm_hw_params_any(pcm, params)).map_err(OpenError::HwParams)?;

        let mut use_mmap = requested.use_mmap;

        if use_mmap {
            if errno!(alsa::snd_pcm_hw_params_set_access(
                pcm,
                params,
                alsa::SND_PCM_ACCESS_MMAP_INTERLEAVED
            ))
            .is_err()
            {
                if exact {
                    return Err(OpenError::HwParams(Errno::from_i32(libc::EINVAL)));
                }
                use_mmap = false;
            }
        }

        if !use_mmap {
            errno!(alsa::snd_pcm_hw_params_set_access(
                pcm,
                params,
                alsa::SND_PCM_ACCESS_RW_INTERLEAVED
            ))
            .map_err(OpenError::HwParams)?;
        }

        errno!(alsa::snd_pcm_hw_params_set_format(
            pcm,
            params,
            format_to_alsa(ss.format)
        ))
        .map_err(|_| OpenError::UnsupportedSpec)?;

        errno!(alsa::snd_pcm_hw_params_set_channels(
            pcm,
            params,
            ss.channels as c::c_uint
        ))
        .map_err(|_| OpenError::UnsupportedSpec)?;

        let mut rate = ss.rate as c::c_uint;
        let mut dir: c::c_int = 0;
        errno!(alsa::snd_pcm_hw_params_set_rate_near(
            pcm, params, &mut rate, &mut dir
        ))
        .map_err(|_| OpenError::UnsupportedSpec)?;

        if exact && rate != ss.rate {
            return Err(OpenError::UnsupportedSpec);
        }

        let mut period = requested.period_frames as alsa::snd_pcm_uframes_t;
        let mut dir: c::c_int = 0;
        errno!(alsa::snd_pcm_hw_params_set_period_size_near(
            pcm, params, &mut period, &mut dir
        ))
        .map_err(OpenError::HwParams)?;

        let mut periods = requested.nfragments as c::c_uint;
        let mut dir: c::c_int = 0;
        errno!(alsa::snd_pcm_hw_params_set_periods_near(
            pcm, params, &mut periods, &mut dir
        ))
        .map_err(OpenError::HwParams)?;

        errno!(alsa::snd_pcm_hw_params(pcm, params)).map_err(OpenError::HwParams)?;

        // Read back what the device actually granted.
        let mut period = mem::MaybeUninit::uninit();
        let mut dir: c::c_int = 0;
        errno!(alsa::snd_pcm_hw_params_get_period_size(
            params,
            period.as_mut_ptr(),
            &mut dir
        ))
        .map_err(OpenError::HwParams)?;
        let period = period.assume_init();

        let mut periods = mem::MaybeUninit::uninit();
        let mut dir: c::c_int = 0;
        errno!(alsa::snd_pcm_hw_params_get_periods(
            params,
            periods.as_mut_ptr(),
            &mut dir
        ))
        .map_err(OpenError::HwParams)?;
        let periods = periods.assume_init();

        let granted_ss = SampleSpec {
            format: ss.format,
            rate,
            channels: ss.channels,
        };

        Ok(HwParams {
            sample_spec: granted_ss,
            nfragments: periods,
            period_frames: period as u64,
            use_mmap,
            use_tsched: requested.use_tsched && use_mmap,
        })
    })();

    alsa::snd_pcm_hw_params_free(params);
    result
}
