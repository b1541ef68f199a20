use crate::libc as c;
use crate::mixer::{MixerChannel, MixerElement};
use crate::sample::ChannelPosition;
use crate::unix::Errno;
use alsa_sys as alsa;
use std::ffi::CString;
use std::mem;
use std::ptr;

// snd_mixer_selem_channel_id_t values from <alsa/mixer.h>.
const SCHN_FRONT_LEFT: c::c_int = 0;
const SCHN_FRONT_RIGHT: c::c_int = 1;
const SCHN_REAR_LEFT: c::c_int = 2;
const SCHN_REAR_RIGHT: c::c_int = 3;
const SCHN_FRONT_CENTER: c::c_int = 4;
const SCHN_WOOFER: c::c_int = 5;
const SCHN_SIDE_LEFT: c::c_int = 6;
const SCHN_SIDE_RIGHT: c::c_int = 7;
const SCHN_REAR_CENTER: c::c_int = 8;

/// Element names probed for a capture control, in order.
static CAPTURE_ELEMENTS: &[&str] = &["Capture", "Mic"];

fn position_to_channel(pos: ChannelPosition) -> c::c_int {
    match pos {
        ChannelPosition::Mono | ChannelPosition::FrontLeft => SCHN_FRONT_LEFT,
        ChannelPosition::FrontRight => SCHN_FRONT_RIGHT,
        ChannelPosition::FrontCenter => SCHN_FRONT_CENTER,
        ChannelPosition::RearLeft => SCHN_REAR_LEFT,
        ChannelPosition::RearRight => SCHN_REAR_RIGHT,
        ChannelPosition::RearCenter => SCHN_REAR_CENTER,
        ChannelPosition::Lfe => SCHN_WOOFER,
        ChannelPosition::SideLeft => SCHN_SIDE_LEFT,
        ChannelPosition::SideRight => SCHN_SIDE_RIGHT,
    }
}

/// A capture mixer element bound to one card.
///
/// Owns the mixer handle; dropping the element closes it.
pub struct AlsaMixerElement {
    mixer: ptr::NonNull<alsa::snd_mixer_t>,
    elem: ptr::NonNull<alsa::snd_mixer_elem_t>,
}

// Safety: single-owner use only; the element lives on the main thread and
// all methods take `&mut self`.
unsafe impl Send for AlsaMixerElement {}

impl Drop for AlsaMixerElement {
    fn drop(&mut self) {
        unsafe { alsa::snd_mixer_close(self.mixer.as_ptr()) };
    }
}

impl AlsaMixerElement {
    /// Open the mixer of `card` (e.g. `"hw:0"`) and find its capture
    /// element. Returns `Ok(None)` when the card has no usable element.
    pub fn find(card: &str) -> Result<Option<Self>, Errno> {
        let ccard = CString::new(card).map_err(|_| Errno::from_i32(libc::EINVAL))?;

        unsafe {
            let mut mixer = mem::MaybeUninit::uninit();
            errno!(alsa::snd_mixer_open(mixer.as_mut_ptr(), 0))?;
            let mixer = ptr::NonNull::new_unchecked(mixer.assume_init());

            let result = (|| {
                errno!(alsa::snd_mixer_attach(mixer.as_ptr(), ccard.as_ptr()))?;
                errno!(alsa::snd_mixer_selem_register(
                    mixer.as_ptr(),
                    ptr::null_mut(),
                    ptr::null_mut()
                ))?;
                errno!(alsa::snd_mixer_load(mixer.as_ptr()))?;

                for name in CAPTURE_ELEMENTS {
                    if let Some(elem) = find_selem(mixer.as_ptr(), name)? {
                        return Ok(Some(elem));
                    }
                }

                Ok(None)
            })();

            match result {
                Ok(Some(elem)) => Ok(Some(Self { mixer, elem })),
                Ok(None) => {
                    alsa::snd_mixer_close(mixer.as_ptr());
                    Ok(None)
                }
                Err(e) => {
                    alsa::snd_mixer_close(mixer.as_ptr());
                    Err(e)
                }
            }
        }
    }

    fn channel(ch: MixerChannel) -> c::c_int {
        ch.0 as c::c_int
    }
}

unsafe fn find_selem(
    mixer: *mut alsa::snd_mixer_t,
    name: &str,
) -> Result<Option<ptr::NonNull<alsa::snd_mixer_elem_t>>, Errno> {
    let cname = CString::new(name).map_err(|_| Errno::from_i32(libc::EINVAL))?;

    let mut sid = mem::MaybeUninit::uninit();
    errno!(alsa::snd_mixer_selem_id_malloc(sid.as_mut_ptr()))?;
    let sid = sid.assume_init();

    alsa::snd_mixer_selem_id_set_index(sid, 0);
    alsa::snd_mixer_selem_id_set_name(sid, cname.as_ptr());

    let elem = alsa::snd_mixer_find_selem(mixer, sid);
    alsa::snd_mixer_selem_id_free(sid);

    Ok(ptr::NonNull::new(elem))
}

impl MixerElement for AlsaMixerElement {
    fn has_capture_volume(&self) -> bool {
        unsafe { alsa::snd_mixer_selem_has_capture_volume(self.elem.as_ptr()) > 0 }
    }

    fn capture_volume_range(&mut self) -> Result<(i64, i64), Errno> {
        unsafe {
            let mut min: c::c_long = 0;
            let mut max: c::c_long = 0;
            errno!(alsa::snd_mixer_selem_get_capture_volume_range(
                self.elem.as_ptr(),
                &mut min,
                &mut max
            ))?;
            Ok((min as i64, max as i64))
        }
    }

    fn capture_db_range(&mut self) -> Result<(i64, i64), Errno> {
        unsafe {
            let mut min: c::c_long = 0;
            let mut max: c::c_long = 0;
            errno!(alsa::snd_mixer_selem_get_capture_dB_range(
                self.elem.as_ptr(),
                &mut min,
                &mut max
            ))?;
            Ok((min as i64, max as i64))
        }
    }

    fn capture_volume(&mut self, ch: MixerChannel) -> Result<i64, Errno> {
        unsafe {
            let mut value: c::c_long = 0;
            errno!(alsa::snd_mixer_selem_get_capture_volume(
                self.elem.as_ptr(),
                Self::channel(ch),
                &mut value
            ))?;
            Ok(value as i64)
        }
    }

    fn set_capture_volume(&mut self, ch: MixerChannel, value: i64) -> Result<(), Errno> {
        unsafe {
            errno!(alsa::snd_mixer_selem_set_capture_volume(
                self.elem.as_ptr(),
                Self::channel(ch),
                value as c::c_long
            ))?;
            Ok(())
        }
    }

    fn set_capture_volume_all(&mut self, value: i64) -> Result<(), Errno> {
        unsafe {
            errno!(alsa::snd_mixer_selem_set_capture_volume_all(
                self.elem.as_ptr(),
                value as c::c_long
            ))?;
            Ok(())
        }
    }

    fn capture_db(&mut self, ch: MixerChannel) -> Result<i64, Errno> {
        unsafe {
            let mut value: c::c_long = 0;
            errno!(alsa::snd_mixer_selem_get_capture_dB(
                self.elem.as_ptr(),
                Self::channel(ch),
                &mut value
            ))?;
            Ok(value as i64)
        }
    }

    fn set_capture_db(
        &mut self,
        ch: MixerChannel,
        value: i64,
        round_up: bool,
    ) -> Result<(), Errno> {
        unsafe {
            errno!(alsa::snd_mixer_selem_set_capture_dB(
                self.elem.as_ptr(),
                Self::channel(ch),
                value as c::c_long,
                round_up as c::c_int
            ))?;
            Ok(())
        }
    }

    fn set_capture_db_all(&mut self, value: i64, round_up: bool) -> Result<(), Errno> {
        unsafe {
            errno!(alsa::snd_mixer_selem_set_capture_dB_all(
                self.elem.as_ptr(),
                value as c::c_long,
                round_up as c::c_int
            ))?;
            Ok(())
        }
    }

    fn has_capture_switch(&self) -> bool {
        unsafe { alsa::snd_mixer_selem_has_capture_switch(self.elem.as_ptr()) > 0 }
    }

    fn capture_switch(&mut self) -> Result<bool, Errno> {
        unsafe {
            let mut value: c::c_int = 0;
            errno!(alsa::snd_mixer_selem_get_capture_switch(
                self.elem.as_ptr(),
                SCHN_FRONT_LEFT,
                &mut value
            ))?;
            Ok(value != 0)
        }
    }

    fn set_capture_switch_all(&mut self, on: bool) -> Result<(), Errno> {
        unsafe {
            errno!(alsa::snd_mixer_selem_set_capture_switch_all(
                self.elem.as_ptr(),
                on as c::c_int
            ))?;
            Ok(())
        }
    }

    fn channel_for_position(&self, pos: ChannelPosition) -> Option<MixerChannel> {
        let channel = position_to_channel(pos);

        let has = unsafe {
            alsa::snd_mixer_selem_has_capture_channel(self.elem.as_ptr(), channel) > 0
        };

        if has {
            Some(MixerChannel(channel as u32))
        } else {
            None
        }
    }
}
