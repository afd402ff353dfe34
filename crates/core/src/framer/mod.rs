//! Codec framers: state machines that turn a byte stream into timestamped units.
//!
//! | Framer | Module | Sync pattern | Unit |
//! |--------|--------|--------------|------|
//! | MPEG-1/2 video | [`mpeg_video`] | `00 00 01 xx` | sequence header, GOP header, slice |
//! | MPEG-4 video | [`mpeg4_video`] | `00 00 01 xx` | configuration headers, VOP |
//! | H.264 video | [`h264`] | `00 00 01` | NAL unit |
//! | AC-3 audio | [`ac3`] | `0B 77` | syncframe |
//! | MPEG audio | [`mpeg_audio`] | 11 set bits | frame |
//! | MP3 ADU | [`mp3_adu`] | (MPEG audio frames) | ADU |
//! | DV video | [`dv`] | 80-byte DIF blocks | frame |
//! | Transport Stream | [`ts`] | `0x47` every 188 bytes | packet group |

pub mod ac3;
pub mod dv;
pub mod h264;
pub mod mp3_adu;
pub mod mpeg4_video;
pub mod mpeg_audio;
pub mod mpeg_video;
pub mod ts;

pub use ac3::Ac3Framer;
pub use dv::DvFramer;
pub use h264::{FuaFragmenter, H264Framer};
pub use mp3_adu::Mp3AduFramer;
pub use mpeg4_video::Mpeg4VideoFramer;
pub use mpeg_audio::MpegAudioFramer;
pub use mpeg_video::Mpeg12VideoFramer;
pub use ts::TsFramer;

use std::time::Duration;

use crate::error::Result;
use crate::frame::{Frame, Pull, frames_to_micros};
use crate::parser::{Interrupt, Parse};

/// Map a parse outcome onto the pull protocol, latching closure.
pub(crate) fn into_pull(parsed: Parse<Frame>, ended: &mut bool) -> Result<Pull> {
    match parsed {
        Ok(frame) => Ok(Pull::Frame(frame)),
        Err(Interrupt::Pending) => Ok(Pull::Pending),
        Err(Interrupt::Closed) => {
            *ended = true;
            Ok(Pull::Closed)
        }
        Err(Interrupt::Failed(e)) => {
            *ended = true;
            Err(e)
        }
    }
}

/// SMPTE-style time code carried in MPEG-1/2 GOP headers and MPEG-4 GOV headers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeCode {
    pub days: u32,
    pub hours: u8,
    pub minutes: u8,
    pub seconds: u8,
    pub pictures: u8,
}

impl TimeCode {
    pub fn total_seconds(&self) -> u64 {
        ((u64::from(self.days) * 24 + u64::from(self.hours)) * 60 + u64::from(self.minutes)) * 60
            + u64::from(self.seconds)
    }
}

/// Presentation clock driven by GOP time codes.
///
/// A picture's time is the GOP time code plus its display position
/// (temporal reference) within the GOP, measured from the first time code
/// seen. Streams that repeat the same time code in every GOP are
/// compensated by counting the pictures delivered since the last GOP.
#[derive(Debug, Default)]
pub struct GopClock {
    current: TimeCode,
    previous: TimeCode,
    have_seen_first: bool,
    tc_secs_base: u64,
    picture_time_base_us: u64,
    pictures_adjustment: u64,
}

impl GopClock {
    pub fn set_time_code(
        &mut self,
        hours: u8,
        minutes: u8,
        seconds: u8,
        pictures: u8,
        pictures_since_last_gop: u64,
        frame_rate: (u32, u32),
    ) {
        let mut days = self.current.days;
        if self.have_seen_first && hours < self.current.hours {
            days += 1;
        }
        self.current = TimeCode {
            days,
            hours,
            minutes,
            seconds,
            pictures,
        };

        if !self.have_seen_first {
            self.tc_secs_base = self.current.total_seconds();
            self.picture_time_base_us =
                frames_to_micros(u64::from(pictures), frame_rate.0, frame_rate.1);
            self.previous = self.current;
            self.have_seen_first = true;
        } else if self.current == self.previous {
            tracing::debug!(
                pictures_since_last_gop,
                "GOP time code did not advance; counting pictures instead"
            );
            self.pictures_adjustment += pictures_since_last_gop;
        } else {
            self.previous = self.current;
            self.pictures_adjustment = 0;
        }
    }

    /// Presentation time of a picture `additional_pictures` after the GOP time code.
    pub fn presentation_time(&self, additional_pictures: u64, frame_rate: (u32, u32)) -> Duration {
        let tc_secs = self
            .current
            .total_seconds()
            .saturating_sub(self.tc_secs_base);
        let pictures =
            u64::from(self.current.pictures) + self.pictures_adjustment + additional_pictures;
        let micros = tc_secs * 1_000_000 + frames_to_micros(pictures, frame_rate.0, frame_rate.1);
        Duration::from_micros(micros.saturating_sub(self.picture_time_base_us))
    }
}
