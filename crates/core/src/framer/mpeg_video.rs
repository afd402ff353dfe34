//! MPEG-1/2 video elementary stream framer (ISO/IEC 11172-2, 13818-2).
//!
//! Units delivered, one per call:
//!
//! - the video sequence header, with its extensions, user data and any GOP
//!   header that directly follows it;
//! - a GOP header;
//! - each slice, the first slice of a picture carrying the picture header
//!   (and picture extensions) in front of it.
//!
//! ```text
//!  SeekingVsh --VSH--> SeekingGop --GOP--> ParsingPicture --> ParsingSlice --+
//!       ^                  ^  |                 ^                  |  ^      |
//!       |                  |  +----picture------+                  |  +slice-+
//!       +--sequence end----+-------------- GOP / VSH / picture ----+
//! ```

use std::time::Duration;

use super::{GopClock, into_pull};
use crate::config::VideoFramerConfig;
use crate::error::Result;
use crate::frame::{Frame, FrameBuffer, FrameSource, FrameTag, PictureType, Pull, frames_to_micros};
use crate::parser::{BitReader, Interrupt, Parse, StreamParser};
use crate::source::ByteSource;

pub const PICTURE_START_CODE: u32 = 0x0000_0100;
pub const USER_DATA_START_CODE: u32 = 0x0000_01B2;
pub const SEQUENCE_HEADER_CODE: u32 = 0x0000_01B3;
pub const EXTENSION_START_CODE: u32 = 0x0000_01B5;
pub const SEQUENCE_END_CODE: u32 = 0x0000_01B7;
pub const GOP_START_CODE: u32 = 0x0000_01B8;

/// Frame rates indexed by the 4-bit `frame_rate_code`, as numerator/denominator.
pub const FRAME_RATES: [(u32, u32); 9] = [
    (0, 1),
    (24000, 1001),
    (24, 1),
    (25, 1),
    (30000, 1001),
    (30, 1),
    (50, 1),
    (60000, 1001),
    (60, 1),
];

pub fn is_slice_start_code(code: u32) -> bool {
    (0x0000_0101..=0x0000_01AF).contains(&code)
}

fn frame_rate_for(code: u8, extension: (u32, u32)) -> (u32, u32) {
    let (num, den) = FRAME_RATES
        .get(usize::from(code))
        .copied()
        .unwrap_or((0, 1));
    (num * extension.0, den * extension.1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    SeekingVsh,
    SeekingGop,
    ParsingPicture,
    ParsingSlice,
}

fn state_after(code: u32) -> ParseState {
    match code {
        SEQUENCE_HEADER_CODE | SEQUENCE_END_CODE => ParseState::SeekingVsh,
        PICTURE_START_CODE => ParseState::ParsingPicture,
        c if is_slice_start_code(c) => ParseState::ParsingSlice,
        _ => ParseState::SeekingGop,
    }
}

#[derive(Debug, Clone, Copy)]
struct PictureInfo {
    coding_type: PictureType,
    temporal_reference: u16,
    presentation_time: Duration,
}

#[derive(Clone, Copy)]
struct GopTimeCode {
    hours: u8,
    minutes: u8,
    seconds: u8,
    pictures: u8,
}

fn parse_gop_time_code(bytes: &[u8]) -> Option<GopTimeCode> {
    let mut r = BitReader::new(bytes);
    let _drop_frame = r.read_bit()?;
    let hours = r.read_bits(5)? as u8;
    let minutes = r.read_bits(6)? as u8;
    let _marker = r.read_bit()?;
    let seconds = r.read_bits(6)? as u8;
    let pictures = r.read_bits(6)? as u8;
    Some(GopTimeCode {
        hours,
        minutes,
        seconds,
        pictures,
    })
}

/// Frame-rate extension factors from an MPEG-2 sequence extension, if `bytes` is one.
fn parse_sequence_extension(bytes: &[u8]) -> Option<(u32, u32)> {
    let mut r = BitReader::new(bytes);
    if r.read_bits(4)? != 1 {
        return None;
    }
    // profile_and_level .. low_delay
    r.skip_bits(8 + 1 + 2 + 2 + 2 + 12 + 1 + 8 + 1)?;
    let n = r.read_bits(2)?;
    let d = r.read_bits(5)?;
    Some((n + 1, d + 1))
}

/// MPEG-1/2 video framer.
pub struct Mpeg12VideoFramer<S> {
    parser: StreamParser<S>,
    config: VideoFramerConfig,
    state: ParseState,
    out: FrameBuffer,
    frame_rate: (u32, u32),
    clock: GopClock,
    picture: Option<PictureInfo>,
    skipping_picture: bool,
    pictures_since_last_gop: u64,
    picture_count: u64,
    saved_vsh: Vec<u8>,
    last_vsh_time: Option<Duration>,
    last_presentation_time: Duration,
    ended: bool,
}

impl<S: ByteSource> Mpeg12VideoFramer<S> {
    pub fn new(source: S) -> Self {
        Self::with_config(source, VideoFramerConfig::default())
    }

    pub fn with_config(source: S, config: VideoFramerConfig) -> Self {
        Self {
            parser: StreamParser::new(source),
            config,
            state: ParseState::SeekingVsh,
            out: FrameBuffer::default(),
            frame_rate: (0, 1),
            clock: GopClock::default(),
            picture: None,
            skipping_picture: false,
            pictures_since_last_gop: 0,
            picture_count: 0,
            saved_vsh: Vec::new(),
            last_vsh_time: None,
            last_presentation_time: Duration::ZERO,
            ended: false,
        }
    }

    /// Frame rate from the most recent sequence header, as numerator/denominator.
    pub fn frame_rate(&self) -> (u32, u32) {
        self.frame_rate
    }

    /// Number of complete pictures parsed so far, delivered or skipped.
    pub fn picture_count(&self) -> u64 {
        self.picture_count
    }

    fn frame_duration(&self) -> Duration {
        Duration::from_micros(frames_to_micros(1, self.frame_rate.0, self.frame_rate.1))
    }

    fn parse(&mut self, max_size: usize) -> Parse<Frame> {
        loop {
            self.parser.save_parser_state();
            self.out.reset(max_size);
            let unit = match self.state {
                ParseState::SeekingVsh => self.parse_video_sequence_header()?,
                ParseState::SeekingGop => self.parse_gop_header()?,
                ParseState::ParsingPicture => self.parse_picture_header()?,
                ParseState::ParsingSlice => self.parse_slice()?,
            };
            if let Some(frame) = unit {
                return Ok(frame);
            }
        }
    }

    /// Save the start code in front of the parser plus everything up to the next one.
    fn save_unit(&mut self, code: u32) -> Parse<u32> {
        self.parser.skip_bytes(4)?;
        self.out.save_4_bytes(code);
        self.parser.save_to_next_start_code(&mut self.out)
    }

    /// [`save_unit`](Self::save_unit) for a unit following the sequence
    /// header, noting a header cut short by the end of the stream.
    fn save_header_unit(&mut self, code: u32) -> Parse<u32> {
        match self.save_unit(code) {
            Err(Interrupt::Closed) => {
                tracing::debug!(
                    code = format_args!("{code:#010x}"),
                    saved = self.out.len(),
                    "stream ended inside the video sequence header; header dropped"
                );
                Err(Interrupt::Closed)
            }
            other => other,
        }
    }

    fn parse_video_sequence_header(&mut self) -> Parse<Option<Frame>> {
        let code = self.parser.skip_to_next_start_code()?;
        if code != SEQUENCE_HEADER_CODE {
            self.parser.skip_bytes(4)?;
            return Ok(None);
        }
        let rate_code = {
            let b = self.parser.test_bytes(8)?;
            b[7] & 0x0F
        };
        let mut next = self.save_unit(code)?;

        let mut rate_extension = (1, 1);
        while next == EXTENSION_START_CODE || next == USER_DATA_START_CODE {
            if next == EXTENSION_START_CODE {
                let b = self.parser.test_bytes(10)?;
                if let Some(ext) = parse_sequence_extension(&b[4..]) {
                    rate_extension = ext;
                }
            }
            next = self.save_header_unit(next)?;
        }
        let vsh = self.out.data().to_vec();

        let mut gop = None;
        if next == GOP_START_CODE {
            gop = {
                let b = self.parser.test_bytes(8)?;
                parse_gop_time_code(&b[4..])
            };
            next = self.save_header_unit(next)?;
        }

        self.frame_rate = frame_rate_for(rate_code, rate_extension);
        if self.frame_rate.0 == 0 {
            tracing::warn!(rate_code, "invalid frame_rate_code in video sequence header");
        }
        self.saved_vsh = vsh;
        if let Some(tc) = gop {
            self.clock.set_time_code(
                tc.hours,
                tc.minutes,
                tc.seconds,
                tc.pictures,
                self.pictures_since_last_gop,
                self.frame_rate,
            );
            self.pictures_since_last_gop = 0;
        }
        self.state = state_after(next);
        let pts = self.clock.presentation_time(0, self.frame_rate);
        self.last_vsh_time = Some(pts);
        tracing::debug!(
            rate_num = self.frame_rate.0,
            rate_den = self.frame_rate.1,
            with_gop = gop.is_some(),
            "video sequence header"
        );
        Ok(Some(self.out.take_frame(
            pts,
            Duration::ZERO,
            FrameTag::SequenceHeader,
        )))
    }

    fn parse_gop_header(&mut self) -> Parse<Option<Frame>> {
        let code = self.parser.skip_to_next_start_code()?;
        match code {
            GOP_START_CODE => {}
            SEQUENCE_HEADER_CODE | PICTURE_START_CODE => {
                self.state = state_after(code);
                return Ok(None);
            }
            SEQUENCE_END_CODE => {
                self.parser.skip_bytes(4)?;
                self.state = ParseState::SeekingVsh;
                return Ok(None);
            }
            _ => {
                self.parser.skip_bytes(4)?;
                return Ok(None);
            }
        }
        let tc = {
            let b = self.parser.test_bytes(8)?;
            parse_gop_time_code(&b[4..])
        };

        let reinsert_vsh = match (self.config.vsh_period, self.last_vsh_time) {
            (Some(period), Some(last)) => {
                !self.saved_vsh.is_empty() && self.last_presentation_time >= last + period
            }
            _ => false,
        };
        if reinsert_vsh {
            self.out.save_bytes(&self.saved_vsh);
        }
        let next = self.save_unit(code)?;

        if let Some(tc) = tc {
            self.clock.set_time_code(
                tc.hours,
                tc.minutes,
                tc.seconds,
                tc.pictures,
                self.pictures_since_last_gop,
                self.frame_rate,
            );
        }
        self.pictures_since_last_gop = 0;
        self.state = state_after(next);
        let pts = self.clock.presentation_time(0, self.frame_rate);
        if reinsert_vsh {
            tracing::trace!("re-inserted video sequence header");
            self.last_vsh_time = Some(pts);
        }
        Ok(Some(self.out.take_frame(
            pts,
            Duration::ZERO,
            FrameTag::GroupHeader,
        )))
    }

    fn parse_picture_header(&mut self) -> Parse<Option<Frame>> {
        let code = self.parser.skip_to_next_start_code()?;
        if code != PICTURE_START_CODE {
            if is_slice_start_code(code) {
                // Slices without a picture header are dropped.
                self.parser.skip_bytes(4)?;
            } else {
                self.state = state_after(code);
            }
            return Ok(None);
        }
        let (temporal_reference, coding_type) = {
            let b = self.parser.test_bytes(6)?;
            (
                (u16::from(b[4]) << 2) | u16::from(b[5] >> 6),
                PictureType::from_mpeg12((b[5] >> 3) & 0x07),
            )
        };
        let mut next = self.save_unit(code)?;
        while next == EXTENSION_START_CODE || next == USER_DATA_START_CODE {
            next = self.save_unit(next)?;
        }

        let picture = PictureInfo {
            coding_type,
            temporal_reference,
            presentation_time: self
                .clock
                .presentation_time(u64::from(temporal_reference), self.frame_rate),
        };
        let after = if is_slice_start_code(next) {
            match self.save_unit(next) {
                Ok(code) => Some(code),
                Err(Interrupt::Closed) => None,
                Err(e) => return Err(e),
            }
        } else {
            Some(next)
        };
        self.picture = Some(picture);
        self.skipping_picture = self.config.iframes_only && coding_type != PictureType::I;
        Ok(self.finish_slice(after))
    }

    fn parse_slice(&mut self) -> Parse<Option<Frame>> {
        let code = self.parser.skip_to_next_start_code()?;
        if !is_slice_start_code(code) {
            self.state = state_after(code);
            return Ok(None);
        }
        if self.picture.is_none() {
            self.parser.skip_bytes(4)?;
            return Ok(None);
        }
        let after = match self.save_unit(code) {
            Ok(code) => Some(code),
            Err(Interrupt::Closed) => None,
            Err(e) => return Err(e),
        };
        Ok(self.finish_slice(after))
    }

    /// Commit a parsed slice. `after` is the start code that follows it, or
    /// `None` when the stream ended inside the slice.
    fn finish_slice(&mut self, after: Option<u32>) -> Option<Frame> {
        let picture = self.picture?;
        let picture_end = !matches!(after, Some(code) if is_slice_start_code(code));
        match after {
            Some(code) if picture_end => self.state = state_after(code),
            Some(_) => self.state = ParseState::ParsingSlice,
            None => self.ended = true,
        }

        let duration = if picture_end {
            self.picture_count += 1;
            self.pictures_since_last_gop += 1;
            self.picture = None;
            self.frame_duration()
        } else {
            Duration::ZERO
        };
        self.last_presentation_time = picture.presentation_time;

        if self.skipping_picture {
            return None;
        }
        Some(self.out.take_frame(
            picture.presentation_time,
            duration,
            FrameTag::Picture {
                coding_type: picture.coding_type,
                temporal_reference: picture.temporal_reference,
                picture_end,
            },
        ))
    }
}

impl<S: ByteSource> FrameSource for Mpeg12VideoFramer<S> {
    fn next_frame(&mut self, max_size: usize) -> Result<Pull> {
        if self.ended {
            return Ok(Pull::Closed);
        }
        let parsed = self.parse(max_size);
        into_pull(parsed, &mut self.ended)
    }

    fn flush_input(&mut self) {
        self.parser.flush_input();
        self.state = ParseState::SeekingVsh;
        self.picture = None;
        self.skipping_picture = false;
        self.ended = false;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::source::MemorySource;

    pub fn vsh(frame_rate_code: u8) -> Vec<u8> {
        // 352x288, aspect 1, bit_rate, marker, vbv, no matrices
        vec![
            0x00, 0x00, 0x01, 0xB3, 0x16, 0x01, 0x20, 0x10 | frame_rate_code, 0xFF, 0xFF, 0xE0,
            0x18,
        ]
    }

    pub fn gop(hours: u8, minutes: u8, seconds: u8, pictures: u8) -> Vec<u8> {
        let tc: u32 = (u32::from(hours) << 19)
            | (u32::from(minutes) << 13)
            | (1 << 12)
            | (u32::from(seconds) << 6)
            | u32::from(pictures);
        // 25-bit time code, closed_gop, broken_link, 5 bits padding
        let word = (tc << 7) | (1 << 6);
        let mut v = vec![0x00, 0x00, 0x01, 0xB8];
        v.extend_from_slice(&word.to_be_bytes());
        v
    }

    pub fn picture(temporal_reference: u16, coding_type: u8, slice_len: usize) -> Vec<u8> {
        let mut v = vec![0x00, 0x00, 0x01, 0x00];
        v.push((temporal_reference >> 2) as u8);
        v.push((((temporal_reference & 0x3) as u8) << 6) | (coding_type << 3));
        v.extend_from_slice(&[0xFF, 0xF8]);
        v.extend_from_slice(&[0x00, 0x00, 0x01, 0x01]);
        v.extend(std::iter::repeat_n(0x5A, slice_len));
        v
    }

    fn collect(framer: &mut Mpeg12VideoFramer<MemorySource>) -> Vec<Frame> {
        let mut frames = Vec::new();
        loop {
            match framer.next_frame(100_000).unwrap() {
                Pull::Frame(f) => frames.push(f),
                Pull::Pending => panic!("complete input should never pend"),
                Pull::Closed => break,
            }
        }
        frames
    }

    fn stream() -> Vec<u8> {
        [
            vsh(3),
            gop(0, 0, 0, 0),
            picture(0, 1, 40),
            picture(1, 2, 20),
            picture(2, 2, 20),
            gop(0, 0, 0, 3),
            picture(0, 1, 40),
        ]
        .concat()
    }

    #[test]
    fn gop_stream_yields_six_units() {
        let mut framer = Mpeg12VideoFramer::new(MemorySource::new(stream()));
        let frames = collect(&mut framer);
        assert_eq!(frames.len(), 6);
        assert_eq!(frames[0].tag, FrameTag::SequenceHeader);
        assert_eq!(frames[4].tag, FrameTag::GroupHeader);
        assert_eq!(framer.frame_rate(), (25, 1));

        let types: Vec<_> = frames
            .iter()
            .filter_map(|f| match f.tag {
                FrameTag::Picture { coding_type, .. } => Some(coding_type),
                _ => None,
            })
            .collect();
        assert_eq!(
            types,
            vec![PictureType::I, PictureType::P, PictureType::P, PictureType::I]
        );

        let times: Vec<_> = [1, 2, 3, 5]
            .iter()
            .map(|&i| frames[i].presentation_time)
            .collect();
        assert_eq!(
            times,
            vec![
                Duration::ZERO,
                Duration::from_millis(40),
                Duration::from_millis(80),
                Duration::from_millis(120),
            ]
        );
        assert_eq!(frames[1].duration, Duration::from_millis(40));
    }

    #[test]
    fn payload_bytes_are_preserved() {
        let mut framer = Mpeg12VideoFramer::new(MemorySource::new(stream()));
        let frames = collect(&mut framer);
        let rebuilt: Vec<u8> = frames.iter().flat_map(|f| f.data.clone()).collect();
        assert_eq!(rebuilt, stream());
    }

    #[test]
    fn b_frames_use_temporal_reference() {
        let data = [
            vsh(3),
            gop(0, 0, 0, 0),
            picture(2, 1, 8),
            picture(0, 3, 8),
            picture(1, 3, 8),
            picture(5, 2, 8),
            picture(3, 3, 8),
            picture(4, 3, 8),
        ]
        .concat();
        let mut framer = Mpeg12VideoFramer::new(MemorySource::new(data));
        let mut times: Vec<_> = collect(&mut framer)
            .into_iter()
            .filter(|f| matches!(f.tag, FrameTag::Picture { .. }))
            .map(|f| f.presentation_time)
            .collect();
        times.sort();
        let expected: Vec<_> = (0..6).map(|i| Duration::from_millis(40 * i)).collect();
        assert_eq!(times, expected);
    }

    #[test]
    fn iframes_only_skips_other_pictures() {
        let config = VideoFramerConfig {
            iframes_only: true,
            ..VideoFramerConfig::default()
        };
        let mut framer = Mpeg12VideoFramer::with_config(MemorySource::new(stream()), config);
        let frames = collect(&mut framer);
        assert_eq!(frames.len(), 4);
        assert_eq!(framer.picture_count(), 4);
    }

    #[test]
    fn multi_slice_picture_marks_end() {
        let mut data = [vsh(5), gop(0, 0, 0, 0), picture(0, 1, 10)].concat();
        data.extend_from_slice(&[0x00, 0x00, 0x01, 0x02, 0x77, 0x77]);
        let mut framer = Mpeg12VideoFramer::new(MemorySource::new(data));
        let frames = collect(&mut framer);
        assert_eq!(frames.len(), 3);
        assert!(matches!(
            frames[1].tag,
            FrameTag::Picture {
                picture_end: false,
                ..
            }
        ));
        assert!(matches!(
            frames[2].tag,
            FrameTag::Picture {
                picture_end: true,
                ..
            }
        ));
        assert_eq!(frames[1].duration, Duration::ZERO);
    }

    #[test]
    fn survives_input_arriving_in_pieces() {
        let data = stream();
        let mut src = MemorySource::live();
        src.push(&data[..7]);
        let mut framer = Mpeg12VideoFramer::new(src);
        assert!(matches!(framer.next_frame(100_000).unwrap(), Pull::Pending));
        let mut frames = Vec::new();
        for chunk in data[7..].chunks(5) {
            framer.parser.source_mut().push(chunk);
            loop {
                match framer.next_frame(100_000).unwrap() {
                    Pull::Frame(f) => frames.push(f),
                    Pull::Pending => break,
                    Pull::Closed => unreachable!(),
                }
            }
        }
        framer.parser.source_mut().close();
        while let Pull::Frame(f) = framer.next_frame(100_000).unwrap() {
            frames.push(f);
        }
        assert_eq!(frames.len(), 6);
        let rebuilt: Vec<u8> = frames.iter().flat_map(|f| f.data.clone()).collect();
        assert_eq!(rebuilt, data);
    }

    #[test]
    fn stream_ending_inside_sequence_extension_closes() {
        let mut data = vsh(3);
        // sequence extension cut off before the next start code
        data.extend_from_slice(&[0x00, 0x00, 0x01, 0xB5, 0x14, 0x8A, 0x00, 0x01, 0x80, 0x00]);
        let mut framer = Mpeg12VideoFramer::new(MemorySource::new(data));
        assert!(collect(&mut framer).is_empty());
        assert!(matches!(framer.next_frame(1000).unwrap(), Pull::Closed));
    }

    #[test]
    fn small_buffer_truncates() {
        let mut framer = Mpeg12VideoFramer::new(MemorySource::new(stream()));
        let first = match framer.next_frame(8).unwrap() {
            Pull::Frame(f) => f,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(first.size(), 8);
        assert_eq!(first.truncated, 12 + 8 - 8);
    }

    #[test]
    fn periodic_vsh_reinsertion() {
        let config = VideoFramerConfig {
            vsh_period: Some(Duration::from_millis(50)),
            ..VideoFramerConfig::default()
        };
        let data = stream();
        let mut framer = Mpeg12VideoFramer::with_config(MemorySource::new(data), config);
        let frames = collect(&mut framer);
        // the last picture before the second GOP is 80ms after the VSH
        assert!(frames[4].data.starts_with(&vsh(3)));
        assert!(frames[4].data.ends_with(&gop(0, 0, 0, 3)));
    }
}
