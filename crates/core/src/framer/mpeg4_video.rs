//! MPEG-4 Part 2 video elementary stream framer (ISO/IEC 14496-2).
//!
//! The configuration headers (Visual Object Sequence through Video Object
//! Layer) are delivered as one unit and kept for the `config` SDP parameter.
//! A Group of VOP header is delivered together with the VOP that follows it;
//! every other VOP is a unit of its own.

use std::time::Duration;

use super::into_pull;
use crate::config::VideoFramerConfig;
use crate::error::Result;
use crate::frame::{Frame, FrameBuffer, FrameSource, FrameTag, Mpeg4Config, PictureType, Pull};
use crate::parser::{BitReader, Interrupt, Parse, StreamParser};
use crate::source::ByteSource;

pub const VISUAL_OBJECT_SEQUENCE_START_CODE: u32 = 0x0000_01B0;
pub const VISUAL_OBJECT_SEQUENCE_END_CODE: u32 = 0x0000_01B1;
pub const USER_DATA_START_CODE: u32 = 0x0000_01B2;
pub const GROUP_VOP_START_CODE: u32 = 0x0000_01B3;
pub const VISUAL_OBJECT_START_CODE: u32 = 0x0000_01B5;
pub const VOP_START_CODE: u32 = 0x0000_01B6;

fn is_video_object_start_code(code: u32) -> bool {
    (0x0000_0100..=0x0000_011F).contains(&code)
}

fn is_vol_start_code(code: u32) -> bool {
    (0x0000_0120..=0x0000_012F).contains(&code)
}

fn is_config_code(code: u32) -> bool {
    code == VISUAL_OBJECT_SEQUENCE_START_CODE
        || code == VISUAL_OBJECT_START_CODE
        || code == USER_DATA_START_CODE
        || is_video_object_start_code(code)
        || is_vol_start_code(code)
}

/// Timing fields of a Video Object Layer header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct VolTiming {
    resolution: u32,
    fixed_increment: Option<u32>,
}

/// Width of the `vop_time_increment` field for a given resolution.
fn increment_bits(resolution: u32) -> u32 {
    (32 - resolution.saturating_sub(1).leading_zeros()).max(1)
}

fn parse_vol(bytes: &[u8]) -> Option<VolTiming> {
    let mut r = BitReader::new(bytes);
    r.skip_bits(1 + 8)?; // random_accessible_vol, video_object_type_indication
    let mut verid = 1;
    if r.read_bit()? {
        verid = r.read_bits(4)?;
        r.skip_bits(3)?;
    }
    if r.read_bits(4)? == 0xF {
        r.skip_bits(16)?; // extended PAR
    }
    if r.read_bit()? {
        r.skip_bits(2 + 1)?; // chroma_format, low_delay
        if r.read_bit()? {
            r.skip_bits(79)?; // vbv_parameters
        }
    }
    let shape = r.read_bits(2)?;
    if shape == 3 && verid != 1 {
        r.skip_bits(4)?;
    }
    r.skip_bits(1)?;
    let resolution = r.read_bits(16)?;
    if resolution == 0 {
        return None;
    }
    r.skip_bits(1)?;
    let fixed_increment = if r.read_bit()? {
        Some(r.read_bits(increment_bits(resolution))?)
    } else {
        None
    };
    Some(VolTiming {
        resolution,
        fixed_increment,
    })
}

#[derive(Debug, Clone, Copy)]
struct VopHeader {
    coding_type: PictureType,
    modulo_time_base: u64,
    time_increment: u64,
}

fn parse_vop(bytes: &[u8], resolution: u32) -> Option<VopHeader> {
    let mut r = BitReader::new(bytes);
    let coding_type = PictureType::from_mpeg4(r.read_bits(2)? as u8);
    let mut modulo_time_base = 0;
    while r.read_bit()? {
        modulo_time_base += 1;
    }
    r.skip_bits(1)?;
    let time_increment = if resolution > 0 {
        u64::from(r.read_bits(increment_bits(resolution))?)
    } else {
        0
    };
    Some(VopHeader {
        coding_type,
        modulo_time_base,
        time_increment,
    })
}

/// GOV time code as whole seconds.
fn parse_gov_seconds(bytes: &[u8]) -> Option<u64> {
    let mut r = BitReader::new(bytes);
    let hours = u64::from(r.read_bits(5)?);
    let minutes = u64::from(r.read_bits(6)?);
    r.skip_bits(1)?;
    let seconds = u64::from(r.read_bits(6)?);
    Some((hours * 60 + minutes) * 60 + seconds)
}

fn ticks_to_duration(ticks: u64, resolution: u32) -> Duration {
    if resolution == 0 {
        return Duration::ZERO;
    }
    Duration::from_micros(((u128::from(ticks) * 1_000_000) / u128::from(resolution)) as u64)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    SeekingConfig,
    SeekingVop,
}

fn state_after(code: u32) -> ParseState {
    if (is_config_code(code) && code != USER_DATA_START_CODE) || code == VISUAL_OBJECT_SEQUENCE_END_CODE {
        ParseState::SeekingConfig
    } else {
        ParseState::SeekingVop
    }
}

/// Presentation clock driven by GOV time codes and VOP time increments.
#[derive(Debug, Default)]
struct VopClock {
    timing: Option<VolTiming>,
    first_time_code: Option<u64>,
    time_code_offset: Duration,
    /// Time base (whole seconds since the time code) of the latest I/P VOP.
    seconds_base: u64,
    /// Time base of the I/P VOP before it, which B-VOPs are relative to.
    prev_seconds_base: u64,
    prev_non_b_ticks: Option<u64>,
    prev_non_b_time: Duration,
    last_delta_ticks: u64,
    last_time_code: Option<u64>,
    /// Added to the time code while GOVs keep repeating it.
    time_code_adjustment: Duration,
}

impl VopClock {
    fn set_time_code(&mut self, seconds: u64) {
        let first = *self.first_time_code.get_or_insert(seconds);
        let base = Duration::from_secs(seconds.saturating_sub(first));
        if self.last_time_code == Some(seconds) {
            if let (Some(timing), Some(_)) = (self.timing, self.prev_non_b_ticks) {
                let step = timing
                    .fixed_increment
                    .map_or(self.last_delta_ticks, u64::from)
                    .max(1);
                let next = self.prev_non_b_time + ticks_to_duration(step, timing.resolution);
                self.time_code_adjustment = next.saturating_sub(base);
                tracing::debug!(
                    seconds,
                    adjustment_ms = self.time_code_adjustment.as_millis() as u64,
                    "GOV time code did not advance; continuing from the last VOP"
                );
            }
        } else {
            self.last_time_code = Some(seconds);
            self.time_code_adjustment = Duration::ZERO;
        }
        self.time_code_offset = base + self.time_code_adjustment;
        self.seconds_base = 0;
        self.prev_seconds_base = 0;
        self.prev_non_b_ticks = None;
    }

    /// Presentation time and duration of a VOP.
    fn stamp(&mut self, vop: &VopHeader) -> (Duration, Duration) {
        let Some(timing) = self.timing else {
            return (self.prev_non_b_time, Duration::ZERO);
        };
        let res = u64::from(timing.resolution);
        let time = if vop.coding_type == PictureType::B {
            let ticks = (self.prev_seconds_base + vop.modulo_time_base) * res + vop.time_increment;
            let latest = self.prev_non_b_ticks.unwrap_or(0);
            let delta = latest.saturating_sub(ticks);
            self.prev_non_b_time
                .saturating_sub(ticks_to_duration(delta, timing.resolution))
        } else {
            let mut ticks = (self.seconds_base + vop.modulo_time_base) * res + vop.time_increment;
            if let Some(prev) = self.prev_non_b_ticks {
                if ticks <= prev {
                    let advance = u64::from(timing.fixed_increment.unwrap_or(1).max(1));
                    tracing::warn!(
                        ticks,
                        prev,
                        advance,
                        "VOP time increment did not advance; assuming minimal advance"
                    );
                    ticks = prev + advance;
                }
                self.last_delta_ticks = ticks - prev;
            }
            self.prev_seconds_base = self.seconds_base;
            self.seconds_base = ticks / res;
            self.prev_non_b_ticks = Some(ticks);
            self.prev_non_b_time = self.time_code_offset + ticks_to_duration(ticks, timing.resolution);
            self.prev_non_b_time
        };
        let duration = match timing.fixed_increment {
            Some(inc) => ticks_to_duration(u64::from(inc), timing.resolution),
            None => ticks_to_duration(self.last_delta_ticks, timing.resolution),
        };
        (time, duration)
    }
}

/// MPEG-4 Part 2 video framer.
pub struct Mpeg4VideoFramer<S> {
    parser: StreamParser<S>,
    config: VideoFramerConfig,
    state: ParseState,
    out: FrameBuffer,
    clock: VopClock,
    profile_and_level_indication: u8,
    saved_config: Vec<u8>,
    last_config_time: Option<Duration>,
    last_presentation_time: Duration,
    vop_count: u64,
    ended: bool,
}

impl<S: ByteSource> Mpeg4VideoFramer<S> {
    pub fn new(source: S) -> Self {
        Self::with_config(source, VideoFramerConfig::default())
    }

    pub fn with_config(source: S, config: VideoFramerConfig) -> Self {
        Self {
            parser: StreamParser::new(source),
            config,
            state: ParseState::SeekingConfig,
            out: FrameBuffer::default(),
            clock: VopClock::default(),
            // RFC 3016 default: Simple Profile/Level 1
            profile_and_level_indication: 1,
            saved_config: Vec::new(),
            last_config_time: None,
            last_presentation_time: Duration::ZERO,
            vop_count: 0,
            ended: false,
        }
    }

    /// `vop_time_increment_resolution` from the latest VOL header.
    pub fn time_increment_resolution(&self) -> Option<u32> {
        self.clock.timing.map(|t| t.resolution)
    }

    pub fn vop_count(&self) -> u64 {
        self.vop_count
    }

    fn parse(&mut self, max_size: usize) -> Parse<Frame> {
        loop {
            self.parser.save_parser_state();
            self.out.reset(max_size);
            let unit = match self.state {
                ParseState::SeekingConfig => self.parse_config()?,
                ParseState::SeekingVop => self.parse_vop_unit()?,
            };
            if let Some(frame) = unit {
                return Ok(frame);
            }
        }
    }

    fn save_unit(&mut self, code: u32) -> Parse<u32> {
        self.parser.skip_bytes(4)?;
        self.out.save_4_bytes(code);
        self.parser.save_to_next_start_code(&mut self.out)
    }

    fn parse_config(&mut self) -> Parse<Option<Frame>> {
        let code = self.parser.skip_to_next_start_code()?;
        if code == GROUP_VOP_START_CODE || code == VOP_START_CODE {
            if self.clock.timing.is_some() {
                self.state = ParseState::SeekingVop;
            } else {
                self.parser.skip_bytes(4)?;
            }
            return Ok(None);
        }
        if !is_config_code(code) || code == USER_DATA_START_CODE {
            self.parser.skip_bytes(4)?;
            return Ok(None);
        }

        let mut profile = None;
        let mut vol_offset = None;
        let mut next = code;
        while is_config_code(next) {
            if next == VISUAL_OBJECT_SEQUENCE_START_CODE {
                profile = Some(self.parser.test_bytes(5)?[4]);
            }
            if is_vol_start_code(next) {
                vol_offset = Some(self.out.len());
            }
            next = self.save_unit(next)?;
        }

        let timing = vol_offset.and_then(|at| parse_vol(self.out.data().get(at + 4..)?));
        match timing {
            Some(t) => self.clock.timing = Some(t),
            None => tracing::warn!("configuration headers without a usable VOL header"),
        }
        if let Some(p) = profile {
            self.profile_and_level_indication = p;
        }
        self.saved_config = self.out.data().to_vec();
        self.state = state_after(next);
        self.last_config_time = Some(self.last_presentation_time);
        tracing::debug!(
            profile_and_level_indication = self.profile_and_level_indication,
            resolution = ?self.time_increment_resolution(),
            bytes = self.saved_config.len(),
            "MPEG-4 configuration headers"
        );
        Ok(Some(self.out.take_frame(
            self.last_presentation_time,
            Duration::ZERO,
            FrameTag::SequenceHeader,
        )))
    }

    fn parse_vop_unit(&mut self) -> Parse<Option<Frame>> {
        let code = self.parser.skip_to_next_start_code()?;
        if code != GROUP_VOP_START_CODE && code != VOP_START_CODE {
            if state_after(code) == ParseState::SeekingConfig {
                self.state = ParseState::SeekingConfig;
            } else {
                self.parser.skip_bytes(4)?;
            }
            return Ok(None);
        }

        let mut time_code = None;
        let mut reinsert_config = false;
        let mut next = code;
        if code == GROUP_VOP_START_CODE {
            time_code = parse_gov_seconds(&self.parser.test_bytes(7)?[4..]);
            reinsert_config = match (self.config.vsh_period, self.last_config_time) {
                (Some(period), Some(last)) => {
                    !self.saved_config.is_empty() && self.last_presentation_time >= last + period
                }
                _ => false,
            };
            if reinsert_config {
                self.out.save_bytes(&self.saved_config);
            }
            next = self.save_unit(code)?;
            if next != VOP_START_CODE {
                if let Some(seconds) = time_code {
                    self.clock.set_time_code(seconds);
                }
                self.state = state_after(next);
                return Ok(Some(self.out.take_frame(
                    self.last_presentation_time,
                    Duration::ZERO,
                    FrameTag::GroupHeader,
                )));
            }
        }

        let vop_offset = self.out.len();
        let after = match self.save_unit(next) {
            Ok(code) => Some(code),
            Err(Interrupt::Closed) => None,
            Err(e) => return Err(e),
        };
        let resolution = self.time_increment_resolution().unwrap_or(0);
        let header = self
            .out
            .data()
            .get(vop_offset + 4..)
            .and_then(|bytes| parse_vop(bytes, resolution));

        if let Some(seconds) = time_code {
            self.clock.set_time_code(seconds);
        }
        match after {
            Some(code) => self.state = state_after(code),
            None => self.ended = true,
        }
        let Some(header) = header else {
            tracing::warn!("VOP header truncated; dropping VOP");
            return Ok(None);
        };
        let (presentation_time, duration) = self.clock.stamp(&header);
        self.vop_count += 1;
        self.last_presentation_time = presentation_time;
        if reinsert_config {
            self.last_config_time = Some(presentation_time);
        }
        if self.config.iframes_only && header.coding_type != PictureType::I {
            return Ok(None);
        }
        tracing::trace!(
            coding_type = ?header.coding_type,
            pts_us = presentation_time.as_micros() as u64,
            "VOP"
        );
        Ok(Some(self.out.take_frame(
            presentation_time,
            duration,
            FrameTag::Picture {
                coding_type: header.coding_type,
                temporal_reference: 0,
                picture_end: true,
            },
        )))
    }
}

impl<S: ByteSource> FrameSource for Mpeg4VideoFramer<S> {
    fn next_frame(&mut self, max_size: usize) -> Result<Pull> {
        if self.ended {
            return Ok(Pull::Closed);
        }
        let parsed = self.parse(max_size);
        into_pull(parsed, &mut self.ended)
    }

    fn flush_input(&mut self) {
        self.parser.flush_input();
        self.state = ParseState::SeekingConfig;
        self.ended = false;
    }

    fn mpeg4_config(&self) -> Option<Mpeg4Config> {
        if self.saved_config.is_empty() {
            return None;
        }
        Some(Mpeg4Config {
            profile_and_level_indication: self.profile_and_level_indication,
            config: self.saved_config.clone(),
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::parser::BitWriter;
    use crate::source::MemorySource;

    /// VOS + visual object + video object + VOL with the given time resolution and fixed rate.
    pub fn config_headers(resolution: u32, fixed_increment: u32) -> Vec<u8> {
        let mut v = vec![0x00, 0x00, 0x01, 0xB0, 0x08];
        v.extend_from_slice(&[0x00, 0x00, 0x01, 0xB5, 0x09]);
        v.extend_from_slice(&[0x00, 0x00, 0x01, 0x00]);
        v.extend_from_slice(&[0x00, 0x00, 0x01, 0x20]);
        let mut w = BitWriter::new();
        w.put(1, 0) // random_accessible_vol
            .put(8, 1) // simple object
            .put(1, 0)
            .put(4, 1) // square pixels
            .put(1, 0)
            .put(2, 0) // rectangular
            .put(1, 1)
            .put(16, resolution)
            .put(1, 1)
            .put(1, 1)
            .put(increment_bits(resolution), fixed_increment)
            .put(1, 1)
            .put(13, 176)
            .put(1, 1)
            .put(13, 144)
            .put(1, 1)
            .stuff();
        v.extend(w.into_bytes());
        v
    }

    pub fn gov(seconds: u32) -> Vec<u8> {
        let mut v = vec![0x00, 0x00, 0x01, 0xB3];
        let mut w = BitWriter::new();
        w.put(5, 0).put(6, 0).put(1, 1).put(6, seconds).put(1, 1).put(1, 0).stuff();
        v.extend(w.into_bytes());
        v
    }

    pub fn vop(coding_type: u32, modulo: u32, increment: u32, resolution: u32) -> Vec<u8> {
        let mut v = vec![0x00, 0x00, 0x01, 0xB6];
        let mut w = BitWriter::new();
        w.put(2, coding_type);
        for _ in 0..modulo {
            w.put(1, 1);
        }
        w.put(1, 0)
            .put(1, 1)
            .put(increment_bits(resolution), increment)
            .put(1, 1)
            .put(1, 1)
            .stuff();
        v.extend(w.into_bytes());
        v.extend_from_slice(&[0x5A; 24]);
        v
    }

    fn collect(framer: &mut Mpeg4VideoFramer<MemorySource>) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Pull::Frame(f) = framer.next_frame(100_000).unwrap() {
            frames.push(f);
        }
        frames
    }

    fn stream() -> Vec<u8> {
        [
            config_headers(25, 1),
            gov(0),
            vop(0, 0, 0, 25),
            vop(1, 0, 3, 25),
            vop(2, 0, 1, 25),
            vop(2, 0, 2, 25),
            vop(1, 0, 6, 25),
        ]
        .concat()
    }

    #[test]
    fn vol_timing_fields() {
        let headers = config_headers(30000, 1001);
        let timing = parse_vol(&headers[18..]).unwrap();
        assert_eq!(timing.resolution, 30000);
        assert_eq!(timing.fixed_increment, Some(1001));
        assert_eq!(increment_bits(30000), 15);
        assert_eq!(increment_bits(1), 1);
        assert_eq!(increment_bits(16), 4);
    }

    #[test]
    fn config_and_vops_are_separate_units() {
        let mut framer = Mpeg4VideoFramer::new(MemorySource::new(stream()));
        let frames = collect(&mut framer);
        assert_eq!(frames.len(), 6);
        assert_eq!(frames[0].tag, FrameTag::SequenceHeader);
        assert_eq!(frames[0].data, config_headers(25, 1));
        assert!(frames[1].data.starts_with(&gov(0)));
        assert_eq!(framer.time_increment_resolution(), Some(25));
        assert_eq!(framer.vop_count(), 5);

        let config = framer.mpeg4_config().unwrap();
        assert_eq!(config.profile_and_level_indication, 0x08);
        assert_eq!(config.config, config_headers(25, 1));

        let rebuilt: Vec<u8> = frames.iter().flat_map(|f| f.data.clone()).collect();
        assert_eq!(rebuilt, stream());
    }

    #[test]
    fn b_vops_are_stamped_before_their_reference() {
        let mut framer = Mpeg4VideoFramer::new(MemorySource::new(stream()));
        let times: Vec<_> = collect(&mut framer)
            .iter()
            .skip(1)
            .map(|f| f.presentation_time.as_millis())
            .collect();
        assert_eq!(times, vec![0, 120, 40, 80, 240]);
    }

    #[test]
    fn stalled_time_increment_advances_minimally() {
        let data = [
            config_headers(25, 1),
            gov(0),
            vop(0, 0, 0, 25),
            vop(1, 0, 3, 25),
            vop(1, 0, 3, 25),
        ]
        .concat();
        let mut framer = Mpeg4VideoFramer::new(MemorySource::new(data));
        let frames = collect(&mut framer);
        assert_eq!(frames[3].presentation_time, Duration::from_millis(160));
        assert_eq!(frames[3].duration, Duration::from_millis(40));
    }

    #[test]
    fn repeated_gov_time_code_keeps_time_moving() {
        let data = [
            config_headers(25, 1),
            gov(0),
            vop(0, 0, 0, 25),
            vop(1, 0, 1, 25),
            gov(0),
            vop(0, 0, 0, 25),
            vop(1, 0, 1, 25),
        ]
        .concat();
        let mut framer = Mpeg4VideoFramer::new(MemorySource::new(data));
        let times: Vec<_> = collect(&mut framer)
            .iter()
            .skip(1)
            .map(|f| f.presentation_time.as_millis())
            .collect();
        assert_eq!(times, vec![0, 40, 80, 120]);
    }

    #[test]
    fn modulo_time_base_adds_seconds() {
        let data = [
            config_headers(25, 1),
            gov(0),
            vop(0, 0, 20, 25),
            vop(1, 1, 2, 25),
        ]
        .concat();
        let mut framer = Mpeg4VideoFramer::new(MemorySource::new(data));
        let frames = collect(&mut framer);
        assert_eq!(frames[2].presentation_time, Duration::from_millis(1080));
    }

    #[test]
    fn iframes_only_keeps_intra_vops() {
        let config = VideoFramerConfig {
            iframes_only: true,
            ..VideoFramerConfig::default()
        };
        let mut framer = Mpeg4VideoFramer::with_config(MemorySource::new(stream()), config);
        let frames = collect(&mut framer);
        assert_eq!(frames.len(), 2);
        assert!(matches!(
            frames[1].tag,
            FrameTag::Picture {
                coding_type: PictureType::I,
                ..
            }
        ));
    }
}
