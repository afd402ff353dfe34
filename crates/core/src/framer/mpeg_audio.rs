//! MPEG-1/2/2.5 audio frame framer (ISO/IEC 11172-3, 13818-3), layers I–III.

use std::time::Duration;

use super::into_pull;
use crate::error::Result;
use crate::frame::{Frame, FrameBuffer, FrameSource, FrameTag, Pull};
use crate::parser::{Parse, StreamParser};
use crate::source::ByteSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MpegVersion {
    V1,
    V2,
    V25,
}

const BIT_RATES_V1: [[u32; 15]; 3] = [
    [0, 32, 64, 96, 128, 160, 192, 224, 256, 288, 320, 352, 384, 416, 448],
    [0, 32, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 384],
    [0, 32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320],
];
const BIT_RATES_V2: [[u32; 15]; 2] = [
    [0, 32, 48, 56, 64, 80, 96, 112, 128, 144, 160, 176, 192, 224, 256],
    [0, 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160],
];
const SAMPLE_RATES_V1: [u32; 3] = [44_100, 48_000, 32_000];

/// Decoded 32-bit MPEG audio frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MpegAudioHeader {
    pub version: MpegVersion,
    /// 1, 2 or 3.
    pub layer: u8,
    pub has_crc: bool,
    pub bit_rate_kbps: u32,
    pub sample_rate: u32,
    pub padding: bool,
    /// 0 stereo, 1 joint stereo, 2 dual channel, 3 mono.
    pub channel_mode: u8,
}

impl MpegAudioHeader {
    /// Decode a header word. Free-format and reserved values are rejected.
    pub fn parse(word: u32) -> Option<Self> {
        if word >> 21 != 0x7FF {
            return None;
        }
        let version = match (word >> 19) & 0x3 {
            0 => MpegVersion::V25,
            2 => MpegVersion::V2,
            3 => MpegVersion::V1,
            _ => return None,
        };
        let layer = match (word >> 17) & 0x3 {
            1 => 3,
            2 => 2,
            3 => 1,
            _ => return None,
        };
        let bit_rate_index = ((word >> 12) & 0xF) as usize;
        if bit_rate_index == 0 || bit_rate_index == 15 {
            return None;
        }
        let bit_rate_kbps = match version {
            MpegVersion::V1 => BIT_RATES_V1[usize::from(layer - 1)][bit_rate_index],
            _ => BIT_RATES_V2[usize::from(layer != 1)][bit_rate_index],
        };
        let base_rate = *SAMPLE_RATES_V1.get(((word >> 10) & 0x3) as usize)?;
        let sample_rate = match version {
            MpegVersion::V1 => base_rate,
            MpegVersion::V2 => base_rate / 2,
            MpegVersion::V25 => base_rate / 4,
        };
        Some(Self {
            version,
            layer,
            has_crc: (word >> 16) & 1 == 0,
            bit_rate_kbps,
            sample_rate,
            padding: (word >> 9) & 1 == 1,
            channel_mode: ((word >> 6) & 0x3) as u8,
        })
    }

    pub fn is_mono(&self) -> bool {
        self.channel_mode == 3
    }

    /// Whole frame length in bytes, header included.
    pub fn frame_size(&self) -> usize {
        let br = self.bit_rate_kbps * 1000;
        let sr = self.sample_rate;
        let pad = u32::from(self.padding);
        let size = match (self.layer, self.version) {
            (1, _) => (12 * br / sr + pad) * 4,
            (2, _) | (3, MpegVersion::V1) => 144 * br / sr + pad,
            _ => 72 * br / sr + pad,
        };
        size as usize
    }

    pub fn samples_per_frame(&self) -> u32 {
        match (self.layer, self.version) {
            (1, _) => 384,
            (2, _) | (3, MpegVersion::V1) => 1152,
            _ => 576,
        }
    }

    /// Layer III side information length in bytes.
    pub fn side_info_size(&self) -> usize {
        match (self.version, self.is_mono()) {
            (MpegVersion::V1, true) => 17,
            (MpegVersion::V1, false) => 32,
            (_, true) => 9,
            (_, false) => 17,
        }
    }

    pub fn frame_duration(&self) -> Duration {
        Duration::from_micros(
            u64::from(self.samples_per_frame()) * 1_000_000 / u64::from(self.sample_rate),
        )
    }
}

/// MPEG audio framer: one frame per call, header included.
pub struct MpegAudioFramer<S> {
    parser: StreamParser<S>,
    out: FrameBuffer,
    header: Option<MpegAudioHeader>,
    elapsed: Duration,
    ended: bool,
}

impl<S: ByteSource> MpegAudioFramer<S> {
    pub fn new(source: S) -> Self {
        Self {
            parser: StreamParser::new(source),
            out: FrameBuffer::default(),
            header: None,
            elapsed: Duration::ZERO,
            ended: false,
        }
    }

    /// Header of the most recent frame.
    pub fn header(&self) -> Option<MpegAudioHeader> {
        self.header
    }

    fn parse(&mut self, max_size: usize) -> Parse<Frame> {
        let mut skipped = 0usize;
        let header = loop {
            self.parser.save_parser_state();
            match MpegAudioHeader::parse(self.parser.test_4_bytes()?) {
                Some(header) => break header,
                None => {
                    self.parser.skip_bytes(1)?;
                    skipped += 1;
                }
            }
        };
        if skipped > 0 {
            tracing::warn!(skipped, "skipped bytes looking for MPEG audio sync");
        }

        self.out.reset(max_size);
        let frame = self.parser.get_bytes(header.frame_size())?;
        self.out.save_bytes(frame);

        let duration = header.frame_duration();
        let presentation_time = self.elapsed;
        self.elapsed += duration;
        if self.header.map(|h| (h.version, h.layer, h.sample_rate))
            != Some((header.version, header.layer, header.sample_rate))
        {
            tracing::debug!(
                version = ?header.version,
                layer = header.layer,
                sample_rate = header.sample_rate,
                "MPEG audio stream parameters"
            );
        }
        self.header = Some(header);
        Ok(self
            .out
            .take_frame(presentation_time, duration, FrameTag::Plain))
    }
}

impl<S: ByteSource> FrameSource for MpegAudioFramer<S> {
    fn next_frame(&mut self, max_size: usize) -> Result<Pull> {
        if self.ended {
            return Ok(Pull::Closed);
        }
        let parsed = self.parse(max_size);
        into_pull(parsed, &mut self.ended)
    }

    fn flush_input(&mut self) {
        self.parser.flush_input();
        self.ended = false;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::source::MemorySource;

    /// MPEG-1 layer III, 128 kbps, 44.1 kHz, joint stereo, no CRC.
    pub const MP3_HEADER: u32 = 0xFFFB_9044;

    pub fn frame(header: u32, fill: u8) -> Vec<u8> {
        let size = MpegAudioHeader::parse(header).unwrap().frame_size();
        let mut v = header.to_be_bytes().to_vec();
        v.resize(size, fill);
        v
    }

    #[test]
    fn layer3_header_fields() {
        let h = MpegAudioHeader::parse(MP3_HEADER).unwrap();
        assert_eq!(h.version, MpegVersion::V1);
        assert_eq!(h.layer, 3);
        assert_eq!(h.bit_rate_kbps, 128);
        assert_eq!(h.sample_rate, 44_100);
        assert!(!h.has_crc);
        assert_eq!(h.frame_size(), 417);
        assert_eq!(h.samples_per_frame(), 1152);
        assert_eq!(h.side_info_size(), 32);
    }

    #[test]
    fn other_layers_and_versions() {
        // MPEG-1 layer II, 192 kbps, 48 kHz
        let h = MpegAudioHeader::parse(0xFFFD_A400).unwrap();
        assert_eq!(h.layer, 2);
        assert_eq!(h.frame_size(), 576);
        // MPEG-1 layer I, 384 kbps, 32 kHz, padded
        let h = MpegAudioHeader::parse(0xFFFF_CA00).unwrap();
        assert_eq!(h.frame_size(), (12 * 384_000 / 32_000 + 1) * 4);
        assert_eq!(h.samples_per_frame(), 384);
        // MPEG-2 layer III, 64 kbps, 22.05 kHz, mono
        let h = MpegAudioHeader::parse(0xFFF3_80C0).unwrap();
        assert_eq!(h.sample_rate, 22_050);
        assert_eq!(h.frame_size(), 72 * 64_000 / 22_050);
        assert_eq!(h.side_info_size(), 9);
        assert_eq!(h.samples_per_frame(), 576);
    }

    #[test]
    fn rejects_reserved_and_free_format() {
        assert!(MpegAudioHeader::parse(0xFFEB_9044).is_none()); // version 01
        assert!(MpegAudioHeader::parse(0xFFF9_9044).is_none()); // layer 00
        assert!(MpegAudioHeader::parse(0xFFFB_0044).is_none()); // free format
        assert!(MpegAudioHeader::parse(0xFFFB_F044).is_none()); // bad bit rate
        assert!(MpegAudioHeader::parse(0xFFFB_9C44).is_none()); // reserved rate
    }

    #[test]
    fn frames_with_leading_junk() {
        let mut data = vec![0x00, 0xFF, 0x12];
        for i in 0..4 {
            data.extend(frame(MP3_HEADER, i));
        }
        let mut framer = MpegAudioFramer::new(MemorySource::new(data));
        let mut frames = Vec::new();
        while let Pull::Frame(f) = framer.next_frame(10_000).unwrap() {
            frames.push(f);
        }
        assert_eq!(frames.len(), 4);
        assert_eq!(frames[2].data, frame(MP3_HEADER, 2));
        assert_eq!(frames[1].presentation_time, Duration::from_micros(26_122));
        assert_eq!(frames[3].presentation_time, Duration::from_micros(26_122 * 3));
    }
}
