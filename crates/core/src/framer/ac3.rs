//! AC-3 (Dolby Digital) syncframe framer (ATSC A/52).

use std::time::Duration;

use super::into_pull;
use crate::error::Result;
use crate::frame::{Frame, FrameBuffer, FrameSource, FrameTag, Pull};
use crate::parser::{Parse, StreamParser};
use crate::source::ByteSource;

pub const SYNC_WORD: u16 = 0x0B77;
pub const SAMPLES_PER_FRAME: u32 = 1536;

/// Nominal bit rates in kbps, indexed by `frmsizecod >> 1`.
const BIT_RATES: [u32; 19] = [
    32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 384, 448, 512, 576, 640,
];
const SAMPLE_RATES: [u32; 3] = [48_000, 44_100, 32_000];
const ACMOD_CHANNELS: [u8; 8] = [2, 1, 2, 3, 3, 4, 4, 5];

/// Fields of an AC-3 `syncinfo` + start of `bsi`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ac3Header {
    pub sample_rate: u32,
    pub bit_rate_kbps: u32,
    /// Whole syncframe length in bytes.
    pub frame_size: usize,
    pub acmod: u8,
}

impl Ac3Header {
    /// Parse from at least the first 7 bytes of a syncframe.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 7 || u16::from_be_bytes([bytes[0], bytes[1]]) != SYNC_WORD {
            return None;
        }
        let fscod = usize::from(bytes[4] >> 6);
        let frmsizecod = usize::from(bytes[4] & 0x3F);
        let sample_rate = *SAMPLE_RATES.get(fscod)?;
        let bit_rate_kbps = *BIT_RATES.get(frmsizecod >> 1)?;
        let mut words = (bit_rate_kbps * 1000 * SAMPLES_PER_FRAME / (sample_rate * 16)) as usize;
        if sample_rate == 44_100 && frmsizecod & 1 == 1 {
            words += 1;
        }
        Some(Self {
            sample_rate,
            bit_rate_kbps,
            frame_size: words * 2,
            acmod: bytes[6] >> 5,
        })
    }

    /// Full-bandwidth channel count (the LFE channel is not included).
    pub fn channels(&self) -> u8 {
        ACMOD_CHANNELS[usize::from(self.acmod & 0x07)]
    }

    pub fn frame_duration(&self) -> Duration {
        Duration::from_micros(u64::from(SAMPLES_PER_FRAME) * 1_000_000 / u64::from(self.sample_rate))
    }
}

/// AC-3 framer: one syncframe per frame, sync word included.
pub struct Ac3Framer<S> {
    parser: StreamParser<S>,
    out: FrameBuffer,
    header: Option<Ac3Header>,
    elapsed: Duration,
    ended: bool,
}

impl<S: ByteSource> Ac3Framer<S> {
    pub fn new(source: S) -> Self {
        Self {
            parser: StreamParser::new(source),
            out: FrameBuffer::default(),
            header: None,
            elapsed: Duration::ZERO,
            ended: false,
        }
    }

    /// Header of the most recent syncframe.
    pub fn header(&self) -> Option<Ac3Header> {
        self.header
    }

    fn parse(&mut self, max_size: usize) -> Parse<Frame> {
        let mut skipped = 0usize;
        let header = loop {
            self.parser.save_parser_state();
            let candidate = Ac3Header::parse(self.parser.test_bytes(7)?);
            match candidate {
                Some(header) => break header,
                None => {
                    self.parser.skip_bytes(1)?;
                    skipped += 1;
                }
            }
        };
        if skipped > 0 {
            tracing::warn!(skipped, "skipped bytes looking for AC-3 sync word");
        }

        self.out.reset(max_size);
        let frame = self.parser.get_bytes(header.frame_size)?;
        self.out.save_bytes(frame);

        let duration = header.frame_duration();
        let presentation_time = self.elapsed;
        self.elapsed += duration;
        if self.header != Some(header) {
            tracing::debug!(
                sample_rate = header.sample_rate,
                bit_rate_kbps = header.bit_rate_kbps,
                frame_size = header.frame_size,
                "AC-3 stream parameters"
            );
        }
        self.header = Some(header);
        Ok(self
            .out
            .take_frame(presentation_time, duration, FrameTag::Plain))
    }
}

impl<S: ByteSource> FrameSource for Ac3Framer<S> {
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
