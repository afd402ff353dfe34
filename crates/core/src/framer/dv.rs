//! DV video framer (IEC 61834, SMPTE 314M / 370M).
//!
//! A DV frame is a run of 80-byte DIF blocks. The stream profile, and with it
//! the frame size and rate, is read from the first DIF sequence: the header
//! block's DSF bit selects 525/60 or 625/50, and the video source pack (0x60)
//! in a VAUX block gives the signal type.

use std::time::Duration;

use super::into_pull;
use crate::error::Result;
use crate::frame::{Frame, FrameBuffer, FrameSource, FrameTag, Pull, frames_to_micros};
use crate::parser::{Parse, StreamParser};
use crate::source::ByteSource;

pub const DIF_BLOCK_SIZE: usize = 80;
/// Header, two subcode and three VAUX blocks.
const PROFILE_PROBE_BLOCKS: usize = 6;
const VIDEO_SOURCE_PACK: u8 = 0x60;

/// A DV encoding profile (RFC 6469 §5 `encode` names).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DvProfile {
    pub name: &'static str,
    pub dsf: u8,
    pub stype: u8,
    pub frame_size: usize,
    pub frame_rate: (u32, u32),
}

impl DvProfile {
    pub fn frame_duration(&self) -> Duration {
        Duration::from_micros(frames_to_micros(1, self.frame_rate.0, self.frame_rate.1))
    }
}

pub const PROFILES: [DvProfile; 8] = [
    DvProfile { name: "SD-VCR/525-60", dsf: 0, stype: 0x00, frame_size: 120_000, frame_rate: (30000, 1001) },
    DvProfile { name: "SD-VCR/625-50", dsf: 1, stype: 0x00, frame_size: 144_000, frame_rate: (25, 1) },
    DvProfile { name: "314M-50/525-60", dsf: 0, stype: 0x04, frame_size: 240_000, frame_rate: (30000, 1001) },
    DvProfile { name: "314M-50/625-50", dsf: 1, stype: 0x04, frame_size: 288_000, frame_rate: (25, 1) },
    DvProfile { name: "370M/1080-60i", dsf: 0, stype: 0x14, frame_size: 480_000, frame_rate: (30000, 1001) },
    DvProfile { name: "370M/1080-50i", dsf: 1, stype: 0x14, frame_size: 576_000, frame_rate: (25, 1) },
    DvProfile { name: "370M/720-60p", dsf: 0, stype: 0x18, frame_size: 240_000, frame_rate: (60000, 1001) },
    DvProfile { name: "370M/720-50p", dsf: 1, stype: 0x18, frame_size: 288_000, frame_rate: (50, 1) },
];

/// Header block of DIF sequence 0: section type 0, sequence number 0.
fn is_frame_start(block: &[u8]) -> bool {
    block[0] >> 5 == 0 && block[1] >> 4 == 0
}

/// Determine the profile from the first blocks of a frame.
pub fn detect_profile(blocks: &[u8]) -> Option<DvProfile> {
    let header = blocks.get(..DIF_BLOCK_SIZE)?;
    if !is_frame_start(header) {
        return None;
    }
    let dsf = header[3] >> 7;
    let mut stype = None;
    for block in blocks.chunks_exact(DIF_BLOCK_SIZE) {
        // VAUX section: SCT = 010
        if block[0] >> 5 != 0b010 {
            continue;
        }
        stype = block[3..]
            .chunks_exact(5)
            .find(|pack| pack[0] == VIDEO_SOURCE_PACK)
            .map(|pack| pack[3] & 0x1F);
        if stype.is_some() {
            break;
        }
    }
    let stype = stype.unwrap_or_else(|| {
        tracing::debug!("no DV video source pack; assuming standard definition");
        0
    });
    PROFILES
        .iter()
        .find(|p| p.dsf == dsf && p.stype == stype)
        .copied()
}

/// DV framer: one complete frame per call.
pub struct DvFramer<S> {
    parser: StreamParser<S>,
    out: FrameBuffer,
    profile: Option<DvProfile>,
    frame_count: u64,
    ended: bool,
}

impl<S: ByteSource> DvFramer<S> {
    pub fn new(source: S) -> Self {
        Self {
            parser: StreamParser::new(source),
            out: FrameBuffer::default(),
            profile: None,
            frame_count: 0,
            ended: false,
        }
    }

    pub fn profile(&self) -> Option<DvProfile> {
        self.profile
    }

    fn parse(&mut self, max_size: usize) -> Parse<Frame> {
        let mut skipped = 0usize;
        let profile = loop {
            self.parser.save_parser_state();
            if !is_frame_start(self.parser.test_bytes(2)?) {
                self.parser.skip_bytes(DIF_BLOCK_SIZE)?;
                skipped += 1;
                continue;
            }
            if let Some(p) = self.profile {
                break p;
            }
            let probe = self.parser.test_bytes(DIF_BLOCK_SIZE * PROFILE_PROBE_BLOCKS)?;
            match detect_profile(probe) {
                Some(p) => break p,
                None => {
                    tracing::warn!("unrecognized DV profile");
                    self.parser.skip_bytes(DIF_BLOCK_SIZE)?;
                    skipped += 1;
                }
            }
        };
        if skipped > 0 {
            tracing::warn!(blocks = skipped, "skipped DIF blocks looking for a frame start");
        }

        self.out.reset(max_size);
        let frame = self.parser.get_bytes(profile.frame_size)?;
        self.out.save_bytes(frame);

        if self.profile.is_none() {
            tracing::debug!(profile = profile.name, frame_size = profile.frame_size, "DV profile");
        }
        self.profile = Some(profile);
        let duration = profile.frame_duration();
        let presentation_time = Duration::from_micros(frames_to_micros(
            self.frame_count,
            profile.frame_rate.0,
            profile.frame_rate.1,
        ));
        self.frame_count += 1;
        Ok(self.out.take_frame(
            presentation_time,
            duration,
            FrameTag::Dv {
                profile: profile.name,
            },
        ))
    }
}

impl<S: ByteSource> FrameSource for DvFramer<S> {
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
