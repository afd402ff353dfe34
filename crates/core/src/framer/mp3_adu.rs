//! MP3 to ADU conversion (RFC 5219 §4).
//!
//! An MP3 frame's main data may start in earlier frames (the bit reservoir,
//! located by `main_data_begin`). An Application Data Unit instead carries
//! header, side information and *all* of its own main data, so each ADU can
//! be decoded on its own. Each ADU is preceded by an ADU descriptor:
//!
//! ```text
//! 1 byte:  [C|T=0| size (6 bits)]               size < 64
//! 2 bytes: [C|T=1| size (14 bits)             ]
//! ```

use std::collections::VecDeque;

use super::mpeg_audio::{MpegAudioHeader, MpegVersion};
use crate::error::Result;
use crate::frame::{Frame, FrameSource, FrameTag, Pull};
use crate::parser::BitReader;

/// `main_data_begin` can reach back at most 511 bytes.
const MAX_BACKPOINTER: usize = 511;

/// Write an ADU descriptor for an ADU of `size` bytes.
pub fn write_descriptor(out: &mut Vec<u8>, size: usize, continuation: bool) {
    let c = if continuation { 0x80 } else { 0x00 };
    if size < 64 && !continuation {
        out.push(c | size as u8);
    } else {
        out.push(c | 0x40 | ((size >> 8) & 0x3F) as u8);
        out.push((size & 0xFF) as u8);
    }
}

/// Read an ADU descriptor: `(adu_size, descriptor_len, continuation)`.
pub fn read_descriptor(data: &[u8]) -> Option<(usize, usize, bool)> {
    let first = *data.first()?;
    let continuation = first & 0x80 != 0;
    if first & 0x40 == 0 {
        Some((usize::from(first & 0x3F), 1, continuation))
    } else {
        let second = *data.get(1)?;
        Some(((usize::from(first & 0x3F) << 8) | usize::from(second), 2, continuation))
    }
}

/// Layer III side information fields needed to locate main data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SideInfo {
    pub main_data_begin: usize,
    /// Bytes of main data belonging to this frame.
    pub main_data_size: usize,
}

impl SideInfo {
    pub fn parse(header: &MpegAudioHeader, side_info: &[u8]) -> Option<Self> {
        let mut r = BitReader::new(side_info);
        let channels = if header.is_mono() { 1 } else { 2 };
        let (begin_bits, private_bits, granules, rest_bits) = match header.version {
            MpegVersion::V1 => (9, if channels == 1 { 5 } else { 3 }, 2, 47),
            _ => (8, if channels == 1 { 1 } else { 2 }, 1, 51),
        };
        let main_data_begin = r.read_bits(begin_bits)? as usize;
        r.skip_bits(private_bits)?;
        if header.version == MpegVersion::V1 {
            r.skip_bits(4 * channels)?; // scfsi
        }
        let mut part2_3_bits = 0usize;
        for _ in 0..granules * channels {
            part2_3_bits += r.read_bits(12)? as usize;
            r.skip_bits(rest_bits)?;
        }
        Some(Self {
            main_data_begin,
            main_data_size: part2_3_bits.div_ceil(8),
        })
    }
}

/// Converts a stream of MP3 frames into ADUs, descriptor included.
///
/// Frames whose main data reaches back before the start of the stream cannot
/// be completed and are dropped. Frames other than layer III are dropped.
pub struct Mp3AduFramer<F> {
    inner: F,
    input_buffer_size: usize,
    /// Main-data areas of recent frames.
    reservoir: VecDeque<u8>,
    /// Stream offset of `reservoir[0]`.
    reservoir_start: usize,
    adu_count: u64,
    warned_layer: bool,
}

impl<F: FrameSource> Mp3AduFramer<F> {
    pub fn new(inner: F, input_buffer_size: usize) -> Self {
        Self {
            inner,
            input_buffer_size,
            reservoir: VecDeque::new(),
            reservoir_start: 0,
            adu_count: 0,
            warned_layer: false,
        }
    }

    pub fn adu_count(&self) -> u64 {
        self.adu_count
    }

    /// Turn one MP3 frame into an ADU, or `None` if it cannot be completed.
    fn convert(&mut self, frame: &Frame) -> Option<Vec<u8>> {
        let data = &frame.data;
        let word = u32::from_be_bytes(data.get(..4)?.try_into().ok()?);
        let header = MpegAudioHeader::parse(word)?;
        if header.layer != 3 {
            if !self.warned_layer {
                tracing::warn!(layer = header.layer, "ADU conversion needs layer III; dropping frames");
                self.warned_layer = true;
            }
            return None;
        }
        let crc = if header.has_crc { 2 } else { 0 };
        let side_info_end = 4 + crc + header.side_info_size();
        let side = SideInfo::parse(&header, data.get(4 + crc..side_info_end)?)?;

        // This frame's own main-data area joins the reservoir first.
        let area_start = self.reservoir_start + self.reservoir.len();
        self.reservoir
            .extend(data.get(side_info_end..).unwrap_or_default().iter().copied());

        let begin = area_start.checked_sub(side.main_data_begin);
        let adu = match begin {
            Some(begin) if begin >= self.reservoir_start => {
                let from = begin - self.reservoir_start;
                let available = self.reservoir.len() - from;
                if side.main_data_size > available {
                    tracing::warn!(
                        needed = side.main_data_size,
                        available,
                        "ADU main data extends past its frame; truncating"
                    );
                }
                let take = side.main_data_size.min(available);
                let size = side_info_end + take;
                let mut adu = Vec::with_capacity(size + 2);
                write_descriptor(&mut adu, size, false);
                adu.extend_from_slice(&data[..side_info_end]);
                adu.extend(self.reservoir.range(from..from + take));
                Some(adu)
            }
            _ => {
                tracing::debug!(
                    main_data_begin = side.main_data_begin,
                    "main data precedes the start of the stream; frame dropped"
                );
                None
            }
        };

        let keep_from = (self.reservoir_start + self.reservoir.len()).saturating_sub(MAX_BACKPOINTER);
        if keep_from > self.reservoir_start {
            self.reservoir.drain(..keep_from - self.reservoir_start);
            self.reservoir_start = keep_from;
        }
        adu
    }
}

impl<F: FrameSource> FrameSource for Mp3AduFramer<F> {
    fn next_frame(&mut self, max_size: usize) -> Result<Pull> {
        loop {
            let frame = match self.inner.next_frame(self.input_buffer_size)? {
                Pull::Frame(frame) => frame,
                other => return Ok(other),
            };
            let Some(mut adu) = self.convert(&frame) else {
                continue;
            };
            let truncated = adu.len().saturating_sub(max_size);
            adu.truncate(max_size);
            self.adu_count += 1;
            let mut out = Frame::new(adu, frame.presentation_time, frame.duration, FrameTag::Adu);
            out.truncated = truncated;
            return Ok(Pull::Frame(out));
        }
    }

    fn flush_input(&mut self) {
        self.reservoir.clear();
        self.reservoir_start = 0;
        self.inner.flush_input();
    }
}
