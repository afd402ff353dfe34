//! H.264 Annex B framer and FU-A fragmenter (ITU-T H.264 Annex B, RFC 6184).
//!
//! [`H264Framer`] delivers one NAL unit per frame with its start code
//! stripped. Whether a NAL unit ends its access unit is decided by peeking at
//! the header of the NAL unit that follows it, and is exposed through
//! [`VideoAccessUnitBoundary`].
//!
//! [`FuaFragmenter`] sits between the framer and an RTP sink and cuts NAL
//! units that do not fit one packet into FU-A fragments (RFC 6184 §5.8):
//!
//! ```text
//! FU indicator:  [F|NRI|Type=28]     (1 byte)
//! FU header:     [S|E|R|NAL_Type]    (1 byte)
//! Fragment data: [...]
//! ```

use std::time::Duration;

use super::into_pull;
use crate::config::H264FramerConfig;
use crate::error::Result;
use crate::frame::{
    Frame, FrameBuffer, FrameSource, FrameTag, Pull, VideoAccessUnitBoundary, frames_to_micros,
};
use crate::parser::{Interrupt, Parse, StreamParser};
use crate::source::ByteSource;

pub const NAL_SEI: u8 = 6;
pub const NAL_SPS: u8 = 7;
pub const NAL_PPS: u8 = 8;
pub const NAL_AUD: u8 = 9;
pub const NAL_FU_A: u8 = 28;

pub fn is_vcl(nal_type: u8) -> bool {
    (1..=5).contains(&nal_type)
}

/// NAL unit types that, when present, start a new access unit (H.264 §7.4.1.2.3).
fn usually_begins_access_unit(nal_type: u8) -> bool {
    matches!(nal_type, NAL_SEI | NAL_SPS | NAL_PPS | NAL_AUD | 14..=18)
}

/// H.264 Annex B byte-stream framer.
pub struct H264Framer<S> {
    parser: StreamParser<S>,
    out: FrameBuffer,
    frame_rate: (u32, u32),
    access_unit_count: u64,
    seen_vcl_in_access_unit: bool,
    current_ends_access_unit: bool,
    sps: Option<Vec<u8>>,
    pps: Option<Vec<u8>>,
    ended: bool,
}

impl<S: ByteSource> H264Framer<S> {
    pub fn new(source: S) -> Self {
        Self::with_config(source, H264FramerConfig::default())
    }

    pub fn with_config(source: S, config: H264FramerConfig) -> Self {
        Self {
            parser: StreamParser::new(source),
            out: FrameBuffer::default(),
            frame_rate: config.frame_rate,
            access_unit_count: 0,
            seen_vcl_in_access_unit: false,
            current_ends_access_unit: false,
            sps: None,
            pps: None,
            ended: false,
        }
    }

    /// Most recent sequence parameter set, header byte included.
    pub fn sps(&self) -> Option<&[u8]> {
        self.sps.as_deref()
    }

    /// Most recent picture parameter set, header byte included.
    pub fn pps(&self) -> Option<&[u8]> {
        self.pps.as_deref()
    }

    fn presentation_time(&self) -> Duration {
        Duration::from_micros(frames_to_micros(
            self.access_unit_count,
            self.frame_rate.0,
            self.frame_rate.1,
        ))
    }

    fn parse(&mut self, max_size: usize) -> Parse<Frame> {
        self.parser.save_parser_state();
        self.out.reset(max_size);

        self.parser.skip_to_next_start_code()?;
        self.parser.skip_bytes(3)?;
        let nal_type = self.parser.test_1_byte()? & 0x1F;

        // `None` when the stream ends inside this NAL unit.
        let next = match self.parser.save_to_next_start_code(&mut self.out) {
            Ok(code) => {
                let next_type = (code & 0x1F) as u8;
                let next_starts_picture = if is_vcl(next_type) {
                    match self.parser.test_bytes(5) {
                        // first_mb_in_slice == 0 is coded as a single set bit
                        Ok(b) => b[4] & 0x80 != 0,
                        Err(Interrupt::Closed) => true,
                        Err(e) => return Err(e),
                    }
                } else {
                    false
                };
                Some((next_type, next_starts_picture))
            }
            Err(Interrupt::Closed) => None,
            Err(e) => return Err(e),
        };
        self.out.trim_trailing_zeros();

        let seen_vcl = self.seen_vcl_in_access_unit || is_vcl(nal_type);
        let ends_access_unit = match next {
            None => true,
            Some((next_type, next_starts_picture)) => {
                seen_vcl
                    && (usually_begins_access_unit(next_type)
                        || (is_vcl(next_type) && next_starts_picture))
            }
        };

        if next.is_none() {
            self.ended = true;
        }
        match nal_type {
            NAL_SPS => self.sps = Some(self.out.data().to_vec()),
            NAL_PPS => self.pps = Some(self.out.data().to_vec()),
            _ => {}
        }
        let presentation_time = self.presentation_time();
        let duration = if ends_access_unit {
            self.access_unit_count += 1;
            self.seen_vcl_in_access_unit = false;
            Duration::from_micros(frames_to_micros(1, self.frame_rate.0, self.frame_rate.1))
        } else {
            self.seen_vcl_in_access_unit = seen_vcl;
            Duration::ZERO
        };
        self.current_ends_access_unit = ends_access_unit;
        tracing::trace!(nal_type, size = self.out.len(), ends_access_unit, "NAL unit");
        Ok(self
            .out
            .take_frame(presentation_time, duration, FrameTag::NalUnit { nal_type }))
    }
}

impl<S: ByteSource> VideoAccessUnitBoundary for H264Framer<S> {
    fn current_nal_unit_ends_access_unit(&self) -> bool {
        self.current_ends_access_unit
    }
}

impl<S: ByteSource> FrameSource for H264Framer<S> {
    fn next_frame(&mut self, max_size: usize) -> Result<Pull> {
        if self.ended {
            return Ok(Pull::Closed);
        }
        let parsed = self.parse(max_size);
        into_pull(parsed, &mut self.ended)
    }

    fn flush_input(&mut self) {
        self.parser.flush_input();
        self.seen_vcl_in_access_unit = false;
        self.ended = false;
    }

    fn access_unit_boundary(&self) -> Option<&dyn VideoAccessUnitBoundary> {
        Some(self)
    }
}

/// NAL unit being cut into FU-A fragments.
#[derive(Debug)]
struct PendingNal {
    frame: Frame,
    /// Offset of the next payload byte to send; 0 until the first fragment goes out.
    offset: usize,
}

/// Splits NAL units larger than `max_output_size` into FU-A fragments.
///
/// NAL units that fit are passed through unchanged. Each delivered piece is
/// tagged [`FrameTag::NalFragment`]; `completes_nal_unit` is set on a whole
/// NAL unit and on the fragment carrying the E bit.
pub struct FuaFragmenter<F> {
    inner: F,
    max_output_size: usize,
    input_buffer_size: usize,
    pending: Option<PendingNal>,
}

impl<F: FrameSource> FuaFragmenter<F> {
    pub fn new(inner: F, max_output_size: usize, input_buffer_size: usize) -> Self {
        Self {
            inner,
            max_output_size: max_output_size.max(3),
            input_buffer_size,
            pending: None,
        }
    }

    pub fn into_inner(self) -> F {
        self.inner
    }

    fn next_piece(&mut self, max_size: usize) -> Option<Frame> {
        let limit = self.max_output_size.min(max_size).max(3);
        let pending = self.pending.as_mut()?;
        let nal = &pending.frame.data;

        if pending.offset == 0 && nal.len() <= limit {
            let pending = self.pending.take()?;
            let mut frame = pending.frame;
            frame.tag = FrameTag::NalFragment {
                completes_nal_unit: true,
            };
            return Some(frame);
        }

        let nal_header = nal[0];
        let nal_type = nal_header & 0x1F;
        let fu_indicator = (nal_header & 0xE0) | NAL_FU_A;
        let start = pending.offset.max(1);
        let remaining = nal.len() - start;
        let chunk = remaining.min(limit - 2);
        let last_fragment = chunk == remaining;

        let start_bit = if pending.offset == 0 { 0x80 } else { 0x00 };
        let end_bit = if last_fragment { 0x40 } else { 0x00 };
        let mut data = Vec::with_capacity(2 + chunk);
        data.push(fu_indicator);
        data.push(start_bit | end_bit | nal_type);
        data.extend_from_slice(&nal[start..start + chunk]);

        let presentation_time = pending.frame.presentation_time;
        let duration = if last_fragment {
            pending.frame.duration
        } else {
            Duration::ZERO
        };
        pending.offset = start + chunk;
        if last_fragment {
            self.pending = None;
        }
        tracing::trace!(nal_type, fragment = chunk, last_fragment, "FU-A fragment");
        Some(Frame::new(
            data,
            presentation_time,
            duration,
            FrameTag::NalFragment {
                completes_nal_unit: last_fragment,
            },
        ))
    }
}

impl<F: FrameSource> FrameSource for FuaFragmenter<F> {
    fn next_frame(&mut self, max_size: usize) -> Result<Pull> {
        loop {
            if let Some(piece) = self.next_piece(max_size) {
                return Ok(Pull::Frame(piece));
            }
            match self.inner.next_frame(self.input_buffer_size)? {
                Pull::Frame(frame) if frame.data.is_empty() => continue,
                Pull::Frame(frame) => self.pending = Some(PendingNal { frame, offset: 0 }),
                other => return Ok(other),
            }
        }
    }

    fn flush_input(&mut self) {
        self.pending = None;
        self.inner.flush_input();
    }

    fn access_unit_boundary(&self) -> Option<&dyn VideoAccessUnitBoundary> {
        self.inner.access_unit_boundary()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::source::MemorySource;

    pub const SPS: [u8; 4] = [0x67, 0x42, 0x00, 0x1e];
    pub const PPS: [u8; 4] = [0x68, 0xce, 0x38, 0x80];

    pub fn idr(first_mb_zero: bool, len: usize) -> Vec<u8> {
        let mut v = vec![0x65, if first_mb_zero { 0x88 } else { 0x44 }];
        v.extend(std::iter::repeat_n(0xAB, len));
        v
    }

    pub fn annex_b(nals: &[Vec<u8>]) -> Vec<u8> {
        let mut v = Vec::new();
        for (i, nal) in nals.iter().enumerate() {
            if i % 2 == 0 {
                v.extend_from_slice(&[0, 0, 0, 1]);
            } else {
                v.extend_from_slice(&[0, 0, 1]);
            }
            v.extend_from_slice(nal);
        }
        v
    }

    fn collect<F: FrameSource>(source: &mut F) -> Vec<(Frame, bool)> {
        let mut frames = Vec::new();
        while let Pull::Frame(f) = source.next_frame(100_000).unwrap() {
            let ends = source
                .access_unit_boundary()
                .map(|b| b.current_nal_unit_ends_access_unit())
                .unwrap_or(false);
            frames.push((f, ends));
        }
        frames
    }

    #[test]
    fn nal_units_without_start_codes() {
        let nals = vec![SPS.to_vec(), PPS.to_vec(), idr(true, 10)];
        let mut framer = H264Framer::new(MemorySource::new(annex_b(&nals)));
        let frames = collect(&mut framer);
        assert_eq!(frames.len(), 3);
        for ((frame, _), nal) in frames.iter().zip(&nals) {
            assert_eq!(&frame.data, nal);
        }
        assert_eq!(frames[0].0.tag, FrameTag::NalUnit { nal_type: NAL_SPS });
        assert_eq!(framer.sps(), Some(&SPS[..]));
        assert_eq!(framer.pps(), Some(&PPS[..]));
    }

    #[test]
    fn access_unit_boundaries() {
        let nals = vec![
            SPS.to_vec(),
            PPS.to_vec(),
            idr(true, 10),
            idr(false, 10),
            vec![0x09, 0x10],
            vec![0x41, 0x9a, 0x01],
            vec![0x41, 0x9a, 0x02],
        ];
        let mut framer = H264Framer::new(MemorySource::new(annex_b(&nals)));
        let ends: Vec<bool> = collect(&mut framer).iter().map(|(_, e)| *e).collect();
        assert_eq!(ends, vec![false, false, false, true, false, true, true]);
    }

    #[test]
    fn timestamps_advance_per_access_unit() {
        let nals = vec![idr(true, 4), vec![0x41, 0x9a], vec![0x41, 0x9a]];
        let mut framer = H264Framer::new(MemorySource::new(annex_b(&nals)));
        let times: Vec<u128> = collect(&mut framer)
            .iter()
            .map(|(f, _)| f.presentation_time.as_millis())
            .collect();
        assert_eq!(times, vec![0, 40, 80]);
    }

    #[test]
    fn small_nal_passes_through_fragmenter() {
        let nals = vec![SPS.to_vec(), idr(true, 10)];
        let framer = H264Framer::new(MemorySource::new(annex_b(&nals)));
        let mut fua = FuaFragmenter::new(framer, 100, 100_000);
        let frames = collect(&mut fua);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].0.data, SPS.to_vec());
        assert_eq!(
            frames[0].0.tag,
            FrameTag::NalFragment {
                completes_nal_unit: true
            }
        );
        assert!(frames[1].1);
    }

    #[test]
    fn large_nal_is_fragmented() {
        let nal = idr(true, 250);
        let framer = H264Framer::new(MemorySource::new(annex_b(&[nal.clone()])));
        let mut fua = FuaFragmenter::new(framer, 100, 100_000);
        let frames = collect(&mut fua);
        assert!(frames.len() > 1);
        for (f, _) in &frames {
            assert!(f.size() <= 100);
            assert_eq!(f.data[0] & 0x1F, NAL_FU_A);
            assert_eq!(f.data[0] & 0x60, nal[0] & 0x60);
        }
        assert_eq!(frames[0].0.data[1] & 0x80, 0x80);
        let ends: Vec<_> = frames.iter().filter(|(f, _)| f.data[1] & 0x40 != 0).collect();
        assert_eq!(ends.len(), 1);
        assert!(matches!(
            frames.last().map(|(f, _)| &f.tag),
            Some(FrameTag::NalFragment {
                completes_nal_unit: true
            })
        ));

        let mut rebuilt = vec![(frames[0].0.data[0] & 0xE0) | (frames[0].0.data[1] & 0x1F)];
        for (f, _) in &frames {
            rebuilt.extend_from_slice(&f.data[2..]);
        }
        assert_eq!(rebuilt, nal);
    }
}
