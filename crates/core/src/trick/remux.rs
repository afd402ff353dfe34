//! Wrap a video elementary stream in a single-program Transport Stream.
//!
//! Frames with equal presentation times are gathered into one PES packet.
//! The first TS packet of each PES carries a PCR equal to the presentation
//! time; the PTS runs [`PTS_DELAY`] ticks ahead of it. A PAT and a PMT are
//! written before the first PES and then every [`TABLE_PERIOD`] packets.

use std::time::Duration;

use crate::error::Result;
use crate::frame::{FrameSource, Pull};
use crate::framer::ts::{SYNC_BYTE, TS_PACKET_SIZE};
use crate::source::{ByteSource, ReadOutcome};

pub const PMT_PID: u16 = 0x30;
pub const VIDEO_PID: u16 = 0xE0;
/// ISO/IEC 13818-1 stream type for MPEG-2 video.
pub const MPEG2_VIDEO_STREAM_TYPE: u8 = 0x02;
pub const TABLE_PERIOD: u32 = 100;
/// 100 ms at 90 kHz.
pub const PTS_DELAY: u64 = 9_000;

const PAT_PID: u16 = 0x00;
const VIDEO_STREAM_ID: u8 = 0xE0;
const PROGRAM_NUMBER: u16 = 1;
const TS_PAYLOAD_SIZE: usize = TS_PACKET_SIZE - 4;
/// Adaptation field holding only a PCR: length, flags and 6 PCR bytes.
const PCR_ADAPTATION_SIZE: usize = 8;
const MAX_INPUT_FRAME: usize = 64 * 1024;

/// CRC-32/MPEG-2 over a PSI section.
pub fn crc32_mpeg2(data: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for &byte in data {
        crc ^= u32::from(byte) << 24;
        for _ in 0..8 {
            crc = if crc & 0x8000_0000 != 0 {
                (crc << 1) ^ 0x04C1_1DB7
            } else {
                crc << 1
            };
        }
    }
    crc
}

fn pcr_bytes(seconds: f64) -> [u8; 6] {
    let ticks = (seconds.max(0.0) * 27_000_000.0) as u64;
    let base = ticks / 300;
    let ext = ticks % 300;
    [
        (base >> 25) as u8,
        (base >> 17) as u8,
        (base >> 9) as u8,
        (base >> 1) as u8,
        (((base & 1) as u8) << 7) | 0x7E | ((ext >> 8) as u8 & 0x01),
        ext as u8,
    ]
}

fn pts_bytes(pts: u64) -> [u8; 5] {
    [
        0x21 | (((pts >> 29) as u8) & 0x0E),
        (pts >> 22) as u8,
        (((pts >> 14) as u8) & 0xFE) | 0x01,
        (pts >> 7) as u8,
        (((pts << 1) as u8) & 0xFE) | 0x01,
    ]
}

/// Byte source producing a Transport Stream from a frame source of video
/// elementary-stream data.
pub struct EsToTransportStream<F> {
    inner: F,
    stream_type: u8,
    pes_payload: Vec<u8>,
    pes_time: Option<Duration>,
    output: Vec<u8>,
    output_pos: usize,
    pat_continuity: u8,
    pmt_continuity: u8,
    video_continuity: u8,
    packets_since_tables: u32,
    inner_closed: bool,
}

impl<F: FrameSource> EsToTransportStream<F> {
    pub fn new(inner: F) -> Self {
        Self::with_stream_type(inner, MPEG2_VIDEO_STREAM_TYPE)
    }

    pub fn with_stream_type(inner: F, stream_type: u8) -> Self {
        Self {
            inner,
            stream_type,
            pes_payload: Vec::new(),
            pes_time: None,
            output: Vec::new(),
            output_pos: 0,
            pat_continuity: 0,
            pmt_continuity: 0,
            video_continuity: 0,
            packets_since_tables: TABLE_PERIOD,
            inner_closed: false,
        }
    }

    pub fn inner_mut(&mut self) -> &mut F {
        &mut self.inner
    }

    pub fn into_inner(self) -> F {
        self.inner
    }

    /// Drop buffered output and any PES being assembled. The tables are
    /// repeated before the next PES.
    pub fn reset(&mut self) {
        self.pes_payload.clear();
        self.pes_time = None;
        self.output.clear();
        self.output_pos = 0;
        self.packets_since_tables = TABLE_PERIOD;
        self.inner_closed = false;
        self.inner.flush_input();
    }

    fn write_packet(&mut self, pid: u16, unit_start: bool, pcr: Option<f64>, payload: &[u8]) -> usize {
        let continuity = match pid {
            PAT_PID => &mut self.pat_continuity,
            PMT_PID => &mut self.pmt_continuity,
            _ => &mut self.video_continuity,
        };
        let cc = *continuity;
        *continuity = (cc + 1) & 0x0F;

        let min_adaptation = if pcr.is_some() { PCR_ADAPTATION_SIZE } else { 0 };
        let take = payload.len().min(TS_PAYLOAD_SIZE - min_adaptation);
        let adaptation = TS_PAYLOAD_SIZE - take;
        let control = if adaptation > 0 { 0x30 } else { 0x10 };

        let start = self.output.len();
        self.output.extend_from_slice(&[
            SYNC_BYTE,
            (u8::from(unit_start) << 6) | ((pid >> 8) as u8 & 0x1F),
            pid as u8,
            control | cc,
        ]);
        if adaptation > 0 {
            self.output.push((adaptation - 1) as u8);
            if adaptation > 1 {
                match pcr {
                    Some(seconds) => {
                        self.output.push(0x10);
                        self.output.extend_from_slice(&pcr_bytes(seconds));
                    }
                    None => self.output.push(0x00),
                }
                self.output.resize(start + 4 + adaptation, 0xFF);
            }
        }
        self.output.extend_from_slice(&payload[..take]);
        self.packets_since_tables += 1;
        take
    }

    /// A PSI section in a packet of its own, padded with 0xFF.
    fn write_section(&mut self, pid: u16, mut section: Vec<u8>) {
        let crc = crc32_mpeg2(&section);
        section.extend_from_slice(&crc.to_be_bytes());
        let mut payload = vec![0x00];
        payload.extend_from_slice(&section);
        payload.resize(TS_PAYLOAD_SIZE, 0xFF);
        self.write_packet(pid, true, None, &payload);
    }

    fn write_tables(&mut self) {
        let [program_hi, program_lo] = PROGRAM_NUMBER.to_be_bytes();
        // section_length counts the bytes after it, CRC included
        let pat = vec![
            0x00,
            0xB0,
            13,
            0x00,
            0x01,
            0xC1,
            0x00,
            0x00,
            program_hi,
            program_lo,
            0xE0 | (PMT_PID >> 8) as u8,
            PMT_PID as u8,
        ];
        self.write_section(PAT_PID, pat);

        let pmt = vec![
            0x02,
            0xB0,
            18,
            program_hi,
            program_lo,
            0xC1,
            0x00,
            0x00,
            0xE0 | (VIDEO_PID >> 8) as u8,
            VIDEO_PID as u8,
            0xF0,
            0x00,
            self.stream_type,
            0xE0 | (VIDEO_PID >> 8) as u8,
            VIDEO_PID as u8,
            0xF0,
            0x00,
        ];
        self.write_section(PMT_PID, pmt);
        self.packets_since_tables = 0;
    }

    fn flush_pes(&mut self) {
        let Some(time) = self.pes_time.take() else {
            return;
        };
        if self.pes_payload.is_empty() {
            return;
        }
        if self.packets_since_tables >= TABLE_PERIOD {
            self.write_tables();
        }

        let pts = (time.as_secs_f64() * 90_000.0) as u64 + PTS_DELAY;
        let pes_len = 3 + 5 + self.pes_payload.len();
        // 0 means unbounded, allowed for video
        let length_field = u16::try_from(pes_len).unwrap_or(0);
        let mut pes = Vec::with_capacity(14 + self.pes_payload.len());
        pes.extend_from_slice(&[0x00, 0x00, 0x01, VIDEO_STREAM_ID]);
        pes.extend_from_slice(&length_field.to_be_bytes());
        pes.extend_from_slice(&[0x80, 0x80, 5]);
        pes.extend_from_slice(&pts_bytes(pts));
        pes.append(&mut self.pes_payload);

        let mut at = 0;
        let mut first = true;
        while at < pes.len() {
            let pcr = first.then(|| time.as_secs_f64());
            at += self.write_packet(VIDEO_PID, first, pcr, &pes[at..]);
            first = false;
        }
        tracing::trace!(pts, bytes = pes.len(), "wrote PES packet");
    }
}

impl<F: FrameSource> ByteSource for EsToTransportStream<F> {
    fn read(&mut self, buf: &mut [u8]) -> Result<ReadOutcome> {
        loop {
            if self.output_pos < self.output.len() {
                let n = (self.output.len() - self.output_pos).min(buf.len());
                buf[..n].copy_from_slice(&self.output[self.output_pos..self.output_pos + n]);
                self.output_pos += n;
                return Ok(ReadOutcome::Data(n));
            }
            self.output.clear();
            self.output_pos = 0;
            if self.inner_closed {
                return Ok(ReadOutcome::Closed);
            }
            match self.inner.next_frame(MAX_INPUT_FRAME)? {
                Pull::Frame(frame) => {
                    if self.pes_time.is_some_and(|t| t != frame.presentation_time) {
                        self.flush_pes();
                    }
                    self.pes_time = Some(frame.presentation_time);
                    self.pes_payload.extend_from_slice(&frame.data);
                }
                Pull::Pending => return Ok(ReadOutcome::Pending),
                Pull::Closed => {
                    self.flush_pes();
                    self.inner_closed = true;
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::VecDeque;

    use super::*;
    use crate::frame::{Frame, FrameTag};
    use crate::framer::ts::{packet_pcr, packet_pid};

    /// Frame source replaying a fixed list.
    pub struct FrameList(pub VecDeque<Frame>);

    impl FrameList {
        pub fn of(chunks: &[(Vec<u8>, f64)]) -> Self {
            Self(
                chunks
                    .iter()
                    .map(|(data, t)| {
                        Frame::new(data.clone(), Duration::from_secs_f64(*t), Duration::ZERO, FrameTag::Plain)
                    })
                    .collect(),
            )
        }
    }

    impl FrameSource for FrameList {
        fn next_frame(&mut self, _max_size: usize) -> Result<Pull> {
            Ok(self.0.pop_front().map_or(Pull::Closed, Pull::Frame))
        }
    }

    /// Read a byte source to its end.
    pub fn drain(source: &mut impl ByteSource) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 1000];
        loop {
            match source.read(&mut buf).unwrap() {
                ReadOutcome::Data(n) => out.extend_from_slice(&buf[..n]),
                ReadOutcome::Pending => panic!("complete input should never pend"),
                ReadOutcome::Closed => return out,
            }
        }
    }

    /// Transport Stream of `chunks` of video elementary stream.
    pub fn transport_stream(chunks: &[(Vec<u8>, f64)]) -> Vec<u8> {
        drain(&mut EsToTransportStream::new(FrameList::of(chunks)))
    }

    /// Elementary-stream bytes carried on `pid`, PES headers removed.
    pub fn elementary_stream(ts: &[u8], pid: u16) -> Vec<u8> {
        let mut es = Vec::new();
        for packet in ts.chunks(TS_PACKET_SIZE) {
            if packet_pid(packet) != pid || packet[3] & 0x10 == 0 {
                continue;
            }
            let mut at = if packet[3] & 0x20 != 0 { 5 + usize::from(packet[4]) } else { 4 };
            if packet[1] & 0x40 != 0 {
                at += 9 + usize::from(packet[at + 8]);
            }
            es.extend_from_slice(&packet[at..]);
        }
        es
    }

    #[test]
    fn crc_check_value() {
        assert_eq!(crc32_mpeg2(b"123456789"), 0x0376_E6E7);
    }

    #[test]
    fn tables_then_pes() {
        let es: Vec<u8> = (0..500u32).map(|i| i as u8).collect();
        let ts = transport_stream(&[(es.clone(), 1.5)]);
        assert_eq!(ts.len() % TS_PACKET_SIZE, 0);
        let packets: Vec<&[u8]> = ts.chunks(TS_PACKET_SIZE).collect();
        assert!(packets.iter().all(|p| p[0] == SYNC_BYTE));
        assert_eq!(packet_pid(packets[0]), PAT_PID);
        assert_eq!(packet_pid(packets[1]), PMT_PID);
        // section CRCs cover the table through the CRC itself
        let pat = &packets[0][5..5 + 3 + 13];
        assert_eq!(crc32_mpeg2(pat), 0);
        let pmt = &packets[1][5..5 + 3 + 18];
        assert_eq!(crc32_mpeg2(pmt), 0);
        assert_eq!(pmt[12], MPEG2_VIDEO_STREAM_TYPE);

        let video = packets[2];
        assert_eq!(packet_pid(video), VIDEO_PID);
        assert_ne!(video[1] & 0x40, 0);
        let pcr = packet_pcr(video).unwrap();
        assert!((pcr.seconds - 1.5).abs() < 1e-6);
        assert_eq!(elementary_stream(&ts, VIDEO_PID), es);
    }

    #[test]
    fn equal_times_share_a_pes() {
        let ts = transport_stream(&[(vec![1; 10], 0.0), (vec![2; 10], 0.0), (vec![3; 10], 0.04)]);
        let starts = ts
            .chunks(TS_PACKET_SIZE)
            .filter(|p| packet_pid(p) == VIDEO_PID && p[1] & 0x40 != 0)
            .count();
        assert_eq!(starts, 2);
        let es = elementary_stream(&ts, VIDEO_PID);
        assert_eq!(es, [vec![1; 10], vec![2; 10], vec![3; 10]].concat());
    }

    #[test]
    fn continuity_counters_advance() {
        let ts = transport_stream(&[(vec![7; 2000], 0.0)]);
        let counters: Vec<u8> = ts
            .chunks(TS_PACKET_SIZE)
            .filter(|p| packet_pid(p) == VIDEO_PID)
            .map(|p| p[3] & 0x0F)
            .collect();
        assert!(counters.len() > 10);
        for (i, cc) in counters.iter().enumerate() {
            assert_eq!(usize::from(*cc), i % 16);
        }
    }
}
