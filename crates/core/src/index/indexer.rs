//! Build an index file from an MPEG-1/2 video Transport Stream.
//!
//! Each TS packet of the video PID contributes one provisional record for the
//! elementary-stream bytes it carries. Once the bytes of a whole unit
//! (sequence header, GOP header, picture) have arrived, the records covering
//! it are retagged, split where a unit boundary falls inside a packet, and
//! released in order.

use std::collections::VecDeque;
use std::io::Write;
use std::time::Duration;

use super::{IndexRecord, RecordType};
use crate::error::{Result, StreamError};
use crate::framer::ts::{SYNC_BYTE, TS_PACKET_SIZE, packet_pcr, packet_pid};
use crate::source::{ByteSource, ReadOutcome};

const PAT_PID: u16 = 0x00;
const PICTURE_START_CODE: u8 = 0x00;
const SEQUENCE_HEADER_CODE: u8 = 0xB3;
const SEQUENCE_END_CODE: u8 = 0xB7;
const GROUP_START_CODE: u8 = 0xB8;
const PENDING_RETRY: Duration = Duration::from_millis(10);

fn is_video_stream_type(stream_type: u8) -> bool {
    matches!(stream_type, 0x01 | 0x02)
}

/// Position of the first `00 00 01 xx` at or after `from`, where `xx` is
/// accepted by `wanted`.
fn find_start_code(buf: &[u8], from: usize, wanted: impl Fn(u8) -> bool) -> Option<usize> {
    (from..buf.len().saturating_sub(3))
        .find(|&i| buf[i] == 0 && buf[i + 1] == 0 && buf[i + 2] == 1 && wanted(buf[i + 3]))
}

/// Record type of the unit starting at `buf[0]`.
fn classify(buf: &[u8]) -> RecordType {
    match buf[3] {
        SEQUENCE_HEADER_CODE => RecordType::VideoSequenceHeader,
        GROUP_START_CODE => RecordType::GroupOfPictures,
        PICTURE_START_CODE if buf.len() > 5 && (buf[5] >> 3) & 0x07 == 1 => RecordType::IFrame,
        _ => RecordType::NonIFrame,
    }
}

/// Whether start code `code` ends a unit that began with `unit_code`.
/// Pictures keep their slices; sequence headers keep their extensions.
fn ends_unit(unit_code: u8, code: u8) -> bool {
    match unit_code {
        SEQUENCE_HEADER_CODE => matches!(code, GROUP_START_CODE | PICTURE_START_CODE | SEQUENCE_HEADER_CODE),
        GROUP_START_CODE => matches!(code, PICTURE_START_CODE | SEQUENCE_HEADER_CODE | GROUP_START_CODE),
        _ => matches!(
            code,
            PICTURE_START_CODE | SEQUENCE_HEADER_CODE | GROUP_START_CODE | SEQUENCE_END_CODE
        ),
    }
}

/// Incremental index builder. Feed it packets with
/// [`push_packet`](Self::push_packet), collect records with
/// [`pop_record`](Self::pop_record), and call [`finish`](Self::finish) at the
/// end of the stream.
#[derive(Debug, Default)]
pub struct IndexBuilder {
    pmt_pid: Option<u16>,
    video_pid: Option<u16>,
    last_continuity: Option<u8>,
    first_pcr: Option<f64>,
    last_pcr: f64,
    packets: u64,
    parse_buffer: Vec<u8>,
    /// Provisional records; their sizes add up to `parse_buffer.len()`.
    unparsed: VecDeque<IndexRecord>,
    scan_from: usize,
    ready: VecDeque<IndexRecord>,
}

impl IndexBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn video_pid(&self) -> Option<u16> {
        self.video_pid
    }

    pub fn packets(&self) -> u64 {
        self.packets
    }

    pub fn pop_record(&mut self) -> Option<IndexRecord> {
        self.ready.pop_front()
    }

    pub fn push_packet(&mut self, packet: &[u8]) -> Result<()> {
        if packet.len() != TS_PACKET_SIZE || packet[0] != SYNC_BYTE {
            return Err(StreamError::LostSync {
                offset: self.packets * TS_PACKET_SIZE as u64,
            });
        }
        let packet_number = self.packets;
        self.packets += 1;

        let adaptation_field_control = (packet[3] & 0x30) >> 4;
        let mut header_size = if adaptation_field_control <= 1 {
            4
        } else {
            5 + usize::from(packet[4])
        };
        if (adaptation_field_control == 2 && header_size != TS_PACKET_SIZE)
            || (adaptation_field_control == 3 && header_size >= TS_PACKET_SIZE)
        {
            tracing::warn!(packet_number, length = packet[4], "bad adaptation_field_length");
            return Ok(());
        }

        if let Some(pcr) = packet_pcr(packet) {
            match self.first_pcr {
                None => self.first_pcr = Some(pcr.seconds),
                Some(ref mut first) if pcr.seconds < self.last_pcr => {
                    tracing::warn!(
                        at = self.last_pcr - *first,
                        from = self.last_pcr,
                        to = pcr.seconds,
                        "PCR went backwards"
                    );
                    *first -= self.last_pcr - pcr.seconds;
                }
                Some(_) => {}
            }
            self.last_pcr = pcr.seconds;
        }

        let pid = packet_pid(packet);
        let payload = &packet[header_size..];
        if pid == PAT_PID {
            self.analyze_pat(payload);
        } else if Some(pid) == self.pmt_pid {
            self.analyze_pmt(payload);
        }

        let continuity = packet[3] & 0x0F;
        let has_payload = adaptation_field_control == 1 || adaptation_field_control == 3;
        if Some(pid) != self.video_pid || !has_payload || Some(continuity) == self.last_continuity {
            return Ok(());
        }
        self.last_continuity = Some(continuity);

        let unit_start = packet[1] & 0x40 != 0;
        if unit_start
            && header_size < TS_PACKET_SIZE - 8
            && packet[header_size..header_size + 3] == [0x00, 0x00, 0x01]
        {
            header_size += 9 + usize::from(packet[header_size + 8]);
            if header_size >= TS_PACKET_SIZE {
                tracing::warn!(packet_number, "PES header overruns its packet");
                return Ok(());
            }
        }

        let es = &packet[header_size..];
        self.parse_buffer.extend_from_slice(es);
        self.unparsed.push_back(IndexRecord {
            record_type: RecordType::Unparsed,
            frame_start: false,
            offset: header_size as u8,
            size: es.len() as u8,
            pcr: self.first_pcr.map_or(0.0, |first| self.last_pcr - first),
            packet_number: u32::try_from(packet_number).unwrap_or(u32::MAX),
        });
        self.parse_frames();
        Ok(())
    }

    /// Classify whatever remains once the stream has ended.
    pub fn finish(&mut self) {
        let len = self.parse_buffer.len();
        if len == 0 {
            return;
        }
        let record_type = if find_start_code(&self.parse_buffer, 0, |_| true) == Some(0) {
            classify(&self.parse_buffer)
        } else {
            RecordType::Junk
        };
        self.emit(record_type, len);
    }

    fn analyze_pat(&mut self, payload: &[u8]) {
        let Some(section) = psi_section(payload) else {
            return;
        };
        // programs start after the 8-byte section header and stop before the CRC
        let programs = section.get(8..section.len().saturating_sub(4)).unwrap_or(&[]);
        for program in programs.chunks_exact(4) {
            let program_number = u16::from_be_bytes([program[0], program[1]]);
            if program_number != 0 {
                let pid = (u16::from(program[2] & 0x1F) << 8) | u16::from(program[3]);
                if self.pmt_pid != Some(pid) {
                    tracing::debug!(pid, program_number, "found PMT PID");
                    self.pmt_pid = Some(pid);
                }
                return;
            }
        }
    }

    fn analyze_pmt(&mut self, payload: &[u8]) {
        let Some(section) = psi_section(payload) else {
            return;
        };
        if section.len() < 12 {
            return;
        }
        let program_info_length = (usize::from(section[10] & 0x0F) << 8) | usize::from(section[11]);
        let end = section.len().saturating_sub(4);
        let mut at = 12 + program_info_length;
        while at + 5 <= end {
            let stream_type = section[at];
            let pid = (u16::from(section[at + 1] & 0x1F) << 8) | u16::from(section[at + 2]);
            let es_info_length = (usize::from(section[at + 3] & 0x0F) << 8) | usize::from(section[at + 4]);
            if is_video_stream_type(stream_type) {
                if self.video_pid != Some(pid) {
                    tracing::debug!(pid, stream_type, "found video PID");
                    self.video_pid = Some(pid);
                }
                return;
            }
            at += 5 + es_info_length;
        }
    }

    fn parse_frames(&mut self) {
        loop {
            let buf = &self.parse_buffer;
            if buf.len() < 4 {
                return;
            }
            match find_start_code(buf, 0, |_| true) {
                Some(0) => {}
                Some(junk) => {
                    self.emit(RecordType::Junk, junk);
                    continue;
                }
                None => {
                    // keep bytes that may begin a start code
                    let junk = buf.len() - 3;
                    self.emit(RecordType::Junk, junk);
                    return;
                }
            }
            let record_type = classify(buf);
            let unit_code = buf[3];
            match find_start_code(buf, self.scan_from.max(4), |c| ends_unit(unit_code, c)) {
                Some(end) => {
                    self.emit(record_type, end);
                }
                None => {
                    self.scan_from = buf.len().saturating_sub(3).max(4);
                    return;
                }
            }
        }
    }

    /// Release records covering the first `len` bytes of the parse buffer.
    fn emit(&mut self, record_type: RecordType, len: usize) {
        let mut remaining = len;
        let mut first = true;
        while remaining > 0 {
            let Some(mut record) = self.unparsed.pop_front() else {
                break;
            };
            let size = usize::from(record.size);
            if size > remaining {
                let mut rest = record;
                rest.offset += remaining as u8;
                rest.size -= remaining as u8;
                self.unparsed.push_front(rest);
                record.size = remaining as u8;
            }
            remaining -= usize::from(record.size);
            if record_type == RecordType::Junk || record.size == 0 {
                continue;
            }
            record.record_type = record_type;
            record.frame_start = first;
            first = false;
            self.ready.push_back(record);
        }
        self.parse_buffer.drain(..len);
        self.scan_from = 0;
        if record_type == RecordType::Junk {
            tracing::debug!(bytes = len, "skipped bytes outside any video unit");
        }
    }
}

/// The section following a PSI pointer field, trimmed to its declared length.
fn psi_section(payload: &[u8]) -> Option<&[u8]> {
    let pointer = usize::from(*payload.first()?);
    let section = payload.get(1 + pointer..)?;
    if section.len() < 3 {
        return None;
    }
    let section_length = (usize::from(section[1] & 0x0F) << 8) | usize::from(section[2]);
    section.get(..3 + section_length)
}

/// Summary of an indexing run.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct IndexSummary {
    pub packets: u64,
    pub records: u64,
    /// PCR of the last record, seconds.
    pub duration: f64,
}

/// Index a whole Transport Stream, writing the records to `writer`.
pub fn write_index<S: ByteSource, W: Write>(mut source: S, mut writer: W) -> Result<IndexSummary> {
    let mut builder = IndexBuilder::new();
    let mut summary = IndexSummary::default();
    let mut packet = [0u8; TS_PACKET_SIZE];
    let mut filled = 0;

    let drain = |builder: &mut IndexBuilder, writer: &mut W, summary: &mut IndexSummary| -> Result<()> {
        while let Some(record) = builder.pop_record() {
            writer.write_all(&record.to_bytes())?;
            summary.records += 1;
            summary.duration = record.pcr;
        }
        Ok(())
    };

    loop {
        match source.read(&mut packet[filled..])? {
            ReadOutcome::Data(n) => {
                filled += n;
                if filled == TS_PACKET_SIZE {
                    builder.push_packet(&packet)?;
                    filled = 0;
                    drain(&mut builder, &mut writer, &mut summary)?;
                }
            }
            ReadOutcome::Pending => std::thread::sleep(PENDING_RETRY),
            ReadOutcome::Closed => break,
        }
    }
    if filled > 0 {
        tracing::warn!(bytes = filled, "ignoring partial packet at end of stream");
    }
    builder.finish();
    drain(&mut builder, &mut writer, &mut summary)?;
    writer.flush()?;

    summary.packets = builder.packets();
    if builder.video_pid().is_none() {
        tracing::warn!("no MPEG-1/2 video stream found");
    }
    tracing::info!(
        packets = summary.packets,
        records = summary.records,
        duration = summary.duration,
        "index written"
    );
    Ok(summary)
}
