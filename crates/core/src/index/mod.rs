//! Transport Stream index files.
//!
//! An index file is a flat array of 11-byte records, one per Transport
//! Stream packet (or part of one) that carries video elementary-stream data:
//!
//! ```text
//! byte 0      record type; bit 7 set on the first record of a frame
//! byte 1      offset of the elementary-stream data within the TS packet
//! byte 2      size of that data
//! bytes 3-5   PCR seconds since the first PCR, integer part (little-endian)
//! byte 6      PCR fractional part, 1/256 s
//! bytes 7-10  TS packet number (little-endian)
//! ```
//!
//! [`indexer`] builds index files; [`IndexFile`] searches them.

pub mod indexer;

pub use indexer::{IndexBuilder, write_index};

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use crate::error::{Result, StreamError};

pub const INDEX_RECORD_SIZE: usize = 11;
const FRAME_START_FLAG: u8 = 0x80;

/// What the elementary-stream data of a record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    /// Not yet analyzed. Never written to a file.
    Unparsed = 0,
    VideoSequenceHeader = 1,
    GroupOfPictures = 2,
    /// A P or B picture, or slices of any picture type.
    NonIFrame = 3,
    IFrame = 4,
    /// Bytes belonging to no recognized unit. Never written to a file.
    Junk = 5,
}

impl RecordType {
    pub fn from_u8(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::Unparsed,
            1 => Self::VideoSequenceHeader,
            2 => Self::GroupOfPictures,
            3 => Self::NonIFrame,
            4 => Self::IFrame,
            5 => Self::Junk,
            _ => return None,
        })
    }

    /// Sequence and GOP headers introduce a point where decoding can start.
    pub fn is_header(self) -> bool {
        matches!(self, Self::VideoSequenceHeader | Self::GroupOfPictures)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndexRecord {
    pub record_type: RecordType,
    pub frame_start: bool,
    /// Offset of the elementary-stream data within its TS packet.
    pub offset: u8,
    pub size: u8,
    /// Seconds since the first PCR of the stream.
    pub pcr: f64,
    pub packet_number: u32,
}

impl IndexRecord {
    pub fn to_bytes(&self) -> [u8; INDEX_RECORD_SIZE] {
        let pcr = self.pcr.max(0.0);
        let whole = (pcr as u32).min(0x00FF_FFFF);
        let fraction = ((pcr - f64::from(whole)) * 256.0).clamp(0.0, 255.0) as u8;
        let whole = whole.to_le_bytes();
        let packet = self.packet_number.to_le_bytes();
        let flag = if self.frame_start { FRAME_START_FLAG } else { 0 };
        [
            self.record_type as u8 | flag,
            self.offset,
            self.size,
            whole[0],
            whole[1],
            whole[2],
            fraction,
            packet[0],
            packet[1],
            packet[2],
            packet[3],
        ]
    }

    /// `None` for an unknown record type.
    pub fn from_bytes(bytes: &[u8; INDEX_RECORD_SIZE]) -> Option<Self> {
        let record_type = RecordType::from_u8(bytes[0] & !FRAME_START_FLAG)?;
        let whole = u32::from_le_bytes([bytes[3], bytes[4], bytes[5], 0]);
        Some(Self {
            record_type,
            frame_start: bytes[0] & FRAME_START_FLAG != 0,
            offset: bytes[1],
            size: bytes[2],
            pcr: f64::from(whole) + f64::from(bytes[6]) / 256.0,
            packet_number: u32::from_le_bytes([bytes[7], bytes[8], bytes[9], bytes[10]]),
        })
    }
}

/// Result of an index lookup.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct IndexPosition {
    /// PCR of the record found, seconds.
    pub npt: f64,
    pub packet_number: u64,
    pub record: u64,
}

/// Reader over an index file.
///
/// Lookups use interpolation (regula falsi) over the record array, falling
/// back to bisection whenever the interpolated guess would not narrow the
/// bracket. The last answer of each lookup kind is cached.
#[derive(Debug)]
pub struct IndexFile<R> {
    reader: R,
    num_records: u64,
    last_time_lookup: Option<(f64, IndexPosition)>,
    last_packet_lookup: Option<(u64, bool, IndexPosition)>,
}

impl IndexFile<File> {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        tracing::debug!(path = %path.display(), "opened index file");
        Self::new(file)
    }
}

impl<R: Read + Seek> IndexFile<R> {
    pub fn new(mut reader: R) -> Result<Self> {
        let len = reader.seek(SeekFrom::End(0))?;
        let record_size = INDEX_RECORD_SIZE as u64;
        if len % record_size != 0 {
            tracing::warn!(
                len,
                trailing = len % record_size,
                "index file size is not a multiple of the record size"
            );
        }
        Ok(Self {
            reader,
            num_records: len / record_size,
            last_time_lookup: None,
            last_packet_lookup: None,
        })
    }

    pub fn num_records(&self) -> u64 {
        self.num_records
    }

    pub fn is_empty(&self) -> bool {
        self.num_records == 0
    }

    pub fn read_record(&mut self, record: u64) -> Result<IndexRecord> {
        if record >= self.num_records {
            return Err(StreamError::IndexRecordOutOfRange {
                record,
                count: self.num_records,
            });
        }
        self.reader
            .seek(SeekFrom::Start(record * INDEX_RECORD_SIZE as u64))?;
        let mut buf = [0u8; INDEX_RECORD_SIZE];
        self.reader.read_exact(&mut buf)?;
        Ok(IndexRecord::from_bytes(&buf).unwrap_or_else(|| {
            tracing::warn!(record, code = buf[0], "unknown index record type");
            IndexRecord {
                record_type: RecordType::Junk,
                frame_start: false,
                offset: buf[1],
                size: 0,
                pcr: 0.0,
                packet_number: u32::from_le_bytes([buf[7], buf[8], buf[9], buf[10]]),
            }
        }))
    }

    /// PCR of the last record: the stream's duration in seconds.
    pub fn playing_duration(&mut self) -> Result<f64> {
        if self.num_records == 0 {
            return Ok(0.0);
        }
        Ok(self.read_record(self.num_records - 1)?.pcr)
    }

    fn position(&mut self, record: u64) -> Result<IndexPosition> {
        let r = self.read_record(record)?;
        Ok(IndexPosition {
            npt: r.pcr,
            packet_number: u64::from(r.packet_number),
            record,
        })
    }

    /// The clean point at or before the last record whose PCR is `<= npt`.
    ///
    /// Times past the end map to the last record; times at or before zero
    /// map to the start.
    pub fn lookup_packet_from_time(&mut self, npt: f64) -> Result<IndexPosition> {
        if npt <= 0.0 || self.num_records == 0 {
            return Ok(IndexPosition::default());
        }
        if let Some((cached_npt, position)) = self.last_time_lookup {
            if cached_npt == npt {
                return Ok(position);
            }
        }

        let (mut left, mut right) = (0, self.num_records - 1);
        let mut pcr_left = self.read_record(left)?.pcr;
        let mut pcr_right = self.read_record(right)?.pcr;
        let target = npt.min(pcr_right);
        let found = if target <= pcr_left {
            0
        } else {
            // pcr_left < target <= pcr_right
            while right - left > 1 {
                let span = pcr_right - pcr_left;
                let mut guess = if span > 0.0 {
                    left + ((target - pcr_left) / span * (right - left) as f64) as u64
                } else {
                    left
                };
                if guess <= left || guess >= right {
                    guess = left + (right - left) / 2;
                }
                let pcr = self.read_record(guess)?.pcr;
                if pcr < target {
                    left = guess;
                    pcr_left = pcr;
                } else {
                    right = guess;
                    pcr_right = pcr;
                }
            }
            if pcr_right <= target { right } else { left }
        };

        let clean = self.rewind_to_clean_point(found)?;
        let position = self.position(clean)?;
        tracing::debug!(
            npt,
            record = position.record,
            packet = position.packet_number,
            found_npt = position.npt,
            "index lookup by time"
        );
        self.last_time_lookup = Some((npt, position));
        Ok(position)
    }

    /// The first record at or after TS packet `packet`, optionally moved back
    /// to the preceding clean point.
    pub fn lookup_time_from_packet(
        &mut self,
        packet: u64,
        rewind_to_clean_point: bool,
    ) -> Result<IndexPosition> {
        if packet == 0 || self.num_records == 0 {
            return Ok(IndexPosition::default());
        }
        if let Some((cached_packet, cached_rewind, position)) = self.last_packet_lookup {
            if cached_packet == packet && cached_rewind == rewind_to_clean_point {
                return Ok(position);
            }
        }

        let (mut left, mut right) = (0, self.num_records - 1);
        let mut packet_left = u64::from(self.read_record(left)?.packet_number);
        let mut packet_right = u64::from(self.read_record(right)?.packet_number);
        let target = packet.min(packet_right);
        let found = if target <= packet_left {
            0
        } else {
            while right - left > 1 {
                let span = (packet_right - packet_left) as f64;
                let mut guess = left + ((target - packet_left) as f64 / span * (right - left) as f64) as u64;
                if guess <= left || guess >= right {
                    guess = left + (right - left) / 2;
                }
                let at = u64::from(self.read_record(guess)?.packet_number);
                if at < target {
                    left = guess;
                    packet_left = at;
                } else {
                    right = guess;
                    packet_right = at;
                }
            }
            right
        };

        let found = if rewind_to_clean_point {
            self.rewind_to_clean_point(found)?
        } else {
            found
        };
        let position = self.position(found)?;
        self.last_packet_lookup = Some((packet, rewind_to_clean_point, position));
        Ok(position)
    }

    /// Move back from `record` to the start of a sequence header, or of a GOP
    /// header when no sequence header immediately precedes it.
    fn rewind_to_clean_point(&mut self, record: u64) -> Result<u64> {
        let mut ix = record;
        while ix > 0 {
            let r = self.read_record(ix)?;
            if r.frame_start {
                match r.record_type {
                    RecordType::VideoSequenceHeader => return Ok(ix),
                    RecordType::GroupOfPictures => {
                        let mut prev = ix;
                        while prev > 0 {
                            prev -= 1;
                            let p = self.read_record(prev)?;
                            if p.record_type != RecordType::VideoSequenceHeader {
                                break;
                            }
                            if p.frame_start {
                                return Ok(prev);
                            }
                        }
                        return Ok(ix);
                    }
                    _ => {}
                }
            }
            ix -= 1;
        }
        Ok(0)
    }

    /// Whether `record` begins an independently decodable frame group: the
    /// first of a run of sequence header, GOP header and I picture.
    pub fn starts_frame_group(&mut self, record: u64) -> Result<bool> {
        let r = self.read_record(record)?;
        let opens_group = r.record_type.is_header() || r.record_type == RecordType::IFrame;
        if !r.frame_start || !opens_group {
            return Ok(false);
        }
        if record == 0 {
            return Ok(true);
        }
        Ok(!self.read_record(record - 1)?.record_type.is_header())
    }

    pub fn into_inner(self) -> R {
        self.reader
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::io::Cursor;

    use super::*;

    pub fn record(record_type: RecordType, frame_start: bool, pcr: f64, packet_number: u32) -> IndexRecord {
        IndexRecord {
            record_type,
            frame_start,
            offset: 4,
            size: 184,
            pcr,
            packet_number,
        }
    }

    pub fn file_of(records: &[IndexRecord]) -> IndexFile<Cursor<Vec<u8>>> {
        let bytes: Vec<u8> = records.iter().flat_map(|r| r.to_bytes()).collect();
        IndexFile::new(Cursor::new(bytes)).unwrap()
    }

    /// GOPs of one VSH, one GOP header, one I picture and `p_frames` P pictures,
    /// one record each, 40 ms apart.
    pub fn gop_index(gops: usize, p_frames: usize) -> Vec<IndexRecord> {
        let mut records = Vec::new();
        let mut packet = 0;
        let mut pcr = 0.0;
        for _ in 0..gops {
            let mut push = |t, pcr: f64, packet: &mut u32| {
                records.push(record(t, true, pcr, *packet));
                *packet += 1;
            };
            push(RecordType::VideoSequenceHeader, pcr, &mut packet);
            push(RecordType::GroupOfPictures, pcr, &mut packet);
            push(RecordType::IFrame, pcr, &mut packet);
            for _ in 0..p_frames {
                pcr += 0.04;
                push(RecordType::NonIFrame, pcr, &mut packet);
            }
            pcr += 0.04;
        }
        records
    }

    #[test]
    fn record_layout() {
        let r = IndexRecord {
            record_type: RecordType::IFrame,
            frame_start: true,
            offset: 12,
            size: 176,
            pcr: 0x0102_03 as f64 + 0.5,
            packet_number: 0x0A0B_0C0D,
        };
        let bytes = r.to_bytes();
        assert_eq!(bytes, [0x84, 12, 176, 0x03, 0x02, 0x01, 0x80, 0x0D, 0x0C, 0x0B, 0x0A]);
        assert_eq!(IndexRecord::from_bytes(&bytes), Some(r));
        let mut unknown = bytes;
        unknown[0] = 0x7F;
        assert!(IndexRecord::from_bytes(&unknown).is_none());
    }

    #[test]
    fn partial_trailing_record_is_ignored() {
        let mut bytes: Vec<u8> = gop_index(1, 2).iter().flat_map(|r| r.to_bytes()).collect();
        bytes.extend_from_slice(&[1, 2, 3]);
        let mut index = IndexFile::new(Cursor::new(bytes)).unwrap();
        assert_eq!(index.num_records(), 5);
        assert!(matches!(
            index.read_record(5),
            Err(StreamError::IndexRecordOutOfRange { record: 5, count: 5 })
        ));
    }

    #[test]
    fn playing_duration_is_last_pcr() {
        let mut index = file_of(&gop_index(3, 4));
        let expected = index.read_record(index.num_records() - 1).unwrap().pcr;
        assert_eq!(index.playing_duration().unwrap(), expected);
        assert!(expected > 0.5);
        assert_eq!(file_of(&[]).playing_duration().unwrap(), 0.0);
    }

    #[test]
    fn time_lookup_never_overshoots() {
        // one sequence header, then P pictures: record 0 is the only clean point
        let mut records = vec![record(RecordType::VideoSequenceHeader, true, 0.0, 0)];
        for i in 1..200u32 {
            records.push(record(RecordType::NonIFrame, true, f64::from(i) * 0.25, i * 3));
        }
        let mut index = file_of(&records);
        for (i, r) in records.iter().enumerate() {
            let found = index.lookup_packet_from_time(r.pcr).unwrap();
            assert!(found.record <= i as u64);
            assert!(found.npt <= r.pcr);
        }
        assert_eq!(index.lookup_packet_from_time(30.1).unwrap().record, 0);
    }

    #[test]
    fn time_lookup_rewinds_to_sequence_header() {
        let records = gop_index(5, 11);
        let mut index = file_of(&records);
        // each GOP spans 0.48 s in 14 records
        let found = index.lookup_packet_from_time(1.2).unwrap();
        assert_eq!(found.record, 28);
        assert_eq!(records[28].record_type, RecordType::VideoSequenceHeader);
        assert!(found.npt <= 1.2);
        assert_eq!(found.packet_number, 28);

        assert_eq!(index.lookup_packet_from_time(0.0).unwrap(), IndexPosition::default());
        let end = index.lookup_packet_from_time(1000.0).unwrap();
        assert_eq!(end.record, 56);
        // cached
        assert_eq!(index.lookup_packet_from_time(1.2).unwrap().record, 28);
    }

    #[test]
    fn gop_without_sequence_header_is_a_clean_point() {
        let records = vec![
            record(RecordType::VideoSequenceHeader, true, 0.0, 0),
            record(RecordType::GroupOfPictures, true, 0.0, 1),
            record(RecordType::IFrame, true, 0.0, 2),
            record(RecordType::NonIFrame, true, 0.5, 3),
            record(RecordType::GroupOfPictures, true, 1.0, 4),
            record(RecordType::IFrame, true, 1.0, 5),
            record(RecordType::NonIFrame, true, 1.5, 6),
        ];
        let mut index = file_of(&records);
        assert_eq!(index.lookup_packet_from_time(1.6).unwrap().record, 4);
    }

    #[test]
    fn packet_lookup() {
        let records = gop_index(4, 5);
        let mut index = file_of(&records);
        let exact = index.lookup_time_from_packet(10, false).unwrap();
        assert_eq!(exact.record, 10);
        assert_eq!(exact.npt, records[10].pcr);
        let clean = index.lookup_time_from_packet(10, true).unwrap();
        assert_eq!(clean.record, 8);
        assert_eq!(index.lookup_time_from_packet(0, true).unwrap(), IndexPosition::default());
        assert_eq!(index.lookup_time_from_packet(10_000, false).unwrap().record, 31);
    }

    #[test]
    fn frame_group_starts() {
        let mut index = file_of(&gop_index(2, 2));
        let starts: Vec<bool> = (0..index.num_records())
            .map(|i| index.starts_frame_group(i).unwrap())
            .collect();
        assert_eq!(starts, vec![true, false, false, false, false, true, false, false, false, false]);
    }
}
