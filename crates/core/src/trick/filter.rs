//! Frame selection for fast-forward and reverse play.
//!
//! The filter walks the index (backwards for negative scales) and delivers
//! the video elementary-stream bytes of selected frames, read straight out of
//! the Transport Stream packets the index points at. Every `|scale|`th frame
//! is due. When a due frame is an I frame (or the start of its frame group)
//! it is delivered; when it is any other frame, the most recent I frame group
//! is delivered again in its place. Reverse play always delivers a group
//! after the fact, by jumping back to its start.

use std::io::{Read, Seek};
use std::time::Duration;

use crate::error::{Result, StreamError};
use crate::frame::{Frame, FrameSource, FrameTag, Pull};
use crate::framer::ts::{SYNC_BYTE, TS_PACKET_SIZE};
use crate::index::{IndexFile, IndexRecord, RecordType};
use crate::source::{ByteSource, ReadOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    SkippingFrame,
    SavingAndDeliveringFrame,
    DeliveringSavedFrame,
}

/// Elementary-stream bytes to hand out once their packet has been read.
#[derive(Debug, Clone, Copy)]
struct Delivery {
    packet: u64,
    offset: usize,
    size: usize,
    record_type: RecordType,
}

enum Step {
    Deliver(Delivery),
    Continue,
    Closed,
}

enum Fetch {
    Ready,
    Pending,
    Closed,
}

pub struct TrickModeFilter<S, R> {
    source: S,
    index: IndexFile<R>,
    scale: u32,
    direction: i32,
    state: State,
    frame_count: u32,
    next_record: i64,
    saved_frame_start: i64,
    saved_sequential_record: i64,
    use_saved_frame_next_time: bool,
    first_pcr: Option<f64>,
    desired_pcr: f64,
    packet: [u8; TS_PACKET_SIZE],
    filled: usize,
    current_packet: Option<u64>,
    /// Packet the source is positioned at, if known.
    next_packet: Option<u64>,
    awaiting: Option<Delivery>,
    ended: bool,
}

impl<S: ByteSource, R: Read + Seek> TrickModeFilter<S, R> {
    /// `scale` is the signed speed factor; its magnitude is how many frames
    /// advance per frame delivered.
    pub fn new(source: S, index: IndexFile<R>, scale: i32) -> Result<Self> {
        if scale == 0 {
            return Err(StreamError::InvalidConfig("trick play scale must not be 0".into()));
        }
        Ok(Self {
            source,
            index,
            scale: scale.unsigned_abs(),
            direction: scale.signum(),
            state: State::SkippingFrame,
            frame_count: 0,
            next_record: 0,
            saved_frame_start: 0,
            saved_sequential_record: 0,
            use_saved_frame_next_time: false,
            first_pcr: None,
            desired_pcr: 0.0,
            packet: [0; TS_PACKET_SIZE],
            filled: 0,
            current_packet: None,
            next_packet: None,
            awaiting: None,
            ended: false,
        })
    }

    /// Continue from index record `record`.
    pub fn seek_to_record(&mut self, record: u64) {
        self.next_record = i64::try_from(record).unwrap_or(i64::MAX);
        self.awaiting = None;
        self.ended = false;
    }

    /// Next index record to be examined; negative once reverse play has
    /// passed the start of the index.
    pub fn next_index_record(&self) -> i64 {
        self.next_record
    }

    pub fn index_mut(&mut self) -> &mut IndexFile<R> {
        &mut self.index
    }

    pub fn into_parts(self) -> (S, IndexFile<R>) {
        (self.source, self.index)
    }

    fn frame_due(&mut self) -> bool {
        let due = self.frame_count % self.scale == 0;
        self.frame_count += 1;
        due
    }

    fn deliver_saved_frame(&mut self, pcr: f64) {
        self.state = State::DeliveringSavedFrame;
        self.saved_sequential_record = self.next_record;
        self.desired_pcr = pcr;
        self.next_record = self.saved_frame_start;
    }

    fn finish_saved_frame(&mut self) {
        self.next_record = self.saved_sequential_record;
        self.use_saved_frame_next_time = false;
        self.state = State::SkippingFrame;
    }

    fn delivery(record: &IndexRecord) -> Delivery {
        Delivery {
            packet: u64::from(record.packet_number),
            offset: usize::from(record.offset),
            size: usize::from(record.size),
            record_type: record.record_type,
        }
    }

    /// Examine the next index record.
    fn step(&mut self) -> Result<Step> {
        let record_num = self.next_record;
        let in_range = u64::try_from(record_num).is_ok_and(|r| r < self.index.num_records());
        if !in_range {
            if self.state != State::DeliveringSavedFrame {
                return Ok(Step::Closed);
            }
            self.finish_saved_frame();
            return Ok(Step::Continue);
        }
        let record = self.index.read_record(record_num as u64)?;
        self.first_pcr.get_or_insert(record.pcr);
        self.next_record += if self.state == State::DeliveringSavedFrame {
            1
        } else {
            i64::from(self.direction)
        };

        let iframe_start = self.index.starts_frame_group(record_num as u64)?;
        let non_iframe_start = record.frame_start && record.record_type == RecordType::NonIFrame;

        match self.state {
            State::SkippingFrame | State::SavingAndDeliveringFrame => {
                if iframe_start {
                    self.saved_frame_start = record_num;
                    self.use_saved_frame_next_time = true;
                    if self.frame_due() {
                        self.frame_count = 1;
                        if self.direction > 0 {
                            self.state = State::SavingAndDeliveringFrame;
                            self.desired_pcr = record.pcr;
                            return Ok(Step::Deliver(Self::delivery(&record)));
                        }
                        self.deliver_saved_frame(record.pcr);
                    } else {
                        self.state = State::SkippingFrame;
                    }
                } else if non_iframe_start {
                    if self.frame_due() && self.use_saved_frame_next_time {
                        self.frame_count = 1;
                        self.deliver_saved_frame(record.pcr);
                    } else {
                        self.state = State::SkippingFrame;
                    }
                } else if self.state == State::SavingAndDeliveringFrame {
                    return Ok(Step::Deliver(Self::delivery(&record)));
                }
            }
            State::DeliveringSavedFrame => {
                if (iframe_start && record_num != self.saved_frame_start) || non_iframe_start {
                    self.finish_saved_frame();
                } else {
                    return Ok(Step::Deliver(Self::delivery(&record)));
                }
            }
        }
        Ok(Step::Continue)
    }

    /// Read TS packet `packet` into the packet buffer.
    fn fetch_packet(&mut self, packet: u64) -> Result<Fetch> {
        if self.current_packet == Some(packet) {
            return Ok(Fetch::Ready);
        }
        if self.next_packet != Some(packet) {
            self.source.seek_to_byte(packet * TS_PACKET_SIZE as u64)?;
            self.next_packet = Some(packet);
            self.filled = 0;
        }
        self.current_packet = None;
        while self.filled < TS_PACKET_SIZE {
            match self.source.read(&mut self.packet[self.filled..])? {
                ReadOutcome::Data(n) => self.filled += n,
                ReadOutcome::Pending => return Ok(Fetch::Pending),
                ReadOutcome::Closed => {
                    tracing::warn!(packet, "Transport Stream ended before an indexed packet");
                    return Ok(Fetch::Closed);
                }
            }
        }
        self.filled = 0;
        self.next_packet = Some(packet + 1);
        if self.packet[0] != SYNC_BYTE {
            tracing::warn!(packet, "indexed packet has no sync byte");
            return Ok(Fetch::Closed);
        }
        self.current_packet = Some(packet);
        Ok(Fetch::Ready)
    }

    fn take_delivery(&self, delivery: Delivery, max_size: usize) -> Frame {
        let data = &self.packet[delivery.offset..delivery.offset + delivery.size];
        let take = data.len().min(max_size);
        let first_pcr = self.first_pcr.unwrap_or(self.desired_pcr);
        let seconds = (f64::from(self.direction) * (self.desired_pcr - first_pcr) / f64::from(self.scale)).max(0.0);
        let mut frame = Frame::new(
            data[..take].to_vec(),
            Duration::from_secs_f64(seconds),
            Duration::ZERO,
            FrameTag::Indexed {
                record_type: delivery.record_type as u8,
            },
        );
        frame.truncated = data.len() - take;
        frame
    }
}

impl<S: ByteSource, R: Read + Seek> FrameSource for TrickModeFilter<S, R> {
    fn next_frame(&mut self, max_size: usize) -> Result<Pull> {
        if self.ended {
            return Ok(Pull::Closed);
        }
        loop {
            if let Some(delivery) = self.awaiting {
                match self.fetch_packet(delivery.packet)? {
                    Fetch::Ready => {}
                    Fetch::Pending => return Ok(Pull::Pending),
                    Fetch::Closed => {
                        self.ended = true;
                        return Ok(Pull::Closed);
                    }
                }
                self.awaiting = None;
                return Ok(Pull::Frame(self.take_delivery(delivery, max_size)));
            }
            match self.step()? {
                Step::Deliver(delivery) if delivery.size == 0 => {}
                Step::Deliver(delivery) if delivery.offset + delivery.size > TS_PACKET_SIZE => {
                    tracing::warn!(
                        packet = delivery.packet,
                        offset = delivery.offset,
                        size = delivery.size,
                        "index record overruns its packet"
                    );
                    self.ended = true;
                    return Ok(Pull::Closed);
                }
                Step::Deliver(delivery) => self.awaiting = Some(delivery),
                Step::Continue => {}
                Step::Closed => {
                    tracing::debug!(next_record = self.next_record, "trick play reached the end of the index");
                    self.ended = true;
                    return Ok(Pull::Closed);
                }
            }
        }
    }

    fn flush_input(&mut self) {
        self.awaiting = None;
        self.current_packet = None;
        self.next_packet = None;
        self.filled = 0;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::index::tests::{file_of, gop_index};
    use crate::source::MemorySource;

    /// `count` packets on PID 0xE0 whose 184 payload bytes all equal the packet number.
    pub fn numbered_packets(count: usize) -> Vec<u8> {
        (0..count)
            .flat_map(|i| {
                let mut p = vec![i as u8; TS_PACKET_SIZE];
                p[..4].copy_from_slice(&[SYNC_BYTE, 0x00, 0xE0, 0x10 | (i as u8 & 0x0F)]);
                p
            })
            .collect()
    }

    fn play(scale: i32, start: u64) -> Vec<(u8, f64)> {
        let records = gop_index(3, 3);
        let mut filter = TrickModeFilter::new(
            MemorySource::new(numbered_packets(records.len())),
            file_of(&records),
            scale,
        )
        .unwrap();
        filter.seek_to_record(start);
        let mut out = Vec::new();
        loop {
            match filter.next_frame(1000).unwrap() {
                Pull::Frame(f) => {
                    assert_eq!(f.size(), 184);
                    assert!(f.data.iter().all(|b| *b == f.data[0]));
                    out.push((f.data[0], f.presentation_time.as_secs_f64()));
                }
                Pull::Pending => panic!("memory source never pends"),
                Pull::Closed => return out,
            }
        }
    }

    fn packets(played: &[(u8, f64)]) -> Vec<u8> {
        played.iter().map(|(p, _)| *p).collect()
    }

    #[test]
    fn zero_scale_rejected() {
        let index: IndexFile<Cursor<Vec<u8>>> = file_of(&gop_index(1, 1));
        assert!(TrickModeFilter::new(MemorySource::new(Vec::new()), index, 0).is_err());
    }

    #[test]
    fn fast_forward_repeats_saved_iframes() {
        let played = play(2, 0);
        assert_eq!(
            packets(&played),
            vec![0, 1, 2, 0, 1, 2, 6, 7, 8, 6, 7, 8, 12, 13, 14, 12, 13, 14]
        );
        // the chunks of one frame share a time; time runs at half the PCR rate
        assert!(played[..3].iter().all(|(_, t)| *t == 0.0));
        assert!(played[3..6].iter().all(|(_, t)| *t == played[3].1));
        assert!((played[3].1 - 0.04).abs() < 0.01);
        assert!(played.windows(2).all(|w| w[0].1 <= w[1].1));
    }

    #[test]
    fn reverse_plays_iframes_backwards() {
        let played = play(-1, 17);
        assert_eq!(packets(&played), vec![12, 13, 14, 6, 7, 8, 0, 1, 2]);
        assert!(played.windows(2).all(|w| w[0].1 <= w[1].1));
        assert!((played.last().unwrap().1 - 0.44).abs() < 0.01);
    }

    #[test]
    fn reverse_at_double_speed_skips_groups() {
        assert_eq!(packets(&play(-2, 17)), vec![12, 13, 14, 6, 7, 8]);
    }

    #[test]
    fn position_follows_the_index() {
        let records = gop_index(2, 2);
        let mut filter = TrickModeFilter::new(
            MemorySource::new(numbered_packets(records.len())),
            file_of(&records),
            -1,
        )
        .unwrap();
        filter.seek_to_record(9);
        while !matches!(filter.next_frame(1000).unwrap(), Pull::Closed) {}
        assert!(filter.next_index_record() < 0);
    }
}
