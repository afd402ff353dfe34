//! Outgoing packet buffer with a one-frame overflow slot.

use std::time::Duration;

use super::RTP_HEADER_SIZE;
use crate::frame::Frame;

/// Frame bytes that did not fit the previous packet.
#[derive(Debug)]
pub struct Overflow {
    /// The frame, with `data` holding only the unsent remainder.
    pub frame: Frame,
}

/// One RTP packet under construction.
///
/// The layout is fixed header, special header, then frames. Header fields
/// that depend on the packet's contents (marker, timestamp, special header)
/// stay writable until [`finish`](Self::finish).
#[derive(Debug)]
pub struct OutPacketBuffer {
    packet: Vec<u8>,
    preferred_size: usize,
    max_size: usize,
    special_header_size: usize,
    frames_in_packet: usize,
    marker: bool,
    timestamp: Option<Duration>,
    packets_finished: u64,
    overflow: Option<Overflow>,
}

impl OutPacketBuffer {
    pub fn new(preferred_size: usize, max_size: usize) -> Self {
        Self {
            packet: Vec::with_capacity(max_size),
            preferred_size,
            max_size,
            special_header_size: 0,
            frames_in_packet: 0,
            marker: false,
            timestamp: None,
            packets_finished: 0,
            overflow: None,
        }
    }

    /// Start a new packet, reserving the fixed and special headers.
    pub fn begin_packet(&mut self, special_header_size: usize) {
        self.packet.clear();
        self.packet.resize(RTP_HEADER_SIZE + special_header_size, 0);
        self.special_header_size = special_header_size;
        self.frames_in_packet = 0;
        self.marker = false;
        self.timestamp = None;
    }

    pub fn cur_packet_size(&self) -> usize {
        self.packet.len()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Would `n` more bytes exceed the maximum packet size?
    pub fn would_overflow(&self, n: usize) -> bool {
        self.packet.len() + n > self.max_size
    }

    /// Is a packet of `n` bytes, headers included, larger than any packet may be?
    pub fn is_too_big_for_a_packet(&self, n: usize) -> bool {
        n > self.max_size
    }

    pub fn is_preferred_size(&self) -> bool {
        self.packet.len() >= self.preferred_size
    }

    pub fn append(&mut self, bytes: &[u8]) {
        debug_assert!(!self.would_overflow(bytes.len()));
        self.packet.extend_from_slice(bytes);
    }

    /// Reserve `n` zeroed bytes, e.g. for a per-frame header.
    pub fn skip(&mut self, n: usize) {
        self.packet.resize(self.packet.len() + n, 0);
    }

    pub fn special_header_size(&self) -> usize {
        self.special_header_size
    }

    /// Overwrite the start of the special header. Bytes past its size are ignored.
    pub fn set_special_header_bytes(&mut self, bytes: &[u8]) {
        let n = bytes.len().min(self.special_header_size);
        self.packet[RTP_HEADER_SIZE..RTP_HEADER_SIZE + n].copy_from_slice(&bytes[..n]);
    }

    pub fn set_special_header_word(&mut self, word: u32) {
        self.set_special_header_bytes(&word.to_be_bytes());
    }

    /// Frames packed so far, not counting the one being handled.
    pub fn frames_in_packet(&self) -> usize {
        self.frames_in_packet
    }

    pub fn is_first_frame_in_packet(&self) -> bool {
        self.frames_in_packet == 0
    }

    /// No packet has been sent from this buffer yet.
    pub fn is_first_packet(&self) -> bool {
        self.packets_finished == 0
    }

    pub(crate) fn count_frame(&mut self) {
        self.frames_in_packet += 1;
    }

    pub fn set_marker(&mut self) {
        self.marker = true;
    }

    pub fn marker(&self) -> bool {
        self.marker
    }

    pub fn set_timestamp(&mut self, presentation_time: Duration) {
        self.timestamp = Some(presentation_time);
    }

    pub fn timestamp(&self) -> Option<Duration> {
        self.timestamp
    }

    /// Payload written so far: everything after the fixed header.
    pub fn payload(&self) -> &[u8] {
        &self.packet[RTP_HEADER_SIZE..]
    }

    /// Write the fixed header and return the complete packet.
    pub fn finish(&mut self, header: [u8; RTP_HEADER_SIZE]) -> &[u8] {
        self.packet[..RTP_HEADER_SIZE].copy_from_slice(&header);
        self.packets_finished += 1;
        &self.packet
    }

    pub fn set_overflow(&mut self, frame: Frame) {
        debug_assert!(self.overflow.is_none(), "overflow slot already occupied");
        self.overflow = Some(Overflow { frame });
    }

    pub fn have_overflow_data(&self) -> bool {
        self.overflow.is_some()
    }

    pub fn take_overflow(&mut self) -> Option<Overflow> {
        self.overflow.take()
    }

    /// Drop the overflow slot, e.g. after a seek.
    pub fn reset_overflow(&mut self) {
        self.overflow = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameTag;

    #[test]
    fn sizes_include_headers() {
        let mut buf = OutPacketBuffer::new(40, 50);
        buf.begin_packet(4);
        assert_eq!(buf.cur_packet_size(), 16);
        assert!(!buf.would_overflow(34));
        assert!(buf.would_overflow(35));
        buf.append(&[1; 24]);
        assert!(buf.is_preferred_size());
        assert!(buf.is_too_big_for_a_packet(51));
        assert_eq!(buf.payload().len(), 28);
    }

    #[test]
    fn special_header_and_finish() {
        let mut buf = OutPacketBuffer::new(100, 200);
        buf.begin_packet(4);
        buf.append(&[0xAA, 0xBB]);
        buf.set_special_header_word(0x0102_0304);
        buf.set_marker();
        assert!(buf.is_first_packet());
        let packet = buf.finish([0x80; RTP_HEADER_SIZE]).to_vec();
        assert_eq!(&packet[12..], &[1, 2, 3, 4, 0xAA, 0xBB]);
        assert!(!buf.is_first_packet());

        buf.begin_packet(0);
        assert!(!buf.marker());
        assert!(buf.timestamp().is_none());
        assert_eq!(buf.cur_packet_size(), RTP_HEADER_SIZE);
    }

    #[test]
    fn overflow_slot() {
        let mut buf = OutPacketBuffer::new(100, 200);
        assert!(!buf.have_overflow_data());
        buf.set_overflow(Frame::new(vec![9; 10], Duration::ZERO, Duration::ZERO, FrameTag::Plain));
        assert!(buf.have_overflow_data());
        let overflow = buf.take_overflow().unwrap();
        assert_eq!(overflow.frame.size(), 10);
        assert!(buf.take_overflow().is_none());
    }
}
