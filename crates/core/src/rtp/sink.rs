//! The generic multi-frame RTP packetizer and its pacing driver.

use std::time::{Duration, Instant};

use super::buffer::OutPacketBuffer;
use super::{FramePiece, PayloadFormat, RtpHeader};
use crate::config::SinkConfig;
use crate::error::Result;
use crate::frame::{Frame, FrameSource, Pull};
use crate::transport::PacketTransport;

/// How long [`run_to_completion`] backs off when the source has nothing yet.
const INPUT_BACKOFF: Duration = Duration::from_millis(5);

/// What the sink needs from its driver next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkPoll {
    /// Poll again at this instant.
    SendAt(Instant),
    /// The source had no frame ready; poll again once it may have.
    WaitForInput,
    /// The source closed and the last packet has been sent.
    Finished,
}

/// Counters kept by a [`MultiFramedSink`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkStats {
    pub packets_sent: u64,
    /// Payload bytes sent, RTP headers excluded.
    pub octets_sent: u64,
    pub frames_packed: u64,
    /// Frames that arrived truncated because they exceeded `buffer_size`.
    pub truncated_frames: u64,
}

enum Input {
    Frame(Frame),
    Pending,
    Closed,
}

enum Packed {
    /// Room remains; try another frame.
    More,
    /// The packet is complete.
    PacketFull,
    Pending,
    SourceClosed,
}

/// Packs frames from a [`FrameSource`] into RTP packets.
///
/// Each packet is built from the frames that fit under the maximum packet
/// size. A frame that cannot go into the current packet waits in the buffer's
/// overflow slot and starts the next one. A frame larger than a whole packet
/// is fragmented, subject to the [`PayloadFormat`]'s rules. After each packet
/// the next send time advances by the durations of the frames it completed.
pub struct MultiFramedSink<F, T> {
    source: F,
    format: Box<dyn PayloadFormat>,
    transport: T,
    header: RtpHeader,
    buf: OutPacketBuffer,
    buffer_size: usize,
    packet_open: bool,
    cur_fragmentation_offset: usize,
    previous_frame_ended_fragmentation: bool,
    next_send_time: Option<Instant>,
    source_closed: bool,
    finished: bool,
    stats: SinkStats,
}

impl<F: FrameSource, T: PacketTransport> MultiFramedSink<F, T> {
    pub fn new(
        source: F,
        format: Box<dyn PayloadFormat>,
        transport: T,
        config: &SinkConfig,
    ) -> Result<Self> {
        config.validate()?;
        let pt = config
            .payload_type
            .unwrap_or_else(|| format.default_payload_type());
        tracing::info!(
            encoding = format.encoding_name(),
            pt,
            max_packet_size = config.max_packet_size,
            "RTP sink created"
        );
        Ok(Self {
            header: RtpHeader::from_config(pt, config),
            buf: OutPacketBuffer::new(config.preferred_packet_size, config.max_packet_size),
            buffer_size: config.buffer_size,
            source,
            format,
            transport,
            packet_open: false,
            cur_fragmentation_offset: 0,
            previous_frame_ended_fragmentation: false,
            next_send_time: None,
            source_closed: false,
            finished: false,
            stats: SinkStats::default(),
        })
    }

    pub fn format(&self) -> &dyn PayloadFormat {
        self.format.as_ref()
    }

    pub fn payload_type(&self) -> u8 {
        self.header.pt
    }

    pub fn ssrc(&self) -> u32 {
        self.header.ssrc
    }

    /// Sequence number of the next packet.
    pub fn next_sequence(&self) -> u16 {
        self.header.sequence()
    }

    pub fn stats(&self) -> SinkStats {
        self.stats
    }

    pub fn source(&self) -> &F {
        &self.source
    }

    pub fn source_mut(&mut self) -> &mut F {
        &mut self.source
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn into_parts(self) -> (F, T) {
        (self.source, self.transport)
    }

    /// Discard the packet under construction and any overflow, e.g. after
    /// the source was repositioned. Pacing restarts at the next poll.
    pub fn flush(&mut self) {
        self.buf.reset_overflow();
        self.packet_open = false;
        self.cur_fragmentation_offset = 0;
        self.previous_frame_ended_fragmentation = false;
        self.next_send_time = None;
        self.source_closed = false;
        self.finished = false;
    }

    /// Advance as far as possible at time `now`.
    ///
    /// Builds and sends packets whose send time has come. A packet being
    /// built when the source runs dry is kept and completed on a later poll.
    pub fn poll(&mut self, now: Instant) -> Result<SinkPoll> {
        if self.finished {
            return Ok(SinkPoll::Finished);
        }
        let next_send_time = *self.next_send_time.get_or_insert(now);
        if !self.packet_open {
            if next_send_time > now {
                return Ok(SinkPoll::SendAt(next_send_time));
            }
            self.begin_packet();
        }
        loop {
            match self.pack_frame()? {
                Packed::More => continue,
                Packed::PacketFull => {
                    self.send_packet()?;
                    if self.source_closed && !self.buf.have_overflow_data() {
                        return Ok(self.finish());
                    }
                    let next = self.next_send_time.unwrap_or(now);
                    return Ok(SinkPoll::SendAt(next));
                }
                Packed::Pending => return Ok(SinkPoll::WaitForInput),
                Packed::SourceClosed => {
                    self.send_packet()?;
                    return Ok(self.finish());
                }
            }
        }
    }

    fn finish(&mut self) -> SinkPoll {
        self.finished = true;
        tracing::info!(
            packets = self.stats.packets_sent,
            octets = self.stats.octets_sent,
            frames = self.stats.frames_packed,
            "RTP sink finished"
        );
        SinkPoll::Finished
    }

    fn begin_packet(&mut self) {
        let special = self.format.special_header_size(self.cur_fragmentation_offset);
        self.buf.begin_packet(special);
        self.packet_open = true;
    }

    fn next_input_frame(&mut self) -> Result<Input> {
        if let Some(overflow) = self.buf.take_overflow() {
            return Ok(Input::Frame(overflow.frame));
        }
        if self.source_closed {
            return Ok(Input::Closed);
        }
        match self.source.next_frame(self.buffer_size)? {
            Pull::Frame(frame) => {
                if frame.truncated > 0 {
                    if self.stats.truncated_frames == 0 {
                        tracing::warn!(
                            buffer_size = self.buffer_size,
                            frame_size = frame.size() + frame.truncated,
                            dropped = frame.truncated,
                            "frame larger than the sink's buffer; increase buffer_size"
                        );
                    }
                    self.stats.truncated_frames += 1;
                }
                Ok(Input::Frame(frame))
            }
            Pull::Pending => Ok(Input::Pending),
            Pull::Closed => {
                self.source_closed = true;
                Ok(Input::Closed)
            }
        }
    }

    /// Bytes of a frame of `frame_size` that must wait for later packets.
    fn compute_overflow_for_new_frame(&self, frame_size: usize) -> usize {
        let fsh = self.format.frame_specific_header_size();
        let overflow = (self.buf.cur_packet_size() + fsh + frame_size).saturating_sub(self.buf.max_size());
        let used = frame_size - overflow;
        let granularity = self.format.fragment_granularity().max(1);
        let unaligned = used % granularity;
        if unaligned == used {
            overflow
        } else {
            overflow + unaligned
        }
    }

    fn pack_frame(&mut self) -> Result<Packed> {
        let frame = match self.next_input_frame()? {
            Input::Frame(frame) => frame,
            Input::Pending => return Ok(Packed::Pending),
            Input::Closed => return Ok(Packed::SourceClosed),
        };
        let frame_size = frame.size();
        let fsh = self.format.frame_specific_header_size();

        if !self.buf.is_first_frame_in_packet()
            && ((self.previous_frame_ended_fragmentation
                && !self.format.allow_other_frames_after_last_fragment())
                || !self.format.frame_can_appear_after_packet_start(&frame))
        {
            self.buf.set_overflow(frame);
            return Ok(Packed::PacketFull);
        }
        self.previous_frame_ended_fragmentation = false;

        let fragmentation_offset = self.cur_fragmentation_offset;
        let mut bytes_to_use = frame_size;
        let mut overflow_bytes = 0;
        if self.buf.would_overflow(fsh + frame_size) {
            let too_big = self.buf.is_too_big_for_a_packet(
                super::RTP_HEADER_SIZE + self.buf.special_header_size() + fsh + frame_size,
            );
            if too_big
                && (self.buf.is_first_frame_in_packet()
                    || self.format.allow_fragmentation_after_start())
            {
                overflow_bytes = self.compute_overflow_for_new_frame(frame_size);
                bytes_to_use = frame_size - overflow_bytes;
                self.cur_fragmentation_offset += bytes_to_use;
            } else {
                overflow_bytes = frame_size;
                bytes_to_use = 0;
            }
        } else if self.cur_fragmentation_offset > 0 {
            self.cur_fragmentation_offset = 0;
            self.previous_frame_ended_fragmentation = true;
        }

        if bytes_to_use == 0 && frame_size > 0 {
            self.buf.set_overflow(frame);
            return Ok(Packed::PacketFull);
        }

        if fsh > 0 {
            self.buf.skip(fsh);
        }
        let (used, rest) = frame.data.split_at(bytes_to_use);
        self.buf.append(used);
        if self.buf.is_first_frame_in_packet() {
            self.buf.set_timestamp(frame.presentation_time);
        }
        let piece = FramePiece {
            data: used,
            fragmentation_offset,
            num_remaining_bytes: overflow_bytes,
            presentation_time: frame.presentation_time,
            tag: &frame.tag,
        };
        self.format
            .do_special_frame_handling(&mut self.buf, &piece, &self.source);
        self.buf.count_frame();

        // Asked again with the frame just packed: a format that would take no
        // frame after this one (a VOP, a NAL unit) closes the packet now. The
        // next frame itself is checked when it arrives.
        let can_follow = self.format.frame_can_appear_after_packet_start(&frame);
        if overflow_bytes > 0 {
            let mut remainder = Frame::new(
                rest.to_vec(),
                frame.presentation_time,
                frame.duration,
                frame.tag.clone(),
            );
            remainder.truncated = frame.truncated;
            self.buf.set_overflow(remainder);
        } else {
            self.stats.frames_packed += 1;
            if let Some(next) = self.next_send_time.as_mut() {
                *next += frame.duration;
            }
        }

        if overflow_bytes > 0
            || self.buf.is_preferred_size()
            || self.buf.would_overflow(fsh + bytes_to_use)
            || (self.previous_frame_ended_fragmentation
                && !self.format.allow_other_frames_after_last_fragment())
            || !can_follow
        {
            Ok(Packed::PacketFull)
        } else {
            Ok(Packed::More)
        }
    }

    fn send_packet(&mut self) -> Result<()> {
        self.packet_open = false;
        if self.buf.is_first_frame_in_packet() {
            return Ok(());
        }
        let timestamp = self
            .header
            .rtp_timestamp(self.buf.timestamp().unwrap_or_default(), self.format.clock_rate());
        let header = self.header.write(self.buf.marker(), timestamp);
        let payload_len = self.buf.payload().len();
        let marker = self.buf.marker();
        let frames = self.buf.frames_in_packet();
        let packet = self.buf.finish(header);
        tracing::trace!(
            seq = u16::from_be_bytes([header[2], header[3]]),
            timestamp,
            marker,
            frames,
            size = packet.len(),
            "RTP packet"
        );
        self.transport.send_packet(packet)?;
        self.stats.packets_sent += 1;
        self.stats.octets_sent += payload_len as u64;
        Ok(())
    }
}

/// Drive `sink` on the current thread until its source closes.
///
/// Sleeps until each packet's send time, backing off briefly whenever the
/// source has nothing ready.
pub fn run_to_completion<F: FrameSource, T: PacketTransport>(
    sink: &mut MultiFramedSink<F, T>,
) -> Result<SinkStats> {
    loop {
        match sink.poll(Instant::now())? {
            SinkPoll::SendAt(at) => {
                let now = Instant::now();
                if at > now {
                    std::thread::sleep(at - now);
                }
            }
            SinkPoll::WaitForInput => std::thread::sleep(INPUT_BACKOFF),
            SinkPoll::Finished => return Ok(sink.stats()),
        }
    }
}
