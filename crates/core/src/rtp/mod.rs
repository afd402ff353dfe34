//! RTP packetization.
//!
//! [`MultiFramedSink`] pulls frames from a [`FrameSource`](crate::frame::FrameSource)
//! and packs them into RTP packets no larger than the configured maximum,
//! fragmenting frames that do not fit. Everything codec-specific is behind
//! the [`PayloadFormat`] trait:
//!
//! | Format | Module | RFC | PT | Clock |
//! |--------|--------|-----|----|-------|
//! | `MPV` | [`mpeg_video`] | [RFC 2250](https://tools.ietf.org/html/rfc2250) | 32 | 90000 |
//! | `MPA` | [`mpeg_audio`] | RFC 2250 | 14 | 90000 |
//! | `MPA-ROBUST` | [`mp3_adu`] | [RFC 5219](https://tools.ietf.org/html/rfc5219) | dynamic | 90000 |
//! | `H264` | [`h264`] | [RFC 6184](https://tools.ietf.org/html/rfc6184) | dynamic | 90000 |
//! | `MP4V-ES` | [`mpeg4_video`] | [RFC 3016](https://tools.ietf.org/html/rfc3016) | dynamic | 90000 |
//! | `AC3` | [`ac3`] | [RFC 4184](https://tools.ietf.org/html/rfc4184) | dynamic | sample rate |
//! | `DV` | [`dv`] | [RFC 6469](https://tools.ietf.org/html/rfc6469) | dynamic | 90000 |
//! | `MP2T` | [`simple`] | RFC 2250 | 33 | 90000 |

pub mod ac3;
pub mod buffer;
pub mod dv;
pub mod h264;
pub mod mp3_adu;
pub mod mpeg4_video;
pub mod mpeg_audio;
pub mod mpeg_video;
pub mod simple;
pub mod sink;

pub use ac3::Ac3PayloadFormat;
pub use buffer::OutPacketBuffer;
pub use dv::DvPayloadFormat;
pub use h264::H264PayloadFormat;
pub use mp3_adu::Mp3AduPayloadFormat;
pub use mpeg4_video::Mpeg4VideoPayloadFormat;
pub use mpeg_audio::MpegAudioPayloadFormat;
pub use mpeg_video::MpegVideoPayloadFormat;
pub use simple::TransportStreamPayloadFormat;
pub use sink::{MultiFramedSink, SinkPoll, SinkStats, run_to_completion};

use std::time::Duration;

use rand::Rng;

use crate::config::SinkConfig;
use crate::frame::{Frame, FrameSource, FrameTag};

/// Size of the RTP fixed header without CSRCs (RFC 3550 §5.1).
pub const RTP_HEADER_SIZE: usize = 12;

/// First dynamic payload type (RFC 3551 §3).
pub const DYNAMIC_PAYLOAD_TYPE: u8 = 96;

/// RTP fixed header state (RFC 3550 §5.1).
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |V=2|P|X|  CC   |M|     PT      |       Sequence Number         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                           Timestamp                           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                             SSRC                              |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// The sequence number wraps at 16 bits. RTP timestamps are derived from
/// frame presentation times on top of a per-stream base offset, so the first
/// packet does not reveal where the media clock started.
#[derive(Debug)]
pub struct RtpHeader {
    pub pt: u8,
    pub ssrc: u32,
    sequence: u16,
    timestamp_base: u32,
}

impl RtpHeader {
    pub fn new(pt: u8, ssrc: u32, initial_sequence: u16, timestamp_base: u32) -> Self {
        tracing::debug!(
            pt,
            ssrc = format_args!("{:#010X}", ssrc),
            initial_sequence,
            "RTP header state created"
        );
        Self {
            pt,
            ssrc,
            sequence: initial_sequence,
            timestamp_base,
        }
    }

    /// SSRC, first sequence number and timestamp base from `config`, random
    /// where unset (RFC 3550 §5.1, §8.1).
    pub fn from_config(pt: u8, config: &SinkConfig) -> Self {
        let mut rng = rand::rng();
        let ssrc = config.ssrc.unwrap_or_else(|| rng.random());
        let sequence = config.initial_sequence.unwrap_or_else(|| rng.random());
        let timestamp_base = if config.initial_sequence.is_some() && config.ssrc.is_some() {
            0
        } else {
            rng.random()
        };
        Self::new(pt, ssrc, sequence, timestamp_base)
    }

    /// Sequence number the next [`write`](Self::write) will use.
    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    /// RTP timestamp for a presentation time at `clock_rate` Hz.
    pub fn rtp_timestamp(&self, presentation_time: Duration, clock_rate: u32) -> u32 {
        let ticks = presentation_time.as_micros() * u128::from(clock_rate) / 1_000_000;
        self.timestamp_base.wrapping_add(ticks as u32)
    }

    /// Serialize the fixed header and advance the sequence number.
    pub fn write(&mut self, marker: bool, timestamp: u32) -> [u8; RTP_HEADER_SIZE] {
        let mut header = [0u8; RTP_HEADER_SIZE];
        header[0] = 2 << 6;
        header[1] = (u8::from(marker) << 7) | (self.pt & 0x7F);
        header[2..4].copy_from_slice(&self.sequence.to_be_bytes());
        header[4..8].copy_from_slice(&timestamp.to_be_bytes());
        header[8..12].copy_from_slice(&self.ssrc.to_be_bytes());
        self.sequence = self.sequence.wrapping_add(1);
        header
    }
}

/// The part of a frame placed in the packet under construction.
#[derive(Debug)]
pub struct FramePiece<'a> {
    /// Frame bytes copied into this packet.
    pub data: &'a [u8],
    /// Offset of `data` within the whole frame; non-zero for continuation fragments.
    pub fragmentation_offset: usize,
    /// Frame bytes left over for following packets.
    pub num_remaining_bytes: usize,
    pub presentation_time: Duration,
    pub tag: &'a FrameTag,
}

impl FramePiece<'_> {
    /// Size of the whole frame this piece belongs to.
    pub fn frame_size(&self) -> usize {
        self.fragmentation_offset + self.data.len() + self.num_remaining_bytes
    }
}

/// Codec-specific packing rules for [`MultiFramedSink`].
///
/// The defaults describe a format that carries no special header, allows
/// several frames per packet and fragments only a frame that starts a packet.
pub trait PayloadFormat {
    /// SDP media type, `"video"` or `"audio"`.
    fn media_type(&self) -> &'static str;

    /// Encoding name for `a=rtpmap`.
    fn encoding_name(&self) -> &'static str;

    /// RTP clock rate in Hz.
    fn clock_rate(&self) -> u32;

    fn default_payload_type(&self) -> u8 {
        DYNAMIC_PAYLOAD_TYPE
    }

    /// Channel count for the `a=rtpmap` encoding parameters (audio only).
    fn channels(&self) -> Option<u8> {
        None
    }

    /// Format parameters for `a=fmtp`, once enough of the stream has been seen.
    fn fmtp(&self) -> Option<String> {
        None
    }

    /// Whether the parameters needed for the SDP description are known yet.
    fn sdp_ready(&self) -> bool {
        true
    }

    /// Bytes of payload header written after the RTP header.
    /// `fragmentation_offset` is that of the packet's first frame.
    fn special_header_size(&self, _fragmentation_offset: usize) -> usize {
        0
    }

    /// Bytes of header preceding each frame within a packet.
    fn frame_specific_header_size(&self) -> usize {
        0
    }

    /// Whether a frame may be fragmented when it is not first in its packet.
    fn allow_fragmentation_after_start(&self) -> bool {
        false
    }

    /// Whether more frames may follow the last fragment of a fragmented frame.
    fn allow_other_frames_after_last_fragment(&self) -> bool {
        false
    }

    /// Whether `frame` may be packed behind frames already in the packet.
    fn frame_can_appear_after_packet_start(&self, _frame: &Frame) -> bool {
        true
    }

    /// A fragment must contain a multiple of this many bytes.
    fn fragment_granularity(&self) -> usize {
        1
    }

    /// Adjust the packet for the piece just appended: special header, marker
    /// bit, timestamp. The packet timestamp is already set from the first frame.
    fn do_special_frame_handling(
        &mut self,
        _packet: &mut OutPacketBuffer,
        _piece: &FramePiece<'_>,
        _source: &dyn FrameSource,
    ) {
    }

    /// `a=rtpmap` and, when available, `a=fmtp` lines for payload type `pt`.
    fn sdp_attributes(&self, pt: u8) -> Vec<String> {
        let mut rtpmap = format!("a=rtpmap:{pt} {}/{}", self.encoding_name(), self.clock_rate());
        if let Some(channels) = self.channels() {
            rtpmap.push_str(&format!("/{channels}"));
        }
        let mut attrs = vec![rtpmap];
        if let Some(fmtp) = self.fmtp() {
            attrs.push(format!("a=fmtp:{pt} {fmtp}"));
        }
        attrs
    }
}

impl<P: PayloadFormat + ?Sized> PayloadFormat for Box<P> {
    fn media_type(&self) -> &'static str {
        (**self).media_type()
    }
    fn encoding_name(&self) -> &'static str {
        (**self).encoding_name()
    }
    fn clock_rate(&self) -> u32 {
        (**self).clock_rate()
    }
    fn default_payload_type(&self) -> u8 {
        (**self).default_payload_type()
    }
    fn channels(&self) -> Option<u8> {
        (**self).channels()
    }
    fn fmtp(&self) -> Option<String> {
        (**self).fmtp()
    }
    fn sdp_ready(&self) -> bool {
        (**self).sdp_ready()
    }
    fn special_header_size(&self, fragmentation_offset: usize) -> usize {
        (**self).special_header_size(fragmentation_offset)
    }
    fn frame_specific_header_size(&self) -> usize {
        (**self).frame_specific_header_size()
    }
    fn allow_fragmentation_after_start(&self) -> bool {
        (**self).allow_fragmentation_after_start()
    }
    fn allow_other_frames_after_last_fragment(&self) -> bool {
        (**self).allow_other_frames_after_last_fragment()
    }
    fn frame_can_appear_after_packet_start(&self, frame: &Frame) -> bool {
        (**self).frame_can_appear_after_packet_start(frame)
    }
    fn fragment_granularity(&self) -> usize {
        (**self).fragment_granularity()
    }
    fn do_special_frame_handling(
        &mut self,
        packet: &mut OutPacketBuffer,
        piece: &FramePiece<'_>,
        source: &dyn FrameSource,
    ) {
        (**self).do_special_frame_handling(packet, piece, source)
    }
    fn sdp_attributes(&self, pt: u8) -> Vec<String> {
        (**self).sdp_attributes(pt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_header() -> RtpHeader {
        RtpHeader::new(96, 0xAABBCCDD, 0, 0)
    }

    #[test]
    fn version_and_payload_type() {
        let mut h = make_header();
        let buf = h.write(false, 0);
        assert_eq!(buf[0] >> 6, 2);
        assert_eq!(buf[1] & 0x7f, 96);
    }

    #[test]
    fn marker_bit() {
        let mut h = make_header();
        assert_eq!(h.write(false, 0)[1] & 0x80, 0);
        assert_eq!(h.write(true, 0)[1] & 0x80, 0x80);
    }

    #[test]
    fn sequence_wraps() {
        let mut h = RtpHeader::new(96, 1, u16::MAX, 0);
        let buf = h.write(false, 0);
        assert_eq!(u16::from_be_bytes([buf[2], buf[3]]), u16::MAX);
        assert_eq!(h.sequence(), 0);
    }

    #[test]
    fn ssrc_and_timestamp_written() {
        let mut h = make_header();
        let buf = h.write(false, 0x0102_0304);
        assert_eq!(u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]), 0x0102_0304);
        assert_eq!(u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]), 0xAABBCCDD);
    }

    #[test]
    fn timestamp_from_presentation_time() {
        let h = RtpHeader::new(96, 1, 0, 0xFFFF_FF00);
        assert_eq!(h.rtp_timestamp(Duration::ZERO, 90_000), 0xFFFF_FF00);
        assert_eq!(h.rtp_timestamp(Duration::from_millis(40), 90_000), 0xFFFF_FF00u32.wrapping_add(3600));
        assert_eq!(h.rtp_timestamp(Duration::from_secs(1), 48_000), 0xFFFF_FF00u32.wrapping_add(48_000));
    }

    #[test]
    fn config_values_are_used() {
        let config = SinkConfig {
            ssrc: Some(7),
            initial_sequence: Some(100),
            ..SinkConfig::default()
        };
        let mut h = RtpHeader::from_config(33, &config);
        assert_eq!(h.ssrc, 7);
        let buf = h.write(false, 0);
        assert_eq!(u16::from_be_bytes([buf[2], buf[3]]), 100);
    }

    #[test]
    fn random_ssrc_differs() {
        let h1 = RtpHeader::from_config(96, &SinkConfig::default());
        let h2 = RtpHeader::from_config(96, &SinkConfig::default());
        assert_ne!(h1.ssrc, h2.ssrc);
    }
}
