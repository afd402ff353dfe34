//! MPEG audio payload format (RFC 2250 §3.5).
//!
//! A 4-byte header precedes the payload: 16 zero bits, then the offset of the
//! packet's data within its audio frame.

use super::{FramePiece, OutPacketBuffer, PayloadFormat};
use crate::frame::FrameSource;

/// `MPA` payload format, static payload type 14.
#[derive(Debug, Default)]
pub struct MpegAudioPayloadFormat;

impl MpegAudioPayloadFormat {
    pub fn new() -> Self {
        Self
    }
}

impl PayloadFormat for MpegAudioPayloadFormat {
    fn media_type(&self) -> &'static str {
        "audio"
    }

    fn encoding_name(&self) -> &'static str {
        "MPA"
    }

    fn clock_rate(&self) -> u32 {
        90_000
    }

    fn default_payload_type(&self) -> u8 {
        14
    }

    fn special_header_size(&self, _fragmentation_offset: usize) -> usize {
        4
    }

    fn do_special_frame_handling(
        &mut self,
        packet: &mut OutPacketBuffer,
        piece: &FramePiece<'_>,
        _source: &dyn FrameSource,
    ) {
        if packet.is_first_frame_in_packet() {
            packet.set_special_header_word((piece.fragmentation_offset & 0xFFFF) as u32);
        }
        // first packet of the stream starts a talkspurt
        if packet.is_first_packet() && packet.is_first_frame_in_packet() {
            packet.set_marker();
        }
    }
}
