//! DV video payload format (RFC 6469).
//!
//! Frames are split on DIF-block boundaries; there is no payload header.

use super::{FramePiece, OutPacketBuffer, PayloadFormat};
use crate::frame::{FrameSource, FrameTag};
use crate::framer::dv::DIF_BLOCK_SIZE;

#[derive(Debug, Default)]
pub struct DvPayloadFormat {
    profile: Option<&'static str>,
}

impl DvPayloadFormat {
    pub fn new() -> Self {
        Self::default()
    }

    /// `encode` name of the stream, once a frame has been seen.
    pub fn profile(&self) -> Option<&'static str> {
        self.profile
    }
}

impl PayloadFormat for DvPayloadFormat {
    fn media_type(&self) -> &'static str {
        "video"
    }

    fn encoding_name(&self) -> &'static str {
        "DV"
    }

    fn clock_rate(&self) -> u32 {
        90_000
    }

    fn fmtp(&self) -> Option<String> {
        self.profile
            .map(|profile| format!("encode={profile};audio=bundled"))
    }

    fn sdp_ready(&self) -> bool {
        self.profile.is_some()
    }

    fn fragment_granularity(&self) -> usize {
        DIF_BLOCK_SIZE
    }

    fn do_special_frame_handling(
        &mut self,
        packet: &mut OutPacketBuffer,
        piece: &FramePiece<'_>,
        _source: &dyn FrameSource,
    ) {
        if let FrameTag::Dv { profile } = piece.tag {
            self.profile = Some(profile);
        }
        if piece.num_remaining_bytes == 0 {
            packet.set_marker();
        }
        packet.set_timestamp(piece.presentation_time);
    }
}
