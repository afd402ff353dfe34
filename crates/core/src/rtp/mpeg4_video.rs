//! MPEG-4 Part 2 elementary stream payload format (RFC 3016).

use super::{FramePiece, OutPacketBuffer, PayloadFormat};
use crate::frame::{Frame, FrameSource, FrameTag, Mpeg4Config};

/// `MP4V-ES` payload format.
///
/// Configuration headers and a GOV may share a packet with the VOP that
/// follows them, but nothing is packed behind a VOP.
#[derive(Debug, Default)]
pub struct Mpeg4VideoPayloadFormat {
    config: Option<Mpeg4Config>,
    vop_present: bool,
}

impl Mpeg4VideoPayloadFormat {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(&self) -> Option<&Mpeg4Config> {
        self.config.as_ref()
    }
}

impl PayloadFormat for Mpeg4VideoPayloadFormat {
    fn media_type(&self) -> &'static str {
        "video"
    }

    fn encoding_name(&self) -> &'static str {
        "MP4V-ES"
    }

    fn clock_rate(&self) -> u32 {
        90_000
    }

    fn fmtp(&self) -> Option<String> {
        let config = self.config.as_ref()?;
        let hex: String = config.config.iter().map(|b| format!("{b:02X}")).collect();
        Some(format!(
            "profile-level-id={};config={hex}",
            config.profile_and_level_indication
        ))
    }

    fn sdp_ready(&self) -> bool {
        self.config.is_some()
    }

    fn allow_fragmentation_after_start(&self) -> bool {
        true
    }

    fn frame_can_appear_after_packet_start(&self, _frame: &Frame) -> bool {
        !self.vop_present
    }

    fn do_special_frame_handling(
        &mut self,
        packet: &mut OutPacketBuffer,
        piece: &FramePiece<'_>,
        source: &dyn FrameSource,
    ) {
        if packet.is_first_frame_in_packet() {
            self.vop_present = false;
        }
        if piece.fragmentation_offset == 0 {
            self.vop_present = matches!(piece.tag, FrameTag::Picture { .. });
            if matches!(piece.tag, FrameTag::SequenceHeader) || self.config.is_none() {
                if let Some(config) = source.mpeg4_config() {
                    if self.config.as_ref() != Some(&config) {
                        tracing::debug!(
                            profile = config.profile_and_level_indication,
                            bytes = config.config.len(),
                            "MPEG-4 config captured"
                        );
                    }
                    self.config = Some(config);
                }
            }
        }
        if piece.num_remaining_bytes == 0
            && matches!(piece.tag, FrameTag::Picture { picture_end: true, .. })
        {
            packet.set_marker();
        }
        packet.set_timestamp(piece.presentation_time);
    }
}
