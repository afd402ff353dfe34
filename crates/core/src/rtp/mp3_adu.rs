//! MP3 ADU payload format, `MPA-ROBUST` (RFC 5219 §4).
//!
//! ADUs arrive with their descriptor already in place. When an ADU is
//! fragmented, every fragment after the first is preceded by a fresh
//! two-byte descriptor with the continuation bit set.

use super::{FramePiece, OutPacketBuffer, PayloadFormat};
use crate::frame::FrameSource;
use crate::framer::mp3_adu::{read_descriptor, write_descriptor};

#[derive(Debug, Default)]
pub struct Mp3AduPayloadFormat {
    /// ADU size from the descriptor of the frame being fragmented.
    current_adu_size: usize,
}

impl Mp3AduPayloadFormat {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PayloadFormat for Mp3AduPayloadFormat {
    fn media_type(&self) -> &'static str {
        "audio"
    }

    fn encoding_name(&self) -> &'static str {
        "MPA-ROBUST"
    }

    fn clock_rate(&self) -> u32 {
        90_000
    }

    fn special_header_size(&self, fragmentation_offset: usize) -> usize {
        if fragmentation_offset == 0 { 0 } else { 2 }
    }

    fn do_special_frame_handling(
        &mut self,
        packet: &mut OutPacketBuffer,
        piece: &FramePiece<'_>,
        _source: &dyn FrameSource,
    ) {
        if piece.fragmentation_offset == 0 {
            match read_descriptor(piece.data) {
                Some((size, len, _)) => {
                    if len + size != piece.frame_size() {
                        tracing::warn!(
                            descriptor_size = size,
                            frame_size = piece.frame_size(),
                            "ADU descriptor does not match frame size"
                        );
                    }
                    self.current_adu_size = size;
                }
                None => tracing::warn!("ADU frame too short for a descriptor"),
            }
        } else {
            let mut descriptor = Vec::with_capacity(2);
            write_descriptor(&mut descriptor, self.current_adu_size, true);
            packet.set_special_header_bytes(&descriptor);
        }
    }
}
