//! The unit moved between pipeline stages, and the pull interface that moves it.

use std::time::Duration;

use crate::error::Result;

/// MPEG picture coding type (ISO/IEC 11172-2 §2.4.3.5, 13818-2 §6.3.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PictureType {
    I,
    P,
    B,
    /// MPEG-1 DC-only pictures, MPEG-4 sprite VOPs and reserved codes.
    Other(u8),
}

impl PictureType {
    /// Map the 3-bit `picture_coding_type` field.
    pub fn from_mpeg12(code: u8) -> Self {
        match code {
            1 => PictureType::I,
            2 => PictureType::P,
            3 => PictureType::B,
            other => PictureType::Other(other),
        }
    }

    /// Map the 2-bit MPEG-4 `vop_coding_type` field.
    pub fn from_mpeg4(code: u8) -> Self {
        match code {
            0 => PictureType::I,
            1 => PictureType::P,
            2 => PictureType::B,
            other => PictureType::Other(other),
        }
    }

    /// The wire value used by the RFC 2250 video-specific header.
    pub fn mpeg12_code(self) -> u8 {
        match self {
            PictureType::I => 1,
            PictureType::P => 2,
            PictureType::B => 3,
            PictureType::Other(code) => code,
        }
    }
}

/// Codec-specific description of what a [`Frame`] holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameTag {
    /// No structure beyond the bytes themselves (audio frames).
    Plain,
    /// MPEG-1/2 video sequence header or MPEG-4 configuration headers.
    SequenceHeader,
    /// MPEG-1/2 GOP header.
    GroupHeader,
    /// A picture (or one slice of it).
    Picture {
        coding_type: PictureType,
        temporal_reference: u16,
        /// This unit completes the picture.
        picture_end: bool,
    },
    /// One complete H.264 NAL unit.
    NalUnit { nal_type: u8 },
    /// A piece of a NAL unit produced by the FU-A fragmenter.
    NalFragment {
        /// The data is a complete NAL unit or the FU-A fragment carries the E bit.
        completes_nal_unit: bool,
    },
    /// A complete DV frame.
    Dv { profile: &'static str },
    /// An MP3 Application Data Unit, descriptor included.
    Adu,
    /// One or more whole 188-byte Transport Stream packets.
    TransportPackets { count: usize },
    /// Elementary-stream bytes recovered through a Transport Stream index record.
    Indexed { record_type: u8 },
}

/// A unit of media moved from one stage to the next.
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    /// Bytes of the recognized unit that did not fit the offered capacity.
    pub truncated: usize,
    /// Presentation time relative to the start of the stream.
    pub presentation_time: Duration,
    pub duration: Duration,
    pub tag: FrameTag,
}

impl Frame {
    pub fn new(data: Vec<u8>, presentation_time: Duration, duration: Duration, tag: FrameTag) -> Self {
        Self {
            data,
            truncated: 0,
            presentation_time,
            duration,
            tag,
        }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// Outcome of a frame request.
#[derive(Debug)]
pub enum Pull {
    Frame(Frame),
    /// Nothing available yet; ask again later.
    Pending,
    /// The producer has finished.
    Closed,
}

/// Capability of framers that know where video access units end.
pub trait VideoAccessUnitBoundary {
    /// Whether the NAL unit most recently delivered was the last one of its access unit.
    fn current_nal_unit_ends_access_unit(&self) -> bool;
}

/// MPEG-4 visual configuration captured from the stream headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mpeg4Config {
    pub profile_and_level_indication: u8,
    /// Visual Object Sequence through Video Object Layer header bytes.
    pub config: Vec<u8>,
}

/// A pull-based producer of frames.
///
/// Callers issue one request at a time; `max_size` is the capacity the caller
/// offers for the frame's data. A frame larger than `max_size` is cut to fit
/// and the excess reported in [`Frame::truncated`].
pub trait FrameSource {
    fn next_frame(&mut self, max_size: usize) -> Result<Pull>;

    /// Drop any partially parsed state after a discontinuity.
    fn flush_input(&mut self) {}

    fn access_unit_boundary(&self) -> Option<&dyn VideoAccessUnitBoundary> {
        None
    }

    fn mpeg4_config(&self) -> Option<Mpeg4Config> {
        None
    }
}

impl<F: FrameSource + ?Sized> FrameSource for Box<F> {
    fn next_frame(&mut self, max_size: usize) -> Result<Pull> {
        (**self).next_frame(max_size)
    }

    fn flush_input(&mut self) {
        (**self).flush_input()
    }

    fn access_unit_boundary(&self) -> Option<&dyn VideoAccessUnitBoundary> {
        (**self).access_unit_boundary()
    }

    fn mpeg4_config(&self) -> Option<Mpeg4Config> {
        (**self).mpeg4_config()
    }
}

/// Destination buffer with a fixed capacity, counting bytes that did not fit.
#[derive(Debug, Clone, Default)]
pub struct FrameBuffer {
    data: Vec<u8>,
    capacity: usize,
    truncated: usize,
}

impl FrameBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: Vec::new(),
            capacity,
            truncated: 0,
        }
    }

    /// Empty the buffer and set a new capacity.
    pub fn reset(&mut self, capacity: usize) {
        self.data.clear();
        self.capacity = capacity;
        self.truncated = 0;
    }

    pub fn save_byte(&mut self, b: u8) {
        if self.data.len() < self.capacity {
            self.data.push(b);
        } else {
            self.truncated += 1;
        }
    }

    pub fn save_4_bytes(&mut self, v: u32) {
        self.save_bytes(&v.to_be_bytes());
    }

    pub fn save_bytes(&mut self, bytes: &[u8]) {
        let room = self.capacity.saturating_sub(self.data.len());
        let n = room.min(bytes.len());
        self.data.extend_from_slice(&bytes[..n]);
        self.truncated += bytes.len() - n;
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Drop trailing zero bytes, such as the leading byte of a following
    /// four-byte Annex B start code.
    pub fn trim_trailing_zeros(&mut self) {
        if self.truncated > 0 {
            return;
        }
        while self.data.last() == Some(&0) {
            self.data.pop();
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty() && self.truncated == 0
    }

    pub fn truncated(&self) -> usize {
        self.truncated
    }

    /// Take the accumulated bytes as a frame, leaving the buffer empty.
    pub fn take_frame(
        &mut self,
        presentation_time: Duration,
        duration: Duration,
        tag: FrameTag,
    ) -> Frame {
        let frame = Frame {
            data: std::mem::take(&mut self.data),
            truncated: self.truncated,
            presentation_time,
            duration,
            tag,
        };
        self.truncated = 0;
        frame
    }
}

/// Microseconds in `count` frames at `num/den` frames per second, rounded down.
pub fn frames_to_micros(count: u64, num: u32, den: u32) -> u64 {
    if num == 0 {
        return 0;
    }
    ((count as u128 * 1_000_000 * den as u128) / num as u128) as u64
}
