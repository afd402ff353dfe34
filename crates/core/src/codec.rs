//! Codec selection: the framer and RTP payload format that handle a stream.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::config::{FramerConfig, SinkConfig};
use crate::error::StreamError;
use crate::frame::FrameSource;
use crate::framer::{
    Ac3Framer, DvFramer, FuaFragmenter, H264Framer, Mp3AduFramer, Mpeg4VideoFramer, MpegAudioFramer,
    Mpeg12VideoFramer, TsFramer,
};
use crate::rtp::{
    Ac3PayloadFormat, DvPayloadFormat, H264PayloadFormat, Mp3AduPayloadFormat, Mpeg4VideoPayloadFormat,
    MpegAudioPayloadFormat, MpegVideoPayloadFormat, PayloadFormat, RTP_HEADER_SIZE,
    TransportStreamPayloadFormat,
};
use crate::source::ByteSource;

/// Largest DV frame (1080-line 50 Hz).
const MAX_DV_FRAME: usize = 576_000;
/// Above the largest MPEG audio frame (1729 bytes, layer II at 384 kbps and 32 kHz).
const MAX_MPEG_AUDIO_FRAME: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Mpeg12Video,
    Mpeg4Video,
    H264,
    Ac3,
    MpegAudio,
    Mp3Adu,
    Dv,
    TransportStream,
}

impl Codec {
    pub const ALL: [Codec; 8] = [
        Codec::Mpeg12Video,
        Codec::Mpeg4Video,
        Codec::H264,
        Codec::Ac3,
        Codec::MpegAudio,
        Codec::Mp3Adu,
        Codec::Dv,
        Codec::TransportStream,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Codec::Mpeg12Video => "mpv",
            Codec::Mpeg4Video => "mp4v",
            Codec::H264 => "h264",
            Codec::Ac3 => "ac3",
            Codec::MpegAudio => "mpa",
            Codec::Mp3Adu => "mp3-adu",
            Codec::Dv => "dv",
            Codec::TransportStream => "ts",
        }
    }

    /// Guess the codec from a file extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        Some(match ext.as_str() {
            "mpv" | "m1v" | "m2v" => Codec::Mpeg12Video,
            "m4e" | "m4v" => Codec::Mpeg4Video,
            "264" | "h264" => Codec::H264,
            "ac3" => Codec::Ac3,
            "mp3" | "mp2" | "mpa" => Codec::MpegAudio,
            "dv" => Codec::Dv,
            "ts" | "m2t" => Codec::TransportStream,
            _ => return None,
        })
    }

    pub fn payload_format(self) -> Box<dyn PayloadFormat> {
        match self {
            Codec::Mpeg12Video => Box::new(MpegVideoPayloadFormat::new()),
            Codec::Mpeg4Video => Box::new(Mpeg4VideoPayloadFormat::new()),
            Codec::H264 => Box::new(H264PayloadFormat::new()),
            Codec::Ac3 => Box::new(Ac3PayloadFormat::new()),
            Codec::MpegAudio => Box::new(MpegAudioPayloadFormat::new()),
            Codec::Mp3Adu => Box::new(Mp3AduPayloadFormat::new()),
            Codec::Dv => Box::new(DvPayloadFormat::new()),
            Codec::TransportStream => Box::new(TransportStreamPayloadFormat::new()),
        }
    }

    /// Raise `config.buffer_size` to what a whole frame of this codec needs.
    pub fn adjust_sink_config(self, config: &mut SinkConfig) {
        if self == Codec::Dv && config.buffer_size < MAX_DV_FRAME {
            tracing::debug!(from = config.buffer_size, to = MAX_DV_FRAME, "raising buffer size for DV");
            config.buffer_size = MAX_DV_FRAME;
        }
    }

    /// Framer delivering this codec's units from `source`.
    pub fn framer<S: ByteSource + 'static>(self, source: S, config: &FramerConfig) -> Box<dyn FrameSource> {
        match self {
            Codec::Mpeg12Video => Box::new(Mpeg12VideoFramer::with_config(source, config.video.clone())),
            Codec::Mpeg4Video => Box::new(Mpeg4VideoFramer::with_config(source, config.video.clone())),
            Codec::H264 => Box::new(H264Framer::with_config(source, config.h264.clone())),
            Codec::Ac3 => Box::new(Ac3Framer::new(source)),
            Codec::MpegAudio => Box::new(MpegAudioFramer::new(source)),
            Codec::Mp3Adu => Box::new(Mp3AduFramer::new(MpegAudioFramer::new(source), MAX_MPEG_AUDIO_FRAME)),
            Codec::Dv => Box::new(DvFramer::new(source)),
            Codec::TransportStream => Box::new(TsFramer::with_timing(source, config.ts_timing.clone())),
        }
    }

    /// Framer output shaped for the RTP sink. H.264 NAL units are split into
    /// FU-A fragments that fit one packet.
    pub fn packetizer_input<S: ByteSource + 'static>(
        self,
        source: S,
        framer_config: &FramerConfig,
        sink_config: &SinkConfig,
    ) -> Box<dyn FrameSource> {
        let framer = self.framer(source, framer_config);
        match self {
            Codec::H264 => Box::new(FuaFragmenter::new(
                framer,
                sink_config.max_packet_size - RTP_HEADER_SIZE,
                sink_config.buffer_size,
            )),
            _ => framer,
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Codec {
    type Err = StreamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        let alias = match lower.as_str() {
            "mpeg2" | "mpeg1" | "m2v" => "mpv",
            "mpeg4" | "mp4v-es" => "mp4v",
            "avc" | "264" => "h264",
            "mp3" | "mp2" => "mpa",
            "adu" | "mpa-robust" => "mp3-adu",
            "mp2t" => "ts",
            other => other,
        };
        Codec::ALL
            .into_iter()
            .find(|c| c.name() == alias)
            .ok_or_else(|| StreamError::UnsupportedCodec(s.to_string()))
    }
}
