//! SDP (Session Description Protocol) generation (RFC 4566 / RFC 8866).
//!
//! ```text
//! v=0                                          ← protocol version
//! o=<user> <sess-id> <sess-ver> IN IP4 <addr>  ← origin
//! s=<session-name>                              ← session name
//! c=IN IP4 <addr>                               ← connection address
//! t=0 0                                         ← timing
//! a=tool:rtp-stream                             ← software (§6)
//! a=sendonly                                    ← direction (§6)
//! a=range:npt=0-<duration>                      ← when the duration is known
//! m=video <port> RTP/AVP 96                     ← media description
//! a=rtpmap:96 H264/90000                        ← codec/clock rate
//! a=fmtp:96 packetization-mode=1;...            ← codec parameters
//! a=control:track1                              ← track control URL
//! ```
//!
//! Some `a=fmtp` parameters (H.264 parameter sets, the MPEG-4 `config`, the
//! DV profile) are only known after part of the stream has been read.
//! [`probe_media_description`] packetizes the start of the stream into a
//! [`DiscardTransport`] until the payload format has what it needs.

use std::time::{Duration, Instant};

use crate::config::SinkConfig;
use crate::error::Result;
use crate::frame::FrameSource;
use crate::rtp::{MultiFramedSink, PayloadFormat, SinkPoll};
use crate::transport::DiscardTransport;

/// Packets sent while probing before giving up on missing parameters.
pub const DEFAULT_PROBE_PACKETS: u64 = 1000;

/// Session-level fields.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub ip: String,
    pub session_id: String,
    pub session_version: String,
    pub username: String,
    pub session_name: String,
    /// Stream duration in seconds, for `a=range`.
    pub duration: Option<f64>,
}

impl Default for SessionInfo {
    fn default() -> Self {
        Self {
            ip: "0.0.0.0".into(),
            session_id: "0".into(),
            session_version: "1".into(),
            username: "-".into(),
            session_name: "rtp-stream".into(),
            duration: None,
        }
    }
}

/// One `m=` section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaDescription {
    pub media_type: &'static str,
    pub port: u16,
    pub payload_type: u8,
    /// `a=rtpmap` and `a=fmtp` lines.
    pub attributes: Vec<String>,
}

impl MediaDescription {
    pub fn from_format(format: &dyn PayloadFormat, payload_type: u8) -> Self {
        Self {
            media_type: format.media_type(),
            port: 0,
            payload_type,
            attributes: format.sdp_attributes(payload_type),
        }
    }

    pub fn lines(&self) -> Vec<String> {
        let mut lines = vec![format!(
            "m={} {} RTP/AVP {}",
            self.media_type, self.port, self.payload_type
        )];
        lines.extend(self.attributes.iter().cloned());
        lines.push("a=control:track1".to_string());
        lines
    }
}

/// Generate a session description with a single media section.
pub fn generate_sdp(media: &MediaDescription, session: &SessionInfo) -> String {
    let mut sdp: Vec<String> = Vec::new();

    sdp.push("v=0".to_string());
    sdp.push(format!(
        "o={} {} {} IN IP4 {}",
        session.username, session.session_id, session.session_version, session.ip
    ));
    sdp.push(format!("s={}", session.session_name));
    sdp.push(format!("c=IN IP4 {}", session.ip));
    sdp.push("t=0 0".to_string());
    sdp.push("a=tool:rtp-stream".to_string());
    sdp.push("a=sendonly".to_string());
    if let Some(duration) = session.duration.filter(|d| *d > 0.0) {
        sdp.push(format!("a=range:npt=0-{duration:.3}"));
    }
    sdp.extend(media.lines());

    tracing::debug!("SDP: {}", sdp.join("\r\n"));

    format!("{}\r\n", sdp.join("\r\n"))
}

/// Run `source` through a sink with a discarding transport until `format`
/// knows its SDP parameters, then describe the media.
///
/// Probing stops early if the source closes or has nothing ready, or after
/// `max_packets`; the description then carries whatever is known.
pub fn probe_media_description<F: FrameSource>(
    source: F,
    format: Box<dyn PayloadFormat>,
    config: &SinkConfig,
    max_packets: u64,
) -> Result<MediaDescription> {
    let mut sink = MultiFramedSink::new(source, format, DiscardTransport, config)?;
    // The probe is not paced.
    let far = Instant::now() + Duration::from_secs(365 * 24 * 3600);
    while !sink.format().sdp_ready() {
        if sink.stats().packets_sent >= max_packets {
            tracing::warn!(max_packets, "SDP parameters still incomplete after probing");
            break;
        }
        match sink.poll(far)? {
            SinkPoll::SendAt(_) => {}
            SinkPoll::WaitForInput | SinkPoll::Finished => {
                if !sink.format().sdp_ready() {
                    tracing::warn!(
                        encoding = sink.format().encoding_name(),
                        "stream ended before SDP parameters were seen"
                    );
                }
                break;
            }
        }
    }
    tracing::debug!(packets = sink.stats().packets_sent, "SDP probe finished");
    Ok(MediaDescription::from_format(sink.format(), sink.payload_type()))
}
