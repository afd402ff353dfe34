//! Tunable parameters for framers and the RTP sink.
//!
//! All structs implement [`Default`] with the values the pipeline was tuned
//! with. None of the numeric constants are protocol requirements.

use std::time::Duration;

use crate::error::{Result, StreamError};
use crate::rtp::RTP_HEADER_SIZE;

/// RTP sink configuration.
#[derive(Debug, Clone)]
pub struct SinkConfig {
    /// Hard upper bound on the size of one RTP packet, header included.
    pub max_packet_size: usize,
    /// Once a packet reaches this size no further frames are packed into it.
    pub preferred_packet_size: usize,
    /// Capacity offered to the upstream source for a single frame.
    /// Frames larger than this are truncated and reported once.
    pub buffer_size: usize,
    /// Overrides the payload format's default payload type.
    pub payload_type: Option<u8>,
    /// Synchronization source; random when `None` (RFC 3550 §8.1).
    pub ssrc: Option<u32>,
    /// First sequence number; random when `None` (RFC 3550 §5.1).
    pub initial_sequence: Option<u16>,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            max_packet_size: 1456,
            preferred_packet_size: 1000,
            buffer_size: 60_000,
            payload_type: None,
            ssrc: None,
            initial_sequence: None,
        }
    }
}

impl SinkConfig {
    /// Reject sizes that cannot hold an RTP header plus at least one payload byte.
    pub fn validate(&self) -> Result<()> {
        if self.max_packet_size <= RTP_HEADER_SIZE + 4 {
            return Err(StreamError::InvalidConfig(format!(
                "max_packet_size {} leaves no room for payload",
                self.max_packet_size
            )));
        }
        if self.preferred_packet_size > self.max_packet_size {
            return Err(StreamError::InvalidConfig(format!(
                "preferred_packet_size {} exceeds max_packet_size {}",
                self.preferred_packet_size, self.max_packet_size
            )));
        }
        if self.buffer_size < self.max_packet_size {
            return Err(StreamError::InvalidConfig(format!(
                "buffer_size {} is smaller than max_packet_size {}",
                self.buffer_size, self.max_packet_size
            )));
        }
        Ok(())
    }
}

/// Smoothing parameters for the Transport Stream packet-duration estimate.
#[derive(Debug, Clone)]
pub struct TsTimingConfig {
    /// Weight given to the newest PCR-derived duration sample.
    pub new_duration_weight: f64,
    /// Factor applied when transmission drifts away from the PCR playout rate.
    pub time_adjustment_factor: f64,
    /// How far (seconds) transmission may lag the PCR before speeding up.
    pub max_playout_buffer_duration: f64,
    /// PCRs arriving sooner than this fraction of the mean PCR period are ignored.
    pub pcr_period_variation_ratio: f64,
}

impl Default for TsTimingConfig {
    fn default() -> Self {
        Self {
            new_duration_weight: 0.5,
            time_adjustment_factor: 0.8,
            max_playout_buffer_duration: 0.1,
            pcr_period_variation_ratio: 0.5,
        }
    }
}

/// Options shared by the MPEG video framers.
#[derive(Debug, Clone, Default)]
pub struct VideoFramerConfig {
    /// Scan and discard every picture that is not an I-frame.
    pub iframes_only: bool,
    /// Re-insert the cached video sequence header at least this often.
    pub vsh_period: Option<Duration>,
}

/// Options for the H.264 framer.
#[derive(Debug, Clone)]
pub struct H264FramerConfig {
    /// Frame rate as numerator/denominator, used to advance timestamps per access unit.
    pub frame_rate: (u32, u32),
}

impl Default for H264FramerConfig {
    fn default() -> Self {
        Self { frame_rate: (25, 1) }
    }
}

/// Framer options for every codec, as used by [`Codec::framer`](crate::codec::Codec::framer).
#[derive(Debug, Clone, Default)]
pub struct FramerConfig {
    pub video: VideoFramerConfig,
    pub h264: H264FramerConfig,
    pub ts_timing: TsTimingConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_sink_config_is_valid() {
        assert!(SinkConfig::default().validate().is_ok());
    }

    #[test]
    fn tiny_packet_size_rejected() {
        let config = SinkConfig {
            max_packet_size: 12,
            preferred_packet_size: 12,
            ..SinkConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(StreamError::InvalidConfig(_))
        ));
    }

    #[test]
    fn preferred_above_max_rejected() {
        let config = SinkConfig {
            preferred_packet_size: 2000,
            ..SinkConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
