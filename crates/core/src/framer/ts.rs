//! MPEG-2 Transport Stream framer (ISO/IEC 13818-1).
//!
//! Delivers whole 188-byte packets, as many as fit the offered buffer. Each
//! frame's duration comes from a running per-packet duration estimate that is
//! derived from the PCRs carried in the stream, so a sender can pace the
//! packets without a clock of its own.

use std::collections::HashMap;
use std::time::Duration;

use super::into_pull;
use crate::config::TsTimingConfig;
use crate::error::{Result, StreamError};
use crate::frame::{Frame, FrameBuffer, FrameSource, FrameTag, Pull};
use crate::parser::{Interrupt, Parse, StreamParser};
use crate::source::ByteSource;

pub const TS_PACKET_SIZE: usize = 188;
pub const SYNC_BYTE: u8 = 0x47;
/// How far to look for the next sync byte before giving up on the stream.
const RESYNC_WINDOW: usize = 5 * TS_PACKET_SIZE;

pub fn packet_pid(packet: &[u8]) -> u16 {
    (u16::from(packet[1] & 0x1F) << 8) | u16::from(packet[2])
}

/// PCR carried in a packet's adaptation field.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pcr {
    /// Seconds on the 27 MHz program clock.
    pub seconds: f64,
    pub discontinuity: bool,
}

/// The packet's PCR, if its adaptation field carries one.
pub fn packet_pcr(packet: &[u8]) -> Option<Pcr> {
    if packet.len() < 12 {
        return None;
    }
    let adaptation_field_control = (packet[3] & 0x30) >> 4;
    if adaptation_field_control != 2 && adaptation_field_control != 3 {
        return None;
    }
    if packet[4] == 0 || packet[5] & 0x10 == 0 {
        return None;
    }
    let base_high = u32::from_be_bytes([packet[6], packet[7], packet[8], packet[9]]);
    let mut seconds = f64::from(base_high) / 45_000.0;
    if packet[10] & 0x80 != 0 {
        seconds += 1.0 / 90_000.0;
    }
    let extension = (u16::from(packet[10] & 0x01) << 8) | u16::from(packet[11]);
    seconds += f64::from(extension) / 27_000_000.0;
    Some(Pcr {
        seconds,
        discontinuity: packet[5] & 0x80 != 0,
    })
}

/// PCR bookkeeping for one PID.
#[derive(Debug, Clone, Copy)]
struct PidStatus {
    first_clock: f64,
    last_clock: f64,
    first_real_time: f64,
    last_packet_num: u64,
}

/// Transport Stream framer with PCR-driven packet pacing.
pub struct TsFramer<S> {
    parser: StreamParser<S>,
    out: FrameBuffer,
    timing: TsTimingConfig,
    pid_status: HashMap<u16, PidStatus>,
    ts_packet_count: u64,
    ts_pcr_count: u64,
    packet_duration_estimate: f64,
    /// Seconds of stream delivered so far; stands in for wall-clock time.
    transmit_clock: f64,
    packets_remaining: Option<u64>,
    pcr_limit: Option<f64>,
    ended: bool,
}

impl<S: ByteSource> TsFramer<S> {
    pub fn new(source: S) -> Self {
        Self::with_timing(source, TsTimingConfig::default())
    }

    pub fn with_timing(source: S, timing: TsTimingConfig) -> Self {
        Self {
            parser: StreamParser::new(source),
            out: FrameBuffer::default(),
            timing,
            pid_status: HashMap::new(),
            ts_packet_count: 0,
            ts_pcr_count: 0,
            packet_duration_estimate: 0.0,
            transmit_clock: 0.0,
            packets_remaining: None,
            pcr_limit: None,
            ended: false,
        }
    }

    /// Packets delivered since creation or the last [`clear_pid_status_table`](Self::clear_pid_status_table).
    pub fn ts_packet_count(&self) -> u64 {
        self.ts_packet_count
    }

    /// Current per-packet duration estimate, in seconds.
    pub fn packet_duration_estimate(&self) -> f64 {
        self.packet_duration_estimate
    }

    /// Forget all PCR history, e.g. after a seek.
    pub fn clear_pid_status_table(&mut self) {
        self.pid_status.clear();
        self.ts_packet_count = 0;
        self.ts_pcr_count = 0;
    }

    /// Stop after delivering this many more packets.
    pub fn set_packet_limit(&mut self, limit: Option<u64>) {
        self.packets_remaining = limit;
        self.ended = false;
    }

    /// Stop at the first PCR later than `limit` seconds.
    pub fn set_pcr_limit(&mut self, limit: Option<f64>) {
        self.pcr_limit = limit;
        self.ended = false;
    }

    /// Reposition the underlying source at a packet boundary.
    pub fn seek_to_packet(&mut self, packet: u64) -> Result<()> {
        self.parser.seek_to_byte(packet * TS_PACKET_SIZE as u64)?;
        self.ended = false;
        Ok(())
    }

    pub fn source_mut(&mut self) -> &mut S {
        self.parser.source_mut()
    }

    pub fn into_source(self) -> S {
        self.parser.into_source()
    }

    /// Skip to the next sync byte. `false` if none was found within the window.
    fn resync(&mut self) -> Parse<bool> {
        for _ in 0..RESYNC_WINDOW {
            self.parser.save_parser_state();
            if self.parser.test_1_byte()? == SYNC_BYTE {
                return Ok(true);
            }
            self.parser.skip_bytes(1)?;
        }
        Ok(false)
    }

    /// Collect whole packets into the output buffer. A source that stalls or
    /// closes after at least one packet still yields the packets collected.
    fn collect_packets(&mut self, max_packets: usize) -> Parse<usize> {
        let mut count = 0;
        while count < max_packets {
            self.parser.save_parser_state();
            let step = match self.parser.test_1_byte() {
                Ok(SYNC_BYTE) => self.parser.get_bytes(TS_PACKET_SIZE).map(|p| p.to_vec()),
                Ok(_) if count > 0 => break,
                Ok(_) => {
                    let offset = self.parser.position();
                    if !self.resync()? {
                        let error = StreamError::LostSync { offset };
                        tracing::warn!(%error, "giving up on Transport Stream");
                        return Err(Interrupt::Closed);
                    }
                    tracing::warn!(offset, skipped = self.parser.position() - offset, "resynchronized Transport Stream");
                    continue;
                }
                Err(e) => Err(e),
            };
            match step {
                Ok(packet) => {
                    self.out.save_bytes(&packet);
                    count += 1;
                }
                Err(Interrupt::Pending) | Err(Interrupt::Closed) if count > 0 => break,
                Err(Interrupt::Closed) if !self.parser.at_end() => {
                    tracing::debug!("dropping partial Transport Stream packet at end of input");
                    return Err(Interrupt::Closed);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(count)
    }

    /// Fold one packet into the duration estimate. `false` once the PCR limit is passed.
    fn update_duration_estimate(&mut self, packet: &[u8], time_now: f64) -> bool {
        self.ts_packet_count += 1;
        let Some(pcr) = packet_pcr(packet) else {
            return true;
        };
        self.ts_pcr_count += 1;
        if self.pcr_limit.is_some_and(|limit| pcr.seconds > limit) {
            return false;
        }

        let pid = packet_pid(packet);
        let packet_num = self.ts_packet_count;
        let Some(status) = self.pid_status.get_mut(&pid) else {
            self.pid_status.insert(
                pid,
                PidStatus {
                    first_clock: pcr.seconds,
                    last_clock: pcr.seconds,
                    first_real_time: time_now,
                    last_packet_num: packet_num,
                },
            );
            return true;
        };

        let packets_since_last = packet_num - status.last_packet_num;
        let duration_per_packet = (pcr.seconds - status.last_clock) / packets_since_last as f64;
        // Ignore PCRs that arrive unusually soon; they skew VBR estimates.
        let mean_pcr_period = self.ts_packet_count as f64 / self.ts_pcr_count as f64;
        if (packets_since_last as f64) < mean_pcr_period * self.timing.pcr_period_variation_ratio {
            return true;
        }

        if self.packet_duration_estimate == 0.0 {
            if duration_per_packet > 0.0 {
                self.packet_duration_estimate = duration_per_packet;
            } else {
                tracing::debug!(pid, duration_per_packet, "ignoring non-positive first packet duration");
            }
        } else if !pcr.discontinuity && duration_per_packet >= 0.0 {
            let w = self.timing.new_duration_weight;
            self.packet_duration_estimate =
                duration_per_packet * w + self.packet_duration_estimate * (1.0 - w);
            let transmit_duration = time_now - status.first_real_time;
            let playout_duration = pcr.seconds - status.first_clock;
            if transmit_duration > playout_duration {
                self.packet_duration_estimate *= self.timing.time_adjustment_factor;
            } else if transmit_duration + self.timing.max_playout_buffer_duration < playout_duration {
                self.packet_duration_estimate /= self.timing.time_adjustment_factor;
            }
        } else {
            tracing::debug!(pid, "PCR discontinuity; restarting playout reference");
            status.first_clock = pcr.seconds;
            status.first_real_time = time_now;
        }
        status.last_clock = pcr.seconds;
        status.last_packet_num = packet_num;
        tracing::trace!(
            pid,
            estimate_us = self.packet_duration_estimate * 1e6,
            "TS packet duration estimate"
        );
        true
    }

    fn parse(&mut self, max_size: usize) -> Parse<Frame> {
        self.out.reset(max_size.max(TS_PACKET_SIZE));
        let mut max_packets = (max_size / TS_PACKET_SIZE).max(1);
        if let Some(remaining) = self.packets_remaining {
            if remaining == 0 {
                return Err(Interrupt::Closed);
            }
            max_packets = max_packets.min(usize::try_from(remaining).unwrap_or(usize::MAX));
        }
        let collected = self.collect_packets(max_packets)?;

        let time_now = self.transmit_clock;
        let mut delivered = collected;
        for i in 0..collected {
            let at = i * TS_PACKET_SIZE;
            let packet = self.out.data()[at..at + TS_PACKET_SIZE].to_vec();
            if !self.update_duration_estimate(&packet, time_now) {
                tracing::debug!(limit = ?self.pcr_limit, "reached PCR limit");
                self.ended = true;
                delivered = i;
                break;
            }
        }
        if delivered == 0 {
            return Err(Interrupt::Closed);
        }
        if let Some(remaining) = self.packets_remaining.as_mut() {
            *remaining -= delivered as u64;
        }

        let packet_us = (self.packet_duration_estimate.max(0.0) * 1e6) as u64;
        let duration = Duration::from_micros(delivered as u64 * packet_us);
        self.transmit_clock += duration.as_secs_f64();
        let mut frame = self.out.take_frame(
            Duration::from_secs_f64(time_now),
            duration,
            FrameTag::TransportPackets { count: delivered },
        );
        frame.data.truncate(delivered * TS_PACKET_SIZE);
        Ok(frame)
    }
}

impl<S: ByteSource> FrameSource for TsFramer<S> {
    fn next_frame(&mut self, max_size: usize) -> Result<Pull> {
        if self.ended {
            return Ok(Pull::Closed);
        }
        let parsed = self.parse(max_size);
        into_pull(parsed, &mut self.ended)
    }

    fn flush_input(&mut self) {
        self.parser.flush_input();
        self.ended = false;
    }
}
