//! Transport Stream playback with seeking and scale changes.
//!
//! At scale 1 the original packets are delivered as they are. At any other
//! scale the packets come from a [`TrickModeFilter`] remuxed back into a
//! Transport Stream by [`EsToTransportStream`]. Both paths end in a
//! [`TsFramer`], so the consumer always sees paced TS packets.

use std::io::{Read, Seek};

use super::filter::TrickModeFilter;
use super::remux::EsToTransportStream;
use crate::config::TsTimingConfig;
use crate::error::{Result, StreamError};
use crate::frame::{FrameSource, Pull};
use crate::framer::TsFramer;
use crate::index::{IndexFile, IndexPosition};
use crate::source::ByteSource;

type TrickStream<S, R> = TsFramer<EsToTransportStream<TrickModeFilter<S, R>>>;

enum Mode<S, R> {
    Normal {
        framer: TsFramer<S>,
        index: IndexFile<R>,
    },
    Trick {
        framer: TrickStream<S, R>,
    },
}

pub struct TrickPlayer<S, R> {
    /// `None` only while switching modes.
    mode: Option<Mode<S, R>>,
    timing: TsTimingConfig,
    scale: i32,
    next_scale: i32,
    /// TS packet the current play range started from.
    packet_number: u64,
    record_number: u64,
    npt: f64,
    /// Framer packets already folded into `packet_number`.
    packets_accounted: u64,
}

impl<S: ByteSource, R: Read + Seek> TrickPlayer<S, R> {
    pub fn new(source: S, index: IndexFile<R>) -> Result<Self> {
        Self::with_timing(source, index, TsTimingConfig::default())
    }

    pub fn with_timing(source: S, index: IndexFile<R>, timing: TsTimingConfig) -> Result<Self> {
        if index.is_empty() {
            return Err(StreamError::EmptyIndex);
        }
        Ok(Self {
            mode: Some(Mode::Normal {
                framer: TsFramer::with_timing(source, timing.clone()),
                index,
            }),
            timing,
            scale: 1,
            next_scale: 1,
            packet_number: 0,
            record_number: 0,
            npt: 0.0,
            packets_accounted: 0,
        })
    }

    pub fn scale(&self) -> i32 {
        self.scale
    }

    pub fn next_scale(&self) -> i32 {
        self.next_scale
    }

    pub fn npt(&self) -> f64 {
        self.npt
    }

    pub fn packet_number(&self) -> u64 {
        self.packet_number
    }

    pub fn record_number(&self) -> u64 {
        self.record_number
    }

    pub fn is_trick_mode(&self) -> bool {
        matches!(self.mode, Some(Mode::Trick { .. }))
    }

    fn switching() -> StreamError {
        StreamError::InvalidConfig("trick player lost its source while switching modes".into())
    }

    pub fn index_mut(&mut self) -> Result<&mut IndexFile<R>> {
        match self.mode.as_mut().ok_or_else(Self::switching)? {
            Mode::Normal { index, .. } => Ok(index),
            Mode::Trick { framer } => Ok(framer.source_mut().inner_mut().index_mut()),
        }
    }

    pub fn playing_duration(&mut self) -> Result<f64> {
        self.index_mut()?.playing_duration()
    }

    /// Fold the packets delivered at scale 1 into the current position.
    fn update_packet_position(&mut self) {
        if let Some(Mode::Normal { framer, .. }) = &self.mode {
            let count = framer.ts_packet_count();
            self.packet_number += count.saturating_sub(self.packets_accounted);
            self.packets_accounted = count;
        }
    }

    /// Move to `npt` seconds and optionally bound how much is played from
    /// there. Returns the number of packets to stream at scale 1, or 0 when
    /// unbounded (or bounded by PCR at other scales).
    pub fn seek(&mut self, npt: f64, stream_duration: Option<f64>) -> Result<u64> {
        let target = self.index_mut()?.lookup_packet_from_time(npt)?;
        self.update_packet_position();
        if target.packet_number != self.packet_number {
            self.packet_number = target.packet_number;
            self.record_number = target.record;
            match self.mode.as_mut().ok_or_else(Self::switching)? {
                Mode::Normal { framer, .. } => {
                    framer.seek_to_packet(target.packet_number)?;
                    framer.clear_pid_status_table();
                }
                Mode::Trick { framer } => {
                    let remux = framer.source_mut();
                    remux.inner_mut().seek_to_record(target.record);
                    remux.reset();
                    framer.flush_input();
                    framer.clear_pid_status_table();
                }
            }
            self.packets_accounted = 0;
        }
        self.npt = target.npt;

        let mut packets = 0;
        let mut pcr_limit = None;
        if let Some(duration) = stream_duration.filter(|d| *d > 0.0) {
            // the lookup may have moved npt back to a clean point
            let remaining = duration + npt - target.npt;
            if remaining > 0.0 {
                if self.next_scale == 1 {
                    let to = self.index_mut()?.lookup_packet_from_time(target.npt + remaining)?;
                    packets = to.packet_number.saturating_sub(target.packet_number);
                } else {
                    pcr_limit = Some(remaining / f64::from(self.next_scale.unsigned_abs()));
                }
            }
        }
        tracing::debug!(npt, found = target.npt, packet = target.packet_number, packets, ?pcr_limit, "seek");
        match self.mode.as_mut().ok_or_else(Self::switching)? {
            Mode::Normal { framer, .. } => {
                framer.set_packet_limit((packets > 0).then_some(packets));
                framer.set_pcr_limit(pcr_limit);
            }
            Mode::Trick { framer } => {
                framer.set_packet_limit((packets > 0).then_some(packets));
                framer.set_pcr_limit(pcr_limit);
            }
        }
        Ok(packets)
    }

    /// Scale to use from the next [`play`](Self::play) on. Negative scales
    /// play in reverse.
    pub fn set_next_scale(&mut self, scale: i32) -> Result<()> {
        if scale == 0 {
            return Err(StreamError::InvalidConfig("trick play scale must not be 0".into()));
        }
        self.next_scale = scale;
        Ok(())
    }

    /// Resume after a pause, switching to the pending scale if it changed.
    pub fn play(&mut self) -> Result<()> {
        if self.next_scale != self.scale {
            self.update_state_on_play_change(true)?;
            self.update_state_on_scale_change()?;
        }
        Ok(())
    }

    /// Record where playback stopped.
    pub fn pause(&mut self) -> Result<()> {
        self.update_state_on_play_change(false)
    }

    fn update_state_on_play_change(&mut self, rewind_to_clean_point: bool) -> Result<()> {
        self.update_packet_position();
        let position = match self.mode.as_mut().ok_or_else(Self::switching)? {
            Mode::Normal { index, .. } => {
                index.lookup_time_from_packet(self.packet_number, rewind_to_clean_point)?
            }
            Mode::Trick { framer } => {
                let filter = framer.source_mut().inner_mut();
                let last = filter.index_mut().num_records().saturating_sub(1);
                let record = u64::try_from(filter.next_index_record()).unwrap_or(0).min(last);
                let r = filter.index_mut().read_record(record)?;
                IndexPosition {
                    npt: r.pcr,
                    packet_number: u64::from(r.packet_number),
                    record,
                }
            }
        };
        self.npt = position.npt;
        self.record_number = position.record;
        self.packet_number = position.packet_number;
        tracing::debug!(npt = self.npt, packet = self.packet_number, record = self.record_number, "play position");
        Ok(())
    }

    fn update_state_on_scale_change(&mut self) -> Result<()> {
        let (source, index) = match self.mode.take().ok_or_else(Self::switching)? {
            Mode::Normal { framer, index } => (framer.into_source(), index),
            Mode::Trick { framer } => framer.into_source().into_inner().into_parts(),
        };
        self.scale = self.next_scale;
        self.packets_accounted = 0;

        if self.scale != 1 {
            let mut filter = TrickModeFilter::new(source, index, self.scale)?;
            filter.seek_to_record(self.record_number);
            let remux = EsToTransportStream::new(filter);
            self.mode = Some(Mode::Trick {
                framer: TsFramer::with_timing(remux, self.timing.clone()),
            });
            tracing::info!(scale = self.scale, npt = self.npt, "trick play");
            return Ok(());
        }

        let mut framer = TsFramer::with_timing(source, self.timing.clone());
        let seeked = framer.seek_to_packet(self.packet_number);
        self.mode = Some(Mode::Normal { framer, index });
        tracing::info!(npt = self.npt, "normal play");
        seeked
    }
}

impl<S: ByteSource, R: Read + Seek> FrameSource for TrickPlayer<S, R> {
    fn next_frame(&mut self, max_size: usize) -> Result<Pull> {
        match self.mode.as_mut() {
            Some(Mode::Normal { framer, .. }) => framer.next_frame(max_size),
            Some(Mode::Trick { framer }) => framer.next_frame(max_size),
            None => Ok(Pull::Closed),
        }
    }

    fn flush_input(&mut self) {
        match self.mode.as_mut() {
            Some(Mode::Normal { framer, .. }) => framer.flush_input(),
            Some(Mode::Trick { framer }) => framer.flush_input(),
            None => {}
        }
    }
}
