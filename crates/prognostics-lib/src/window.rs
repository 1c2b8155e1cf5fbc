//! Watermark-driven window buffer
//!
//! Readings are bucketed per asset and channel, de-duplicated by
//! `(channel, timestamp)`, and released as closed [`Window`]s once the asset
//! watermark (max observed timestamp minus tolerance T) passes a window's end.
//! Windows are aligned to multiples of the hop S and cover `[start, start + L)`.
//! Timestamps outside [`MIN_TIMESTAMP_MS`](crate::models::MIN_TIMESTAMP_MS) and
//! [`MAX_TIMESTAMP_MS`](crate::models::MAX_TIMESTAMP_MS) are refused, so window
//! arithmetic on accepted readings cannot overflow.

use crate::config::{PipelineConfig, WindowConfig};
use crate::models::{
    timestamp_in_range, AssetId, ChannelId, Sample, SensorReading, Timestamp, Window,
};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

/// Result of offering one reading to the buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Accepted,
    /// Same channel and timestamp already buffered; first write wins
    Duplicate,
    /// Older than the watermark; dropped and counted
    Late { watermark: Timestamp },
    /// Channel is not part of the declared channel set
    UnknownChannel,
    /// Timestamp outside the supported range; dropped and counted
    OutOfRange,
}

/// Per-asset counters consumed by observability, never by pipeline logic
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BufferCounters {
    pub accepted: u64,
    pub duplicates: u64,
    pub late_dropped: u64,
    pub unknown_channel: u64,
    pub out_of_range: u64,
    pub missing_channel: u64,
    pub windows_closed: u64,
}

#[derive(Debug, Default)]
struct AssetBuffer {
    channels: BTreeMap<ChannelId, BTreeMap<Timestamp, Option<f64>>>,
    max_timestamp: Option<Timestamp>,
    /// Start of the next window to close; fixed once the first window closes
    next_start: Option<Timestamp>,
    counters: BufferCounters,
}

impl AssetBuffer {
    fn watermark(&self, tolerance_ms: i64) -> Option<Timestamp> {
        self.max_timestamp.map(|max| max - tolerance_ms)
    }

    fn earliest_at_or_after(&self, from: Timestamp) -> Option<Timestamp> {
        self.channels
            .values()
            .filter_map(|points| points.range(from..).next().map(|(ts, _)| *ts))
            .min()
    }

    fn has_data_in(&self, start: Timestamp, end: Timestamp) -> bool {
        self.channels
            .values()
            .any(|points| points.range(start..end).next().is_some())
    }

    fn len(&self) -> usize {
        self.channels.values().map(BTreeMap::len).sum()
    }

    /// Close the next window if the watermark allows it
    fn close_next(
        &mut self,
        asset: &AssetId,
        geometry: &WindowConfig,
        declared: &[ChannelId],
    ) -> Option<Window> {
        let watermark = self.watermark(geometry.tolerance_ms)?;
        let (length, hop) = (geometry.length_ms, geometry.hop_ms);

        let mut start = match self.next_start {
            Some(start) => start,
            None => self.earliest_at_or_after(Timestamp::MIN)?.div_euclid(hop) * hop,
        };

        // Entirely empty windows are skipped, but never past a window that
        // could still receive on-time data.
        while start + length <= watermark && !self.has_data_in(start, start + length) {
            let open_floor = first_window_start(watermark, length, hop);
            let next_data = self
                .earliest_at_or_after(start + length)
                .map(|ts| first_window_start(ts, length, hop))
                .unwrap_or(open_floor);
            start = next_data.min(open_floor).max(start + hop);
            if self.next_start.is_some() {
                self.next_start = Some(start);
            }
        }

        if start + length > watermark {
            return None;
        }

        let end = start + length;
        let mut channels = BTreeMap::new();
        for channel in declared {
            let samples: Vec<Sample> = self
                .channels
                .get(channel)
                .map(|points| {
                    points
                        .range(start..end)
                        .map(|(ts, value)| Sample {
                            timestamp: *ts,
                            value: *value,
                        })
                        .collect()
                })
                .unwrap_or_default();
            if samples.is_empty() {
                self.counters.missing_channel += 1;
            }
            channels.insert(channel.clone(), samples);
        }

        let next = start + hop;
        self.next_start = Some(next);
        for points in self.channels.values_mut() {
            *points = points.split_off(&next);
        }
        self.counters.windows_closed += 1;

        Some(Window {
            asset: asset.clone(),
            start,
            end,
            channels,
        })
    }
}

/// Smallest hop-aligned window start whose window still contains `ts`
fn first_window_start(ts: Timestamp, length: i64, hop: i64) -> Timestamp {
    ((ts - length).div_euclid(hop) + 1) * hop
}

/// Bounded time buffer of raw readings, exclusive owner of reading storage
#[derive(Debug)]
pub struct WindowBuffer {
    geometry: WindowConfig,
    declared: Vec<ChannelId>,
    assets: HashMap<AssetId, AssetBuffer>,
}

impl WindowBuffer {
    pub fn new(geometry: WindowConfig, declared: Vec<ChannelId>) -> Self {
        Self {
            geometry,
            declared,
            assets: HashMap::new(),
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(
            config.window,
            config.channels.iter().map(|c| c.name.clone()).collect(),
        )
    }

    /// Offer one reading; never blocks and never fails
    pub fn ingest(&mut self, reading: SensorReading) -> IngestOutcome {
        let tolerance = self.geometry.tolerance_ms;
        let declared = self.declared.contains(&reading.channel);
        let state = self.assets.entry(reading.asset.clone()).or_default();

        if !declared {
            state.counters.unknown_channel += 1;
            return IngestOutcome::UnknownChannel;
        }
        if !timestamp_in_range(reading.timestamp) {
            state.counters.out_of_range += 1;
            return IngestOutcome::OutOfRange;
        }

        if let Some(watermark) = state.watermark(tolerance) {
            if reading.timestamp < watermark {
                state.counters.late_dropped += 1;
                return IngestOutcome::Late { watermark };
            }
        }

        let value = reading.usable_value();
        let points = state.channels.entry(reading.channel).or_default();
        if points.contains_key(&reading.timestamp) {
            state.counters.duplicates += 1;
            return IngestOutcome::Duplicate;
        }
        points.insert(reading.timestamp, value);

        state.max_timestamp = Some(
            state
                .max_timestamp
                .map_or(reading.timestamp, |max| max.max(reading.timestamp)),
        );
        state.counters.accepted += 1;
        IngestOutcome::Accepted
    }

    /// Lazily close the windows the watermark has passed, oldest first
    ///
    /// Each call starts a fresh sequence; windows not pulled from a dropped
    /// iterator are produced by the next call.
    pub fn poll_closed_windows(&mut self, asset: &AssetId) -> ClosedWindows<'_> {
        ClosedWindows {
            asset: asset.clone(),
            geometry: &self.geometry,
            declared: &self.declared,
            state: self.assets.get_mut(asset),
        }
    }

    pub fn watermark(&self, asset: &AssetId) -> Option<Timestamp> {
        self.assets
            .get(asset)
            .and_then(|s| s.watermark(self.geometry.tolerance_ms))
    }

    pub fn counters(&self, asset: &AssetId) -> Option<&BufferCounters> {
        self.assets.get(asset).map(|s| &s.counters)
    }

    /// Number of buffered points for an asset across all channels
    pub fn buffered_len(&self, asset: &AssetId) -> usize {
        self.assets.get(asset).map_or(0, AssetBuffer::len)
    }

    pub fn geometry(&self) -> &WindowConfig {
        &self.geometry
    }
}

/// Finite sequence of newly closed windows for one asset
pub struct ClosedWindows<'a> {
    asset: AssetId,
    geometry: &'a WindowConfig,
    declared: &'a [ChannelId],
    state: Option<&'a mut AssetBuffer>,
}

impl Iterator for ClosedWindows<'_> {
    type Item = Window;

    fn next(&mut self) -> Option<Window> {
        let state = self.state.as_deref_mut()?;
        state.close_next(&self.asset, self.geometry, self.declared)
    }
}
