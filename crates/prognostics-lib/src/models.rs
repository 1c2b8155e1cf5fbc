//! Core data models for the prognostics pipeline
//!
//! Everything downstream of the window buffer is an immutable value record
//! passed by copy between stages.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Epoch milliseconds
pub type Timestamp = i64;

/// Milliseconds per hour, used for RUL and maintenance lead times
pub const MILLIS_PER_HOUR: f64 = 3_600_000.0;

/// Latest accepted reading timestamp, 9999-12-31T23:59:59.999Z
pub const MAX_TIMESTAMP_MS: Timestamp = 253_402_300_799_999;

/// Earliest accepted reading timestamp
pub const MIN_TIMESTAMP_MS: Timestamp = -MAX_TIMESTAMP_MS;

/// Whether a timestamp lies in the range the window arithmetic supports
pub fn timestamp_in_range(ts: Timestamp) -> bool {
    (MIN_TIMESTAMP_MS..=MAX_TIMESTAMP_MS).contains(&ts)
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

string_id!(
    /// Opaque stable identifier of a physical vehicle/asset
    AssetId
);
string_id!(
    /// Sensor signal identifier (e.g. `engine_temp`, `vibration_x`)
    ChannelId
);
string_id!(
    /// Tracked component of an asset (e.g. `brakes`, `engine`)
    ComponentId
);

/// A single raw reading as it arrives from a connector
///
/// Wire schema: `{asset_id, channel, timestamp (epoch millis), value: float|null}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    #[serde(rename = "asset_id")]
    pub asset: AssetId,
    pub channel: ChannelId,
    pub timestamp: Timestamp,
    pub value: Option<f64>,
}

impl SensorReading {
    pub fn new(
        asset: impl Into<AssetId>,
        channel: impl Into<ChannelId>,
        timestamp: Timestamp,
        value: Option<f64>,
    ) -> Self {
        Self {
            asset: asset.into(),
            channel: channel.into(),
            timestamp,
            value,
        }
    }

    /// The value if it is present and finite; NaN and infinities count as missing
    pub fn usable_value(&self) -> Option<f64> {
        self.value.filter(|v| v.is_finite())
    }
}

/// One buffered point of a channel. `value == None` is a preserved gap marker.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: Timestamp,
    pub value: Option<f64>,
}

/// A closed, immutable slice `[start, end)` of readings for one asset
#[derive(Debug, Clone, PartialEq)]
pub struct Window {
    pub asset: AssetId,
    pub start: Timestamp,
    pub end: Timestamp,
    pub channels: BTreeMap<ChannelId, Vec<Sample>>,
}

impl Window {
    pub fn length_ms(&self) -> i64 {
        self.end - self.start
    }

    /// Samples of a channel in timestamp order; empty if the channel had no data
    pub fn samples(&self, channel: &ChannelId) -> &[Sample] {
        self.channels.get(channel).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Declared channels that received no readings at all in this window
    pub fn missing_channels(&self) -> Vec<ChannelId> {
        self.channels
            .iter()
            .filter(|(_, samples)| samples.is_empty())
            .map(|(channel, _)| channel.clone())
            .collect()
    }

    pub fn meta(&self) -> WindowMeta {
        let mut sample_counts = BTreeMap::new();
        let mut missing_counts = BTreeMap::new();
        for (channel, samples) in &self.channels {
            let missing = samples.iter().filter(|s| s.value.is_none()).count();
            sample_counts.insert(channel.clone(), samples.len() - missing);
            missing_counts.insert(channel.clone(), missing);
        }
        WindowMeta {
            asset_id: self.asset.clone(),
            start: self.start,
            end: self.end,
            sample_counts,
            missing_counts,
        }
    }
}

/// Window metadata written to the outbound record stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowMeta {
    pub asset_id: AssetId,
    pub start: Timestamp,
    pub end: Timestamp,
    pub sample_counts: BTreeMap<ChannelId, usize>,
    pub missing_counts: BTreeMap<ChannelId, usize>,
}

/// Fixed-schema feature vector computed from one window
///
/// `names` is shared with the schema that produced it, so every vector of a
/// schema version carries the same ordered feature names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    #[serde(rename = "asset_id")]
    pub asset: AssetId,
    pub window_end: Timestamp,
    pub schema_version: String,
    pub names: Arc<[String]>,
    pub values: Vec<f64>,
}

impl FeatureVector {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.names
            .iter()
            .position(|n| n == name)
            .and_then(|i| self.values.get(i).copied())
    }

    /// Iterate `(name, value)` pairs in schema order
    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> + '_ {
        self.names
            .iter()
            .map(String::as_str)
            .zip(self.values.iter().copied())
    }
}

/// Kind of judgment a prediction carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PredictionKind {
    Rul,
    Anomaly,
}

impl fmt::Display for PredictionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PredictionKind::Rul => write!(f, "rul"),
            PredictionKind::Anomaly => write!(f, "anomaly"),
        }
    }
}

/// Typed model output for one window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    #[serde(rename = "asset_id")]
    pub asset: AssetId,
    /// Target component for RUL predictions; anomaly scores are asset-wide
    #[serde(skip_serializing_if = "Option::is_none")]
    pub component: Option<ComponentId>,
    pub timestamp: Timestamp,
    pub kind: PredictionKind,
    /// RUL in hours (non-negative) or anomaly score within the model's range
    pub value: f64,
    /// Normalized to [0, 1]
    pub confidence: f64,
    pub model_version: String,
}

/// Alert severity of one asset component
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    #[default]
    Normal,
    Warning,
    Critical,
}

impl AlertLevel {
    /// Contribution of this level to the asset health score
    pub fn severity_score(&self) -> f64 {
        match self {
            AlertLevel::Normal => 1.0,
            AlertLevel::Warning => 0.5,
            AlertLevel::Critical => 0.0,
        }
    }

    pub fn is_alerting(&self) -> bool {
        !matches!(self, AlertLevel::Normal)
    }
}

impl fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertLevel::Normal => write!(f, "normal"),
            AlertLevel::Warning => write!(f, "warning"),
            AlertLevel::Critical => write!(f, "critical"),
        }
    }
}

/// Current alert state of an (asset, component) pair
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AlertState {
    pub level: AlertLevel,
    pub entered_at: Timestamp,
    /// Length of the streak currently pushing toward the next transition
    pub consecutive: u32,
}

impl Default for AlertState {
    fn default() -> Self {
        Self {
            level: AlertLevel::Normal,
            entered_at: 0,
            consecutive: 0,
        }
    }
}

/// A change of alert level, emitted once per transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertTransition {
    #[serde(rename = "asset_id")]
    pub asset: AssetId,
    pub component: ComponentId,
    pub from: AlertLevel,
    pub to: AlertLevel,
    pub at: Timestamp,
    pub trigger: PredictionKind,
    /// Prediction value that completed the streak
    pub value: f64,
}

/// Lifecycle of a maintenance task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Open,
    Superseded,
    Closed,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Open => write!(f, "open"),
            TaskStatus::Superseded => write!(f, "superseded"),
            TaskStatus::Closed => write!(f, "closed"),
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "open" => Ok(TaskStatus::Open),
            "superseded" => Ok(TaskStatus::Superseded),
            "closed" => Ok(TaskStatus::Closed),
            other => Err(format!("unknown task status '{other}'")),
        }
    }
}

/// Maintenance work order generated from an alert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaintenanceTask {
    pub id: String,
    #[serde(rename = "asset_id")]
    pub asset: AssetId,
    pub component: ComponentId,
    pub due_by: Timestamp,
    pub reason: PredictionKind,
    pub severity: AlertLevel,
    pub generated_at: Timestamp,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<Timestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub superseded_by: Option<String>,
}

impl MaintenanceTask {
    pub fn is_open(&self) -> bool {
        self.status == TaskStatus::Open
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reading_wire_schema() {
        let json = r#"{"asset_id":"truck-7","channel":"rpm","timestamp":1700000000000,"value":null}"#;
        let reading: SensorReading = serde_json::from_str(json).unwrap();
        assert_eq!(reading.asset.as_str(), "truck-7");
        assert_eq!(reading.value, None);
        assert_eq!(reading.usable_value(), None);

        let nan = SensorReading::new("truck-7", "rpm", 0, Some(f64::NAN));
        assert_eq!(nan.usable_value(), None);
    }

    #[test]
    fn test_alert_level_ordering() {
        assert!(AlertLevel::Critical > AlertLevel::Warning);
        assert!(AlertLevel::Warning > AlertLevel::Normal);
        assert_eq!(AlertLevel::Warning.severity_score(), 0.5);
    }

    #[test]
    fn test_window_meta_counts_gaps() {
        let mut channels = BTreeMap::new();
        channels.insert(
            ChannelId::from("rpm"),
            vec![
                Sample { timestamp: 0, value: Some(1.0) },
                Sample { timestamp: 10, value: None },
            ],
        );
        channels.insert(ChannelId::from("temp"), vec![]);
        let window = Window {
            asset: AssetId::from("a"),
            start: 0,
            end: 60,
            channels,
        };

        let meta = window.meta();
        assert_eq!(meta.sample_counts[&ChannelId::from("rpm")], 1);
        assert_eq!(meta.missing_counts[&ChannelId::from("rpm")], 1);
        assert_eq!(window.missing_channels(), vec![ChannelId::from("temp")]);
    }

    #[test]
    fn test_task_status_parse() {
        assert_eq!("OPEN".parse::<TaskStatus>().unwrap(), TaskStatus::Open);
        assert!("done".parse::<TaskStatus>().is_err());
    }
}
