//! Static pipeline configuration
//!
//! Deserialized once at startup (the agent layers a file with environment
//! overrides) and validated before any unit starts.

use crate::error::{PipelineError, PipelineResult};
use crate::models::{ChannelId, ComponentId, PredictionKind};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;

/// Default minimum fraction of expected samples a channel must carry
pub const DEFAULT_MIN_SAMPLE_FRACTION: f64 = 0.5;

/// Default gap cap for spectral resampling, in sample intervals
pub const DEFAULT_MAX_GAP_INTERVALS: i64 = 5;

/// Upper bound for window length, hop and tolerance
pub const MAX_WINDOW_SPAN_MS: i64 = 366 * 24 * 3_600_000;

/// Full configuration surface of the pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub window: WindowConfig,
    pub channels: Vec<ChannelConfig>,
    #[serde(default)]
    pub features: FeatureConfig,
    pub components: Vec<ComponentConfig>,
    #[serde(default)]
    pub models: Vec<ModelBinding>,
    /// Model version scored by `score_anomaly`
    #[serde(default)]
    pub anomaly_model: Option<String>,
    #[serde(default)]
    pub inference: InferenceConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub health: HealthWeights,
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
    #[serde(default)]
    pub projection: ProjectionConfig,
}

/// Window geometry of an asset
///
/// The top-level `window` is the default for every channel. A channel may
/// restate it under its own `window` key, but all channels of an asset close
/// together in one window, so validation requires them to agree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowConfig {
    /// Window length L
    pub length_ms: i64,
    /// Slide S (S <= L)
    pub hop_ms: i64,
    /// Out-of-order tolerance T
    pub tolerance_ms: i64,
}

impl WindowConfig {
    fn check(&self, scope: &str) -> PipelineResult<()> {
        if self.length_ms <= 0 || self.length_ms > MAX_WINDOW_SPAN_MS {
            return Err(invalid(format!(
                "{scope}.length_ms must be in (0, {MAX_WINDOW_SPAN_MS}]"
            )));
        }
        if self.hop_ms <= 0 || self.hop_ms > self.length_ms {
            return Err(invalid(format!("{scope}.hop_ms must be in (0, length_ms]")));
        }
        if self.tolerance_ms < 0 || self.tolerance_ms > MAX_WINDOW_SPAN_MS {
            return Err(invalid(format!(
                "{scope}.tolerance_ms must be in [0, {MAX_WINDOW_SPAN_MS}]"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    #[default]
    Scalar,
    /// High-frequency channel that also gets spectral features
    Vibration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub name: ChannelId,
    /// Nominal sampling interval of the source
    pub sample_interval_ms: i64,
    #[serde(default)]
    pub kind: ChannelKind,
    /// Longest gap bridged by linear interpolation before resampling fails
    #[serde(default)]
    pub max_gap_ms: Option<i64>,
    /// Channel-level window geometry; defaults to the asset window
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window: Option<WindowConfig>,
}

impl ChannelConfig {
    pub fn expected_samples(&self, window_length_ms: i64) -> usize {
        (window_length_ms / self.sample_interval_ms).max(1) as usize
    }

    pub fn max_gap_ms(&self) -> i64 {
        self.max_gap_ms
            .unwrap_or(self.sample_interval_ms * DEFAULT_MAX_GAP_INTERVALS)
    }
}

/// Frequency band `[low_hz, high_hz)` used for band-energy ratios
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrequencyBand {
    pub low_hz: f64,
    pub high_hz: f64,
}

impl FrequencyBand {
    pub fn contains(&self, hz: f64) -> bool {
        hz >= self.low_hz && hz < self.high_hz
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureConfig {
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
    #[serde(default = "default_min_sample_fraction")]
    pub min_sample_fraction: f64,
    #[serde(default)]
    pub bands: Vec<FrequencyBand>,
}

fn default_schema_version() -> String {
    "v1".to_string()
}

fn default_min_sample_fraction() -> f64 {
    DEFAULT_MIN_SAMPLE_FRACTION
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            schema_version: default_schema_version(),
            min_sample_fraction: DEFAULT_MIN_SAMPLE_FRACTION,
            bands: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentConfig {
    pub name: ComponentId,
    /// Weight of this component in the asset health score
    #[serde(default = "default_weight")]
    pub weight: f64,
    pub policy: AlertPolicy,
}

fn default_weight() -> f64 {
    1.0
}

/// Which prediction drives a component's alerts, and how
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AlertPolicy {
    Rul(RulPolicy),
    Anomaly(AnomalyPolicy),
}

impl AlertPolicy {
    pub fn kind(&self) -> PredictionKind {
        match self {
            AlertPolicy::Rul(_) => PredictionKind::Rul,
            AlertPolicy::Anomaly(_) => PredictionKind::Anomaly,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RulPolicy {
    /// Model version producing this component's RUL
    pub model: String,
    /// WARNING below this horizon (H_w)
    pub warning_hours: f64,
    /// CRITICAL below this horizon (H_c < H_w)
    pub critical_hours: f64,
    /// Consecutive windows required to change level
    #[serde(default = "default_debounce")]
    pub debounce: u32,
}

fn default_debounce() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyPolicy {
    /// theta_w
    pub warning_threshold: f64,
    /// theta_c
    pub critical_threshold: f64,
    /// K_w
    pub warning_count: u32,
    /// K_c
    pub critical_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelFamily {
    Linear,
    TreeEnsemble,
    Onnx,
}

impl std::fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelFamily::Linear => write!(f, "linear"),
            ModelFamily::TreeEnsemble => write!(f, "tree_ensemble"),
            ModelFamily::Onnx => write!(f, "onnx"),
        }
    }
}

/// Binding of a model version to its artifact and metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelBinding {
    pub version: String,
    pub family: ModelFamily,
    pub kind: PredictionKind,
    /// Feature schema the model was trained against
    pub schema_version: String,
    /// Artifact path, relative paths resolve against the agent's model dir
    pub artifact: PathBuf,
    /// Hex SHA-256 of the artifact; verified at load when present
    #[serde(default)]
    pub sha256: Option<String>,
    /// Input width, required for ONNX models
    #[serde(default)]
    pub input_len: Option<usize>,
    /// Anomaly decision threshold baked into the model version
    #[serde(default)]
    pub decision_threshold: Option<f64>,
    /// Anomaly score range `[low, high]`
    #[serde(default)]
    pub score_range: Option<[f64; 2]>,
    /// Spread (hours) at which RUL confidence drops to one half
    #[serde(default)]
    pub rul_scale_hours: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceConfig {
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Scoring calls in flight per model version across the fleet, timed out
    /// calls included until they return
    #[serde(default = "default_max_concurrent_calls")]
    pub max_concurrent_calls: usize,
}

fn default_timeout_ms() -> u64 {
    250
}

fn default_max_concurrent_calls() -> usize {
    16
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            max_concurrent_calls: default_max_concurrent_calls(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Bounded inbound queue per asset unit
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,
}

fn default_queue_capacity() -> usize {
    1024
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: default_queue_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthWeights {
    #[serde(default = "default_severity_weight")]
    pub severity_weight: f64,
    #[serde(default = "default_rul_margin_weight")]
    pub rul_margin_weight: f64,
}

fn default_severity_weight() -> f64 {
    0.7
}

fn default_rul_margin_weight() -> f64 {
    0.3
}

impl Default for HealthWeights {
    fn default() -> Self {
        Self {
            severity_weight: default_severity_weight(),
            rul_margin_weight: default_rul_margin_weight(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    #[serde(default = "default_warning_lead")]
    pub warning_lead_hours: f64,
    #[serde(default = "default_critical_lead")]
    pub critical_lead_hours: f64,
    /// Closed and superseded tasks retained per unit for queries
    #[serde(default = "default_task_history")]
    pub history_capacity: usize,
}

fn default_warning_lead() -> f64 {
    168.0
}

fn default_critical_lead() -> f64 {
    24.0
}

fn default_task_history() -> usize {
    256
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            warning_lead_hours: default_warning_lead(),
            critical_lead_hours: default_critical_lead(),
            history_capacity: default_task_history(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectionConfig {
    /// Alert transitions retained per asset for the alert feed
    #[serde(default = "default_feed_capacity")]
    pub alert_feed_capacity: usize,
}

fn default_feed_capacity() -> usize {
    256
}

impl Default for ProjectionConfig {
    fn default() -> Self {
        Self {
            alert_feed_capacity: default_feed_capacity(),
        }
    }
}

impl PipelineConfig {
    /// Geometry a channel's readings are windowed with
    pub fn channel_window(&self, channel: &ChannelConfig) -> WindowConfig {
        channel.window.unwrap_or(self.window)
    }

    pub fn channel(&self, name: &ChannelId) -> Option<&ChannelConfig> {
        self.channels.iter().find(|c| &c.name == name)
    }

    pub fn component(&self, name: &ComponentId) -> Option<&ComponentConfig> {
        self.components.iter().find(|c| &c.name == name)
    }

    pub fn model(&self, version: &str) -> Option<&ModelBinding> {
        self.models.iter().find(|m| m.version == version)
    }

    pub fn has_anomaly_components(&self) -> bool {
        self.components
            .iter()
            .any(|c| matches!(c.policy, AlertPolicy::Anomaly(_)))
    }

    /// Reject configurations that cannot run
    ///
    /// Model/feature schema compatibility is intentionally not checked here:
    /// it is enforced per call by the inference adapter.
    pub fn validate(&self) -> PipelineResult<()> {
        let w = &self.window;
        w.check("window")?;

        if self.channels.is_empty() {
            return Err(invalid("at least one channel must be declared"));
        }
        let mut seen = HashSet::new();
        for channel in &self.channels {
            if !seen.insert(&channel.name) {
                return Err(invalid(format!("duplicate channel '{}'", channel.name)));
            }
            if let Some(own) = &channel.window {
                own.check(&format!("channels.{}.window", channel.name))?;
                if own != w {
                    return Err(invalid(format!(
                        "channel '{}': window {}/{}/{} ms differs from the asset window \
                         {}/{}/{} ms (length/hop/tolerance); channels of one asset share \
                         a window",
                        channel.name,
                        own.length_ms,
                        own.hop_ms,
                        own.tolerance_ms,
                        w.length_ms,
                        w.hop_ms,
                        w.tolerance_ms
                    )));
                }
            }
            if channel.sample_interval_ms <= 0 || channel.sample_interval_ms > w.length_ms {
                return Err(invalid(format!(
                    "channel '{}': sample_interval_ms must be in (0, window length]",
                    channel.name
                )));
            }
            if channel.max_gap_ms() < channel.sample_interval_ms {
                return Err(invalid(format!(
                    "channel '{}': max_gap_ms is shorter than the sample interval",
                    channel.name
                )));
            }
        }

        let f = &self.features;
        if !(f.min_sample_fraction > 0.0 && f.min_sample_fraction <= 1.0) {
            return Err(invalid("features.min_sample_fraction must be in (0, 1]"));
        }
        for band in &f.bands {
            if band.low_hz < 0.0 || band.high_hz <= band.low_hz {
                return Err(invalid(format!(
                    "frequency band [{}, {}) is empty or negative",
                    band.low_hz, band.high_hz
                )));
            }
        }

        let mut versions = HashSet::new();
        for model in &self.models {
            if !versions.insert(model.version.as_str()) {
                return Err(invalid(format!("duplicate model version '{}'", model.version)));
            }
            if model.family == ModelFamily::Onnx && model.input_len.is_none() {
                return Err(invalid(format!(
                    "onnx model '{}' requires input_len",
                    model.version
                )));
            }
            if let Some([low, high]) = model.score_range {
                if high <= low {
                    return Err(invalid(format!(
                        "model '{}': score_range must be increasing",
                        model.version
                    )));
                }
            }
        }

        if self.components.is_empty() {
            return Err(invalid("at least one component must be declared"));
        }
        let mut names = HashSet::new();
        for component in &self.components {
            if !names.insert(&component.name) {
                return Err(invalid(format!("duplicate component '{}'", component.name)));
            }
            if component.weight < 0.0 || !component.weight.is_finite() {
                return Err(invalid(format!(
                    "component '{}': weight must be a finite non-negative number",
                    component.name
                )));
            }
            match &component.policy {
                AlertPolicy::Rul(p) => {
                    if !(p.critical_hours < p.warning_hours) || p.critical_hours < 0.0 {
                        return Err(invalid(format!(
                            "component '{}': need 0 <= critical_hours < warning_hours",
                            component.name
                        )));
                    }
                    if p.debounce == 0 {
                        return Err(invalid(format!(
                            "component '{}': debounce must be at least 1",
                            component.name
                        )));
                    }
                    self.require_model(&p.model, PredictionKind::Rul)?;
                }
                AlertPolicy::Anomaly(p) => {
                    if p.critical_threshold < p.warning_threshold {
                        return Err(invalid(format!(
                            "component '{}': critical_threshold below warning_threshold",
                            component.name
                        )));
                    }
                    if p.warning_count == 0 || p.critical_count == 0 {
                        return Err(invalid(format!(
                            "component '{}': debounce counts must be at least 1",
                            component.name
                        )));
                    }
                }
            }
        }

        if self.has_anomaly_components() {
            let version = self
                .anomaly_model
                .as_deref()
                .ok_or_else(|| invalid("anomaly components declared without anomaly_model"))?;
            self.require_model(version, PredictionKind::Anomaly)?;
        }

        let h = &self.health;
        for (name, weight) in [
            ("severity_weight", h.severity_weight),
            ("rul_margin_weight", h.rul_margin_weight),
        ] {
            if !weight.is_finite() || weight < 0.0 {
                return Err(invalid(format!(
                    "health.{name} must be a finite non-negative number"
                )));
            }
        }
        if h.severity_weight + h.rul_margin_weight <= 0.0 {
            return Err(invalid("health weights must not both be zero"));
        }

        let m = &self.maintenance;
        for (name, hours) in [
            ("warning_lead_hours", m.warning_lead_hours),
            ("critical_lead_hours", m.critical_lead_hours),
        ] {
            if !hours.is_finite() || hours < 0.0 {
                return Err(invalid(format!(
                    "maintenance.{name} must be a finite non-negative number"
                )));
            }
        }

        if self.inference.timeout_ms == 0 {
            return Err(invalid("inference.timeout_ms must be positive"));
        }
        if self.inference.max_concurrent_calls == 0 {
            return Err(invalid("inference.max_concurrent_calls must be positive"));
        }
        if self.queue.capacity == 0 {
            return Err(invalid("queue.capacity must be positive"));
        }

        Ok(())
    }

    fn require_model(&self, version: &str, kind: PredictionKind) -> PipelineResult<()> {
        match self.model(version) {
            Some(binding) if binding.kind == kind => Ok(()),
            Some(binding) => Err(invalid(format!(
                "model '{}' is bound as {} but used for {}",
                version, binding.kind, kind
            ))),
            None => Err(invalid(format!("model '{version}' is not bound"))),
        }
    }
}

fn invalid(message: impl Into<String>) -> PipelineError {
    PipelineError::Config(message.into())
}
