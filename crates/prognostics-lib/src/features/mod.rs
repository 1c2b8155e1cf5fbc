//! Feature extraction for model inference
//!
//! Converts a closed window into a fixed-schema feature vector: time-domain
//! statistics for every declared channel plus spectral features for
//! vibration channels. Extraction is pure; identical windows yield identical
//! vectors.

pub mod spectral;
pub mod stats;

use crate::config::{ChannelKind, FrequencyBand, PipelineConfig};
use crate::error::{PipelineError, PipelineResult};
use crate::models::{ChannelId, FeatureVector, Window};
use rustfft::{Fft, FftPlanner};
use std::fmt;
use std::sync::Arc;

use self::spectral::{resample_uniform, summarize};
use self::stats::{TimeStats, TIME_FEATURES};

/// Fixed spectral feature suffixes preceding the band ratios
const SPECTRAL_FEATURES: [&str; 3] = ["spectral_centroid_hz", "dominant_freq_hz", "dominant_magnitude"];

struct ChannelPlan {
    name: ChannelId,
    interval_ms: i64,
    expected: usize,
    max_gap_ms: i64,
    /// Forward FFT planned for `expected` points; vibration channels only
    fft: Option<Arc<dyn Fft<f64>>>,
}

/// Ordered feature names of one schema version and the plan that fills them
pub struct FeatureSchema {
    version: String,
    names: Arc<[String]>,
    channels: Vec<ChannelPlan>,
    bands: Vec<FrequencyBand>,
}

impl FeatureSchema {
    pub fn from_config(config: &PipelineConfig) -> Self {
        let mut planner = FftPlanner::<f64>::new();
        let length = config.window.length_ms;
        let bands = config.features.bands.clone();
        let mut names = Vec::new();
        let mut channels = Vec::with_capacity(config.channels.len());

        for channel in &config.channels {
            let expected = channel.expected_samples(length);
            names.extend(TIME_FEATURES.iter().map(|f| format!("{}.{}", channel.name, f)));

            let fft = match channel.kind {
                ChannelKind::Vibration => {
                    names.extend(
                        SPECTRAL_FEATURES
                            .iter()
                            .map(|f| format!("{}.{}", channel.name, f)),
                    );
                    names.extend(bands.iter().map(|b| {
                        format!("{}.band_{}_{}hz_ratio", channel.name, b.low_hz, b.high_hz)
                    }));
                    Some(planner.plan_fft_forward(expected))
                }
                ChannelKind::Scalar => None,
            };

            channels.push(ChannelPlan {
                name: channel.name.clone(),
                interval_ms: channel.sample_interval_ms,
                expected,
                max_gap_ms: channel.max_gap_ms(),
                fft,
            });
        }

        Self {
            version: config.features.schema_version.clone(),
            names: names.into(),
            channels,
            bands,
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn names(&self) -> &Arc<[String]> {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl fmt::Debug for FeatureSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeatureSchema")
            .field("version", &self.version)
            .field("features", &self.names.len())
            .field("channels", &self.channels.len())
            .finish()
    }
}

/// Extracts fixed-schema feature vectors from closed windows
#[derive(Debug)]
pub struct FeatureExtractor {
    schema: FeatureSchema,
    min_sample_fraction: f64,
}

impl FeatureExtractor {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            schema: FeatureSchema::from_config(config),
            min_sample_fraction: config.features.min_sample_fraction,
        }
    }

    pub fn schema(&self) -> &FeatureSchema {
        &self.schema
    }

    /// Minimum count of present samples a channel needs in one window
    pub fn min_samples(&self, expected: usize) -> usize {
        (self.min_sample_fraction * expected as f64).ceil() as usize
    }

    /// Compute the feature vector of a window
    ///
    /// Fails with [`PipelineError::InsufficientData`] when any declared
    /// channel carries fewer present samples than the minimum fraction, or a
    /// vibration channel has a gap longer than its interpolation cap.
    pub fn extract(&self, window: &Window) -> PipelineResult<FeatureVector> {
        let mut values = Vec::with_capacity(self.schema.len());

        for plan in &self.schema.channels {
            let samples = window.samples(&plan.name);
            let present: Vec<f64> = samples.iter().filter_map(|s| s.value).collect();

            let required = self.min_samples(plan.expected);
            if present.len() < required {
                return Err(self.insufficient(
                    window,
                    &plan.name,
                    format!(
                        "{} of {} expected samples present, {} required",
                        present.len(),
                        plan.expected,
                        required
                    ),
                ));
            }

            let stats = TimeStats::compute(&present).ok_or_else(|| {
                self.insufficient(window, &plan.name, "no samples present".to_string())
            })?;
            values.extend_from_slice(&stats.to_array());

            if let Some(fft) = &plan.fft {
                let grid = resample_uniform(
                    samples,
                    window.start,
                    plan.interval_ms,
                    plan.expected,
                    plan.max_gap_ms,
                )
                .map_err(|reason| self.insufficient(window, &plan.name, reason))?;

                let rate_hz = 1000.0 / plan.interval_ms as f64;
                let summary = summarize(fft.as_ref(), &grid, rate_hz, &self.schema.bands);
                values.push(summary.centroid_hz);
                values.push(summary.dominant_hz);
                values.push(summary.dominant_magnitude);
                values.extend(summary.band_ratios);
            }
        }

        Ok(FeatureVector {
            asset: window.asset.clone(),
            window_end: window.end,
            schema_version: self.schema.version.clone(),
            names: Arc::clone(&self.schema.names),
            values,
        })
    }

    fn insufficient(&self, window: &Window, channel: &ChannelId, reason: String) -> PipelineError {
        PipelineError::InsufficientData {
            asset: window.asset.clone(),
            channel: channel.to_string(),
            window_end: window.end,
            reason,
        }
    }
}
