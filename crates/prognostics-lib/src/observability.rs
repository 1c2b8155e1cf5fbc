//! Observability infrastructure for the prognostics pipeline
//!
//! Provides:
//! - Prometheus metrics (ingest counters, window outcomes, inference latency, alert transitions)
//! - Structured JSON logging with tracing

use crate::error::PipelineError;
use crate::maintenance::TaskChange;
use crate::models::{AlertTransition, AssetId, ChannelId, Prediction, Timestamp, WindowMeta};
use prometheus::{
    register_gauge_vec, register_histogram, register_int_counter, register_int_counter_vec,
    register_int_gauge, GaugeVec, Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{debug, error, info, warn};

/// Default histogram buckets for latency measurements (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.0001, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<PipelineMetricsInner> = OnceLock::new();

struct PipelineMetricsInner {
    readings_ingested: IntCounter,
    late_readings_dropped: IntCounter,
    duplicate_readings: IntCounter,
    unknown_channel_readings: IntCounter,
    out_of_range_readings: IntCounter,
    missing_channel_windows: IntCounter,
    windows_closed: IntCounter,
    windows_rejected: IntCounter,
    windows_unscored: IntCounter,
    predictions: IntCounterVec,
    inference_timeouts: IntCounter,
    schema_mismatches: IntCounter,
    alert_transitions: IntCounterVec,
    maintenance_tasks_opened: IntCounter,
    feature_latency_seconds: Histogram,
    inference_latency_seconds: Histogram,
    active_units: IntGauge,
    model_info: GaugeVec,
}

impl PipelineMetricsInner {
    fn new() -> Self {
        Self {
            readings_ingested: register_int_counter!(
                "prognostics_readings_ingested_total",
                "Readings accepted into a window buffer"
            )
            .expect("Failed to register readings_ingested"),

            late_readings_dropped: register_int_counter!(
                "prognostics_late_readings_dropped_total",
                "Readings dropped for arriving behind the watermark"
            )
            .expect("Failed to register late_readings_dropped"),

            duplicate_readings: register_int_counter!(
                "prognostics_duplicate_readings_total",
                "Readings ignored as duplicates of a buffered (channel, timestamp)"
            )
            .expect("Failed to register duplicate_readings"),

            unknown_channel_readings: register_int_counter!(
                "prognostics_unknown_channel_readings_total",
                "Readings for channels outside the declared channel set"
            )
            .expect("Failed to register unknown_channel_readings"),

            out_of_range_readings: register_int_counter!(
                "prognostics_out_of_range_readings_total",
                "Readings dropped for a timestamp outside the supported range"
            )
            .expect("Failed to register out_of_range_readings"),

            missing_channel_windows: register_int_counter!(
                "prognostics_missing_channel_windows_total",
                "Declared channels that had no readings in a closed window"
            )
            .expect("Failed to register missing_channel_windows"),

            windows_closed: register_int_counter!(
                "prognostics_windows_closed_total",
                "Windows closed by watermark advance"
            )
            .expect("Failed to register windows_closed"),

            windows_rejected: register_int_counter!(
                "prognostics_windows_rejected_total",
                "Windows skipped for insufficient or gappy data"
            )
            .expect("Failed to register windows_rejected"),

            windows_unscored: register_int_counter!(
                "prognostics_windows_unscored_total",
                "Window scopes left unscored after inference failure"
            )
            .expect("Failed to register windows_unscored"),

            predictions: register_int_counter_vec!(
                "prognostics_predictions_total",
                "Predictions produced, by kind",
                &["kind"]
            )
            .expect("Failed to register predictions"),

            inference_timeouts: register_int_counter!(
                "prognostics_inference_timeouts_total",
                "Inference calls that exhausted their retry"
            )
            .expect("Failed to register inference_timeouts"),

            schema_mismatches: register_int_counter!(
                "prognostics_schema_mismatches_total",
                "Model and feature schema incompatibilities detected"
            )
            .expect("Failed to register schema_mismatches"),

            alert_transitions: register_int_counter_vec!(
                "prognostics_alert_transitions_total",
                "Alert level transitions, by target level",
                &["level"]
            )
            .expect("Failed to register alert_transitions"),

            maintenance_tasks_opened: register_int_counter!(
                "prognostics_maintenance_tasks_opened_total",
                "Maintenance tasks generated"
            )
            .expect("Failed to register maintenance_tasks_opened"),

            feature_latency_seconds: register_histogram!(
                "prognostics_feature_extraction_latency_seconds",
                "Time spent extracting features from one window",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register feature_latency_seconds"),

            inference_latency_seconds: register_histogram!(
                "prognostics_inference_latency_seconds",
                "Time spent scoring one window scope, retries included",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register inference_latency_seconds"),

            active_units: register_int_gauge!(
                "prognostics_active_asset_units",
                "Asset processing units currently running"
            )
            .expect("Failed to register active_units"),

            model_info: register_gauge_vec!(
                "prognostics_model_info",
                "Loaded model versions",
                &["version", "family", "kind"]
            )
            .expect("Failed to register model_info"),
        }
    }
}

/// Pipeline metrics for Prometheus exposition
///
/// Lightweight handle to the global metrics instance; clones share the same
/// underlying metrics.
#[derive(Clone)]
pub struct PipelineMetrics {
    _private: (),
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(PipelineMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &PipelineMetricsInner {
        GLOBAL_METRICS.get_or_init(PipelineMetricsInner::new)
    }

    pub fn inc_readings_ingested(&self) {
        self.inner().readings_ingested.inc();
    }

    pub fn inc_late_dropped(&self) {
        self.inner().late_readings_dropped.inc();
    }

    pub fn inc_duplicates(&self) {
        self.inner().duplicate_readings.inc();
    }

    pub fn inc_unknown_channel(&self) {
        self.inner().unknown_channel_readings.inc();
    }

    pub fn inc_out_of_range(&self) {
        self.inner().out_of_range_readings.inc();
    }

    pub fn add_missing_channels(&self, count: u64) {
        self.inner().missing_channel_windows.inc_by(count);
    }

    pub fn inc_windows_closed(&self) {
        self.inner().windows_closed.inc();
    }

    pub fn inc_windows_rejected(&self) {
        self.inner().windows_rejected.inc();
    }

    pub fn inc_windows_unscored(&self) {
        self.inner().windows_unscored.inc();
    }

    pub fn inc_predictions(&self, kind: &str) {
        self.inner().predictions.with_label_values(&[kind]).inc();
    }

    pub fn inc_inference_timeouts(&self) {
        self.inner().inference_timeouts.inc();
    }

    pub fn inc_schema_mismatches(&self) {
        self.inner().schema_mismatches.inc();
    }

    pub fn inc_alert_transitions(&self, level: &str) {
        self.inner()
            .alert_transitions
            .with_label_values(&[level])
            .inc();
    }

    pub fn inc_tasks_opened(&self) {
        self.inner().maintenance_tasks_opened.inc();
    }

    pub fn observe_feature_latency(&self, duration_secs: f64) {
        self.inner().feature_latency_seconds.observe(duration_secs);
    }

    pub fn observe_inference_latency(&self, duration_secs: f64) {
        self.inner().inference_latency_seconds.observe(duration_secs);
    }

    pub fn inc_active_units(&self) {
        self.inner().active_units.inc();
    }

    pub fn dec_active_units(&self) {
        self.inner().active_units.dec();
    }

    pub fn set_model_loaded(&self, version: &str, family: &str, kind: &str) {
        self.inner()
            .model_info
            .with_label_values(&[version, family, kind])
            .set(1.0);
    }
}

/// Structured logger for pipeline events
///
/// Every event carries an `event` field so log pipelines can route on it.
#[derive(Clone)]
pub struct StructuredLogger {
    node_name: String,
}

impl StructuredLogger {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
        }
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn log_window_closed(&self, meta: &WindowMeta) {
        let samples: usize = meta.sample_counts.values().sum();
        let missing: usize = meta.missing_counts.values().sum();
        debug!(
            event = "window_closed",
            node = %self.node_name,
            asset = %meta.asset_id,
            window_start = meta.start,
            window_end = meta.end,
            samples = samples,
            missing = missing,
            "Window closed"
        );
    }

    /// Data-quality rejection of a whole window
    pub fn log_window_rejected(&self, err: &PipelineError) {
        warn!(
            event = "window_rejected",
            node = %self.node_name,
            class = %err.class(),
            error = %err,
            "Window skipped for data quality"
        );
    }

    pub fn log_prediction(&self, prediction: &Prediction) {
        info!(
            event = "prediction_generated",
            node = %self.node_name,
            asset = %prediction.asset,
            component = ?prediction.component.as_ref().map(|c| c.as_str()),
            kind = %prediction.kind,
            window_end = prediction.timestamp,
            value = prediction.value,
            confidence = prediction.confidence,
            model_version = %prediction.model_version,
            "Generated prediction"
        );
    }

    /// A window scope that produced no prediction this cycle
    pub fn log_window_unscored(
        &self,
        asset: &AssetId,
        scope: &str,
        window_end: Timestamp,
        err: &PipelineError,
    ) {
        warn!(
            event = "window_unscored",
            node = %self.node_name,
            asset = %asset,
            scope = %scope,
            window_end = window_end,
            class = %err.class(),
            error = %err,
            "Window left unscored"
        );
    }

    pub fn log_schema_mismatch(&self, err: &PipelineError) {
        error!(
            event = "schema_mismatch",
            node = %self.node_name,
            error = %err,
            "Inference halted until configuration is corrected"
        );
    }

    pub fn log_alert_transition(&self, transition: &AlertTransition) {
        let message = if transition.to > transition.from {
            "Alert escalated"
        } else {
            "Alert de-escalated"
        };
        info!(
            event = "alert_transition",
            node = %self.node_name,
            asset = %transition.asset,
            component = %transition.component,
            from = %transition.from,
            to = %transition.to,
            at = transition.at,
            trigger = %transition.trigger,
            value = transition.value,
            "{}",
            message
        );
    }

    pub fn log_task_change(&self, change: &TaskChange) {
        let task = change.task();
        let event = match change {
            TaskChange::Opened(_) => "maintenance_task_opened",
            TaskChange::Superseded(_) => "maintenance_task_superseded",
            TaskChange::Closed(_) => "maintenance_task_closed",
        };
        info!(
            event = event,
            node = %self.node_name,
            task_id = %task.id,
            asset = %task.asset,
            component = %task.component,
            severity = %task.severity,
            due_by = task.due_by,
            reason = %task.reason,
            "Maintenance task {}",
            task.status
        );
    }

    /// Reading behind the watermark; debug only
    pub fn log_late_reading(
        &self,
        asset: &AssetId,
        channel: &ChannelId,
        timestamp: Timestamp,
        watermark: Timestamp,
    ) {
        debug!(
            event = "late_reading_dropped",
            node = %self.node_name,
            asset = %asset,
            channel = %channel,
            timestamp = timestamp,
            watermark = watermark,
            "Dropped reading behind watermark"
        );
    }

    pub fn log_startup(&self, version: &str, models: &[&str]) {
        info!(
            event = "agent_started",
            node = %self.node_name,
            agent_version = %version,
            models = ?models,
            "Prognostics agent started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "agent_shutdown",
            node = %self.node_name,
            reason = %reason,
            "Prognostics agent shutting down"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_metrics_handles_share_registry() {
        let metrics = PipelineMetrics::new();
        let other = metrics.clone();
        metrics.inc_readings_ingested();
        other.inc_predictions("rul");
        other.inc_alert_transitions("warning");
        metrics.observe_inference_latency(0.002);
        metrics.set_model_loaded("rul-v1", "linear", "rul");

        let families = prometheus::gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "prognostics_predictions_total"));
    }

    #[test]
    fn test_structured_logger_creation() {
        let logger = StructuredLogger::new("test-node");
        assert_eq!(logger.node_name(), "test-node");
    }
}
