//! Per-asset processing unit
//!
//! A unit exclusively owns one asset's window buffer, alert state and
//! maintenance aggregator. Each closed window runs extract, predict, alert
//! and aggregate strictly in order; its records are committed to the sink as
//! one batch and the asset's projection is republished only after the whole
//! window is done.

use crate::alerting::AlertStateMachine;
use crate::config::PipelineConfig;
use crate::error::{ErrorClass, PipelineError, PipelineResult};
use crate::features::FeatureExtractor;
use crate::inference::{InferenceAdapter, InferenceScope, ModelRegistry};
use crate::maintenance::{Aggregator, TaskChange};
use crate::models::{
    AlertTransition, AssetId, ComponentId, Prediction, PredictionKind, SensorReading, Timestamp,
    Window,
};
use crate::observability::{PipelineMetrics, StructuredLogger};
use crate::probes::{stages, ProbeRegistry};
use crate::projection::{ComponentView, FleetView, SnapshotUpdate};
use crate::sink::{PipelineRecord, RecordSink};
use crate::window::{IngestOutcome, WindowBuffer};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

/// Immutable collaborators shared by every unit
#[derive(Clone)]
pub struct UnitContext {
    pub config: Arc<PipelineConfig>,
    pub extractor: Arc<FeatureExtractor>,
    pub adapter: InferenceAdapter,
    pub sink: Arc<dyn RecordSink>,
    pub view: Arc<FleetView>,
    pub probes: ProbeRegistry,
    pub metrics: PipelineMetrics,
    pub logger: StructuredLogger,
}

impl UnitContext {
    pub fn new(
        config: PipelineConfig,
        registry: Arc<ModelRegistry>,
        sink: Arc<dyn RecordSink>,
        probes: ProbeRegistry,
        logger: StructuredLogger,
    ) -> Self {
        let extractor = Arc::new(FeatureExtractor::new(&config));
        let adapter = InferenceAdapter::new(&config, registry);
        let view = Arc::new(FleetView::new(config.projection.alert_feed_capacity));
        Self {
            config: Arc::new(config),
            extractor,
            adapter,
            sink,
            view,
            probes,
            metrics: PipelineMetrics::new(),
            logger,
        }
    }
}

/// How one closed window ended
#[derive(Debug, Clone, PartialEq)]
pub enum WindowOutcome {
    /// Features extracted; predictions may still be partially missing
    Processed,
    /// Skipped for data quality; no features, predictions or state change
    Rejected(PipelineError),
}

/// Summary of one processed window
#[derive(Debug, Clone)]
pub struct WindowReport {
    pub window_end: Timestamp,
    pub outcome: WindowOutcome,
    pub predictions: Vec<Prediction>,
    /// Scopes that produced no prediction this cycle, with the cause
    pub unscored: Vec<(InferenceScope, PipelineError)>,
    pub transitions: Vec<AlertTransition>,
    pub task_changes: Vec<TaskChange>,
}

impl WindowReport {
    fn new(window_end: Timestamp, outcome: WindowOutcome) -> Self {
        Self {
            window_end,
            outcome,
            predictions: Vec::new(),
            unscored: Vec::new(),
            transitions: Vec::new(),
            task_changes: Vec::new(),
        }
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self.outcome, WindowOutcome::Rejected(_))
    }
}

pub struct AssetUnit {
    asset: AssetId,
    ctx: UnitContext,
    buffer: WindowBuffer,
    alerts: AlertStateMachine,
    aggregator: Aggregator,
    /// Scopes stopped by a schema mismatch until the configuration changes
    halted: HashMap<InferenceScope, PipelineError>,
    sink_failing: bool,
}

impl AssetUnit {
    pub fn new(asset: AssetId, ctx: UnitContext) -> Self {
        let config = Arc::clone(&ctx.config);
        Self {
            buffer: WindowBuffer::from_config(&config),
            alerts: AlertStateMachine::new(asset.clone(), &config.components),
            aggregator: Aggregator::new(
                asset.clone(),
                &config.components,
                config.health.clone(),
                config.maintenance.clone(),
            ),
            halted: HashMap::new(),
            sink_failing: false,
            asset,
            ctx,
        }
    }

    pub fn asset(&self) -> &AssetId {
        &self.asset
    }

    pub fn alerts(&self) -> &AlertStateMachine {
        &self.alerts
    }

    pub fn aggregator(&self) -> &Aggregator {
        &self.aggregator
    }

    pub fn buffer(&self) -> &WindowBuffer {
        &self.buffer
    }

    pub fn halted_scopes(&self) -> Vec<&InferenceScope> {
        self.halted.keys().collect()
    }

    /// Buffer one reading and account for its outcome
    pub fn ingest(&mut self, reading: SensorReading) -> IngestOutcome {
        let channel = reading.channel.clone();
        let timestamp = reading.timestamp;
        let outcome = self.buffer.ingest(reading);
        let metrics = &self.ctx.metrics;
        match outcome {
            IngestOutcome::Accepted => metrics.inc_readings_ingested(),
            IngestOutcome::Duplicate => metrics.inc_duplicates(),
            IngestOutcome::Late { watermark } => {
                metrics.inc_late_dropped();
                self.ctx
                    .logger
                    .log_late_reading(&self.asset, &channel, timestamp, watermark);
            }
            IngestOutcome::UnknownChannel => {
                metrics.inc_unknown_channel();
                debug!(asset = %self.asset, channel = %channel, "Reading for undeclared channel dropped");
            }
            IngestOutcome::OutOfRange => {
                metrics.inc_out_of_range();
                warn!(
                    asset = %self.asset,
                    channel = %channel,
                    timestamp,
                    "Reading with out-of-range timestamp dropped"
                );
            }
        }
        outcome
    }

    fn next_closed_window(&mut self) -> Option<Window> {
        self.buffer.poll_closed_windows(&self.asset).next()
    }

    /// Process every window the watermark has closed
    pub async fn process_closed(&mut self) -> Vec<WindowReport> {
        let mut reports = Vec::new();
        while let Some(window) = self.next_closed_window() {
            reports.push(self.process_window(window).await);
        }
        reports
    }

    /// Run one closed window through the whole pipeline
    pub async fn process_window(&mut self, window: Window) -> WindowReport {
        let meta = window.meta();
        let missing = window.missing_channels().len() as u64;
        self.ctx.metrics.inc_windows_closed();
        if missing > 0 {
            self.ctx.metrics.add_missing_channels(missing);
        }
        self.ctx.logger.log_window_closed(&meta);

        let started = Instant::now();
        let extracted = self.ctx.extractor.extract(&window);
        self.ctx
            .metrics
            .observe_feature_latency(started.elapsed().as_secs_f64());

        let features = match extracted {
            Ok(features) => features,
            Err(err) => {
                self.ctx.metrics.inc_windows_rejected();
                self.ctx.logger.log_window_rejected(&err);
                self.commit(&[PipelineRecord::Window(meta)]).await;
                return WindowReport::new(window.end, WindowOutcome::Rejected(err));
            }
        };

        let mut report = WindowReport::new(window.end, WindowOutcome::Processed);
        let adapter = self.ctx.adapter.clone();

        for component in self.alerts.components_for(PredictionKind::Rul) {
            let scope = InferenceScope::Rul(component.clone());
            let evidence = if self.halted.contains_key(&scope) {
                None
            } else {
                let started = Instant::now();
                let result = adapter.predict_rul(&features, &component).await;
                self.settle(&scope, started, result, &mut report).await
            };
            if let Some(prediction) = &evidence {
                self.aggregator.record_rul(&component, prediction.value);
            }
            self.observe(&component, evidence.as_ref(), &mut report);
        }

        let anomaly_components = self.alerts.components_for(PredictionKind::Anomaly);
        if !anomaly_components.is_empty() {
            let scope = InferenceScope::Anomaly;
            let evidence = if self.halted.contains_key(&scope) {
                None
            } else {
                let started = Instant::now();
                let result = adapter.score_anomaly(&features).await;
                self.settle(&scope, started, result, &mut report).await
            };
            for component in &anomaly_components {
                self.observe(component, evidence.as_ref(), &mut report);
            }
        }

        report.task_changes = self.aggregator.drain_changes();
        for change in &report.task_changes {
            if matches!(change, TaskChange::Opened(_)) {
                self.ctx.metrics.inc_tasks_opened();
            }
            self.ctx.logger.log_task_change(change);
        }

        let mut batch = Vec::with_capacity(
            2 + report.predictions.len() + report.transitions.len() + report.task_changes.len(),
        );
        batch.push(PipelineRecord::Window(meta));
        batch.push(PipelineRecord::Features(features));
        batch.extend(report.predictions.iter().cloned().map(PipelineRecord::Prediction));
        batch.extend(
            report
                .transitions
                .iter()
                .cloned()
                .map(PipelineRecord::AlertTransition),
        );
        batch.extend(
            report
                .task_changes
                .iter()
                .map(|c| PipelineRecord::MaintenanceTask(c.task().clone())),
        );
        self.commit(&batch).await;
        self.publish(&report);
        report
    }

    /// Account for one scoring result; failures leave the scope unscored
    async fn settle(
        &mut self,
        scope: &InferenceScope,
        started: Instant,
        result: PipelineResult<Prediction>,
        report: &mut WindowReport,
    ) -> Option<Prediction> {
        self.ctx
            .metrics
            .observe_inference_latency(started.elapsed().as_secs_f64());

        match result {
            Ok(prediction) => {
                self.ctx.metrics.inc_predictions(&prediction.kind.to_string());
                self.ctx.logger.log_prediction(&prediction);
                report.predictions.push(prediction.clone());
                Some(prediction)
            }
            Err(err) => {
                self.ctx.metrics.inc_windows_unscored();
                match err.class() {
                    ErrorClass::SchemaMismatch => {
                        self.ctx.metrics.inc_schema_mismatches();
                        self.ctx.logger.log_schema_mismatch(&err);
                        self.ctx
                            .probes
                            .halt_inference(&self.asset, &scope.to_string())
                            .await;
                        self.halted.insert(scope.clone(), err.clone());
                    }
                    ErrorClass::InferenceTimeout => {
                        self.ctx.metrics.inc_inference_timeouts();
                        self.ctx.logger.log_window_unscored(
                            &self.asset,
                            &scope.to_string(),
                            report.window_end,
                            &err,
                        );
                    }
                    _ => {
                        self.ctx.logger.log_window_unscored(
                            &self.asset,
                            &scope.to_string(),
                            report.window_end,
                            &err,
                        );
                    }
                }
                report.unscored.push((scope.clone(), err));
                None
            }
        }
    }

    fn observe(
        &mut self,
        component: &ComponentId,
        evidence: Option<&Prediction>,
        report: &mut WindowReport,
    ) {
        if let Some(transition) = self.alerts.observe(component, evidence, &mut self.aggregator) {
            self.ctx.metrics.inc_alert_transitions(&transition.to.to_string());
            self.ctx.logger.log_alert_transition(&transition);
            report.transitions.push(transition);
        }
    }

    async fn commit(&mut self, batch: &[PipelineRecord]) {
        match self.ctx.sink.append(batch).await {
            Ok(()) => {
                if self.sink_failing {
                    self.sink_failing = false;
                    self.ctx.probes.set_healthy(stages::SINK).await;
                    info!(asset = %self.asset, "Record sink recovered");
                }
            }
            Err(e) => {
                error!(asset = %self.asset, records = batch.len(), error = %e, "Failed to commit record batch");
                if !self.sink_failing {
                    self.sink_failing = true;
                    self.ctx
                        .probes
                        .set_degraded(stages::SINK, format!("append failed: {e}"))
                        .await;
                }
            }
        }
    }

    fn publish(&self, report: &WindowReport) {
        let components = self
            .alerts
            .components()
            .map(|component| {
                let state = self.alerts.state(component);
                ComponentView {
                    component: component.clone(),
                    level: state.level,
                    entered_at: state.entered_at,
                    health: self.aggregator.health_of(component, state.level),
                    latest_rul_hours: self.aggregator.latest_rul(component),
                }
            })
            .collect();
        self.ctx.view.publish(
            &self.asset,
            SnapshotUpdate {
                health: self.aggregator.asset_health(&self.alerts),
                window_end: report.window_end,
                components,
                transitions: report.transitions.clone(),
                tasks: self.aggregator.tasks(),
            },
        );
    }

    /// Consume readings until the channel closes or shutdown is signalled
    ///
    /// Shutdown is honored between windows, never inside one.
    pub async fn run(
        mut self,
        mut readings: mpsc::Receiver<SensorReading>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        debug!(asset = %self.asset, "Asset unit started");
        'outer: loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => break,
                reading = readings.recv() => match reading {
                    Some(reading) => {
                        self.ingest(reading);
                    }
                    None => break,
                },
            }

            while let Some(window) = self.next_closed_window() {
                self.process_window(window).await;
                if !matches!(
                    shutdown.try_recv(),
                    Err(broadcast::error::TryRecvError::Empty)
                ) {
                    break 'outer;
                }
            }
        }
        debug!(asset = %self.asset, "Asset unit stopped");
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::tests::sample_config;
    use crate::inference::tests::Scripted;
    use crate::inference::ModelHandle;
    use crate::models::{AlertLevel, ChannelId, FeatureVector, Sample, TaskStatus};
    use crate::sink::MemorySink;
    use std::collections::BTreeMap;

    const LENGTH: Timestamp = 60_000;
    const WIDTH: usize = 21;

    /// Sample config with a 10 Hz vibration channel to keep windows small
    pub(crate) fn config() -> PipelineConfig {
        let mut config = sample_config();
        config.channels[1].sample_interval_ms = 100;
        config
    }

    /// Context whose models replay the scripted outputs
    pub(crate) fn scripted_context(
        config: PipelineConfig,
        rul: &[f64],
        anomaly: &[f64],
    ) -> (UnitContext, Arc<MemorySink>) {
        let mut registry = ModelRegistry::default();
        for (version, values) in [("rul-v1", rul), ("anom-v1", anomaly)] {
            let binding = config.model(version).cloned().unwrap();
            registry.insert(ModelHandle::new(binding, Arc::new(Scripted::new(WIDTH, values))));
        }
        let sink = Arc::new(MemorySink::new());
        let ctx = UnitContext::new(
            config,
            Arc::new(registry),
            sink.clone(),
            ProbeRegistry::new(),
            StructuredLogger::new("test-node"),
        );
        (ctx, sink)
    }

    fn unit_with(
        config: PipelineConfig,
        rul: &[f64],
        anomaly: &[f64],
    ) -> (AssetUnit, Arc<MemorySink>) {
        let (ctx, sink) = scripted_context(config, rul, anomaly);
        (AssetUnit::new(AssetId::from("truck-1"), ctx), sink)
    }

    /// Readings that fill the first window of `asset` and close it, in
    /// timestamp order so none falls behind the watermark
    pub(crate) fn first_window_readings(asset: &str) -> Vec<SensorReading> {
        let mut readings = Vec::with_capacity(661);
        for i in 0..600_i64 {
            let ts = i * 100;
            if i % 10 == 0 {
                let value = Some(80.0 + ((i / 10) % 7) as f64);
                readings.push(SensorReading::new(asset, "engine_temp", ts, value));
            }
            let value = Some((i as f64 * 0.7).sin());
            readings.push(SensorReading::new(asset, "vibration_x", ts, value));
        }
        readings.push(SensorReading::new(asset, "engine_temp", 66_000, Some(81.0)));
        readings
    }

    /// Window ending at `end` with `temp_present` of the 60 temperature samples
    fn window(end: Timestamp, temp_present: usize) -> Window {
        let start = end - LENGTH;
        let temp = (0..60)
            .map(|i| Sample {
                timestamp: start + i as i64 * 1_000,
                value: (i < temp_present).then(|| 80.0 + (i % 7) as f64),
            })
            .collect();
        let vib = (0..600)
            .map(|i| Sample {
                timestamp: start + i as i64 * 100,
                value: Some((i as f64 * 0.7).sin()),
            })
            .collect();
        let mut channels = BTreeMap::new();
        channels.insert(ChannelId::from("engine_temp"), temp);
        channels.insert(ChannelId::from("vibration_x"), vib);
        Window {
            asset: AssetId::from("truck-1"),
            start,
            end,
            channels,
        }
    }

    #[tokio::test]
    async fn test_rul_breach_raises_warning_and_task() {
        let (mut unit, sink) = unit_with(config(), &[600.0, 480.0], &[0.1]);
        let engine = ComponentId::from("engine");

        let first = unit.process_window(window(LENGTH, 60)).await;
        assert_eq!(first.outcome, WindowOutcome::Processed);
        assert_eq!(first.predictions.len(), 2);
        assert!(first.transitions.is_empty());
        assert_eq!(sink.len(), 4);

        let second = unit.process_window(window(2 * LENGTH, 60)).await;
        assert_eq!(second.transitions.len(), 1);
        assert_eq!(second.transitions[0].component, engine);
        assert_eq!(second.transitions[0].to, AlertLevel::Warning);
        assert_eq!(second.task_changes.len(), 1);
        assert!(matches!(second.task_changes[0], TaskChange::Opened(_)));
        assert_eq!(unit.alerts().level(&engine), AlertLevel::Warning);

        // window, features, two predictions, transition, task
        let records = sink.records();
        assert_eq!(records.len(), 10);
        let kinds: Vec<_> = records[4..].iter().map(|r| r.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                "window",
                "features",
                "prediction",
                "prediction",
                "alert_transition",
                "maintenance_task"
            ]
        );
        assert!(records.iter().all(|r| r.asset_id().as_str() == "truck-1"));

        let health = unit.ctx.view.current_health(unit.asset()).unwrap();
        assert_eq!(health.as_of, 2 * LENGTH);
        assert_eq!(health.open_tasks, 1);
        assert!(health.health < 1.0);
        let view = health
            .components
            .iter()
            .find(|c| c.component == engine)
            .unwrap();
        assert_eq!(view.level, AlertLevel::Warning);
        assert_eq!(view.latest_rul_hours, Some(480.0));

        let open = unit
            .ctx
            .view
            .maintenance_tasks(Some(unit.asset()), Some(TaskStatus::Open));
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].component, engine);
    }

    #[tokio::test]
    async fn test_sparse_window_is_rejected_without_state_change() {
        let (mut unit, sink) = unit_with(config(), &[50.0], &[0.95]);

        // 24 of 60 temperature samples is below the 50% floor
        let report = unit.process_window(window(LENGTH, 24)).await;
        assert!(report.is_rejected());
        match &report.outcome {
            WindowOutcome::Rejected(err) => assert_eq!(err.class(), ErrorClass::DataQuality),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(report.predictions.is_empty());
        assert!(report.transitions.is_empty());
        for component in unit.alerts().components() {
            assert_eq!(unit.alerts().level(component), AlertLevel::Normal);
        }

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind(), "window");
        assert!(unit.ctx.view.current_health(unit.asset()).is_none());
    }

    #[tokio::test]
    async fn test_schema_mismatch_halts_only_that_scope() {
        let mut config = config();
        config.models[0].schema_version = "v2".to_string();
        let (mut unit, _sink) = unit_with(config, &[50.0], &[0.1]);
        let scope = InferenceScope::Rul(ComponentId::from("engine"));

        let first = unit.process_window(window(LENGTH, 60)).await;
        assert_eq!(first.unscored.len(), 1);
        assert_eq!(first.unscored[0].0, scope);
        assert_eq!(first.unscored[0].1.class(), ErrorClass::SchemaMismatch);
        assert_eq!(unit.halted_scopes(), vec![&scope]);
        assert_eq!(unit.ctx.probes.halted().await, vec!["truck-1/engine".to_string()]);

        // halted scope is skipped; anomaly scoring carries on
        let second = unit.process_window(window(2 * LENGTH, 60)).await;
        assert!(second.unscored.is_empty());
        assert_eq!(second.predictions.len(), 1);
        assert_eq!(second.predictions[0].kind, PredictionKind::Anomaly);
        assert_eq!(
            unit.alerts().level(&ComponentId::from("engine")),
            AlertLevel::Normal
        );
    }

    #[tokio::test]
    async fn test_unscored_window_keeps_debounce_streak() {
        let (mut unit, _sink) = unit_with(config(), &[900.0], &[0.8, 0.8, f64::NAN, 0.8]);
        let drivetrain = ComponentId::from("drivetrain");

        for i in 1..=2 {
            let report = unit.process_window(window(i * LENGTH, 60)).await;
            assert!(report.transitions.is_empty());
        }

        let third = unit.process_window(window(3 * LENGTH, 60)).await;
        assert_eq!(third.unscored.len(), 1);
        assert_eq!(third.unscored[0].1.class(), ErrorClass::Model);
        assert!(third.transitions.is_empty());
        assert!(unit.halted_scopes().is_empty());

        let fourth = unit.process_window(window(4 * LENGTH, 60)).await;
        assert_eq!(fourth.transitions.len(), 1);
        assert_eq!(fourth.transitions[0].component, drivetrain);
        assert_eq!(fourth.transitions[0].to, AlertLevel::Warning);
    }

    #[tokio::test]
    async fn test_readings_drive_windows_through_ingest() {
        let (mut unit, sink) = unit_with(config(), &[600.0], &[0.1]);
        let mut readings = first_window_readings("truck-1");
        let closing = readings.pop().unwrap();

        for reading in readings {
            assert_eq!(unit.ingest(reading), IngestOutcome::Accepted);
        }
        assert!(unit.process_closed().await.is_empty());

        // advances the watermark past the first window's end
        unit.ingest(closing);
        let reports = unit.process_closed().await;
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].window_end, LENGTH);
        assert_eq!(reports[0].outcome, WindowOutcome::Processed);
        assert_eq!(sink.len(), 4);

        let late = unit.ingest(SensorReading::new("truck-1", "engine_temp", 1_000, Some(80.0)));
        assert!(matches!(late, IngestOutcome::Late { .. }));
    }

    fn feature_records(sink: &MemorySink) -> Vec<FeatureVector> {
        sink.records()
            .into_iter()
            .filter_map(|record| match record {
                PipelineRecord::Features(features) => Some(features),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_reingested_readings_leave_features_unchanged() {
        let (mut once, once_sink) = unit_with(config(), &[600.0], &[0.1]);
        for reading in first_window_readings("truck-1") {
            assert_eq!(once.ingest(reading), IngestOutcome::Accepted);
        }
        assert_eq!(once.process_closed().await.len(), 1);

        let (mut twice, twice_sink) = unit_with(config(), &[600.0], &[0.1]);
        let mut readings = first_window_readings("truck-1");
        let closing = readings.pop().unwrap();
        for reading in readings {
            let mut replay = reading.clone();
            assert_eq!(twice.ingest(reading), IngestOutcome::Accepted);
            assert_eq!(twice.ingest(replay.clone()), IngestOutcome::Duplicate);
            // a resend with a different value still loses to the first write
            replay.value = replay.value.map(|v| v + 100.0);
            assert_eq!(twice.ingest(replay), IngestOutcome::Duplicate);
        }
        twice.ingest(closing);
        assert_eq!(twice.process_closed().await.len(), 1);

        let expected = feature_records(&once_sink);
        assert_eq!(expected.len(), 1);
        assert_eq!(feature_records(&twice_sink), expected);
        assert_eq!(twice.buffer().counters(twice.asset()).unwrap().duplicates, 1_320);
    }
}
