//! Model inference
//!
//! Loaded models are immutable, versioned scoring handles shared by every
//! asset unit. The adapter checks the feature schema against the bound
//! model, scores on the blocking pool under a latency budget and turns raw
//! model output into typed predictions with normalized confidence.
//!
//! A timed-out call keeps its blocking thread until the model returns, so
//! each model version holds a bounded number of permits; a call releases its
//! permit only when it actually finishes.

mod linear;
mod onnx;
mod tree;

pub use linear::{LinearModel, Link};
pub use onnx::OnnxScorer;
pub use tree::{Node, Tree, TreeEnsemble};

use crate::config::{AlertPolicy, ModelBinding, ModelFamily, PipelineConfig};
use crate::error::{PipelineError, PipelineResult};
use crate::models::{ComponentId, FeatureVector, Prediction, PredictionKind};
use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// Spread (hours) at which RUL confidence falls to one half, when unbound
pub const DEFAULT_RUL_SCALE_HOURS: f64 = 100.0;

/// Confidence reported when a model exposes no uncertainty
pub const UNKNOWN_CONFIDENCE: f64 = 0.5;

/// Number of attempts per window before it is left unscored
const MAX_ATTEMPTS: u32 = 2;

/// Raw output of one scoring call
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelOutput {
    pub value: f64,
    /// Standard deviation of the estimate, if the model family reports one
    pub spread: Option<f64>,
}

/// Polymorphic scoring capability implemented once per model family
///
/// Scoring must be pure: the same input always yields the same output.
pub trait Scorer: Send + Sync {
    /// Number of features the model consumes
    fn input_len(&self) -> usize;

    fn predict(&self, features: &[f64]) -> Result<ModelOutput>;
}

/// A loaded model version with its binding metadata
#[derive(Clone)]
pub struct ModelHandle {
    binding: Arc<ModelBinding>,
    scorer: Arc<dyn Scorer>,
}

impl ModelHandle {
    pub fn new(binding: ModelBinding, scorer: Arc<dyn Scorer>) -> Self {
        Self {
            binding: Arc::new(binding),
            scorer,
        }
    }

    /// Read and build the artifact of a binding, verifying its checksum
    pub fn load(binding: &ModelBinding, base_dir: &Path) -> Result<Self> {
        let path = if binding.artifact.is_absolute() {
            binding.artifact.clone()
        } else {
            base_dir.join(&binding.artifact)
        };
        let bytes = std::fs::read(&path)
            .with_context(|| format!("Failed to read model artifact {}", path.display()))?;

        if let Some(expected) = &binding.sha256 {
            let actual = compute_checksum(&bytes);
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(PipelineError::Config(format!(
                    "checksum mismatch for model '{}': expected {}, got {}",
                    binding.version, expected, actual
                ))
                .into());
            }
        }

        let scorer: Arc<dyn Scorer> = match binding.family {
            ModelFamily::Linear => Arc::new(LinearModel::from_json(&bytes)?),
            ModelFamily::TreeEnsemble => Arc::new(TreeEnsemble::from_json(&bytes)?),
            ModelFamily::Onnx => {
                let input_len = binding.input_len.ok_or_else(|| {
                    PipelineError::Config(format!("onnx model '{}' requires input_len", binding.version))
                })?;
                Arc::new(OnnxScorer::from_bytes(&bytes, input_len)?)
            }
        };

        if let Some(declared) = binding.input_len {
            if declared != scorer.input_len() {
                return Err(PipelineError::Config(format!(
                    "model '{}' declares input_len {} but the artifact takes {}",
                    binding.version,
                    declared,
                    scorer.input_len()
                ))
                .into());
            }
        }

        Ok(Self::new(binding.clone(), scorer))
    }

    pub fn binding(&self) -> &ModelBinding {
        &self.binding
    }

    pub fn version(&self) -> &str {
        &self.binding.version
    }

    pub fn input_len(&self) -> usize {
        self.scorer.input_len()
    }

    /// Map raw output to a `(value, confidence)` pair for this model's kind
    pub fn calibrate(&self, output: ModelOutput) -> (f64, f64) {
        match self.binding.kind {
            PredictionKind::Rul => {
                let value = output.value.max(0.0);
                let scale = self
                    .binding
                    .rul_scale_hours
                    .unwrap_or(DEFAULT_RUL_SCALE_HOURS);
                let confidence = match output.spread {
                    Some(spread) => 1.0 / (1.0 + spread.abs() / scale),
                    None => UNKNOWN_CONFIDENCE,
                };
                (value, confidence)
            }
            PredictionKind::Anomaly => {
                let [low, high] = self.binding.score_range.unwrap_or([0.0, 1.0]);
                let value = output.value.clamp(low, high);
                let threshold = self
                    .binding
                    .decision_threshold
                    .unwrap_or((low + high) / 2.0)
                    .clamp(low, high);
                let side = if value >= threshold {
                    high - threshold
                } else {
                    threshold - low
                };
                let confidence = if side > 0.0 {
                    ((value - threshold).abs() / side).clamp(0.0, 1.0)
                } else {
                    1.0
                };
                (value, confidence)
            }
        }
    }
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandle")
            .field("version", &self.binding.version)
            .field("family", &self.binding.family)
            .field("kind", &self.binding.kind)
            .finish()
    }
}

/// Hex SHA-256 of an artifact
pub fn compute_checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Read-only set of loaded model versions
#[derive(Debug, Default, Clone)]
pub struct ModelRegistry {
    models: HashMap<String, ModelHandle>,
}

impl ModelRegistry {
    /// Load every bound model; relative artifact paths resolve against `base_dir`
    pub fn load(bindings: &[ModelBinding], base_dir: &Path) -> Result<Self> {
        let mut registry = Self::default();
        for binding in bindings {
            let handle = ModelHandle::load(binding, base_dir)
                .with_context(|| format!("Failed to load model '{}'", binding.version))?;
            info!(
                model_version = %binding.version,
                family = %binding.family,
                kind = %binding.kind,
                input_len = handle.input_len(),
                "Model loaded"
            );
            registry.insert(handle);
        }
        Ok(registry)
    }

    pub fn insert(&mut self, handle: ModelHandle) {
        self.models.insert(handle.version().to_string(), handle);
    }

    pub fn get(&self, version: &str) -> Option<&ModelHandle> {
        self.models.get(version)
    }

    pub fn versions(&self) -> Vec<&str> {
        let mut versions: Vec<&str> = self.models.keys().map(String::as_str).collect();
        versions.sort_unstable();
        versions
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

/// Scope an inference call is attributed to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum InferenceScope {
    Rul(ComponentId),
    Anomaly,
}

impl std::fmt::Display for InferenceScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InferenceScope::Rul(component) => write!(f, "{component}"),
            InferenceScope::Anomaly => write!(f, "anomaly"),
        }
    }
}

/// Invokes bound models against feature vectors
#[derive(Debug, Clone)]
pub struct InferenceAdapter {
    registry: Arc<ModelRegistry>,
    rul_models: HashMap<ComponentId, String>,
    anomaly_model: Option<String>,
    timeout: Duration,
    /// Scoring permits per model version
    permits: HashMap<String, Arc<Semaphore>>,
}

impl InferenceAdapter {
    pub fn new(config: &PipelineConfig, registry: Arc<ModelRegistry>) -> Self {
        let rul_models = config
            .components
            .iter()
            .filter_map(|c| match &c.policy {
                AlertPolicy::Rul(p) => Some((c.name.clone(), p.model.clone())),
                AlertPolicy::Anomaly(_) => None,
            })
            .collect();
        let cap = config.inference.max_concurrent_calls.max(1);
        let permits = registry
            .versions()
            .into_iter()
            .map(|version| (version.to_string(), Arc::new(Semaphore::new(cap))))
            .collect();
        Self {
            registry,
            rul_models,
            anomaly_model: config.anomaly_model.clone(),
            timeout: Duration::from_millis(config.inference.timeout_ms),
            permits,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Scoring calls that may still start for a model version right now
    pub fn available_calls(&self, version: &str) -> Option<usize> {
        self.permits.get(version).map(|p| p.available_permits())
    }

    /// Estimate remaining useful life (hours) of one component
    pub async fn predict_rul(
        &self,
        features: &FeatureVector,
        component: &ComponentId,
    ) -> PipelineResult<Prediction> {
        let scope = InferenceScope::Rul(component.clone());
        let version = self.rul_models.get(component).ok_or_else(|| {
            PipelineError::Config(format!("component '{component}' has no RUL model binding"))
        })?;
        let handle = self.handle(version)?;
        let (value, confidence) = self.invoke(handle, features, &scope).await?;
        Ok(Prediction {
            asset: features.asset.clone(),
            component: Some(component.clone()),
            timestamp: features.window_end,
            kind: PredictionKind::Rul,
            value,
            confidence,
            model_version: handle.version().to_string(),
        })
    }

    /// Asset-wide anomaly score
    pub async fn score_anomaly(&self, features: &FeatureVector) -> PipelineResult<Prediction> {
        let version = self
            .anomaly_model
            .as_deref()
            .ok_or_else(|| PipelineError::Config("no anomaly model bound".to_string()))?;
        let handle = self.handle(version)?;
        let (value, confidence) = self
            .invoke(handle, features, &InferenceScope::Anomaly)
            .await?;
        Ok(Prediction {
            asset: features.asset.clone(),
            component: None,
            timestamp: features.window_end,
            kind: PredictionKind::Anomaly,
            value,
            confidence,
            model_version: handle.version().to_string(),
        })
    }

    fn handle(&self, version: &str) -> PipelineResult<&ModelHandle> {
        self.registry
            .get(version)
            .ok_or_else(|| PipelineError::Config(format!("model '{version}' is not loaded")))
    }

    /// Reject vectors whose schema the model was not trained on
    pub fn check_schema(
        &self,
        handle: &ModelHandle,
        features: &FeatureVector,
        scope: &InferenceScope,
    ) -> PipelineResult<()> {
        let binding = handle.binding();
        if binding.schema_version != features.schema_version
            || handle.input_len() != features.len()
        {
            return Err(PipelineError::SchemaMismatch {
                asset: features.asset.clone(),
                scope: scope.to_string(),
                model_version: binding.version.clone(),
                expected: binding.schema_version.clone(),
                expected_len: handle.input_len(),
                actual: features.schema_version.clone(),
                actual_len: features.len(),
            });
        }
        Ok(())
    }

    async fn invoke(
        &self,
        handle: &ModelHandle,
        features: &FeatureVector,
        scope: &InferenceScope,
    ) -> PipelineResult<(f64, f64)> {
        self.check_schema(handle, features, scope)?;
        let values: Arc<[f64]> = features.values.as_slice().into();
        let permits = self
            .permits
            .get(handle.version())
            .cloned()
            .ok_or_else(|| {
                self.model_error(handle, features, scope, "model has no scoring permits")
            })?;

        for attempt in 1..=MAX_ATTEMPTS {
            let scorer = Arc::clone(&handle.scorer);
            let input = Arc::clone(&values);
            let permits = Arc::clone(&permits);
            // waiting for a permit counts against the attempt's timeout
            let call = async move {
                let permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|e| anyhow::anyhow!("scoring permits closed: {e}"))?;
                let output: Result<ModelOutput> = tokio::task::spawn_blocking(move || {
                    let _permit = permit;
                    scorer.predict(&input)
                })
                .await
                .map_err(|e| anyhow::anyhow!("scoring task failed: {e}"))?;
                output
            };

            match tokio::time::timeout(self.timeout, call).await {
                Ok(Ok(output)) => {
                    if !output.value.is_finite() {
                        return Err(self.model_error(handle, features, scope, "non-finite output"));
                    }
                    let calibrated = handle.calibrate(output);
                    debug!(
                        asset = %features.asset,
                        scope = %scope,
                        model_version = %handle.version(),
                        value = calibrated.0,
                        confidence = calibrated.1,
                        attempt,
                        "Model scored window"
                    );
                    return Ok(calibrated);
                }
                Ok(Err(e)) => {
                    return Err(self.model_error(handle, features, scope, &format!("{e:#}")));
                }
                Err(_) => {
                    warn!(
                        asset = %features.asset,
                        scope = %scope,
                        window_end = features.window_end,
                        attempt,
                        timeout_ms = self.timeout.as_millis() as u64,
                        "Inference attempt timed out"
                    );
                }
            }
        }

        Err(PipelineError::InferenceTimeout {
            asset: features.asset.clone(),
            scope: scope.to_string(),
            window_end: features.window_end,
            timeout_ms: self.timeout.as_millis() as u64,
        })
    }

    fn model_error(
        &self,
        handle: &ModelHandle,
        features: &FeatureVector,
        scope: &InferenceScope,
        message: &str,
    ) -> PipelineError {
        PipelineError::Model {
            asset: features.asset.clone(),
            scope: scope.to_string(),
            model_version: handle.version().to_string(),
            message: message.to_string(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::tests::sample_config;
    use crate::models::AssetId;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scorer returning a scripted sequence of values, repeating the last
    pub(crate) struct Scripted {
        pub values: std::sync::Mutex<Vec<f64>>,
        pub width: usize,
    }

    impl Scripted {
        pub(crate) fn new(width: usize, values: &[f64]) -> Self {
            let mut values = values.to_vec();
            values.reverse();
            Self {
                values: std::sync::Mutex::new(values),
                width,
            }
        }
    }

    impl Scorer for Scripted {
        fn input_len(&self) -> usize {
            self.width
        }

        fn predict(&self, _features: &[f64]) -> Result<ModelOutput> {
            let mut values = self.values.lock().map_err(|e| anyhow::anyhow!("{e}"))?;
            let value = if values.len() > 1 {
                values.pop().unwrap_or_default()
            } else {
                values.last().copied().unwrap_or_default()
            };
            Ok(ModelOutput {
                value,
                spread: None,
            })
        }
    }

    struct Slow {
        calls: Arc<AtomicUsize>,
        in_flight: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
        delay: Duration,
    }

    impl Slow {
        fn new(delay: Duration) -> Self {
            Self {
                calls: Arc::default(),
                in_flight: Arc::default(),
                peak: Arc::default(),
                delay,
            }
        }
    }

    impl Scorer for Slow {
        fn input_len(&self) -> usize {
            2
        }

        fn predict(&self, _features: &[f64]) -> Result<ModelOutput> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(ModelOutput {
                value: 1.0,
                spread: None,
            })
        }
    }

    fn vector(schema: &str, values: Vec<f64>) -> FeatureVector {
        let names: Vec<String> = (0..values.len()).map(|i| format!("f{i}")).collect();
        FeatureVector {
            asset: AssetId::from("truck-1"),
            window_end: 60_000,
            schema_version: schema.to_string(),
            names: names.into(),
            values,
        }
    }

    fn adapter_with(handles: Vec<ModelHandle>, timeout_ms: u64) -> InferenceAdapter {
        capped_adapter(handles, timeout_ms, 16)
    }

    fn capped_adapter(handles: Vec<ModelHandle>, timeout_ms: u64, cap: usize) -> InferenceAdapter {
        let mut config = sample_config();
        config.inference.timeout_ms = timeout_ms;
        config.inference.max_concurrent_calls = cap;
        let mut registry = ModelRegistry::default();
        for handle in handles {
            registry.insert(handle);
        }
        InferenceAdapter::new(&config, Arc::new(registry))
    }

    fn binding(version: &str) -> ModelBinding {
        sample_config()
            .model(version)
            .cloned()
            .unwrap_or_else(|| panic!("{version} not in sample config"))
    }

    #[tokio::test]
    async fn test_predict_rul_with_linear_model() {
        let model = LinearModel {
            weights: vec![-10.0, 0.0],
            bias: 900.0,
            link: Link::Identity,
            residual_std: Some(100.0),
        };
        let adapter = adapter_with(vec![ModelHandle::new(binding("rul-v1"), Arc::new(model))], 250);

        let prediction = adapter
            .predict_rul(&vector("v1", vec![30.0, 1.0]), &ComponentId::from("engine"))
            .await
            .unwrap();
        assert_eq!(prediction.kind, PredictionKind::Rul);
        assert_eq!(prediction.value, 600.0);
        assert_eq!(prediction.confidence, 0.5);
        assert_eq!(prediction.timestamp, 60_000);
        assert_eq!(prediction.model_version, "rul-v1");
        assert_eq!(prediction.component, Some(ComponentId::from("engine")));
    }

    #[tokio::test]
    async fn test_negative_rul_is_floored() {
        let model = Scripted::new(2, &[-12.0]);
        let adapter = adapter_with(vec![ModelHandle::new(binding("rul-v1"), Arc::new(model))], 250);
        let prediction = adapter
            .predict_rul(&vector("v1", vec![0.0, 0.0]), &ComponentId::from("engine"))
            .await
            .unwrap();
        assert_eq!(prediction.value, 0.0);
    }

    #[tokio::test]
    async fn test_anomaly_confidence_is_threshold_margin() {
        let model = Scripted::new(2, &[0.85, 0.7, 0.35, 3.0]);
        let adapter = adapter_with(vec![ModelHandle::new(binding("anom-v1"), Arc::new(model))], 250);
        let fv = vector("v1", vec![0.0, 0.0]);

        let expected = [(0.85, 0.5), (0.7, 0.0), (0.35, 0.5), (1.0, 1.0)];
        for (value, confidence) in expected {
            let p = adapter.score_anomaly(&fv).await.unwrap();
            assert_eq!(p.kind, PredictionKind::Anomaly);
            assert!(p.component.is_none());
            assert!((p.value - value).abs() < 1e-12);
            assert!((p.confidence - confidence).abs() < 1e-9, "{} vs {}", p.confidence, confidence);
        }
    }

    #[tokio::test]
    async fn test_schema_version_mismatch_is_hard_failure() {
        let model = Scripted::new(2, &[100.0]);
        let adapter = adapter_with(vec![ModelHandle::new(binding("rul-v1"), Arc::new(model))], 250);

        let err = adapter
            .predict_rul(&vector("v2", vec![0.0, 0.0]), &ComponentId::from("engine"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::SchemaMismatch { ref expected, ref actual, .. } if expected == "v1" && actual == "v2"
        ));

        let err = adapter
            .predict_rul(&vector("v1", vec![0.0; 3]), &ComponentId::from("engine"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::SchemaMismatch { expected_len: 2, actual_len: 3, .. }
        ));
    }

    #[tokio::test]
    async fn test_timeout_retries_once() {
        let slow = Slow::new(Duration::from_millis(200));
        let calls = Arc::clone(&slow.calls);
        let adapter = adapter_with(vec![ModelHandle::new(binding("rul-v1"), Arc::new(slow))], 20);

        let err = adapter
            .predict_rul(&vector("v1", vec![0.0, 0.0]), &ComponentId::from("engine"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::InferenceTimeout { timeout_ms: 20, .. }));
        assert!(err.is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_hung_model_holds_at_most_cap_calls() {
        let slow = Slow::new(Duration::from_millis(500));
        let (calls, peak) = (Arc::clone(&slow.calls), Arc::clone(&slow.peak));
        let adapter = capped_adapter(
            vec![ModelHandle::new(binding("rul-v1"), Arc::new(slow))],
            20,
            2,
        );
        assert_eq!(adapter.available_calls("rul-v1"), Some(2));

        // four windows, two attempts each, against a model that hangs
        let mut pending = Vec::new();
        for _ in 0..4 {
            let adapter = adapter.clone();
            pending.push(tokio::spawn(async move {
                adapter
                    .predict_rul(&vector("v1", vec![0.0, 0.0]), &ComponentId::from("engine"))
                    .await
            }));
        }
        for task in pending {
            let err = task.await.unwrap().unwrap_err();
            assert!(matches!(err, PipelineError::InferenceTimeout { .. }));
        }
        assert_eq!(adapter.available_calls("rul-v1"), Some(0));

        // permits come back once the hung calls return
        tokio::time::sleep(Duration::from_millis(800)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(adapter.available_calls("rul-v1"), Some(2));
    }

    #[tokio::test]
    async fn test_non_finite_output_is_model_error() {
        let model = Scripted::new(2, &[f64::NAN]);
        let adapter = adapter_with(vec![ModelHandle::new(binding("anom-v1"), Arc::new(model))], 250);
        let err = adapter.score_anomaly(&vector("v1", vec![0.0, 0.0])).await.unwrap_err();
        assert_eq!(err.class(), crate::error::ErrorClass::Model);
    }

    #[test]
    fn test_rul_confidence_from_spread() {
        let handle = ModelHandle::new(binding("rul-v1"), Arc::new(Scripted::new(1, &[0.0])));
        let (value, confidence) = handle.calibrate(ModelOutput {
            value: 300.0,
            spread: Some(DEFAULT_RUL_SCALE_HOURS),
        });
        assert_eq!(value, 300.0);
        assert!((confidence - 0.5).abs() < 1e-12);
        let (_, tight) = handle.calibrate(ModelOutput {
            value: 300.0,
            spread: Some(1.0),
        });
        assert!(tight > 0.99);
    }

    #[test]
    fn test_registry_load_verifies_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = br#"{"weights":[1.0,2.0],"bias":3.0}"#;
        std::fs::write(dir.path().join("rul.json"), artifact).unwrap();

        let mut good = binding("rul-v1");
        good.artifact = "rul.json".into();
        good.sha256 = Some(compute_checksum(artifact));
        let registry = ModelRegistry::load(&[good.clone()], dir.path()).unwrap();
        assert_eq!(registry.versions(), vec!["rul-v1"]);
        assert_eq!(registry.get("rul-v1").unwrap().input_len(), 2);

        let mut bad = good;
        bad.sha256 = Some("00".repeat(32));
        let err = ModelRegistry::load(&[bad], dir.path()).unwrap_err();
        assert!(format!("{err:#}").contains("checksum mismatch"));
    }

    #[test]
    fn test_registry_load_missing_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let mut binding = binding("anom-v1");
        binding.artifact = "missing.json".into();
        assert!(ModelRegistry::load(&[binding], dir.path()).is_err());
    }

    #[test]
    fn test_checksum_is_hex_sha256() {
        let checksum = compute_checksum(b"model");
        assert_eq!(checksum.len(), 64);
        assert_eq!(checksum, compute_checksum(b"model"));
        assert_ne!(checksum, compute_checksum(b"other"));
    }
}
