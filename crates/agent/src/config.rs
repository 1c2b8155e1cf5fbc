//! Agent configuration

use anyhow::{Context, Result};
use prognostics_lib::PipelineConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Process-level settings, read from `AGENT_*` environment variables
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Node name reported in logs
    #[serde(default = "default_node_name")]
    pub node_name: String,

    /// Port of the ingest, query, probe and metrics API
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Pipeline configuration file
    #[serde(default = "default_pipeline_config")]
    pub pipeline_config: PathBuf,

    /// Directory that relative model artifact paths resolve against
    #[serde(default = "default_model_dir")]
    pub model_dir: PathBuf,

    /// JSON-lines record stream; records stay in memory when unset
    #[serde(default)]
    pub records_path: Option<PathBuf>,
}

fn default_node_name() -> String {
    std::env::var("NODE_NAME").unwrap_or_else(|_| "unknown".to_string())
}

fn default_api_port() -> u16 {
    8080
}

fn default_pipeline_config() -> PathBuf {
    std::env::var("PROGNOSTICS_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config/prognostics.toml"))
}

fn default_model_dir() -> PathBuf {
    PathBuf::from("models")
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            node_name: default_node_name(),
            api_port: default_api_port(),
            pipeline_config: default_pipeline_config(),
            model_dir: default_model_dir(),
            records_path: None,
        }
    }
}

impl AgentConfig {
    /// Load configuration from the environment
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("AGENT").try_parsing(true))
            .build()?;

        config
            .try_deserialize()
            .context("Invalid AGENT_* environment configuration")
    }
}

/// Load and validate the pipeline configuration
///
/// `PROGNOSTICS__SECTION__KEY` environment variables override file values,
/// e.g. `PROGNOSTICS__INFERENCE__TIMEOUT_MS=500`.
pub fn load_pipeline(path: &Path) -> Result<PipelineConfig> {
    let settings = config::Config::builder()
        .add_source(config::File::from(path))
        .add_source(
            config::Environment::with_prefix("PROGNOSTICS")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .with_context(|| format!("Failed to read pipeline config {}", path.display()))?;

    let pipeline: PipelineConfig = settings
        .try_deserialize()
        .with_context(|| format!("Invalid pipeline config {}", path.display()))?;
    pipeline.validate()?;
    Ok(pipeline)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PIPELINE: &str = r#"
anomaly_model = "anom-v1"

[window]
length_ms = 60000
hop_ms = 30000
tolerance_ms = 5000

[[channels]]
name = "engine_temp"
sample_interval_ms = 1000

[[channels]]
name = "vibration_x"
sample_interval_ms = 100
kind = "vibration"

[[components]]
name = "engine"
policy = { kind = "rul", model = "rul-v1", warning_hours = 500.0, critical_hours = 100.0 }

[[models]]
version = "rul-v1"
family = "linear"
kind = "rul"
schema_version = "v1"
artifact = "rul-v1.json"

[[models]]
version = "anom-v1"
family = "linear"
kind = "anomaly"
schema_version = "v1"
artifact = "anom-v1.json"
score_range = [0.0, 1.0]
"#;

    #[test]
    fn test_load_pipeline_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prognostics.toml");
        std::fs::write(&path, PIPELINE).unwrap();

        let pipeline = load_pipeline(&path).unwrap();
        assert_eq!(pipeline.window.hop_ms, 30_000);
        assert_eq!(pipeline.channels.len(), 2);
        assert_eq!(pipeline.components[0].weight, 1.0);
        assert_eq!(pipeline.anomaly_model.as_deref(), Some("anom-v1"));
        assert_eq!(pipeline.models[1].score_range, Some([0.0, 1.0]));
    }

    #[test]
    fn test_invalid_pipeline_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prognostics.toml");
        std::fs::write(&path, PIPELINE.replace("hop_ms = 30000", "hop_ms = 90000")).unwrap();

        let err = load_pipeline(&path).unwrap_err();
        assert!(format!("{err:#}").contains("hop_ms"));
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(load_pipeline(Path::new("/nonexistent/prognostics.toml")).is_err());
    }

    #[test]
    fn test_shipped_config_and_models_load() {
        let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("../..");
        let pipeline = load_pipeline(&root.join("config/prognostics.toml")).unwrap();
        let registry =
            prognostics_lib::ModelRegistry::load(&pipeline.models, &root.join("models")).unwrap();
        assert_eq!(registry.versions(), vec!["anom-v1", "rul-v1"]);
        assert_eq!(
            prognostics_lib::features::FeatureSchema::from_config(&pipeline).len(),
            registry.get("rul-v1").unwrap().input_len()
        );
    }

    #[test]
    fn test_agent_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.api_port, 8080);
        assert_eq!(config.model_dir, PathBuf::from("models"));
        assert!(config.records_path.is_none());
    }
}
