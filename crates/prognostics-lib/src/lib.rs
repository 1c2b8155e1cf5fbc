//! Fleet prognostics pipeline
//!
//! This crate provides the core functionality for:
//! - Watermark-driven windowing of irregular sensor streams
//! - Time-domain and spectral feature extraction
//! - RUL and anomaly scoring behind one scorer interface
//! - Hysteretic per-component alerting
//! - Health scoring and maintenance task lifecycle
//! - Query projections, record sink, probes and observability

pub mod alerting;
pub mod config;
pub mod error;
pub mod features;
pub mod fleet;
pub mod inference;
pub mod maintenance;
pub mod models;
pub mod observability;
pub mod probes;
pub mod projection;
pub mod sink;
pub mod unit;
pub mod window;

pub use config::PipelineConfig;
pub use error::{ErrorClass, PipelineError, PipelineResult};
pub use fleet::Fleet;
pub use inference::{InferenceAdapter, ModelRegistry};
pub use models::*;
pub use observability::{PipelineMetrics, StructuredLogger};
pub use probes::{HealthResponse, ProbeRegistry, ReadinessResponse, StageHealth, StageStatus};
pub use projection::{AssetHealth, FleetView};
pub use sink::{JsonLinesSink, MemorySink, PipelineRecord, RecordSink};
pub use unit::UnitContext;
