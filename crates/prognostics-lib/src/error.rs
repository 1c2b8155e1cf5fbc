//! Pipeline error taxonomy
//!
//! Late data is deliberately absent here: readings past the tolerance are an
//! expected steady-state occurrence reported through
//! [`IngestOutcome::Late`](crate::window::IngestOutcome) and a counter.

use crate::models::{AssetId, Timestamp};

/// Coarse class of a pipeline failure, used for metrics and recovery policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Insufficient or gappy window data; skip the window
    DataQuality,
    /// Model and feature schema disagree; halt inference for the scope
    SchemaMismatch,
    /// Scoring exceeded its latency budget; window stays unscored
    InferenceTimeout,
    /// Scorer failed or produced unusable output
    Model,
    /// Invalid static configuration
    Config,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorClass::DataQuality => write!(f, "data_quality"),
            ErrorClass::SchemaMismatch => write!(f, "schema_mismatch"),
            ErrorClass::InferenceTimeout => write!(f, "inference_timeout"),
            ErrorClass::Model => write!(f, "model"),
            ErrorClass::Config => write!(f, "config"),
        }
    }
}

/// Errors raised by pipeline stages, attributed to asset/scope/window
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PipelineError {
    #[error("insufficient data for {asset}/{channel} in window ending {window_end}: {reason}")]
    InsufficientData {
        asset: AssetId,
        channel: String,
        window_end: Timestamp,
        reason: String,
    },

    #[error(
        "schema mismatch for {asset}/{scope}: model {model_version} expects schema {expected} \
         with {expected_len} features, got {actual} with {actual_len}"
    )]
    SchemaMismatch {
        asset: AssetId,
        scope: String,
        model_version: String,
        expected: String,
        expected_len: usize,
        actual: String,
        actual_len: usize,
    },

    #[error("inference for {asset}/{scope} in window ending {window_end} timed out after {timeout_ms}ms")]
    InferenceTimeout {
        asset: AssetId,
        scope: String,
        window_end: Timestamp,
        timeout_ms: u64,
    },

    #[error("model {model_version} failed for {asset}/{scope}: {message}")]
    Model {
        asset: AssetId,
        scope: String,
        model_version: String,
        message: String,
    },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl PipelineError {
    pub fn class(&self) -> ErrorClass {
        match self {
            PipelineError::InsufficientData { .. } => ErrorClass::DataQuality,
            PipelineError::SchemaMismatch { .. } => ErrorClass::SchemaMismatch,
            PipelineError::InferenceTimeout { .. } => ErrorClass::InferenceTimeout,
            PipelineError::Model { .. } => ErrorClass::Model,
            PipelineError::Config(_) => ErrorClass::Config,
        }
    }

    /// Whether the failure is expected to clear on its own
    pub fn is_transient(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::DataQuality | ErrorClass::InferenceTimeout
        )
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        let err = PipelineError::InferenceTimeout {
            asset: AssetId::from("truck-1"),
            scope: "brakes".to_string(),
            window_end: 60_000,
            timeout_ms: 250,
        };
        assert_eq!(err.class(), ErrorClass::InferenceTimeout);
        assert!(err.is_transient());
        assert!(err.to_string().contains("truck-1/brakes"));

        let err = PipelineError::Config("hop exceeds window".to_string());
        assert_eq!(err.class(), ErrorClass::Config);
        assert!(!err.is_transient());
    }
}
