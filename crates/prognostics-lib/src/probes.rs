//! Liveness and readiness of the pipeline stages
//!
//! Tracks the `ingest`, `inference` and `sink` stages. Inference halts caused
//! by schema mismatches are recorded per (asset, scope) and keep the
//! inference stage degraded while any remain.

use crate::models::AssetId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Healthy,
    /// Working, but part of the fleet is not being scored or persisted
    Degraded,
    Unhealthy,
}

impl StageStatus {
    pub fn is_operational(&self) -> bool {
        matches!(self, StageStatus::Healthy | StageStatus::Degraded)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageHealth {
    pub status: StageStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_check_timestamp: i64,
}

impl StageHealth {
    fn with(status: StageStatus, message: Option<String>) -> Self {
        Self {
            status,
            message,
            last_check_timestamp: chrono::Utc::now().timestamp(),
        }
    }

    pub fn healthy() -> Self {
        Self::with(StageStatus::Healthy, None)
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self::with(StageStatus::Degraded, Some(message.into()))
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self::with(StageStatus::Unhealthy, Some(message.into()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: StageStatus,
    pub stages: BTreeMap<String, StageHealth>,
    /// `asset/scope` pairs whose inference is halted
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub halted: Vec<String>,
}

impl HealthResponse {
    /// Worst status across stages
    pub fn compute_status(stages: &BTreeMap<String, StageHealth>) -> StageStatus {
        stages
            .values()
            .map(|s| s.status)
            .max_by_key(|s| match s {
                StageStatus::Healthy => 0,
                StageStatus::Degraded => 1,
                StageStatus::Unhealthy => 2,
            })
            .unwrap_or(StageStatus::Healthy)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Stage names
pub mod stages {
    pub const INGEST: &str = "ingest";
    pub const INFERENCE: &str = "inference";
    pub const SINK: &str = "sink";

    pub const ALL: [&str; 3] = [INGEST, INFERENCE, SINK];
}

#[derive(Debug, Default)]
struct ProbeState {
    stages: BTreeMap<String, StageHealth>,
    halted: BTreeSet<(AssetId, String)>,
    ready: bool,
}

/// Shared registry of stage health, cheap to clone
#[derive(Debug, Clone, Default)]
pub struct ProbeRegistry {
    state: Arc<RwLock<ProbeState>>,
}

impl ProbeRegistry {
    /// Registry with every stage healthy and readiness unset
    pub fn new() -> Self {
        let state = ProbeState {
            stages: stages::ALL
                .iter()
                .map(|s| (s.to_string(), StageHealth::healthy()))
                .collect(),
            ..ProbeState::default()
        };
        Self {
            state: Arc::new(RwLock::new(state)),
        }
    }

    pub async fn update(&self, stage: &str, health: StageHealth) {
        self.state.write().await.stages.insert(stage.to_string(), health);
    }

    pub async fn set_healthy(&self, stage: &str) {
        self.update(stage, StageHealth::healthy()).await;
    }

    pub async fn set_degraded(&self, stage: &str, message: impl Into<String>) {
        self.update(stage, StageHealth::degraded(message)).await;
    }

    pub async fn set_unhealthy(&self, stage: &str, message: impl Into<String>) {
        self.update(stage, StageHealth::unhealthy(message)).await;
    }

    pub async fn set_ready(&self, ready: bool) {
        self.state.write().await.ready = ready;
    }

    /// Record a halted inference scope and degrade the inference stage
    pub async fn halt_inference(&self, asset: &AssetId, scope: &str) {
        let mut state = self.state.write().await;
        state.halted.insert((asset.clone(), scope.to_string()));
        let message = format!("inference halted for {} scope(s) on schema mismatch", state.halted.len());
        state
            .stages
            .insert(stages::INFERENCE.to_string(), StageHealth::degraded(message));
    }

    pub async fn halted(&self) -> Vec<String> {
        self.state
            .read()
            .await
            .halted
            .iter()
            .map(|(asset, scope)| format!("{asset}/{scope}"))
            .collect()
    }

    pub async fn health(&self) -> HealthResponse {
        let state = self.state.read().await;
        HealthResponse {
            status: HealthResponse::compute_status(&state.stages),
            stages: state.stages.clone(),
            halted: state
                .halted
                .iter()
                .map(|(asset, scope)| format!("{asset}/{scope}"))
                .collect(),
        }
    }

    /// Ready once started and no stage is unhealthy
    pub async fn readiness(&self) -> ReadinessResponse {
        let state = self.state.read().await;
        if !state.ready {
            return ReadinessResponse {
                ready: false,
                reason: Some("Pipeline not yet initialized".to_string()),
            };
        }
        if let Some((name, _)) = state
            .stages
            .iter()
            .find(|(_, h)| h.status == StageStatus::Unhealthy)
        {
            return ReadinessResponse {
                ready: false,
                reason: Some(format!("Stage '{name}' unhealthy")),
            };
        }
        ReadinessResponse {
            ready: true,
            reason: None,
        }
    }
}
