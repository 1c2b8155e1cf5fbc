//! Prognostics agent - streaming vehicle health pipeline
//!
//! Ingests sensor readings over HTTP, runs one processing unit per asset and
//! serves health, alert and maintenance projections.

use anyhow::Result;
use prognostics_agent::{api, config};
use prognostics_lib::{
    probes::stages, Fleet, JsonLinesSink, MemorySink, ModelRegistry, PipelineMetrics,
    ProbeRegistry, RecordSink, StructuredLogger, UnitContext,
};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting prognostics-agent");

    let agent = config::AgentConfig::load()?;
    let pipeline = config::load_pipeline(&agent.pipeline_config)?;
    info!(
        node_name = %agent.node_name,
        config = %agent.pipeline_config.display(),
        channels = pipeline.channels.len(),
        components = pipeline.components.len(),
        "Agent configured"
    );

    let registry = ModelRegistry::load(&pipeline.models, &agent.model_dir)?;
    let metrics = PipelineMetrics::new();
    for binding in &pipeline.models {
        metrics.set_model_loaded(
            &binding.version,
            &binding.family.to_string(),
            &binding.kind.to_string(),
        );
    }

    let logger = StructuredLogger::new(&agent.node_name);
    logger.log_startup(AGENT_VERSION, &registry.versions());

    let sink: Arc<dyn RecordSink> = match &agent.records_path {
        Some(path) => Arc::new(JsonLinesSink::open(path).await?),
        None => {
            warn!("No records_path configured, pipeline records are kept in memory");
            Arc::new(MemorySink::new())
        }
    };

    let probes = ProbeRegistry::new();
    let ctx = UnitContext::new(pipeline, Arc::new(registry), sink, probes.clone(), logger.clone());
    let fleet = Arc::new(Fleet::new(ctx));
    let app_state = Arc::new(api::AppState::new(Arc::clone(&fleet), probes.clone()));

    probes.set_ready(true).await;

    let mut api_handle = tokio::spawn(api::serve(agent.api_port, app_state));

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            logger.log_shutdown("SIGINT received");
        }
        result = &mut api_handle => {
            match result {
                Ok(Err(e)) => error!(error = %e, "API server failed"),
                Err(e) => error!(error = %e, "API server task panicked"),
                Ok(Ok(())) => warn!("API server exited"),
            }
            probes.set_unhealthy(stages::INGEST, "API server stopped").await;
            logger.log_shutdown("API server stopped");
        }
    }

    probes.set_ready(false).await;
    fleet.shutdown().await;
    api_handle.abort();
    info!("Shutdown complete");

    Ok(())
}
