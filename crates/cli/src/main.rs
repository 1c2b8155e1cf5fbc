//! Fleet prognostics CLI
//!
//! A command-line tool for querying asset health, alert transitions and
//! maintenance tasks from a running prognostics agent.

mod client;
mod commands;
mod config;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use commands::{alerts, health, tasks};
use output::OutputFormat;

const DEFAULT_API_URL: &str = "http://localhost:8080";

/// Fleet prognostics CLI
#[derive(Parser)]
#[command(name = "fleetctl")]
#[command(author, version, about = "CLI for Fleet Prognostics", long_about = None)]
pub struct Cli {
    /// Agent API URL (can also be set via FLEETCTL_API_URL env var)
    #[arg(long, env = "FLEETCTL_API_URL")]
    pub api_url: Option<String>,

    /// Output format
    #[arg(long, short)]
    pub format: Option<OutputFormat>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show the current health of an asset
    Health {
        /// Asset ID
        asset: String,
    },

    /// List alert transitions across the fleet
    Alerts {
        /// Only transitions at or after this time (epoch millis, RFC 3339, or 30m/6h/7d)
        #[arg(long)]
        since: Option<String>,
    },

    /// List maintenance tasks
    Tasks {
        /// Filter by asset ID
        #[arg(long, short)]
        asset: Option<String>,

        /// Filter by status (open, superseded, closed)
        #[arg(long)]
        status: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = config::Config::load()?;

    let api_url = cli
        .api_url
        .or(settings.api_url)
        .unwrap_or_else(|| DEFAULT_API_URL.to_string());
    let format = cli
        .format
        .or_else(|| {
            settings
                .default_format
                .as_deref()
                .and_then(|f| OutputFormat::from_str(f, true).ok())
        })
        .unwrap_or_default();

    let client = client::ApiClient::new(&api_url)?;

    match cli.command {
        Commands::Health { asset } => {
            health::show_health(&client, &asset, format).await?;
        }
        Commands::Alerts { since } => {
            let since = since
                .map(|s| output::parse_since(&s, chrono::Utc::now()))
                .transpose()?;
            alerts::list_alerts(&client, since, format).await?;
        }
        Commands::Tasks { asset, status } => {
            tasks::list_tasks(&client, asset, status, format).await?;
        }
    }

    Ok(())
}
