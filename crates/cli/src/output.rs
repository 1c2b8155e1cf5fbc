//! Output formatting utilities

use chrono::{DateTime, Utc};
use clap::ValueEnum;
use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

/// Output format for CLI commands
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Table format (default)
    #[default]
    Table,
    /// JSON format
    Json,
}

/// Print rows as a table, or the raw items as JSON
pub fn print_items<T: Serialize, R: Tabled>(
    items: &[T],
    rows: impl FnOnce(&[T]) -> Vec<R>,
    format: OutputFormat,
    empty_message: &str,
) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(items)?);
        }
        OutputFormat::Table => {
            if items.is_empty() {
                print_warning(empty_message);
                return Ok(());
            }
            let table = Table::new(rows(items)).with(Style::rounded()).to_string();
            println!("{}", table);
        }
    }
    Ok(())
}

/// Print a warning message
pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message);
}

/// Print an info message
pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

/// Format epoch milliseconds as UTC time
pub fn format_timestamp(millis: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| millis.to_string())
}

/// Format remaining useful life in hours
pub fn format_hours(hours: Option<f64>) -> String {
    match hours {
        Some(h) if h >= 48.0 => format!("{:.1}d", h / 24.0),
        Some(h) => format!("{:.1}h", h),
        None => "-".to_string(),
    }
}

/// Format a [0, 1] health score as percentage
pub fn format_health(health: f64) -> String {
    format!("{:.0}%", health * 100.0)
}

/// Color a health score by band
pub fn color_health(health: f64) -> String {
    let formatted = format_health(health);
    if health >= 0.8 {
        formatted.green().to_string()
    } else if health >= 0.5 {
        formatted.yellow().to_string()
    } else {
        formatted.red().to_string()
    }
}

/// Color alert levels and task statuses
pub fn color_status(status: &str) -> String {
    match status.to_lowercase().as_str() {
        "normal" | "closed" => status.green().to_string(),
        "warning" | "open" => status.yellow().to_string(),
        "critical" => status.red().bold().to_string(),
        "superseded" => status.dimmed().to_string(),
        _ => status.to_string(),
    }
}

/// Parse `--since`: epoch millis, RFC 3339, or a lookback like `30m`, `6h`, `7d`
pub fn parse_since(value: &str, now: DateTime<Utc>) -> anyhow::Result<i64> {
    if let Ok(millis) = value.parse::<i64>() {
        return Ok(millis);
    }
    if let Ok(time) = DateTime::parse_from_rfc3339(value) {
        return Ok(time.timestamp_millis());
    }

    let unit_at = value.char_indices().last().map_or(0, |(i, _)| i);
    let (amount, unit) = value.split_at(unit_at);
    let amount: i64 = amount
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid --since value '{value}'"))?;
    let lookback = match unit {
        "s" => chrono::Duration::seconds(amount),
        "m" => chrono::Duration::minutes(amount),
        "h" => chrono::Duration::hours(amount),
        "d" => chrono::Duration::days(amount),
        _ => anyhow::bail!("Invalid --since unit in '{value}', expected s, m, h or d"),
    };
    Ok((now - lookback).timestamp_millis())
}
