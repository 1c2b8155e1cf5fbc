//! Alert feed command

use anyhow::Result;
use tabled::Tabled;

use crate::client::{AlertTransition, ApiClient};
use crate::output::{color_status, format_timestamp, print_items, OutputFormat};

/// Row for the alert table
#[derive(Tabled)]
struct AlertRow {
    #[tabled(rename = "Time")]
    at: String,
    #[tabled(rename = "Asset")]
    asset: String,
    #[tabled(rename = "Component")]
    component: String,
    #[tabled(rename = "From")]
    from: String,
    #[tabled(rename = "To")]
    to: String,
    #[tabled(rename = "Trigger")]
    trigger: String,
    #[tabled(rename = "Value")]
    value: String,
}

fn rows(alerts: &[AlertTransition]) -> Vec<AlertRow> {
    alerts
        .iter()
        .map(|a| AlertRow {
            at: format_timestamp(a.at),
            asset: a.asset_id.clone(),
            component: a.component.clone(),
            from: color_status(&a.from),
            to: color_status(&a.to),
            trigger: a.trigger.clone(),
            value: format!("{:.3}", a.value),
        })
        .collect()
}

/// List alert transitions, oldest first
pub async fn list_alerts(client: &ApiClient, since: Option<i64>, format: OutputFormat) -> Result<()> {
    let alerts = client.alerts(since).await?;
    print_items(&alerts, rows, format, "No alert transitions")?;
    if format == OutputFormat::Table && !alerts.is_empty() {
        println!("\nTotal: {} transitions", alerts.len());
    }
    Ok(())
}
