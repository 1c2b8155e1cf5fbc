//! Asset health command

use anyhow::Result;
use tabled::Tabled;

use crate::client::{ApiClient, AssetHealth, ComponentView};
use crate::output::{
    color_health, color_status, format_hours, format_timestamp, print_info, print_items,
    OutputFormat,
};

/// Row for the component table
#[derive(Tabled)]
struct ComponentRow {
    #[tabled(rename = "Component")]
    component: String,
    #[tabled(rename = "Level")]
    level: String,
    #[tabled(rename = "Since")]
    since: String,
    #[tabled(rename = "Health")]
    health: String,
    #[tabled(rename = "RUL")]
    rul: String,
}

fn rows(components: &[ComponentView]) -> Vec<ComponentRow> {
    components
        .iter()
        .map(|c| ComponentRow {
            component: c.component.clone(),
            level: color_status(&c.level),
            since: format_timestamp(c.entered_at),
            health: color_health(c.health),
            rul: format_hours(c.latest_rul_hours),
        })
        .collect()
}

/// Show the current health of one asset
pub async fn show_health(client: &ApiClient, asset: &str, format: OutputFormat) -> Result<()> {
    let health: AssetHealth = client.asset_health(asset).await?;

    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(&health)?);
        return Ok(());
    }

    print_info(&format!(
        "{}: health {} as of {} ({} open task(s))",
        health.asset_id,
        color_health(health.health),
        format_timestamp(health.as_of),
        health.open_tasks
    ));
    print_items(&health.components, rows, format, "No components reported")
}
