//! Maintenance task command

use anyhow::Result;
use tabled::Tabled;

use crate::client::{ApiClient, MaintenanceTask};
use crate::output::{color_status, format_timestamp, print_items, OutputFormat};

/// Row for the task table
#[derive(Tabled)]
struct TaskRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Asset")]
    asset: String,
    #[tabled(rename = "Component")]
    component: String,
    #[tabled(rename = "Severity")]
    severity: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Generated")]
    generated_at: String,
    #[tabled(rename = "Due By")]
    due_by: String,
}

fn rows(tasks: &[MaintenanceTask]) -> Vec<TaskRow> {
    tasks
        .iter()
        .map(|t| TaskRow {
            id: t.id.clone(),
            asset: t.asset_id.clone(),
            component: t.component.clone(),
            severity: color_status(&t.severity),
            status: color_status(&t.status),
            generated_at: format_timestamp(t.generated_at),
            due_by: format_timestamp(t.due_by),
        })
        .collect()
}

/// List maintenance tasks with optional filters
pub async fn list_tasks(
    client: &ApiClient,
    asset: Option<String>,
    status: Option<String>,
    format: OutputFormat,
) -> Result<()> {
    let tasks = client.tasks(asset, status).await?;
    print_items(&tasks, rows, format, "No maintenance tasks found")?;
    if format == OutputFormat::Table && !tasks.is_empty() {
        println!("\nTotal: {} tasks", tasks.len());
    }
    Ok(())
}
