//! Digital twin inspection commands

use anyhow::Result;
use tabled::Tabled;

use crate::client::{ApiClient, Twin};
use crate::output::{format_time, print_json, print_rows, print_warning, OutputFormat};

#[derive(Tabled)]
struct TwinRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Project")]
    project_id: String,
    #[tabled(rename = "Ontology")]
    ontology_id: String,
    #[tabled(rename = "Predictions")]
    predictions: String,
    #[tabled(rename = "Last Sync")]
    last_sync: String,
}

impl From<&Twin> for TwinRow {
    fn from(t: &Twin) -> Self {
        let predictions = match t.config.get("enable_predictions").and_then(|v| v.as_bool()) {
            Some(false) => "off",
            _ => "on",
        };
        Self {
            id: t.id.clone(),
            name: t.name.clone(),
            project_id: t.project_id.clone(),
            ontology_id: t.ontology_id.clone(),
            predictions: predictions.to_string(),
            last_sync: format_time(t.last_sync_at),
        }
    }
}

pub async fn list(client: &ApiClient, project: Option<String>, format: OutputFormat) -> Result<()> {
    let path = match &project {
        Some(p) => format!("v1/twins?project_id={}", p),
        None => "v1/twins".to_string(),
    };
    let twins: Vec<Twin> = client.get(&path).await?;

    match format {
        OutputFormat::Json => print_json(&twins)?,
        OutputFormat::Table => {
            if twins.is_empty() {
                print_warning("No digital twins found");
                return Ok(());
            }
            print_rows(twins.iter().map(TwinRow::from).collect());
            println!("\nTotal: {} twins", twins.len());
        }
    }
    Ok(())
}

pub async fn get(client: &ApiClient, id: &str, format: OutputFormat) -> Result<()> {
    let twin: Twin = client.get(&format!("v1/twins/{}", id)).await?;

    match format {
        OutputFormat::Json => print_json(&twin)?,
        OutputFormat::Table => {
            print_rows(vec![TwinRow::from(&twin)]);
            println!("\nConfig: {}", serde_json::to_string_pretty(&twin.config)?);
        }
    }
    Ok(())
}
