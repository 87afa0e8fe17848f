//! Model registry commands used by the trainer

use anyhow::Result;
use std::collections::BTreeMap;
use tabled::Tabled;

use crate::client::{ApiClient, Model, ModelStatusRequest};
use crate::output::{color_status, format_time, print_json, print_rows, OutputFormat};

#[derive(Tabled)]
struct ModelRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Type")]
    model_type: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Artifact")]
    artifact: String,
    #[tabled(rename = "Updated")]
    updated: String,
}

fn show_model(model: &Model, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => print_json(model)?,
        OutputFormat::Table => {
            print_rows(vec![ModelRow {
                id: model.id.clone(),
                name: model.name.clone(),
                model_type: model.model_type.clone(),
                status: color_status(&model.status),
                artifact: model.artifact_path.clone().unwrap_or_else(|| "-".into()),
                updated: format_time(Some(model.updated_at)),
            }]);
            if let Some(error) = &model.error {
                println!("\nError: {}", error);
            }
        }
    }
    Ok(())
}

pub async fn get(client: &ApiClient, id: &str, format: OutputFormat) -> Result<()> {
    let model: Model = client.get(&format!("v1/models/{}", id)).await?;
    show_model(&model, format)
}

/// Report training progress for a model
pub async fn set_status(
    client: &ApiClient,
    id: &str,
    status: &str,
    artifact_path: Option<String>,
    metrics: Vec<(String, f64)>,
    error: Option<String>,
    format: OutputFormat,
) -> Result<()> {
    let metrics: BTreeMap<String, f64> = metrics.into_iter().collect();
    let request = ModelStatusRequest {
        status: status.to_lowercase(),
        artifact_path,
        metrics: (!metrics.is_empty()).then_some(metrics),
        error,
    };
    let model: Model = client
        .post(&format!("v1/models/{}/status", id), &request)
        .await?;
    show_model(&model, format)
}
