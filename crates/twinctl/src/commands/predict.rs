//! Point prediction command

use anyhow::Result;
use serde_json::Value;

use crate::client::{ApiClient, PredictRequest, PredictResponse};
use crate::output::{format_confidence, format_time, print_json, print_success, OutputFormat};

pub async fn predict(
    client: &ApiClient,
    twin_id: &str,
    model_id: &str,
    entity_id: Option<String>,
    inputs: Vec<(String, Value)>,
    no_cache: bool,
    format: OutputFormat,
) -> Result<()> {
    let request = PredictRequest {
        model_id: model_id.to_string(),
        entity_id,
        input: inputs.into_iter().collect(),
        use_cache: !no_cache,
    };
    let response: PredictResponse = client
        .post(&format!("v1/twins/{}/predict", twin_id), &request)
        .await?;

    match format {
        OutputFormat::Json => print_json(&response)?,
        OutputFormat::Table => {
            let p = &response.prediction;
            println!("Prediction: {}", p.id);
            println!("Output:     {}", p.output);
            println!("Confidence: {}", format_confidence(p.confidence));
            println!("Expires:    {}", format_time(Some(p.expires_at)));
            println!(
                "Source:     {}",
                if response.from_cache { "cache" } else { "fresh" }
            );
            for task_id in &response.triggered_tasks {
                print_success(&format!("Action fired, task {} queued", task_id));
            }
        }
    }
    Ok(())
}
