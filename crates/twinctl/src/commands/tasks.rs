//! Worker-facing task commands

use anyhow::{Context, Result};
use serde_json::Value;
use tabled::Tabled;

use crate::client::{ApiClient, QueueLength, SubmitTaskRequest, Task, TaskStatusRequest};
use crate::output::{
    color_status, format_time, print_info, print_json, print_rows, print_success, truncate_id,
    OutputFormat,
};

#[derive(Tabled)]
struct TaskRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Type")]
    task_type: String,
    #[tabled(rename = "Priority")]
    priority: i32,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Submitted")]
    submitted: String,
    #[tabled(rename = "Started")]
    started: String,
    #[tabled(rename = "Completed")]
    completed: String,
}

impl From<&Task> for TaskRow {
    fn from(t: &Task) -> Self {
        Self {
            id: truncate_id(&t.id),
            task_type: t.task_type.clone(),
            priority: t.priority,
            status: color_status(&t.status),
            submitted: format_time(Some(t.submitted_at)),
            started: format_time(t.started_at),
            completed: format_time(t.completed_at),
        }
    }
}

fn show_task(task: &Task, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => print_json(task)?,
        OutputFormat::Table => {
            print_rows(vec![TaskRow::from(task)]);
            println!("\nID:   {}", task.id);
            println!("Spec: {}", serde_json::to_string_pretty(&task.spec)?);
            if let Some(error) = &task.error {
                println!("Error: {}", error);
            }
        }
    }
    Ok(())
}

/// Take the most urgent queued task
pub async fn next(client: &ApiClient, wait_ms: Option<u64>, format: OutputFormat) -> Result<()> {
    let path = match wait_ms {
        Some(ms) => format!("v1/queue/next?wait_ms={}", ms),
        None => "v1/queue/next".to_string(),
    };

    match client.post_optional::<Task>(&path).await? {
        Some(task) => show_task(&task, format),
        None => {
            match format {
                OutputFormat::Json => println!("null"),
                OutputFormat::Table => print_info("No queued tasks"),
            }
            Ok(())
        }
    }
}

pub async fn get(client: &ApiClient, id: &str, format: OutputFormat) -> Result<()> {
    let task: Task = client.get(&format!("v1/tasks/{}", id)).await?;
    show_task(&task, format)
}

/// Report a status transition for a task
pub async fn set_status(
    client: &ApiClient,
    id: &str,
    status: &str,
    error: Option<String>,
    format: OutputFormat,
) -> Result<()> {
    let request = TaskStatusRequest {
        status: status.to_lowercase(),
        error,
    };
    let task: Task = client
        .post(&format!("v1/tasks/{}/status", id), &request)
        .await?;

    match format {
        OutputFormat::Json => print_json(&task)?,
        OutputFormat::Table => print_success(&format!(
            "Task {} is now {}",
            task.id,
            color_status(&task.status)
        )),
    }
    Ok(())
}

pub async fn len(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let length: QueueLength = client.get("v1/queue/length").await?;
    match format {
        OutputFormat::Json => print_json(&length)?,
        OutputFormat::Table => println!("{} queued task(s)", length.length),
    }
    Ok(())
}

pub async fn submit(
    client: &ApiClient,
    task_type: &str,
    priority: i32,
    spec: Option<String>,
    format: OutputFormat,
) -> Result<()> {
    let spec: Value = match spec {
        Some(raw) => serde_json::from_str(&raw).context("--spec must be valid JSON")?,
        None => Value::Object(Default::default()),
    };
    let request = SubmitTaskRequest {
        task_type: task_type.to_string(),
        priority,
        spec,
    };
    let task: Task = client.post("v1/tasks", &request).await?;

    match format {
        OutputFormat::Json => print_json(&task)?,
        OutputFormat::Table => print_success(&format!("Task {} queued", task.id)),
    }
    Ok(())
}
