//! twinctl - command-line client for twin-server
//!
//! Lets operators inspect twins and run predictions, and lets external
//! workers and trainers pull tasks and report status.

mod client;
mod commands;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{models, predict, tasks, twins};
use serde_json::Value;

/// Digital twin control loop CLI
#[derive(Parser)]
#[command(name = "twinctl")]
#[command(author, version, about = "CLI for the digital twin platform", long_about = None)]
pub struct Cli {
    /// API endpoint URL (can also be set via TWINCTL_API_URL env var)
    #[arg(long, env = "TWINCTL_API_URL", default_value = "http://localhost:8080")]
    pub api_url: String,

    /// Output format
    #[arg(long, short, default_value = "table")]
    pub format: output::OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Pull and report on dispatched work
    #[command(subcommand)]
    Tasks(TaskCommands),

    /// Inspect digital twins
    #[command(subcommand)]
    Twins(TwinCommands),

    /// Request a point prediction
    Predict {
        /// Digital twin ID
        twin_id: String,

        /// Model ID
        #[arg(long, short)]
        model: String,

        /// Entity whose attributes feed the model
        #[arg(long, short)]
        entity: Option<String>,

        /// Input attribute as key=value (JSON values accepted), repeatable
        #[arg(long = "input", short = 'i', value_parser = parse_input)]
        inputs: Vec<(String, Value)>,

        /// Always compute a fresh prediction
        #[arg(long)]
        no_cache: bool,
    },

    /// Model registry operations
    #[command(subcommand)]
    Models(ModelCommands),
}

#[derive(Subcommand)]
pub enum TaskCommands {
    /// Take the most urgent queued task
    Next {
        /// Wait up to this many milliseconds for work
        #[arg(long)]
        wait_ms: Option<u64>,
    },

    /// Show a task
    Get {
        /// Task ID
        id: String,
    },

    /// Report a task status transition
    Status {
        /// Task ID
        id: String,

        /// New status
        #[arg(value_parser = ["executing", "completed", "failed", "timeout", "cancelled"])]
        status: String,

        /// Failure detail
        #[arg(long)]
        error: Option<String>,
    },

    /// Number of queued tasks
    Len,

    /// Queue a task
    Submit {
        /// Task type tag
        task_type: String,

        /// Priority (higher runs sooner)
        #[arg(long, short, default_value_t = 0)]
        priority: i32,

        /// Task specification as JSON
        #[arg(long)]
        spec: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum TwinCommands {
    /// List digital twins
    List {
        /// Filter by project
        #[arg(long, short)]
        project: Option<String>,
    },

    /// Show a digital twin
    Get {
        /// Digital twin ID
        id: String,
    },
}

#[derive(Subcommand)]
pub enum ModelCommands {
    /// Show a model
    Get {
        /// Model ID
        id: String,
    },

    /// Report training status
    Status {
        /// Model ID
        id: String,

        /// New status
        #[arg(value_parser = ["training", "trained", "failed"])]
        status: String,

        /// Artifact produced by training (required for trained)
        #[arg(long)]
        artifact_path: Option<String>,

        /// Evaluation metric as name=value, repeatable
        #[arg(long = "metric", value_parser = parse_metric)]
        metrics: Vec<(String, f64)>,

        /// Failure detail
        #[arg(long)]
        error: Option<String>,
    },
}

/// Parse `key=value`; the value is read as JSON, falling back to a string
fn parse_input(s: &str) -> Result<(String, Value), String> {
    let (key, raw) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{s}'"))?;
    if key.is_empty() {
        return Err(format!("missing key in '{s}'"));
    }
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok((key.to_string(), value))
}

fn parse_metric(s: &str) -> Result<(String, f64), String> {
    let (key, raw) = s
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got '{s}'"))?;
    let value = raw
        .parse::<f64>()
        .map_err(|_| format!("metric '{key}' is not a number: '{raw}'"))?;
    Ok((key.to_string(), value))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let client = client::ApiClient::new(&cli.api_url)?;
    let format = cli.format;

    match cli.command {
        Commands::Tasks(cmd) => match cmd {
            TaskCommands::Next { wait_ms } => tasks::next(&client, wait_ms, format).await?,
            TaskCommands::Get { id } => tasks::get(&client, &id, format).await?,
            TaskCommands::Status { id, status, error } => {
                tasks::set_status(&client, &id, &status, error, format).await?
            }
            TaskCommands::Len => tasks::len(&client, format).await?,
            TaskCommands::Submit {
                task_type,
                priority,
                spec,
            } => tasks::submit(&client, &task_type, priority, spec, format).await?,
        },
        Commands::Twins(cmd) => match cmd {
            TwinCommands::List { project } => twins::list(&client, project, format).await?,
            TwinCommands::Get { id } => twins::get(&client, &id, format).await?,
        },
        Commands::Predict {
            twin_id,
            model,
            entity,
            inputs,
            no_cache,
        } => {
            predict::predict(&client, &twin_id, &model, entity, inputs, no_cache, format).await?
        }
        Commands::Models(cmd) => match cmd {
            ModelCommands::Get { id } => models::get(&client, &id, format).await?,
            ModelCommands::Status {
                id,
                status,
                artifact_path,
                metrics,
                error,
            } => {
                models::set_status(&client, &id, &status, artifact_path, metrics, error, format)
                    .await?
            }
        },
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_tasks_next_with_wait() {
        let cli = Cli::try_parse_from(["twinctl", "tasks", "next", "--wait-ms", "500"]).unwrap();
        assert_eq!(cli.api_url, "http://localhost:8080");
        assert_eq!(cli.format, output::OutputFormat::Table);
        assert!(matches!(
            cli.command,
            Commands::Tasks(TaskCommands::Next { wait_ms: Some(500) })
        ));
    }

    #[test]
    fn test_parse_task_status_rejects_unknown_status() {
        let cli = Cli::try_parse_from([
            "twinctl", "tasks", "status", "t-1", "failed", "--error", "oom",
        ])
        .unwrap();
        match cli.command {
            Commands::Tasks(TaskCommands::Status { id, status, error }) => {
                assert_eq!(id, "t-1");
                assert_eq!(status, "failed");
                assert_eq!(error.as_deref(), Some("oom"));
            }
            _ => panic!("expected tasks status"),
        }

        assert!(Cli::try_parse_from(["twinctl", "tasks", "status", "t-1", "queued"]).is_err());
    }

    #[test]
    fn test_parse_predict_inputs() {
        let cli = Cli::try_parse_from([
            "twinctl",
            "--format",
            "json",
            "predict",
            "twin-1",
            "--model",
            "m-1",
            "-i",
            "x=3",
            "-i",
            "mode=eco",
            "--no-cache",
        ])
        .unwrap();
        assert_eq!(cli.format, output::OutputFormat::Json);
        match cli.command {
            Commands::Predict {
                twin_id,
                model,
                entity,
                inputs,
                no_cache,
            } => {
                assert_eq!(twin_id, "twin-1");
                assert_eq!(model, "m-1");
                assert!(entity.is_none());
                assert_eq!(
                    inputs,
                    vec![("x".to_string(), json!(3)), ("mode".to_string(), json!("eco"))]
                );
                assert!(no_cache);
            }
            _ => panic!("expected predict"),
        }
    }

    #[test]
    fn test_parse_model_status_metrics() {
        let cli = Cli::try_parse_from([
            "twinctl",
            "models",
            "status",
            "m-1",
            "trained",
            "--artifact-path",
            "/models/m-1.json",
            "--metric",
            "rmse=0.25",
        ])
        .unwrap();
        match cli.command {
            Commands::Models(ModelCommands::Status {
                status,
                artifact_path,
                metrics,
                ..
            }) => {
                assert_eq!(status, "trained");
                assert_eq!(artifact_path.as_deref(), Some("/models/m-1.json"));
                assert_eq!(metrics, vec![("rmse".to_string(), 0.25)]);
            }
            _ => panic!("expected models status"),
        }

        assert!(Cli::try_parse_from([
            "twinctl", "models", "status", "m-1", "trained", "--metric", "rmse=high",
        ])
        .is_err());
    }

    #[test]
    fn test_key_value_parsers() {
        assert_eq!(parse_input("on=true").unwrap(), ("on".to_string(), json!(true)));
        assert!(parse_input("novalue").is_err());
        assert!(parse_input("=3").is_err());
        assert!(parse_metric("acc").is_err());
    }
}
