//! `flux workflows list|get|register` (spec.md §6.1 `/workflows*`).

use anyhow::{Context, Result};
use clap::Subcommand;
use serde::{Deserialize, Serialize};

use crate::client::Client;
use crate::output::{print_field, print_table_header, print_table_row, OutputFormat};

#[derive(Subcommand)]
pub enum WorkflowsCommand {
    /// List registered workflows
    List,
    /// Show metadata for one workflow
    Get { name: String },
    /// Register workflows from a compiled workflow body
    Register {
        /// Workflow name
        name: String,
        /// Path to the opaque encoded program body
        body: std::path::PathBuf,
        /// JSON-encoded resource requirements
        #[arg(long)]
        resources: Option<String>,
        /// Comma-separated secret names the workflow declares
        #[arg(long)]
        secrets: Option<String>,
    },
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WorkflowSummary {
    pub name: String,
    pub version: u32,
}

pub async fn run(command: WorkflowsCommand, client: &Client, output: OutputFormat) -> Result<()> {
    match command {
        WorkflowsCommand::List => list(client, output).await,
        WorkflowsCommand::Get { name } => get(client, output, name).await,
        WorkflowsCommand::Register { name, body, resources, secrets } => register(client, output, name, body, resources, secrets).await,
    }
}

async fn list(client: &Client, output: OutputFormat) -> Result<()> {
    let workflows: Vec<WorkflowSummary> = client.get("/workflows").await?;
    if output.is_text() {
        print_table_header(&[("NAME", 32), ("VERSION", 8)]);
        for w in &workflows {
            print_table_row(&[(w.name.as_str(), 32), (&w.version.to_string(), 8)]);
        }
    } else {
        output.print_value(&workflows);
    }
    Ok(())
}

async fn get(client: &Client, output: OutputFormat, name: String) -> Result<()> {
    let def: serde_json::Value = client.get(&format!("/workflows/{name}")).await?;
    if output.is_text() {
        print_field("Name", def.get("name").and_then(|v| v.as_str()).unwrap_or(&name));
        print_field("Version", &def.get("version").map(|v| v.to_string()).unwrap_or_default());
        print_field("Secrets", &def.get("secret_requests").map(|v| v.to_string()).unwrap_or_default());
    } else {
        output.print_value(&def);
    }
    Ok(())
}

async fn register(
    client: &Client,
    output: OutputFormat,
    name: String,
    body_path: std::path::PathBuf,
    resources: Option<String>,
    secrets: Option<String>,
) -> Result<()> {
    let body = std::fs::read(&body_path).with_context(|| format!("reading {}", body_path.display()))?;
    let secret_names: Vec<String> = secrets.map(|s| s.split(',').map(|x| x.trim().to_string()).filter(|x| !x.is_empty()).collect()).unwrap_or_default();

    let mut form = reqwest::multipart::Form::new().text("name", name).part("body", reqwest::multipart::Part::bytes(body));
    if let Some(resources) = resources {
        form = form.text("resources", resources);
    }
    form = form.text("secrets", serde_json::to_string(&secret_names)?);

    let registered: Vec<WorkflowSummary> = client.post_multipart("/workflows", form).await?;
    output.print_value(&registered);
    if output.is_text() {
        for w in &registered {
            println!("registered {} v{}", w.name, w.version);
        }
    }
    Ok(())
}
