//! `flux run` / `flux resume` (spec.md §6.1 `run/{mode}` and
//! `resume/{execution_id}/{mode}`).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::client::Client;
use crate::output::{print_field, OutputFormat};

use super::ExecutionFailed;

#[derive(Debug, Serialize, Deserialize)]
pub struct RunResponse {
    pub execution_id: Uuid,
    pub state: String,
    #[serde(default)]
    pub output: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<serde_json::Value>,
}

fn parse_input(raw: &str) -> Result<serde_json::Value> {
    serde_json::from_str(raw).with_context(|| format!("--input is not valid JSON: {raw}"))
}

fn render(output: OutputFormat, resp: &RunResponse) -> Result<()> {
    if output.is_text() {
        print_field("Execution", &resp.execution_id.to_string());
        print_field("State", &resp.state);
        if let Some(out) = &resp.output {
            print_field("Output", &out.to_string());
        }
        if let Some(err) = &resp.error {
            print_field("Error", &err.to_string());
        }
    } else {
        output.print_value(resp);
    }

    if resp.state == "FAILED" || resp.state == "CANCELLED" {
        return Err(ExecutionFailed(resp.state.clone()).into());
    }
    Ok(())
}

pub async fn run(client: &Client, output: OutputFormat, name: String, input: String, mode: String) -> Result<()> {
    let input = parse_input(&input)?;
    if mode == "async" {
        let resp: serde_json::Value = client.post(&format!("/workflows/{name}/run/async"), &input).await?;
        output.print_value(&resp);
        return Ok(());
    }
    if mode == "stream" {
        anyhow::bail!("stream mode requires an SSE-capable terminal session; use --mode sync or async from the CLI");
    }
    let resp: RunResponse = client.post(&format!("/workflows/{name}/run/sync"), &input).await?;
    render(output, &resp)
}

pub async fn resume(client: &Client, output: OutputFormat, name: String, execution_id: Uuid, input: String, mode: String) -> Result<()> {
    let input = parse_input(&input)?;
    if mode == "async" {
        let resp: serde_json::Value = client.post(&format!("/workflows/{name}/resume/{execution_id}/async"), &input).await?;
        output.print_value(&resp);
        return Ok(());
    }
    if mode == "stream" {
        anyhow::bail!("stream mode requires an SSE-capable terminal session; use --mode sync or async from the CLI");
    }
    let resp: RunResponse = client.post(&format!("/workflows/{name}/resume/{execution_id}/sync"), &input).await?;
    render(output, &resp)
}
