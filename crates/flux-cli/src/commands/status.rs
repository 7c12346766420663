//! `flux status` / `flux cancel` (spec.md §6.1 `status`, `cancel`).

use anyhow::Result;
use uuid::Uuid;

use crate::client::Client;
use crate::output::{print_field, OutputFormat};

pub async fn run(client: &Client, output: OutputFormat, name: String, execution_id: Uuid, detailed: bool) -> Result<()> {
    let path = format!("/workflows/{name}/status/{execution_id}?detailed={detailed}");
    let status: serde_json::Value = client.get(&path).await?;
    if output.is_text() {
        print_field("Execution", &execution_id.to_string());
        print_field("State", status.get("state").map(|v| v.to_string()).unwrap_or_default().trim_matches('"'));
        if let Some(out) = status.get("output").filter(|v| !v.is_null()) {
            print_field("Output", &out.to_string());
        }
        if let Some(err) = status.get("error").filter(|v| !v.is_null()) {
            print_field("Error", &err.to_string());
        }
        if detailed {
            if let Some(events) = status.get("events").and_then(|v| v.as_array()) {
                println!();
                for event in events {
                    println!(
                        "  [{}] {} {}",
                        event.get("seq").map(|v| v.to_string()).unwrap_or_default(),
                        event.get("kind").and_then(|k| k.get("type")).and_then(|t| t.as_str()).unwrap_or("?"),
                        event.get("name").and_then(|n| n.as_str()).unwrap_or(""),
                    );
                }
            }
        }
    } else {
        output.print_value(&status);
    }
    Ok(())
}

pub async fn cancel(client: &Client, output: OutputFormat, name: String, execution_id: Uuid, sync: bool) -> Result<()> {
    let mode = if sync { "sync" } else { "async" };
    let path = format!("/workflows/{name}/cancel/{execution_id}?mode={mode}");
    let resp: serde_json::Value = client.get(&path).await?;
    output.print_value(&resp);
    if output.is_text() {
        println!("state: {}", resp.get("state").map(|v| v.to_string()).unwrap_or_default());
    }
    Ok(())
}
