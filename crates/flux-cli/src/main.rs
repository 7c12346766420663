//! Flux CLI — a thin `reqwest`-based client over the server's REST
//! surface (spec.md §6.1). Exit codes: `0` success, `1` failed
//! execution, `2` usage error, `3` server unreachable.

mod client;
mod commands;
mod output;

use clap::{Parser, Subcommand};

use client::ClientError;

#[derive(Parser)]
#[command(name = "flux")]
#[command(about = "Flux CLI - register workflows, run and inspect executions")]
#[command(version)]
pub struct Cli {
    /// Server base URL
    #[arg(long, env = "FLUX_API_URL", default_value = "http://localhost:8080")]
    pub api_url: String,

    /// Output format
    #[arg(long, short, default_value = "text", value_parser = ["text", "json", "yaml"])]
    pub output: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Manage the workflow catalog
    Workflows {
        #[command(subcommand)]
        command: commands::workflows::WorkflowsCommand,
    },
    /// Start a new execution
    Run {
        /// Registered workflow name
        name: String,
        /// JSON-encoded input; defaults to `null`
        #[arg(long, default_value = "null")]
        input: String,
        /// Response mode
        #[arg(long, default_value = "sync", value_parser = ["sync", "async", "stream"])]
        mode: String,
    },
    /// Resume a paused execution with new input
    Resume {
        name: String,
        execution_id: uuid::Uuid,
        #[arg(long, default_value = "null")]
        input: String,
        #[arg(long, default_value = "sync", value_parser = ["sync", "async", "stream"])]
        mode: String,
    },
    /// Fetch execution status
    Status {
        name: String,
        execution_id: uuid::Uuid,
        /// Include the full event log
        #[arg(long)]
        detailed: bool,
    },
    /// Request cancellation of a running execution
    Cancel {
        name: String,
        execution_id: uuid::Uuid,
        /// Wait for the execution to reach CANCELLED before returning
        #[arg(long)]
        sync: bool,
    },
    /// Manage secrets
    Secrets {
        #[command(subcommand)]
        command: commands::secrets::SecretsCommand,
    },
}

/// Maps a top-level command failure to the process exit code the spec
/// requires. `ClientError::Unreachable` is the only case that maps to
/// `3`; everything else surfaced as an `anyhow::Error` from a command
/// handler is a usage/API-level failure (`2`), except the dedicated
/// `ExecutionFailed` signal from `run`/`resume`/`status` (`1`).
fn exit_code_for(err: &anyhow::Error) -> i32 {
    if err.downcast_ref::<commands::ExecutionFailed>().is_some() {
        return 1;
    }
    if let Some(ClientError::Unreachable(_)) = err.downcast_ref::<ClientError>() {
        return 3;
    }
    2
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let client = client::Client::new(&cli.api_url);
    let output = output::OutputFormat::from_str(&cli.output);

    let result = match cli.command {
        Commands::Workflows { command } => commands::workflows::run(command, &client, output).await,
        Commands::Run { name, input, mode } => commands::run::run(&client, output, name, input, mode).await,
        Commands::Resume { name, execution_id, input, mode } => {
            commands::run::resume(&client, output, name, execution_id, input, mode).await
        }
        Commands::Status { name, execution_id, detailed } => commands::status::run(&client, output, name, execution_id, detailed).await,
        Commands::Cancel { name, execution_id, sync } => commands::status::cancel(&client, output, name, execution_id, sync).await,
        Commands::Secrets { command } => commands::secrets::run(command, &client, output).await,
    };

    if let Err(err) = result {
        eprintln!("error: {err}");
        std::process::exit(exit_code_for(&err));
    }
}
