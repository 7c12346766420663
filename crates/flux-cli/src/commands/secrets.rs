//! `flux secrets list|set|remove` (spec.md §6.1 `/admin/secrets[/name]`).

use anyhow::Result;
use clap::Subcommand;
use serde::{Deserialize, Serialize};

use crate::client::Client;
use crate::output::OutputFormat;

#[derive(Subcommand)]
pub enum SecretsCommand {
    /// List secret names (values are never returned)
    List,
    /// Set (or overwrite) a secret
    Set { name: String, value: String },
    /// Remove a secret
    Remove { name: String },
}

#[derive(Debug, Serialize, Deserialize)]
struct SecretNames {
    names: Vec<String>,
}

#[derive(Debug, Serialize)]
struct SetSecretRequest {
    name: String,
    value: String,
}

pub async fn run(command: SecretsCommand, client: &Client, output: OutputFormat) -> Result<()> {
    match command {
        SecretsCommand::List => {
            let names: SecretNames = client.get("/admin/secrets").await?;
            if output.is_text() {
                for name in &names.names {
                    println!("{name}");
                }
            } else {
                output.print_value(&names.names);
            }
            Ok(())
        }
        SecretsCommand::Set { name, value } => {
            client.post_no_body("/admin/secrets", &SetSecretRequest { name: name.clone(), value }).await?;
            println!("set {name}");
            Ok(())
        }
        SecretsCommand::Remove { name } => {
            client.delete(&format!("/admin/secrets/{name}")).await?;
            println!("removed {name}");
            Ok(())
        }
    }
}
