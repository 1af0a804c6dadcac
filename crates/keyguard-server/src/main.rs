//! CLI entry point for KeyGuard.
//!
//! `keyguard` with no subcommand runs the MCP server on stdio. Logs always go
//! to stderr; stdout belongs to the JSON-RPC stream.

mod cli;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use keyguard_server::{BrokerConfig, KeyGuard, McpServer};
use keyguard_vault::{CredentialStore, KeyEntry};

use crate::cli::{Cli, Commands, KeyAction};

#[tokio::main]
async fn main() -> Result<()> {
    // Load `.env` before anything reads the environment, RUST_LOG included.
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_tracing("info", cli.log_json);

    let config = BrokerConfig::load(cli.config.as_deref()).context("failed to load configuration")?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => cmd_serve(config).await,
        Commands::Keys { action } => cmd_keys(&config, action),
    }
}

// ---------------------------------------------------------------------------
// Subcommand: serve
// ---------------------------------------------------------------------------

async fn cmd_serve(config: BrokerConfig) -> Result<()> {
    let broker = KeyGuard::from_config(&config).context("failed to initialise broker")?;
    let broker = Arc::new(broker);

    let reaper = broker
        .sessions()
        .spawn_reaper(Duration::from_secs(config.reaper_interval_secs));

    info!(storage = %config.storage_path.display(), "KeyGuard MCP server running on stdio");

    let result = McpServer::new(broker).serve_stdio().await;
    reaper.abort();
    result.context("stdio transport failed")
}

// ---------------------------------------------------------------------------
// Subcommand: keys
// ---------------------------------------------------------------------------

fn cmd_keys(config: &BrokerConfig, action: KeyAction) -> Result<()> {
    let mut store = CredentialStore::open(&config.storage_path);

    match action {
        KeyAction::List { service } => {
            let keys = store.list(service.as_deref());
            if keys.is_empty() {
                println!("No keys registered.");
                return Ok(());
            }
            println!("{:<38} {:<12} {:<40} DESCRIPTION", "ID", "SERVICE", "PERMISSIONS");
            for key in keys {
                println!(
                    "{:<38} {:<12} {:<40} {}",
                    key.id,
                    key.service,
                    key.permissions.join(","),
                    key.description.as_deref().unwrap_or("")
                );
            }
        }
        KeyAction::Add {
            service,
            key,
            permissions,
            description,
        } => {
            if service.trim().is_empty() || key.trim().is_empty() {
                bail!("--service and --key must not be empty");
            }
            let permissions: Vec<String> = permissions
                .into_iter()
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect();

            let mut entry = KeyEntry::new(service.trim(), key, permissions);
            if let Some(d) = description {
                entry = entry.with_description(d);
            }
            let id = entry.id.clone();
            store.add(entry);
            println!("Registered key {id}");
        }
        KeyAction::Remove { id } => match store.remove(&id) {
            Some(entry) => println!("Removed key {} ({})", entry.id, entry.service),
            None => bail!("no key with id {id}"),
        },
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Tracing
// ---------------------------------------------------------------------------

fn init_tracing(default_level: &str, json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    if json {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}
