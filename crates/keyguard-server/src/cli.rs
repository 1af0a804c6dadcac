//! CLI argument definitions for KeyGuard.
//!
//! All `clap` structures live here so that `main.rs` stays focused on
//! dispatching subcommands.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// KeyGuard -- least-privilege credential broker for AI agents.
#[derive(Parser)]
#[command(
    name = "keyguard",
    version,
    about = "KeyGuard -- least-privilege credential broker for AI agents",
    long_about = "Stores service API keys with permission scopes and hands agents short-lived \
                  session tokens instead of raw secrets. Runs as an MCP server on stdio."
)]
pub struct Cli {
    /// Path to a TOML config file (default: ./keyguard.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Emit logs as JSON lines on stderr.
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the MCP server on stdin/stdout (default).
    Serve,

    /// Manage registered keys.
    Keys {
        #[command(subcommand)]
        action: KeyAction,
    },
}

/// Actions for managing registered keys.
#[derive(Subcommand)]
pub enum KeyAction {
    /// List registered keys. Secrets are never printed.
    List {
        /// Only list keys for this service.
        #[arg(long)]
        service: Option<String>,
    },

    /// Register a key.
    Add {
        /// Service provider name (e.g. openai, github).
        #[arg(long)]
        service: String,

        /// The API key or token.
        #[arg(long)]
        key: String,

        /// Comma-separated permission scopes.
        #[arg(long, value_delimiter = ',')]
        permissions: Vec<String>,

        /// Free-text description.
        #[arg(long)]
        description: Option<String>,
    },

    /// Remove a key by id.
    Remove {
        /// Key id as shown by `keys list`.
        id: String,
    },
}
