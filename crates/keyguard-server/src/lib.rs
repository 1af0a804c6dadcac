//! KeyGuard credential broker.
//!
//! Agents never hold raw API keys. They ask KeyGuard for access to a service
//! with a set of permission scopes; KeyGuard checks policy, picks the
//! least-privileged registered key that satisfies the request, and hands back
//! a short-lived session token. Requests made through that token are
//! forwarded with the real key injected.
//!
//! - [`service`]: the [`KeyGuard`] facade implementing every operation.
//! - [`mcp`]: JSON-RPC/MCP dispatcher over stdio.
//! - [`config`]: file + environment configuration.
//! - [`error`]: broker and configuration errors.

pub mod config;
pub mod error;
pub mod mcp;
pub mod service;

pub use config::BrokerConfig;
pub use error::{BrokerError, ConfigError, Result};
pub use mcp::McpServer;
pub use service::{KeyGuard, KeySummary, ProvisionOutcome, SessionGrant, SmartProvisioning};
