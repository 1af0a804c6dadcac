//! Broker error types.
//!
//! [`BrokerError`] is what every caller-facing operation returns. Its
//! [`kind`](BrokerError::kind) is a stable string that separates policy
//! denials from lookup misses from malformed input.

use std::path::PathBuf;

use keyguard_provision::ProvisionError;
use keyguard_proxy::ProxyError;
use keyguard_vault::VaultError;

/// Unified error type for caller-facing broker operations.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// Malformed caller input; nothing was changed.
    #[error("invalid request: {0}")]
    Validation(String),

    /// The request is well-formed but the policy engine refused it.
    #[error("access denied by KeyGuard policy engine for service `{service}`")]
    PolicyDenied { service: String },

    /// No registered key for the service grants the requested scopes.
    #[error("no suitable key found for `{service}` with permissions {required:?}")]
    NoMatchingKey {
        service: String,
        required: Vec<String>,
    },

    /// The session token is unknown or expired.
    #[error("session not found or expired")]
    SessionNotFound,

    /// A referenced key does not exist, or was removed after a session for
    /// it was issued.
    #[error("associated key not found: {key_id}")]
    KeyNotFound { key_id: String },

    /// Smart provisioning needs a model API key that is not configured.
    #[error("smart provisioning is disabled: no OPENAI_API_KEY configured")]
    ProvisioningDisabled,

    // -- Upstream crate errors ----------------------------------------------
    /// An error propagated from the vault crate.
    #[error(transparent)]
    Vault(#[from] VaultError),

    /// An error propagated from the proxy crate.
    #[error(transparent)]
    Proxy(#[from] ProxyError),

    /// An error propagated from the provisioning crate.
    #[error(transparent)]
    Provision(#[from] ProvisionError),
}

impl BrokerError {
    /// Stable machine-readable category.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::PolicyDenied { .. } => "policy_denied",
            Self::NoMatchingKey { .. } | Self::SessionNotFound | Self::KeyNotFound { .. } => {
                "not_found"
            }
            Self::ProvisioningDisabled => "unavailable",
            Self::Vault(e) => match e {
                VaultError::KeyNotFound { .. } | VaultError::SessionNotFound => "not_found",
                VaultError::PermissionsExceedKey { .. } | VaultError::TtlOutOfRange { .. } => {
                    "validation"
                }
                _ => "internal",
            },
            Self::Proxy(e) => match e {
                ProxyError::UnsupportedService { .. }
                | ProxyError::InvalidMethod { .. }
                | ProxyError::InvalidUrl { .. }
                | ProxyError::InvalidHeader { .. } => "validation",
                _ => "internal",
            },
            Self::Provision(e) => match e {
                ProvisionError::EmptyPrompt | ProvisionError::UnsupportedService { .. } => {
                    "validation"
                }
                ProvisionError::InvalidModelResponse { .. }
                | ProvisionError::Upstream { .. }
                | ProvisionError::Http(_) => "upstream",
                _ => "internal",
            },
        }
    }
}

/// Convenience alias for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Configuration loading failures. These abort startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The config file exists but could not be read.
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid TOML for [`BrokerConfig`].
    ///
    /// [`BrokerConfig`]: crate::config::BrokerConfig
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    /// A setting has an unusable value.
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
