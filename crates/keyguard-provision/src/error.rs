//! Provisioning error types.
//!
//! Intent parsing, key minting and skill output all surface failures
//! through [`ProvisionError`].

use std::path::PathBuf;

/// Unified error type for the provisioning collaborators.
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    // -- Intent parsing -----------------------------------------------------
    /// The natural-language request was blank.
    #[error("provisioning prompt is empty")]
    EmptyPrompt,

    /// The model answered with nothing usable.
    #[error("empty/invalid model response: {reason}")]
    InvalidModelResponse { reason: String },

    /// The model endpoint answered with a non-success status.
    #[error("model endpoint returned HTTP {status}: {body}")]
    Upstream { status: u16, body: String },

    /// The model API key cannot be carried in an HTTP header.
    #[error("model API key is not a valid header value")]
    InvalidApiKey,

    // -- Provisioning -------------------------------------------------------
    /// No provisioner exists for the service.
    #[error("unsupported service: {service}")]
    UnsupportedService { service: String },

    /// The system random source failed.
    #[error("failed to generate provisioned token")]
    TokenGeneration,

    // -- Skill output -------------------------------------------------------
    /// The skill document could not be written.
    #[error("failed to write skill to {path}: {source}")]
    SkillWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // -- Upstream crate errors ----------------------------------------------
    /// HTTP client failure.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization or deserialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenience alias used throughout the provisioning crate.
pub type Result<T> = std::result::Result<T, ProvisionError>;
