//! Vault error types.
//!
//! Every public API in this crate reports failures through [`VaultError`].
//! Variants carry the identifiers involved so callers can branch on the
//! failure kind without parsing messages.

/// Unified error type for the KeyGuard vault.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    // -- Store errors -------------------------------------------------------
    /// No key with the given id is registered.
    #[error("key not found: id={id}")]
    KeyNotFound { id: String },

    /// The durable key table could not be written.
    #[error("failed to persist key table to {path}: {reason}")]
    PersistFailed { path: String, reason: String },

    // -- Session errors -----------------------------------------------------
    /// The session token is unknown or has expired.
    #[error("session not found or expired")]
    SessionNotFound,

    /// A session was requested with scopes the backing key does not grant.
    #[error("declared permissions exceed key {key_id}: missing {missing:?}")]
    PermissionsExceedKey { key_id: String, missing: Vec<String> },

    /// The session lifetime pushes expiry past the representable range.
    #[error("session lifetime out of range: {ttl_secs}s")]
    TtlOutOfRange { ttl_secs: i64 },

    /// The system random source failed while minting a token.
    #[error("token generation failed")]
    TokenGeneration,

    // -- Underlying errors --------------------------------------------------
    /// JSON serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error from the filesystem.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout the vault crate.
pub type Result<T> = std::result::Result<T, VaultError>;
