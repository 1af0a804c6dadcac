//! JSON-backed credential table.
//!
//! The [`CredentialStore`] keeps every registered [`KeyEntry`] in memory, in
//! insertion order, and mirrors the whole table to a single JSON file after
//! each mutation.
//!
//! # Durable format
//!
//! The file holds a pretty-printed JSON array of camelCase records; the raw
//! secret lives under the `key` field:
//!
//! ```json
//! [
//!   {
//!     "id": "0192f5c1-...",
//!     "service": "github",
//!     "key": "ghp_...",
//!     "permissions": ["repo:read"],
//!     "description": "ci bot"
//!   }
//! ]
//! ```
//!
//! The table is read once by [`CredentialStore::open`]. A missing or
//! unreadable file yields an empty table; the failure is logged and never
//! aborts startup. Writes go to a sibling temp file which is then renamed
//! over the table, so a crash mid-write leaves the previous table intact.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, VaultError};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// One registered service credential.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyEntry {
    /// Opaque identifier assigned at registration.
    pub id: String,

    /// Case-sensitive provider name (e.g. "openai", "github").
    pub service: String,

    /// The raw credential value.
    #[serde(rename = "key")]
    pub secret: String,

    /// Scopes granted by this key.
    pub permissions: Vec<String>,

    /// Free-text annotation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Provider-side expiry, recorded for provisioned keys.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "chrono::serde::ts_milliseconds_option"
    )]
    pub expires_at: Option<DateTime<Utc>>,
}

impl KeyEntry {
    /// Build a new entry with a freshly generated id.
    pub fn new(
        service: impl Into<String>,
        secret: impl Into<String>,
        permissions: Vec<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            service: service.into(),
            secret: secret.into(),
            permissions,
            description: None,
            expires_at: None,
        }
    }

    /// Attach a description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Attach a provider-side expiry.
    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Whether this key grants every scope in `required`.
    pub fn grants(&self, required: &[String]) -> bool {
        required.iter().all(|p| self.permissions.contains(p))
    }

    /// Scopes in `requested` that this key does not grant.
    pub fn missing(&self, requested: &[String]) -> Vec<String> {
        requested
            .iter()
            .filter(|p| !self.permissions.contains(p))
            .cloned()
            .collect()
    }
}

impl std::fmt::Debug for KeyEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyEntry")
            .field("id", &self.id)
            .field("service", &self.service)
            .field("secret", &"[REDACTED]")
            .field("permissions", &self.permissions)
            .field("description", &self.description)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// CredentialStore
// ---------------------------------------------------------------------------

/// Ordered table of registered keys with write-through JSON persistence.
///
/// The store itself is not synchronized; callers sharing it across tasks wrap
/// it in a lock so that a selection and the session issued from it observe
/// the same snapshot.
#[derive(Debug, Default)]
pub struct CredentialStore {
    path: Option<PathBuf>,
    keys: Vec<KeyEntry>,
}

impl CredentialStore {
    /// Open the table stored at `path`.
    ///
    /// Never fails: a missing file starts an empty table, and an unreadable
    /// or corrupt one is logged and treated as empty.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let keys = match load_table(&path) {
            Ok(keys) => {
                tracing::info!(path = %path.display(), count = keys.len(), "key table loaded");
                keys
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to load key table, starting empty"
                );
                Vec::new()
            }
        };

        Self {
            path: Some(path),
            keys,
        }
    }

    /// A store with no backing file (useful for testing).
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Path of the backing file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Number of registered keys.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether no keys are registered.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    // -- Mutations ----------------------------------------------------------

    /// Append `entry` and persist the table.
    ///
    /// A failed write is logged; the in-memory table stays authoritative.
    pub fn add(&mut self, entry: KeyEntry) {
        tracing::info!(
            key_id = %entry.id,
            service = %entry.service,
            permissions = ?entry.permissions,
            "registered key"
        );
        self.keys.push(entry);
        self.persist();
    }

    /// Delete the entry with `id` (if present) and persist the table.
    pub fn remove(&mut self, id: &str) -> Option<KeyEntry> {
        let pos = self.keys.iter().position(|k| k.id == id);
        let removed = pos.map(|i| self.keys.remove(i));

        match &removed {
            Some(entry) => tracing::info!(key_id = %id, service = %entry.service, "removed key"),
            None => tracing::debug!(key_id = %id, "remove requested for unknown key"),
        }

        self.persist();
        removed
    }

    // -- Queries ------------------------------------------------------------

    /// All entries, or those whose service equals `service`, in insertion
    /// order.
    pub fn list(&self, service: Option<&str>) -> Vec<&KeyEntry> {
        self.keys
            .iter()
            .filter(|k| service.is_none_or(|s| k.service == s))
            .collect()
    }

    /// The entry with `id`.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::KeyNotFound`] if no such entry exists.
    pub fn get(&self, id: &str) -> Result<&KeyEntry> {
        self.keys
            .iter()
            .find(|k| k.id == id)
            .ok_or_else(|| VaultError::KeyNotFound { id: id.to_string() })
    }

    /// Distinct service names in first-registration order.
    pub fn services(&self) -> Vec<&str> {
        let mut seen: Vec<&str> = Vec::new();
        for key in &self.keys {
            if !seen.contains(&key.service.as_str()) {
                seen.push(&key.service);
            }
        }
        seen
    }

    /// Minimal-privilege selection.
    ///
    /// Among the keys for `service` that grant every scope in `required`,
    /// returns the one with the fewest permissions. Ties go to the earliest
    /// registered key. Returns `None` when nothing qualifies.
    pub fn select_minimal(&self, service: &str, required: &[String]) -> Option<&KeyEntry> {
        let mut best: Option<&KeyEntry> = None;

        for entry in self.keys.iter().filter(|k| k.service == service) {
            if !entry.grants(required) {
                continue;
            }
            if best.is_none_or(|b| entry.permissions.len() < b.permissions.len()) {
                best = Some(entry);
            }
        }

        tracing::debug!(
            service = service,
            required = ?required,
            selected = best.map(|k| k.id.as_str()),
            "minimal key selection"
        );

        best
    }

    /// The key for `service` with the most permissions, used as the master
    /// credential when provisioning narrower keys.
    pub fn select_broadest(&self, service: &str) -> Option<&KeyEntry> {
        let mut best: Option<&KeyEntry> = None;
        for entry in self.keys.iter().filter(|k| k.service == service) {
            if best.is_none_or(|b| entry.permissions.len() > b.permissions.len()) {
                best = Some(entry);
            }
        }
        best
    }

    // -- Persistence --------------------------------------------------------

    /// Write the full table to the backing file.
    ///
    /// No-op for in-memory stores.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::PersistFailed`] if the file cannot be written.
    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let persist_err = |reason: String| VaultError::PersistFailed {
            path: path.display().to_string(),
            reason,
        };

        let json = serde_json::to_string_pretty(&self.keys)?;

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| persist_err(e.to_string()))?;
        }

        let tmp = temp_path(path);
        std::fs::write(&tmp, json).map_err(|e| persist_err(e.to_string()))?;
        std::fs::rename(&tmp, path).map_err(|e| persist_err(e.to_string()))?;

        tracing::debug!(path = %path.display(), count = self.keys.len(), "key table saved");
        Ok(())
    }

    fn persist(&self) {
        if let Err(e) = self.save() {
            tracing::error!(error = %e, "key table not persisted; in-memory state kept");
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn load_table(path: &Path) -> Result<Vec<KeyEntry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let data = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&data)?)
}

fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "storage.json".into());
    path.with_file_name(format!(".{name}.tmp"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
