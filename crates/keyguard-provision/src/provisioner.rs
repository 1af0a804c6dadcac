//! Restricted key minting.
//!
//! A [`Provisioner`] takes a parsed [`Intent`] and a broad master secret and
//! returns a newly minted, narrower credential. [`StubProvisioner`] stands in
//! for the provider admin APIs: it recognises cloudflare, vercel and supabase
//! and returns a locally generated token valid for 24 hours.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{ProvisionError, Result};
use crate::intent::Intent;

/// Lifetime of keys minted by [`StubProvisioner`].
pub const STUB_KEY_LIFETIME_HOURS: i64 = 24;

const SUFFIX_LEN: usize = 12;
const SUFFIX_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A credential minted for one intent.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionedKey {
    /// Provider the key belongs to.
    pub service: String,

    /// The minted secret.
    #[serde(rename = "key")]
    pub secret: String,

    /// Scopes the key grants.
    pub permissions: Vec<String>,

    /// Provider-side expiry, if any.
    #[serde(
        default,
        with = "chrono::serde::ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub expires_at: Option<DateTime<Utc>>,
}

impl std::fmt::Debug for ProvisionedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvisionedKey")
            .field("service", &self.service)
            .field("secret", &"<redacted>")
            .field("permissions", &self.permissions)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Mints restricted credentials.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Mint a key for `intent`, authorised by `master_secret`.
    async fn provision(&self, intent: &Intent, master_secret: &str) -> Result<ProvisionedKey>;
}

// ---------------------------------------------------------------------------
// Stub provisioner
// ---------------------------------------------------------------------------

/// Offline provisioner that fabricates provider-shaped tokens.
pub struct StubProvisioner {
    rng: SystemRandom,
    lifetime: Duration,
}

impl Default for StubProvisioner {
    fn default() -> Self {
        Self {
            rng: SystemRandom::new(),
            lifetime: Duration::hours(STUB_KEY_LIFETIME_HOURS),
        }
    }
}

impl StubProvisioner {
    /// Create a stub provisioner with the default key lifetime.
    pub fn new() -> Self {
        Self::default()
    }

    /// Token prefix for a supported service.
    fn prefix(service: &str) -> Option<&'static str> {
        match service {
            "cloudflare" => Some("cf_restricted_"),
            "vercel" => Some("vc_restricted_"),
            "supabase" => Some("sb_restricted_"),
            _ => None,
        }
    }

    fn random_suffix(&self) -> Result<String> {
        let mut bytes = [0u8; SUFFIX_LEN];
        self.rng
            .fill(&mut bytes)
            .map_err(|_| ProvisionError::TokenGeneration)?;
        Ok(bytes
            .iter()
            .map(|b| SUFFIX_ALPHABET[usize::from(*b) % SUFFIX_ALPHABET.len()] as char)
            .collect())
    }
}

#[async_trait]
impl Provisioner for StubProvisioner {
    async fn provision(&self, intent: &Intent, _master_secret: &str) -> Result<ProvisionedKey> {
        let prefix =
            Self::prefix(&intent.service).ok_or_else(|| ProvisionError::UnsupportedService {
                service: intent.service.clone(),
            })?;

        info!(service = %intent.service, action = %intent.action, "provisioning restricted key");

        Ok(ProvisionedKey {
            service: intent.service.clone(),
            secret: format!("{prefix}{}", self.random_suffix()?),
            permissions: intent.permissions.clone(),
            expires_at: Some(Utc::now() + self.lifetime),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
