//! Ephemeral session tokens.
//!
//! A session token stands in for a registered key: callers hold the token,
//! never the secret. The [`SessionBroker`] maps each token to a
//! [`SessionEntry`] naming the backing key, the declared scopes, and an
//! absolute expiry.
//!
//! Sessions live only in memory; a restart invalidates all of them. Expiry is
//! enforced lazily on [`SessionBroker::resolve`], and a background reaper
//! ([`SessionBroker::spawn_reaper`]) periodically drops sessions that expired
//! without ever being read again.
//!
//! The broker is cheaply cloneable (`Arc`-backed) and `Send + Sync`.

use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};

use crate::error::{Result, VaultError};
use crate::store::KeyEntry;

/// Lifetime of a session, in seconds, when the caller does not specify one.
pub const DEFAULT_SESSION_TTL_SECS: i64 = 3600;

/// Prefix identifying KeyGuard session tokens.
const TOKEN_PREFIX: &str = "kgs_";

/// Random bytes per token (256 bits).
const TOKEN_ENTROPY_BYTES: usize = 32;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A live capability grant.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEntry {
    /// The bearer token.
    pub token: String,

    /// Id of the backing [`KeyEntry`].
    pub key_id: String,

    /// Service of the backing key, copied at issuance.
    pub service: String,

    /// Scopes the session was issued for.
    pub permissions: Vec<String>,

    /// When the session was issued.
    pub issued_at: DateTime<Utc>,

    /// After this instant the session no longer resolves.
    pub expires_at: DateTime<Utc>,
}

impl SessionEntry {
    /// Whether the session has expired as of `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

impl std::fmt::Debug for SessionEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionEntry")
            .field("token", &fingerprint(&self.token))
            .field("key_id", &self.key_id)
            .field("service", &self.service)
            .field("permissions", &self.permissions)
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// SessionBroker
// ---------------------------------------------------------------------------

/// In-memory token table.
#[derive(Clone, Default)]
pub struct SessionBroker {
    sessions: Arc<DashMap<String, SessionEntry>>,
}

impl SessionBroker {
    /// Create an empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of sessions currently held, expired or not.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Issue a session for `key` valid for `ttl` from now.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::PermissionsExceedKey`] if `permissions` names a
    /// scope the key does not grant.
    pub fn issue(&self, key: &KeyEntry, permissions: Vec<String>, ttl: Duration) -> Result<String> {
        self.issue_at(key, permissions, ttl, Utc::now())
    }

    /// [`issue`](Self::issue) with an explicit issuing instant.
    pub fn issue_at(
        &self,
        key: &KeyEntry,
        permissions: Vec<String>,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<String> {
        self.grant_at(key, permissions, ttl, now).map(|s| s.token)
    }

    /// Like [`issue`](Self::issue), returning the whole entry.
    pub fn grant(
        &self,
        key: &KeyEntry,
        permissions: Vec<String>,
        ttl: Duration,
    ) -> Result<SessionEntry> {
        self.grant_at(key, permissions, ttl, Utc::now())
    }

    /// [`grant`](Self::grant) with an explicit issuing instant.
    pub fn grant_at(
        &self,
        key: &KeyEntry,
        permissions: Vec<String>,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<SessionEntry> {
        let missing = key.missing(&permissions);
        if !missing.is_empty() {
            return Err(VaultError::PermissionsExceedKey {
                key_id: key.id.clone(),
                missing,
            });
        }

        let expires_at = now
            .checked_add_signed(ttl)
            .ok_or(VaultError::TtlOutOfRange {
                ttl_secs: ttl.num_seconds(),
            })?;

        let token = generate_token()?;
        let entry = SessionEntry {
            token: token.clone(),
            key_id: key.id.clone(),
            service: key.service.clone(),
            permissions,
            issued_at: now,
            expires_at,
        };

        tracing::info!(
            session = %fingerprint(&token),
            key_id = %entry.key_id,
            service = %entry.service,
            expires_at = %entry.expires_at,
            "session issued"
        );

        self.sessions.insert(token, entry.clone());
        Ok(entry)
    }

    /// Drop a session before it expires. Returns whether it existed.
    pub fn revoke(&self, token: &str) -> bool {
        let removed = self.sessions.remove(token).is_some();
        if removed {
            tracing::info!(session = %fingerprint(token), "session revoked");
        }
        removed
    }

    /// Look up a live session.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::SessionNotFound`] if the token is unknown or has
    /// expired. An expired session is removed by this call.
    pub fn resolve(&self, token: &str) -> Result<SessionEntry> {
        self.resolve_at(token, Utc::now())
    }

    /// [`resolve`](Self::resolve) as of an explicit instant.
    pub fn resolve_at(&self, token: &str, now: DateTime<Utc>) -> Result<SessionEntry> {
        let entry = self
            .sessions
            .get(token)
            .map(|s| s.value().clone())
            .ok_or(VaultError::SessionNotFound)?;

        if entry.is_expired_at(now) {
            self.sessions.remove(token);
            tracing::debug!(session = %fingerprint(token), "session expired on access");
            return Err(VaultError::SessionNotFound);
        }

        Ok(entry)
    }

    /// Drop every session expired as of now. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(Utc::now())
    }

    /// [`purge_expired`](Self::purge_expired) as of an explicit instant.
    pub fn purge_expired_at(&self, now: DateTime<Utc>) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, s| !s.is_expired_at(now));
        before.saturating_sub(self.sessions.len())
    }

    /// Spawn a tokio task that purges expired sessions every `interval`.
    ///
    /// The task runs until the returned handle is aborted or the runtime
    /// shuts down.
    pub fn spawn_reaper(&self, interval: std::time::Duration) -> tokio::task::JoinHandle<()> {
        let broker = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let purged = broker.purge_expired();
                if purged > 0 {
                    tracing::debug!(purged, remaining = broker.len(), "reaped expired sessions");
                }
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn generate_token() -> Result<String> {
    let mut bytes = [0u8; TOKEN_ENTROPY_BYTES];
    SystemRandom::new()
        .fill(&mut bytes)
        .map_err(|_| VaultError::TokenGeneration)?;
    Ok(format!("{TOKEN_PREFIX}{}", URL_SAFE_NO_PAD.encode(bytes)))
}

/// Short, log-safe prefix of a token.
pub fn fingerprint(token: &str) -> String {
    let end = token
        .char_indices()
        .nth(TOKEN_PREFIX.len() + 6)
        .map(|(i, _)| i)
        .unwrap_or(token.len());
    format!("{}…", &token[..end])
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn ttl() -> Duration {
        Duration::seconds(DEFAULT_SESSION_TTL_SECS)
    }

    fn key(list: &[&str]) -> KeyEntry {
        KeyEntry::new(
            "github",
            "ghp_secret",
            list.iter().map(|s| s.to_string()).collect(),
        )
    }

    fn perms(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn overflowing_ttl_is_an_error() {
        let broker = SessionBroker::new();
        let huge = Duration::try_seconds(10_000_000_000_000).unwrap();

        let err = broker
            .grant(&key(&["repo:read"]), perms(&["repo:read"]), huge)
            .unwrap_err();
        assert!(matches!(err, VaultError::TtlOutOfRange { .. }));
        assert!(broker.is_empty());
    }

    #[test]
    fn revoke_removes_session() {
        let broker = SessionBroker::new();
        let token = broker
            .issue(&key(&["repo:read"]), perms(&["repo:read"]), ttl())
            .unwrap();

        assert!(broker.revoke(&token));
        assert!(!broker.revoke(&token));
        assert!(matches!(
            broker.resolve(&token),
            Err(VaultError::SessionNotFound)
        ));
    }

    #[test]
    fn resolves_what_was_issued() {
        let broker = SessionBroker::new();
        let k = key(&["repo:read", "repo:write"]);
        let now = Utc::now();

        let token = broker
            .issue_at(&k, perms(&["repo:read"]), ttl(), now)
            .unwrap();
        let session = broker.resolve_at(&token, now + Duration::minutes(59)).unwrap();

        assert_eq!(session.key_id, k.id);
        assert_eq!(session.service, "github");
        assert_eq!(session.permissions, perms(&["repo:read"]));
        assert_eq!(session.expires_at, now + ttl());
    }

    #[test]
    fn repeated_resolution_while_valid() {
        let broker = SessionBroker::new();
        let token = broker.issue(&key(&[]), vec![], ttl()).unwrap();

        assert!(broker.resolve(&token).is_ok());
        assert!(broker.resolve(&token).is_ok());
    }

    #[test]
    fn boundary_instant_is_still_valid() {
        let broker = SessionBroker::new();
        let now = Utc::now();
        let token = broker
            .issue_at(&key(&[]), vec![], Duration::seconds(10), now)
            .unwrap();

        assert!(broker.resolve_at(&token, now + Duration::seconds(10)).is_ok());
    }

    #[test]
    fn expired_session_is_removed_and_stays_gone() {
        let broker = SessionBroker::new();
        let now = Utc::now();
        let token = broker
            .issue_at(&key(&[]), vec![], Duration::seconds(10), now)
            .unwrap();

        let later = now + Duration::seconds(11);
        assert!(matches!(
            broker.resolve_at(&token, later),
            Err(VaultError::SessionNotFound)
        ));
        assert!(broker.is_empty());
        // No resurrection, even for an earlier instant.
        assert!(matches!(
            broker.resolve_at(&token, now),
            Err(VaultError::SessionNotFound)
        ));
    }

    #[test]
    fn zero_ttl_expires_immediately_after_issue() {
        let broker = SessionBroker::new();
        let now = Utc::now();
        let token = broker
            .issue_at(&key(&[]), vec![], Duration::zero(), now)
            .unwrap();

        assert!(
            broker
                .resolve_at(&token, now + Duration::nanoseconds(1))
                .is_err()
        );
    }

    #[test]
    fn grant_returns_stored_entry() {
        let broker = SessionBroker::new();
        let now = Utc::now();
        let k = key(&["repo:read"]);
        let granted = broker
            .grant_at(&k, perms(&["repo:read"]), Duration::zero(), now)
            .unwrap();

        assert_eq!(granted.expires_at, now);
        assert_eq!(broker.resolve_at(&granted.token, now).unwrap(), granted);
    }

    #[test]
    fn unknown_token_not_found() {
        let broker = SessionBroker::new();
        assert!(matches!(
            broker.resolve("kgs_nope"),
            Err(VaultError::SessionNotFound)
        ));
    }

    #[test]
    fn declared_permissions_must_be_granted_by_key() {
        let broker = SessionBroker::new();
        let k = key(&["repo:read"]);

        let err = broker
            .issue(&k, perms(&["repo:read", "repo:admin"]), ttl())
            .unwrap_err();
        match err {
            VaultError::PermissionsExceedKey { key_id, missing } => {
                assert_eq!(key_id, k.id);
                assert_eq!(missing, perms(&["repo:admin"]));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(broker.is_empty());
    }

    #[test]
    fn tokens_are_unique_and_prefixed() {
        let broker = SessionBroker::new();
        let k = key(&[]);
        let a = broker.issue(&k, vec![], ttl()).unwrap();
        let b = broker.issue(&k, vec![], ttl()).unwrap();

        assert_ne!(a, b);
        assert!(a.starts_with(TOKEN_PREFIX));
        // 32 bytes, base64 without padding.
        assert_eq!(a.len(), TOKEN_PREFIX.len() + 43);
    }

    #[test]
    fn purge_drops_only_expired() {
        let broker = SessionBroker::new();
        let now = Utc::now();
        let k = key(&[]);
        broker.issue_at(&k, vec![], Duration::seconds(1), now).unwrap();
        let keep = broker.issue_at(&k, vec![], Duration::hours(1), now).unwrap();

        assert_eq!(broker.purge_expired_at(now + Duration::seconds(5)), 1);
        assert_eq!(broker.len(), 1);
        assert!(broker.resolve_at(&keep, now + Duration::seconds(5)).is_ok());
    }

    #[test]
    fn fingerprint_hides_token_body() {
        let token = "kgs_abcdefghijklmnop";
        assert_eq!(fingerprint(token), "kgs_abcdef…");
        assert_eq!(fingerprint("kgs"), "kgs…");
    }

    #[tokio::test]
    async fn reaper_purges_in_background() {
        let broker = SessionBroker::new();
        broker
            .issue_at(&key(&[]), vec![], Duration::zero(), Utc::now() - Duration::seconds(1))
            .unwrap();
        assert_eq!(broker.len(), 1);

        let handle = broker.spawn_reaper(std::time::Duration::from_millis(10));
        for _ in 0..50 {
            if broker.is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        handle.abort();

        assert!(broker.is_empty());
    }
}
