//! Credential vault for KeyGuard.
//!
//! This crate owns the three stateful pieces of the broker: the durable key
//! table, the access policy gate, and the in-memory session table.
//!
//! # Modules
//!
//! - [`store`]: JSON-backed key table with minimal-privilege selection.
//! - [`policy`]: Stateless access policy engine.
//! - [`session`]: Short-lived bearer tokens standing in for keys.
//! - [`error`]: Unified error types.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use keyguard_vault::{CredentialStore, KeyEntry, PolicyContext, PolicyEngine, SessionBroker};
//!
//! # fn example() -> keyguard_vault::Result<()> {
//! let mut store = CredentialStore::open("storage.json");
//! store.add(KeyEntry::new("github", "ghp_...", vec!["repo:read".into()]));
//!
//! let required = vec!["repo:read".to_string()];
//! let policy = PolicyEngine::default();
//! assert!(policy.can_access("github", &required, &PolicyContext::for_project("/srv/app")));
//!
//! let key = store.select_minimal("github", &required).expect("registered above");
//! let sessions = SessionBroker::new();
//! let token = sessions.issue(key, required.clone(), chrono::Duration::hours(1))?;
//! assert_eq!(sessions.resolve(&token)?.key_id, key.id);
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod policy;
pub mod session;
pub mod store;

// Re-export the most commonly used types at the crate root for convenience.
pub use error::{Result, VaultError};
pub use policy::{PolicyContext, PolicyDecision, PolicyEngine, PolicyRule, ProductionPathRule};
pub use session::{DEFAULT_SESSION_TTL_SECS, SessionBroker, SessionEntry};
pub use store::{CredentialStore, KeyEntry};
