//! Integration tests for the keyguard-vault crate.
//!
//! These tests exercise the key table against a real file on disk and the
//! full select → issue → resolve chain.

use chrono::{Duration, Utc};
use keyguard_vault::{
    CredentialStore, KeyEntry, PolicyContext, PolicyEngine, SessionBroker, VaultError,
};

fn perms(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

// ═══════════════════════════════════════════════════════════════════════
//  Persistence
// ═══════════════════════════════════════════════════════════════════════

#[test]
fn entries_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("storage.json");
    let expires = Utc::now() + Duration::hours(24);
    let expires = chrono::DateTime::from_timestamp_millis(expires.timestamp_millis()).unwrap();

    let original = KeyEntry::new("github", "ghp_abc", perms(&["repo:read", "issues:write"]))
        .with_description("ci bot")
        .with_expiry(expires);
    let plain = KeyEntry::new("openai", "sk-xyz", vec![]);

    {
        let mut store = CredentialStore::open(&path);
        store.add(original.clone());
        store.add(plain.clone());
    }

    let reopened = CredentialStore::open(&path);
    assert_eq!(reopened.len(), 2);
    assert_eq!(reopened.get(&original.id).unwrap(), &original);
    assert_eq!(reopened.get(&plain.id).unwrap(), &plain);

    // Insertion order is preserved.
    let ids: Vec<_> = reopened.list(None).iter().map(|k| k.id.clone()).collect();
    assert_eq!(ids, vec![original.id, plain.id]);
}

#[test]
fn removal_is_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("storage.json");

    let key = KeyEntry::new("vercel", "vc_1", perms(&["deploy"]));
    {
        let mut store = CredentialStore::open(&path);
        store.add(key.clone());
        store.remove(&key.id);
    }

    let reopened = CredentialStore::open(&path);
    assert!(reopened.is_empty());
}

#[test]
fn missing_file_opens_empty() {
    let dir = tempfile::tempdir().unwrap();
    let store = CredentialStore::open(dir.path().join("absent.json"));
    assert!(store.is_empty());
}

#[test]
fn corrupt_file_opens_empty_and_is_overwritten() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("storage.json");
    std::fs::write(&path, "{ not json").unwrap();

    let mut store = CredentialStore::open(&path);
    assert!(store.is_empty());

    store.add(KeyEntry::new("supabase", "sb_1", vec![]));
    let reopened = CredentialStore::open(&path);
    assert_eq!(reopened.len(), 1);
}

#[test]
fn parent_directories_are_created() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("deeper").join("storage.json");

    let mut store = CredentialStore::open(&path);
    store.add(KeyEntry::new("github", "ghp_1", vec![]));

    assert!(path.exists());
    assert!(store.save().is_ok());
}

#[test]
fn save_failure_keeps_memory_state() {
    let dir = tempfile::tempdir().unwrap();
    // A directory where the file should be makes every write fail.
    let path = dir.path().join("storage.json");
    std::fs::create_dir(&path).unwrap();

    let mut store = CredentialStore::open(&path);
    let key = KeyEntry::new("github", "ghp_1", vec![]);
    store.add(key.clone());

    assert_eq!(store.get(&key.id).unwrap().secret, "ghp_1");
    assert!(matches!(store.save(), Err(VaultError::PersistFailed { .. })));
}

#[test]
fn table_file_is_human_readable() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("storage.json");

    let mut store = CredentialStore::open(&path);
    store.add(KeyEntry::new("github", "ghp_1", perms(&["repo:read"])));

    let raw = std::fs::read_to_string(&path).unwrap();
    assert!(raw.contains('\n'));
    let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(value[0]["service"], "github");
    assert_eq!(value[0]["key"], "ghp_1");
    assert_eq!(value[0]["permissions"][0], "repo:read");
}

// ═══════════════════════════════════════════════════════════════════════
//  Select → issue → resolve
// ═══════════════════════════════════════════════════════════════════════

#[test]
fn github_end_to_end_with_zero_ttl() {
    let mut store = CredentialStore::in_memory();
    let key = KeyEntry::new("github", "ghp_k", perms(&["repo:read"]));
    store.add(key.clone());

    let required = perms(&["repo:read"]);
    let policy = PolicyEngine::default();
    assert!(policy.can_access("github", &required, &PolicyContext::for_project("/tmp/work")));

    let selected = store.select_minimal("github", &required).unwrap();
    assert_eq!(selected, &key);

    let sessions = SessionBroker::new();
    let issued_at = Utc::now();
    let token = sessions
        .issue_at(selected, required, Duration::zero(), issued_at)
        .unwrap();

    let after = issued_at + Duration::milliseconds(1);
    assert!(matches!(
        sessions.resolve_at(&token, after),
        Err(VaultError::SessionNotFound)
    ));
    assert!(matches!(
        sessions.resolve_at(&token, after),
        Err(VaultError::SessionNotFound)
    ));
}

#[test]
fn session_outlives_removed_key() {
    let mut store = CredentialStore::in_memory();
    let key = KeyEntry::new("openai", "sk-1", perms(&["chat"]));
    store.add(key.clone());

    let sessions = SessionBroker::new();
    let token = sessions
        .issue(&key, perms(&["chat"]), Duration::hours(1))
        .unwrap();

    store.remove(&key.id);

    let session = sessions.resolve(&token).unwrap();
    assert!(matches!(
        store.get(&session.key_id),
        Err(VaultError::KeyNotFound { .. })
    ));
}

#[test]
fn independent_brokers_do_not_share_sessions() {
    let key = KeyEntry::new("openai", "sk-1", vec![]);
    let a = SessionBroker::new();
    let b = SessionBroker::new();

    let token = a.issue(&key, vec![], Duration::hours(1)).unwrap();
    assert!(a.resolve(&token).is_ok());
    assert!(b.resolve(&token).is_err());

    // Clones share the same table.
    let a2 = a.clone();
    assert!(a2.resolve(&token).is_ok());
}
