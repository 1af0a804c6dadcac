//! The caller-facing broker.
//!
//! [`KeyGuard`] composes the vault, the policy gate, the session table and
//! the forwarder into the operations exposed to agents. Every operation
//! returns a structured result; nothing here panics on caller input.
//!
//! # Locking
//!
//! The key table sits behind a `tokio::sync::RwLock`. Selection and the
//! session issued from it happen under one guard, so the session always names
//! a key that was present at selection time. The lock is never held across a
//! network call: forwarding and provisioning copy the secret out first.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};

use keyguard_provision::{
    Intent, IntentParser, OpenAiIntentParser, Provisioner, SkillGenerator, StubProvisioner,
};
use keyguard_proxy::{AuthRegistry, ProxyForwarder, ProxyRequest, ProxyResponse};
use keyguard_vault::session::fingerprint;
use keyguard_vault::{
    CredentialStore, KeyEntry, PolicyContext, PolicyEngine, SessionBroker, VaultError,
};

use crate::config::BrokerConfig;
use crate::error::{BrokerError, Result};

// ---------------------------------------------------------------------------
// Result types
// ---------------------------------------------------------------------------

/// Public view of a registered key. Never carries the secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeySummary {
    pub id: String,
    pub service: String,
    pub permissions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl From<&KeyEntry> for KeySummary {
    fn from(entry: &KeyEntry) -> Self {
        Self {
            id: entry.id.clone(),
            service: entry.service.clone(),
            permissions: entry.permissions.clone(),
            description: entry.description.clone(),
            expires_at: entry.expires_at,
        }
    }
}

/// A freshly issued proxy session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionGrant {
    pub token: String,
    pub key_id: String,
    pub service: String,
    pub permissions: Vec<String>,
    pub expires_at: DateTime<Utc>,
}

/// Everything smart provisioning produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionOutcome {
    pub intent: Intent,
    pub key: KeySummary,
    pub session: SessionGrant,
    pub skill_path: PathBuf,
}

// ---------------------------------------------------------------------------
// Smart provisioning collaborators
// ---------------------------------------------------------------------------

/// The pluggable pieces of the smart-provisioning flow.
#[derive(Clone)]
pub struct SmartProvisioning {
    parser: Arc<dyn IntentParser>,
    provisioner: Arc<dyn Provisioner>,
    skills: SkillGenerator,
}

impl SmartProvisioning {
    pub fn new(
        parser: impl IntentParser + 'static,
        provisioner: impl Provisioner + 'static,
        skills: SkillGenerator,
    ) -> Self {
        Self {
            parser: Arc::new(parser),
            provisioner: Arc::new(provisioner),
            skills,
        }
    }
}

// ---------------------------------------------------------------------------
// KeyGuard
// ---------------------------------------------------------------------------

/// The credential broker.
pub struct KeyGuard {
    store: RwLock<CredentialStore>,
    sessions: SessionBroker,
    policy: PolicyEngine,
    forwarder: ProxyForwarder,
    context: PolicyContext,
    session_ttl: Duration,
    provisioning: Option<SmartProvisioning>,
}

impl KeyGuard {
    /// A broker over `store` with the default policy, a one-hour session
    /// lifetime, and smart provisioning disabled.
    pub fn new(store: CredentialStore, forwarder: ProxyForwarder) -> Self {
        Self {
            store: RwLock::new(store),
            sessions: SessionBroker::new(),
            policy: PolicyEngine::default(),
            forwarder,
            context: PolicyContext::default(),
            session_ttl: Duration::seconds(keyguard_vault::DEFAULT_SESSION_TTL_SECS),
            provisioning: None,
        }
    }

    /// Build the broker described by `config`.
    pub fn from_config(config: &BrokerConfig) -> Result<Self> {
        let store = CredentialStore::open(&config.storage_path);
        let forwarder = ProxyForwarder::with_timeout(
            AuthRegistry::with_defaults(),
            std::time::Duration::from_secs(config.request_timeout_secs),
        )?;

        let session_ttl = i64::try_from(config.session_ttl_secs)
            .ok()
            .and_then(Duration::try_seconds)
            .ok_or_else(|| {
                BrokerError::Validation(format!(
                    "session_ttl_secs out of range: {}",
                    config.session_ttl_secs
                ))
            })?;

        let mut broker = Self::new(store, forwarder)
            .with_session_ttl(session_ttl)
            .with_context(PolicyContext {
                project_path: config.project_path(),
                ..PolicyContext::default()
            });

        if let Some(api_key) = &config.openai_api_key {
            let parser = OpenAiIntentParser::new(api_key.clone())?
                .with_base_url(config.openai_base_url.clone())
                .with_model(config.intent_model.clone());
            broker = broker.with_provisioning(SmartProvisioning::new(
                parser,
                StubProvisioner::new(),
                SkillGenerator::new(&config.skills_dir),
            ));
        }

        Ok(broker)
    }

    pub fn with_policy(mut self, policy: PolicyEngine) -> Self {
        self.policy = policy;
        self
    }

    /// Caller context handed to the policy engine.
    pub fn with_context(mut self, context: PolicyContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = ttl;
        self
    }

    pub fn with_provisioning(mut self, provisioning: SmartProvisioning) -> Self {
        self.provisioning = Some(provisioning);
        self
    }

    /// The session table, e.g. for spawning its reaper.
    pub fn sessions(&self) -> &SessionBroker {
        &self.sessions
    }

    // -- Key management -----------------------------------------------------

    /// Register a key.
    pub async fn register_key(
        &self,
        service: &str,
        secret: &str,
        permissions: Vec<String>,
        description: Option<String>,
    ) -> Result<KeySummary> {
        let service = service_name(service)?;
        if secret.trim().is_empty() {
            return Err(BrokerError::Validation("`key` must not be empty".into()));
        }

        let mut entry = KeyEntry::new(service, secret, permissions);
        if let Some(d) = description {
            entry = entry.with_description(d);
        }
        let summary = KeySummary::from(&entry);

        self.store.write().await.add(entry);
        Ok(summary)
    }

    /// Remove a key by id.
    pub async fn remove_key(&self, id: &str) -> Result<KeySummary> {
        let removed = self.store.write().await.remove(id);
        removed
            .as_ref()
            .map(KeySummary::from)
            .ok_or_else(|| BrokerError::KeyNotFound {
                key_id: id.to_string(),
            })
    }

    /// Registered keys, optionally for one service.
    pub async fn list_keys(&self, service: Option<&str>) -> Vec<KeySummary> {
        let store = self.store.read().await;
        store.list(service).into_iter().map(KeySummary::from).collect()
    }

    /// Distinct services with at least one registered key.
    pub async fn list_services(&self) -> Vec<String> {
        let store = self.store.read().await;
        store.services().into_iter().map(str::to_string).collect()
    }

    /// The minimal key for `service` granting `required`, policy-gated.
    pub async fn get_mapped_key(&self, service: &str, required: &[String]) -> Result<KeySummary> {
        let service = service_name(service)?;
        self.authorize("get_mapped_key", service, required)?;

        let store = self.store.read().await;
        store
            .select_minimal(service, required)
            .map(KeySummary::from)
            .ok_or_else(|| BrokerError::NoMatchingKey {
                service: service.to_string(),
                required: required.to_vec(),
            })
    }

    // -- Sessions and forwarding --------------------------------------------

    /// Select the minimal key for `required` and issue a session over it.
    pub async fn create_proxy_session(
        &self,
        service: &str,
        required: Vec<String>,
    ) -> Result<SessionGrant> {
        let service = service_name(service)?;
        self.authorize("create_proxy_session", service, &required)?;

        let store = self.store.read().await;
        let key = store
            .select_minimal(service, &required)
            .ok_or_else(|| BrokerError::NoMatchingKey {
                service: service.to_string(),
                required: required.clone(),
            })?;

        self.issue_session(key, required)
    }

    /// Forward `request` using the key behind `token`.
    pub async fn proxy_request(&self, token: &str, request: ProxyRequest) -> Result<ProxyResponse> {
        let session = self.sessions.resolve(token).map_err(|e| match e {
            VaultError::SessionNotFound => BrokerError::SessionNotFound,
            other => other.into(),
        })?;

        let secret = {
            let store = self.store.read().await;
            match store.get(&session.key_id) {
                Ok(key) => key.secret.clone(),
                Err(_) => {
                    warn!(
                        token = %fingerprint(token),
                        key_id = %session.key_id,
                        "session outlived its key"
                    );
                    return Err(BrokerError::KeyNotFound {
                        key_id: session.key_id,
                    });
                }
            }
        };

        let response = self
            .forwarder
            .forward(&session.service, &secret, &request)
            .await?;

        info!(
            token = %fingerprint(token),
            service = %session.service,
            method = %request.method,
            status = response.status,
            "proxied request"
        );
        Ok(response)
    }

    // -- Smart provisioning -------------------------------------------------

    /// Turn a prose request into a restricted key, a session for it, and a
    /// skill document describing how to use the session.
    ///
    /// The master key is `master_key_id` when given, otherwise the key for
    /// the parsed service with the most permissions.
    pub async fn smart_provision(
        &self,
        prompt: &str,
        master_key_id: Option<&str>,
    ) -> Result<ProvisionOutcome> {
        let provisioning = self
            .provisioning
            .as_ref()
            .ok_or(BrokerError::ProvisioningDisabled)?;

        let intent = provisioning.parser.parse(prompt).await?;
        self.authorize("smart_provision", &intent.service, &intent.permissions)?;

        let master_secret = {
            let store = self.store.read().await;
            let master = match master_key_id {
                Some(id) => store.get(id).map_err(|_| BrokerError::KeyNotFound {
                    key_id: id.to_string(),
                })?,
                None => store.select_broadest(&intent.service).ok_or_else(|| {
                    BrokerError::NoMatchingKey {
                        service: intent.service.clone(),
                        required: intent.permissions.clone(),
                    }
                })?,
            };
            if master.service != intent.service {
                return Err(BrokerError::Validation(format!(
                    "master key {} belongs to `{}`, not `{}`",
                    master.id, master.service, intent.service
                )));
            }
            master.secret.clone()
        };

        let provisioned = provisioning
            .provisioner
            .provision(&intent, &master_secret)
            .await?;

        let mut entry = KeyEntry::new(
            provisioned.service.clone(),
            provisioned.secret.clone(),
            provisioned.permissions.clone(),
        )
        .with_description(format!("provisioned for {}", intent.action));
        if let Some(expires_at) = provisioned.expires_at {
            entry = entry.with_expiry(expires_at);
        }
        let key = KeySummary::from(&entry);

        let session = {
            let mut store = self.store.write().await;
            let session = self.issue_session(&entry, entry.permissions.clone())?;
            store.add(entry);
            session
        };

        let document =
            SkillGenerator::generate(&provisioned, &intent.action, intent.resource.as_deref());
        let document = SkillGenerator::bind_session(&document, &session.token);
        let name = SkillGenerator::skill_name(&provisioned.service, &intent.action);
        let skill_path = match provisioning.skills.save(&document, &name) {
            Ok(path) => path,
            Err(e) => {
                self.sessions.revoke(&session.token);
                self.store.write().await.remove(&key.id);
                warn!(
                    key_id = %key.id,
                    error = %e,
                    "skill write failed, provisioned key withdrawn"
                );
                return Err(e.into());
            }
        };

        info!(
            service = %intent.service,
            action = %intent.action,
            key_id = %key.id,
            skill = %skill_path.display(),
            "smart provisioning complete"
        );

        Ok(ProvisionOutcome {
            intent,
            key,
            session,
            skill_path,
        })
    }

    // -- Helpers ------------------------------------------------------------

    fn authorize(&self, operation: &str, service: &str, permissions: &[String]) -> Result<()> {
        let context = self.context.clone().with_operation(operation);
        if self.policy.can_access(service, permissions, &context) {
            Ok(())
        } else {
            Err(BrokerError::PolicyDenied {
                service: service.to_string(),
            })
        }
    }

    fn issue_session(&self, key: &KeyEntry, permissions: Vec<String>) -> Result<SessionGrant> {
        let session = self.sessions.grant(key, permissions, self.session_ttl)?;
        Ok(SessionGrant {
            token: session.token,
            key_id: session.key_id,
            service: session.service,
            permissions: session.permissions,
            expires_at: session.expires_at,
        })
    }
}

fn service_name(service: &str) -> Result<&str> {
    let trimmed = service.trim();
    if trimmed.is_empty() {
        Err(BrokerError::Validation("`service` must not be empty".into()))
    } else {
        Ok(trimmed)
    }
}
