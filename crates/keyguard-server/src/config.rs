//! Broker configuration.
//!
//! Settings come from three layers, later ones winning:
//!
//! 1. built-in defaults,
//! 2. an optional TOML file (`keyguard.toml` unless `--config` names another),
//! 3. environment variables (a `.env` file is loaded into the environment at
//!    startup).
//!
//! A missing file is not an error. A file that exists but does not parse is.

use std::path::{Path, PathBuf};

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use keyguard_provision::{DEFAULT_INTENT_MODEL, DEFAULT_OPENAI_BASE_URL, DEFAULT_SKILLS_DIR};
use keyguard_proxy::DEFAULT_TIMEOUT_SECS;
use keyguard_vault::DEFAULT_SESSION_TTL_SECS;

use crate::error::ConfigError;

/// Config file read when none is given on the command line.
pub const DEFAULT_CONFIG_FILE: &str = "keyguard.toml";

/// Default durable key table location.
pub const DEFAULT_STORAGE_PATH: &str = "storage.json";

/// Default session reaper period.
pub const DEFAULT_REAPER_INTERVAL_SECS: u64 = 60;

/// Runtime settings for the broker.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Durable key table.
    pub storage_path: PathBuf,

    /// Lifetime of issued proxy sessions.
    pub session_ttl_secs: u64,

    /// How often expired sessions are swept.
    pub reaper_interval_secs: u64,

    /// Timeout for forwarded upstream requests.
    pub request_timeout_secs: u64,

    /// Where smart provisioning writes skill documents.
    pub skills_dir: PathBuf,

    /// Project path handed to the policy engine. Defaults to the process
    /// working directory.
    pub project_path: Option<String>,

    /// Model used for intent extraction.
    pub intent_model: String,

    /// Chat-completions API root for intent extraction.
    pub openai_base_url: String,

    /// Model API key. Smart provisioning is disabled without one.
    #[serde(skip_serializing)]
    pub openai_api_key: Option<String>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            storage_path: PathBuf::from(DEFAULT_STORAGE_PATH),
            session_ttl_secs: DEFAULT_SESSION_TTL_SECS.unsigned_abs(),
            reaper_interval_secs: DEFAULT_REAPER_INTERVAL_SECS,
            request_timeout_secs: DEFAULT_TIMEOUT_SECS,
            skills_dir: PathBuf::from(DEFAULT_SKILLS_DIR),
            project_path: None,
            intent_model: DEFAULT_INTENT_MODEL.to_string(),
            openai_base_url: DEFAULT_OPENAI_BASE_URL.to_string(),
            openai_api_key: None,
        }
    }
}

impl std::fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("storage_path", &self.storage_path)
            .field("session_ttl_secs", &self.session_ttl_secs)
            .field("reaper_interval_secs", &self.reaper_interval_secs)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("skills_dir", &self.skills_dir)
            .field("project_path", &self.project_path)
            .field("intent_model", &self.intent_model)
            .field("openai_base_url", &self.openai_base_url)
            .field(
                "openai_api_key",
                &self.openai_api_key.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

impl BrokerConfig {
    /// Load from `path` (or [`DEFAULT_CONFIG_FILE`]) and the process
    /// environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));
        let mut config = Self::from_file(path)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        info!(
            storage = %config.storage_path.display(),
            session_ttl_secs = config.session_ttl_secs,
            smart_provisioning = config.openai_api_key.is_some(),
            "configuration loaded"
        );
        Ok(config)
    }

    /// Read a TOML file. A missing file yields the defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };

        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Override settings from variables returned by `lookup`.
    ///
    /// Empty values are ignored.
    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = var("KEYGUARD_STORAGE_PATH") {
            self.storage_path = PathBuf::from(v);
        }
        if let Some(v) = var("KEYGUARD_SESSION_TTL_SECS") {
            self.session_ttl_secs = parse_secs("KEYGUARD_SESSION_TTL_SECS", &v)?;
        }
        if let Some(v) = var("KEYGUARD_REAPER_INTERVAL_SECS") {
            self.reaper_interval_secs = parse_secs("KEYGUARD_REAPER_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = var("KEYGUARD_REQUEST_TIMEOUT_SECS") {
            self.request_timeout_secs = parse_secs("KEYGUARD_REQUEST_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = var("KEYGUARD_SKILLS_DIR") {
            self.skills_dir = PathBuf::from(v);
        }
        if let Some(v) = var("KEYGUARD_PROJECT_PATH") {
            self.project_path = Some(v);
        }
        if let Some(v) = var("KEYGUARD_INTENT_MODEL") {
            self.intent_model = v;
        }
        if let Some(v) = var("OPENAI_BASE_URL") {
            self.openai_base_url = v;
        }
        if let Some(v) = var("OPENAI_API_KEY") {
            self.openai_api_key = Some(v);
        }
        Ok(())
    }

    /// Reject settings the runtime cannot honour.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.reaper_interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "reaper_interval_secs".into(),
                value: "0".into(),
            });
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "request_timeout_secs".into(),
                value: "0".into(),
            });
        }
        let ttl_fits = i64::try_from(self.session_ttl_secs)
            .ok()
            .and_then(Duration::try_seconds)
            .and_then(|ttl| Utc::now().checked_add_signed(ttl))
            .is_some();
        if !ttl_fits {
            return Err(ConfigError::InvalidValue {
                key: "session_ttl_secs".into(),
                value: self.session_ttl_secs.to_string(),
            });
        }
        Ok(())
    }

    /// Project path for policy decisions.
    pub fn project_path(&self) -> Option<String> {
        self.project_path.clone().or_else(|| {
            std::env::current_dir()
                .ok()
                .map(|p| p.display().to_string())
        })
    }
}

fn parse_secs(key: &str, value: &str) -> Result<u64, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
