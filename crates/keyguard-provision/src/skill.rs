//! Skill document generation.
//!
//! A skill is a short markdown file telling an agent what it may do with a
//! provisioned credential and which session token to pass to `proxy_request`.
//! The document is rendered with a `{{SESSION_TOKEN}}` placeholder; the
//! caller binds the real token once a session exists.

use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::{ProvisionError, Result};
use crate::provisioner::ProvisionedKey;

/// Placeholder replaced by the session token.
pub const SESSION_TOKEN_PLACEHOLDER: &str = "{{SESSION_TOKEN}}";

/// Default output directory.
pub const DEFAULT_SKILLS_DIR: &str = "skills";

/// Renders and stores skill documents.
#[derive(Debug, Clone)]
pub struct SkillGenerator {
    output_dir: PathBuf,
}

impl Default for SkillGenerator {
    fn default() -> Self {
        Self::new(DEFAULT_SKILLS_DIR)
    }
}

impl SkillGenerator {
    /// Write skills under `output_dir`.
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    /// Where skills are written.
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// File stem for a skill: `<service>_<action>`, lowercased, with
    /// anything outside `[a-z0-9_-]` replaced by `_`.
    pub fn skill_name(service: &str, action: &str) -> String {
        format!("{service}_{action}")
            .to_lowercase()
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    }

    /// Render the skill document for `key`.
    pub fn generate(key: &ProvisionedKey, action: &str, resource: Option<&str>) -> String {
        let name = Self::skill_name(&key.service, action);
        let target = resource
            .map(|r| format!(" for resource \"{r}\""))
            .unwrap_or_default();
        let resource_line = resource
            .map(|r| format!("- Target Resource: {r}\n"))
            .unwrap_or_default();

        format!(
            "# Skill: {name}\n\
             \n\
             ## Description\n\
             This skill allows the agent to perform the action \"{action}\" on the service \"{service}\"{target}.\n\
             Access is restricted by KeyGuard to the minimum permissions required.\n\
             \n\
             ## Capabilities\n\
             - Service: {service}\n\
             - Action: {action}\n\
             - Permissions: {permissions}\n\
             {resource_line}\
             \n\
             ## Usage\n\
             To perform this action, call the `proxy_request` tool with the following session token:\n\
             **Session Token**: `{placeholder}`\n\
             \n\
             ## Security Note\n\
             The token is managed by KeyGuard and expires automatically. Do not use it for actions outside the scope above.\n",
            service = key.service,
            permissions = key.permissions.join(", "),
            placeholder = SESSION_TOKEN_PLACEHOLDER,
        )
    }

    /// Substitute the session token into a rendered document.
    pub fn bind_session(document: &str, token: &str) -> String {
        document.replace(SESSION_TOKEN_PLACEHOLDER, token)
    }

    /// Write `content` to `<output_dir>/<name>.md`, creating the directory
    /// if needed. Returns the written path.
    pub fn save(&self, content: &str, name: &str) -> Result<PathBuf> {
        let path = self.output_dir.join(format!("{name}.md"));

        std::fs::create_dir_all(&self.output_dir).map_err(|source| ProvisionError::SkillWrite {
            path: self.output_dir.clone(),
            source,
        })?;
        std::fs::write(&path, content).map_err(|source| ProvisionError::SkillWrite {
            path: path.clone(),
            source,
        })?;

        info!(path = %path.display(), "skill written");
        Ok(path)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
