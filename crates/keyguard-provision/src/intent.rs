//! Natural-language intent extraction.
//!
//! Turns a prose request ("let the agent read R2 bucket my-data") into a
//! structured [`Intent`]: which service, what action, on which resource,
//! with which permission scopes. The production parser asks an OpenAI-style
//! chat-completions endpoint for a JSON object; tests and offline setups can
//! plug in their own [`IntentParser`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::error::{ProvisionError, Result};

/// Model used when none is configured.
pub const DEFAULT_INTENT_MODEL: &str = "gpt-4.1-mini";

/// Chat-completions API root used when none is configured.
pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

const REQUEST_TIMEOUT_SECS: u64 = 60;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A structured access request extracted from prose.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intent {
    /// Target provider (e.g. "cloudflare").
    pub service: String,

    /// Short snake_case action name (e.g. "read_r2").
    pub action: String,

    /// Specific resource identifier, when the request named one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,

    /// Scopes the action needs.
    #[serde(default)]
    pub permissions: Vec<String>,

    /// The model's explanation of the chosen scopes.
    #[serde(default)]
    pub reasoning: String,
}

/// Extracts an [`Intent`] from a natural-language prompt.
#[async_trait]
pub trait IntentParser: Send + Sync {
    /// Parse `prompt`.
    async fn parse(&self, prompt: &str) -> Result<Intent>;
}

// ---------------------------------------------------------------------------
// System prompt
// ---------------------------------------------------------------------------

const SYSTEM_PROMPT: &str = r#"You are the permission analyst for KeyGuard. Convert the user's request into the narrowest permission scope a cloud provider token needs.
Supported services: cloudflare, vercel, supabase.

Respond ONLY with a JSON object:
{
  "service": "cloudflare" | "vercel" | "supabase",
  "action": "short_snake_case_action",
  "resource": "specific resource identifier, omit if none",
  "permissions": ["required", "scopes"],
  "reasoning": "one sentence on why these scopes"
}

Example request: "let the agent read R2 bucket my-data"
Example response:
{
  "service": "cloudflare",
  "action": "read_r2",
  "resource": "my-data",
  "permissions": ["r2_bucket_read"],
  "reasoning": "Read access to a single R2 bucket."
}"#;

// ---------------------------------------------------------------------------
// OpenAI parser
// ---------------------------------------------------------------------------

/// [`IntentParser`] backed by an OpenAI-compatible chat-completions API.
pub struct OpenAiIntentParser {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiIntentParser {
    /// Create a parser for the default endpoint and model.
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            http,
            base_url: DEFAULT_OPENAI_BASE_URL.to_string(),
            api_key: api_key.into(),
            model: DEFAULT_INTENT_MODEL.to_string(),
        })
    }

    /// Use a different API root (a proxy, a compatible vendor, a mock).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Use a different model.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// The configured model.
    pub fn model(&self) -> &str {
        &self.model
    }
}

impl std::fmt::Debug for OpenAiIntentParser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiIntentParser")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl IntentParser for OpenAiIntentParser {
    async fn parse(&self, prompt: &str) -> Result<Intent> {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return Err(ProvisionError::EmptyPrompt);
        }

        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let body = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": prompt},
            ],
            "response_format": {"type": "json_object"},
        });

        let mut auth = HeaderValue::from_str(&format!("Bearer {}", self.api_key))
            .map_err(|_| ProvisionError::InvalidApiKey)?;
        auth.set_sensitive(true);

        debug!(url = %url, model = %self.model, "requesting intent from model");

        let response = self
            .http
            .post(&url)
            .header(AUTHORIZATION, auth)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ProvisionError::Upstream {
                status: status.as_u16(),
                body: text,
            });
        }

        let payload: Value = response.json().await?;
        let intent = parse_completion(&payload)?;

        info!(
            service = %intent.service,
            action = %intent.action,
            permissions = ?intent.permissions,
            "intent parsed"
        );
        Ok(intent)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Extract an [`Intent`] from a chat-completions response body.
pub fn parse_completion(payload: &Value) -> Result<Intent> {
    let content = payload["choices"][0]["message"]["content"]
        .as_str()
        .map(str::trim)
        .unwrap_or_default();

    if content.is_empty() {
        return Err(ProvisionError::InvalidModelResponse {
            reason: "no message content".into(),
        });
    }

    // Some models wrap JSON in markdown fences even in JSON mode.
    let cleaned = content.strip_prefix("```json").unwrap_or(content);
    let cleaned = cleaned.strip_prefix("```").unwrap_or(cleaned);
    let cleaned = cleaned.strip_suffix("```").unwrap_or(cleaned).trim();

    let intent: Intent =
        serde_json::from_str(cleaned).map_err(|e| ProvisionError::InvalidModelResponse {
            reason: format!("content is not an intent object: {e}"),
        })?;

    if intent.service.trim().is_empty() || intent.action.trim().is_empty() {
        return Err(ProvisionError::InvalidModelResponse {
            reason: "service and action must be non-empty".into(),
        });
    }

    Ok(intent)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
