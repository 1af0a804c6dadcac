//! Per-service authentication schemes.
//!
//! Every upstream service authenticates differently. An [`AuthInjector`]
//! writes the raw secret into outbound headers using one scheme, and the
//! [`AuthRegistry`] maps a service name to its base URL and injector. Adding
//! a provider means registering one more [`ServiceProfile`]; the forwarding
//! core never changes.
//!
//! | service | headers |
//! |---|---|
//! | openai, cloudflare, vercel, supabase | `Authorization: Bearer <secret>` |
//! | anthropic | `x-api-key: <secret>`, `anthropic-version: 2023-06-01` |
//! | github | `Authorization: token <secret>`, `Accept: application/vnd.github.v3+json` |

use std::collections::HashMap;
use std::sync::Arc;

use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap, HeaderValue, InvalidHeaderValue};

/// Value sent in the `anthropic-version` header.
pub const ANTHROPIC_VERSION: &str = "2023-06-01";

/// GitHub REST v3 media type.
pub const GITHUB_ACCEPT: &str = "application/vnd.github.v3+json";

// ---------------------------------------------------------------------------
// Injectors
// ---------------------------------------------------------------------------

/// Writes a secret into request headers.
///
/// Implementations overwrite any same-named header the caller supplied.
pub trait AuthInjector: Send + Sync {
    /// Add the authentication headers for `secret`.
    fn inject(
        &self,
        secret: &str,
        headers: &mut HeaderMap,
    ) -> std::result::Result<(), InvalidHeaderValue>;
}

/// `Authorization: Bearer <secret>`.
#[derive(Debug, Clone, Copy, Default)]
pub struct BearerAuth;

impl AuthInjector for BearerAuth {
    fn inject(
        &self,
        secret: &str,
        headers: &mut HeaderMap,
    ) -> std::result::Result<(), InvalidHeaderValue> {
        headers.insert(AUTHORIZATION, sensitive(&format!("Bearer {secret}"))?);
        Ok(())
    }
}

/// Anthropic's `x-api-key` plus a pinned `anthropic-version`.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnthropicAuth;

impl AuthInjector for AnthropicAuth {
    fn inject(
        &self,
        secret: &str,
        headers: &mut HeaderMap,
    ) -> std::result::Result<(), InvalidHeaderValue> {
        headers.remove(AUTHORIZATION);
        headers.insert("x-api-key", sensitive(secret)?);
        headers.insert("anthropic-version", HeaderValue::from_static(ANTHROPIC_VERSION));
        Ok(())
    }
}

/// GitHub's `Authorization: token <secret>` with the v3 media type.
#[derive(Debug, Clone, Copy, Default)]
pub struct GithubTokenAuth;

impl AuthInjector for GithubTokenAuth {
    fn inject(
        &self,
        secret: &str,
        headers: &mut HeaderMap,
    ) -> std::result::Result<(), InvalidHeaderValue> {
        headers.insert(AUTHORIZATION, sensitive(&format!("token {secret}"))?);
        headers.insert(ACCEPT, HeaderValue::from_static(GITHUB_ACCEPT));
        Ok(())
    }
}

/// Header value flagged so `http` never prints it in debug output.
fn sensitive(value: &str) -> std::result::Result<HeaderValue, InvalidHeaderValue> {
    let mut header = HeaderValue::from_str(value)?;
    header.set_sensitive(true);
    Ok(header)
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// How to reach and authenticate against one service.
#[derive(Clone)]
pub struct ServiceProfile {
    /// Base URL that relative request paths are appended to.
    pub base_url: String,
    injector: Arc<dyn AuthInjector>,
}

impl ServiceProfile {
    /// Build a profile.
    pub fn new(base_url: impl Into<String>, injector: impl AuthInjector + 'static) -> Self {
        Self {
            base_url: base_url.into(),
            injector: Arc::new(injector),
        }
    }

    /// The scheme used for this service.
    pub fn injector(&self) -> &dyn AuthInjector {
        self.injector.as_ref()
    }
}

impl std::fmt::Debug for ServiceProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceProfile")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

/// Service name → [`ServiceProfile`].
///
/// Names are matched case-insensitively.
#[derive(Debug, Clone, Default)]
pub struct AuthRegistry {
    services: HashMap<String, ServiceProfile>,
}

impl AuthRegistry {
    /// A registry with no services.
    pub fn empty() -> Self {
        Self::default()
    }

    /// The six built-in providers.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register("openai", ServiceProfile::new("https://api.openai.com/v1", BearerAuth));
        registry.register(
            "anthropic",
            ServiceProfile::new("https://api.anthropic.com/v1", AnthropicAuth),
        );
        registry.register("github", ServiceProfile::new("https://api.github.com", GithubTokenAuth));
        registry.register(
            "cloudflare",
            ServiceProfile::new("https://api.cloudflare.com/client/v4", BearerAuth),
        );
        registry.register("vercel", ServiceProfile::new("https://api.vercel.com", BearerAuth));
        registry.register("supabase", ServiceProfile::new("https://api.supabase.com/v1", BearerAuth));
        registry
    }

    /// Add or replace a service.
    pub fn register(&mut self, service: &str, profile: ServiceProfile) {
        tracing::debug!(service = service, base_url = %profile.base_url, "proxy service registered");
        self.services.insert(service.to_lowercase(), profile);
    }

    /// Point an already registered service at a different base URL.
    ///
    /// Unknown services are left untouched.
    pub fn with_base_url(mut self, service: &str, base_url: impl Into<String>) -> Self {
        if let Some(profile) = self.services.get_mut(&service.to_lowercase()) {
            profile.base_url = base_url.into();
        }
        self
    }

    /// Look up a service.
    pub fn get(&self, service: &str) -> Option<&ServiceProfile> {
        self.services.get(&service.to_lowercase())
    }

    /// Registered service names, sorted.
    pub fn services(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.services.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn injected(service: &str, secret: &str) -> HeaderMap {
        let registry = AuthRegistry::with_defaults();
        let mut headers = HeaderMap::new();
        registry
            .get(service)
            .unwrap()
            .injector()
            .inject(secret, &mut headers)
            .unwrap();
        headers
    }

    #[test]
    fn bearer_services() {
        for service in ["openai", "cloudflare", "vercel", "supabase"] {
            let headers = injected(service, "s3cret");
            assert_eq!(headers[AUTHORIZATION], "Bearer s3cret", "service {service}");
            assert_eq!(headers.len(), 1);
        }
    }

    #[test]
    fn anthropic_uses_api_key_header() {
        let headers = injected("anthropic", "sk-ant-1");
        assert_eq!(headers["x-api-key"], "sk-ant-1");
        assert_eq!(headers["anthropic-version"], ANTHROPIC_VERSION);
        assert!(headers.get(AUTHORIZATION).is_none());
    }

    #[test]
    fn anthropic_drops_caller_authorization() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer leaked"));
        AnthropicAuth.inject("sk-ant-1", &mut headers).unwrap();
        assert!(headers.get(AUTHORIZATION).is_none());
    }

    #[test]
    fn github_uses_token_scheme() {
        let headers = injected("github", "ghp_1");
        assert_eq!(headers[AUTHORIZATION], "token ghp_1");
        assert_eq!(headers[ACCEPT], GITHUB_ACCEPT);
    }

    #[test]
    fn injected_secret_is_sensitive() {
        let headers = injected("openai", "sk-1");
        assert!(headers[AUTHORIZATION].is_sensitive());
        assert!(!format!("{headers:?}").contains("sk-1"));
    }

    #[test]
    fn secret_with_newline_rejected() {
        let mut headers = HeaderMap::new();
        assert!(BearerAuth.inject("bad\nsecret", &mut headers).is_err());
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let registry = AuthRegistry::with_defaults();
        assert!(registry.get("OpenAI").is_some());
        assert!(registry.get("gitlab").is_none());
    }

    #[test]
    fn default_services() {
        let registry = AuthRegistry::with_defaults();
        assert_eq!(
            registry.services(),
            vec!["anthropic", "cloudflare", "github", "openai", "supabase", "vercel"]
        );
        assert_eq!(registry.get("github").unwrap().base_url, "https://api.github.com");
    }

    #[test]
    fn base_url_override() {
        let registry = AuthRegistry::with_defaults()
            .with_base_url("openai", "http://127.0.0.1:9999")
            .with_base_url("nope", "http://ignored");
        assert_eq!(registry.get("openai").unwrap().base_url, "http://127.0.0.1:9999");
        assert!(registry.get("nope").is_none());
    }

    #[test]
    fn custom_service_registration() {
        let mut registry = AuthRegistry::empty();
        registry.register("Mistral", ServiceProfile::new("https://api.mistral.ai/v1", BearerAuth));
        assert_eq!(registry.services(), vec!["mistral"]);
    }
}
