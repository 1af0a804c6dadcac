//! Authenticated request forwarding.
//!
//! [`ProxyForwarder::forward`] takes a service name, the raw secret resolved
//! from a session, and a caller's request description. It resolves the target
//! URL, injects the secret using the service's [`AuthInjector`], sends the
//! request, and hands back whatever the upstream said.
//!
//! Any HTTP status is a successful forward: 4xx and 5xx responses come back
//! verbatim. Only transport failures (connection refused, TLS, timeouts) are
//! turned into a synthetic status-500 envelope carrying the error message.
//!
//! [`AuthInjector`]: crate::auth::AuthInjector

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::auth::AuthRegistry;
use crate::error::{ProxyError, Result};

/// Default request timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Status reported when the request never produced an upstream response.
const TRANSPORT_ERROR_STATUS: u16 = 500;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A caller's description of the request to forward.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxyRequest {
    /// HTTP method (case-insensitive).
    pub method: String,

    /// Path relative to the service base URL, or an absolute `http(s)` URL.
    pub path: String,

    /// Request body. Strings are sent as-is; other JSON values are sent as
    /// `application/json`.
    #[serde(default)]
    pub body: Option<Value>,

    /// Extra request headers. Authentication headers always win.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl ProxyRequest {
    /// A bodyless request.
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            ..Self::default()
        }
    }

    /// Attach a body.
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Add a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// What came back from upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyResponse {
    /// Upstream status code, or 500 on transport failure.
    pub status: u16,

    /// Response body; parsed JSON when possible, otherwise the raw text.
    pub body: Value,

    /// Response headers. Repeated headers are joined with `, `.
    pub headers: BTreeMap<String, String>,

    /// Transport error message; set only on synthetic responses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProxyResponse {
    /// Synthetic envelope for a request that never got an upstream answer.
    pub fn transport_error(message: impl Into<String>) -> Self {
        Self {
            status: TRANSPORT_ERROR_STATUS,
            body: Value::Null,
            headers: BTreeMap::new(),
            error: Some(message.into()),
        }
    }

    /// Whether this envelope reports a transport failure.
    pub fn is_transport_error(&self) -> bool {
        self.error.is_some()
    }
}

// ---------------------------------------------------------------------------
// Forwarder
// ---------------------------------------------------------------------------

/// Issues authenticated requests on a caller's behalf.
#[derive(Debug, Clone)]
pub struct ProxyForwarder {
    client: reqwest::Client,
    registry: AuthRegistry,
}

impl ProxyForwarder {
    /// Create a forwarder with the default request timeout.
    pub fn new(registry: AuthRegistry) -> Result<Self> {
        Self::with_timeout(registry, Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }

    /// Create a forwarder whose requests time out after `timeout`.
    pub fn with_timeout(registry: AuthRegistry, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("KeyGuard/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;

        Ok(Self { client, registry })
    }

    /// The service table in use.
    pub fn registry(&self) -> &AuthRegistry {
        &self.registry
    }

    /// Resolve the URL a request for `service` would be sent to.
    ///
    /// Absolute `http://` / `https://` paths are used verbatim; anything else
    /// is appended to the service base URL.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::UnsupportedService`] for unregistered services,
    /// even when `path` is absolute.
    pub fn resolve_url(&self, service: &str, path: &str) -> Result<String> {
        let profile = self
            .registry
            .get(service)
            .ok_or_else(|| ProxyError::UnsupportedService {
                service: service.to_string(),
            })?;

        let full = if is_absolute(path) {
            path.to_string()
        } else {
            let base = profile.base_url.trim_end_matches('/');
            if path.starts_with('/') {
                format!("{base}{path}")
            } else {
                format!("{base}/{path}")
            }
        };

        url::Url::parse(&full).map_err(|e| ProxyError::InvalidUrl {
            url: full.clone(),
            reason: e.to_string(),
        })?;

        Ok(full)
    }

    /// Forward `request` to `service`, authenticating with `secret`.
    ///
    /// # Errors
    ///
    /// Only requests rejected before dispatch are errors: unknown service,
    /// bad method, bad header, or unusable secret. Transport failures are
    /// returned as `Ok` with [`ProxyResponse::transport_error`].
    pub async fn forward(
        &self,
        service: &str,
        secret: &str,
        request: &ProxyRequest,
    ) -> Result<ProxyResponse> {
        let url = self.resolve_url(service, &request.path)?;
        let method = parse_method(&request.method).ok_or_else(|| ProxyError::InvalidMethod {
            method: request.method.clone(),
        })?;

        let mut headers = HeaderMap::new();
        for (name, value) in &request.headers {
            let header_name =
                HeaderName::from_bytes(name.as_bytes()).map_err(|e| ProxyError::InvalidHeader {
                    name: name.clone(),
                    reason: e.to_string(),
                })?;
            let header_value =
                HeaderValue::from_str(value).map_err(|e| ProxyError::InvalidHeader {
                    name: name.clone(),
                    reason: e.to_string(),
                })?;
            headers.insert(header_name, header_value);
        }

        // Registry lookup already succeeded inside `resolve_url`.
        if let Some(profile) = self.registry.get(service) {
            profile
                .injector()
                .inject(secret, &mut headers)
                .map_err(|_| ProxyError::InvalidSecret {
                    service: service.to_string(),
                })?;
        }

        let mut builder = self.client.request(method, &url).headers(headers);
        match &request.body {
            None | Some(Value::Null) => {}
            Some(Value::String(raw)) => builder = builder.body(raw.clone()),
            Some(json) => builder = builder.json(json),
        }

        debug!(service = service, method = %request.method, url = %url, "forwarding request");

        let start = Instant::now();
        let response = match builder.send().await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(service = service, url = %url, error = %e, "upstream transport error");
                return Ok(ProxyResponse::transport_error(e.to_string()));
            }
        };

        let status = response.status().as_u16();
        let response_headers = flatten_headers(response.headers());

        let bytes = match response.bytes().await {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(service = service, url = %url, error = %e, "failed to read upstream body");
                return Ok(ProxyResponse::transport_error(format!(
                    "failed to read response body: {e}"
                )));
            }
        };

        debug!(
            service = service,
            url = %url,
            status = status,
            elapsed_ms = start.elapsed().as_millis() as u64,
            body_length = bytes.len(),
            "upstream responded"
        );

        Ok(ProxyResponse {
            status,
            body: decode_body(&bytes),
            headers: response_headers,
            error: None,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn is_absolute(path: &str) -> bool {
    let lower = path.get(..8).unwrap_or(path).to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

/// Parse an HTTP method string into a `reqwest::Method`.
/// Returns `None` if the method is not supported.
fn flatten_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut flat: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let value = value.to_str().unwrap_or("<binary>");
        flat.entry(name.as_str().to_string())
            .and_modify(|joined| {
                joined.push_str(", ");
                joined.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
    flat
}

fn parse_method(method: &str) -> Option<reqwest::Method> {
    match method.to_uppercase().as_str() {
        "GET" => Some(reqwest::Method::GET),
        "POST" => Some(reqwest::Method::POST),
        "PUT" => Some(reqwest::Method::PUT),
        "PATCH" => Some(reqwest::Method::PATCH),
        "DELETE" => Some(reqwest::Method::DELETE),
        "HEAD" => Some(reqwest::Method::HEAD),
        _ => None,
    }
}

fn decode_body(bytes: &[u8]) -> Value {
    serde_json::from_slice(bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn forwarder() -> ProxyForwarder {
        ProxyForwarder::new(AuthRegistry::with_defaults()).unwrap()
    }

    #[test]
    fn relative_paths_join_base_url() {
        let f = forwarder();
        assert_eq!(
            f.resolve_url("openai", "/models").unwrap(),
            "https://api.openai.com/v1/models"
        );
        assert_eq!(
            f.resolve_url("openai", "models").unwrap(),
            "https://api.openai.com/v1/models"
        );
        assert_eq!(
            f.resolve_url("github", "/user/repos").unwrap(),
            "https://api.github.com/user/repos"
        );
    }

    #[test]
    fn absolute_urls_bypass_base() {
        let f = forwarder();
        assert_eq!(
            f.resolve_url("github", "https://uploads.github.com/x").unwrap(),
            "https://uploads.github.com/x"
        );
        assert_eq!(
            f.resolve_url("vercel", "HTTP://localhost:3000/a").unwrap(),
            "HTTP://localhost:3000/a"
        );
    }

    #[test]
    fn unknown_service_rejected_even_with_absolute_url() {
        let f = forwarder();
        assert!(matches!(
            f.resolve_url("gitlab", "https://gitlab.com/api/v4"),
            Err(ProxyError::UnsupportedService { .. })
        ));
    }

    #[tokio::test]
    async fn unknown_service_rejected_before_dispatch() {
        let f = forwarder();
        let result = f
            .forward("gitlab", "glpat", &ProxyRequest::new("GET", "/projects"))
            .await;
        assert!(matches!(result, Err(ProxyError::UnsupportedService { .. })));
    }

    #[tokio::test]
    async fn invalid_method_rejected() {
        let f = forwarder();
        let result = f
            .forward("openai", "sk", &ProxyRequest::new("FOOBAR", "/models"))
            .await;
        assert!(matches!(result, Err(ProxyError::InvalidMethod { .. })));
    }

    #[tokio::test]
    async fn invalid_header_rejected() {
        let f = forwarder();
        let request = ProxyRequest::new("GET", "/models").with_header("bad header", "x");
        let result = f.forward("openai", "sk", &request).await;
        assert!(matches!(result, Err(ProxyError::InvalidHeader { .. })));
    }

    #[tokio::test]
    async fn unusable_secret_rejected() {
        let f = forwarder();
        let result = f
            .forward("openai", "sk\r\nX-Injected: 1", &ProxyRequest::new("GET", "/models"))
            .await;
        assert!(matches!(result, Err(ProxyError::InvalidSecret { .. })));
    }

    #[test]
    fn repeated_response_headers_are_joined() {
        let mut headers = HeaderMap::new();
        headers.append("set-cookie", HeaderValue::from_static("a=1"));
        headers.append("set-cookie", HeaderValue::from_static("b=2"));
        headers.insert("content-type", HeaderValue::from_static("text/plain"));

        let flat = flatten_headers(&headers);
        assert_eq!(flat["set-cookie"], "a=1, b=2");
        assert_eq!(flat["content-type"], "text/plain");
    }

    #[test]
    fn parse_method_supported_methods() {
        assert_eq!(parse_method("GET"), Some(reqwest::Method::GET));
        assert_eq!(parse_method("post"), Some(reqwest::Method::POST));
        assert_eq!(parse_method("Put"), Some(reqwest::Method::PUT));
        assert_eq!(parse_method("PATCH"), Some(reqwest::Method::PATCH));
        assert_eq!(parse_method("DELETE"), Some(reqwest::Method::DELETE));
        assert_eq!(parse_method("HEAD"), Some(reqwest::Method::HEAD));
        assert_eq!(parse_method("OPTIONS"), None);
        assert_eq!(parse_method(""), None);
    }

    #[test]
    fn body_decoding() {
        assert_eq!(decode_body(br#"{"ok":true}"#), json!({"ok": true}));
        assert_eq!(decode_body(b"plain text"), json!("plain text"));
        assert_eq!(decode_body(b""), json!(""));
    }

    #[test]
    fn request_deserializes_with_defaults() {
        let req: ProxyRequest =
            serde_json::from_value(json!({"method": "GET", "path": "/user"})).unwrap();
        assert!(req.body.is_none());
        assert!(req.headers.is_empty());
    }

    #[test]
    fn transport_error_envelope() {
        let r = ProxyResponse::transport_error("connection refused");
        assert_eq!(r.status, 500);
        assert!(r.is_transport_error());
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["error"], "connection refused");
    }
}
