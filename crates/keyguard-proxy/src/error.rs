//! Proxy error types.
//!
//! These cover requests rejected before dispatch. Failures on the wire are
//! not errors: they come back as a status-500 [`ProxyResponse`] envelope.
//!
//! [`ProxyResponse`]: crate::forwarder::ProxyResponse

/// Unified error type for the KeyGuard forwarder.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// No base URL or auth scheme is registered for the service.
    #[error("unsupported service for proxy: {service}")]
    UnsupportedService { service: String },

    /// The HTTP method is not one the forwarder issues.
    #[error("unsupported HTTP method `{method}`. Supported: GET, POST, PUT, PATCH, DELETE, HEAD")]
    InvalidMethod { method: String },

    /// The resolved target is not a valid URL.
    #[error("invalid URL `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },

    /// A caller-supplied header could not be encoded.
    #[error("invalid header `{name}`: {reason}")]
    InvalidHeader { name: String, reason: String },

    /// The stored secret cannot be carried in an HTTP header.
    #[error("secret for service `{service}` is not a valid header value")]
    InvalidSecret { service: String },

    /// The HTTP client could not be constructed.
    #[error("http client error: {0}")]
    Client(#[from] reqwest::Error),
}

/// Convenience alias used throughout the proxy crate.
pub type Result<T> = std::result::Result<T, ProxyError>;
