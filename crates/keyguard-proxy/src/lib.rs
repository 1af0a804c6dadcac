//! Authenticated request forwarding for KeyGuard.
//!
//! Callers never see raw secrets. They describe the request they want made,
//! and the forwarder issues it with the secret injected using the target
//! service's own authentication scheme.
//!
//! - [`auth`]: per-service injectors and the service registry.
//! - [`forwarder`]: URL resolution, dispatch, response envelopes.
//! - [`error`]: pre-dispatch rejection errors.

pub mod auth;
pub mod error;
pub mod forwarder;

pub use auth::{
    ANTHROPIC_VERSION, AnthropicAuth, AuthInjector, AuthRegistry, BearerAuth, GITHUB_ACCEPT,
    GithubTokenAuth, ServiceProfile,
};
pub use error::{ProxyError, Result};
pub use forwarder::{DEFAULT_TIMEOUT_SECS, ProxyForwarder, ProxyRequest, ProxyResponse};
