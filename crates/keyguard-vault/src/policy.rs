//! Access policy gate.
//!
//! Before a key is selected for a caller, the [`PolicyEngine`] decides
//! whether the `(service, requested permissions, context)` triple may proceed
//! at all. Evaluation is pure: no state, no I/O, same answer for the same
//! inputs.
//!
//! # Rules
//!
//! The engine holds an ordered list of [`PolicyRule`]s. The first rule that
//! returns [`PolicyDecision::Deny`] wins; if none does, the request is
//! allowed. The default engine carries a single rule,
//! [`ProductionPathRule`]: a request for the `production` scope is denied
//! unless the caller's project path contains `prod`.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// The outcome of a policy evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyDecision {
    /// The request may proceed to key selection.
    Allow = 0,

    /// The request is blocked.
    Deny = 1,
}

impl PolicyDecision {
    /// Stable lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
        }
    }
}

impl std::fmt::Display for PolicyDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Facts about the caller that rules may inspect.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyContext {
    /// The caller's working or project directory.
    pub project_path: Option<String>,

    /// The operation being attempted (e.g. "get_mapped_key").
    pub operation: Option<String>,

    /// Identifier of the calling agent, if known.
    pub agent_id: Option<String>,
}

impl PolicyContext {
    /// Context carrying only a project path.
    pub fn for_project(path: impl Into<String>) -> Self {
        Self {
            project_path: Some(path.into()),
            ..Self::default()
        }
    }

    /// Set the operation name.
    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

/// A single access rule.
pub trait PolicyRule: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Decide on a request.
    fn evaluate(
        &self,
        service: &str,
        permissions: &[String],
        context: &PolicyContext,
    ) -> PolicyDecision;
}

/// Denies the `production` scope outside production project paths.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProductionPathRule;

/// Scope guarded by [`ProductionPathRule`].
pub const PRODUCTION_SCOPE: &str = "production";

/// Substring a project path must contain to use [`PRODUCTION_SCOPE`].
const PRODUCTION_PATH_MARKER: &str = "prod";

impl PolicyRule for ProductionPathRule {
    fn name(&self) -> &str {
        "production_path"
    }

    fn evaluate(
        &self,
        _service: &str,
        permissions: &[String],
        context: &PolicyContext,
    ) -> PolicyDecision {
        let wants_production = permissions.iter().any(|p| p == PRODUCTION_SCOPE);
        let in_production_path = context
            .project_path
            .as_deref()
            .is_some_and(|p| p.contains(PRODUCTION_PATH_MARKER));

        if wants_production && !in_production_path {
            PolicyDecision::Deny
        } else {
            PolicyDecision::Allow
        }
    }
}

// ---------------------------------------------------------------------------
// Policy Engine
// ---------------------------------------------------------------------------

/// Evaluates requests against an ordered rule list.
pub struct PolicyEngine {
    rules: Vec<Box<dyn PolicyRule>>,
}

impl Default for PolicyEngine {
    fn default() -> Self {
        Self {
            rules: vec![Box::new(ProductionPathRule)],
        }
    }
}

impl PolicyEngine {
    /// An engine with no rules; allows everything.
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Append a rule.
    pub fn with_rule(mut self, rule: impl PolicyRule + 'static) -> Self {
        self.rules.push(Box::new(rule));
        self
    }

    /// Evaluate a request; the first denying rule wins.
    pub fn evaluate(
        &self,
        service: &str,
        permissions: &[String],
        context: &PolicyContext,
    ) -> PolicyDecision {
        for rule in &self.rules {
            if rule.evaluate(service, permissions, context) == PolicyDecision::Deny {
                tracing::info!(
                    service = service,
                    permissions = ?permissions,
                    rule = rule.name(),
                    operation = context.operation.as_deref(),
                    "access denied by policy"
                );
                return PolicyDecision::Deny;
            }
        }

        tracing::debug!(service = service, permissions = ?permissions, "access allowed");
        PolicyDecision::Allow
    }

    /// `true` when [`evaluate`](Self::evaluate) allows the request.
    pub fn can_access(
        &self,
        service: &str,
        permissions: &[String],
        context: &PolicyContext,
    ) -> bool {
        self.evaluate(service, permissions, context) == PolicyDecision::Allow
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
