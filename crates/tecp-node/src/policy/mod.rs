//! Policy runtime: named enforcers applied before signing.
//!
//! The runtime is an explicit context object threaded into receipt creation
//! and verification; there is no ambient registry. Enforcers run in caller
//! order, each seeing the input as transformed by its predecessors. A single
//! deny aborts issuance with `E_POLICY_DENIED`; the surviving evidence is
//! aggregated for the unsigned `ext.policy_enforced` extension, and the
//! final transformed input is what gets hashed into the receipt.

pub mod enforcers;

use std::collections::BTreeMap;

use serde_json::Value;

/// Context handed to every enforcer invocation.
#[derive(Debug, Clone, Copy)]
pub struct EnforcementContext {
    /// When the computation started, ms since epoch.
    pub start_time_ms: i64,
    /// Evaluation instant, ms since epoch.
    pub now_ms: i64,
}

/// Result of a single enforcer run.
#[derive(Debug, Clone)]
pub struct Enforcement {
    pub allowed: bool,
    /// Replacement input to thread into the next enforcer, if any.
    pub transformed_input: Option<Vec<u8>>,
    /// Structured evidence for `ext.policy_enforced`.
    pub evidence: Value,
    pub violations: Vec<String>,
}

impl Enforcement {
    /// An allow with evidence and no transformation.
    #[must_use]
    pub fn allowed(evidence: Value) -> Self {
        Self {
            allowed: true,
            transformed_input: None,
            evidence,
            violations: Vec::new(),
        }
    }

    /// A deny with evidence and at least one violation.
    #[must_use]
    pub fn denied(evidence: Value, violations: Vec<String>) -> Self {
        Self {
            allowed: false,
            transformed_input: None,
            evidence,
            violations,
        }
    }
}

/// A named policy enforcer.
pub trait PolicyEnforcer: Send + Sync {
    /// Stable policy id this enforcer handles (exact id or family prefix).
    fn id(&self) -> &str;

    fn enforce(&self, policy_id: &str, input: &[u8], ctx: &EnforcementContext) -> Enforcement;
}

/// Errors from policy resolution and enforcement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyError {
    Unknown {
        policy_id: String,
    },
    Denied {
        policy_id: String,
        violations: Vec<String>,
    },
}

impl PolicyError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unknown { .. } => "E_POLICY_UNKNOWN",
            Self::Denied { .. } => "E_POLICY_DENIED",
        }
    }
}

impl std::fmt::Display for PolicyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown { policy_id } => {
                write!(f, "E_POLICY_UNKNOWN: policy {policy_id} is not registered")
            }
            Self::Denied {
                policy_id,
                violations,
            } => write!(
                f,
                "E_POLICY_DENIED: policy {policy_id} denied: {}",
                violations.join("; ")
            ),
        }
    }
}

impl std::error::Error for PolicyError {}

/// Aggregate outcome of running a policy chain.
#[derive(Debug, Clone)]
pub struct PolicyOutcome {
    /// Input after every transformation in the chain.
    pub input: Vec<u8>,
    /// Per-policy evidence, keyed by policy id.
    pub evidence: BTreeMap<String, Value>,
}

impl PolicyOutcome {
    /// Evidence rendered for the `ext.policy_enforced` extension.
    #[must_use]
    pub fn evidence_value(&self) -> Value {
        serde_json::to_value(&self.evidence).unwrap_or(Value::Null)
    }
}

enum Registration {
    /// Runs an enforcer.
    Enforced(Box<dyn PolicyEnforcer>),
    /// Known id recorded in `policy_ids` only.
    Declarative,
}

/// Registry of known policy ids, owned by the issuing/verifying context.
pub struct PolicyRuntime {
    exact: BTreeMap<String, Registration>,
    families: BTreeMap<String, Registration>,
}

impl PolicyRuntime {
    #[must_use]
    pub fn new() -> Self {
        Self {
            exact: BTreeMap::new(),
            families: BTreeMap::new(),
        }
    }

    /// Runtime with the built-in enforcer set registered.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut runtime = Self::new();
        runtime.register(Box::new(enforcers::NoPii::default()));
        runtime.register_family("ttl_", Box::new(enforcers::Ttl));
        runtime.register(Box::new(enforcers::NoNetwork));
        runtime.register_declarative("no_retention");
        runtime.register_declarative("no_training");
        runtime.register_declarative_family("region_");
        runtime
    }

    pub fn register(&mut self, enforcer: Box<dyn PolicyEnforcer>) {
        self.exact
            .insert(enforcer.id().to_string(), Registration::Enforced(enforcer));
    }

    /// Register an enforcer for every id starting with `prefix`.
    pub fn register_family(&mut self, prefix: &str, enforcer: Box<dyn PolicyEnforcer>) {
        self.families
            .insert(prefix.to_string(), Registration::Enforced(enforcer));
    }

    pub fn register_declarative(&mut self, policy_id: &str) {
        self.exact
            .insert(policy_id.to_string(), Registration::Declarative);
    }

    pub fn register_declarative_family(&mut self, prefix: &str) {
        self.families
            .insert(prefix.to_string(), Registration::Declarative);
    }

    #[must_use]
    pub fn is_known(&self, policy_id: &str) -> bool {
        self.lookup(policy_id).is_some()
    }

    fn lookup(&self, policy_id: &str) -> Option<&Registration> {
        if let Some(registration) = self.exact.get(policy_id) {
            return Some(registration);
        }
        self.families
            .iter()
            .find(|(prefix, _)| policy_id.starts_with(prefix.as_str()))
            .map(|(_, registration)| registration)
    }

    /// Run the chain in caller order, threading transformed input through.
    ///
    /// Ids with no registration are issuer attestations recorded in
    /// `policy_ids` only; whether they are acceptable is the verifier's
    /// profile decision, not an issuance failure.
    pub fn apply(
        &self,
        policy_ids: &[String],
        input: &[u8],
        ctx: &EnforcementContext,
    ) -> Result<PolicyOutcome, PolicyError> {
        let mut current = input.to_vec();
        let mut evidence = BTreeMap::new();

        for policy_id in policy_ids {
            let Some(registration) = self.lookup(policy_id) else {
                tracing::debug!(policy_id = %policy_id, "unregistered policy recorded only");
                continue;
            };

            let Registration::Enforced(enforcer) = registration else {
                continue;
            };

            let result = enforcer.enforce(policy_id, &current, ctx);
            if !result.allowed {
                tracing::warn!(
                    policy_id = %policy_id,
                    violations = result.violations.len(),
                    "policy denied computation"
                );
                return Err(PolicyError::Denied {
                    policy_id: policy_id.clone(),
                    violations: result.violations,
                });
            }
            if let Some(transformed) = result.transformed_input {
                current = transformed;
            }
            evidence.insert(policy_id.clone(), result.evidence);
        }

        Ok(PolicyOutcome {
            input: current,
            evidence,
        })
    }
}

impl Default for PolicyRuntime {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> EnforcementContext {
        EnforcementContext {
            start_time_ms: 1_000,
            now_ms: 1_500,
        }
    }

    struct Uppercase;

    impl PolicyEnforcer for Uppercase {
        fn id(&self) -> &str {
            "uppercase"
        }

        fn enforce(&self, _id: &str, input: &[u8], _ctx: &EnforcementContext) -> Enforcement {
            Enforcement {
                allowed: true,
                transformed_input: Some(input.to_ascii_uppercase()),
                evidence: json!({"transformed": true}),
                violations: Vec::new(),
            }
        }
    }

    struct DenyAll;

    impl PolicyEnforcer for DenyAll {
        fn id(&self) -> &str {
            "deny_all"
        }

        fn enforce(&self, _id: &str, _input: &[u8], _ctx: &EnforcementContext) -> Enforcement {
            Enforcement::denied(json!({}), vec!["nothing is permitted".to_string()])
        }
    }

    #[test]
    fn builtins_are_known() {
        let runtime = PolicyRuntime::with_builtins();
        for id in ["no_pii", "no_network", "no_retention", "no_training"] {
            assert!(runtime.is_known(id), "{id} should be known");
        }
        assert!(runtime.is_known("ttl_60s"));
        assert!(runtime.is_known("region_eu"));
        assert!(!runtime.is_known("hipaa_safe"));
    }

    #[test]
    fn unregistered_policy_is_recorded_only() {
        let runtime = PolicyRuntime::with_builtins();
        let outcome = runtime
            .apply(&["hipaa_safe".to_string()], b"input", &ctx())
            .expect("apply");
        assert_eq!(outcome.input, b"input");
        assert!(outcome.evidence.is_empty());
    }

    #[test]
    fn declarative_policies_record_no_evidence() {
        let runtime = PolicyRuntime::with_builtins();
        let outcome = runtime
            .apply(
                &["no_retention".to_string(), "region_eu".to_string()],
                b"input",
                &ctx(),
            )
            .expect("apply");
        assert_eq!(outcome.input, b"input");
        assert!(outcome.evidence.is_empty());
    }

    #[test]
    fn transformed_input_threads_through_chain() {
        let mut runtime = PolicyRuntime::new();
        runtime.register(Box::new(Uppercase));
        runtime.register(Box::new(enforcers::NoNetwork));

        let outcome = runtime
            .apply(
                &["uppercase".to_string(), "no_network".to_string()],
                b"hello",
                &ctx(),
            )
            .expect("apply");
        assert_eq!(outcome.input, b"HELLO");
        assert_eq!(outcome.evidence.len(), 2);
    }

    #[test]
    fn deny_aborts_the_chain() {
        let mut runtime = PolicyRuntime::new();
        runtime.register(Box::new(DenyAll));
        runtime.register(Box::new(Uppercase));

        let err = runtime
            .apply(
                &["deny_all".to_string(), "uppercase".to_string()],
                b"hello",
                &ctx(),
            )
            .expect_err("denied");
        assert_eq!(err.code(), "E_POLICY_DENIED");
        assert!(matches!(
            err,
            PolicyError::Denied { ref violations, .. } if !violations.is_empty()
        ));
    }

    #[test]
    fn evidence_value_is_keyed_by_policy_id() {
        let mut runtime = PolicyRuntime::new();
        runtime.register(Box::new(Uppercase));
        let outcome = runtime
            .apply(&["uppercase".to_string()], b"x", &ctx())
            .expect("apply");
        let value = outcome.evidence_value();
        assert_eq!(value["uppercase"]["transformed"], json!(true));
    }
}
