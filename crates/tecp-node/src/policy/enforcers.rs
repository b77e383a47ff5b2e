//! Built-in policy enforcers.
//!
//! `no_pii` redacts a fixed, ordered regex set and reports per-pattern match
//! counts; `ttl_*` rejects computations that overran their declared budget;
//! `no_network` declares isolation and contributes evidence only.

use regex::Regex;
use serde_json::json;

use super::{Enforcement, EnforcementContext, PolicyEnforcer};

/// One redaction rule: pattern name, matcher, replacement token.
struct PiiPattern {
    name: &'static str,
    regex: Regex,
    replacement: &'static str,
}

/// Deterministic PII redaction.
///
/// Patterns apply in declaration order; the transformed input is the redacted
/// text and the evidence lists how many times each pattern fired. Redaction
/// never denies: `allowed` is always true.
pub struct NoPii {
    patterns: Vec<PiiPattern>,
}

impl Default for NoPii {
    fn default() -> Self {
        // Order matters: card numbers before phone numbers, otherwise the
        // phone pattern eats 10-digit fragments of a card.
        let specs: [(&str, &str, &str); 5] = [
            (
                "email",
                r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}",
                "[EMAIL]",
            ),
            ("ssn", r"\b\d{3}-\d{2}-\d{4}\b", "[SSN]"),
            (
                "credit_card",
                r"\b(?:\d[ -]?){13,16}\b",
                "[CARD]",
            ),
            (
                "phone",
                r"\b(?:\+?1[ .-]?)?\(?\d{3}\)?[ .-]?\d{3}[ .-]?\d{4}\b",
                "[PHONE]",
            ),
            (
                "ipv4",
                r"\b(?:\d{1,3}\.){3}\d{1,3}\b",
                "[IP]",
            ),
        ];

        let patterns = specs
            .into_iter()
            .map(|(name, pattern, replacement)| PiiPattern {
                name,
                // Patterns are fixed literals; a failure here is a build bug.
                regex: Regex::new(pattern).expect("built-in PII pattern"),
                replacement,
            })
            .collect();
        Self { patterns }
    }
}

impl PolicyEnforcer for NoPii {
    fn id(&self) -> &str {
        "no_pii"
    }

    fn enforce(&self, _id: &str, input: &[u8], _ctx: &EnforcementContext) -> Enforcement {
        let text = String::from_utf8_lossy(input);
        let mut redacted = text.into_owned();
        let mut matches = serde_json::Map::new();
        let mut total = 0u64;

        for pattern in &self.patterns {
            let count = pattern.regex.find_iter(&redacted).count() as u64;
            if count > 0 {
                redacted = pattern
                    .regex
                    .replace_all(&redacted, pattern.replacement)
                    .into_owned();
            }
            matches.insert(pattern.name.to_string(), json!(count));
            total += count;
        }

        Enforcement {
            allowed: true,
            transformed_input: (total > 0).then(|| redacted.into_bytes()),
            evidence: json!({
                "matches": matches,
                "redactions": total,
            }),
            violations: Vec::new(),
        }
    }
}

/// Elapsed-time budget, parameterized by the policy id: `ttl_30s`, `ttl_5m`,
/// `ttl_24h`.
pub struct Ttl;

impl Ttl {
    /// Parse the duration suffix of a `ttl_*` id into milliseconds.
    #[must_use]
    pub fn max_duration_ms(policy_id: &str) -> Option<i64> {
        let suffix = policy_id.strip_prefix("ttl_")?;
        let unit = suffix.chars().last()?;
        let magnitude: i64 = suffix[..suffix.len() - 1].parse().ok()?;
        if magnitude <= 0 {
            return None;
        }
        let factor = match unit {
            's' => 1_000,
            'm' => 60_000,
            'h' => 3_600_000,
            _ => return None,
        };
        magnitude.checked_mul(factor)
    }
}

impl PolicyEnforcer for Ttl {
    fn id(&self) -> &str {
        "ttl_"
    }

    fn enforce(&self, policy_id: &str, _input: &[u8], ctx: &EnforcementContext) -> Enforcement {
        let Some(max_ms) = Self::max_duration_ms(policy_id) else {
            return Enforcement::denied(
                json!({"error": "unparseable ttl id"}),
                vec![format!("{policy_id} does not name a duration")],
            );
        };

        let elapsed_ms = ctx.now_ms.saturating_sub(ctx.start_time_ms);
        let evidence = json!({
            "elapsed_ms": elapsed_ms,
            "max_ms": max_ms,
            "remaining_ms": (max_ms - elapsed_ms).max(0),
        });

        if elapsed_ms > max_ms {
            Enforcement::denied(
                evidence,
                vec![format!("elapsed {elapsed_ms}ms exceeds budget {max_ms}ms")],
            )
        } else {
            Enforcement::allowed(evidence)
        }
    }
}

/// Declares network isolation for the computation. Evidence only; actual
/// isolation is the executing environment's responsibility.
pub struct NoNetwork;

impl PolicyEnforcer for NoNetwork {
    fn id(&self) -> &str {
        "no_network"
    }

    fn enforce(&self, _id: &str, _input: &[u8], _ctx: &EnforcementContext) -> Enforcement {
        Enforcement::allowed(json!({"isolation": "declared"}))
    }
}
