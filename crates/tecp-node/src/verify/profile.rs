//! Admission profiles layered on verification.
//!
//! LITE is for development and casual checks; STRICT is for receipts that
//! must hold up in front of an auditor. The bounds are part of the
//! conformance surface and must not drift.

use serde::{Deserialize, Serialize};

const HOUR_MS: i64 = 3_600_000;

/// Named profile selecting admission and timing rules.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    #[default]
    Lite,
    Strict,
}

impl std::fmt::Display for Profile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Lite => write!(f, "lite"),
            Self::Strict => write!(f, "strict"),
        }
    }
}

impl std::str::FromStr for Profile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lite" | "LITE" => Ok(Self::Lite),
            "strict" | "STRICT" => Ok(Self::Strict),
            other => Err(format!("unknown profile: {other} (expected: lite, strict)")),
        }
    }
}

/// Concrete admission bounds for a profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProfileBounds {
    /// Receipts older than this are expired.
    pub max_age_ms: i64,
    /// Tolerated forward clock skew.
    pub max_skew_ms: i64,
    /// Reject empty `policy_ids`.
    pub require_policies: bool,
    /// Reject receipts without a verifiable `log_inclusion` extension.
    pub require_inclusion: bool,
    /// Unknown policy ids are errors rather than warnings.
    pub unknown_policy_fatal: bool,
}

impl Profile {
    #[must_use]
    pub fn bounds(&self) -> ProfileBounds {
        match self {
            Self::Lite => ProfileBounds {
                max_age_ms: 24 * HOUR_MS,
                max_skew_ms: 120_000,
                require_policies: false,
                require_inclusion: false,
                unknown_policy_fatal: false,
            },
            Self::Strict => ProfileBounds {
                max_age_ms: 24 * HOUR_MS,
                max_skew_ms: 10_000,
                require_policies: true,
                require_inclusion: true,
                unknown_policy_fatal: true,
            },
        }
    }
}

/// Receipts older than this draw a non-fatal staleness warning.
pub const STALENESS_WARNING_MS: i64 = HOUR_MS;
