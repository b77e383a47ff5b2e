//! Receipt issuance: policy enforcement, hashing, canonicalization, signing.
//!
//! `create` is the only way receipts come into being. Policies run first and
//! may transform the input; the receipt's `input_hash` covers what survived
//! the chain, and the enforcement evidence lands in the unsigned
//! `ext.policy_enforced` extension.

use std::collections::BTreeMap;

use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use rand::RngCore;

use crate::encoding::b64url;
use crate::ledger::InclusionProof;
use crate::policy::{EnforcementContext, PolicyError, PolicyRuntime};
use crate::verify::profile::Profile;
use super::canonical::{sha256, CanonicalError};
use super::signer;
use super::{
    FullReceipt, LogInclusion, Receipt, ReceiptExtensions, MAX_EXT_ENTRIES, MAX_WIRE_BYTES,
    NONCE_LEN, RECEIPT_VERSION,
};

/// Errors from receipt creation.
#[derive(Debug)]
pub enum IssueError {
    MissingField { field: &'static str },
    Invalid { field: &'static str, reason: String },
    Policy(PolicyError),
    Canonical(CanonicalError),
}

impl IssueError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingField { .. } => "E_STRUCT_MISSING",
            Self::Invalid { .. } => "E_STRUCT_TYPE",
            Self::Policy(err) => err.code(),
            Self::Canonical(err) => err.code(),
        }
    }
}

impl std::fmt::Display for IssueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingField { field } => {
                write!(f, "E_STRUCT_MISSING: {field} is required")
            }
            Self::Invalid { field, reason } => {
                write!(f, "E_STRUCT_TYPE: {field}: {reason}")
            }
            Self::Policy(err) => write!(f, "{err}"),
            Self::Canonical(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for IssueError {}

impl From<PolicyError> for IssueError {
    fn from(err: PolicyError) -> Self {
        Self::Policy(err)
    }
}

impl From<CanonicalError> for IssueError {
    fn from(err: CanonicalError) -> Self {
        Self::Canonical(err)
    }
}

/// Inputs to `create`. Timestamp and nonce overrides exist for deterministic
/// tests; production callers leave them `None`.
pub struct CreateParams<'a> {
    pub code_ref: &'a str,
    pub input: &'a [u8],
    pub output: &'a [u8],
    pub policy_ids: Vec<String>,
    pub extensions: ReceiptExtensions,
    pub ts: Option<i64>,
    pub nonce: Option<[u8; NONCE_LEN]>,
    /// When the computation started, for `ttl_*` policies. Defaults to `ts`.
    pub start_time_ms: Option<i64>,
}

impl<'a> CreateParams<'a> {
    #[must_use]
    pub fn new(code_ref: &'a str, input: &'a [u8], output: &'a [u8]) -> Self {
        Self {
            code_ref,
            input,
            output,
            policy_ids: Vec::new(),
            extensions: ReceiptExtensions::default(),
            ts: None,
            nonce: None,
            start_time_ms: None,
        }
    }

    #[must_use]
    pub fn with_policies<I, T>(mut self, policy_ids: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.policy_ids = policy_ids.into_iter().map(Into::into).collect();
        self
    }
}

/// Issues receipts with one signing key under one profile.
pub struct ReceiptIssuer {
    signing_key: SigningKey,
    policies: PolicyRuntime,
    profile: Profile,
}

impl ReceiptIssuer {
    #[must_use]
    pub fn new(signing_key: SigningKey, policies: PolicyRuntime, profile: Profile) -> Self {
        Self {
            signing_key,
            policies,
            profile,
        }
    }

    #[must_use]
    pub fn verifying_key(&self) -> ed25519_dalek::VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Create and sign a receipt.
    pub fn create(&self, params: CreateParams<'_>) -> Result<FullReceipt, IssueError> {
        if params.code_ref.is_empty() {
            return Err(IssueError::MissingField { field: "code_ref" });
        }
        if self.profile.bounds().require_policies && params.policy_ids.is_empty() {
            return Err(IssueError::MissingField { field: "policy_ids" });
        }
        if params.policy_ids.iter().any(String::is_empty) {
            return Err(IssueError::Invalid {
                field: "policy_ids",
                reason: "empty policy id".to_string(),
            });
        }

        let ts = params
            .ts
            .unwrap_or_else(|| chrono::Utc::now().timestamp_millis());

        // Enforcers run in caller order; the receipt stores the sorted,
        // deduplicated set.
        let ctx = EnforcementContext {
            start_time_ms: params.start_time_ms.unwrap_or(ts),
            now_ms: ts,
        };
        let outcome = self.policies.apply(&params.policy_ids, params.input, &ctx)?;

        let mut policy_ids = params.policy_ids.clone();
        policy_ids.sort();
        policy_ids.dedup();

        let nonce = params.nonce.unwrap_or_else(|| {
            let mut bytes = [0u8; NONCE_LEN];
            OsRng.fill_bytes(&mut bytes);
            bytes
        });

        let mut receipt = Receipt {
            version: RECEIPT_VERSION.to_string(),
            code_ref: params.code_ref.to_string(),
            ts,
            nonce: b64url(&nonce),
            input_hash: b64url(&sha256(&outcome.input)),
            output_hash: b64url(&sha256(params.output)),
            policy_ids,
            pubkey: b64url(self.signing_key.verifying_key().as_bytes()),
            sig: String::new(),
        };

        let payload = receipt.signing_bytes()?;
        receipt.sig = b64url(&signer::sign(&self.signing_key, &payload));

        let mut extensions = params.extensions;
        if !outcome.evidence.is_empty() {
            let ext = extensions.ext.get_or_insert_with(BTreeMap::new);
            ext.insert("policy_enforced".to_string(), outcome.evidence_value());
        }
        if extensions
            .ext
            .as_ref()
            .is_some_and(|ext| ext.len() > MAX_EXT_ENTRIES)
        {
            return Err(IssueError::Invalid {
                field: "ext",
                reason: format!("more than {MAX_EXT_ENTRIES} extension entries"),
            });
        }

        let full = FullReceipt {
            receipt,
            extensions,
        };

        if let Ok(wire) = serde_json::to_vec(&full) {
            if wire.len() > MAX_WIRE_BYTES {
                tracing::warn!(
                    bytes = wire.len(),
                    "receipt exceeds the soft wire-size target"
                );
            }
        }

        Ok(full)
    }
}

/// Attach ledger inclusion evidence to an issued receipt.
pub fn attach_inclusion(receipt: &mut FullReceipt, proof: &InclusionProof) {
    receipt.extensions.log_inclusion = Some(LogInclusion {
        leaf_index: proof.leaf_index,
        audit_path: proof.audit_path.clone(),
        sth_root: proof.sth.root.clone(),
        sth: Some(proof.sth.clone()),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::decode_b64url_exact;
    use crate::receipt::HASH_LEN;

    fn issuer(profile: Profile) -> ReceiptIssuer {
        ReceiptIssuer::new(
            SigningKey::from_bytes(&[8u8; 32]),
            PolicyRuntime::with_builtins(),
            profile,
        )
    }

    fn deterministic(params: CreateParams<'_>) -> CreateParams<'_> {
        CreateParams {
            ts: Some(1_750_000_000_000),
            nonce: Some([0x42; NONCE_LEN]),
            ..params
        }
    }

    #[test]
    fn created_receipt_has_well_formed_fields() {
        let issuer = issuer(Profile::Lite);
        let full = issuer
            .create(deterministic(
                CreateParams::new("git:abc", b"hello", b"world")
                    .with_policies(["no_retention"]),
            ))
            .expect("create");

        let receipt = &full.receipt;
        assert_eq!(receipt.version, RECEIPT_VERSION);
        decode_b64url_exact("nonce", &receipt.nonce, NONCE_LEN).expect("nonce");
        decode_b64url_exact("input_hash", &receipt.input_hash, HASH_LEN).expect("input_hash");
        decode_b64url_exact("sig", &receipt.sig, signer::SIG_LEN).expect("sig");
        decode_b64url_exact("pubkey", &receipt.pubkey, signer::PUBKEY_LEN).expect("pubkey");
        assert_eq!(receipt.input_hash, b64url(&sha256(b"hello")));
        assert_eq!(receipt.output_hash, b64url(&sha256(b"world")));
    }

    #[test]
    fn policy_ids_are_sorted_and_deduplicated() {
        let issuer = issuer(Profile::Lite);
        let full = issuer
            .create(deterministic(
                CreateParams::new("git:abc", b"in", b"out").with_policies([
                    "hipaa_safe",
                    "eu_region",
                    "no_retention",
                    "eu_region",
                ]),
            ))
            .expect("create");
        assert_eq!(
            full.receipt.policy_ids,
            vec!["eu_region", "hipaa_safe", "no_retention"]
        );
    }

    #[test]
    fn policy_order_does_not_change_canonical_bytes() {
        let issuer = issuer(Profile::Lite);
        let a = issuer
            .create(deterministic(
                CreateParams::new("git:abc", b"in", b"out")
                    .with_policies(["hipaa_safe", "eu_region", "no_retention"]),
            ))
            .expect("create a");
        let b = issuer
            .create(deterministic(
                CreateParams::new("git:abc", b"in", b"out")
                    .with_policies(["no_retention", "eu_region", "hipaa_safe"]),
            ))
            .expect("create b");
        assert_eq!(
            a.receipt.canonical_receipt_bytes().expect("bytes a"),
            b.receipt.canonical_receipt_bytes().expect("bytes b")
        );
    }

    #[test]
    fn pii_redaction_changes_input_hash_and_leaves_evidence() {
        let issuer = issuer(Profile::Lite);
        let input = b"contact alice@example.com";
        let full = issuer
            .create(deterministic(
                CreateParams::new("git:abc", input, b"out").with_policies(["no_pii"]),
            ))
            .expect("create");

        // Hash covers the redacted input, not the raw one.
        assert_ne!(full.receipt.input_hash, b64url(&sha256(input)));
        assert_eq!(
            full.receipt.input_hash,
            b64url(&sha256(b"contact [EMAIL]"))
        );

        let ext = full.extensions.ext.expect("ext");
        let enforced = ext.get("policy_enforced").expect("policy_enforced");
        assert_eq!(enforced["no_pii"]["matches"]["email"], 1);
    }

    #[test]
    fn ttl_overrun_denies_issuance() {
        let issuer = issuer(Profile::Lite);
        let params = CreateParams {
            start_time_ms: Some(1_750_000_000_000 - 120_000),
            ..deterministic(
                CreateParams::new("git:abc", b"in", b"out").with_policies(["ttl_60s"]),
            )
        };
        let err = issuer.create(params).expect_err("denied");
        assert_eq!(err.code(), "E_POLICY_DENIED");
    }

    #[test]
    fn strict_profile_requires_policies() {
        let issuer = issuer(Profile::Strict);
        let err = issuer
            .create(deterministic(CreateParams::new("git:abc", b"in", b"out")))
            .expect_err("missing policies");
        assert_eq!(err.code(), "E_STRUCT_MISSING");
    }

    #[test]
    fn empty_code_ref_is_rejected() {
        let issuer = issuer(Profile::Lite);
        let err = issuer
            .create(CreateParams::new("", b"in", b"out"))
            .expect_err("missing code_ref");
        assert_eq!(err.code(), "E_STRUCT_MISSING");
    }

    #[test]
    fn random_nonce_and_clock_are_used_by_default() {
        let issuer = issuer(Profile::Lite);
        let a = issuer
            .create(CreateParams::new("git:abc", b"in", b"out"))
            .expect("a");
        let b = issuer
            .create(CreateParams::new("git:abc", b"in", b"out"))
            .expect("b");
        assert_ne!(a.receipt.nonce, b.receipt.nonce);
        let now = chrono::Utc::now().timestamp_millis();
        assert!((now - a.receipt.ts).abs() < 60_000);
    }
}
