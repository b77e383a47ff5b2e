//! End-to-end receipt verification.
//!
//! The pipeline runs structural, temporal, signature, inclusion, and policy
//! checks in that order, short-circuiting once a stage produces a fatal
//! error. Invalid receipts are never an `Err`: the caller always gets a
//! report with stable error codes, and non-fatal findings surface as
//! warnings next to a `valid` verdict.

pub mod profile;

use serde::{Deserialize, Serialize};

use crate::encoding::{decode_b64url_exact, decode_hex32};
use crate::keyring::Keyring;
use crate::ledger::merkle;
use crate::ledger::sth::verify_sth;
use crate::policy::PolicyRuntime;
use crate::receipt::canonical::canonical_bytes_from_slice;
use crate::receipt::signer::{self, PUBKEY_LEN, SIG_LEN};
use crate::receipt::{FullReceipt, LogInclusion, HASH_LEN, NONCE_LEN, RECEIPT_VERSION};
use self::profile::{Profile, ProfileBounds, STALENESS_WARNING_MS};

/// One verification finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationIssue {
    /// Stable machine-readable code (`E_*`).
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub field: Option<String>,
    pub detail: String,
}

impl VerificationIssue {
    fn new(code: &str, field: Option<&str>, detail: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            field: field.map(str::to_string),
            detail: detail.into(),
        }
    }
}

/// Outcome of the verification pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub valid: bool,
    pub errors: Vec<VerificationIssue>,
    pub warnings: Vec<VerificationIssue>,
    pub profile: Profile,
}

impl VerificationReport {
    #[must_use]
    pub fn error_codes(&self) -> Vec<&str> {
        self.errors.iter().map(|issue| issue.code.as_str()).collect()
    }

    #[must_use]
    pub fn has_error(&self, code: &str) -> bool {
        self.errors.iter().any(|issue| issue.code == code)
    }
}

/// Verification context: profile plus the registries and keyrings the
/// checks consult. No ambient state; callers thread everything in.
pub struct Verifier<'a> {
    profile: Profile,
    policies: &'a PolicyRuntime,
    log_keys: Option<&'a Keyring>,
    issuer_keys: Option<&'a Keyring>,
}

impl<'a> Verifier<'a> {
    #[must_use]
    pub fn new(profile: Profile, policies: &'a PolicyRuntime) -> Self {
        Self {
            profile,
            policies,
            log_keys: None,
            issuer_keys: None,
        }
    }

    /// Keyring that signs the transparency log's tree heads.
    #[must_use]
    pub fn with_log_keys(mut self, keyring: &'a Keyring) -> Self {
        self.log_keys = Some(keyring);
        self
    }

    /// Keyring of acceptable issuer keys (STRICT pins issuers to it).
    #[must_use]
    pub fn with_issuer_keys(mut self, keyring: &'a Keyring) -> Self {
        self.issuer_keys = Some(keyring);
        self
    }

    /// Verify receipt JSON text. Duplicate keys and malformed JSON become
    /// report errors, not panics or `Err`s.
    #[must_use]
    pub fn verify_json(&self, text: &str, now_ms: i64) -> VerificationReport {
        let mut report = self.empty_report();

        if let Err(err) = canonical_bytes_from_slice(text.as_bytes()) {
            report.errors.push(VerificationIssue::new(
                err.code(),
                None,
                err.to_string(),
            ));
            return report;
        }

        match serde_json::from_str::<FullReceipt>(text) {
            Ok(receipt) => self.verify(&receipt, now_ms),
            Err(err) => {
                let message = err.to_string();
                let code = if message.contains("missing field") {
                    "E_STRUCT_MISSING"
                } else {
                    "E_STRUCT_TYPE"
                };
                report
                    .errors
                    .push(VerificationIssue::new(code, None, message));
                report
            }
        }
    }

    /// Verify a parsed receipt.
    #[must_use]
    pub fn verify(&self, full: &FullReceipt, now_ms: i64) -> VerificationReport {
        let mut report = self.empty_report();
        let bounds = self.profile.bounds();

        self.check_structure(full, &bounds, &mut report);
        if !report.errors.is_empty() {
            return report;
        }

        self.check_temporal(full, &bounds, now_ms, &mut report);
        if !report.errors.is_empty() {
            return report;
        }

        self.check_signature(full, &mut report);
        if !report.errors.is_empty() {
            return report;
        }

        self.check_inclusion(full, &bounds, &mut report);
        if !report.errors.is_empty() {
            return report;
        }

        self.check_policies(full, &bounds, &mut report);
        report.valid = report.errors.is_empty();
        report
    }

    fn empty_report(&self) -> VerificationReport {
        VerificationReport {
            valid: false,
            errors: Vec::new(),
            warnings: Vec::new(),
            profile: self.profile,
        }
    }

    fn check_structure(
        &self,
        full: &FullReceipt,
        bounds: &ProfileBounds,
        report: &mut VerificationReport,
    ) {
        let receipt = &full.receipt;
        let errors = &mut report.errors;

        if receipt.version != RECEIPT_VERSION {
            errors.push(VerificationIssue::new(
                "E_STRUCT_TYPE",
                Some("version"),
                format!("unknown version {:?}", receipt.version),
            ));
        }
        if receipt.code_ref.is_empty() {
            errors.push(VerificationIssue::new(
                "E_STRUCT_MISSING",
                Some("code_ref"),
                "code_ref is empty",
            ));
        }

        for (field, value, expected) in [
            ("nonce", &receipt.nonce, NONCE_LEN),
            ("input_hash", &receipt.input_hash, HASH_LEN),
            ("output_hash", &receipt.output_hash, HASH_LEN),
            ("pubkey", &receipt.pubkey, PUBKEY_LEN),
            ("sig", &receipt.sig, SIG_LEN),
        ] {
            if let Err(err) = decode_b64url_exact(field, value, expected) {
                errors.push(VerificationIssue::new(err.code(), Some(field), err.to_string()));
            }
        }

        if bounds.require_policies && receipt.policy_ids.is_empty() {
            errors.push(VerificationIssue::new(
                "E_STRUCT_MISSING",
                Some("policy_ids"),
                "profile requires a non-empty policy set",
            ));
        }
        if receipt.policy_ids.iter().any(String::is_empty) {
            errors.push(VerificationIssue::new(
                "E_STRUCT_TYPE",
                Some("policy_ids"),
                "empty policy id",
            ));
        }
        if !receipt
            .policy_ids
            .windows(2)
            .all(|pair| pair[0] < pair[1])
        {
            errors.push(VerificationIssue::new(
                "E_STRUCT_TYPE",
                Some("policy_ids"),
                "policy_ids must be sorted ascending and unique",
            ));
        }
    }

    fn check_temporal(
        &self,
        full: &FullReceipt,
        bounds: &ProfileBounds,
        now_ms: i64,
        report: &mut VerificationReport,
    ) {
        let ts = full.receipt.ts;
        if ts > now_ms + bounds.max_skew_ms {
            report.errors.push(VerificationIssue::new(
                "E_TS_FUTURE",
                Some("ts"),
                format!(
                    "ts is {}ms ahead of the {}ms skew allowance",
                    ts - now_ms,
                    bounds.max_skew_ms
                ),
            ));
            return;
        }
        if ts <= now_ms - bounds.max_age_ms {
            report.errors.push(VerificationIssue::new(
                "E_TS_EXPIRED",
                Some("ts"),
                format!("receipt is older than {}ms", bounds.max_age_ms),
            ));
            return;
        }
        if now_ms - ts > STALENESS_WARNING_MS {
            report.warnings.push(VerificationIssue::new(
                "W_RECEIPT_STALE",
                Some("ts"),
                "receipt is older than one hour",
            ));
        }
    }

    fn check_signature(&self, full: &FullReceipt, report: &mut VerificationReport) {
        let receipt = &full.receipt;

        // Lengths were established structurally; decode cannot fail here.
        let Ok(pubkey_bytes) = decode_b64url_exact("pubkey", &receipt.pubkey, PUBKEY_LEN) else {
            return;
        };
        let Ok(sig_bytes) = decode_b64url_exact("sig", &receipt.sig, SIG_LEN) else {
            return;
        };

        let pubkey = match signer::parse_pubkey(&pubkey_bytes) {
            Ok(key) => key,
            Err(err) => {
                report.errors.push(VerificationIssue::new(
                    err.code(),
                    Some("pubkey"),
                    err.to_string(),
                ));
                return;
            }
        };

        let payload = match receipt.signing_bytes() {
            Ok(bytes) => bytes,
            Err(err) => {
                report.errors.push(VerificationIssue::new(
                    err.code(),
                    None,
                    err.to_string(),
                ));
                return;
            }
        };

        if signer::verify(&pubkey, &payload, &sig_bytes).is_err() {
            report.errors.push(VerificationIssue::new(
                "E_SIG_INVALID",
                Some("sig"),
                "signature does not verify over the canonical payload",
            ));
            return;
        }

        // STRICT pins issuers to a caller-supplied keyring when one exists.
        if self.profile == Profile::Strict {
            if let Some(issuer_keys) = self.issuer_keys {
                if let Err(err) = issuer_keys.resolve_pubkey(&pubkey, receipt.ts) {
                    report.errors.push(VerificationIssue::new(
                        err.code(),
                        Some("pubkey"),
                        err.to_string(),
                    ));
                }
            }
        }
    }

    fn check_inclusion(
        &self,
        full: &FullReceipt,
        bounds: &ProfileBounds,
        report: &mut VerificationReport,
    ) {
        let Some(inclusion) = &full.extensions.log_inclusion else {
            if bounds.require_inclusion {
                report.errors.push(VerificationIssue::new(
                    "E_STRUCT_MISSING",
                    Some("log_inclusion"),
                    "profile requires transparency-log inclusion",
                ));
            }
            return;
        };

        let leaf = match full.receipt.leaf() {
            Ok(leaf) => leaf,
            Err(err) => {
                report.errors.push(VerificationIssue::new(
                    err.code(),
                    None,
                    err.to_string(),
                ));
                return;
            }
        };

        let Ok(root) = decode_hex32("sth_root", &inclusion.sth_root) else {
            report.errors.push(VerificationIssue::new(
                "E_PROOF_MALFORMED",
                Some("sth_root"),
                "sth_root is not a 32-byte hex digest",
            ));
            return;
        };

        let mut path = Vec::with_capacity(inclusion.audit_path.len());
        for sibling in &inclusion.audit_path {
            match decode_hex32("audit_path", sibling) {
                Ok(digest) => path.push(digest),
                Err(_) => {
                    report.errors.push(VerificationIssue::new(
                        "E_PROOF_MALFORMED",
                        Some("audit_path"),
                        "audit path sibling is not a 32-byte hex digest",
                    ));
                    return;
                }
            }
        }

        if let Err(err) = merkle::verify_audit_path(&leaf, inclusion.leaf_index, &path, &root) {
            report.errors.push(VerificationIssue::new(
                err.code(),
                Some("log_inclusion"),
                err.to_string(),
            ));
            return;
        }

        self.check_sth(inclusion, &root, report);
    }

    fn check_sth(
        &self,
        inclusion: &LogInclusion,
        proven_root: &[u8; 32],
        report: &mut VerificationReport,
    ) {
        let strict = self.profile == Profile::Strict;

        let Some(sth) = &inclusion.sth else {
            if strict {
                report.errors.push(VerificationIssue::new(
                    "E_STH_UNSIGNED",
                    Some("log_inclusion"),
                    "profile requires a signed tree head",
                ));
            }
            return;
        };

        if sth.root != hex::encode(proven_root) {
            report.errors.push(VerificationIssue::new(
                "E_PROOF_MISMATCH",
                Some("log_inclusion"),
                "sth root does not match the proven root",
            ));
            return;
        }
        if sth.size < inclusion.leaf_index {
            report.errors.push(VerificationIssue::new(
                "E_PROOF_MALFORMED",
                Some("log_inclusion"),
                format!(
                    "leaf index {} exceeds sth size {}",
                    inclusion.leaf_index, sth.size
                ),
            ));
            return;
        }

        let Some(log_keys) = self.log_keys else {
            let issue = VerificationIssue::new(
                "E_STH_UNSIGNED",
                Some("log_inclusion"),
                "no log keyring supplied; sth signature not checked",
            );
            if strict {
                report.errors.push(issue);
            } else {
                report.warnings.push(issue);
            }
            return;
        };

        if let Err(err) = verify_sth(sth, log_keys) {
            report.errors.push(VerificationIssue::new(
                err.code(),
                Some("log_inclusion"),
                err.to_string(),
            ));
        }
    }

    fn check_policies(
        &self,
        full: &FullReceipt,
        bounds: &ProfileBounds,
        report: &mut VerificationReport,
    ) {
        for policy_id in &full.receipt.policy_ids {
            if self.policies.is_known(policy_id) {
                continue;
            }
            let issue = VerificationIssue::new(
                "E_POLICY_UNKNOWN",
                Some("policy_ids"),
                format!("policy {policy_id} is not in the registry"),
            );
            if bounds.unknown_policy_fatal {
                report.errors.push(issue);
            } else {
                report.warnings.push(issue);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;

    use crate::keyring::Keyring;
    use crate::ledger::store::{EntryMetadata, MemoryStore};
    use crate::ledger::TransparencyLedger;
    use crate::receipt::issuer::{attach_inclusion, CreateParams, ReceiptIssuer};

    const NOW: i64 = 1_750_000_000_000;

    fn issuer() -> ReceiptIssuer {
        ReceiptIssuer::new(
            SigningKey::from_bytes(&[8u8; 32]),
            PolicyRuntime::with_builtins(),
            Profile::Lite,
        )
    }

    fn lite_receipt() -> FullReceipt {
        issuer()
            .create(CreateParams {
                ts: Some(NOW),
                nonce: Some([0x42; NONCE_LEN]),
                ..CreateParams::new("git:abc", b"hello", b"world")
                    .with_policies(["no_retention"])
            })
            .expect("create")
    }

    fn policies() -> PolicyRuntime {
        PolicyRuntime::with_builtins()
    }

    #[test]
    fn valid_lite_receipt_passes() {
        let policies = policies();
        let verifier = Verifier::new(Profile::Lite, &policies);
        let report = verifier.verify(&lite_receipt(), NOW + 1_000);
        assert!(report.valid, "errors: {:?}", report.errors);
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn tampered_signature_is_sig_invalid() {
        let policies = policies();
        let verifier = Verifier::new(Profile::Lite, &policies);
        let mut full = lite_receipt();

        let mut sig = crate::encoding::decode_b64url("sig", &full.receipt.sig).expect("sig");
        sig[0] ^= 0x01;
        full.receipt.sig = crate::encoding::b64url(&sig);

        let report = verifier.verify(&full, NOW);
        assert!(!report.valid);
        assert_eq!(report.error_codes(), vec!["E_SIG_INVALID"]);
    }

    #[test]
    fn tampered_field_is_sig_invalid() {
        let policies = policies();
        let verifier = Verifier::new(Profile::Lite, &policies);
        let mut full = lite_receipt();
        full.receipt.code_ref = "git:evil".to_string();
        let report = verifier.verify(&full, NOW);
        assert!(report.has_error("E_SIG_INVALID"));
    }

    #[test]
    fn temporal_bounds_follow_the_profile() {
        let policies = policies();
        let lite = Verifier::new(Profile::Lite, &policies);
        let strict = Verifier::new(Profile::Strict, &policies);

        let mut expired = lite_receipt();
        expired.receipt.ts = NOW - 25 * 3_600_000;
        assert!(lite.verify(&expired, NOW).has_error("E_TS_EXPIRED"));

        let mut future = lite_receipt();
        future.receipt.ts = NOW + 180_000;
        assert!(lite.verify(&future, NOW).has_error("E_TS_FUTURE"));

        // +60s: inside LITE's 120s allowance, outside STRICT's 10s.
        let mut skewed = lite_receipt();
        skewed.receipt.ts = NOW + 60_000;
        assert!(lite.verify(&skewed, NOW).valid);
        assert!(strict.verify(&skewed, NOW).has_error("E_TS_FUTURE"));
    }

    #[test]
    fn old_receipt_draws_staleness_warning() {
        let policies = policies();
        let verifier = Verifier::new(Profile::Lite, &policies);
        let mut full = lite_receipt();
        full.receipt.ts = NOW - 2 * 3_600_000;
        let report = verifier.verify(&full, NOW);
        assert!(report.valid);
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(report.warnings[0].code, "W_RECEIPT_STALE");
    }

    #[test]
    fn structural_violations_short_circuit() {
        let policies = policies();
        let verifier = Verifier::new(Profile::Lite, &policies);
        let mut full = lite_receipt();
        full.receipt.nonce = crate::encoding::b64url(&[1u8; 8]);
        full.receipt.policy_ids = vec!["b".to_string(), "a".to_string()];

        let report = verifier.verify(&full, NOW);
        assert!(report.has_error("E_STRUCT_LEN"));
        assert!(report.has_error("E_STRUCT_TYPE"));
        // Signature stage never ran.
        assert!(!report.has_error("E_SIG_INVALID"));
    }

    #[test]
    fn unknown_policy_warns_in_lite_and_fails_in_strict() {
        let policies = policies();
        let full = issuer()
            .create(CreateParams {
                ts: Some(NOW),
                nonce: Some([0x42; NONCE_LEN]),
                ..CreateParams::new("git:abc", b"in", b"out")
                    .with_policies(["hipaa_safe", "no_retention"])
            })
            .expect("create");

        let lite = Verifier::new(Profile::Lite, &policies).verify(&full, NOW);
        assert!(lite.valid);
        assert_eq!(lite.warnings[0].code, "E_POLICY_UNKNOWN");

        // Same receipt under STRICT, with inclusion evidence so the policy
        // stage is what decides.
        let (full, ring) = logged_receipt(&["hipaa_safe", "no_retention"]);
        let strict = Verifier::new(Profile::Strict, &policies)
            .with_log_keys(&ring)
            .verify(&full, NOW);
        assert!(strict.has_error("E_POLICY_UNKNOWN"));
    }

    fn logged_receipt(policy_ids: &[&str]) -> (FullReceipt, Keyring) {
        let key = SigningKey::from_bytes(&[5u8; 32]);
        let ring = Keyring::with_active_key(&key.verifying_key(), 0);
        let mut ledger =
            TransparencyLedger::open(MemoryStore::new(), key, ring.clone(), NOW).expect("open");

        let mut full = issuer()
            .create(CreateParams {
                ts: Some(NOW),
                nonce: Some([0x42; NONCE_LEN]),
                ..CreateParams::new("git:abc", b"hello", b"world")
                    .with_policies(policy_ids.iter().copied())
            })
            .expect("create");

        // Surrounding entries make the audit path non-trivial.
        ledger
            .append(&[1u8; 32], EntryMetadata::default(), NOW)
            .expect("append");
        let outcome = ledger
            .append(&full.leaf().expect("leaf"), EntryMetadata::default(), NOW)
            .expect("append");
        ledger
            .append(&[3u8; 32], EntryMetadata::default(), NOW)
            .expect("append");

        // Re-prove against the final head.
        let proof = ledger.proof(outcome.seq).expect("proof");
        attach_inclusion(&mut full, &proof);
        (full, ring)
    }

    #[test]
    fn strict_receipt_with_inclusion_passes() {
        let policies = policies();
        let (full, ring) = logged_receipt(&["no_retention"]);
        let report = Verifier::new(Profile::Strict, &policies)
            .with_log_keys(&ring)
            .verify(&full, NOW + 1_000);
        assert!(report.valid, "errors: {:?}", report.errors);
    }

    #[test]
    fn strict_requires_inclusion() {
        let policies = policies();
        let full = issuer()
            .create(CreateParams {
                ts: Some(NOW),
                nonce: Some([0x42; NONCE_LEN]),
                ..CreateParams::new("git:abc", b"in", b"out").with_policies(["no_retention"])
            })
            .expect("create");
        let report = Verifier::new(Profile::Strict, &policies).verify(&full, NOW);
        assert!(report.has_error("E_STRUCT_MISSING"));
    }

    #[test]
    fn tampered_audit_path_is_proof_mismatch() {
        let policies = policies();
        let (mut full, ring) = logged_receipt(&["no_retention"]);
        let inclusion = full.extensions.log_inclusion.as_mut().expect("inclusion");
        let mut sibling = decode_hex32("audit_path", &inclusion.audit_path[0]).expect("sibling");
        sibling[0] ^= 0xff;
        inclusion.audit_path[0] = hex::encode(sibling);

        let report = Verifier::new(Profile::Strict, &policies)
            .with_log_keys(&ring)
            .verify(&full, NOW);
        assert!(report.has_error("E_PROOF_MISMATCH"));
    }

    #[test]
    fn sth_from_foreign_key_is_rejected() {
        let policies = policies();
        let (full, _) = logged_receipt(&["no_retention"]);
        let foreign =
            Keyring::with_active_key(&SigningKey::from_bytes(&[9u8; 32]).verifying_key(), 0);
        let report = Verifier::new(Profile::Strict, &policies)
            .with_log_keys(&foreign)
            .verify(&full, NOW);
        assert!(report.has_error("E_KEY_UNKNOWN"));
    }

    #[test]
    fn strict_checks_issuer_keyring() {
        let policies = policies();
        let (full, ring) = logged_receipt(&["no_retention"]);

        let issuer_ring =
            Keyring::with_active_key(&SigningKey::from_bytes(&[8u8; 32]).verifying_key(), 0);
        let ok = Verifier::new(Profile::Strict, &policies)
            .with_log_keys(&ring)
            .with_issuer_keys(&issuer_ring)
            .verify(&full, NOW);
        assert!(ok.valid, "errors: {:?}", ok.errors);

        let wrong_ring =
            Keyring::with_active_key(&SigningKey::from_bytes(&[1u8; 32]).verifying_key(), 0);
        let rejected = Verifier::new(Profile::Strict, &policies)
            .with_log_keys(&ring)
            .with_issuer_keys(&wrong_ring)
            .verify(&full, NOW);
        assert!(rejected.has_error("E_KEY_UNKNOWN"));
    }

    #[test]
    fn verify_json_reports_shape_problems() {
        let policies = policies();
        let verifier = Verifier::new(Profile::Lite, &policies);

        let report = verifier.verify_json("{\"version\":\"TECP-0.1\"}", NOW);
        assert!(report.has_error("E_STRUCT_MISSING"));

        let report = verifier.verify_json("{\"a\":1,\"a\":2}", NOW);
        assert!(report.has_error("E_C14N_DUPLICATE_KEY"));

        let report = verifier.verify_json("not json", NOW);
        assert!(!report.valid);
    }

    #[test]
    fn verify_json_round_trips_a_real_receipt() {
        let policies = policies();
        let text = serde_json::to_string(&lite_receipt()).expect("serialize");
        let report = Verifier::new(Profile::Lite, &policies).verify_json(&text, NOW);
        assert!(report.valid, "errors: {:?}", report.errors);
    }
}
