//! STRICT and LITE admission scenarios across the full pipeline.

use ed25519_dalek::SigningKey;

use tecp_node::keyring::Keyring;
use tecp_node::ledger::store::{EntryMetadata, MemoryStore};
use tecp_node::ledger::TransparencyLedger;
use tecp_node::policy::PolicyRuntime;
use tecp_node::receipt::issuer::{attach_inclusion, CreateParams, ReceiptIssuer};
use tecp_node::receipt::{FullReceipt, NONCE_LEN};
use tecp_node::verify::profile::Profile;
use tecp_node::verify::Verifier;

const NOW: i64 = 1_750_000_000_000;

fn issuer() -> ReceiptIssuer {
    ReceiptIssuer::new(
        SigningKey::from_bytes(&[8u8; 32]),
        PolicyRuntime::with_builtins(),
        Profile::Lite,
    )
}

fn receipt_with_policies(policy_ids: &[&str]) -> FullReceipt {
    issuer()
        .create(CreateParams {
            ts: Some(NOW),
            nonce: Some([0x42; NONCE_LEN]),
            ..CreateParams::new("git:abc", b"hello", b"world")
                .with_policies(policy_ids.iter().copied())
        })
        .expect("create")
}

/// Anchor a receipt in a fresh ledger and return it with inclusion evidence
/// plus the log keyring.
fn anchored(mut full: FullReceipt) -> (FullReceipt, Keyring) {
    let key = SigningKey::from_bytes(&[5u8; 32]);
    let ring = Keyring::with_active_key(&key.verifying_key(), 0);
    let mut ledger =
        TransparencyLedger::open(MemoryStore::new(), key, ring.clone(), NOW).expect("open");
    let outcome = ledger
        .append(&full.leaf().expect("leaf"), EntryMetadata::default(), NOW)
        .expect("append");
    attach_inclusion(&mut full, &outcome.proof);
    (full, ring)
}

#[test]
fn lite_accepts_an_empty_policy_set() {
    let policies = PolicyRuntime::with_builtins();
    let full = receipt_with_policies(&[]);
    let report = Verifier::new(Profile::Lite, &policies).verify(&full, NOW);
    assert!(report.valid, "errors: {:?}", report.errors);
}

#[test]
fn strict_rejects_an_empty_policy_set_structurally() {
    let policies = PolicyRuntime::with_builtins();
    let full = receipt_with_policies(&[]);
    let report = Verifier::new(Profile::Strict, &policies).verify(&full, NOW);
    assert!(!report.valid);
    assert!(report
        .error_codes()
        .iter()
        .all(|code| code.starts_with("E_STRUCT_")));
}

#[test]
fn strict_passes_with_known_policy_and_anchoring() {
    let policies = PolicyRuntime::with_builtins();
    let (full, ring) = anchored(receipt_with_policies(&["no_retention"]));
    let report = Verifier::new(Profile::Strict, &policies)
        .with_log_keys(&ring)
        .verify(&full, NOW + 1_000);
    assert!(report.valid, "errors: {:?}", report.errors);
    assert!(report.warnings.is_empty());
}

#[test]
fn strict_without_inclusion_is_rejected() {
    let policies = PolicyRuntime::with_builtins();
    let full = receipt_with_policies(&["no_retention"]);
    let report = Verifier::new(Profile::Strict, &policies).verify(&full, NOW);
    assert!(report.has_error("E_STRUCT_MISSING"));
}

#[test]
fn strict_requires_the_sth_signature() {
    let policies = PolicyRuntime::with_builtins();
    let (mut full, ring) = anchored(receipt_with_policies(&["no_retention"]));

    // Strip the signed head, leaving only the bare root claim.
    full.extensions
        .log_inclusion
        .as_mut()
        .expect("inclusion")
        .sth = None;

    let strict = Verifier::new(Profile::Strict, &policies)
        .with_log_keys(&ring)
        .verify(&full, NOW);
    assert!(strict.has_error("E_STH_UNSIGNED"));

    // LITE tolerates an unauthenticated root.
    let lite = Verifier::new(Profile::Lite, &policies)
        .with_log_keys(&ring)
        .verify(&full, NOW);
    assert!(lite.valid, "errors: {:?}", lite.errors);
}

#[test]
fn unknown_policy_is_a_warning_in_lite_and_an_error_in_strict() {
    let policies = PolicyRuntime::with_builtins();
    let (full, ring) = anchored(receipt_with_policies(&["hipaa_safe", "no_retention"]));

    let lite = Verifier::new(Profile::Lite, &policies)
        .with_log_keys(&ring)
        .verify(&full, NOW);
    assert!(lite.valid);
    assert!(lite
        .warnings
        .iter()
        .any(|issue| issue.code == "E_POLICY_UNKNOWN"));

    let strict = Verifier::new(Profile::Strict, &policies)
        .with_log_keys(&ring)
        .verify(&full, NOW);
    assert!(strict.has_error("E_POLICY_UNKNOWN"));
}

#[test]
fn policy_enforcement_evidence_rides_unsigned() {
    let policies = PolicyRuntime::with_builtins();
    let full = issuer()
        .create(CreateParams {
            ts: Some(NOW),
            nonce: Some([0x42; NONCE_LEN]),
            ..CreateParams::new("git:abc", b"email bob@example.com", b"out")
                .with_policies(["no_pii", "no_retention"])
        })
        .expect("create");

    let ext = full.extensions.ext.as_ref().expect("ext");
    let enforced = ext.get("policy_enforced").expect("evidence");
    assert_eq!(enforced["no_pii"]["matches"]["email"], 1);

    // Evidence presence does not disturb verification.
    let report = Verifier::new(Profile::Lite, &policies).verify(&full, NOW);
    assert!(report.valid, "errors: {:?}", report.errors);
}
