//! Offline verifier for TECP receipts.
//!
//! Deliberately standalone: an auditor holding a receipt, the issuer's
//! public key (inside the receipt), and the log's pinned public keys can
//! check everything here with no network and no dependency on the node
//! crate. The canonicalization and hashing rules are restated from the wire
//! specification; cross-implementation agreement is what the golden tests
//! pin down.

#![forbid(unsafe_code)]

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use ed25519_dalek::{Signature, Verifier as _, VerifyingKey};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

pub const RECEIPT_VERSION: &str = "TECP-0.1";

const HOUR_MS: i64 = 3_600_000;

/// The nine signed receipt fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub version: String,
    pub code_ref: String,
    pub ts: i64,
    pub nonce: String,
    pub input_hash: String,
    pub output_hash: String,
    pub policy_ids: Vec<String>,
    pub pubkey: String,
    pub sig: String,
}

/// Signed tree head published by the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTreeHead {
    pub size: u64,
    pub root: String,
    pub ts: i64,
    pub kid: String,
    pub sig: String,
}

/// Inclusion evidence carried by a receipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogInclusion {
    pub leaf_index: u64,
    pub audit_path: Vec<String>,
    pub sth_root: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub sth: Option<SignedTreeHead>,
}

/// Receipt plus the extensions this SDK consumes. Unknown extensions are
/// ignored; they are unsigned by construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullReceipt {
    #[serde(flatten)]
    pub receipt: Receipt,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub log_inclusion: Option<LogInclusion>,
}

/// A log key the auditor trusts, with its validity window (ms since epoch;
/// `not_after = None` means unexpired).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinnedLogKey {
    pub kid: String,
    /// base64url public key, no padding.
    pub pubkey: String,
    pub not_before: i64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub not_after: Option<i64>,
}

/// Stable-coded verification failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyError {
    Structure { code: &'static str, detail: String },
    Canonical { code: &'static str, detail: String },
    Timestamp { code: &'static str },
    SignatureInvalid,
    ProofMalformed { detail: String },
    ProofMismatch,
    SthUnsigned,
    SthExpired { kid: String },
    KeyUnknown { kid: String },
}

impl VerifyError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Structure { code, .. } | Self::Canonical { code, .. } => code,
            Self::Timestamp { code } => code,
            Self::SignatureInvalid => "E_SIG_INVALID",
            Self::ProofMalformed { .. } => "E_PROOF_MALFORMED",
            Self::ProofMismatch => "E_PROOF_MISMATCH",
            Self::SthUnsigned => "E_STH_UNSIGNED",
            Self::SthExpired { .. } => "E_STH_EXPIRED",
            Self::KeyUnknown { .. } => "E_KEY_UNKNOWN",
        }
    }
}

impl std::fmt::Display for VerifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Structure { code, detail } | Self::Canonical { code, detail } => {
                write!(f, "{code}: {detail}")
            }
            Self::Timestamp { code } => write!(f, "{code}"),
            Self::SignatureInvalid => write!(f, "E_SIG_INVALID: signature rejected"),
            Self::ProofMalformed { detail } => write!(f, "E_PROOF_MALFORMED: {detail}"),
            Self::ProofMismatch => write!(f, "E_PROOF_MISMATCH: recomputed root differs"),
            Self::SthUnsigned => write!(f, "E_STH_UNSIGNED: no verifiable tree head"),
            Self::SthExpired { kid } => write!(f, "E_STH_EXPIRED: key {kid} out of window"),
            Self::KeyUnknown { kid } => write!(f, "E_KEY_UNKNOWN: key {kid} not pinned"),
        }
    }
}

impl std::error::Error for VerifyError {}

// ── Canonical bytes ─────────────────────────────────────────────────

/// Compact JSON with code-point-sorted keys and integers only.
pub fn canonical_bytes(value: &Value) -> Result<Vec<u8>, VerifyError> {
    let canonical = canonicalize(value)?;
    serde_json::to_vec(&canonical).map_err(|e| VerifyError::Canonical {
        code: "E_C14N_TYPE",
        detail: e.to_string(),
    })
}

fn canonicalize(value: &Value) -> Result<Value, VerifyError> {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let mut sorted = Map::with_capacity(entries.len());
            for (key, nested) in entries {
                sorted.insert(key.clone(), canonicalize(nested)?);
            }
            Ok(Value::Object(sorted))
        }
        Value::Array(values) => Ok(Value::Array(
            values.iter().map(canonicalize).collect::<Result<_, _>>()?,
        )),
        Value::Number(n) if !(n.is_i64() || n.is_u64()) => Err(VerifyError::Canonical {
            code: "E_C14N_FLOAT",
            detail: "non-integer number in signed payload".to_string(),
        }),
        other => Ok(other.clone()),
    }
}

fn receipt_value(receipt: &Receipt, include_sig: bool) -> Value {
    let mut fields = Map::new();
    fields.insert("version".into(), Value::String(receipt.version.clone()));
    fields.insert("code_ref".into(), Value::String(receipt.code_ref.clone()));
    fields.insert("ts".into(), Value::from(receipt.ts));
    fields.insert("nonce".into(), Value::String(receipt.nonce.clone()));
    fields.insert(
        "input_hash".into(),
        Value::String(receipt.input_hash.clone()),
    );
    fields.insert(
        "output_hash".into(),
        Value::String(receipt.output_hash.clone()),
    );
    fields.insert(
        "policy_ids".into(),
        Value::Array(
            receipt
                .policy_ids
                .iter()
                .map(|id| Value::String(id.clone()))
                .collect(),
        ),
    );
    fields.insert("pubkey".into(), Value::String(receipt.pubkey.clone()));
    if include_sig {
        fields.insert("sig".into(), Value::String(receipt.sig.clone()));
    }
    Value::Object(fields)
}

/// `sha256(canonical_bytes(receipt_with_sig))`, lowercase hex. Frozen.
pub fn leaf_hex(receipt: &Receipt) -> Result<String, VerifyError> {
    let bytes = canonical_bytes(&receipt_value(receipt, true))?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

// ── Decoding ────────────────────────────────────────────────────────

/// base64url decode, normalizing padded / standard-alphabet input.
pub fn decode_b64(field: &'static str, value: &str) -> Result<Vec<u8>, VerifyError> {
    let normalized: String = value
        .trim_end_matches('=')
        .chars()
        .map(|c| match c {
            '+' => '-',
            '/' => '_',
            other => other,
        })
        .collect();
    URL_SAFE_NO_PAD
        .decode(normalized.as_bytes())
        .map_err(|_| VerifyError::Structure {
            code: "E_STRUCT_TYPE",
            detail: format!("{field} is not base64url"),
        })
}

fn decode_b64_exact(
    field: &'static str,
    value: &str,
    expected: usize,
) -> Result<Vec<u8>, VerifyError> {
    let bytes = decode_b64(field, value)?;
    if bytes.len() != expected {
        return Err(VerifyError::Structure {
            code: "E_STRUCT_LEN",
            detail: format!("{field} decodes to {} bytes, expected {expected}", bytes.len()),
        });
    }
    Ok(bytes)
}

fn decode_hex32(field: &'static str, value: &str) -> Result<[u8; 32], VerifyError> {
    let bytes = hex::decode(value).map_err(|_| VerifyError::Structure {
        code: "E_STRUCT_TYPE",
        detail: format!("{field} is not hex"),
    })?;
    bytes.try_into().map_err(|_| VerifyError::Structure {
        code: "E_STRUCT_LEN",
        detail: format!("{field} is not 32 bytes"),
    })
}

// ── Checks ──────────────────────────────────────────────────────────

/// Structural shape: version, field lengths, policy ordering.
pub fn check_structure(receipt: &Receipt) -> Result<(), VerifyError> {
    if receipt.version != RECEIPT_VERSION {
        return Err(VerifyError::Structure {
            code: "E_STRUCT_TYPE",
            detail: format!("unknown version {:?}", receipt.version),
        });
    }
    decode_b64_exact("nonce", &receipt.nonce, 16)?;
    decode_b64_exact("input_hash", &receipt.input_hash, 32)?;
    decode_b64_exact("output_hash", &receipt.output_hash, 32)?;
    decode_b64_exact("pubkey", &receipt.pubkey, 32)?;
    decode_b64_exact("sig", &receipt.sig, 64)?;
    if !receipt.policy_ids.windows(2).all(|w| w[0] < w[1]) {
        return Err(VerifyError::Structure {
            code: "E_STRUCT_TYPE",
            detail: "policy_ids must be sorted and unique".to_string(),
        });
    }
    Ok(())
}

/// Temporal admission: `ts` within `(now - max_age, now + max_skew]`.
pub fn check_timestamp(
    ts: i64,
    now_ms: i64,
    max_age_ms: i64,
    max_skew_ms: i64,
) -> Result<(), VerifyError> {
    if ts > now_ms + max_skew_ms {
        return Err(VerifyError::Timestamp { code: "E_TS_FUTURE" });
    }
    if ts <= now_ms - max_age_ms {
        return Err(VerifyError::Timestamp {
            code: "E_TS_EXPIRED",
        });
    }
    Ok(())
}

/// Ed25519 check over the canonical 8-field payload.
pub fn verify_signature(receipt: &Receipt) -> Result<(), VerifyError> {
    let pubkey_bytes = decode_b64_exact("pubkey", &receipt.pubkey, 32)?;
    let sig_bytes = decode_b64_exact("sig", &receipt.sig, 64)?;

    let pubkey_arr: [u8; 32] = pubkey_bytes.try_into().expect("length checked");
    let pubkey = VerifyingKey::from_bytes(&pubkey_arr).map_err(|_| VerifyError::KeyUnknown {
        kid: receipt.pubkey.clone(),
    })?;
    let signature =
        Signature::from_slice(&sig_bytes).map_err(|_| VerifyError::SignatureInvalid)?;

    let payload = canonical_bytes(&receipt_value(receipt, false))?;
    pubkey
        .verify(&payload, &signature)
        .map_err(|_| VerifyError::SignatureInvalid)
}

/// Walk the audit path from the receipt's leaf to the claimed root.
///
/// Leaf hashing is `sha256(0x00 || leaf)`, node hashing
/// `sha256(0x01 || l || r)`; bit `i` of the zero-based index picks the
/// sibling side.
pub fn verify_inclusion(receipt: &Receipt, inclusion: &LogInclusion) -> Result<(), VerifyError> {
    if inclusion.leaf_index == 0 {
        return Err(VerifyError::ProofMalformed {
            detail: "leaf_index is 1-based".to_string(),
        });
    }
    if inclusion.audit_path.len() >= 64 {
        return Err(VerifyError::ProofMalformed {
            detail: "audit path too long".to_string(),
        });
    }
    let index = inclusion.leaf_index - 1;
    if index >> inclusion.audit_path.len() != 0 {
        return Err(VerifyError::ProofMalformed {
            detail: "leaf_index does not fit the path length".to_string(),
        });
    }

    let leaf = decode_hex32("leaf", &leaf_hex(receipt)?)?;
    let expected_root = decode_hex32("sth_root", &inclusion.sth_root)?;

    let mut current: [u8; 32] = {
        let mut hasher = Sha256::new();
        hasher.update([0x00]);
        hasher.update(leaf);
        hasher.finalize().into()
    };

    for (i, sibling_hex) in inclusion.audit_path.iter().enumerate() {
        let sibling = decode_hex32("audit_path", sibling_hex)?;
        let (left, right) = if (index >> i) & 1 == 1 {
            (sibling, current)
        } else {
            (current, sibling)
        };
        let mut hasher = Sha256::new();
        hasher.update([0x01]);
        hasher.update(left);
        hasher.update(right);
        current = hasher.finalize().into();
    }

    if bool::from(current[..].ct_eq(&expected_root[..])) {
        Ok(())
    } else {
        Err(VerifyError::ProofMismatch)
    }
}

/// Check an STH signature against the pinned log keys.
pub fn verify_sth(sth: &SignedTreeHead, pinned: &[PinnedLogKey]) -> Result<(), VerifyError> {
    let key = pinned
        .iter()
        .find(|key| key.kid == sth.kid)
        .ok_or_else(|| VerifyError::KeyUnknown {
            kid: sth.kid.clone(),
        })?;
    let in_window =
        sth.ts >= key.not_before && key.not_after.map_or(true, |end| sth.ts < end);
    if !in_window {
        return Err(VerifyError::SthExpired {
            kid: sth.kid.clone(),
        });
    }

    let pubkey_bytes = decode_b64_exact("pubkey", &key.pubkey, 32)?;
    let pubkey_arr: [u8; 32] = pubkey_bytes.try_into().expect("length checked");
    let pubkey = VerifyingKey::from_bytes(&pubkey_arr).map_err(|_| VerifyError::KeyUnknown {
        kid: sth.kid.clone(),
    })?;

    let mut fields = Map::new();
    fields.insert("kid".into(), Value::String(sth.kid.clone()));
    fields.insert("root".into(), Value::String(sth.root.clone()));
    fields.insert("size".into(), Value::from(sth.size));
    fields.insert("ts".into(), Value::from(sth.ts));
    let payload = canonical_bytes(&Value::Object(fields))?;

    let sig_bytes = decode_b64_exact("sig", &sth.sig, 64).map_err(|_| VerifyError::SthUnsigned)?;
    let signature =
        Signature::from_slice(&sig_bytes).map_err(|_| VerifyError::SthUnsigned)?;
    pubkey
        .verify(&payload, &signature)
        .map_err(|_| VerifyError::SignatureInvalid)
}

/// Current wall-clock time in ms since epoch, for callers without their own
/// clock source.
#[must_use]
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Admission strictness for [`verify_offline`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strictness {
    /// 24h age, 120s skew, inclusion optional.
    Lite,
    /// 24h age, 10s skew, verified inclusion required.
    Strict,
}

/// Full offline verification. Returns every failure, not just the first.
#[must_use]
pub fn verify_offline(
    full: &FullReceipt,
    pinned_log_keys: &[PinnedLogKey],
    now_ms: i64,
    strictness: Strictness,
) -> Vec<VerifyError> {
    let mut errors = Vec::new();
    let (max_skew, require_inclusion) = match strictness {
        Strictness::Lite => (120_000, false),
        Strictness::Strict => (10_000, true),
    };

    if let Err(err) = check_structure(&full.receipt) {
        errors.push(err);
        return errors;
    }
    if let Err(err) = check_timestamp(full.receipt.ts, now_ms, 24 * HOUR_MS, max_skew) {
        errors.push(err);
    }
    if let Err(err) = verify_signature(&full.receipt) {
        errors.push(err);
    }

    match &full.log_inclusion {
        None => {
            if require_inclusion {
                errors.push(VerifyError::ProofMalformed {
                    detail: "inclusion proof required".to_string(),
                });
            }
        }
        Some(inclusion) => {
            if let Err(err) = verify_inclusion(&full.receipt, inclusion) {
                errors.push(err);
            }
            match &inclusion.sth {
                Some(sth) if sth.root == inclusion.sth_root => {
                    if let Err(err) = verify_sth(sth, pinned_log_keys) {
                        errors.push(err);
                    }
                }
                Some(_) => errors.push(VerifyError::ProofMismatch),
                None if require_inclusion => errors.push(VerifyError::SthUnsigned),
                None => {}
            }
        }
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // Keys and fixtures come from the node crate so the SDK is checked
    // against the reference issuer byte-for-byte.
    use ed25519_dalek::SigningKey;
    use tecp_node::keyring::Keyring;
    use tecp_node::ledger::store::{EntryMetadata, MemoryStore};
    use tecp_node::ledger::TransparencyLedger;
    use tecp_node::policy::PolicyRuntime;
    use tecp_node::receipt::issuer::{attach_inclusion, CreateParams, ReceiptIssuer};

    const NOW: i64 = 1_750_000_000_000;

    fn issued() -> FullReceipt {
        let issuer = ReceiptIssuer::new(
            SigningKey::from_bytes(&[8u8; 32]),
            PolicyRuntime::with_builtins(),
            tecp_node::verify::profile::Profile::Lite,
        );
        let mut full = issuer
            .create(CreateParams {
                ts: Some(NOW),
                nonce: Some([0x42; 16]),
                ..CreateParams::new("git:abc", b"hello", b"world")
                    .with_policies(["no_retention"])
            })
            .expect("create");

        let log_key = SigningKey::from_bytes(&[5u8; 32]);
        let ring = Keyring::with_active_key(&log_key.verifying_key(), 0);
        let mut ledger =
            TransparencyLedger::open(MemoryStore::new(), log_key, ring, NOW).expect("open");
        ledger
            .append(&[1u8; 32], EntryMetadata::default(), NOW)
            .expect("append");
        let outcome = ledger
            .append(&full.leaf().expect("leaf"), EntryMetadata::default(), NOW)
            .expect("append");
        let proof = ledger.proof(outcome.seq).expect("proof");
        attach_inclusion(&mut full, &proof);

        let text = serde_json::to_string(&full).expect("serialize");
        serde_json::from_str(&text).expect("parse into sdk types")
    }

    fn pinned() -> Vec<PinnedLogKey> {
        let log_key = SigningKey::from_bytes(&[5u8; 32]);
        let ring = Keyring::with_active_key(&log_key.verifying_key(), 0);
        let jwk = &ring.to_jwks().keys[0];
        vec![PinnedLogKey {
            kid: jwk.kid.clone(),
            pubkey: jwk.x.clone(),
            not_before: jwk.not_before,
            not_after: jwk.not_after,
        }]
    }

    #[test]
    fn canonical_bytes_sort_keys_and_reject_floats() {
        let bytes = canonical_bytes(&json!({"b": 1, "a": 2})).expect("canonical");
        assert_eq!(bytes, br#"{"a":2,"b":1}"#);
        let err = canonical_bytes(&json!({"x": 0.5})).expect_err("float");
        assert_eq!(err.code(), "E_C14N_FLOAT");
    }

    #[test]
    fn leaf_matches_the_node_implementation() {
        let full = issued();
        let node_leaf = {
            let issuer = ReceiptIssuer::new(
                SigningKey::from_bytes(&[8u8; 32]),
                PolicyRuntime::with_builtins(),
                tecp_node::verify::profile::Profile::Lite,
            );
            issuer
                .create(CreateParams {
                    ts: Some(NOW),
                    nonce: Some([0x42; 16]),
                    ..CreateParams::new("git:abc", b"hello", b"world")
                        .with_policies(["no_retention"])
                })
                .expect("create")
                .receipt
                .leaf_hex()
                .expect("leaf")
        };
        assert_eq!(leaf_hex(&full.receipt).expect("leaf"), node_leaf);
    }

    #[test]
    fn signature_and_structure_pass_for_reference_receipts() {
        let full = issued();
        check_structure(&full.receipt).expect("structure");
        verify_signature(&full.receipt).expect("signature");
    }

    #[test]
    fn inclusion_proof_replays_against_the_sth_root() {
        let full = issued();
        let inclusion = full.log_inclusion.as_ref().expect("inclusion");
        verify_inclusion(&full.receipt, inclusion).expect("inclusion");
        verify_sth(inclusion.sth.as_ref().expect("sth"), &pinned()).expect("sth");
    }

    #[test]
    fn offline_verification_is_clean_under_strict() {
        let full = issued();
        let errors = verify_offline(&full, &pinned(), NOW + 1_000, Strictness::Strict);
        assert!(errors.is_empty(), "errors: {errors:?}");
    }

    #[test]
    fn tampering_is_caught_offline() {
        let mut full = issued();
        full.receipt.code_ref = "git:evil".to_string();
        let errors = verify_offline(&full, &pinned(), NOW, Strictness::Strict);
        assert!(errors.iter().any(|e| e.code() == "E_SIG_INVALID"));
        // The leaf changed too, so the inclusion proof breaks with it.
        assert!(errors.iter().any(|e| e.code() == "E_PROOF_MISMATCH"));
    }

    #[test]
    fn unknown_log_key_is_reported() {
        let full = issued();
        let errors = verify_offline(&full, &[], NOW, Strictness::Strict);
        assert!(errors.iter().any(|e| e.code() == "E_KEY_UNKNOWN"));
    }

    #[test]
    fn strict_timestamps_are_tight() {
        assert!(check_timestamp(NOW + 5_000, NOW, 24 * HOUR_MS, 10_000).is_ok());
        assert_eq!(
            check_timestamp(NOW + 15_000, NOW, 24 * HOUR_MS, 10_000)
                .expect_err("future")
                .code(),
            "E_TS_FUTURE"
        );
        assert_eq!(
            check_timestamp(NOW - 25 * HOUR_MS, NOW, 24 * HOUR_MS, 10_000)
                .expect_err("expired")
                .code(),
            "E_TS_EXPIRED"
        );
    }
}
