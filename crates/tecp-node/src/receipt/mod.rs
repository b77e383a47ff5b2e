//! Receipt model: the nine signed core fields, typed unsigned extensions,
//! and leaf derivation.
//!
//! A receipt binds `{code_ref, input_hash, output_hash, policy_ids, ts,
//! nonce}` under an Ed25519 signature over the canonical bytes of the other
//! eight fields. Extensions ride alongside the core and never contribute to
//! the signed bytes or the ledger leaf.

pub mod canonical;
pub mod issuer;
pub mod signer;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ledger::sth::SignedTreeHead;
use self::canonical::{canonical_bytes, sha256, CanonicalError};

/// Wire-format version string carried by every receipt.
pub const RECEIPT_VERSION: &str = "TECP-0.1";

/// Nonce length in bytes (before base64url encoding).
pub const NONCE_LEN: usize = 16;

/// Decoded length of `input_hash` / `output_hash`.
pub const HASH_LEN: usize = 32;

/// Soft ceiling on serialized receipt size.
pub const MAX_WIRE_BYTES: usize = 8 * 1024;

/// Upper bound on entries in the free-form `ext` extension map.
pub const MAX_EXT_ENTRIES: usize = 16;

/// The nine signed core fields of a receipt.
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

impl Receipt {
    /// Canonical 8-field payload the signature covers (everything but `sig`).
    #[must_use]
    pub fn signing_payload(&self) -> Value {
        Value::Object(self.base_fields())
    }

    /// Canonical 9-field value, `sig` included. Leaf hashes cover this.
    #[must_use]
    pub fn core_value(&self) -> Value {
        let mut fields = self.base_fields();
        fields.insert("sig".to_string(), Value::String(self.sig.clone()));
        Value::Object(fields)
    }

    /// Canonical bytes of the 8-field signing payload.
    pub fn signing_bytes(&self) -> Result<Vec<u8>, CanonicalError> {
        canonical_bytes(&self.signing_payload())
    }

    /// Canonical bytes of the full signed receipt.
    pub fn canonical_receipt_bytes(&self) -> Result<Vec<u8>, CanonicalError> {
        canonical_bytes(&self.core_value())
    }

    /// Ledger leaf: `sha256(canonical_bytes(receipt_with_sig))`. Frozen.
    pub fn leaf(&self) -> Result<[u8; 32], CanonicalError> {
        Ok(sha256(&self.canonical_receipt_bytes()?))
    }

    /// Leaf rendered the way the ledger wire surface expects it.
    pub fn leaf_hex(&self) -> Result<String, CanonicalError> {
        Ok(hex::encode(self.leaf()?))
    }

    fn base_fields(&self) -> Map<String, Value> {
        let mut fields = Map::new();
        fields.insert(
            "version".to_string(),
            Value::String(self.version.clone()),
        );
        fields.insert(
            "code_ref".to_string(),
            Value::String(self.code_ref.clone()),
        );
        fields.insert("ts".to_string(), Value::from(self.ts));
        fields.insert("nonce".to_string(), Value::String(self.nonce.clone()));
        fields.insert(
            "input_hash".to_string(),
            Value::String(self.input_hash.clone()),
        );
        fields.insert(
            "output_hash".to_string(),
            Value::String(self.output_hash.clone()),
        );
        fields.insert(
            "policy_ids".to_string(),
            Value::Array(
                self.policy_ids
                    .iter()
                    .map(|id| Value::String(id.clone()))
                    .collect(),
            ),
        );
        fields.insert("pubkey".to_string(), Value::String(self.pubkey.clone()));
        fields
    }
}

/// Transparency-log inclusion evidence. Unsigned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogInclusion {
    /// 1-based sequence of the leaf in the log.
    pub leaf_index: u64,
    /// Sibling hashes, leaf to root, lowercase hex.
    pub audit_path: Vec<String>,
    /// Root the audit path resolves to, lowercase hex.
    pub sth_root: String,
    /// The signed tree head attesting that root, when the log supplied one.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub sth: Option<SignedTreeHead>,
}

/// Key-erasure attestation. Unsigned, evidence-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyErasure {
    pub scheme: String,
    pub evidence: String,
}

/// Execution environment metadata. Unsigned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentExt {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub region: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub provider: Option<String>,
}

/// Countersigned timestamp from an external time anchor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTime {
    pub ts: i64,
    pub sig: String,
    pub kid: String,
}

/// External anchors attached to a receipt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Anchors {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub signed_time: Option<SignedTime>,
}

impl Anchors {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.signed_time.is_none()
    }
}

/// All optional, unsigned receipt extensions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReceiptExtensions {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub log_inclusion: Option<LogInclusion>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub key_erasure: Option<KeyErasure>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub environment: Option<EnvironmentExt>,
    #[serde(skip_serializing_if = "Anchors::is_empty", default)]
    pub anchors: Anchors,
    /// Bounded free-form extension map (`ext.policy_enforced` lives here).
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub ext: Option<BTreeMap<String, Value>>,
}

impl ReceiptExtensions {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.log_inclusion.is_none()
            && self.key_erasure.is_none()
            && self.environment.is_none()
            && self.anchors.is_empty()
            && self.ext.is_none()
    }
}

/// A receipt together with its unsigned extensions, as serialized on the
/// wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FullReceipt {
    #[serde(flatten)]
    pub receipt: Receipt,
    #[serde(flatten)]
    pub extensions: ReceiptExtensions,
}

impl FullReceipt {
    #[must_use]
    pub fn new(receipt: Receipt) -> Self {
        Self {
            receipt,
            extensions: ReceiptExtensions::default(),
        }
    }

    /// Extensions never feed the leaf; this is the core receipt's leaf.
    pub fn leaf(&self) -> Result<[u8; 32], CanonicalError> {
        self.receipt.leaf()
    }
}
