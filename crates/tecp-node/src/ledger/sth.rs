//! Signed tree heads.
//!
//! An STH attests `{size, root, ts, kid}` under an Ed25519 signature over
//! the canonical bytes of exactly those four fields; the root travels as
//! lowercase hex, the signature as base64url without padding. A new head is
//! signed on every append and on demand, always with the keyring's active
//! key.

use ed25519_dalek::SigningKey;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::encoding::{b64url, decode_b64url};
use crate::keyring::{derive_kid, Keyring, KeyringError};
use crate::receipt::canonical::{canonical_bytes, CanonicalError};
use crate::receipt::signer;

/// Signed tree head for the ledger at a given size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTreeHead {
    pub size: u64,
    /// Tree root, lowercase hex.
    pub root: String,
    /// Signing time, ms since epoch.
    pub ts: i64,
    pub kid: String,
    /// Ed25519 signature over `canonical_bytes({kid, root, size, ts})`,
    /// base64url without padding.
    pub sig: String,
}

impl SignedTreeHead {
    /// Canonical payload the signature covers.
    #[must_use]
    pub fn signing_payload(size: u64, root: &str, ts: i64, kid: &str) -> Value {
        let mut fields = Map::new();
        fields.insert("kid".to_string(), Value::String(kid.to_string()));
        fields.insert("root".to_string(), Value::String(root.to_string()));
        fields.insert("size".to_string(), Value::from(size));
        fields.insert("ts".to_string(), Value::from(ts));
        Value::Object(fields)
    }

    pub fn signing_bytes(&self) -> Result<Vec<u8>, CanonicalError> {
        canonical_bytes(&Self::signing_payload(
            self.size, &self.root, self.ts, &self.kid,
        ))
    }

    /// Decode the hex root.
    pub fn root_bytes(&self) -> Result<[u8; 32], SthError> {
        crate::encoding::decode_hex32("root", &self.root).map_err(|_| SthError::Malformed {
            reason: "root is not a 32-byte hex digest".to_string(),
        })
    }
}

/// Errors from STH signing and verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SthError {
    Unsigned { reason: String },
    Malformed { reason: String },
    SignatureInvalid,
    Key(KeyringError),
    KeyWindow { kid: String, ts: i64 },
}

impl SthError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unsigned { .. } => "E_STH_UNSIGNED",
            Self::Malformed { .. } => "E_PROOF_MALFORMED",
            Self::SignatureInvalid => "E_SIG_INVALID",
            Self::Key(err) => err.code(),
            Self::KeyWindow { .. } => "E_STH_EXPIRED",
        }
    }
}

impl std::fmt::Display for SthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unsigned { reason } => write!(f, "E_STH_UNSIGNED: {reason}"),
            Self::Malformed { reason } => write!(f, "E_PROOF_MALFORMED: {reason}"),
            Self::SignatureInvalid => write!(f, "E_SIG_INVALID: sth signature rejected"),
            Self::Key(err) => write!(f, "{err}"),
            Self::KeyWindow { kid, ts } => {
                write!(f, "E_STH_EXPIRED: key {kid} does not cover sth ts {ts}")
            }
        }
    }
}

impl std::error::Error for SthError {}

impl From<KeyringError> for SthError {
    fn from(err: KeyringError) -> Self {
        match err {
            KeyringError::OutOfWindow { kid, ts } => Self::KeyWindow { kid, ts },
            other => Self::Key(other),
        }
    }
}

/// Signs tree heads with one ledger key.
#[derive(Debug)]
pub struct SthSigner {
    signing_key: SigningKey,
    kid: String,
}

impl SthSigner {
    #[must_use]
    pub fn new(signing_key: SigningKey) -> Self {
        let kid = derive_kid(&signing_key.verifying_key());
        Self { signing_key, kid }
    }

    #[must_use]
    pub fn kid(&self) -> &str {
        &self.kid
    }

    #[must_use]
    pub fn verifying_key(&self) -> ed25519_dalek::VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Sign a head for the tree at `size` with root `root`.
    pub fn sign_head(
        &self,
        size: u64,
        root: &[u8; 32],
        ts: i64,
    ) -> Result<SignedTreeHead, SthError> {
        let root_hex = hex::encode(root);
        let payload = SignedTreeHead::signing_payload(size, &root_hex, ts, &self.kid);
        let bytes = canonical_bytes(&payload).map_err(|e| SthError::Malformed {
            reason: e.to_string(),
        })?;
        let sig = signer::sign(&self.signing_key, &bytes);
        Ok(SignedTreeHead {
            size,
            root: root_hex,
            ts,
            kid: self.kid.clone(),
            sig: b64url(&sig),
        })
    }
}

/// Verify an STH against the log keyring.
///
/// The `kid` must resolve to a key whose validity window covers the STH's
/// `ts`; retired keys keep verifying inside their window.
pub fn verify_sth(sth: &SignedTreeHead, keyring: &Keyring) -> Result<(), SthError> {
    if sth.sig.is_empty() {
        return Err(SthError::Unsigned {
            reason: "sth carries no signature".to_string(),
        });
    }
    let sig = decode_b64url("sig", &sth.sig).map_err(|_| SthError::Unsigned {
        reason: "sth signature is not base64url".to_string(),
    })?;

    let entry = keyring.resolve(&sth.kid, sth.ts)?;
    let pubkey = entry.verifying_key()?;

    let bytes = sth.signing_bytes().map_err(|e| SthError::Malformed {
        reason: e.to_string(),
    })?;
    signer::verify(&pubkey, &bytes, &sig).map_err(|_| SthError::SignatureInvalid)
}
