//! JWKS-shaped keyring with `next -> active -> retired` rotation.
//!
//! Every signing identity is addressed by `kid`, pinned here to the first 16
//! lowercase-hex characters of `sha256(pubkey)`. Lookups are validity-window
//! checked: a receipt or STH is only accepted when its timestamp falls inside
//! the resolved key's `not_before..not_after` interval. The ring is
//! copy-on-write; rotation builds a replacement map and swaps it whole.

use std::collections::BTreeMap;

use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::encoding::{b64url, decode_b64url_exact};
use crate::receipt::signer::{self, PUBKEY_LEN};

/// Rotation state of a keyring entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStatus {
    Active,
    Next,
    Retired,
}

/// One key in the ring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyEntry {
    pub kid: String,
    /// Always `Ed25519` in this ring.
    pub alg: String,
    /// base64url public key, no padding.
    pub pubkey: String,
    pub status: KeyStatus,
    /// Milliseconds since epoch, inclusive.
    pub not_before: i64,
    /// Milliseconds since epoch, exclusive. `None` = no expiry.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub not_after: Option<i64>,
}

impl KeyEntry {
    #[must_use]
    pub fn covers(&self, ts: i64) -> bool {
        ts >= self.not_before && self.not_after.is_none_or(|end| ts < end)
    }

    /// Decode the stored public key.
    pub fn verifying_key(&self) -> Result<VerifyingKey, KeyringError> {
        let bytes = decode_b64url_exact("pubkey", &self.pubkey, PUBKEY_LEN)
            .map_err(|_| KeyringError::MalformedKey {
                kid: self.kid.clone(),
            })?;
        signer::parse_pubkey(&bytes).map_err(|_| KeyringError::MalformedKey {
            kid: self.kid.clone(),
        })
    }
}

/// Errors from keyring lookups and rotation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyringError {
    Unknown { kid: String },
    OutOfWindow { kid: String, ts: i64 },
    MalformedKey { kid: String },
    NoActiveKey,
    RotationInvalid { reason: String },
}

impl KeyringError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unknown { .. } | Self::NoActiveKey => "E_KEY_UNKNOWN",
            Self::OutOfWindow { .. } => "E_KEY_EXPIRED",
            Self::MalformedKey { .. } => "E_STRUCT_TYPE",
            Self::RotationInvalid { .. } => "E_KEY_UNKNOWN",
        }
    }
}

impl std::fmt::Display for KeyringError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown { kid } => write!(f, "E_KEY_UNKNOWN: kid {kid} not in keyring"),
            Self::OutOfWindow { kid, ts } => {
                write!(f, "E_KEY_EXPIRED: kid {kid} does not cover ts {ts}")
            }
            Self::MalformedKey { kid } => {
                write!(f, "E_STRUCT_TYPE: kid {kid} holds malformed key material")
            }
            Self::NoActiveKey => write!(f, "E_KEY_UNKNOWN: keyring has no active key"),
            Self::RotationInvalid { reason } => {
                write!(f, "E_KEY_UNKNOWN: rotation rejected: {reason}")
            }
        }
    }
}

impl std::error::Error for KeyringError {}

/// Derive the pinned kid for a public key: `hex(sha256(pubkey))[..16]`.
#[must_use]
pub fn derive_kid(pubkey: &VerifyingKey) -> String {
    let mut hasher = Sha256::new();
    hasher.update(pubkey.as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..8])
}

/// Unordered `kid -> key` mapping with rotation and JWKS export.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Keyring {
    keys: BTreeMap<String, KeyEntry>,
}

impl Keyring {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Ring with a single active key valid from `not_before` onward.
    #[must_use]
    pub fn with_active_key(pubkey: &VerifyingKey, not_before: i64) -> Self {
        let mut ring = Self::new();
        ring.insert(KeyEntry {
            kid: derive_kid(pubkey),
            alg: "Ed25519".to_string(),
            pubkey: b64url(pubkey.as_bytes()),
            status: KeyStatus::Active,
            not_before,
            not_after: None,
        });
        ring
    }

    pub fn insert(&mut self, entry: KeyEntry) {
        self.keys.insert(entry.kid.clone(), entry);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    #[must_use]
    pub fn get(&self, kid: &str) -> Option<&KeyEntry> {
        self.keys.get(kid)
    }

    /// The key currently used for signing new STHs.
    pub fn active(&self) -> Result<&KeyEntry, KeyringError> {
        self.keys
            .values()
            .find(|entry| entry.status == KeyStatus::Active)
            .ok_or(KeyringError::NoActiveKey)
    }

    /// Resolve `kid` for an artifact stamped `ts`.
    ///
    /// Retired keys still resolve; only the validity window gates
    /// acceptance.
    pub fn resolve(&self, kid: &str, ts: i64) -> Result<&KeyEntry, KeyringError> {
        let entry = self.keys.get(kid).ok_or_else(|| KeyringError::Unknown {
            kid: kid.to_string(),
        })?;
        if !entry.covers(ts) {
            return Err(KeyringError::OutOfWindow {
                kid: kid.to_string(),
                ts,
            });
        }
        Ok(entry)
    }

    /// Resolve an issuer public key (receipt `pubkey` field) at `ts`.
    pub fn resolve_pubkey(&self, pubkey: &VerifyingKey, ts: i64) -> Result<&KeyEntry, KeyringError> {
        self.resolve(&derive_kid(pubkey), ts)
    }

    /// Rotate: the `next` key becomes `active`, the previous `active` key is
    /// retired with its window closed at `now_ms`.
    ///
    /// Returns the replacement ring; the caller swaps it atomically.
    pub fn rotated(&self, now_ms: i64) -> Result<Self, KeyringError> {
        let next_kid = self
            .keys
            .values()
            .find(|entry| entry.status == KeyStatus::Next)
            .map(|entry| entry.kid.clone())
            .ok_or_else(|| KeyringError::RotationInvalid {
                reason: "no key staged as next".to_string(),
            })?;

        let mut replacement = self.clone();
        for entry in replacement.keys.values_mut() {
            match entry.status {
                KeyStatus::Active => {
                    entry.status = KeyStatus::Retired;
                    entry.not_after.get_or_insert(now_ms);
                }
                KeyStatus::Next if entry.kid == next_kid => {
                    entry.status = KeyStatus::Active;
                }
                _ => {}
            }
        }
        Ok(replacement)
    }

    /// Stage a freshly generated key as `next`, valid from `not_before`.
    pub fn staged(&self, pubkey: &VerifyingKey, not_before: i64) -> Result<Self, KeyringError> {
        if self.keys.values().any(|entry| entry.status == KeyStatus::Next) {
            return Err(KeyringError::RotationInvalid {
                reason: "a key is already staged as next".to_string(),
            });
        }
        let mut replacement = self.clone();
        replacement.insert(KeyEntry {
            kid: derive_kid(pubkey),
            alg: "Ed25519".to_string(),
            pubkey: b64url(pubkey.as_bytes()),
            status: KeyStatus::Next,
            not_before,
            not_after: None,
        });
        Ok(replacement)
    }

    /// Public JWKS view (RFC 8037 OKP shape). Never includes private keys;
    /// the ring never holds any.
    #[must_use]
    pub fn to_jwks(&self) -> Jwks {
        Jwks {
            keys: self
                .keys
                .values()
                .map(|entry| Jwk {
                    kty: "OKP".to_string(),
                    crv: "Ed25519".to_string(),
                    alg: "EdDSA".to_string(),
                    kid: entry.kid.clone(),
                    x: entry.pubkey.clone(),
                    status: entry.status,
                    not_before: entry.not_before,
                    not_after: entry.not_after,
                })
                .collect(),
        }
    }

    /// Rebuild a ring from its JWKS view.
    pub fn from_jwks(jwks: &Jwks) -> Result<Self, KeyringError> {
        let mut ring = Self::new();
        for jwk in &jwks.keys {
            if jwk.kty != "OKP" || jwk.crv != "Ed25519" {
                return Err(KeyringError::MalformedKey {
                    kid: jwk.kid.clone(),
                });
            }
            ring.insert(KeyEntry {
                kid: jwk.kid.clone(),
                alg: "Ed25519".to_string(),
                pubkey: jwk.x.clone(),
                status: jwk.status,
                not_before: jwk.not_before,
                not_after: jwk.not_after,
            });
        }
        Ok(ring)
    }
}

/// JWKS document served at `/.well-known/tecp-log-jwks`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwks {
    pub keys: Vec<Jwk>,
}

/// One JWKS key entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwk {
    pub kty: String,
    pub crv: String,
    pub alg: String,
    pub kid: String,
    /// base64url public key, no padding.
    pub x: String,
    pub status: KeyStatus,
    pub not_before: i64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub not_after: Option<i64>,
}
