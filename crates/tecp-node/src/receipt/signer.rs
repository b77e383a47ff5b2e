//! Ed25519 signing and verification over canonical bytes.
//!
//! Key material stays inside this module's callers: signing keys are loaded
//! from disk (hex-encoded 32-byte seed), the seed buffer is zeroized after
//! the key is constructed, and nothing here ever logs or serializes a
//! private key.

use std::path::Path;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroize;

pub const PUBKEY_LEN: usize = 32;
pub const SIG_LEN: usize = 64;
pub const SEED_LEN: usize = 32;

/// Errors from signing-key handling and signature checks.
#[derive(Debug, thiserror::Error)]
pub enum SignerError {
    #[error("E_SIG_INVALID: signature verification failed")]
    SignatureInvalid,

    #[error("E_SIG_INVALID: signature is {0} bytes, expected {SIG_LEN}")]
    SignatureLength(usize),

    #[error("E_KEY_UNKNOWN: public key is {0} bytes, expected {PUBKEY_LEN}")]
    PublicKeyLength(usize),

    #[error("E_KEY_UNKNOWN: public key bytes do not describe a valid Ed25519 point")]
    PublicKeyInvalid,

    #[error("failed to read signing key {path}: {source}")]
    KeyRead {
        path: String,
        source: std::io::Error,
    },

    #[error("signing key {path} is not a hex-encoded {SEED_LEN}-byte seed")]
    KeyFormat { path: String },

    #[error("failed to write signing key {path}: {source}")]
    KeyWrite {
        path: String,
        source: std::io::Error,
    },
}

impl SignerError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::SignatureInvalid | Self::SignatureLength(_) => "E_SIG_INVALID",
            Self::PublicKeyLength(_) | Self::PublicKeyInvalid => "E_KEY_UNKNOWN",
            Self::KeyRead { .. } | Self::KeyWrite { .. } => "E_STORE_IO",
            Self::KeyFormat { .. } => "E_STRUCT_TYPE",
        }
    }
}

/// Generate a fresh signing key from the OS RNG.
#[must_use]
pub fn generate_signing_key() -> SigningKey {
    let mut seed = [0u8; SEED_LEN];
    OsRng.fill_bytes(&mut seed);
    let key = SigningKey::from_bytes(&seed);
    seed.zeroize();
    key
}

/// Load a signing key from a hex-encoded seed file, zeroizing the seed.
pub fn load_signing_key(path: &Path) -> Result<SigningKey, SignerError> {
    let mut text = std::fs::read_to_string(path).map_err(|source| SignerError::KeyRead {
        path: path.display().to_string(),
        source,
    })?;
    let decoded = hex::decode(text.trim());
    text.zeroize();

    let mut seed: [u8; SEED_LEN] = decoded
        .ok()
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or_else(|| SignerError::KeyFormat {
            path: path.display().to_string(),
        })?;
    let key = SigningKey::from_bytes(&seed);
    seed.zeroize();
    Ok(key)
}

/// Persist a signing key as a hex-encoded seed file.
pub fn store_signing_key(path: &Path, key: &SigningKey) -> Result<(), SignerError> {
    let mut encoded = hex::encode(key.to_bytes());
    encoded.push('\n');
    let result = std::fs::write(path, &encoded);
    encoded.zeroize();
    result.map_err(|source| SignerError::KeyWrite {
        path: path.display().to_string(),
        source,
    })
}

/// Detached Ed25519 signature over canonical bytes.
#[must_use]
pub fn sign(key: &SigningKey, canonical: &[u8]) -> [u8; SIG_LEN] {
    key.sign(canonical).to_bytes()
}

/// Verify a detached signature over canonical bytes.
pub fn verify(pubkey: &VerifyingKey, canonical: &[u8], sig: &[u8]) -> Result<(), SignerError> {
    if sig.len() != SIG_LEN {
        return Err(SignerError::SignatureLength(sig.len()));
    }
    let signature = Signature::from_slice(sig).map_err(|_| SignerError::SignatureInvalid)?;
    pubkey
        .verify(canonical, &signature)
        .map_err(|_| SignerError::SignatureInvalid)
}

/// Parse 32 raw public-key bytes into a verifying key.
pub fn parse_pubkey(bytes: &[u8]) -> Result<VerifyingKey, SignerError> {
    let arr: [u8; PUBKEY_LEN] = bytes
        .try_into()
        .map_err(|_| SignerError::PublicKeyLength(bytes.len()))?;
    VerifyingKey::from_bytes(&arr).map_err(|_| SignerError::PublicKeyInvalid)
}
