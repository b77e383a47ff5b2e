//! TECP core: cryptographic receipts for ephemeral computation, anchored in
//! an append-only Merkle transparency ledger.
//!
//! A receipt binds a code reference, input and output hashes, a policy set,
//! a timestamp, and a nonce under an Ed25519 signature over a strictly
//! canonical byte representation. Anyone holding the issuer's public key —
//! and, for strict receipts, the ledger's signed tree head — can verify a
//! receipt offline.

#![forbid(unsafe_code)]

pub mod api;
pub mod config;
pub mod encoding;
pub mod keyring;
pub mod ledger;
pub mod observability;
pub mod policy;
pub mod receipt;
pub mod verify;
