//! Transparency ledger: append-only entries, incremental Merkle tree, and
//! signed tree heads.
//!
//! `TransparencyLedger` is the synchronous core. Appends require `&mut self`
//! (the append lock in type form); everything else is a read against the
//! in-memory mirror. The async single-writer front sits in [`service`].

pub mod merkle;
pub mod service;
pub mod sth;
pub mod store;

use std::collections::BTreeMap;

use ed25519_dalek::SigningKey;
use serde::{Deserialize, Serialize};

use crate::keyring::{Keyring, KeyringError};
use self::merkle::{MerkleError, MerkleTree};
use self::sth::{SignedTreeHead, SthError, SthSigner};
use self::store::{EntryMetadata, LedgerEntry, LedgerStore, StoreError};

/// What `append` does when the leaf is already present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    /// Return the existing sequence and the current head. The default.
    Idempotent,
    /// Fail with `E_DUPLICATE`.
    Reject,
}

/// Errors from ledger operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    NotFound { what: &'static str, key: String },
    Duplicate { seq: u64 },
    Merkle(MerkleError),
    Sth(SthError),
    Keyring(KeyringError),
    Store { code: &'static str, detail: String },
}

impl LedgerError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "E_NOT_FOUND",
            Self::Duplicate { .. } => "E_DUPLICATE",
            Self::Merkle(err) => err.code(),
            Self::Sth(err) => err.code(),
            Self::Keyring(err) => err.code(),
            Self::Store { code, .. } => code,
        }
    }
}

impl std::fmt::Display for LedgerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound { what, key } => write!(f, "E_NOT_FOUND: no {what} for {key}"),
            Self::Duplicate { seq } => {
                write!(f, "E_DUPLICATE: leaf already appended at seq {seq}")
            }
            Self::Merkle(err) => write!(f, "{err}"),
            Self::Sth(err) => write!(f, "{err}"),
            Self::Keyring(err) => write!(f, "{err}"),
            Self::Store { detail, .. } => write!(f, "{detail}"),
        }
    }
}

impl std::error::Error for LedgerError {}

impl From<MerkleError> for LedgerError {
    fn from(err: MerkleError) -> Self {
        Self::Merkle(err)
    }
}

impl From<SthError> for LedgerError {
    fn from(err: SthError) -> Self {
        Self::Sth(err)
    }
}

impl From<KeyringError> for LedgerError {
    fn from(err: KeyringError) -> Self {
        Self::Keyring(err)
    }
}

impl From<StoreError> for LedgerError {
    fn from(err: StoreError) -> Self {
        Self::Store {
            code: err.code(),
            detail: err.to_string(),
        }
    }
}

/// Inclusion proof handed back to submitters and feed readers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InclusionProof {
    /// 1-based sequence of the proven leaf.
    pub leaf_index: u64,
    /// Sibling hashes leaf-to-root, lowercase hex.
    pub audit_path: Vec<String>,
    /// Head whose root the path resolves to.
    pub sth: SignedTreeHead,
}

impl InclusionProof {
    /// Decode the hex audit path.
    pub fn audit_path_bytes(&self) -> Result<Vec<[u8; 32]>, MerkleError> {
        self.audit_path
            .iter()
            .map(|hex_digest| {
                crate::encoding::decode_hex32("audit_path", hex_digest).map_err(|_| {
                    MerkleError::MalformedProof {
                        reason: "audit path sibling is not a 32-byte hex digest".to_string(),
                    }
                })
            })
            .collect()
    }
}

/// Result of an append.
#[derive(Debug, Clone)]
pub struct AppendOutcome {
    pub seq: u64,
    /// True when the leaf was already present and the append was absorbed.
    pub duplicate: bool,
    pub sth: SignedTreeHead,
    pub proof: InclusionProof,
}

/// The synchronous ledger core.
#[derive(Debug)]
pub struct TransparencyLedger<S: LedgerStore> {
    store: S,
    tree: MerkleTree,
    entries: Vec<LedgerEntry>,
    by_leaf: BTreeMap<String, u64>,
    signer: SthSigner,
    keyring: Keyring,
    current_sth: SignedTreeHead,
    duplicate_policy: DuplicatePolicy,
}

impl<S: LedgerStore> TransparencyLedger<S> {
    /// Open the ledger over a store: replay entries `1..N`, rebuild the
    /// tree, cross-check the persisted head, and re-sign the current STH
    /// before accepting appends.
    ///
    /// A keyring persisted by a previous run wins over `keyring`, which
    /// seeds fresh deployments.
    pub fn open(
        mut store: S,
        signing_key: SigningKey,
        keyring: Keyring,
        now_ms: i64,
    ) -> Result<Self, LedgerError> {
        let recovered = store.load()?;
        let keyring = recovered.keyring.clone().unwrap_or(keyring);

        let signer_kid = crate::keyring::derive_kid(&signing_key.verifying_key());
        let active = keyring.active()?;
        if active.kid != signer_kid {
            return Err(LedgerError::Keyring(KeyringError::RotationInvalid {
                reason: format!(
                    "signing key {signer_kid} is not the ring's active key {}",
                    active.kid
                ),
            }));
        }

        let mut tree = MerkleTree::new();
        let mut by_leaf = BTreeMap::new();
        for entry in &recovered.entries {
            let leaf = entry.leaf_bytes()?;
            tree.append(&leaf);
            by_leaf.insert(entry.leaf.clone(), entry.seq);
        }

        if let Some(persisted) = &recovered.last_sth {
            if persisted.size > tree.size() {
                return Err(LedgerError::Store {
                    code: "E_STORE_CORRUPT",
                    detail: format!(
                        "E_STORE_CORRUPT: persisted sth covers size {} but only {} entries recovered",
                        persisted.size,
                        tree.size()
                    ),
                });
            }
            if persisted.size == tree.size() && persisted.root != hex::encode(tree.root()) {
                return Err(LedgerError::Store {
                    code: "E_STORE_CORRUPT",
                    detail: "E_STORE_CORRUPT: persisted sth root disagrees with replayed entries"
                        .to_string(),
                });
            }
        }

        let signer = SthSigner::new(signing_key);
        let current_sth = signer.sign_head(tree.size(), &tree.root(), now_ms)?;
        store.persist_sth(&current_sth)?;
        if recovered.keyring.is_none() {
            store.persist_keyring(&keyring)?;
        }

        tracing::info!(
            size = tree.size(),
            root = %current_sth.root,
            kid = %current_sth.kid,
            "ledger opened"
        );

        Ok(Self {
            store,
            tree,
            entries: recovered.entries,
            by_leaf,
            signer,
            keyring,
            current_sth,
            duplicate_policy: DuplicatePolicy::Idempotent,
        })
    }

    pub fn set_duplicate_policy(&mut self, policy: DuplicatePolicy) {
        self.duplicate_policy = policy;
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.tree.size()
    }

    /// The last published head.
    #[must_use]
    pub fn sth(&self) -> SignedTreeHead {
        self.current_sth.clone()
    }

    #[must_use]
    pub fn keyring(&self) -> &Keyring {
        &self.keyring
    }

    /// Append a leaf. Atomic with respect to `&mut self`: sequence
    /// allocation, persistence, tree update, and head re-signing happen
    /// before the borrow ends.
    pub fn append(
        &mut self,
        leaf: &[u8; 32],
        metadata: EntryMetadata,
        now_ms: i64,
    ) -> Result<AppendOutcome, LedgerError> {
        let leaf_hex = hex::encode(leaf);

        if let Some(&seq) = self.by_leaf.get(&leaf_hex) {
            if self.duplicate_policy == DuplicatePolicy::Reject {
                return Err(LedgerError::Duplicate { seq });
            }
            let proof = self.proof(seq)?;
            return Ok(AppendOutcome {
                seq,
                duplicate: true,
                sth: self.current_sth.clone(),
                proof,
            });
        }

        let seq = self.tree.size() + 1;
        let entry = LedgerEntry {
            seq,
            leaf: leaf_hex.clone(),
            created_at: now_ms,
            metadata,
        };

        // Durability point: the append exists once this returns.
        self.store.persist_entry(&entry)?;

        let root = self.tree.append(leaf);
        let sth = self.signer.sign_head(seq, &root, now_ms)?;
        if let Err(err) = self.store.persist_sth(&sth) {
            // Recoverable: the head is re-derived from entries on restart.
            tracing::warn!(seq, error = %err, "sth persistence failed after durable append");
        }

        self.entries.push(entry);
        self.by_leaf.insert(leaf_hex, seq);
        self.current_sth = sth.clone();

        tracing::debug!(seq, root = %sth.root, "leaf appended");

        let proof = self.proof(seq)?;
        Ok(AppendOutcome {
            seq,
            duplicate: false,
            sth,
            proof,
        })
    }

    /// Inclusion proof for the entry at `seq`, against the current head.
    pub fn proof(&self, seq: u64) -> Result<InclusionProof, LedgerError> {
        let path = self.tree.audit_path(seq)?;
        Ok(InclusionProof {
            leaf_index: seq,
            audit_path: path.iter().map(hex::encode).collect(),
            sth: self.current_sth.clone(),
        })
    }

    /// Inclusion proof addressed by leaf hash.
    pub fn proof_for_leaf(&self, leaf: &[u8; 32]) -> Result<InclusionProof, LedgerError> {
        let seq = self.find_by_leaf(leaf)?;
        self.proof(seq)
    }

    pub fn entry(&self, seq: u64) -> Result<&LedgerEntry, LedgerError> {
        if seq == 0 {
            return Err(LedgerError::NotFound {
                what: "entry",
                key: "seq 0".to_string(),
            });
        }
        self.entries
            .get((seq - 1) as usize)
            .ok_or(LedgerError::NotFound {
                what: "entry",
                key: format!("seq {seq}"),
            })
    }

    pub fn find_by_leaf(&self, leaf: &[u8; 32]) -> Result<u64, LedgerError> {
        let leaf_hex = hex::encode(leaf);
        self.by_leaf
            .get(&leaf_hex)
            .copied()
            .ok_or(LedgerError::NotFound {
                what: "leaf",
                key: leaf_hex,
            })
    }

    /// Public feed slice, oldest first.
    #[must_use]
    pub fn range(&self, offset: u64, limit: usize) -> Vec<LedgerEntry> {
        self.entries
            .iter()
            .skip(offset as usize)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Swap in a rotated signing key: the old active key retires at
    /// `now_ms`, the new key signs from here on, and the head is re-signed
    /// under the new kid immediately.
    pub fn rotate_signing_key(
        &mut self,
        new_key: SigningKey,
        now_ms: i64,
    ) -> Result<SignedTreeHead, LedgerError> {
        let staged = self.keyring.staged(&new_key.verifying_key(), now_ms)?;
        let rotated = staged.rotated(now_ms)?;
        self.store.persist_keyring(&rotated)?;

        self.keyring = rotated;
        self.signer = SthSigner::new(new_key);
        let sth = self
            .signer
            .sign_head(self.tree.size(), &self.tree.root(), now_ms)?;
        if let Err(err) = self.store.persist_sth(&sth) {
            tracing::warn!(error = %err, "sth persistence failed after key rotation");
        }
        self.current_sth = sth.clone();

        tracing::info!(kid = %sth.kid, "ledger signing key rotated");
        Ok(sth)
    }
}
