//! Incremental binary Merkle tree over ledger leaves.
//!
//! All hashing is SHA-256 with single-byte domain separation: `0x00` before
//! leaf input, `0x01` before an interior node's children. Odd levels are
//! padded by duplicating their last node, which keeps every audit path at
//! exactly `ceil(log2(N))` siblings and lets verifiers walk the path using
//! the bits of the zero-based leaf index alone.

use sha2::{Digest, Sha256};

/// 32-byte SHA-256 output.
pub type Digest32 = [u8; 32];

/// Domain prefix for leaf hashing.
pub const LEAF_DOMAIN: u8 = 0x00;

/// Domain prefix for interior-node hashing.
pub const NODE_DOMAIN: u8 = 0x01;

/// Errors from audit-path construction and verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MerkleError {
    EmptyTree,
    SequenceOutOfRange { seq: u64, size: u64 },
    MalformedProof { reason: String },
    RootMismatch,
}

impl MerkleError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::EmptyTree | Self::SequenceOutOfRange { .. } | Self::MalformedProof { .. } => {
                "E_PROOF_MALFORMED"
            }
            Self::RootMismatch => "E_PROOF_MISMATCH",
        }
    }
}

impl std::fmt::Display for MerkleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyTree => write!(f, "E_PROOF_MALFORMED: tree is empty"),
            Self::SequenceOutOfRange { seq, size } => {
                write!(f, "E_PROOF_MALFORMED: seq {seq} out of range for size {size}")
            }
            Self::MalformedProof { reason } => write!(f, "E_PROOF_MALFORMED: {reason}"),
            Self::RootMismatch => {
                write!(f, "E_PROOF_MISMATCH: recomputed root differs from expected root")
            }
        }
    }
}

impl std::error::Error for MerkleError {}

/// `sha256(0x00 || x)`
#[must_use]
pub fn leaf_hash(bytes: &[u8]) -> Digest32 {
    let mut hasher = Sha256::new();
    hasher.update([LEAF_DOMAIN]);
    hasher.update(bytes);
    hasher.finalize().into()
}

/// `sha256(0x01 || l || r)`
#[must_use]
pub fn node_hash(left: &Digest32, right: &Digest32) -> Digest32 {
    let mut hasher = Sha256::new();
    hasher.update([NODE_DOMAIN]);
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

/// Root of the empty tree: `sha256("")`, no domain byte.
#[must_use]
pub fn empty_root() -> Digest32 {
    Sha256::digest([]).into()
}

/// Incrementally maintained Merkle tree.
///
/// `levels[0]` holds leaf hashes in sequence order; `levels[k]` holds the
/// interior nodes `k` levels up. An append touches one node per level.
#[derive(Debug, Clone, Default)]
pub struct MerkleTree {
    levels: Vec<Vec<Digest32>>,
}

impl MerkleTree {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from leaf bytes in sequence order (crash recovery).
    #[must_use]
    pub fn from_leaves<'a, I>(leaves: I) -> Self
    where
        I: IntoIterator<Item = &'a [u8]>,
    {
        let mut tree = Self::new();
        for leaf in leaves {
            tree.append(leaf);
        }
        tree
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.levels.first().map_or(0, |leaves| leaves.len() as u64)
    }

    /// Current root. Pure function of the appended leaves, in order.
    #[must_use]
    pub fn root(&self) -> Digest32 {
        match self.levels.last() {
            None => empty_root(),
            Some(top) => top[0],
        }
    }

    /// Append a leaf (raw bytes, hashed with the leaf domain here) and
    /// return the new root. `O(log N)` node recomputations.
    pub fn append(&mut self, leaf_bytes: &[u8]) -> Digest32 {
        if self.levels.is_empty() {
            self.levels.push(Vec::new());
        }
        self.levels[0].push(leaf_hash(leaf_bytes));

        let mut level = 0;
        while self.levels[level].len() > 1 {
            let child_count = self.levels[level].len();
            let parent_idx = (child_count - 1) / 2;

            let left = self.levels[level][parent_idx * 2];
            // Duplicate-last padding for a lone right-edge child.
            let right = self
                .levels[level]
                .get(parent_idx * 2 + 1)
                .copied()
                .unwrap_or(left);
            let parent = node_hash(&left, &right);

            if self.levels.len() == level + 1 {
                self.levels.push(Vec::new());
            }
            let parents = &mut self.levels[level + 1];
            if parents.len() == parent_idx {
                parents.push(parent);
            } else {
                parents[parent_idx] = parent;
            }
            level += 1;
        }

        self.root()
    }

    /// Audit path for the entry at 1-based `seq`: sibling hashes from leaf
    /// level to just below the root, `ceil(log2(N))` entries.
    pub fn audit_path(&self, seq: u64) -> Result<Vec<Digest32>, MerkleError> {
        let size = self.size();
        if size == 0 {
            return Err(MerkleError::EmptyTree);
        }
        if seq == 0 || seq > size {
            return Err(MerkleError::SequenceOutOfRange { seq, size });
        }

        let mut idx = (seq - 1) as usize;
        let mut path = Vec::new();
        for level in &self.levels {
            if level.len() <= 1 {
                break;
            }
            let sibling_idx = idx ^ 1;
            // A missing right sibling is the duplicated node itself.
            let sibling = level.get(sibling_idx).copied().unwrap_or(level[idx]);
            path.push(sibling);
            idx /= 2;
        }
        Ok(path)
    }
}

/// Recompute a root from `candidate_leaf_bytes` and an audit path, and
/// compare against `expected_root`.
///
/// The walk consumes one sibling per level; bit `i` of the zero-based index
/// says whether the sibling sits to the left.
pub fn verify_audit_path(
    candidate_leaf_bytes: &[u8],
    seq: u64,
    path: &[Digest32],
    expected_root: &Digest32,
) -> Result<(), MerkleError> {
    if seq == 0 {
        return Err(MerkleError::MalformedProof {
            reason: "sequence numbers are 1-based".to_string(),
        });
    }
    if path.len() >= 64 {
        return Err(MerkleError::MalformedProof {
            reason: format!("audit path of {} siblings is impossible", path.len()),
        });
    }
    let index = seq - 1;
    if path.len() < 64 && index >> path.len() != 0 {
        return Err(MerkleError::MalformedProof {
            reason: format!("index {index} cannot fit a {}-level path", path.len()),
        });
    }

    let mut current = leaf_hash(candidate_leaf_bytes);
    for (i, sibling) in path.iter().enumerate() {
        current = if (index >> i) & 1 == 1 {
            node_hash(sibling, &current)
        } else {
            node_hash(&current, sibling)
        };
    }

    if &current == expected_root {
        Ok(())
    } else {
        Err(MerkleError::RootMismatch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaves(n: u64) -> Vec<Vec<u8>> {
        (0..n).map(|i| format!("leaf-{i:04}").into_bytes()).collect()
    }

    fn build(n: u64) -> (MerkleTree, Vec<Vec<u8>>) {
        let data = leaves(n);
        let tree = MerkleTree::from_leaves(data.iter().map(Vec::as_slice));
        (tree, data)
    }

    #[test]
    fn empty_tree_root_is_sha256_of_empty_input() {
        let tree = MerkleTree::new();
        assert_eq!(tree.size(), 0);
        assert_eq!(
            hex::encode(tree.root()),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn single_leaf_root_is_leaf_hash_and_path_is_empty() {
        let (tree, data) = build(1);
        assert_eq!(tree.root(), leaf_hash(&data[0]));
        assert!(tree.audit_path(1).expect("path").is_empty());
        verify_audit_path(&data[0], 1, &[], &tree.root()).expect("verify");
    }

    #[test]
    fn domain_separation_distinguishes_leaf_and_node() {
        let a = leaf_hash(b"x");
        let b = leaf_hash(b"y");
        assert_ne!(node_hash(&a, &b), node_hash(&b, &a));
        // A leaf whose bytes mimic a node preimage still hashes differently.
        let mut mimic = Vec::new();
        mimic.extend_from_slice(&a);
        mimic.extend_from_slice(&b);
        assert_ne!(leaf_hash(&mimic), node_hash(&a, &b));
    }

    #[test]
    fn every_sequence_proves_against_the_root() {
        for n in [1u64, 2, 3, 4, 5, 7, 8, 9, 16, 33] {
            let (tree, data) = build(n);
            let root = tree.root();
            for seq in 1..=n {
                let path = tree.audit_path(seq).expect("path");
                assert_eq!(path.len(), (64 - (n - 1).leading_zeros()) as usize);
                verify_audit_path(&data[(seq - 1) as usize], seq, &path, &root)
                    .unwrap_or_else(|e| panic!("n={n} seq={seq}: {e}"));
            }
        }
    }

    #[test]
    fn flipping_any_path_bit_fails_verification() {
        let (tree, data) = build(5);
        let root = tree.root();
        let path = tree.audit_path(3).expect("path");

        for i in 0..path.len() {
            let mut tampered = path.clone();
            tampered[i][0] ^= 0x80;
            let err = verify_audit_path(&data[2], 3, &tampered, &root).expect_err("tampered");
            assert_eq!(err.code(), "E_PROOF_MISMATCH");
        }

        let mut bad_root = root;
        bad_root[31] ^= 0x01;
        let err = verify_audit_path(&data[2], 3, &path, &bad_root).expect_err("bad root");
        assert_eq!(err.code(), "E_PROOF_MISMATCH");
    }

    #[test]
    fn wrong_sequence_fails_verification() {
        let (tree, data) = build(4);
        let path = tree.audit_path(2).expect("path");
        let err = verify_audit_path(&data[1], 3, &path, &tree.root()).expect_err("wrong seq");
        assert_eq!(err.code(), "E_PROOF_MISMATCH");
    }

    #[test]
    fn root_changes_on_every_append() {
        let mut tree = MerkleTree::new();
        let mut seen = std::collections::BTreeSet::new();
        for leaf in leaves(9) {
            let root = tree.append(&leaf);
            assert!(seen.insert(root), "root repeated");
        }
    }

    #[test]
    fn incremental_matches_batch_rebuild() {
        let data = leaves(13);
        let mut incremental = MerkleTree::new();
        for leaf in &data {
            incremental.append(leaf);
        }
        let batch = MerkleTree::from_leaves(data.iter().map(Vec::as_slice));
        assert_eq!(incremental.root(), batch.root());
        assert_eq!(
            incremental.audit_path(7).expect("path"),
            batch.audit_path(7).expect("path")
        );
    }

    #[test]
    fn out_of_range_requests_are_rejected() {
        let (tree, _) = build(3);
        assert_eq!(tree.audit_path(0).expect_err("zero").code(), "E_PROOF_MALFORMED");
        assert_eq!(tree.audit_path(4).expect_err("high").code(), "E_PROOF_MALFORMED");
        assert_eq!(
            MerkleTree::new().audit_path(1).expect_err("empty").code(),
            "E_PROOF_MALFORMED"
        );
    }

    #[test]
    fn oversized_or_inconsistent_paths_are_malformed() {
        let (tree, data) = build(2);
        let root = tree.root();
        let err = verify_audit_path(&data[0], 1, &[[0u8; 32]; 64], &root).expect_err("oversized");
        assert_eq!(err.code(), "E_PROOF_MALFORMED");
        // seq 3 needs at least two levels; a one-sibling path cannot place it.
        let err = verify_audit_path(&data[0], 3, &[[0u8; 32]], &root).expect_err("short");
        assert_eq!(err.code(), "E_PROOF_MALFORMED");
    }
}
