//! Route handlers for the transparency-log surface.
//!
//! Routes served by collaborators:
//! - `POST /v1/log/entries`            -> [`post_entry`]
//! - `GET  /v1/log/proof?leaf=...`     -> [`get_proof`]
//! - `GET  /v1/log/sth`                -> [`get_sth`]
//! - `GET  /v1/log/entries?limit=N`    -> [`list_entries`]
//! - `GET  /.well-known/tecp-log-jwks` -> [`get_jwks`]

use serde::{Deserialize, Serialize};

use crate::encoding::decode_hex32;
use crate::keyring::Jwks;
use crate::ledger::store::{EntryMetadata, LedgerStore};
use crate::ledger::{LedgerError, TransparencyLedger};

/// Error body: HTTP status plus a stable code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    #[serde(skip)]
    pub status: u16,
    pub error: String,
    pub code: String,
}

impl ApiError {
    fn bad_request(code: &str, error: impl Into<String>) -> Self {
        Self {
            status: 400,
            error: error.into(),
            code: code.to_string(),
        }
    }
}

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        let status = match err.code() {
            "E_NOT_FOUND" => 404,
            "E_DUPLICATE" => 409,
            "E_STORE_IO" | "E_STORE_CORRUPT" => 500,
            _ => 400,
        };
        Self {
            status,
            error: err.to_string(),
            code: err.code().to_string(),
        }
    }
}

/// `POST /v1/log/entries` request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostEntryRequest {
    /// Leaf hash, lowercase hex, 32 bytes decoded.
    pub leaf: String,
    #[serde(skip_serializing_if = "EntryMetadata::is_empty", default)]
    pub metadata: EntryMetadata,
}

/// Hash algorithm and domain bytes, spelled out for verifiers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainSpec {
    pub leaf: String,
    pub node: String,
}

impl Default for DomainSpec {
    fn default() -> Self {
        Self {
            leaf: "00".to_string(),
            node: "01".to_string(),
        }
    }
}

/// Head body shared by proof and sth responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SthBody {
    pub size: u64,
    pub root: String,
    pub ts: i64,
    pub sig: String,
    pub kid: String,
}

/// Proof response for `post_entry` and `get_proof`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofResponse {
    pub leaf_index: u64,
    pub proof: Vec<String>,
    pub sth: SthBody,
    pub algo: String,
    pub domain: DomainSpec,
}

/// One row of the public feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntrySummary {
    pub seq: u64,
    pub leaf_hash: String,
    pub ts: i64,
    #[serde(skip_serializing_if = "EntryMetadata::is_empty", default)]
    pub metadata: EntryMetadata,
}

fn sth_body(sth: &crate::ledger::sth::SignedTreeHead) -> SthBody {
    SthBody {
        size: sth.size,
        root: sth.root.clone(),
        ts: sth.ts,
        sig: sth.sig.clone(),
        kid: sth.kid.clone(),
    }
}

fn proof_response(proof: crate::ledger::InclusionProof) -> ProofResponse {
    ProofResponse {
        leaf_index: proof.leaf_index,
        sth: sth_body(&proof.sth),
        proof: proof.audit_path,
        algo: "sha256".to_string(),
        domain: DomainSpec::default(),
    }
}

/// Append a leaf; idempotent for leaves the log already holds.
pub fn post_entry<S: LedgerStore>(
    ledger: &mut TransparencyLedger<S>,
    request: &PostEntryRequest,
    now_ms: i64,
) -> Result<ProofResponse, ApiError> {
    let leaf = decode_hex32("leaf", &request.leaf)
        .map_err(|err| ApiError::bad_request(err.code(), err.to_string()))?;
    let outcome = ledger.append(&leaf, request.metadata.clone(), now_ms)?;
    Ok(proof_response(outcome.proof))
}

/// Inclusion proof for a previously appended leaf.
pub fn get_proof<S: LedgerStore>(
    ledger: &TransparencyLedger<S>,
    leaf_hex: &str,
) -> Result<ProofResponse, ApiError> {
    let leaf = decode_hex32("leaf", leaf_hex)
        .map_err(|err| ApiError::bad_request(err.code(), err.to_string()))?;
    let proof = ledger.proof_for_leaf(&leaf)?;
    Ok(proof_response(proof))
}

/// Current signed tree head.
pub fn get_sth<S: LedgerStore>(ledger: &TransparencyLedger<S>) -> SthBody {
    sth_body(&ledger.sth())
}

/// Public feed page, oldest first.
pub fn list_entries<S: LedgerStore>(
    ledger: &TransparencyLedger<S>,
    offset: u64,
    limit: usize,
) -> Vec<EntrySummary> {
    ledger
        .range(offset, limit)
        .into_iter()
        .map(|entry| EntrySummary {
            seq: entry.seq,
            leaf_hash: entry.leaf,
            ts: entry.created_at,
            metadata: entry.metadata,
        })
        .collect()
}

/// Public half of the log keyring.
pub fn get_jwks<S: LedgerStore>(ledger: &TransparencyLedger<S>) -> Jwks {
    ledger.keyring().to_jwks()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;

    use crate::keyring::Keyring;
    use crate::ledger::merkle::verify_audit_path;
    use crate::ledger::store::MemoryStore;

    fn ledger() -> TransparencyLedger<MemoryStore> {
        let key = SigningKey::from_bytes(&[5u8; 32]);
        let ring = Keyring::with_active_key(&key.verifying_key(), 0);
        TransparencyLedger::open(MemoryStore::new(), key, ring, 0).expect("open")
    }

    fn request(n: u8) -> PostEntryRequest {
        PostEntryRequest {
            leaf: hex::encode([n; 32]),
            metadata: EntryMetadata::default(),
        }
    }

    #[test]
    fn post_entry_returns_verifying_proof() {
        let mut ledger = ledger();
        post_entry(&mut ledger, &request(1), 1_000).expect("post 1");
        let response = post_entry(&mut ledger, &request(2), 1_001).expect("post 2");

        assert_eq!(response.leaf_index, 2);
        assert_eq!(response.algo, "sha256");
        assert_eq!(response.domain.leaf, "00");
        assert_eq!(response.domain.node, "01");

        let root = decode_hex32("root", &response.sth.root).expect("root");
        let path: Vec<[u8; 32]> = response
            .proof
            .iter()
            .map(|s| decode_hex32("sibling", s).expect("sibling"))
            .collect();
        verify_audit_path(&[2u8; 32], response.leaf_index, &path, &root).expect("verify");
    }

    #[test]
    fn post_entry_rejects_malformed_leaves() {
        let mut ledger = ledger();
        let bad = PostEntryRequest {
            leaf: "zz".to_string(),
            metadata: EntryMetadata::default(),
        };
        let err = post_entry(&mut ledger, &bad, 1_000).expect_err("bad leaf");
        assert_eq!(err.status, 400);
        assert_eq!(err.code, "E_STRUCT_TYPE");

        let short = PostEntryRequest {
            leaf: "abcd".to_string(),
            metadata: EntryMetadata::default(),
        };
        let err = post_entry(&mut ledger, &short, 1_000).expect_err("short leaf");
        assert_eq!(err.code, "E_STRUCT_LEN");
    }

    #[test]
    fn duplicate_post_is_absorbed() {
        let mut ledger = ledger();
        let first = post_entry(&mut ledger, &request(1), 1_000).expect("post");
        let again = post_entry(&mut ledger, &request(1), 2_000).expect("repost");
        assert_eq!(again.leaf_index, first.leaf_index);
        assert_eq!(again.sth.size, 1);
    }

    #[test]
    fn get_proof_finds_by_leaf_and_404s_unknown() {
        let mut ledger = ledger();
        post_entry(&mut ledger, &request(1), 1_000).expect("post");

        let response = get_proof(&ledger, &hex::encode([1u8; 32])).expect("proof");
        assert_eq!(response.leaf_index, 1);

        let err = get_proof(&ledger, &hex::encode([9u8; 32])).expect_err("missing");
        assert_eq!(err.status, 404);
        assert_eq!(err.code, "E_NOT_FOUND");
    }

    #[test]
    fn sth_and_feed_reflect_appends() {
        let mut ledger = ledger();
        for n in 1..=3u8 {
            post_entry(&mut ledger, &request(n), i64::from(n)).expect("post");
        }

        let sth = get_sth(&ledger);
        assert_eq!(sth.size, 3);

        let feed = list_entries(&ledger, 0, 10);
        assert_eq!(feed.len(), 3);
        assert_eq!(feed[0].seq, 1);
        assert_eq!(feed[2].leaf_hash, hex::encode([3u8; 32]));

        let page = list_entries(&ledger, 2, 10);
        assert_eq!(page.len(), 1);
    }

    #[test]
    fn jwks_exposes_public_keys_only() {
        let ledger = ledger();
        let jwks = get_jwks(&ledger);
        assert_eq!(jwks.keys.len(), 1);
        let json = serde_json::to_string(&jwks).expect("serialize");
        assert!(json.contains("\"kty\":\"OKP\""));
        assert!(!json.to_lowercase().contains("private"));
    }

    #[test]
    fn api_error_serializes_without_status() {
        let err = ApiError {
            status: 404,
            error: "no entry".to_string(),
            code: "E_NOT_FOUND".to_string(),
        };
        let json = serde_json::to_value(&err).expect("serialize");
        assert_eq!(json["code"], "E_NOT_FOUND");
        assert!(json.get("status").is_none());
    }
}
