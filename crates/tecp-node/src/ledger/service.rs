//! Async front for the ledger: one writer task, many callers.
//!
//! Requests arrive over an mpsc channel and are served in arrival order by a
//! task that owns the [`TransparencyLedger`] outright, which serializes
//! appends without a lock. The last published head is mirrored into a watch
//! channel so readers can snapshot it without queueing behind the writer.
//! Dropping a pending reply cancels that caller; an append that already hit
//! the durability point stays appended, which recovery makes consistent.

use tokio::sync::{mpsc, oneshot, watch};

use super::store::{EntryMetadata, LedgerEntry, LedgerStore};
use super::sth::SignedTreeHead;
use super::{AppendOutcome, InclusionProof, LedgerError, TransparencyLedger};
use crate::keyring::Jwks;

const REQUEST_BUFFER: usize = 64;

/// Errors surfaced by the async handle.
#[derive(Debug)]
pub enum ServiceError {
    Ledger(LedgerError),
    /// The writer task is gone (shutdown or panic).
    Closed,
}

impl ServiceError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Ledger(err) => err.code(),
            Self::Closed => "E_STORE_IO",
        }
    }
}

impl std::fmt::Display for ServiceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ledger(err) => write!(f, "{err}"),
            Self::Closed => write!(f, "E_STORE_IO: ledger writer task is not running"),
        }
    }
}

impl std::error::Error for ServiceError {}

impl From<LedgerError> for ServiceError {
    fn from(err: LedgerError) -> Self {
        Self::Ledger(err)
    }
}

enum Request {
    Append {
        leaf: [u8; 32],
        metadata: EntryMetadata,
        reply: oneshot::Sender<Result<AppendOutcome, LedgerError>>,
    },
    ProofForLeaf {
        leaf: [u8; 32],
        reply: oneshot::Sender<Result<InclusionProof, LedgerError>>,
    },
    Entry {
        seq: u64,
        reply: oneshot::Sender<Result<LedgerEntry, LedgerError>>,
    },
    Range {
        offset: u64,
        limit: usize,
        reply: oneshot::Sender<Vec<LedgerEntry>>,
    },
    Jwks {
        reply: oneshot::Sender<Jwks>,
    },
}

/// Cloneable handle to the writer task.
#[derive(Clone)]
pub struct LedgerHandle {
    tx: mpsc::Sender<Request>,
    sth_rx: watch::Receiver<SignedTreeHead>,
}

/// Move the ledger into a writer task and hand out its handle.
pub fn spawn<S: LedgerStore + 'static>(mut ledger: TransparencyLedger<S>) -> LedgerHandle {
    let (tx, mut rx) = mpsc::channel(REQUEST_BUFFER);
    let (sth_tx, sth_rx) = watch::channel(ledger.sth());

    tokio::spawn(async move {
        while let Some(request) = rx.recv().await {
            match request {
                Request::Append {
                    leaf,
                    metadata,
                    reply,
                } => {
                    let now_ms = chrono::Utc::now().timestamp_millis();
                    let outcome = ledger.append(&leaf, metadata, now_ms);
                    if let Ok(appended) = &outcome {
                        let _ = sth_tx.send(appended.sth.clone());
                    }
                    let _ = reply.send(outcome);
                }
                Request::ProofForLeaf { leaf, reply } => {
                    let _ = reply.send(ledger.proof_for_leaf(&leaf));
                }
                Request::Entry { seq, reply } => {
                    let _ = reply.send(ledger.entry(seq).cloned());
                }
                Request::Range {
                    offset,
                    limit,
                    reply,
                } => {
                    let _ = reply.send(ledger.range(offset, limit));
                }
                Request::Jwks { reply } => {
                    let _ = reply.send(ledger.keyring().to_jwks());
                }
            }
        }
        tracing::info!("ledger writer task stopped");
    });

    LedgerHandle { tx, sth_rx }
}

impl LedgerHandle {
    pub async fn append(
        &self,
        leaf: [u8; 32],
        metadata: EntryMetadata,
    ) -> Result<AppendOutcome, ServiceError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Request::Append {
                leaf,
                metadata,
                reply,
            })
            .await
            .map_err(|_| ServiceError::Closed)?;
        rx.await.map_err(|_| ServiceError::Closed)?.map_err(Into::into)
    }

    pub async fn proof_for_leaf(&self, leaf: [u8; 32]) -> Result<InclusionProof, ServiceError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Request::ProofForLeaf { leaf, reply })
            .await
            .map_err(|_| ServiceError::Closed)?;
        rx.await.map_err(|_| ServiceError::Closed)?.map_err(Into::into)
    }

    pub async fn entry(&self, seq: u64) -> Result<LedgerEntry, ServiceError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Request::Entry { seq, reply })
            .await
            .map_err(|_| ServiceError::Closed)?;
        rx.await.map_err(|_| ServiceError::Closed)?.map_err(Into::into)
    }

    pub async fn range(&self, offset: u64, limit: usize) -> Result<Vec<LedgerEntry>, ServiceError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Request::Range {
                offset,
                limit,
                reply,
            })
            .await
            .map_err(|_| ServiceError::Closed)?;
        rx.await.map_err(|_| ServiceError::Closed)
    }

    pub async fn jwks(&self) -> Result<Jwks, ServiceError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Request::Jwks { reply })
            .await
            .map_err(|_| ServiceError::Closed)?;
        rx.await.map_err(|_| ServiceError::Closed)
    }

    /// Snapshot of the last published head. Never waits on the writer.
    #[must_use]
    pub fn latest_sth(&self) -> SignedTreeHead {
        self.sth_rx.borrow().clone()
    }
}
