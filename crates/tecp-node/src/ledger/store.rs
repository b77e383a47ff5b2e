//! Append-only persistence for ledger entries and signed tree heads.
//!
//! One JSON Lines record per entry in `entries.jsonl`, one per STH in
//! `sth.jsonl`; an append is acknowledged only after its entry record is
//! synced. STHs are re-derivable from entries, so recovery trusts entries
//! and recomputes the head when the STH tail is missing or torn.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::sth::SignedTreeHead;
use crate::keyring::Keyring;

/// Metadata persisted alongside a leaf.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMetadata {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub policy_ids: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub kid: Option<String>,
}

impl EntryMetadata {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.policy_ids.is_none() && self.kid.is_none()
    }
}

/// One immutable ledger record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Dense, monotonic, 1-based.
    pub seq: u64,
    /// Leaf hash, lowercase hex, 32 bytes decoded.
    pub leaf: String,
    /// Milliseconds since epoch.
    pub created_at: i64,
    #[serde(skip_serializing_if = "EntryMetadata::is_empty", default)]
    pub metadata: EntryMetadata,
}

impl LedgerEntry {
    /// Decode the stored leaf hash.
    pub fn leaf_bytes(&self) -> Result<[u8; 32], StoreError> {
        let bytes = hex::decode(&self.leaf).map_err(|_| StoreError::Corrupt {
            reason: format!("entry {} leaf is not hex", self.seq),
        })?;
        let len = bytes.len();
        bytes.try_into().map_err(|_| StoreError::Corrupt {
            reason: format!("entry {} leaf is {len} bytes, expected 32", self.seq),
        })
    }
}

/// Errors from the persistence layer.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("E_STORE_IO: {context}: {source}")]
    Io {
        context: String,
        source: std::io::Error,
    },

    #[error("E_STORE_CORRUPT: {reason}")]
    Corrupt { reason: String },
}

impl StoreError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Io { .. } => "E_STORE_IO",
            Self::Corrupt { .. } => "E_STORE_CORRUPT",
        }
    }

    fn io(context: impl Into<String>) -> impl FnOnce(std::io::Error) -> Self {
        let context = context.into();
        move |source| Self::Io { context, source }
    }
}

/// State recovered from disk at startup.
#[derive(Debug, Clone, Default)]
pub struct RecoveredState {
    pub entries: Vec<LedgerEntry>,
    /// Last persisted STH, if any survived; the ledger re-derives and
    /// re-signs the head either way.
    pub last_sth: Option<SignedTreeHead>,
    /// Persisted keyring, when one has been written.
    pub keyring: Option<Keyring>,
}

/// Durability sink behind the ledger. The in-memory tree and indexes live
/// in the ledger itself; the store only persists and recovers.
pub trait LedgerStore: Send {
    /// Durably persist one entry. Must not return before the record is
    /// synced: acknowledgment is what makes an append final.
    fn persist_entry(&mut self, entry: &LedgerEntry) -> Result<(), StoreError>;

    /// Persist the STH covering the current tree. Best-effort relative to
    /// entries; recovery re-derives it.
    fn persist_sth(&mut self, sth: &SignedTreeHead) -> Result<(), StoreError>;

    /// Persist the keyring, replacing any previous snapshot whole.
    fn persist_keyring(&mut self, keyring: &Keyring) -> Result<(), StoreError>;

    /// Replay everything on disk, validating shape and sequence density.
    fn load(&mut self) -> Result<RecoveredState, StoreError>;
}

/// Volatile store for tests and ephemeral deployments.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Vec<LedgerEntry>,
    last_sth: Option<SignedTreeHead>,
    keyring: Option<Keyring>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl LedgerStore for MemoryStore {
    fn persist_entry(&mut self, entry: &LedgerEntry) -> Result<(), StoreError> {
        self.entries.push(entry.clone());
        Ok(())
    }

    fn persist_sth(&mut self, sth: &SignedTreeHead) -> Result<(), StoreError> {
        self.last_sth = Some(sth.clone());
        Ok(())
    }

    fn persist_keyring(&mut self, keyring: &Keyring) -> Result<(), StoreError> {
        self.keyring = Some(keyring.clone());
        Ok(())
    }

    fn load(&mut self) -> Result<RecoveredState, StoreError> {
        validate_entries(&self.entries)?;
        Ok(RecoveredState {
            entries: self.entries.clone(),
            last_sth: self.last_sth.clone(),
            keyring: self.keyring.clone(),
        })
    }
}

/// File-backed store: `entries.jsonl` + `sth.jsonl` under one directory.
#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
    entries_file: Option<File>,
    sth_file: Option<File>,
}

impl FileStore {
    /// Open (creating the directory if needed). Files are opened lazily on
    /// first write so a read-only verifier can point at a fresh directory.
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(dir)
            .map_err(StoreError::io(format!("create {}", dir.display())))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            entries_file: None,
            sth_file: None,
        })
    }

    fn entries_path(&self) -> PathBuf {
        self.dir.join("entries.jsonl")
    }

    fn sth_path(&self) -> PathBuf {
        self.dir.join("sth.jsonl")
    }

    fn keys_path(&self) -> PathBuf {
        self.dir.join("keys.json")
    }

    fn append_line(
        file_slot: &mut Option<File>,
        path: &Path,
        line: &str,
        sync: bool,
    ) -> Result<(), StoreError> {
        if file_slot.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(StoreError::io(format!("open {}", path.display())))?;
            *file_slot = Some(file);
        }
        let file = file_slot.as_mut().expect("file opened above");
        file.write_all(line.as_bytes())
            .and_then(|()| file.write_all(b"\n"))
            .map_err(StoreError::io(format!("write {}", path.display())))?;
        if sync {
            file.sync_data()
                .map_err(StoreError::io(format!("sync {}", path.display())))?;
        }
        Ok(())
    }

    fn read_lines<T: serde::de::DeserializeOwned>(
        path: &Path,
        what: &str,
    ) -> Result<Vec<T>, StoreError> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(path).map_err(StoreError::io(format!("open {}", path.display())))?;
        let mut records = Vec::new();
        for (line_no, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(StoreError::io(format!("read {}", path.display())))?;
            if line.trim().is_empty() {
                continue;
            }
            let record = serde_json::from_str(&line).map_err(|e| StoreError::Corrupt {
                reason: format!("{what} line {}: {e}", line_no + 1),
            })?;
            records.push(record);
        }
        Ok(records)
    }
}

impl LedgerStore for FileStore {
    fn persist_entry(&mut self, entry: &LedgerEntry) -> Result<(), StoreError> {
        let line = serde_json::to_string(entry).map_err(|e| StoreError::Corrupt {
            reason: format!("unserializable entry {}: {e}", entry.seq),
        })?;
        let path = self.entries_path();
        Self::append_line(&mut self.entries_file, &path, &line, true)
    }

    fn persist_sth(&mut self, sth: &SignedTreeHead) -> Result<(), StoreError> {
        let line = serde_json::to_string(sth).map_err(|e| StoreError::Corrupt {
            reason: format!("unserializable sth at size {}: {e}", sth.size),
        })?;
        let path = self.sth_path();
        Self::append_line(&mut self.sth_file, &path, &line, false)
    }

    fn persist_keyring(&mut self, keyring: &Keyring) -> Result<(), StoreError> {
        let path = self.keys_path();
        let json = serde_json::to_string_pretty(keyring).map_err(|e| StoreError::Corrupt {
            reason: format!("unserializable keyring: {e}"),
        })?;
        std::fs::write(&path, json).map_err(StoreError::io(format!("write {}", path.display())))
    }

    fn load(&mut self) -> Result<RecoveredState, StoreError> {
        let entries: Vec<LedgerEntry> = Self::read_lines(&self.entries_path(), "entries")?;
        validate_entries(&entries)?;

        // A torn STH tail is ignorable; entries are the source of truth.
        let last_sth = Self::read_lines::<SignedTreeHead>(&self.sth_path(), "sth")
            .ok()
            .and_then(|mut records| records.pop());

        let keys_path = self.keys_path();
        let keyring = if keys_path.exists() {
            let json = std::fs::read_to_string(&keys_path)
                .map_err(StoreError::io(format!("read {}", keys_path.display())))?;
            Some(serde_json::from_str(&json).map_err(|e| StoreError::Corrupt {
                reason: format!("keyring: {e}"),
            })?)
        } else {
            None
        };

        Ok(RecoveredState {
            entries,
            last_sth,
            keyring,
        })
    }
}

fn validate_entries(entries: &[LedgerEntry]) -> Result<(), StoreError> {
    for (idx, entry) in entries.iter().enumerate() {
        let expected_seq = idx as u64 + 1;
        if entry.seq != expected_seq {
            return Err(StoreError::Corrupt {
                reason: format!(
                    "non-dense sequence: position {idx} holds seq {}, expected {expected_seq}",
                    entry.seq
                ),
            });
        }
        entry.leaf_bytes()?;
    }
    Ok(())
}
