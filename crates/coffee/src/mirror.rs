//! Mirror store: the off-chain, queryable projection of ledger entries.
//!
//! Written only by the indexer (single writer); read concurrently by queries.
//! Reads take a short read lock and clone out, so a query never holds the
//! store while the indexer applies.

use crate::checkpoint::sync_parent_dir;
use crate::entry::{MirrorRecord, SourcePosition};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// A different record already exists at this sequence. Store or source is corrupt.
    #[error("conflicting record at sequence {sequence}")]
    Conflict {
        sequence: u64,
        existing: Box<MirrorRecord>,
        incoming: Box<MirrorRecord>,
    },

    /// A new sequence below the current tip.
    #[error("sequence {sequence} is below the mirrored tip {highest}")]
    OutOfOrder { sequence: u64, highest: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Journal line that is neither valid nor a torn final write.
    #[error("corrupt journal {path} at line {line}: {reason}")]
    Corrupt {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("store lock poisoned")]
    Poisoned,
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Outcome of a successful [MirrorStore::upsert].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    /// An identical entry was already mirrored; nothing changed.
    Unchanged,
}

/// Append-only projection of ledger entries keyed by sequence.
///
/// Implementations must satisfy:
/// - a record is never mutated once inserted;
/// - records are only removed by [truncate_after](MirrorStore::truncate_after) (reorg rollback);
/// - readers may run concurrently with the single writer.
pub trait MirrorStore: Send + Sync {
    /// Insert a record. `Unchanged` if the same ledger entry is already stored at
    /// that sequence; [StoreError::Conflict] if a different one is.
    fn upsert(&self, record: &MirrorRecord) -> StoreResult<Upsert>;

    fn get(&self, sequence: u64) -> StoreResult<Option<MirrorRecord>>;

    /// Most recent first: `offset` records are skipped, at most `limit` returned.
    fn list_recent(&self, limit: usize, offset: usize) -> StoreResult<Vec<MirrorRecord>>;

    fn highest_sequence(&self) -> StoreResult<Option<u64>>;

    /// Record with the highest sequence.
    fn tip(&self) -> StoreResult<Option<MirrorRecord>>;

    fn len(&self) -> StoreResult<usize>;

    fn is_empty(&self) -> StoreResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Remove every record whose position is after `position`. Returns how many were removed.
    fn truncate_after(&self, position: &SourcePosition) -> StoreResult<usize>;
}

/// Shared insert rule: None means "insert it".
fn check_upsert(
    records: &BTreeMap<u64, MirrorRecord>,
    record: &MirrorRecord,
) -> StoreResult<Option<Upsert>> {
    let sequence = record.sequence();
    if let Some(existing) = records.get(&sequence) {
        // Position is bookkeeping; the same entry re-mined elsewhere still matches.
        if existing.entry == record.entry {
            return Ok(Some(Upsert::Unchanged));
        }
        return Err(StoreError::Conflict {
            sequence,
            existing: Box::new(existing.clone()),
            incoming: Box::new(record.clone()),
        });
    }
    match records.keys().next_back() {
        Some(&highest) if sequence < highest => Err(StoreError::OutOfOrder { sequence, highest }),
        _ => Ok(None),
    }
}

fn recent(records: &BTreeMap<u64, MirrorRecord>, limit: usize, offset: usize) -> Vec<MirrorRecord> {
    records.values().rev().skip(offset).take(limit).cloned().collect()
}

fn first_after(records: &BTreeMap<u64, MirrorRecord>, position: &SourcePosition) -> Option<u64> {
    // Positions increase with sequence, so the doomed records form a suffix.
    records
        .values()
        .find(|r| r.position.is_after(position))
        .map(|r| r.sequence())
}

/// In-memory store. Intended for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryMirror {
    records: RwLock<BTreeMap<u64, MirrorRecord>>,
}

impl MemoryMirror {
    pub fn new() -> Self {
        Self::default()
    }

    /// All records, oldest first.
    pub fn snapshot(&self) -> StoreResult<Vec<MirrorRecord>> {
        let records = self.records.read().map_err(|_| StoreError::Poisoned)?;
        Ok(records.values().cloned().collect())
    }
}

impl MirrorStore for MemoryMirror {
    fn upsert(&self, record: &MirrorRecord) -> StoreResult<Upsert> {
        let mut records = self.records.write().map_err(|_| StoreError::Poisoned)?;
        if let Some(outcome) = check_upsert(&records, record)? {
            return Ok(outcome);
        }
        records.insert(record.sequence(), record.clone());
        Ok(Upsert::Inserted)
    }

    fn get(&self, sequence: u64) -> StoreResult<Option<MirrorRecord>> {
        let records = self.records.read().map_err(|_| StoreError::Poisoned)?;
        Ok(records.get(&sequence).cloned())
    }

    fn list_recent(&self, limit: usize, offset: usize) -> StoreResult<Vec<MirrorRecord>> {
        let records = self.records.read().map_err(|_| StoreError::Poisoned)?;
        Ok(recent(&records, limit, offset))
    }

    fn highest_sequence(&self) -> StoreResult<Option<u64>> {
        let records = self.records.read().map_err(|_| StoreError::Poisoned)?;
        Ok(records.keys().next_back().copied())
    }

    fn tip(&self) -> StoreResult<Option<MirrorRecord>> {
        let records = self.records.read().map_err(|_| StoreError::Poisoned)?;
        Ok(records.values().next_back().cloned())
    }

    fn len(&self) -> StoreResult<usize> {
        let records = self.records.read().map_err(|_| StoreError::Poisoned)?;
        Ok(records.len())
    }

    fn truncate_after(&self, position: &SourcePosition) -> StoreResult<usize> {
        let mut records = self.records.write().map_err(|_| StoreError::Poisoned)?;
        Ok(match first_after(&records, position) {
            Some(cut) => records.split_off(&cut).len(),
            None => 0,
        })
    }
}

/// File-backed store: one JSON record per line, synced on every append.
///
/// The full set is also held in memory for reads. Truncation rewrites the
/// journal to a sibling temp file and renames it into place.
#[derive(Debug)]
pub struct FileMirror {
    path: PathBuf,
    journal: Mutex<File>,
    records: RwLock<BTreeMap<u64, MirrorRecord>>,
}

impl FileMirror {
    /// Open (or create) the journal at `path` and replay it.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let records = if path.exists() {
            replay(&path)?
        } else {
            BTreeMap::new()
        };
        let journal = OpenOptions::new().create(true).append(true).open(&path)?;
        tracing::info!(path = %path.display(), records = records.len(), "mirror journal opened");
        Ok(Self {
            path,
            journal: Mutex::new(journal),
            records: RwLock::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Read the journal. A torn final line (crash mid-append) is cut off; damage
/// anywhere else is an error.
///
/// Lines are decoded from raw bytes: a crash can split a multi-byte character.
fn replay(path: &Path) -> StoreResult<BTreeMap<u64, MirrorRecord>> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut records = BTreeMap::new();
    let mut valid_bytes = 0u64;
    let mut missing_newline = false;
    let mut line = Vec::new();
    let mut number = 0usize;
    loop {
        line.clear();
        let read = reader.read_until(b'\n', &mut line)?;
        if read == 0 {
            break;
        }
        number += 1;
        let terminated = line.last() == Some(&b'\n');
        let body = if terminated { &line[..read - 1] } else { &line[..] };
        if body.iter().all(u8::is_ascii_whitespace) {
            valid_bytes += read as u64;
            continue;
        }
        match serde_json::from_slice::<MirrorRecord>(body) {
            Ok(record) => {
                if let Some(&highest) = records.keys().next_back() {
                    if record.sequence() <= highest {
                        return Err(StoreError::Corrupt {
                            path: path.to_path_buf(),
                            line: number,
                            reason: format!("sequence {} after {}", record.sequence(), highest),
                        });
                    }
                }
                records.insert(record.sequence(), record);
                valid_bytes += read as u64;
                missing_newline = !terminated;
            }
            Err(e) if !terminated || reader.fill_buf()?.is_empty() => {
                tracing::warn!(path = %path.display(), reason = %e, "discarding torn journal tail");
                let file = OpenOptions::new().write(true).open(path)?;
                file.set_len(valid_bytes)?;
                file.sync_all()?;
                break;
            }
            Err(e) => {
                return Err(StoreError::Corrupt {
                    path: path.to_path_buf(),
                    line: number,
                    reason: e.to_string(),
                })
            }
        }
    }
    // Complete final record whose newline never made it to disk.
    if missing_newline {
        let mut file = OpenOptions::new().append(true).open(path)?;
        file.write_all(b"\n")?;
        file.sync_all()?;
    }
    Ok(records)
}

impl MirrorStore for FileMirror {
    fn upsert(&self, record: &MirrorRecord) -> StoreResult<Upsert> {
        // The journal lock serializes writers; readers only wait for the map insert.
        let mut journal = self.journal.lock().map_err(|_| StoreError::Poisoned)?;
        {
            let records = self.records.read().map_err(|_| StoreError::Poisoned)?;
            if let Some(outcome) = check_upsert(&records, record)? {
                return Ok(outcome);
            }
        }
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        journal.write_all(line.as_bytes())?;
        journal.sync_data()?;
        self.records
            .write()
            .map_err(|_| StoreError::Poisoned)?
            .insert(record.sequence(), record.clone());
        Ok(Upsert::Inserted)
    }

    fn get(&self, sequence: u64) -> StoreResult<Option<MirrorRecord>> {
        let records = self.records.read().map_err(|_| StoreError::Poisoned)?;
        Ok(records.get(&sequence).cloned())
    }

    fn list_recent(&self, limit: usize, offset: usize) -> StoreResult<Vec<MirrorRecord>> {
        let records = self.records.read().map_err(|_| StoreError::Poisoned)?;
        Ok(recent(&records, limit, offset))
    }

    fn highest_sequence(&self) -> StoreResult<Option<u64>> {
        let records = self.records.read().map_err(|_| StoreError::Poisoned)?;
        Ok(records.keys().next_back().copied())
    }

    fn tip(&self) -> StoreResult<Option<MirrorRecord>> {
        let records = self.records.read().map_err(|_| StoreError::Poisoned)?;
        Ok(records.values().next_back().cloned())
    }

    fn len(&self) -> StoreResult<usize> {
        let records = self.records.read().map_err(|_| StoreError::Poisoned)?;
        Ok(records.len())
    }

    fn truncate_after(&self, position: &SourcePosition) -> StoreResult<usize> {
        let mut journal = self.journal.lock().map_err(|_| StoreError::Poisoned)?;
        let mut records = self.records.write().map_err(|_| StoreError::Poisoned)?;
        let cut = match first_after(&records, position) {
            Some(cut) => cut,
            None => return Ok(0),
        };
        let mut kept = records.clone();
        let removed = kept.split_off(&cut).len();

        let tmp = self.path.with_extension("tmp");
        {
            let mut out = File::create(&tmp)?;
            for record in kept.values() {
                let mut line = serde_json::to_string(record)?;
                line.push('\n');
                out.write_all(line.as_bytes())?;
            }
            out.sync_all()?;
        }
        std::fs::rename(&tmp, &self.path)?;
        sync_parent_dir(&self.path)?;
        *journal = OpenOptions::new().append(true).open(&self.path)?;
        *records = kept;
        Ok(removed)
    }
}

/// One row of the memo listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemoView {
    pub author: String,
    pub message: String,
    pub amount: u128,
    pub sequence_number: u64,
}

impl From<&MirrorRecord> for MemoView {
    fn from(record: &MirrorRecord) -> Self {
        Self {
            author: record.entry.author.clone(),
            message: record.entry.message.clone(),
            amount: record.entry.amount,
            sequence_number: record.entry.sequence,
        }
    }
}

/// The `limit` most recent memos, newest first. Read-only.
pub fn recent_memos<M: MirrorStore + ?Sized>(store: &M, limit: usize) -> StoreResult<Vec<MemoView>> {
    Ok(store
        .list_recent(limit, 0)?
        .iter()
        .map(MemoView::from)
        .collect())
}
