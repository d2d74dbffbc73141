//! Durable write-ahead journal.
//!
//! The journal stores [`JournalRow`]s: opaque payloads tagged with a row
//! kind. Raft term records and limbo promotions both go through here, one
//! entry per decision, and an entry is durable once [`Journal::submit`]
//! returns a non-negative result.
//!
//! [`WalJournal`] is the RocksDB-backed implementation. Rows are keyed by a
//! big-endian sequence number so that iteration order is write order, and
//! every submit is flushed before the result is reported.

use crate::error::{KarstError, Result};
use crate::raft::RaftRequest;
use crate::types::{JournalSeq, ReplicaId, Term};
use async_trait::async_trait;
use rocksdb::{Options, DB};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

const ROW_PREFIX: &[u8] = b"wal_row_";

/// Kind tag of a journal row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RowKind {
    /// A Raft term/vote record.
    Raft,
    /// A limbo promotion record.
    Promote,
}

/// A single journal row: a kind tag plus an encoded payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalRow {
    /// Row kind.
    pub kind: RowKind,
    /// Encoded payload.
    pub payload: Vec<u8>,
}

impl JournalRow {
    /// Encode a Raft request into a row.
    pub fn raft(req: &RaftRequest) -> Result<Self> {
        Ok(Self {
            kind: RowKind::Raft,
            payload: bincode::serialize(req)?,
        })
    }

    /// Encode a promotion request into a row.
    pub fn promote(req: &PromoteRequest) -> Result<Self> {
        Ok(Self {
            kind: RowKind::Promote,
            payload: bincode::serialize(req)?,
        })
    }

    /// Decode the row as a Raft request.
    pub fn decode_raft(&self) -> Result<RaftRequest> {
        if self.kind != RowKind::Raft {
            return Err(KarstError::Journal(format!(
                "expected a raft row, found {:?}",
                self.kind
            )));
        }
        Ok(bincode::deserialize(&self.payload)?)
    }

    /// Decode the row as a promotion request.
    pub fn decode_promote(&self) -> Result<PromoteRequest> {
        if self.kind != RowKind::Promote {
            return Err(KarstError::Journal(format!(
                "expected a promote row, found {:?}",
                self.kind
            )));
        }
        Ok(bincode::deserialize(&self.payload)?)
    }
}

/// On-disk record of a limbo promotion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromoteRequest {
    /// Replica that took over the limbo.
    pub origin: ReplicaId,
    /// Term of the takeover.
    pub term: Term,
}

/// A journal entry: the unit of submission and durability.
#[derive(Debug, Clone)]
pub struct JournalEntry {
    /// Rows in the entry.
    pub rows: Vec<JournalRow>,
}

impl JournalEntry {
    /// Create a single-row entry.
    pub fn single(row: JournalRow) -> Self {
        Self { rows: vec![row] }
    }
}

/// Durable journal interface.
///
/// `submit` returns once the entry's fate is known: a non-negative result is
/// the sequence number of the last persisted row, a negative result means
/// the journal rejected the entry. Transport or storage failures surface as
/// errors.
#[async_trait]
pub trait Journal: Send + Sync {
    /// Persist an entry and wait for its commit notification.
    async fn submit(&self, entry: JournalEntry) -> Result<i64>;
}

/// RocksDB-backed write-ahead journal.
pub struct WalJournal {
    db: DB,
    next_seq: AtomicU64,
}

impl WalJournal {
    /// Open or create a journal at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        let db = DB::open(&opts, path)?;
        let next_seq = Self::last_seq(&db)?.map_or(1, |seq| seq + 1);

        Ok(Self {
            db,
            next_seq: AtomicU64::new(next_seq),
        })
    }

    /// Replay every persisted row in write order.
    pub fn replay<F>(&self, mut apply: F) -> Result<()>
    where
        F: FnMut(JournalSeq, JournalRow) -> Result<()>,
    {
        let iter = self.db.iterator(rocksdb::IteratorMode::From(
            ROW_PREFIX,
            rocksdb::Direction::Forward,
        ));

        let mut replayed = 0u64;
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(ROW_PREFIX) {
                break;
            }
            let seq = Self::parse_row_key(&key)?;
            let row: JournalRow = bincode::deserialize(&value)?;
            apply(seq, row)?;
            replayed += 1;
        }

        debug!(rows = replayed, "journal replay complete");
        Ok(())
    }

    fn last_seq(db: &DB) -> Result<Option<JournalSeq>> {
        let iter = db.iterator(rocksdb::IteratorMode::From(
            ROW_PREFIX,
            rocksdb::Direction::Forward,
        ));

        let mut last = None;
        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(ROW_PREFIX) {
                break;
            }
            last = Some(Self::parse_row_key(&key)?);
        }
        Ok(last)
    }

    fn row_key(seq: JournalSeq) -> Vec<u8> {
        let mut key = ROW_PREFIX.to_vec();
        key.extend_from_slice(&seq.to_be_bytes());
        key
    }

    fn parse_row_key(key: &[u8]) -> Result<JournalSeq> {
        if key.len() < ROW_PREFIX.len() + 8 {
            return Err(KarstError::Storage("Invalid journal row key".into()));
        }
        let seq_bytes: [u8; 8] = key[ROW_PREFIX.len()..]
            .try_into()
            .map_err(|_| KarstError::Storage("Invalid journal row key".into()))?;
        Ok(JournalSeq::from_be_bytes(seq_bytes))
    }
}

#[async_trait]
impl Journal for WalJournal {
    async fn submit(&self, entry: JournalEntry) -> Result<i64> {
        if entry.rows.is_empty() {
            return Err(KarstError::Journal("empty journal entry".into()));
        }

        let mut batch = rocksdb::WriteBatch::default();
        let mut last_seq = 0;
        for row in &entry.rows {
            let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
            let value = bincode::serialize(row)?;
            batch.put(Self::row_key(seq), value);
            last_seq = seq;
        }

        self.db.write(batch)?;
        self.db.flush()?;
        Ok(last_seq as i64)
    }
}
