//! Error types for the Karst replicated database node.
//!
//! This module provides a unified error type [`KarstError`] for all Karst
//! operations, along with a convenient [`Result`] type alias.
//!
//! # Error Categories
//!
//! - **Election**: leader election and term bookkeeping errors
//! - **Journal**: durable write-ahead log failures
//! - **Replication**: quorum and relay errors
//! - **Configuration**: invalid settings or missing configuration
//!
//! Durable-write failures of Raft records are deliberately *not* represented
//! here: losing a term record has no defined recovery policy, so the journal
//! writer fails stop instead of returning an error.

use std::io;
use thiserror::Error;

/// Main error type for Karst operations.
#[derive(Error, Debug)]
pub enum KarstError {
    // Election errors
    #[error("elections are disabled on this node")]
    ElectionDisabled,

    #[error("task was cancelled")]
    Cancelled,

    #[error("operation timed out after {0}ms")]
    Timeout(u64),

    #[error("quorum not reached: got {got}, need {need}")]
    QuorumNotReached { got: usize, need: usize },

    #[error("malformed raft message: {0}")]
    InvalidRaftMessage(String),

    #[error("not the leader. Leader is: {leader:?}")]
    NotLeader { leader: Option<u64> },

    // Journal errors
    #[error("journal error: {0}")]
    Journal(String),

    #[error("journal rejected entry with result {0}")]
    JournalRejected(i64),

    // Limbo errors
    #[error("stale promotion for term {term}, limbo already owned at term {owned}")]
    StalePromotion { term: u64, owned: u64 },

    // Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    // Storage errors
    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    // External errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl KarstError {
    /// Check if the error is transient and the operation may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            KarstError::QuorumNotReached { .. }
                | KarstError::Timeout(_)
                | KarstError::NotLeader { .. }
        )
    }
}

impl From<rocksdb::Error> for KarstError {
    fn from(e: rocksdb::Error) -> Self {
        KarstError::Storage(e.to_string())
    }
}

impl From<bincode::Error> for KarstError {
    fn from(e: bincode::Error) -> Self {
        KarstError::Serialization(e.to_string())
    }
}

/// Result type alias for Karst operations.
pub type Result<T> = std::result::Result<T, KarstError>;
