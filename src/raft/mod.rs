//! Raft consensus for the Karst replication cluster.
//!
//! This module holds the generic Raft state machine ([`RaftCore`]) and the
//! message types exchanged between replicas. The core makes term, vote, and
//! role decisions; everything with side effects — persisting a term record,
//! fanning a message out to peers, deferring yield-heavy work — goes through
//! the [`RaftHooks`] capability record bound at construction, so the core
//! itself never blocks.

// Deny unsafe code patterns in this critical consensus module.
// unwrap() calls can cause panics that break consensus.
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

mod machine;
mod message;

pub use machine::{RaftCore, RaftHooks, RaftUpdate};
pub use message::{RaftMessage, RaftNodeState, RaftRequest};
