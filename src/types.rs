//! Core type definitions for the Karst replicated database node.
//!
//! # Type Aliases
//!
//! Common identifiers are defined as type aliases for clarity:
//!
//! - [`ReplicaId`] = `u64`: cluster replica identifier
//! - [`Term`] = `u64`: Raft election term
//! - [`JournalSeq`] = `u64`: position of a row in the write-ahead journal
//!
//! # Vector Clocks
//!
//! [`VectorClock`] tracks, per replica, how much of that replica's journal
//! this node has applied. Candidates attach their clock to election
//! broadcasts so voters can refuse a candidate whose log is behind theirs.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Unique identifier for a replica in the cluster.
pub type ReplicaId = u64;

/// Raft election term.
pub type Term = u64;

/// Position of a row in the write-ahead journal.
pub type JournalSeq = u64;

/// Relative ordering of two vector clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockOrdering {
    /// The clocks are identical.
    Equal,
    /// This clock happens-before the other.
    Before,
    /// The other clock happens-before this one.
    After,
    /// Neither clock dominates the other.
    Concurrent,
}

/// Vector clock mapping replica ids to applied journal positions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorClock {
    clock: BTreeMap<ReplicaId, JournalSeq>,
}

impl VectorClock {
    /// Create an empty vector clock.
    pub fn new() -> Self {
        Self {
            clock: BTreeMap::new(),
        }
    }

    /// Get the component for a replica.
    pub fn get(&self, replica_id: ReplicaId) -> JournalSeq {
        self.clock.get(&replica_id).copied().unwrap_or(0)
    }

    /// Advance the component for a replica. Components never move backwards.
    pub fn follow(&mut self, replica_id: ReplicaId, seq: JournalSeq) {
        let current = self.clock.entry(replica_id).or_insert(0);
        *current = (*current).max(seq);
    }

    /// Increment the component for a replica by one and return the new value.
    pub fn increment(&mut self, replica_id: ReplicaId) -> JournalSeq {
        let current = self.clock.entry(replica_id).or_insert(0);
        *current += 1;
        *current
    }

    /// Merge another clock into this one, taking the max of each component.
    pub fn merge(&mut self, other: &VectorClock) {
        for (&replica_id, &seq) in &other.clock {
            self.follow(replica_id, seq);
        }
    }

    /// True when every component of this clock is `<=` the other's and at
    /// least one is strictly smaller.
    pub fn happens_before(&self, other: &VectorClock) -> bool {
        matches!(self.compare(other), ClockOrdering::Before)
    }

    /// Compare two clocks for causality.
    pub fn compare(&self, other: &VectorClock) -> ClockOrdering {
        let mut less = false;
        let mut greater = false;

        for (&replica_id, &self_seq) in &self.clock {
            let other_seq = other.get(replica_id);
            if self_seq < other_seq {
                less = true;
            } else if self_seq > other_seq {
                greater = true;
            }
        }
        for (&replica_id, &other_seq) in &other.clock {
            if !self.clock.contains_key(&replica_id) && other_seq > 0 {
                less = true;
            }
        }

        match (less, greater) {
            (false, false) => ClockOrdering::Equal,
            (true, false) => ClockOrdering::Before,
            (false, true) => ClockOrdering::After,
            (true, true) => ClockOrdering::Concurrent,
        }
    }

    /// True when the clock has no non-zero components.
    pub fn is_empty(&self) -> bool {
        self.clock.values().all(|&seq| seq == 0)
    }
}

impl fmt::Display for VectorClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (replica_id, seq)) in self.clock.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", replica_id, seq)?;
        }
        write!(f, "}}")
    }
}
