//! Raft message and request types.
//!
//! [`RaftMessage`] is the in-memory shape the state machine works with;
//! [`RaftRequest`] is the same six fields as the wire and journal
//! serialization shape. Conversion between the two is a structural copy:
//! the vector clock is carried behind an `Arc`, never deep-copied, and no
//! validation happens here — that is the state machine's job.
//!
//! Two fields never reach the journal: `vclock` and `state` are volatile
//! and stay `None` in every persisted record.

use crate::types::{ReplicaId, Term, VectorClock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Role of a replica in the Raft state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftNodeState {
    /// Passive, follows the leader.
    Follower,
    /// Campaigning for leadership.
    Candidate,
    /// Owns the current term.
    Leader,
}

impl RaftNodeState {
    pub fn is_leader(&self) -> bool {
        matches!(self, RaftNodeState::Leader)
    }

    pub fn is_follower(&self) -> bool {
        matches!(self, RaftNodeState::Follower)
    }

    pub fn is_candidate(&self) -> bool {
        matches!(self, RaftNodeState::Candidate)
    }
}

impl fmt::Display for RaftNodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RaftNodeState::Follower => write!(f, "follower"),
            RaftNodeState::Candidate => write!(f, "candidate"),
            RaftNodeState::Leader => write!(f, "leader"),
        }
    }
}

/// In-memory Raft message.
#[derive(Debug, Clone)]
pub struct RaftMessage {
    /// Election term the message belongs to.
    pub term: Term,
    /// Who the sender voted for in this term, if anyone.
    pub vote: Option<ReplicaId>,
    /// Who the sender believes is the leader.
    pub leader_id: Option<ReplicaId>,
    /// Whether the sender has direct contact with that leader.
    pub is_leader_seen: bool,
    /// The sender's role, absent in persisted records.
    pub state: Option<RaftNodeState>,
    /// The sender's journal position, absent in persisted records.
    pub vclock: Option<Arc<VectorClock>>,
}

/// Wire and journal serialization shape of a Raft message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RaftRequest {
    pub term: Term,
    pub vote: Option<ReplicaId>,
    pub leader_id: Option<ReplicaId>,
    pub is_leader_seen: bool,
    pub state: Option<RaftNodeState>,
    #[serde(with = "arc_vclock")]
    pub vclock: Option<Arc<VectorClock>>,
}

impl From<&RaftMessage> for RaftRequest {
    fn from(msg: &RaftMessage) -> Self {
        Self {
            term: msg.term,
            vote: msg.vote,
            leader_id: msg.leader_id,
            is_leader_seen: msg.is_leader_seen,
            state: msg.state,
            vclock: msg.vclock.as_ref().map(Arc::clone),
        }
    }
}

impl From<&RaftRequest> for RaftMessage {
    fn from(req: &RaftRequest) -> Self {
        Self {
            term: req.term,
            vote: req.vote,
            leader_id: req.leader_id,
            is_leader_seen: req.is_leader_seen,
            state: req.state,
            vclock: req.vclock.as_ref().map(Arc::clone),
        }
    }
}

/// Serde helper for `Option<Arc<VectorClock>>`.
/// Serializes the clock by value, deserializes into a fresh `Arc`.
mod arc_vclock {
    use crate::types::VectorClock;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::sync::Arc;

    pub fn serialize<S>(
        vclock: &Option<Arc<VectorClock>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        vclock.as_deref().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Arc<VectorClock>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let vclock: Option<VectorClock> = Option::deserialize(deserializer)?;
        Ok(vclock.map(Arc::new))
    }
}
