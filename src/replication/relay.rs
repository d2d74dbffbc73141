//! Per-peer outbound relay.
//!
//! A relay is the queue feeding one peer's replication stream. Pushing never
//! fails from the caller's point of view: if the peer's transport is gone,
//! the message is dropped and the relay logs it.

use crate::raft::RaftRequest;
use crate::types::ReplicaId;
use tokio::sync::mpsc;
use tracing::debug;

/// A message queued for delivery to a peer.
#[derive(Debug, Clone)]
pub enum RelayMessage {
    /// A Raft state broadcast.
    Raft(RaftRequest),
}

/// Outbound channel to a single peer.
#[derive(Debug)]
pub struct Relay {
    peer_id: ReplicaId,
    tx: mpsc::UnboundedSender<RelayMessage>,
}

impl Relay {
    /// Create a relay and the receiving half of its queue.
    pub fn new(peer_id: ReplicaId) -> (Self, mpsc::UnboundedReceiver<RelayMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { peer_id, tx }, rx)
    }

    /// The peer this relay feeds.
    pub fn peer_id(&self) -> ReplicaId {
        self.peer_id
    }

    /// Queue a Raft request for the peer. Delivery failures are absorbed.
    pub fn push_raft(&self, req: RaftRequest) {
        if self.tx.send(RelayMessage::Raft(req)).is_err() {
            debug!(peer = self.peer_id, "relay detached, dropping raft message");
        }
    }
}
