//! Common test utilities for integration tests.

use async_trait::async_trait;
use karst::config::ElectionMode;
use karst::election::ElectionManager;
use karst::error::Result;
use karst::journal::{Journal, JournalEntry, JournalRow, RowKind};
use karst::limbo::Limbo;
use karst::raft::RaftRequest;
use karst::replication::{RelayMessage, ReplicaSet};
use karst::types::{ReplicaId, Term};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// The fixture node's replica id.
pub const SELF_ID: ReplicaId = 1;

/// In-memory journal with injectable failures and an optional gate that
/// holds a submit open until released.
#[derive(Default)]
pub struct TestJournal {
    rows: Mutex<Vec<JournalRow>>,
    fail_with: Mutex<Option<i64>>,
    gate: Mutex<Option<oneshot::Receiver<()>>>,
    submits: AtomicUsize,
}

impl TestJournal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every later submit report the given result code.
    pub fn fail_with(&self, res: i64) {
        *self.fail_with.lock() = Some(res);
    }

    /// Hold the next submit open until the returned sender fires.
    pub fn gate_next_submit(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.gate.lock() = Some(rx);
        tx
    }

    /// How many entries were submitted, including rejected ones.
    pub fn submit_count(&self) -> usize {
        self.submits.load(Ordering::SeqCst)
    }

    /// All persisted Raft rows, decoded.
    pub fn raft_rows(&self) -> Vec<RaftRequest> {
        self.rows
            .lock()
            .iter()
            .filter(|row| row.kind == RowKind::Raft)
            .map(|row| row.decode_raft().expect("valid raft row"))
            .collect()
    }

    /// How many promote rows were persisted.
    pub fn promote_count(&self) -> usize {
        self.rows
            .lock()
            .iter()
            .filter(|row| row.kind == RowKind::Promote)
            .count()
    }
}

#[async_trait]
impl Journal for TestJournal {
    async fn submit(&self, entry: JournalEntry) -> Result<i64> {
        self.submits.fetch_add(1, Ordering::SeqCst);

        let gate = self.gate.lock().take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }

        if let Some(res) = *self.fail_with.lock() {
            return Ok(res);
        }

        let mut rows = self.rows.lock();
        rows.extend(entry.rows);
        Ok(rows.len() as i64)
    }
}

/// A single in-process node with fake peers.
pub struct TestCluster {
    pub election: ElectionManager,
    pub limbo: Arc<Limbo>,
    pub replicaset: Arc<ReplicaSet>,
    pub journal: Arc<TestJournal>,
    pub peers: Vec<ReplicaId>,
    pub relays: HashMap<ReplicaId, mpsc::UnboundedReceiver<RelayMessage>>,
}

impl TestCluster {
    /// Build a node with the given peers registered (all unhealthy).
    pub fn new(peers: &[ReplicaId]) -> Self {
        let journal = TestJournal::new();
        let replicaset = Arc::new(ReplicaSet::new(SELF_ID));
        let limbo = Arc::new(Limbo::new());
        let election = ElectionManager::new(
            Arc::clone(&journal) as Arc<dyn Journal>,
            Arc::clone(&limbo),
            Arc::clone(&replicaset),
        );

        let mut relays = HashMap::new();
        for &id in peers {
            replicaset.add_replica(id);
            relays.insert(id, replicaset.take_relay_stream(id).expect("fresh relay"));
        }
        election.update_election_quorum();

        Self {
            election,
            limbo,
            replicaset,
            journal,
            peers: peers.to_vec(),
            relays,
        }
    }

    /// Let the worker task and any pending callbacks run.
    pub async fn settle(&self) {
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    /// Mark every peer healthy.
    pub fn mark_all_healthy(&self) {
        for &id in &self.peers {
            self.replicaset.set_health(id, true);
        }
    }

    /// Mark every peer unhealthy.
    pub fn mark_all_unhealthy(&self) {
        for &id in &self.peers {
            self.replicaset.set_health(id, false);
        }
    }

    /// A bare term-bump message from a peer.
    pub fn term_msg(&self, term: Term) -> RaftRequest {
        RaftRequest {
            term,
            vote: None,
            leader_id: None,
            is_leader_seen: false,
            state: None,
            vclock: None,
        }
    }

    /// A peer's vote for this node.
    pub fn vote_msg(&self, term: Term) -> RaftRequest {
        RaftRequest {
            term,
            vote: Some(SELF_ID),
            leader_id: None,
            is_leader_seen: false,
            state: None,
            vclock: None,
        }
    }

    /// Drive the node to leadership: candidate mode, healthy quorum, and
    /// votes from every peer.
    pub async fn become_leader(&self) {
        self.election.set_election_mode(ElectionMode::Candidate);
        self.mark_all_healthy();
        assert!(
            self.election.raft().state().is_candidate()
                || self.election.raft().state().is_leader(),
            "campaign should start once the quorum is healthy"
        );

        let term = self.election.raft().volatile_term();
        for &id in &self.peers {
            let _ = self.election.process(&self.vote_msg(term), id);
        }
        self.settle().await;
        assert!(self.election.raft().state().is_leader());
    }

    /// Drain and count the messages queued on a peer's relay.
    pub fn drain_relay(&mut self, peer: ReplicaId) -> Vec<RaftRequest> {
        let rx = self.relays.get_mut(&peer).expect("known peer");
        let mut messages = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            let RelayMessage::Raft(req) = msg;
            messages.push(req);
        }
        messages
    }
}
