//! Node assembly: wires the journal, replica set, limbo, and election
//! layer together and drives recovery.

use crate::config::KarstConfig;
use crate::election::{ElectionManager, ElectionStatus};
use crate::error::Result;
use crate::journal::{Journal, RowKind, WalJournal};
use crate::limbo::Limbo;
use crate::observability;
use crate::replication::{RelayMessage, ReplicaSet};
use crate::types::ReplicaId;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

/// A running Karst node.
pub struct Node {
    config: KarstConfig,
    journal: Arc<WalJournal>,
    limbo: Arc<Limbo>,
    replicaset: Arc<ReplicaSet>,
    election: ElectionManager,
}

impl Node {
    /// Start a node: open the journal, replay persisted state, register
    /// peers, and apply the configured election mode.
    pub async fn start(config: KarstConfig) -> Result<Self> {
        config.validate()?;
        info!(node = %config.node.name, id = config.node.id, "starting karst node");

        std::fs::create_dir_all(&config.storage.wal_dir)?;
        let journal = Arc::new(WalJournal::open(&config.storage.wal_dir)?);
        let replicaset = Arc::new(ReplicaSet::new(config.node.id));
        let limbo = Arc::new(Limbo::new());
        let election = ElectionManager::new(
            Arc::clone(&journal) as Arc<dyn Journal>,
            Arc::clone(&limbo),
            Arc::clone(&replicaset),
        );

        if !config.election.fencing_enabled {
            election.set_election_fencing_enabled(false);
        }

        // Recovery must finish before the node talks to anyone.
        journal.replay(|_, row| {
            match row.kind {
                RowKind::Raft => election.recover(&row.decode_raft()?),
                RowKind::Promote => {
                    let promote = row.decode_promote()?;
                    limbo.follow_promotion(promote.origin, promote.term);
                }
            }
            Ok(())
        })?;
        info!(
            term = election.raft().term(),
            "raft state recovered from the journal"
        );

        for peer in &config.replication.peers {
            replicaset.add_replica(peer.id);
        }
        observability::update_replication_metrics(
            replicaset.registered_count(),
            replicaset.healthy_count(),
        );

        election.update_election_quorum();
        election.set_election_mode(config.election.mode);

        Ok(Self {
            config,
            journal,
            limbo,
            replicaset,
            election,
        })
    }

    /// The node's configuration.
    pub fn config(&self) -> &KarstConfig {
        &self.config
    }

    /// The election layer.
    pub fn election(&self) -> &ElectionManager {
        &self.election
    }

    /// The synchronous-transaction limbo.
    pub fn limbo(&self) -> &Arc<Limbo> {
        &self.limbo
    }

    /// The replica set.
    pub fn replicaset(&self) -> &Arc<ReplicaSet> {
        &self.replicaset
    }

    /// The durable journal.
    pub fn journal(&self) -> &Arc<WalJournal> {
        &self.journal
    }

    /// Ingest a Raft message received from a peer.
    pub fn ingest_raft(
        &self,
        req: &crate::raft::RaftRequest,
        source: ReplicaId,
    ) -> Result<()> {
        self.election.process(req, source)
    }

    /// Take the outbound message stream for a peer. The transport layer is
    /// expected to drain it; an untaken stream accumulates messages.
    pub fn relay_stream(
        &self,
        peer_id: ReplicaId,
    ) -> Option<mpsc::UnboundedReceiver<RelayMessage>> {
        self.replicaset.take_relay_stream(peer_id)
    }

    /// Current election summary.
    pub fn status(&self) -> ElectionStatus {
        self.election.status()
    }

    /// Stop the node. The election worker is cancelled, not joined.
    pub fn shutdown(&self) {
        info!(node = %self.config.node.name, "stopping karst node");
        self.election.shutdown();
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        // Best-effort teardown for nodes dropped without an explicit stop.
        self.election.shutdown();
    }
}
