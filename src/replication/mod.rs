//! Replica-set tracking: registration, health, and quorum signals.
//!
//! The [`ReplicaSet`] knows every registered peer, its relay, and whether it
//! is currently healthy. A *healthy quorum* is a majority of all registered
//! replicas (this node counts as registered and always healthy). Crossing
//! the quorum boundary in either direction fires the corresponding signal,
//! which is what drives candidacy changes and leader fencing upstream.

mod relay;

pub use relay::{Relay, RelayMessage};

use crate::events::Signal;
use crate::types::ReplicaId;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tracing::{debug, info};

struct ReplicaEntry {
    relay: Relay,
    relay_rx: Option<mpsc::UnboundedReceiver<RelayMessage>>,
    healthy: bool,
}

struct ReplicaSetInner {
    replicas: BTreeMap<ReplicaId, ReplicaEntry>,
    had_quorum: bool,
}

/// The set of registered replicas and their health.
pub struct ReplicaSet {
    self_id: ReplicaId,
    inner: Mutex<ReplicaSetInner>,
    on_quorum_gain: Signal<()>,
    on_quorum_loss: Signal<()>,
    on_health_change: Signal<()>,
    on_extend: Signal<()>,
}

impl ReplicaSet {
    /// Create a replica set containing only this node.
    pub fn new(self_id: ReplicaId) -> Self {
        Self {
            self_id,
            inner: Mutex::new(ReplicaSetInner {
                replicas: BTreeMap::new(),
                // A cluster of one is its own majority.
                had_quorum: true,
            }),
            on_quorum_gain: Signal::new(),
            on_quorum_loss: Signal::new(),
            on_health_change: Signal::new(),
            on_extend: Signal::new(),
        }
    }

    /// This node's replica id.
    pub fn self_id(&self) -> ReplicaId {
        self.self_id
    }

    /// Register a peer. The peer starts unhealthy until its transport
    /// reports otherwise.
    pub fn add_replica(&self, peer_id: ReplicaId) {
        let (relay, relay_rx) = Relay::new(peer_id);
        {
            let mut inner = self.inner.lock();
            inner.replicas.insert(
                peer_id,
                ReplicaEntry {
                    relay,
                    relay_rx: Some(relay_rx),
                    healthy: false,
                },
            );
        }
        info!(peer = peer_id, "replica registered");

        // Extension first: listeners latch fencing before any quorum edge
        // caused by the membership change can fire.
        self.on_extend.emit(&());
        self.on_health_change.emit(&());
        self.check_quorum_edge();
    }

    /// Take the receiving half of a peer's relay queue. The transport layer
    /// drains it; tests inspect it.
    pub fn take_relay_stream(
        &self,
        peer_id: ReplicaId,
    ) -> Option<mpsc::UnboundedReceiver<RelayMessage>> {
        self.inner
            .lock()
            .replicas
            .get_mut(&peer_id)
            .and_then(|entry| entry.relay_rx.take())
    }

    /// Update a peer's health, firing signals on any change.
    pub fn set_health(&self, peer_id: ReplicaId, healthy: bool) {
        let changed = {
            let mut inner = self.inner.lock();
            match inner.replicas.get_mut(&peer_id) {
                Some(entry) if entry.healthy != healthy => {
                    entry.healthy = healthy;
                    true
                }
                _ => false,
            }
        };
        if !changed {
            return;
        }

        debug!(peer = peer_id, healthy, "replica health changed");
        self.on_health_change.emit(&());
        self.check_quorum_edge();
    }

    /// Re-announce the current quorum state to all observers. Used when a
    /// policy change (e.g. fencing re-enabled) needs the listeners to take
    /// another look.
    pub fn reevaluate(&self) {
        self.on_health_change.emit(&());
        if self.has_healthy_quorum() {
            self.on_quorum_gain.emit(&());
        } else {
            self.on_quorum_loss.emit(&());
        }
    }

    /// Total registered replicas, this node included.
    pub fn registered_count(&self) -> usize {
        self.inner.lock().replicas.len() + 1
    }

    /// The number of healthy replicas required for a quorum: a majority of
    /// all registered replicas.
    pub fn healthy_quorum(&self) -> usize {
        self.registered_count() / 2 + 1
    }

    /// Healthy replicas right now, this node included.
    pub fn healthy_count(&self) -> usize {
        let inner = self.inner.lock();
        inner.replicas.values().filter(|e| e.healthy).count() + 1
    }

    /// Whether a majority of registered replicas is healthy.
    pub fn has_healthy_quorum(&self) -> bool {
        self.healthy_count() >= self.healthy_quorum()
    }

    /// Run a closure over every peer relay.
    pub fn for_each_relay<F: FnMut(&Relay)>(&self, mut f: F) {
        let inner = self.inner.lock();
        for entry in inner.replicas.values() {
            f(&entry.relay);
        }
    }

    /// Fired when the set gains a quorum of healthy replicas.
    pub fn on_quorum_gain(&self) -> &Signal<()> {
        &self.on_quorum_gain
    }

    /// Fired when the set loses its quorum of healthy replicas.
    pub fn on_quorum_loss(&self) -> &Signal<()> {
        &self.on_quorum_loss
    }

    /// Fired on every individual health change.
    pub fn on_health_change(&self) -> &Signal<()> {
        &self.on_health_change
    }

    /// Fired when a new replica is registered.
    pub fn on_extend(&self) -> &Signal<()> {
        &self.on_extend
    }

    fn check_quorum_edge(&self) {
        let crossing = {
            let mut inner = self.inner.lock();
            let healthy =
                inner.replicas.values().filter(|e| e.healthy).count() + 1;
            let quorum = (inner.replicas.len() + 1) / 2 + 1;
            let has = healthy >= quorum;
            if has == inner.had_quorum {
                None
            } else {
                inner.had_quorum = has;
                Some(has)
            }
        };

        match crossing {
            Some(true) => {
                info!("healthy quorum gained");
                self.on_quorum_gain.emit(&());
            }
            Some(false) => {
                info!("healthy quorum lost");
                self.on_quorum_loss.emit(&());
            }
            None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_single_node_has_quorum() {
        let set = ReplicaSet::new(1);
        assert_eq!(set.registered_count(), 1);
        assert_eq!(set.healthy_quorum(), 1);
        assert!(set.has_healthy_quorum());
    }

    #[test]
    fn test_quorum_math() {
        let set = ReplicaSet::new(1);
        set.add_replica(2);
        set.add_replica(3);

        // 3 registered, majority is 2, only self healthy.
        assert_eq!(set.registered_count(), 3);
        assert_eq!(set.healthy_quorum(), 2);
        assert!(!set.has_healthy_quorum());

        set.set_health(2, true);
        assert!(set.has_healthy_quorum());
    }

    #[test]
    fn test_quorum_edge_signals() {
        let set = ReplicaSet::new(1);
        let gains = Arc::new(AtomicUsize::new(0));
        let losses = Arc::new(AtomicUsize::new(0));

        let g = Arc::clone(&gains);
        let _gain_sub = set.on_quorum_gain().subscribe(move |_| {
            g.fetch_add(1, Ordering::SeqCst);
        });
        let l = Arc::clone(&losses);
        let _loss_sub = set.on_quorum_loss().subscribe(move |_| {
            l.fetch_add(1, Ordering::SeqCst);
        });

        // Registering two unhealthy peers drops the quorum once.
        set.add_replica(2);
        set.add_replica(3);
        assert_eq!(losses.load(Ordering::SeqCst), 1);

        set.set_health(2, true);
        assert_eq!(gains.load(Ordering::SeqCst), 1);

        // No edge on a redundant change.
        set.set_health(2, true);
        assert_eq!(gains.load(Ordering::SeqCst), 1);

        set.set_health(2, false);
        assert_eq!(losses.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_relay_fan_out() {
        let set = ReplicaSet::new(1);
        set.add_replica(2);
        set.add_replica(3);
        let mut rx2 = set.take_relay_stream(2).unwrap();
        let mut rx3 = set.take_relay_stream(3).unwrap();

        let req = crate::raft::RaftRequest {
            term: 9,
            vote: None,
            leader_id: None,
            is_leader_seen: false,
            state: None,
            vclock: None,
        };
        set.for_each_relay(|relay| relay.push_raft(req.clone()));

        let RelayMessage::Raft(a) = rx2.recv().await.unwrap();
        let RelayMessage::Raft(b) = rx3.recv().await.unwrap();
        assert_eq!(a.term, 9);
        assert_eq!(b.term, 9);
    }

    #[test]
    fn test_extension_signal_precedes_quorum_loss() {
        let set = ReplicaSet::new(1);
        let order = Arc::new(Mutex::new(Vec::new()));

        let o = Arc::clone(&order);
        let _extend_sub = set.on_extend().subscribe(move |_| {
            o.lock().push("extend");
        });
        let o = Arc::clone(&order);
        let _loss_sub = set.on_quorum_loss().subscribe(move |_| {
            o.lock().push("loss");
        });

        // The first registration drops below quorum; the extension signal
        // must already have fired by then.
        set.add_replica(2);
        assert_eq!(*order.lock(), vec!["extend", "loss"]);
        set.add_replica(3);
        assert_eq!(*order.lock(), vec!["extend", "loss", "extend"]);
    }
}
