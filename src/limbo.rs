//! Synchronous-transaction limbo.
//!
//! Transactions that require quorum confirmation sit in the limbo between
//! their local journal write and the decision of their fate. The limbo is
//! owned by the current leader; a new leader takes it over by *promotion*,
//! which confirms every entry the quorum has acknowledged and rolls back the
//! rest.
//!
//! The limbo can be *fenced*: a fenced limbo stops finalizing entries
//! entirely. Fencing happens when a higher election term appears or when the
//! leader loses its quorum, so that stale confirmations cannot contradict
//! whatever the next leader decides.

use crate::error::{KarstError, Result};
use crate::types::{ReplicaId, Term};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use tokio::sync::oneshot;
use tracing::{debug, info};

/// Final outcome of a pending synchronous transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnOutcome {
    /// The transaction was confirmed by a quorum.
    Confirmed,
    /// The transaction was rolled back during a takeover.
    RolledBack,
}

/// A transaction awaiting quorum confirmation.
#[derive(Debug)]
struct PendingTxn {
    id: u64,
    term: Term,
    acks: HashSet<ReplicaId>,
    waiter: Option<oneshot::Sender<TxnOutcome>>,
}

#[derive(Debug, Default)]
struct LimboInner {
    owner: Option<ReplicaId>,
    promote_greatest_term: Term,
    fenced: bool,
    queue: VecDeque<PendingTxn>,
    next_id: u64,
}

/// Ordered buffer of synchronous transactions awaiting quorum confirmation.
#[derive(Debug, Default)]
pub struct Limbo {
    inner: Mutex<LimboInner>,
}

impl Limbo {
    /// Create an empty, unowned limbo.
    pub fn new() -> Self {
        Self::default()
    }

    /// Freeze the limbo: no entry is finalized until it is unfenced.
    pub fn fence(&self) {
        let mut inner = self.inner.lock();
        if !inner.fenced {
            inner.fenced = true;
            info!("limbo fenced");
        }
    }

    /// Resume finalizing entries.
    pub fn unfence(&self) {
        let mut inner = self.inner.lock();
        if inner.fenced {
            inner.fenced = false;
            info!("limbo unfenced");
        }
    }

    /// Whether the limbo is currently fenced.
    pub fn is_fenced(&self) -> bool {
        self.inner.lock().fenced
    }

    /// The highest term that has ever owned the limbo's promotion.
    pub fn promote_greatest_term(&self) -> Term {
        self.inner.lock().promote_greatest_term
    }

    /// The replica currently owning the limbo, if any.
    pub fn owner(&self) -> Option<ReplicaId> {
        self.inner.lock().owner
    }

    /// Number of transactions awaiting their fate.
    pub fn pending_count(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Queue a transaction. The receiver resolves once the transaction is
    /// confirmed or rolled back.
    pub fn enqueue(&self, term: Term) -> (u64, oneshot::Receiver<TxnOutcome>) {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.queue.push_back(PendingTxn {
            id,
            term,
            acks: HashSet::new(),
            waiter: Some(tx),
        });
        debug!(txn = id, term, "transaction entered the limbo");
        (id, rx)
    }

    /// Record a replica's acknowledgement of a pending transaction.
    /// Returns the updated ack count, counting this node itself.
    pub fn ack(&self, id: u64, replica_id: ReplicaId) -> usize {
        let mut inner = self.inner.lock();
        match inner.queue.iter_mut().find(|txn| txn.id == id) {
            Some(txn) => {
                txn.acks.insert(replica_id);
                txn.acks.len() + 1
            }
            None => 0,
        }
    }

    /// Take over the limbo at the given term.
    ///
    /// Entries acknowledged by at least `quorum` replicas (this node
    /// included) are confirmed; everything else is rolled back. The limbo
    /// ends up owned by `new_owner`, unfenced, with its greatest promotion
    /// term raised to `term`. Returns `(confirmed, rolled_back)` counts.
    pub fn promote(&self, new_owner: ReplicaId, term: Term, quorum: usize) -> Result<(usize, usize)> {
        let (confirmed, rolled_back, waiters) = {
            let mut inner = self.inner.lock();
            if term < inner.promote_greatest_term {
                return Err(KarstError::StalePromotion {
                    term,
                    owned: inner.promote_greatest_term,
                });
            }

            let mut waiters = Vec::new();
            let mut confirmed = 0usize;
            let mut rolled_back = 0usize;
            while let Some(mut txn) = inner.queue.pop_front() {
                let outcome = if txn.acks.len() + 1 >= quorum {
                    confirmed += 1;
                    TxnOutcome::Confirmed
                } else {
                    rolled_back += 1;
                    TxnOutcome::RolledBack
                };
                debug!(txn = txn.id, term = txn.term, ?outcome, "limbo entry finalized");
                if let Some(waiter) = txn.waiter.take() {
                    waiters.push((waiter, outcome));
                }
            }

            inner.owner = Some(new_owner);
            inner.promote_greatest_term = term;
            inner.fenced = false;
            (confirmed, rolled_back, waiters)
        };

        for (waiter, outcome) in waiters {
            // The submitter may be gone; its fate is recorded regardless.
            let _ = waiter.send(outcome);
        }

        if confirmed + rolled_back > 0 {
            info!(confirmed, rolled_back, term, "limbo taken over");
        }
        Ok((confirmed, rolled_back))
    }

    /// Raise the greatest promotion term without a takeover. Used when
    /// replaying a promotion performed by another replica.
    pub fn follow_promotion(&self, owner: ReplicaId, term: Term) {
        let mut inner = self.inner.lock();
        if term >= inner.promote_greatest_term {
            inner.promote_greatest_term = term;
            inner.owner = Some(owner);
        }
    }
}
