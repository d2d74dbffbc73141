//! Node-level election integration.
//!
//! [`ElectionManager`] binds the generic Raft state machine to the rest of
//! the node: the durable journal, the per-peer relays, the synchronous
//! transaction limbo, and the replica-set health tracker. It owns the
//! policy decisions the state machine itself stays agnostic about:
//!
//! - **Election mode** maps the configured mode (off / voter / manual /
//!   candidate) onto the machine's candidacy and enablement switches.
//! - **Fencing** resigns leadership and freezes the limbo when the quorum
//!   of healthy replicas is lost, unless fencing is disabled or paused.
//! - **The worker task** drains work the state machine deferred — journal
//!   writes, broadcasts — and clears the limbo after a promotion, without
//!   ever blocking the machine's callbacks.
//!
//! Raft update callbacks run synchronously and never suspend; anything that
//! can yield is handed to the worker.

use crate::config::ElectionMode;
use crate::error::{KarstError, Result};
use crate::events::{Signal, Subscription};
use crate::journal::{Journal, JournalEntry, JournalRow, PromoteRequest};
use crate::limbo::Limbo;
use crate::observability;
use crate::raft::{RaftCore, RaftHooks, RaftMessage, RaftNodeState, RaftRequest, RaftUpdate};
use crate::replication::ReplicaSet;
use crate::types::Term;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

tokio::task_local! {
    /// Marker present only inside the election worker task, so the
    /// scheduler can refuse to wake the worker from within itself.
    static IN_RAFT_WORKER: ();
}

/// Read-only summary of the node's election state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElectionStatus {
    /// Current (volatile) term.
    pub term: Term,
    /// Current role.
    pub state: RaftNodeState,
    /// Known leader, if any.
    pub leader: Option<crate::types::ReplicaId>,
    /// Whether the node refuses writes. Followers are read-only; a leader
    /// becomes writable once it has taken the limbo over.
    pub is_read_only: bool,
}

/// Restores the worker's wakeability flag on every exit path, including
/// unwinding.
struct CancelShield<'a> {
    flag: &'a AtomicBool,
    prev: bool,
}

impl<'a> CancelShield<'a> {
    fn engage(flag: &'a AtomicBool) -> Self {
        let prev = flag.swap(false, Ordering::AcqRel);
        Self { flag, prev }
    }
}

impl Drop for CancelShield<'_> {
    fn drop(&mut self) {
        self.flag.store(self.prev, Ordering::Release);
    }
}

/// Capability record handed to the Raft core at construction.
struct CoreBridge {
    inner: Weak<ManagerInner>,
}

#[async_trait]
impl RaftHooks for CoreBridge {
    fn broadcast(&self, msg: &RaftMessage) {
        if let Some(inner) = self.inner.upgrade() {
            inner.broadcast_msg(msg);
        }
    }

    async fn write(&self, msg: &RaftMessage) {
        if let Some(inner) = self.inner.upgrade() {
            inner.write_durable(msg).await;
        }
    }

    fn schedule_async(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.schedule_async();
        }
    }
}

struct ManagerInner {
    /// Self-reference for spawning the worker and detachable observers.
    weak_self: Weak<ManagerInner>,
    core: RaftCore,
    journal: Arc<dyn Journal>,
    limbo: Arc<Limbo>,
    replicaset: Arc<ReplicaSet>,
    mode: Mutex<Option<ElectionMode>>,
    fencing_enabled: AtomicBool,
    fencing_paused: AtomicBool,
    has_work: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_notify: Notify,
    worker_cancellable: AtomicBool,
    health_notify: Notify,
    shutdown: CancellationToken,
    quorum_subs: Mutex<Vec<Subscription>>,
    lifecycle_subs: Mutex<Vec<Subscription>>,
    status: Mutex<ElectionStatus>,
    on_broadcast: Signal<()>,
    on_election: Signal<ElectionStatus>,
}

/// The election integration layer of a node. Cheap to clone.
#[derive(Clone)]
pub struct ElectionManager {
    inner: Arc<ManagerInner>,
}

impl ElectionManager {
    /// Build the election layer around its collaborators and install the
    /// Raft update trigger.
    pub fn new(journal: Arc<dyn Journal>, limbo: Arc<Limbo>, replicaset: Arc<ReplicaSet>) -> Self {
        let self_id = replicaset.self_id();
        let inner = Arc::new_cyclic(|weak: &Weak<ManagerInner>| ManagerInner {
            weak_self: weak.clone(),
            core: RaftCore::new(self_id, Box::new(CoreBridge { inner: weak.clone() })),
            journal,
            limbo,
            replicaset,
            mode: Mutex::new(None),
            fencing_enabled: AtomicBool::new(true),
            fencing_paused: AtomicBool::new(false),
            has_work: AtomicBool::new(false),
            worker: Mutex::new(None),
            worker_notify: Notify::new(),
            worker_cancellable: AtomicBool::new(true),
            health_notify: Notify::new(),
            shutdown: CancellationToken::new(),
            quorum_subs: Mutex::new(Vec::new()),
            lifecycle_subs: Mutex::new(Vec::new()),
            status: Mutex::new(ElectionStatus {
                term: 1,
                state: RaftNodeState::Follower,
                leader: None,
                is_read_only: true,
            }),
            on_broadcast: Signal::new(),
            on_election: Signal::new(),
        });

        let mut subs = Vec::new();
        let weak = Arc::downgrade(&inner);
        subs.push(inner.core.on_update().subscribe(move |update| {
            if let Some(inner) = weak.upgrade() {
                inner.on_raft_update(update);
            }
        }));
        let weak = Arc::downgrade(&inner);
        subs.push(inner.replicaset.on_extend().subscribe(move |_| {
            if let Some(inner) = weak.upgrade() {
                inner.fencing_pause();
            }
        }));
        let weak = Arc::downgrade(&inner);
        subs.push(inner.replicaset.on_health_change().subscribe(move |_| {
            if let Some(inner) = weak.upgrade() {
                inner.health_notify.notify_one();
            }
        }));
        *inner.lifecycle_subs.lock() = subs;

        Self { inner }
    }

    /// The Raft state machine this layer drives.
    pub fn raft(&self) -> &RaftCore {
        &self.inner.core
    }

    /// Replay a persisted Raft record during recovery.
    pub fn recover(&self, req: &RaftRequest) {
        self.inner.core.process_recovery(&RaftMessage::from(req));
    }

    /// The Raft state that belongs in a local snapshot.
    pub fn checkpoint_local(&self) -> RaftRequest {
        RaftRequest::from(&self.inner.core.checkpoint_local())
    }

    /// The Raft state sent to a joining replica.
    pub fn checkpoint_remote(&self) -> RaftRequest {
        RaftRequest::from(&self.inner.core.checkpoint_remote())
    }

    /// Ingest a peer's Raft message.
    pub fn process(&self, req: &RaftRequest, source: crate::types::ReplicaId) -> Result<()> {
        self.inner.core.process_msg(&RaftMessage::from(req), source)
    }

    /// Apply an election mode. No-op when the mode is unchanged.
    pub fn set_election_mode(&self, mode: ElectionMode) {
        self.inner.set_election_mode(mode);
    }

    /// Currently applied election mode, if one was configured.
    pub fn election_mode(&self) -> Option<ElectionMode> {
        *self.inner.mode.lock()
    }

    /// Toggle the leader fencing policy. Disabling immediately unfreezes
    /// the limbo and asks the health tracker to re-evaluate.
    pub fn set_election_fencing_enabled(&self, enabled: bool) {
        self.inner.set_fencing_enabled(enabled);
    }

    /// Pause fencing until the next healthy-quorum gain. Latched whenever
    /// the replica set grows, so bootstrap does not oscillate.
    pub fn election_fencing_pause(&self) {
        self.inner.fencing_pause();
    }

    /// Whether fencing is currently paused.
    pub fn is_fencing_paused(&self) -> bool {
        self.inner.fencing_paused.load(Ordering::Acquire)
    }

    /// Push the current replica-set shape into the Raft configuration.
    pub fn update_election_quorum(&self) {
        self.inner.update_election_quorum();
    }

    /// Read-only election summary.
    pub fn status(&self) -> ElectionStatus {
        *self.inner.status.lock()
    }

    /// Fired after every outbound Raft broadcast.
    pub fn on_broadcast(&self) -> &Signal<()> {
        &self.inner.on_broadcast
    }

    /// Fired on every Raft state change with the refreshed summary.
    pub fn on_election(&self) -> &Signal<ElectionStatus> {
        &self.inner.on_election
    }

    /// Wait until the current term resolves: a leader is elected, the term
    /// is superseded, or elections are disabled.
    ///
    /// `timeout = None` waits forever, which on an all-voter cluster may
    /// never return.
    pub async fn wait_term_outcome(&self, timeout: Option<Duration>) -> Result<()> {
        let inner = &self.inner;
        let snapshot = inner.core.volatile_term();

        let notify = Arc::new(Notify::new());
        let waker = Arc::clone(&notify);
        let _sub = inner.core.on_update().subscribe(move |update: &RaftUpdate| {
            let resolved = update.volatile_term > snapshot
                || !update.is_enabled
                || update.leader.is_some();
            if resolved {
                waker.notify_one();
            }
        });

        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        loop {
            let update = inner.core.visible();
            if !update.is_enabled {
                return Err(KarstError::ElectionDisabled);
            }
            if update.volatile_term > snapshot || update.leader.is_some() {
                return Ok(());
            }

            let expiry = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                _ = notify.notified() => {}
                _ = inner.shutdown.cancelled() => return Err(KarstError::Cancelled),
                _ = expiry => {
                    let ms = timeout.map(|t| t.as_millis() as u64).unwrap_or(0);
                    return Err(KarstError::Timeout(ms));
                }
            }
        }
    }

    /// Wait until the volatile term observed at entry has reached the
    /// journal.
    pub async fn wait_term_persisted(&self) -> Result<()> {
        let inner = &self.inner;
        let (term, volatile_term) = inner.core.terms();
        if term >= volatile_term {
            return Ok(());
        }
        let snapshot = volatile_term;

        let notify = Arc::new(Notify::new());
        let waker = Arc::clone(&notify);
        let _sub = inner.core.on_update().subscribe(move |update: &RaftUpdate| {
            if update.term >= snapshot {
                waker.notify_one();
            }
        });

        loop {
            if inner.core.term() >= snapshot {
                return Ok(());
            }
            tokio::select! {
                _ = notify.notified() => {}
                _ = inner.shutdown.cancelled() => return Err(KarstError::Cancelled),
            }
        }
    }

    /// Tear the election layer down. The worker is cancelled and its handle
    /// dropped without joining; the runtime may already be winding down.
    pub fn shutdown(&self) {
        let inner = &self.inner;
        info!("shutting down the election layer");
        inner.shutdown.cancel();
        inner.worker.lock().take();
        inner.quorum_subs.lock().clear();
        inner.lifecycle_subs.lock().clear();
    }
}

impl ManagerInner {
    /// The Raft update trigger. Runs synchronously on every visible state
    /// change and must not suspend.
    fn on_raft_update(&self, update: &RaftUpdate) {
        // Followers should become read-only as soon as possible.
        let status = self.refresh_status(update);
        self.on_election.emit(&status);
        observability::update_election_metrics(update.volatile_term, update.state);

        // Once a higher term exists, finalizing old synchronous
        // transactions could contradict the leader about to emerge.
        if update.volatile_term > self.limbo.promote_greatest_term() {
            self.limbo.fence();
        }

        if update.state == RaftNodeState::Leader {
            // Clearing the synchro queue can wait on a quorum; hand it to
            // the worker instead of blocking the state machine.
            self.schedule_async();
        }
    }

    fn refresh_status(&self, update: &RaftUpdate) -> ElectionStatus {
        let owns_limbo =
            self.limbo.owner() == Some(self.core.self_id()) && !self.limbo.is_fenced();
        let status = ElectionStatus {
            term: update.volatile_term,
            state: update.state,
            leader: update.leader,
            is_read_only: !(update.state.is_leader() && owns_limbo),
        };
        *self.status.lock() = status;
        status
    }

    fn refresh_status_now(&self) {
        let update = self.core.visible();
        let status = self.refresh_status(&update);
        self.on_election.emit(&status);
    }

    /// Persist a Raft message and wait for the journal. Fail-stop on any
    /// journal failure: a lost term record can violate election safety and
    /// there is no defined recovery policy. The halt must be the whole
    /// process, not a task panic the runtime would swallow, so this aborts.
    async fn write_durable(&self, msg: &RaftMessage) {
        // The state machine never persists these fields.
        assert!(msg.vclock.is_none(), "vclock must not reach the journal");
        assert!(msg.state.is_none(), "role must not reach the journal");

        let entry = match JournalRow::raft(&RaftRequest::from(msg)).map(JournalEntry::single) {
            Ok(entry) => entry,
            Err(err) => {
                error!(error = %err, "failed to encode a raft journal row, halting");
                std::process::abort();
            }
        };

        // A task mid journal write must not be woken; the shield restores
        // wakeability on every exit path.
        let shield = CancelShield::engage(&self.worker_cancellable);
        let result = self.journal.submit(entry).await;
        drop(shield);

        match result {
            Ok(seq) if seq >= 0 => {
                debug!(term = msg.term, vote = ?msg.vote, seq, "raft state reached the journal");
            }
            Ok(seq) => {
                error!(
                    seq,
                    term = msg.term,
                    "journal rejected a raft row, halting: a lost term record has no recovery policy"
                );
                std::process::abort();
            }
            Err(err) => {
                error!(
                    error = %err,
                    term = msg.term,
                    "raft journal write failed, halting: a lost term record has no recovery policy"
                );
                std::process::abort();
            }
        }
    }

    /// Fan a Raft message out to every peer relay, then tell observers.
    fn broadcast_msg(&self, msg: &RaftMessage) {
        let req = RaftRequest::from(msg);
        self.replicaset.for_each_relay(|relay| relay.push_raft(req.clone()));
        self.on_broadcast.emit(&());
        observability::record_raft_broadcast();
        debug!(term = msg.term, state = ?msg.state, "raft state broadcast to peers");
    }

    /// Defer work to the worker task, creating it on first use.
    ///
    /// The worker is only woken while it is wakeable: waking it mid journal
    /// write would break the commit wait, and waking it from within its own
    /// task is always a bug.
    fn schedule_async(&self) {
        {
            let mut worker = self.worker.lock();
            if worker.is_none() {
                let Some(inner) = self.weak_self.upgrade() else {
                    return;
                };
                *worker = Some(tokio::spawn(IN_RAFT_WORKER.scope((), async move {
                    inner.worker_loop().await;
                })));
                debug!("raft worker task started");
            }
        }

        let in_worker = IN_RAFT_WORKER.try_with(|_| ()).is_ok();
        if self.worker_cancellable.load(Ordering::Acquire) && !in_worker {
            self.worker_notify.notify_one();
        }
        self.has_work.store(true, Ordering::Release);
    }

    async fn worker_loop(&self) {
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            self.has_work.store(false, Ordering::Release);

            self.core.process_async().await;
            self.update_synchro_queue().await;

            if !self.has_work.load(Ordering::Acquire) {
                tokio::select! {
                    _ = self.worker_notify.notified() => {}
                    _ = self.shutdown.cancelled() => break,
                }
            }
        }
        debug!("raft worker task exiting");
    }

    /// Leader post-promotion: take the limbo over, retrying while the only
    /// obstacle is a missing quorum.
    async fn update_synchro_queue(&self) {
        loop {
            if self.core.state() != RaftNodeState::Leader {
                return;
            }
            match self.promote_qsync().await {
                Ok(()) => {
                    self.refresh_status_now();
                    return;
                }
                Err(err @ KarstError::QuorumNotReached { .. }) => {
                    debug!(error = %err, "waiting for a healthy quorum to clear the synchro queue");
                    tokio::select! {
                        _ = self.health_notify.notified() => {}
                        _ = self.shutdown.cancelled() => return,
                    }
                }
                Err(err) => {
                    warn!(error = %err, "failed to clear the synchro queue");
                    return;
                }
            }
        }
    }

    /// Finalize synchronous transactions inherited from previous terms and
    /// take ownership of the limbo.
    async fn promote_qsync(&self) -> Result<()> {
        let got = self.replicaset.healthy_count();
        let need = self.replicaset.healthy_quorum();
        if got < need {
            return Err(KarstError::QuorumNotReached { got, need });
        }

        let self_id = self.core.self_id();
        let term = self.core.volatile_term();
        if self.limbo.owner() == Some(self_id)
            && self.limbo.promote_greatest_term() == term
            && self.limbo.pending_count() == 0
            && !self.limbo.is_fenced()
        {
            return Ok(());
        }

        let row = JournalRow::promote(&PromoteRequest {
            origin: self_id,
            term,
        })?;
        let seq = self.journal.submit(JournalEntry::single(row)).await?;
        if seq < 0 {
            return Err(KarstError::JournalRejected(seq));
        }

        let (confirmed, rolled_back) = self.limbo.promote(self_id, term, need)?;
        info!(term, confirmed, rolled_back, "synchronous transaction queue cleared");
        Ok(())
    }

    fn set_election_mode(&self, mode: ElectionMode) {
        {
            let mut current = self.mode.lock();
            if *current == Some(mode) {
                return;
            }
            *current = Some(mode);
        }
        info!(mode = %mode, "election mode set");

        match mode {
            ElectionMode::Off | ElectionMode::Voter => {
                self.remove_quorum_observers();
                self.core.cfg_is_candidate(false);
            }
            ElectionMode::Manual => {
                self.install_quorum_observers();
                self.resume_fencing_if_quorum();
                if matches!(
                    self.core.state(),
                    RaftNodeState::Leader | RaftNodeState::Candidate
                ) {
                    // Don't disrupt current leadership or an election the
                    // node has already started.
                    self.core.cfg_is_candidate_later(false);
                } else {
                    self.core.cfg_is_candidate(false);
                }
            }
            ElectionMode::Candidate => {
                self.install_quorum_observers();
                self.resume_fencing_if_quorum();
                if self.replicaset.has_healthy_quorum() {
                    self.core.cfg_is_candidate(true);
                } else {
                    // Candidacy starts as soon as the node gains a quorum
                    // of healthy peers.
                    debug_assert!(!self.core.is_cfg_candidate());
                }
            }
        }
        self.core.cfg_is_enabled(mode != ElectionMode::Off);
    }

    /// Quorum gain/loss handler. Only installed in manual and candidate
    /// modes.
    fn notify_have_quorum(&self) {
        self.resume_fencing_if_quorum();
        let has_healthy_quorum = self.replicaset.has_healthy_quorum();

        let mode = *self.mode.lock();
        match mode {
            Some(ElectionMode::Manual) => {
                // Quorum loss must not interfere with manual elections.
                debug_assert!(!self.core.is_cfg_candidate());
                if !has_healthy_quorum {
                    self.fence();
                }
            }
            Some(ElectionMode::Candidate) => {
                if has_healthy_quorum {
                    self.core.cfg_is_candidate(true);
                } else if matches!(
                    self.core.state(),
                    RaftNodeState::Candidate | RaftNodeState::Leader
                ) {
                    self.fence();
                    self.core.cfg_is_candidate_later(false);
                } else {
                    self.core.cfg_is_candidate(false);
                }
            }
            // Observers are removed before entering these modes.
            _ => unreachable!("quorum observers fired outside manual/candidate mode"),
        }
    }

    /// Resign leadership and freeze the limbo, when fencing applies.
    fn fence(&self) {
        if !self.core.is_enabled()
            || self.core.state() != RaftNodeState::Leader
            || !self.fencing_enabled.load(Ordering::Acquire)
            || self.fencing_paused.load(Ordering::Acquire)
        {
            return;
        }

        info!("fencing: freezing the limbo and resigning leadership");
        self.limbo.fence();
        self.core.resign();
        observability::record_fencing();
    }

    fn set_fencing_enabled(&self, enabled: bool) {
        self.fencing_enabled.store(enabled, Ordering::Release);
        info!(enabled, "raft leader fencing policy changed");
        if !enabled {
            self.limbo.unfence();
            self.refresh_status_now();
        }
        self.replicaset.reevaluate();
    }

    fn fencing_pause(&self) {
        info!("election fencing paused");
        self.fencing_paused.store(true, Ordering::Release);
    }

    fn fencing_resume(&self) {
        info!("election fencing resumed");
        self.fencing_paused.store(false, Ordering::Release);
    }

    /// An observed healthy quorum clears the bootstrap pause. Runs from the
    /// quorum observers and when a mode that installs them is entered while
    /// the quorum is already healthy, since no further gain edge will fire
    /// in that case.
    fn resume_fencing_if_quorum(&self) {
        if self.fencing_paused.load(Ordering::Acquire) && self.replicaset.has_healthy_quorum() {
            self.fencing_resume();
        }
    }

    fn update_election_quorum(&self) {
        let quorum = self.replicaset.healthy_quorum();
        self.core.cfg_election_quorum(quorum);
        let size = self.replicaset.registered_count().max(1);
        self.core.cfg_cluster_size(size);
        debug!(quorum, size, "election quorum updated");
    }

    fn install_quorum_observers(&self) {
        let mut subs = self.quorum_subs.lock();
        if !subs.is_empty() {
            return;
        }
        let weak = self.weak_self.clone();
        subs.push(self.replicaset.on_quorum_gain().subscribe(move |_| {
            if let Some(inner) = weak.upgrade() {
                inner.notify_have_quorum();
            }
        }));
        let weak = self.weak_self.clone();
        subs.push(self.replicaset.on_quorum_loss().subscribe(move |_| {
            if let Some(inner) = weak.upgrade() {
                inner.notify_have_quorum();
            }
        }));
    }

    fn remove_quorum_observers(&self) {
        self.quorum_subs.lock().clear();
    }
}
