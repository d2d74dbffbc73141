//! The generic Raft state machine.
//!
//! [`RaftCore`] owns the node's term bookkeeping and role transitions. It is
//! deliberately effect-free: durable writes, peer broadcasts, and deferred
//! work all go through the [`RaftHooks`] record its owner binds at
//! construction. Term and vote changes are *volatile* until the owner's
//! worker calls [`RaftCore::process_async`], which flushes the pending
//! durable write and the pending broadcast in that order.
//!
//! Election timers are not the core's business: campaigns start when the
//! candidate configuration is switched on, which the election layer drives
//! from quorum membership.

use super::message::{RaftMessage, RaftNodeState};
use crate::error::{KarstError, Result};
use crate::events::Signal;
use crate::types::{ReplicaId, Term, VectorClock};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Effects the Raft core needs from its owner.
///
/// Bound once at construction. `broadcast` and `schedule_async` must not
/// block; `write` returns only when the message is durable.
#[async_trait]
pub trait RaftHooks: Send + Sync {
    /// Fan the message out to every peer.
    fn broadcast(&self, msg: &RaftMessage);

    /// Persist the message, waiting for the journal's commit notification.
    async fn write(&self, msg: &RaftMessage);

    /// Defer yield-permitting work to the owner's worker task.
    fn schedule_async(&self);
}

/// Snapshot of the visible Raft attributes, delivered to update observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RaftUpdate {
    /// Durable term.
    pub term: Term,
    /// Term advanced in memory, possibly not yet durable.
    pub volatile_term: Term,
    /// Current role.
    pub state: RaftNodeState,
    /// Known leader of the current term.
    pub leader: Option<ReplicaId>,
    /// Whether the state machine is enabled.
    pub is_enabled: bool,
}

struct CoreState {
    term: Term,
    vote: Option<ReplicaId>,
    volatile_term: Term,
    volatile_vote: Option<ReplicaId>,
    state: RaftNodeState,
    leader: Option<ReplicaId>,
    is_enabled: bool,
    is_cfg_candidate: bool,
    is_candidate: bool,
    election_quorum: usize,
    cluster_size: usize,
    votes_received: HashSet<ReplicaId>,
    vclock: Arc<VectorClock>,
    broadcast_pending: bool,
}

impl CoreState {
    fn snapshot(&self) -> RaftUpdate {
        RaftUpdate {
            term: self.term,
            volatile_term: self.volatile_term,
            state: self.state,
            leader: self.leader,
            is_enabled: self.is_enabled,
        }
    }

    fn needs_flush(&self) -> bool {
        self.broadcast_pending || self.volatile_term > self.term || self.volatile_vote != self.vote
    }

    fn check_invariants(&self, self_id: ReplicaId) {
        debug_assert!(self.term <= self.volatile_term);
        debug_assert!(self.state != RaftNodeState::Leader || self.leader == Some(self_id));
    }
}

struct Effects {
    update: Option<RaftUpdate>,
    schedule: bool,
}

impl Effects {
    fn none() -> Self {
        Self {
            update: None,
            schedule: false,
        }
    }
}

/// The process-wide Raft instance.
pub struct RaftCore {
    self_id: ReplicaId,
    hooks: Box<dyn RaftHooks>,
    state: Mutex<CoreState>,
    on_update: Signal<RaftUpdate>,
}

impl RaftCore {
    /// Create a core for the given replica, binding its effect hooks.
    pub fn new(self_id: ReplicaId, hooks: Box<dyn RaftHooks>) -> Self {
        Self {
            self_id,
            hooks,
            state: Mutex::new(CoreState {
                term: 1,
                vote: None,
                volatile_term: 1,
                volatile_vote: None,
                state: RaftNodeState::Follower,
                leader: None,
                is_enabled: false,
                is_cfg_candidate: false,
                is_candidate: false,
                election_quorum: 1,
                cluster_size: 1,
                votes_received: HashSet::new(),
                vclock: Arc::new(VectorClock::new()),
                broadcast_pending: false,
            }),
            on_update: Signal::new(),
        }
    }

    /// This replica's id.
    pub fn self_id(&self) -> ReplicaId {
        self.self_id
    }

    /// Observer list fired on every visible attribute change.
    /// Observers run synchronously and must not suspend.
    pub fn on_update(&self) -> &Signal<RaftUpdate> {
        &self.on_update
    }

    /// Durable term.
    pub fn term(&self) -> Term {
        self.state.lock().term
    }

    /// In-memory term, possibly ahead of the durable one.
    pub fn volatile_term(&self) -> Term {
        self.state.lock().volatile_term
    }

    /// Durable and volatile terms, read atomically.
    pub fn terms(&self) -> (Term, Term) {
        let st = self.state.lock();
        (st.term, st.volatile_term)
    }

    /// Current role.
    pub fn state(&self) -> RaftNodeState {
        self.state.lock().state
    }

    /// Known leader of the current term.
    pub fn leader(&self) -> Option<ReplicaId> {
        self.state.lock().leader
    }

    /// Whether the state machine is enabled.
    pub fn is_enabled(&self) -> bool {
        self.state.lock().is_enabled
    }

    /// Configured candidacy, which may lag the actual one when deferred.
    pub fn is_cfg_candidate(&self) -> bool {
        self.state.lock().is_cfg_candidate
    }

    /// Snapshot of the visible attributes.
    pub fn visible(&self) -> RaftUpdate {
        self.state.lock().snapshot()
    }

    /// Replace the journal position attached to campaign broadcasts.
    pub fn set_vclock(&self, vclock: Arc<VectorClock>) {
        self.state.lock().vclock = vclock;
    }

    /// Ingest a peer's message. Returns the accept/reject decision.
    pub fn process_msg(&self, msg: &RaftMessage, source: ReplicaId) -> Result<()> {
        if msg.term == 0 {
            return Err(KarstError::InvalidRaftMessage(format!(
                "zero term from replica {}",
                source
            )));
        }
        if source == 0 || source == self.self_id {
            return Err(KarstError::InvalidRaftMessage(format!(
                "bad source replica id {}",
                source
            )));
        }

        let fx = {
            let mut st = self.state.lock();
            let before = st.snapshot();

            if msg.term < st.volatile_term {
                debug!(
                    term = msg.term,
                    our_term = st.volatile_term,
                    source,
                    "ignoring raft message from a stale term"
                );
                Effects::none()
            } else {
                if msg.term > st.volatile_term {
                    self.begin_new_term(&mut st, msg.term);
                }

                match msg.state {
                    Some(RaftNodeState::Leader) => {
                        if st.state == RaftNodeState::Leader {
                            warn!(
                                source,
                                term = msg.term,
                                "second leader claim in our term, ignoring"
                            );
                        } else if st.leader != Some(source) {
                            info!(leader = source, term = st.volatile_term, "leader discovered");
                            st.leader = Some(source);
                            if st.state != RaftNodeState::Follower {
                                self.step_down(&mut st);
                            }
                        }
                    }
                    Some(RaftNodeState::Candidate) => {
                        self.consider_vote(&mut st, msg, source);
                    }
                    _ => {}
                }

                if msg.vote == Some(self.self_id)
                    && st.state == RaftNodeState::Candidate
                    && msg.term == st.volatile_term
                {
                    st.votes_received.insert(source);
                    debug!(
                        source,
                        votes = st.votes_received.len(),
                        quorum = st.election_quorum,
                        "vote received"
                    );
                    if st.votes_received.len() >= st.election_quorum {
                        self.become_leader(&mut st);
                    }
                }

                st.check_invariants(self.self_id);
                let after = st.snapshot();
                Effects {
                    update: (after != before).then_some(after),
                    schedule: st.needs_flush(),
                }
            }
        };

        self.apply_effects(fx);
        Ok(())
    }

    /// Replay a persisted message during recovery. No writes, no broadcasts.
    pub fn process_recovery(&self, msg: &RaftMessage) {
        let fx = {
            let mut st = self.state.lock();
            let before = st.snapshot();
            st.term = msg.term;
            st.volatile_term = msg.term;
            st.vote = msg.vote;
            st.volatile_vote = msg.vote;
            st.check_invariants(self.self_id);
            let after = st.snapshot();
            Effects {
                update: (after != before).then_some(after),
                schedule: false,
            }
        };
        self.apply_effects(fx);
    }

    /// Flush deferred work: the pending durable write, then the pending
    /// broadcast. Runs on the owner's worker task, never inside a callback.
    pub async fn process_async(&self) {
        let pending_write = {
            let st = self.state.lock();
            if st.volatile_term > st.term || st.volatile_vote != st.vote {
                Some(RaftMessage {
                    term: st.volatile_term,
                    vote: st.volatile_vote,
                    leader_id: None,
                    is_leader_seen: false,
                    state: None,
                    vclock: None,
                })
            } else {
                None
            }
        };

        if let Some(msg) = pending_write {
            self.hooks.write(&msg).await;
            let snap = {
                let mut st = self.state.lock();
                st.term = msg.term;
                st.vote = msg.vote;
                st.check_invariants(self.self_id);
                st.snapshot()
            };
            debug!(term = msg.term, "raft state persisted");
            self.on_update.emit(&snap);
        }

        let pending_broadcast = {
            let mut st = self.state.lock();
            if st.broadcast_pending {
                st.broadcast_pending = false;
                Some(RaftMessage {
                    term: st.volatile_term,
                    vote: st.volatile_vote,
                    leader_id: st.leader,
                    is_leader_seen: st.leader.is_some()
                        && st.state == RaftNodeState::Follower,
                    state: Some(st.state),
                    vclock: st
                        .state
                        .is_candidate()
                        .then(|| Arc::clone(&st.vclock)),
                })
            } else {
                None
            }
        };

        if let Some(msg) = pending_broadcast {
            self.hooks.broadcast(&msg);
        }
    }

    /// The Raft state persisted in a local snapshot: durable term and vote.
    pub fn checkpoint_local(&self) -> RaftMessage {
        let st = self.state.lock();
        RaftMessage {
            term: st.term,
            vote: st.vote,
            leader_id: None,
            is_leader_seen: false,
            state: None,
            vclock: None,
        }
    }

    /// The Raft state sent to a joining replica. Votes stay local.
    pub fn checkpoint_remote(&self) -> RaftMessage {
        let st = self.state.lock();
        RaftMessage {
            term: st.volatile_term,
            vote: None,
            leader_id: st.leader,
            is_leader_seen: st.leader.is_some() && st.state == RaftNodeState::Follower,
            state: Some(st.state),
            vclock: Some(Arc::clone(&st.vclock)),
        }
    }

    /// Switch configured candidacy, interrupting any ongoing role.
    pub fn cfg_is_candidate(&self, is_candidate: bool) {
        let fx = {
            let mut st = self.state.lock();
            let before = st.snapshot();
            st.is_cfg_candidate = is_candidate;
            if is_candidate {
                self.arm_candidate(&mut st);
            } else if st.is_candidate {
                st.is_candidate = false;
                if st.state != RaftNodeState::Follower {
                    info!("candidacy disabled, stepping down");
                    self.step_down(&mut st);
                }
            }
            st.check_invariants(self.self_id);
            let after = st.snapshot();
            Effects {
                update: (after != before).then_some(after),
                schedule: st.needs_flush(),
            }
        };
        self.apply_effects(fx);
    }

    /// Switch configured candidacy without interrupting an ongoing election
    /// or leadership; the change applies when the current role ends.
    pub fn cfg_is_candidate_later(&self, is_candidate: bool) {
        let fx = {
            let mut st = self.state.lock();
            let before = st.snapshot();
            st.is_cfg_candidate = is_candidate;
            let mid_role = matches!(
                st.state,
                RaftNodeState::Candidate | RaftNodeState::Leader
            );
            if !mid_role {
                if is_candidate {
                    self.arm_candidate(&mut st);
                } else {
                    st.is_candidate = false;
                }
            }
            st.check_invariants(self.self_id);
            let after = st.snapshot();
            Effects {
                update: (after != before).then_some(after),
                schedule: st.needs_flush(),
            }
        };
        self.apply_effects(fx);
    }

    /// Enable or disable the state machine.
    pub fn cfg_is_enabled(&self, enabled: bool) {
        let fx = {
            let mut st = self.state.lock();
            if st.is_enabled == enabled {
                Effects::none()
            } else {
                let before = st.snapshot();
                st.is_enabled = enabled;
                if enabled {
                    info!("raft enabled");
                    if st.is_cfg_candidate {
                        self.arm_candidate(&mut st);
                    }
                } else {
                    info!("raft disabled");
                    st.is_candidate = false;
                    if st.state != RaftNodeState::Follower {
                        self.step_down(&mut st);
                    }
                }
                st.check_invariants(self.self_id);
                let after = st.snapshot();
                Effects {
                    update: (after != before).then_some(after),
                    schedule: st.needs_flush(),
                }
            }
        };
        self.apply_effects(fx);
    }

    /// Set the number of votes needed to win an election.
    pub fn cfg_election_quorum(&self, quorum: usize) {
        let fx = {
            let mut st = self.state.lock();
            let before = st.snapshot();
            st.election_quorum = quorum.max(1);
            // A shrunken quorum can complete an election retroactively.
            if st.state == RaftNodeState::Candidate
                && st.votes_received.len() >= st.election_quorum
            {
                self.become_leader(&mut st);
            }
            st.check_invariants(self.self_id);
            let after = st.snapshot();
            Effects {
                update: (after != before).then_some(after),
                schedule: st.needs_flush(),
            }
        };
        self.apply_effects(fx);
    }

    /// Set the total cluster size, for bookkeeping and sanity checks.
    pub fn cfg_cluster_size(&self, size: usize) {
        let mut st = self.state.lock();
        st.cluster_size = size.max(1);
        debug!(size = st.cluster_size, "cluster size configured");
    }

    /// Step down from leadership without advancing the term. The node stops
    /// behaving as leader until an election resolves.
    pub fn resign(&self) {
        let fx = {
            let mut st = self.state.lock();
            if st.state != RaftNodeState::Leader {
                warn!(state = %st.state, "resign ignored, not a leader");
                Effects::none()
            } else {
                let before = st.snapshot();
                info!(term = st.volatile_term, "resigning leadership");
                self.step_down(&mut st);
                st.check_invariants(self.self_id);
                let after = st.snapshot();
                Effects {
                    update: (after != before).then_some(after),
                    schedule: st.needs_flush(),
                }
            }
        };
        self.apply_effects(fx);
    }

    fn apply_effects(&self, fx: Effects) {
        if let Some(snap) = fx.update {
            self.on_update.emit(&snap);
        }
        if fx.schedule {
            self.hooks.schedule_async();
        }
    }

    /// Enter a higher term: forget the leader and this term's votes, fall
    /// back to follower, and let any deferred candidacy config apply.
    fn begin_new_term(&self, st: &mut CoreState, term: Term) {
        debug_assert!(term > st.volatile_term);
        info!(term, "entering new raft term");
        st.volatile_term = term;
        st.volatile_vote = None;
        st.votes_received.clear();
        st.leader = None;
        st.state = RaftNodeState::Follower;
        st.is_candidate = st.is_cfg_candidate && st.is_enabled;
        st.broadcast_pending = true;
    }

    /// Start behaving as a candidate if the configuration allows it and
    /// this term has no known leader.
    fn arm_candidate(&self, st: &mut CoreState) {
        if !st.is_enabled || st.is_candidate {
            return;
        }
        st.is_candidate = true;
        if st.leader.is_none() && st.state == RaftNodeState::Follower {
            self.start_campaign(st);
        }
    }

    fn start_campaign(&self, st: &mut CoreState) {
        st.volatile_term += 1;
        st.volatile_vote = Some(self.self_id);
        st.state = RaftNodeState::Candidate;
        st.leader = None;
        st.votes_received.clear();
        st.votes_received.insert(self.self_id);
        st.broadcast_pending = true;
        info!(term = st.volatile_term, "campaigning for leadership");
        if st.votes_received.len() >= st.election_quorum {
            self.become_leader(st);
        }
    }

    fn become_leader(&self, st: &mut CoreState) {
        st.state = RaftNodeState::Leader;
        st.leader = Some(self.self_id);
        st.broadcast_pending = true;
        info!(term = st.volatile_term, "won the election");
    }

    fn step_down(&self, st: &mut CoreState) {
        if st.leader == Some(self.self_id) {
            st.leader = None;
        }
        st.state = RaftNodeState::Follower;
        st.votes_received.clear();
        // Deferred candidacy config applies once the role ends.
        st.is_candidate = st.is_cfg_candidate && st.is_enabled;
        st.broadcast_pending = true;
    }

    fn consider_vote(&self, st: &mut CoreState, msg: &RaftMessage, source: ReplicaId) {
        if !st.is_enabled || st.volatile_vote.is_some() || st.leader.is_some() {
            return;
        }
        // Refuse a candidate whose journal is behind ours.
        let empty = VectorClock::new();
        let candidate_clock = msg.vclock.as_deref().unwrap_or(&empty);
        if candidate_clock.happens_before(&st.vclock) {
            debug!(source, "refusing vote, candidate journal is behind ours");
            return;
        }
        info!(source, term = st.volatile_term, "voting for candidate");
        st.volatile_vote = Some(source);
        st.broadcast_pending = true;
    }
}
