//! Election integration tests.
//!
//! Drives the election layer end to end: leadership, limbo promotion,
//! quorum-driven fencing, term waits, and journal failure handling.

#[allow(dead_code)]
mod common;

use common::{TestCluster, SELF_ID};
use karst::config::ElectionMode;
use karst::error::KarstError;
use karst::raft::RaftNodeState;
use karst::raft::RaftRequest;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// Leadership and limbo promotion
// =============================================================================

#[tokio::test]
async fn test_leader_promotion_clears_limbo() {
    let cluster = TestCluster::new(&[2, 3]);

    // An earlier term left two synchronous transactions in the limbo; one
    // of them was acknowledged by a quorum before the old leader vanished.
    cluster.election.set_election_mode(ElectionMode::Candidate);
    let _ = cluster.election.process(&cluster.term_msg(5), 2);
    let (acked, acked_rx) = cluster.limbo.enqueue(5);
    let (_orphan, orphan_rx) = cluster.limbo.enqueue(5);
    cluster.limbo.ack(acked, 2);

    // The higher term fenced the limbo via the update trigger.
    assert!(cluster.limbo.is_fenced());

    cluster.become_leader().await;

    // The worker promoted the limbo: quorum-acked entries confirmed, the
    // rest rolled back, ownership taken, fence lifted.
    assert_eq!(cluster.limbo.pending_count(), 0);
    assert_eq!(cluster.limbo.owner(), Some(SELF_ID));
    assert!(!cluster.limbo.is_fenced());
    assert_eq!(cluster.journal.promote_count(), 1);
    assert!(matches!(
        acked_rx.await,
        Ok(karst::limbo::TxnOutcome::Confirmed)
    ));
    assert!(matches!(
        orphan_rx.await,
        Ok(karst::limbo::TxnOutcome::RolledBack)
    ));

    // With the limbo owned and unfenced the node is writable.
    let status = cluster.election.status();
    assert!(status.state.is_leader());
    assert!(!status.is_read_only);
}

#[tokio::test]
async fn test_promotion_retries_until_quorum_returns() {
    let cluster = TestCluster::new(&[2]);
    cluster.election.set_election_fencing_enabled(false);
    cluster.election.set_election_mode(ElectionMode::Candidate);
    cluster.mark_all_healthy();
    let term = cluster.election.raft().volatile_term();
    let _ = cluster.election.process(&cluster.vote_msg(term), 2);
    assert!(cluster.election.raft().state().is_leader());

    // The quorum vanishes before the worker can take the limbo over.
    // Fencing is off, so the node stays leader but cannot promote.
    cluster.mark_all_unhealthy();
    cluster.settle().await;

    assert!(cluster.election.raft().state().is_leader());
    assert_eq!(cluster.limbo.owner(), None);
    assert_eq!(cluster.journal.promote_count(), 0);
    assert!(cluster.election.status().is_read_only);

    // Quorum returns; the retry loop finishes the takeover.
    cluster.mark_all_healthy();
    cluster.settle().await;
    assert_eq!(cluster.limbo.owner(), Some(SELF_ID));
    assert_eq!(cluster.journal.promote_count(), 1);
    assert!(!cluster.election.status().is_read_only);
}

// =============================================================================
// Quorum loss and fencing
// =============================================================================

#[tokio::test]
async fn test_quorum_loss_fences_candidate_leader() {
    let cluster = TestCluster::new(&[2, 3]);
    cluster.become_leader().await;
    assert!(!cluster.election.is_fencing_paused());
    assert!(!cluster.limbo.is_fenced());

    let resignations = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&resignations);
    let _sub = cluster.election.on_election().subscribe(move |status| {
        if status.state.is_follower() {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });

    cluster.mark_all_unhealthy();

    // Fencing resigned leadership, froze the limbo, and deferred the
    // candidacy config to the end of the role.
    assert_eq!(cluster.election.raft().state(), RaftNodeState::Follower);
    assert!(cluster.limbo.is_fenced());
    assert!(!cluster.election.raft().is_cfg_candidate());
    assert!(resignations.load(Ordering::SeqCst) >= 1);
}

#[tokio::test]
async fn test_quorum_loss_in_manual_mode_leaves_candidacy_alone() {
    let cluster = TestCluster::new(&[2, 3]);
    cluster.become_leader().await;

    // Hand control of candidacy to the user without disrupting leadership.
    cluster.election.set_election_mode(ElectionMode::Manual);
    assert!(cluster.election.raft().state().is_leader());
    assert!(!cluster.election.raft().is_cfg_candidate());

    cluster.mark_all_unhealthy();

    // The leader is fenced, but candidacy stays untouched.
    assert_eq!(cluster.election.raft().state(), RaftNodeState::Follower);
    assert!(cluster.limbo.is_fenced());
    assert!(!cluster.election.raft().is_cfg_candidate());
}

#[tokio::test]
async fn test_fencing_paused_suppresses_fence() {
    let cluster = TestCluster::new(&[2, 3]);
    cluster.become_leader().await;

    cluster.election.election_fencing_pause();
    cluster.mark_all_unhealthy();

    // No resign while fencing is paused.
    assert!(cluster.election.raft().state().is_leader());
    assert!(!cluster.limbo.is_fenced());

    // The first quorum gain resumes fencing and restores candidacy.
    cluster.mark_all_healthy();
    assert!(!cluster.election.is_fencing_paused());
    assert!(cluster.election.raft().is_cfg_candidate());
    assert!(cluster.election.raft().state().is_leader());
}

#[tokio::test]
async fn test_fencing_disable_unfences_immediately() {
    let cluster = TestCluster::new(&[2, 3]);
    cluster.become_leader().await;
    cluster.mark_all_unhealthy();
    assert!(cluster.limbo.is_fenced());

    cluster.election.set_election_fencing_enabled(false);
    assert!(!cluster.limbo.is_fenced());
}

#[tokio::test]
async fn test_registering_replicas_pauses_fencing() {
    let cluster = TestCluster::new(&[2]);
    // Registration latched the pause before any quorum was seen.
    assert!(cluster.election.is_fencing_paused());

    cluster.election.set_election_mode(ElectionMode::Candidate);
    cluster.mark_all_healthy();
    // The first healthy quorum clears the latch.
    assert!(!cluster.election.is_fencing_paused());
}

#[tokio::test]
async fn test_candidate_mode_with_existing_quorum_resumes_fencing() {
    let cluster = TestCluster::new(&[2, 3]);
    // Peers became healthy before any election mode was configured, so no
    // quorum observer saw the gain and the bootstrap pause is still set.
    cluster.mark_all_healthy();
    assert!(cluster.election.is_fencing_paused());

    cluster.election.set_election_mode(ElectionMode::Candidate);
    assert!(!cluster.election.is_fencing_paused());

    // A leader elected through this path must still be fenceable.
    let term = cluster.election.raft().volatile_term();
    for &id in &cluster.peers {
        let _ = cluster.election.process(&cluster.vote_msg(term), id);
    }
    cluster.settle().await;
    assert!(cluster.election.raft().state().is_leader());

    cluster.mark_all_unhealthy();
    assert_eq!(cluster.election.raft().state(), RaftNodeState::Follower);
    assert!(cluster.limbo.is_fenced());
}

#[tokio::test]
async fn test_manual_mode_with_existing_quorum_resumes_fencing() {
    let cluster = TestCluster::new(&[2]);
    cluster.mark_all_healthy();
    assert!(cluster.election.is_fencing_paused());

    cluster.election.set_election_mode(ElectionMode::Manual);
    assert!(!cluster.election.is_fencing_paused());
}

// =============================================================================
// Election modes
// =============================================================================

#[tokio::test]
async fn test_quorum_observers_removed_in_off_and_voter() {
    let cluster = TestCluster::new(&[2, 3]);

    cluster.election.set_election_mode(ElectionMode::Candidate);
    assert_eq!(cluster.replicaset.on_quorum_gain().subscriber_count(), 1);
    assert_eq!(cluster.replicaset.on_quorum_loss().subscriber_count(), 1);

    cluster.election.set_election_mode(ElectionMode::Off);
    assert_eq!(cluster.replicaset.on_quorum_gain().subscriber_count(), 0);
    assert_eq!(cluster.replicaset.on_quorum_loss().subscriber_count(), 0);
    assert!(!cluster.election.raft().is_enabled());

    cluster.election.set_election_mode(ElectionMode::Voter);
    assert_eq!(cluster.replicaset.on_quorum_gain().subscriber_count(), 0);
    assert!(cluster.election.raft().is_enabled());
}

#[tokio::test]
async fn test_mode_change_is_noop_when_equal() {
    let cluster = TestCluster::new(&[2]);
    cluster.election.set_election_mode(ElectionMode::Voter);

    let events = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&events);
    let _sub = cluster.election.on_election().subscribe(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    cluster.election.set_election_mode(ElectionMode::Voter);
    assert_eq!(events.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_candidate_mode_without_quorum_waits_for_gain() {
    let cluster = TestCluster::new(&[2, 3]);
    cluster.election.set_election_mode(ElectionMode::Candidate);

    // No healthy quorum yet: enabled, but not campaigning.
    assert!(cluster.election.raft().is_enabled());
    assert!(!cluster.election.raft().is_cfg_candidate());
    assert!(cluster.election.raft().state().is_follower());

    cluster.mark_all_healthy();
    assert!(cluster.election.raft().is_cfg_candidate());
    assert!(!cluster.election.raft().state().is_follower());
}

// =============================================================================
// Term waits
// =============================================================================

#[tokio::test]
async fn test_wait_term_outcome_inconclusive_term() {
    let cluster = TestCluster::new(&[2]);
    cluster.election.set_election_mode(ElectionMode::Voter);
    assert_eq!(cluster.election.raft().volatile_term(), 1);

    let election = cluster.election.clone();
    let waiter = tokio::spawn(async move { election.wait_term_outcome(None).await });
    cluster.settle().await;

    // The term ends with nothing: a bare bump to the next term.
    let _ = cluster.election.process(&cluster.term_msg(2), 2);

    let result = tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("waiter finished")
        .expect("waiter not aborted");
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_wait_term_outcome_leader_elected() {
    let cluster = TestCluster::new(&[2]);
    cluster.election.set_election_mode(ElectionMode::Voter);

    let election = cluster.election.clone();
    let waiter = tokio::spawn(async move { election.wait_term_outcome(None).await });
    cluster.settle().await;

    let leader_claim = RaftRequest {
        term: 1,
        vote: None,
        leader_id: Some(2),
        is_leader_seen: false,
        state: Some(RaftNodeState::Leader),
        vclock: None,
    };
    let _ = cluster.election.process(&leader_claim, 2);

    let result = tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("waiter finished")
        .expect("waiter not aborted");
    assert!(result.is_ok());
    assert_eq!(cluster.election.raft().leader(), Some(2));
}

#[tokio::test]
async fn test_wait_term_outcome_timeout() {
    let cluster = TestCluster::new(&[2]);
    cluster.election.set_election_mode(ElectionMode::Voter);

    let result = cluster
        .election
        .wait_term_outcome(Some(Duration::from_millis(30)))
        .await;
    assert!(matches!(result, Err(KarstError::Timeout(_))));
}

#[tokio::test]
async fn test_wait_term_outcome_elections_disabled() {
    let cluster = TestCluster::new(&[2]);
    cluster.election.set_election_mode(ElectionMode::Off);

    let result = cluster.election.wait_term_outcome(None).await;
    assert!(matches!(result, Err(KarstError::ElectionDisabled)));
}

#[tokio::test]
async fn test_wait_term_persisted() {
    let cluster = TestCluster::new(&[2]);
    cluster.election.set_election_mode(ElectionMode::Voter);

    // Nothing volatile: returns immediately.
    cluster.election.wait_term_persisted().await.unwrap();

    let _ = cluster.election.process(&cluster.term_msg(7), 2);
    let snapshot = cluster.election.raft().volatile_term();
    cluster.election.wait_term_persisted().await.unwrap();
    assert!(cluster.election.raft().term() >= snapshot);
}

// =============================================================================
// Durable writes and broadcasts
// =============================================================================

#[tokio::test]
async fn test_raft_rows_never_carry_volatile_fields() {
    let cluster = TestCluster::new(&[2, 3]);
    cluster.become_leader().await;

    let rows = cluster.journal.raft_rows();
    assert!(!rows.is_empty());
    for row in rows {
        assert!(row.state.is_none());
        assert!(row.vclock.is_none());
    }
}

#[tokio::test]
async fn test_broadcast_reaches_every_relay_once() {
    let mut cluster = TestCluster::new(&[2, 3]);

    let broadcasts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&broadcasts);
    let _sub = cluster.election.on_broadcast().subscribe(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    cluster.become_leader().await;

    let fired = broadcasts.load(Ordering::SeqCst);
    assert!(fired >= 1);
    let to_second = cluster.drain_relay(2);
    let to_third = cluster.drain_relay(3);
    // Every broadcast reached each peer exactly once.
    assert_eq!(to_second.len(), fired);
    assert_eq!(to_third.len(), fired);
    assert!(to_second
        .last()
        .is_some_and(|req| req.state == Some(RaftNodeState::Leader)));
}

#[tokio::test]
async fn test_deferred_work_batches_during_gated_write() {
    let cluster = TestCluster::new(&[2]);
    cluster.election.set_election_mode(ElectionMode::Voter);

    let release = cluster.journal.gate_next_submit();
    let _ = cluster.election.process(&cluster.term_msg(5), 2);
    cluster.settle().await;

    // The worker sits in the journal wait; more work arrives meanwhile and
    // must neither wake nor interrupt it.
    let _ = cluster.election.process(&cluster.term_msg(6), 2);
    assert_eq!(cluster.election.raft().term(), 1);

    release.send(()).expect("worker waiting on the gate");
    for _ in 0..50 {
        cluster.settle().await;
        if cluster.election.raft().term() == 6 {
            break;
        }
    }
    assert_eq!(cluster.election.raft().term(), 6);

    let rows = cluster.journal.raft_rows();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].term, 5);
    assert_eq!(rows[1].term, 6);
}

/// A journal failure on a Raft record has no recovery policy and must take
/// the whole process down, so the failing run happens in a child process:
/// the test re-executes itself with a marker variable and checks that the
/// child dies hard instead of exiting cleanly.
#[tokio::test]
async fn test_durable_write_failure_halts_process() {
    if std::env::var_os("KARST_JOURNAL_FAILURE_CHILD").is_some() {
        let cluster = TestCluster::new(&[2]);
        cluster.election.set_election_mode(ElectionMode::Voter);

        cluster.journal.fail_with(-1);
        let _ = cluster.election.process(&cluster.term_msg(5), 2);

        // The worker aborts the process while we wait; reaching the end of
        // this branch means the halt never happened.
        tokio::time::sleep(Duration::from_secs(5)).await;
        unreachable!("a rejected raft journal write must halt the process");
    }

    let exe = std::env::current_exe().expect("test binary path");
    let status = std::process::Command::new(exe)
        .arg("test_durable_write_failure_halts_process")
        .arg("--exact")
        .env("KARST_JOURNAL_FAILURE_CHILD", "1")
        .status()
        .expect("spawn child test process");

    // An abort dies on a signal; a clean test failure would exit with a
    // normal error code instead.
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        assert!(
            status.signal().is_some(),
            "child should have aborted, exited with {:?}",
            status
        );
    }
    #[cfg(not(unix))]
    assert!(!status.success());
}

// =============================================================================
// Update trigger and lifecycle
// =============================================================================

#[tokio::test]
async fn test_update_trigger_fences_limbo_on_new_term() {
    let cluster = TestCluster::new(&[2]);
    cluster.election.set_election_mode(ElectionMode::Voter);
    cluster.limbo.unfence();

    let _ = cluster.election.process(&cluster.term_msg(9), 2);
    // Fencing happens inside the trigger, before control returns.
    assert!(cluster.limbo.is_fenced());
}

#[tokio::test]
async fn test_checkpoint_shapes() {
    let cluster = TestCluster::new(&[2, 3]);
    cluster.become_leader().await;

    let local = cluster.election.checkpoint_local();
    assert_eq!(local.vote, Some(SELF_ID));
    assert!(local.state.is_none());
    assert!(local.vclock.is_none());

    let remote = cluster.election.checkpoint_remote();
    assert_eq!(remote.state, Some(RaftNodeState::Leader));
    assert!(remote.vote.is_none());
    assert!(remote.vclock.is_some());
}

#[tokio::test]
async fn test_recover_replays_term_without_side_effects() {
    let mut cluster = TestCluster::new(&[2]);

    let record = RaftRequest {
        term: 9,
        vote: Some(3),
        leader_id: None,
        is_leader_seen: false,
        state: None,
        vclock: None,
    };
    cluster.election.recover(&record);

    assert_eq!(cluster.election.raft().terms(), (9, 9));
    assert_eq!(cluster.journal.submit_count(), 0);
    assert!(cluster.drain_relay(2).is_empty());
}

#[tokio::test]
async fn test_process_rejects_malformed_messages() {
    let cluster = TestCluster::new(&[2]);
    cluster.election.set_election_mode(ElectionMode::Voter);

    let result = cluster.election.process(&cluster.term_msg(0), 2);
    assert!(matches!(result, Err(KarstError::InvalidRaftMessage(_))));
}

#[tokio::test]
async fn test_shutdown_detaches_everything() {
    let cluster = TestCluster::new(&[2, 3]);
    cluster.become_leader().await;

    cluster.election.shutdown();
    assert_eq!(cluster.replicaset.on_quorum_gain().subscriber_count(), 0);
    assert_eq!(cluster.replicaset.on_quorum_loss().subscriber_count(), 0);

    // Waiters fail fast once the layer is cancelled.
    let result = cluster.election.wait_term_outcome(None).await;
    assert!(matches!(
        result,
        Err(KarstError::Cancelled) | Err(KarstError::ElectionDisabled) | Ok(())
    ));
}
