//! Counters shared by every component of a cluster

use concord_protocol::AbortReason;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters
#[derive(Debug, Default)]
pub struct Metrics {
    pub txns_started: AtomicU64,
    pub txns_committed: AtomicU64,
    pub txns_aborted_vote: AtomicU64,
    pub txns_aborted_timeout: AtomicU64,
    pub txns_aborted_admin: AtomicU64,
    pub txns_aborted_recovery: AtomicU64,
    pub decisions_redelivered: AtomicU64,
    pub participants_unresponsive: AtomicU64,
    pub quorum_waits_timed_out: AtomicU64,
    pub wal_appends: AtomicU64,
    pub votes_commit: AtomicU64,
    pub votes_abort: AtomicU64,
    pub branches_applied: AtomicU64,
    pub branches_discarded: AtomicU64,
    pub duplicate_messages: AtomicU64,
    pub unilateral_aborts: AtomicU64,
    pub liveness_suspected: AtomicU64,
    pub liveness_down: AtomicU64,
    pub liveness_recovered: AtomicU64,
    pub failovers_started: AtomicU64,
    pub failovers_completed: AtomicU64,
    pub failovers_abandoned: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_abort(&self, reason: AbortReason) {
        let counter = match reason {
            AbortReason::ParticipantVote => &self.txns_aborted_vote,
            AbortReason::Timeout => &self.txns_aborted_timeout,
            AbortReason::Administrative => &self.txns_aborted_admin,
            AbortReason::Recovery => &self.txns_aborted_recovery,
        };
        Self::incr(counter);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            txns_started: get(&self.txns_started),
            txns_committed: get(&self.txns_committed),
            txns_aborted_vote: get(&self.txns_aborted_vote),
            txns_aborted_timeout: get(&self.txns_aborted_timeout),
            txns_aborted_admin: get(&self.txns_aborted_admin),
            txns_aborted_recovery: get(&self.txns_aborted_recovery),
            decisions_redelivered: get(&self.decisions_redelivered),
            participants_unresponsive: get(&self.participants_unresponsive),
            quorum_waits_timed_out: get(&self.quorum_waits_timed_out),
            wal_appends: get(&self.wal_appends),
            votes_commit: get(&self.votes_commit),
            votes_abort: get(&self.votes_abort),
            branches_applied: get(&self.branches_applied),
            branches_discarded: get(&self.branches_discarded),
            duplicate_messages: get(&self.duplicate_messages),
            unilateral_aborts: get(&self.unilateral_aborts),
            liveness_suspected: get(&self.liveness_suspected),
            liveness_down: get(&self.liveness_down),
            liveness_recovered: get(&self.liveness_recovered),
            failovers_started: get(&self.failovers_started),
            failovers_completed: get(&self.failovers_completed),
            failovers_abandoned: get(&self.failovers_abandoned),
        }
    }
}

/// Point-in-time copy of [`Metrics`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub txns_started: u64,
    pub txns_committed: u64,
    pub txns_aborted_vote: u64,
    pub txns_aborted_timeout: u64,
    pub txns_aborted_admin: u64,
    pub txns_aborted_recovery: u64,
    pub decisions_redelivered: u64,
    pub participants_unresponsive: u64,
    pub quorum_waits_timed_out: u64,
    pub wal_appends: u64,
    pub votes_commit: u64,
    pub votes_abort: u64,
    pub branches_applied: u64,
    pub branches_discarded: u64,
    pub duplicate_messages: u64,
    pub unilateral_aborts: u64,
    pub liveness_suspected: u64,
    pub liveness_down: u64,
    pub liveness_recovered: u64,
    pub failovers_started: u64,
    pub failovers_completed: u64,
    pub failovers_abandoned: u64,
}

impl MetricsSnapshot {
    pub fn txns_aborted(&self) -> u64 {
        self.txns_aborted_vote
            + self.txns_aborted_timeout
            + self.txns_aborted_admin
            + self.txns_aborted_recovery
    }
}
