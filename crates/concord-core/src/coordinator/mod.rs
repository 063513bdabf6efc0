//! Transaction coordinator
//!
//! Drives two-phase commit for many concurrent transactions. Each
//! transaction gets one driver task:
//!
//! 1. PREPARING is logged, PREPARE fans out to every participant
//! 2. votes are collected until all are in or the phase-1 deadline passes
//! 3. the decision is logged (and replicated where the policy requires it)
//!    before any participant hears about it
//! 4. the decision is redelivered with backoff until every participant
//!    acknowledges; stragglers past the phase-2 deadline are reported as
//!    unresponsive but never block the outcome
//!
//! A restarted or promoted coordinator replays its log: decided
//! transactions resume delivery, undecided ones are aborted.

pub mod recovery;
pub mod state;
pub mod store;

pub use recovery::{RecoveryAction, Replayed};
pub use state::{TxnEvent, transition};
pub use store::{Transaction, TxnStatus, TxnStore};

use crate::config::CoordinatorConfig;
use crate::metrics::Metrics;
use crate::transport::Transport;
use crate::wal::{TxnTransition, Wal};
use crate::{Error, Result, now_ms};
use async_trait::async_trait;
use concord_protocol::{
    AbortReason, Decision, Envelope, NodeId, Outcome, Payload, ProtocolMessage, TxnId, TxnState,
    Vote, VoteState,
};
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Waits until a log sequence is durable enough to act on
#[async_trait]
pub trait DurabilityGate: Send + Sync {
    /// Resolve once `sequence` of `role`'s log satisfies the role's
    /// replication policy
    async fn wait_durable(&self, role: &NodeId, sequence: u64) -> Result<()>;
}

/// Local fsync is all that is required
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalDurability;

#[async_trait]
impl DurabilityGate for LocalDurability {
    async fn wait_durable(&self, _role: &NodeId, _sequence: u64) -> Result<()> {
        Ok(())
    }
}

/// Notifications for the failover controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorEvent {
    /// Participant did not acknowledge within the phase-2 deadline
    ParticipantUnresponsive { txn: TxnId, participant: NodeId },
    /// Log write failed; the role stopped serving
    Fenced { role: NodeId },
}

/// Result of replaying the coordinator log
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Decided transactions whose delivery resumed
    pub resumed: Vec<TxnId>,
    /// Undecided transactions aborted by recovery
    pub aborted: Vec<TxnId>,
    pub retired: usize,
}

/// One coordinator role
pub struct Coordinator {
    role: NodeId,
    config: CoordinatorConfig,
    wal: Arc<Wal>,
    txns: TxnStore,
    transport: Arc<dyn Transport>,
    durability: Arc<dyn DurabilityGate>,
    events: broadcast::Sender<CoordinatorEvent>,
    metrics: Arc<Metrics>,
    decisions: Mutex<()>,
    shutdown: CancellationToken,
}

impl Coordinator {
    pub fn new(
        role: NodeId,
        config: CoordinatorConfig,
        wal: Arc<Wal>,
        transport: Arc<dyn Transport>,
        durability: Arc<dyn DurabilityGate>,
        metrics: Arc<Metrics>,
        shutdown: &CancellationToken,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            role,
            config,
            wal,
            txns: TxnStore::new(),
            transport,
            durability,
            events,
            metrics,
            decisions: Mutex::new(()),
            shutdown: shutdown.child_token(),
        }
    }

    pub fn role(&self) -> &NodeId {
        &self.role
    }

    pub fn wal(&self) -> &Arc<Wal> {
        &self.wal
    }

    pub fn store(&self) -> &TxnStore {
        &self.txns
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.events.subscribe()
    }

    /// False once the log is fenced or the role was shut down
    pub fn is_serving(&self) -> bool {
        !self.wal.is_fenced() && !self.shutdown.is_cancelled()
    }

    /// Stop every driver task of this role
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Fence the log and stop serving
    pub fn fence(&self, reason: &str) {
        self.wal.fence(reason);
        self.stop_serving();
    }

    fn stop_serving(&self) {
        if !self.shutdown.is_cancelled() {
            tracing::error!("Coordinator {} stopped serving", self.role);
            let _ = self.events.send(CoordinatorEvent::Fenced {
                role: self.role.clone(),
            });
        }
        self.shutdown.cancel();
    }

    fn logged<T>(&self, result: Result<T>) -> Result<T> {
        if result.is_err() && self.wal.is_fenced() {
            self.stop_serving();
        }
        result
    }

    /// Start a transaction whose participants have nothing to execute
    pub fn begin(self: &Arc<Self>, participants: Vec<NodeId>) -> Result<TxnId> {
        let mut seen = HashSet::new();
        let participants: Vec<NodeId> = participants
            .into_iter()
            .filter(|p| seen.insert(p.clone()))
            .collect();
        let payloads = participants
            .iter()
            .map(|p| (p.clone(), Vec::new()))
            .collect();
        self.start(participants, payloads)
    }

    /// Start a transaction executing `payloads[p]` at each participant `p`
    pub fn begin_with_payloads(
        self: &Arc<Self>,
        payloads: BTreeMap<NodeId, Payload>,
    ) -> Result<TxnId> {
        let participants = payloads.keys().cloned().collect();
        self.start(participants, payloads)
    }

    fn start(
        self: &Arc<Self>,
        participants: Vec<NodeId>,
        payloads: BTreeMap<NodeId, Payload>,
    ) -> Result<TxnId> {
        if !self.is_serving() {
            return Err(Error::fenced(self.role.to_string()));
        }
        if participants.is_empty() {
            return Err(Error::transaction(
                "a transaction needs at least one participant",
            ));
        }

        let shard = self.config.shard;
        let record = self.logged(self.wal.append_with(|sequence| {
            (
                TxnId::new(shard, sequence),
                TxnTransition::Begin {
                    participants: participants.clone(),
                    payloads: payloads.clone(),
                },
            )
        }))?;
        let id = record.txn;
        self.txns.insert(Transaction::new(
            id,
            participants,
            payloads,
            record.timestamp_ms,
        ));
        Metrics::incr(&self.metrics.txns_started);

        self.logged(self.wal.append(id, TxnTransition::Preparing))?;
        let deadline_ms = now_ms() + self.config.phase1_timeout.as_millis() as u64;
        self.txns
            .with_mut(id, |t| -> Result<()> {
                t.state = transition(t.state, TxnEvent::StartPrepare)?;
                t.phase1_deadline_ms = Some(deadline_ms);
                Ok(())
            })
            .ok_or(Error::UnknownTransaction(id))??;

        tracing::info!(
            "{} began {} with participants {:?}",
            self.role,
            id,
            self.txns
                .get(id)
                .map(|t| t.participants)
                .unwrap_or_default()
        );

        let driver = self.clone();
        tokio::spawn(async move { driver.drive(id).await });
        Ok(id)
    }

    async fn drive(self: Arc<Self>, id: TxnId) {
        match self.run_phase_one(id).await {
            Ok(true) => self.deliver(id).await,
            Ok(false) => {}
            Err(e) => tracing::error!("{} phase 1 of {} failed: {}", self.role, id, e),
        }
    }

    /// Returns true once a decision exists
    async fn run_phase_one(&self, id: TxnId) -> Result<bool> {
        let txn = self.txns.get(id).ok_or(Error::UnknownTransaction(id))?;
        let wake = self.txns.notifier(id).ok_or(Error::UnknownTransaction(id))?;
        let deadline_ms = txn.phase1_deadline_ms.unwrap_or_else(now_ms);

        let prepares = txn.participants.iter().map(|p| {
            let payload = txn.payloads.get(p).cloned().unwrap_or_default();
            self.send(Envelope::new(
                self.role.clone(),
                p.clone(),
                ProtocolMessage::Prepare {
                    txn: id,
                    payload,
                    deadline_ms,
                },
            ))
        });
        join_all(prepares).await;

        let timer = tokio::time::sleep(self.config.phase1_timeout);
        tokio::pin!(timer);
        let mut expired = false;

        loop {
            let Some(txn) = self.txns.get(id) else {
                return Ok(false);
            };
            if txn.decision.is_some() {
                return Ok(true);
            }
            if let Some((decision, reason)) = phase_one_verdict(&txn, expired) {
                if reason == Some(AbortReason::Timeout) {
                    let missing: Vec<&NodeId> = txn
                        .votes
                        .iter()
                        .filter(|(_, v)| **v == VoteState::Pending)
                        .map(|(p, _)| p)
                        .collect();
                    tracing::warn!(
                        "{} phase 1 deadline passed for {}; no vote from {:?}",
                        self.role,
                        id,
                        missing
                    );
                }
                self.decide(id, decision, reason)?;
                return Ok(true);
            }

            tokio::select! {
                _ = wake.notified() => {}
                _ = &mut timer, if !expired => expired = true,
                _ = self.shutdown.cancelled() => return Ok(false),
            }
        }
    }

    /// Log a decision. Returns false if the same decision already existed.
    fn decide(&self, id: TxnId, decision: Decision, reason: Option<AbortReason>) -> Result<bool> {
        let _guard = self.decisions.lock();
        let txn = self.txns.get(id).ok_or(Error::UnknownTransaction(id))?;

        if let Some(existing) = txn.decision {
            if existing == decision {
                return Ok(false);
            }
            return Err(Error::AlreadyDecided {
                txn: id,
                decision: existing,
            });
        }

        let mut next = txn.state;
        if decision == Decision::Commit {
            next = transition(next, TxnEvent::AllVotedCommit)?;
        }
        next = transition(next, TxnEvent::Decide(decision))?;
        let reason = match decision {
            Decision::Commit => None,
            Decision::Abort => reason.or(Some(AbortReason::Administrative)),
        };

        let sequence = self.logged(self.wal.append(
            id,
            TxnTransition::Decision {
                decision,
                votes: txn.votes.clone(),
                reason,
            },
        ))?;

        self.txns.with_mut(id, |t| {
            t.state = next;
            t.decision = Some(decision);
            t.decision_sequence = Some(sequence);
            t.reason = reason;
        });

        match (decision, reason) {
            (Decision::Commit, _) => Metrics::incr(&self.metrics.txns_committed),
            (Decision::Abort, Some(reason)) => self.metrics.record_abort(reason),
            (Decision::Abort, None) => {}
        }
        tracing::info!(
            "{} decided {} for {} (sequence {}, reason {:?})",
            self.role,
            decision,
            id,
            sequence,
            reason
        );
        Ok(true)
    }

    /// Wait for durability, then send the decision until every
    /// participant acknowledged
    async fn deliver(&self, id: TxnId) {
        let Some(txn) = self.txns.get(id) else {
            return;
        };
        let (Some(decision), Some(sequence)) = (txn.decision, txn.decision_sequence) else {
            return;
        };
        let Some(wake) = self.txns.notifier(id) else {
            return;
        };

        if !txn.decision_durable && !self.await_durable(id, sequence).await {
            return;
        }

        let phase2 = Instant::now() + self.config.phase2_timeout;
        let phase2_ms = now_ms() + self.config.phase2_timeout.as_millis() as u64;
        self.txns.with_mut(id, |t| t.phase2_deadline_ms = Some(phase2_ms));

        let retry = &self.config.redelivery;
        let mut attempt: u32 = 0;
        let mut reported = false;

        loop {
            if !self.is_serving() {
                return;
            }
            let Some(txn) = self.txns.get(id) else {
                return;
            };
            if txn.retired {
                return;
            }
            // Retried until acknowledged; the phase-2 deadline only reports
            let pending = txn.unacknowledged();

            if attempt > 0 {
                self.metrics
                    .decisions_redelivered
                    .fetch_add(pending.len() as u64, std::sync::atomic::Ordering::Relaxed);
                tracing::debug!(
                    "{} redelivering {} for {} to {:?} (attempt {})",
                    self.role,
                    decision,
                    id,
                    pending,
                    attempt + 1
                );
            }
            self.send_decision(id, decision, &pending).await;

            let retry_at = Instant::now() + retry.delay_for(attempt);
            attempt = attempt.saturating_add(1);

            loop {
                if self.txns.get(id).is_none_or(|t| t.retired) {
                    return;
                }
                let now = Instant::now();
                if !reported && now >= phase2 {
                    self.report_unresponsive(id);
                    reported = true;
                }
                if now >= retry_at {
                    break;
                }
                let next = if reported {
                    retry_at
                } else {
                    retry_at.min(phase2)
                };
                tokio::select! {
                    _ = wake.notified() => {}
                    _ = tokio::time::sleep_until(next) => {}
                    _ = self.shutdown.cancelled() => return,
                }
            }
        }
    }

    /// Block until the decision record satisfies the replication policy.
    ///
    /// The transaction stays in progress while the wait keeps failing.
    async fn await_durable(&self, id: TxnId, sequence: u64) -> bool {
        let mut attempt: u32 = 0;
        loop {
            if !self.is_serving() {
                return false;
            }
            match self.durability.wait_durable(&self.role, sequence).await {
                Ok(()) => {
                    self.txns.with_mut(id, |t| t.decision_durable = true);
                    return true;
                }
                Err(e) => {
                    Metrics::incr(&self.metrics.quorum_waits_timed_out);
                    tracing::warn!(
                        "{} decision for {} not durable yet, holding delivery: {}",
                        self.role,
                        id,
                        e
                    );
                }
            }
            let delay = self.config.redelivery.delay_for(attempt);
            attempt = attempt.saturating_add(1);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.cancelled() => return false,
            }
        }
    }

    /// Phase-2 deadline passed: the outcome is final for callers and the
    /// stragglers go to the failover controller
    fn report_unresponsive(&self, id: TxnId) {
        let Some(pending) = self.txns.with_mut(id, |t| {
            if let Ok(next) = transition(t.state, TxnEvent::Complete) {
                t.state = next;
            }
            t.unacknowledged()
        }) else {
            return;
        };

        for participant in pending {
            Metrics::incr(&self.metrics.participants_unresponsive);
            tracing::warn!(
                "{} has no acknowledgment from {} for {} after {:?}",
                self.role,
                participant,
                id,
                self.config.phase2_timeout
            );
            let _ = self
                .events
                .send(CoordinatorEvent::ParticipantUnresponsive { txn: id, participant });
        }
    }

    async fn send_decision(&self, id: TxnId, decision: Decision, targets: &[NodeId]) {
        let sends = targets.iter().map(|p| {
            self.send(Envelope::new(
                self.role.clone(),
                p.clone(),
                ProtocolMessage::decision(id, decision),
            ))
        });
        join_all(sends).await;
    }

    async fn send(&self, envelope: Envelope) -> bool {
        let kind = envelope.message.message_type();
        let to = envelope.to.clone();
        match self.transport.send(envelope).await {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!("{} could not send {:?} to {}: {}", self.role, kind, to, e);
                false
            }
        }
    }

    /// Record a participant's vote
    pub fn vote(&self, id: TxnId, participant: &NodeId, vote: Vote) -> Result<()> {
        let recorded = self
            .txns
            .with_mut(id, |t| {
                if !t.is_participant(participant) {
                    return Err(Error::transaction(format!(
                        "{} is not a participant of {}",
                        participant, id
                    )));
                }
                if t.decision.is_some() {
                    return Ok(false);
                }
                match t.votes.get(participant) {
                    Some(VoteState::Pending) | None => {
                        t.votes.insert(participant.clone(), vote.into());
                        Ok(true)
                    }
                    Some(VoteState::Commit | VoteState::Abort) => Ok(false),
                }
            })
            .ok_or(Error::UnknownTransaction(id))??;

        if recorded {
            tracing::debug!("{} got {:?} from {} for {}", self.role, vote, participant, id);
            self.txns.wake(id);
        } else {
            Metrics::incr(&self.metrics.duplicate_messages);
            tracing::debug!(
                "{} ignoring late or duplicate vote from {} for {}",
                self.role,
                participant,
                id
            );
        }
        Ok(())
    }

    /// Record a participant's acknowledgment of the decision
    pub fn acknowledge(&self, id: TxnId, participant: &NodeId, decision: Decision) -> Result<()> {
        let txn = self.txns.get(id).ok_or(Error::UnknownTransaction(id))?;
        if txn.decision != Some(decision) {
            return Err(Error::conflicting(format!(
                "{} acknowledged {} for {} but the decision is {:?}",
                participant, decision, id, txn.decision
            )));
        }
        if !txn.is_participant(participant) {
            return Err(Error::transaction(format!(
                "{} is not a participant of {}",
                participant, id
            )));
        }
        if txn.acks.contains(participant) {
            Metrics::incr(&self.metrics.duplicate_messages);
            return Ok(());
        }

        self.logged(self.wal.append(
            id,
            TxnTransition::Acknowledged {
                participant: participant.clone(),
            },
        ))?;
        let all_acked = self
            .txns
            .with_mut(id, |t| {
                t.acks.insert(participant.clone()) && t.unacknowledged().is_empty()
            })
            .unwrap_or(false);
        tracing::debug!("{} acknowledged {} for {}", participant, decision, id);

        if all_acked {
            self.logged(self.wal.append(id, TxnTransition::Completed { decision }))?;
            self.txns.with_mut(id, |t| {
                if let Ok(next) = transition(t.state, TxnEvent::Complete) {
                    t.state = next;
                }
                t.retired = true;
            });
            tracing::info!("{} completed {} ({})", self.role, id, decision);
        }
        self.txns.wake(id);
        Ok(())
    }

    /// Administrative abort; refused once COMMIT was decided
    pub fn abort(&self, id: TxnId) -> Result<()> {
        let txn = self.txns.get(id).ok_or(Error::UnknownTransaction(id))?;
        match txn.decision {
            Some(Decision::Commit) => Err(Error::AlreadyDecided {
                txn: id,
                decision: Decision::Commit,
            }),
            Some(Decision::Abort) => Ok(()),
            None => {
                self.txns.with_mut(id, |t| t.abort_requested = true);
                self.decide(id, Decision::Abort, Some(AbortReason::Administrative))?;
                self.txns.wake(id);
                Ok(())
            }
        }
    }

    pub fn get_status(&self, id: TxnId) -> Option<TxnState> {
        self.txns.get(id).map(|t| t.state)
    }

    pub fn status(&self, id: TxnId) -> Option<TxnStatus> {
        self.txns.get(id).map(|t| t.status())
    }

    /// Wait up to `timeout` for a terminal state.
    ///
    /// Returns `Outcome::InProgress` when the wait expires first.
    pub async fn wait_for_outcome(&self, id: TxnId, timeout: Duration) -> Result<Outcome> {
        let mut rx = self
            .txns
            .watch_state(id)
            .ok_or(Error::UnknownTransaction(id))?;
        let terminal = async {
            loop {
                if rx.borrow_and_update().is_terminal() {
                    break;
                }
                if rx.changed().await.is_err() {
                    break;
                }
            }
        };
        let _ = tokio::time::timeout(timeout, terminal).await;
        self.txns
            .get(id)
            .map(|t| t.outcome())
            .ok_or(Error::UnknownTransaction(id))
    }

    /// Send the decision again to every unacknowledged participant
    pub async fn redeliver(&self) -> usize {
        let mut sent = 0;
        for id in self.txns.pending_delivery() {
            let Some(txn) = self.txns.get(id) else {
                continue;
            };
            let Some(decision) = txn.decision else {
                continue;
            };
            let pending = txn.unacknowledged();
            if pending.is_empty() {
                continue;
            }
            sent += pending.len();
            self.metrics
                .decisions_redelivered
                .fetch_add(pending.len() as u64, std::sync::atomic::Ordering::Relaxed);
            self.send_decision(id, decision, &pending).await;
        }
        if sent > 0 {
            tracing::info!("{} redelivered {} decisions", self.role, sent);
        }
        sent
    }

    /// Handle one protocol message, returning the reply if any
    pub fn handle(&self, envelope: &Envelope) -> Option<Envelope> {
        if !self.is_serving() {
            return None;
        }

        match &envelope.message {
            ProtocolMessage::Vote { txn, vote } => {
                if let Err(e) = self.vote(*txn, &envelope.from, *vote) {
                    tracing::debug!("{} rejected vote for {}: {}", self.role, txn, e);
                }
                None
            }
            ProtocolMessage::Ack { txn, decision } => {
                if let Err(e) = self.acknowledge(*txn, &envelope.from, *decision) {
                    tracing::warn!("{} rejected ack for {}: {}", self.role, txn, e);
                }
                None
            }
            ProtocolMessage::StatusQuery { txn } => {
                let decision = match self.txns.get(*txn) {
                    // Presumed abort
                    None => Some(Decision::Abort),
                    Some(t) if t.decision_durable => t.decision,
                    Some(_) => None,
                };
                tracing::debug!(
                    "{} answering status of {} to {}: {:?}",
                    self.role,
                    txn,
                    envelope.from,
                    decision
                );
                Some(envelope.reply(ProtocolMessage::StatusReply {
                    txn: *txn,
                    decision,
                }))
            }
            ProtocolMessage::Ping { seq } => {
                Some(envelope.reply(ProtocolMessage::Pong { seq: *seq }))
            }
            ProtocolMessage::Prepare { .. }
            | ProtocolMessage::Commit { .. }
            | ProtocolMessage::Abort { .. }
            | ProtocolMessage::StatusReply { .. }
            | ProtocolMessage::Pong { .. } => {
                tracing::debug!(
                    "{} ignoring {:?} from {}",
                    self.role,
                    envelope.message.message_type(),
                    envelope.from
                );
                None
            }
        }
    }

    /// Rebuild transactions from the log and resume them
    pub fn recover(self: &Arc<Self>) -> Result<RecoveryReport> {
        let records = self.wal.replay(0)?;
        let replayed = recovery::replay(&records);
        let mut report = RecoveryReport::default();

        for (id, entry) in replayed {
            if self.txns.contains(id) {
                continue;
            }
            let action = entry.action();
            let mut txn = entry.txn;
            match action {
                RecoveryAction::Retired => {
                    txn.decision_durable = true;
                    self.txns.insert(txn);
                    report.retired += 1;
                }
                RecoveryAction::ResumeDelivery { decision, sequence } => {
                    tracing::info!(
                        "{} resuming delivery of {} for {} (sequence {})",
                        self.role,
                        decision,
                        id,
                        sequence
                    );
                    self.txns.insert(txn);
                    self.spawn_delivery(id);
                    report.resumed.push(id);
                }
                RecoveryAction::Abort => {
                    tracing::warn!(
                        "{} aborting {} left undecided in state {}",
                        self.role,
                        id,
                        txn.state
                    );
                    self.txns.insert(txn);
                    self.decide(id, Decision::Abort, Some(AbortReason::Recovery))?;
                    self.spawn_delivery(id);
                    report.aborted.push(id);
                }
            }
        }

        tracing::info!(
            "{} recovered: {} resumed, {} aborted, {} retired",
            self.role,
            report.resumed.len(),
            report.aborted.len(),
            report.retired
        );
        Ok(report)
    }

    fn spawn_delivery(self: &Arc<Self>, id: TxnId) {
        let driver = self.clone();
        tokio::spawn(async move { driver.deliver(id).await });
    }

    /// Compact the log and forget retired transactions it no longer holds
    pub fn compact(&self) -> Result<usize> {
        let removed = self.logged(self.wal.compact(self.wal.durable_sequence() + 1))?;
        if removed > 0 {
            let live: HashSet<TxnId> = self.wal.replay(0)?.into_iter().map(|r| r.txn).collect();
            for id in self.txns.ids() {
                if !live.contains(&id) && self.txns.get(id).is_some_and(|t| t.retired) {
                    self.txns.remove(id);
                }
            }
        }
        Ok(removed)
    }
}

/// Decision implied by the votes so far, if any
fn phase_one_verdict(txn: &Transaction, expired: bool) -> Option<(Decision, Option<AbortReason>)> {
    if txn.abort_requested {
        return Some((Decision::Abort, Some(AbortReason::Administrative)));
    }
    if txn.votes.values().any(|v| *v == VoteState::Abort) {
        return Some((Decision::Abort, Some(AbortReason::ParticipantVote)));
    }
    if txn.votes.values().all(|v| *v == VoteState::Commit) {
        return Some((Decision::Commit, None));
    }
    if expired {
        return Some((Decision::Abort, Some(AbortReason::Timeout)));
    }
    None
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("role", &self.role)
            .field("transactions", &self.txns.len())
            .field("serving", &self.is_serving())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{LocalNetwork, RoutingTable};
    use concord_protocol::MessageType;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    struct Fixture {
        coordinator: Arc<Coordinator>,
        network: Arc<LocalNetwork>,
        metrics: Arc<Metrics>,
    }

    fn config() -> CoordinatorConfig {
        CoordinatorConfig::default()
            .with_timeouts(Duration::from_millis(500), Duration::from_millis(500))
    }

    fn fixture(wal: Arc<Wal>) -> Fixture {
        let network = Arc::new(LocalNetwork::new(Arc::new(RoutingTable::new())));
        let metrics = Arc::new(Metrics::new());
        let coordinator = Arc::new(Coordinator::new(
            "coordinator".into(),
            config(),
            wal,
            network.clone(),
            Arc::new(LocalDurability),
            metrics.clone(),
            &CancellationToken::new(),
        ));
        Fixture {
            coordinator,
            network,
            metrics,
        }
    }

    async fn expect(rx: &mut mpsc::UnboundedReceiver<Envelope>, kind: MessageType) -> Envelope {
        loop {
            let envelope = rx.recv().await.unwrap();
            if envelope.message.message_type() == kind {
                return envelope;
            }
        }
    }

    /// Answer every PREPARE with `vote` and acknowledge every decision
    fn auto_participant(
        f: &Fixture,
        name: &str,
        vote: Vote,
    ) -> tokio::task::JoinHandle<()> {
        let mut rx = f.network.connect(name.into());
        let coordinator = f.coordinator.clone();
        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                let reply = match envelope.message {
                    ProtocolMessage::Prepare { txn, .. } => ProtocolMessage::Vote { txn, vote },
                    ProtocolMessage::Commit { txn } => ProtocolMessage::Ack {
                        txn,
                        decision: Decision::Commit,
                    },
                    ProtocolMessage::Abort { txn } => ProtocolMessage::Ack {
                        txn,
                        decision: Decision::Abort,
                    },
                    _ => continue,
                };
                coordinator.handle(&envelope.reply(reply));
            }
        })
    }

    #[tokio::test]
    async fn test_all_commit_votes_commit() {
        let f = fixture(Arc::new(Wal::in_memory("coordinator")));
        auto_participant(&f, "a", Vote::Commit);
        auto_participant(&f, "b", Vote::Commit);

        let id = f.coordinator.begin(vec!["a".into(), "b".into()]).unwrap();
        let outcome = f
            .coordinator
            .wait_for_outcome(id, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Committed);

        let status = f.coordinator.status(id).unwrap();
        assert!(status.unacknowledged.is_empty());
        assert!(f.coordinator.store().get(id).unwrap().retired);
        assert_eq!(f.metrics.snapshot().txns_committed, 1);
    }

    #[tokio::test]
    async fn test_one_abort_vote_aborts() {
        let f = fixture(Arc::new(Wal::in_memory("coordinator")));
        auto_participant(&f, "a", Vote::Commit);
        auto_participant(&f, "b", Vote::Abort);
        auto_participant(&f, "c", Vote::Commit);

        let id = f
            .coordinator
            .begin(vec!["a".into(), "b".into(), "c".into()])
            .unwrap();
        let outcome = f
            .coordinator
            .wait_for_outcome(id, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Aborted(AbortReason::ParticipantVote));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_vote_times_out() {
        let f = fixture(Arc::new(Wal::in_memory("coordinator")));
        auto_participant(&f, "a", Vote::Commit);
        let mut silent = f.network.connect("b".into());

        let id = f.coordinator.begin(vec!["a".into(), "b".into()]).unwrap();
        expect(&mut silent, MessageType::Prepare).await;

        let abort = expect(&mut silent, MessageType::Abort).await;
        assert_eq!(abort.message, ProtocolMessage::Abort { txn: id });
        assert_eq!(
            f.coordinator.store().get(id).unwrap().reason,
            Some(AbortReason::Timeout)
        );
    }

    #[tokio::test]
    async fn test_duplicate_participants_collapse() {
        let f = fixture(Arc::new(Wal::in_memory("coordinator")));
        let _a = f.network.connect("a".into());
        let id = f.coordinator.begin(vec!["a".into(), "a".into()]).unwrap();
        assert_eq!(f.coordinator.store().get(id).unwrap().participants.len(), 1);
        assert!(f.coordinator.begin(Vec::new()).is_err());
    }

    #[tokio::test]
    async fn test_decision_logged_before_sent() {
        let f = fixture(Arc::new(Wal::in_memory("coordinator")));
        let mut rx = f.network.connect("a".into());
        let id = f.coordinator.begin(vec!["a".into()]).unwrap();

        expect(&mut rx, MessageType::Prepare).await;
        f.coordinator.vote(id, &"a".into(), Vote::Commit).unwrap();
        expect(&mut rx, MessageType::Commit).await;

        let records = f.coordinator.wal().replay(0).unwrap();
        assert!(records.iter().any(|r| matches!(
            r.transition,
            TxnTransition::Decision {
                decision: Decision::Commit,
                ..
            }
        )));
    }

    #[tokio::test]
    async fn test_abort_after_commit_is_refused() {
        let f = fixture(Arc::new(Wal::in_memory("coordinator")));
        let mut rx = f.network.connect("a".into());
        let id = f.coordinator.begin(vec!["a".into()]).unwrap();
        expect(&mut rx, MessageType::Prepare).await;
        f.coordinator.vote(id, &"a".into(), Vote::Commit).unwrap();
        expect(&mut rx, MessageType::Commit).await;

        assert!(matches!(
            f.coordinator.abort(id),
            Err(Error::AlreadyDecided {
                decision: Decision::Commit,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_administrative_abort() {
        let f = fixture(Arc::new(Wal::in_memory("coordinator")));
        let mut rx = f.network.connect("a".into());
        let id = f.coordinator.begin(vec!["a".into()]).unwrap();
        expect(&mut rx, MessageType::Prepare).await;

        f.coordinator.abort(id).unwrap();
        expect(&mut rx, MessageType::Abort).await;
        // A vote arriving afterwards changes nothing
        f.coordinator.vote(id, &"a".into(), Vote::Commit).unwrap();
        assert_eq!(
            f.coordinator.store().get(id).unwrap().decision,
            Some(Decision::Abort)
        );
    }

    #[tokio::test]
    async fn test_vote_from_stranger_rejected() {
        let f = fixture(Arc::new(Wal::in_memory("coordinator")));
        let _rx = f.network.connect("a".into());
        let id = f.coordinator.begin(vec!["a".into()]).unwrap();
        assert!(f.coordinator.vote(id, &"z".into(), Vote::Commit).is_err());
        assert!(matches!(
            f.coordinator.vote(TxnId::new(0, 999), &"a".into(), Vote::Commit),
            Err(Error::UnknownTransaction(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacknowledged_participant_reported() {
        let f = fixture(Arc::new(Wal::in_memory("coordinator")));
        let mut events = f.coordinator.subscribe();
        let mut rx = f.network.connect("a".into());
        let id = f.coordinator.begin(vec!["a".into()]).unwrap();
        expect(&mut rx, MessageType::Prepare).await;
        f.coordinator.vote(id, &"a".into(), Vote::Commit).unwrap();

        let event = events.recv().await.unwrap();
        assert_eq!(
            event,
            CoordinatorEvent::ParticipantUnresponsive {
                txn: id,
                participant: "a".into()
            }
        );
        // Terminal for callers, still retried
        assert_eq!(f.coordinator.get_status(id), Some(TxnState::Committed));
        assert!(!f.coordinator.store().get(id).unwrap().retired);
        expect(&mut rx, MessageType::Commit).await;
        expect(&mut rx, MessageType::Commit).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_redelivery_budget_still_reports() {
        let network = Arc::new(LocalNetwork::new(Arc::new(RoutingTable::new())));
        let mut config = config();
        config.redelivery.max_attempts = 2;
        config.redelivery.initial_delay = Duration::from_millis(10);
        let coordinator = Arc::new(Coordinator::new(
            "coordinator".into(),
            config,
            Arc::new(Wal::in_memory("coordinator")),
            network.clone(),
            Arc::new(LocalDurability),
            Arc::new(Metrics::new()),
            &CancellationToken::new(),
        ));
        let mut events = coordinator.subscribe();
        let mut rx = network.connect("a".into());
        let id = coordinator.begin(vec!["a".into()]).unwrap();
        expect(&mut rx, MessageType::Prepare).await;
        coordinator.vote(id, &"a".into(), Vote::Commit).unwrap();

        // More sends than the budget before the deadline passes
        for _ in 0..3 {
            expect(&mut rx, MessageType::Commit).await;
        }
        assert_eq!(
            events.recv().await.unwrap(),
            CoordinatorEvent::ParticipantUnresponsive {
                txn: id,
                participant: "a".into()
            }
        );
        assert_eq!(coordinator.get_status(id), Some(TxnState::Committed));
        expect(&mut rx, MessageType::Commit).await;
    }

    #[tokio::test]
    async fn test_status_query_presumes_abort() {
        let f = fixture(Arc::new(Wal::in_memory("coordinator")));
        let query = Envelope::new(
            "a".into(),
            "coordinator".into(),
            ProtocolMessage::StatusQuery {
                txn: TxnId::new(0, 42),
            },
        );
        let reply = f.coordinator.handle(&query).unwrap();
        assert_eq!(
            reply.message,
            ProtocolMessage::StatusReply {
                txn: TxnId::new(0, 42),
                decision: Some(Decision::Abort)
            }
        );
    }

    #[tokio::test]
    async fn test_status_query_in_phase_one_is_undecided() {
        let f = fixture(Arc::new(Wal::in_memory("coordinator")));
        let _rx = f.network.connect("a".into());
        let id = f.coordinator.begin(vec!["a".into()]).unwrap();
        let query = Envelope::new(
            "a".into(),
            "coordinator".into(),
            ProtocolMessage::StatusQuery { txn: id },
        );
        let reply = f.coordinator.handle(&query).unwrap();
        assert_eq!(
            reply.message,
            ProtocolMessage::StatusReply {
                txn: id,
                decision: None
            }
        );
    }

    #[tokio::test]
    async fn test_recover_aborts_undecided_and_resumes_decided() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("coordinator.wal");

        let (undecided, decided) = {
            let wal = Arc::new(Wal::open(&path, Default::default()).unwrap());
            let undecided = TxnId::new(0, 1);
            wal.append(
                undecided,
                TxnTransition::Begin {
                    participants: vec!["a".into()],
                    payloads: BTreeMap::new(),
                },
            )
            .unwrap();
            wal.append(undecided, TxnTransition::Preparing).unwrap();

            let decided = TxnId::new(0, 3);
            wal.append(
                decided,
                TxnTransition::Begin {
                    participants: vec!["a".into()],
                    payloads: BTreeMap::new(),
                },
            )
            .unwrap();
            wal.append(
                decided,
                TxnTransition::Decision {
                    decision: Decision::Commit,
                    votes: BTreeMap::new(),
                    reason: None,
                },
            )
            .unwrap();
            (undecided, decided)
        };

        let f = fixture(Arc::new(Wal::open(&path, Default::default()).unwrap()));
        let mut rx = f.network.connect("a".into());
        let report = f.coordinator.recover().unwrap();
        assert_eq!(report.aborted, vec![undecided]);
        assert_eq!(report.resumed, vec![decided]);

        let mut seen = Vec::new();
        while seen.len() < 2 {
            let envelope = rx.recv().await.unwrap();
            seen.push(envelope.message);
        }
        assert!(seen.contains(&ProtocolMessage::Abort { txn: undecided }));
        assert!(seen.contains(&ProtocolMessage::Commit { txn: decided }));
        assert_eq!(
            f.coordinator.store().get(undecided).unwrap().reason,
            Some(AbortReason::Recovery)
        );
    }

    #[tokio::test]
    async fn test_fenced_coordinator_refuses_begin() {
        let dir = TempDir::new().unwrap();
        let wal = Arc::new(Wal::open(dir.path().join("c.wal"), Default::default()).unwrap());
        let f = fixture(wal.clone());
        let mut events = f.coordinator.subscribe();

        wal.fail_next_append();
        assert!(f.coordinator.begin(vec!["a".into()]).is_err());
        assert!(!f.coordinator.is_serving());
        assert_eq!(
            events.recv().await.unwrap(),
            CoordinatorEvent::Fenced {
                role: "coordinator".into()
            }
        );
        assert!(matches!(
            f.coordinator.begin(vec!["a".into()]),
            Err(Error::WalFenced(_))
        ));
    }

    #[tokio::test]
    async fn test_compact_forgets_retired() {
        let f = fixture(Arc::new(Wal::in_memory("coordinator")));
        auto_participant(&f, "a", Vote::Commit);
        let id = f.coordinator.begin(vec!["a".into()]).unwrap();
        f.coordinator
            .wait_for_outcome(id, Duration::from_secs(5))
            .await
            .unwrap();

        assert!(f.coordinator.compact().unwrap() > 0);
        assert!(f.coordinator.status(id).is_none());
        assert!(f.coordinator.wal().is_empty());
    }
}
