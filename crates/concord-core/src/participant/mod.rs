//! Participant agent
//!
//! Votes on and executes one branch of each transaction. Every vote and
//! every applied decision is logged before it is answered, and the agent
//! rebuilds its view from its log after a restart or promotion:
//!
//! - voted COMMIT but undecided: locks are re-acquired and the agent asks
//!   the coordinator, aborting unilaterally only after the decision timeout
//! - committed: effects are re-applied to the (idempotent) store

pub mod locks;
pub mod state;
pub mod store;

pub use locks::{LockConflict, LockStats, LockTable};
pub use state::{DecisionAction, LocalState, LocalTxn, PrepareAction};
pub use store::{MemoryStore, ResourceStore};

use crate::config::ParticipantConfig;
use crate::metrics::Metrics;
use crate::transport::Transport;
use crate::wal::{TxnTransition, Wal};
use crate::{Error, Result, now_ms};
use concord_protocol::{Decision, Envelope, NodeId, Payload, ProtocolMessage, TxnId, Vote};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Outcome of replaying a participant log
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParticipantRecovery {
    pub in_doubt: Vec<TxnId>,
    pub committed: usize,
    pub aborted: usize,
}

/// One participant role
pub struct ParticipantAgent {
    id: NodeId,
    coordinator: NodeId,
    config: ParticipantConfig,
    wal: Arc<Wal>,
    store: Arc<dyn ResourceStore>,
    locks: LockTable,
    txns: Mutex<HashMap<TxnId, LocalTxn>>,
    transport: Arc<dyn Transport>,
    metrics: Arc<Metrics>,
}

impl ParticipantAgent {
    /// `coordinator` is the role PREPAREs are expected from when the
    /// caller does not say otherwise
    pub fn new(
        id: NodeId,
        coordinator: NodeId,
        config: ParticipantConfig,
        wal: Arc<Wal>,
        store: Arc<dyn ResourceStore>,
        transport: Arc<dyn Transport>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            id,
            coordinator,
            config,
            wal,
            store,
            locks: LockTable::new(),
            txns: Mutex::new(HashMap::new()),
            transport,
            metrics,
        }
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn wal(&self) -> &Arc<Wal> {
        &self.wal
    }

    pub fn locks(&self) -> &LockTable {
        &self.locks
    }

    pub fn store(&self) -> &Arc<dyn ResourceStore> {
        &self.store
    }

    /// False once the log was fenced; the agent then answers nothing
    pub fn is_serving(&self) -> bool {
        !self.wal.is_fenced()
    }

    pub fn state_of(&self, txn: TxnId) -> Option<LocalState> {
        self.txns.lock().get(&txn).map(|t| t.state)
    }

    /// Vote on a branch sent by the default coordinator
    pub fn prepare(&self, txn: TxnId, payload: Payload) -> Result<Vote> {
        let coordinator = self.coordinator.clone();
        self.prepare_from(txn, coordinator, payload, None)
    }

    /// Validate, lock, log the vote, then return it.
    ///
    /// `deadline_ms` is the coordinator's phase-1 deadline; without one the
    /// decision timeout runs from the vote.
    pub fn prepare_from(
        &self,
        txn: TxnId,
        coordinator: NodeId,
        payload: Payload,
        deadline_ms: Option<u64>,
    ) -> Result<Vote> {
        let mut txns = self.txns.lock();

        match state::on_prepare(txns.get(&txn).map(|t| t.state)) {
            PrepareAction::Repeat(vote) => {
                tracing::debug!("{} repeating vote {:?} for {}", self.id, vote, txn);
                Metrics::incr(&self.metrics.duplicate_messages);
                return Ok(vote);
            }
            PrepareAction::Evaluate => {}
        }

        let verdict = self.evaluate(txn, &payload);
        let vote = if verdict.is_ok() { Vote::Commit } else { Vote::Abort };
        let operations = match vote {
            Vote::Commit => payload,
            Vote::Abort => Vec::new(),
        };

        let logged = self.wal.append(
            txn,
            TxnTransition::Voted {
                vote,
                operations: operations.clone(),
                coordinator: coordinator.clone(),
                deadline_ms,
            },
        );
        if let Err(e) = logged {
            self.locks.release(txn);
            return Err(e);
        }

        let state = match vote {
            Vote::Commit => {
                Metrics::incr(&self.metrics.votes_commit);
                tracing::info!("{} voted COMMIT for {}", self.id, txn);
                LocalState::VotedCommit
            }
            Vote::Abort => {
                Metrics::incr(&self.metrics.votes_abort);
                tracing::info!(
                    "{} voted ABORT for {}: {}",
                    self.id,
                    txn,
                    verdict.err().unwrap_or_default()
                );
                LocalState::VotedAbort
            }
        };

        let voted_at_ms = now_ms();
        txns.insert(
            txn,
            LocalTxn {
                state,
                operations,
                coordinator,
                voted_at_ms,
                decide_by_ms: deadline_ms.unwrap_or(voted_at_ms),
            },
        );
        Ok(vote)
    }

    fn evaluate(&self, txn: TxnId, payload: &Payload) -> std::result::Result<(), String> {
        for op in payload {
            self.store.validate(op)?;
        }
        self.locks
            .try_acquire_all(txn, payload.iter().map(|op| op.key.as_str()))
            .map(|_| ())
            .map_err(|c| format!("{} is locked by {}", c.key, c.holder))
    }

    /// Apply a COMMIT decision
    pub fn commit(&self, txn: TxnId) -> Result<()> {
        self.decide(txn, Decision::Commit)
    }

    /// Apply an ABORT decision
    pub fn abort(&self, txn: TxnId) -> Result<()> {
        self.decide(txn, Decision::Abort)
    }

    fn decide(&self, txn: TxnId, decision: Decision) -> Result<()> {
        let mut txns = self.txns.lock();
        let current = txns.get(&txn).map(|t| t.state);

        match state::on_decision(current, decision) {
            DecisionAction::Apply => {
                let operations = txns
                    .get(&txn)
                    .map(|t| t.operations.clone())
                    .unwrap_or_default();
                self.store.apply(txn, &operations)?;
                let released = self.locks.release(txn);
                self.wal.append(txn, TxnTransition::Applied { decision })?;
                if let Some(t) = txns.get_mut(&txn) {
                    t.state = LocalState::Committed;
                }
                Metrics::incr(&self.metrics.branches_applied);
                tracing::info!("{} committed {} (released {} locks)", self.id, txn, released);
            }
            DecisionAction::Discard => {
                let released = self.locks.release(txn);
                self.wal.append(txn, TxnTransition::Applied { decision })?;
                if let Some(t) = txns.get_mut(&txn) {
                    t.state = LocalState::Aborted;
                }
                Metrics::incr(&self.metrics.branches_discarded);
                tracing::info!("{} aborted {} (released {} locks)", self.id, txn, released);
            }
            DecisionAction::Duplicate => {
                Metrics::incr(&self.metrics.duplicate_messages);
                tracing::debug!("{} ignoring duplicate {} for {}", self.id, decision, txn);
            }
            DecisionAction::RecordAbort => {
                self.wal.append(txn, TxnTransition::Applied { decision })?;
                txns.insert(
                    txn,
                    LocalTxn {
                        state: LocalState::Aborted,
                        operations: Vec::new(),
                        coordinator: self.coordinator.clone(),
                        voted_at_ms: now_ms(),
                        decide_by_ms: 0,
                    },
                );
                tracing::info!("{} recorded ABORT for unprepared {}", self.id, txn);
            }
            DecisionAction::AssumeApplied => {
                Metrics::incr(&self.metrics.duplicate_messages);
                tracing::warn!(
                    "{} got COMMIT for {} which is no longer in its log; assuming applied",
                    self.id,
                    txn
                );
            }
            DecisionAction::Conflict => {
                tracing::error!(
                    "{} received {} for {} in state {:?}",
                    self.id,
                    decision,
                    txn,
                    current
                );
                return Err(Error::conflicting(format!(
                    "{} for {} contradicts local state {:?}",
                    decision, txn, current
                )));
            }
        }
        Ok(())
    }

    /// Rebuild local state from the log
    pub fn recover(&self) -> Result<ParticipantRecovery> {
        let records = self.wal.replay(0)?;
        let mut rebuilt: BTreeMap<TxnId, LocalTxn> = BTreeMap::new();

        for record in records {
            match record.transition {
                TxnTransition::Voted {
                    vote,
                    operations,
                    coordinator,
                    deadline_ms,
                } => {
                    let state = match vote {
                        Vote::Commit => LocalState::VotedCommit,
                        Vote::Abort => LocalState::VotedAbort,
                    };
                    rebuilt.insert(
                        record.txn,
                        LocalTxn {
                            state,
                            operations,
                            coordinator,
                            voted_at_ms: record.timestamp_ms,
                            decide_by_ms: deadline_ms.unwrap_or(record.timestamp_ms),
                        },
                    );
                }
                TxnTransition::Applied { decision } => {
                    let state = match decision {
                        Decision::Commit => LocalState::Committed,
                        Decision::Abort => LocalState::Aborted,
                    };
                    rebuilt
                        .entry(record.txn)
                        .and_modify(|t| t.state = state)
                        .or_insert_with(|| LocalTxn {
                            state,
                            operations: Vec::new(),
                            coordinator: self.coordinator.clone(),
                            voted_at_ms: record.timestamp_ms,
                            decide_by_ms: record.timestamp_ms,
                        });
                }
                other => {
                    tracing::warn!(
                        "{} skipping foreign record {:?} for {}",
                        self.id,
                        other,
                        record.txn
                    );
                }
            }
        }

        let mut report = ParticipantRecovery::default();
        for (txn, local) in &rebuilt {
            match local.state {
                LocalState::VotedCommit => {
                    self.locks
                        .force_acquire(*txn, local.operations.iter().map(|op| op.key.as_str()));
                    report.in_doubt.push(*txn);
                }
                LocalState::Committed => {
                    self.store.apply(*txn, &local.operations)?;
                    report.committed += 1;
                }
                LocalState::Aborted | LocalState::VotedAbort => report.aborted += 1,
            }
        }

        tracing::info!(
            "{} recovered: {} in doubt, {} committed, {} aborted",
            self.id,
            report.in_doubt.len(),
            report.committed,
            report.aborted
        );
        *self.txns.lock() = rebuilt.into_iter().collect();
        Ok(report)
    }

    /// Voted-COMMIT transactions still waiting for a decision
    pub fn in_doubt(&self) -> Vec<(TxnId, NodeId)> {
        let mut pending: Vec<(TxnId, NodeId)> = self
            .txns
            .lock()
            .iter()
            .filter(|(_, t)| t.state == LocalState::VotedCommit)
            .map(|(id, t)| (*id, t.coordinator.clone()))
            .collect();
        pending.sort();
        pending
    }

    /// Ask the coordinator for the decision of every in-doubt transaction
    pub async fn query_in_doubt(&self) -> usize {
        let pending = self.in_doubt();
        for (txn, coordinator) in &pending {
            let query = Envelope::new(
                self.id.clone(),
                coordinator.clone(),
                ProtocolMessage::StatusQuery { txn: *txn },
            );
            if let Err(e) = self.transport.send(query).await {
                tracing::debug!("{} status query for {} failed: {}", self.id, txn, e);
            }
        }
        pending.len()
    }

    /// Abort in-doubt transactions the coordinator left undecided for
    /// longer than the decision timeout past its phase-1 deadline
    pub fn expire_in_doubt(&self) -> Result<Vec<TxnId>> {
        self.expire_in_doubt_at(now_ms())
    }

    pub fn expire_in_doubt_at(&self, now_ms: u64) -> Result<Vec<TxnId>> {
        let timeout_ms = self.config.decision_timeout.as_millis() as u64;
        let expired: Vec<TxnId> = self
            .txns
            .lock()
            .iter()
            .filter(|(_, t)| {
                t.state == LocalState::VotedCommit && t.expires_at_ms(timeout_ms) <= now_ms
            })
            .map(|(id, _)| *id)
            .collect();

        for txn in &expired {
            tracing::warn!(
                "{} aborting {} unilaterally: no decision within {:?}",
                self.id,
                txn,
                self.config.decision_timeout
            );
            self.decide(*txn, Decision::Abort)?;
            Metrics::incr(&self.metrics.unilateral_aborts);
        }
        Ok(expired)
    }

    /// Periodically query and expire in-doubt transactions
    pub async fn run_in_doubt_resolver(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.resolve_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if !self.is_serving() {
                break;
            }
            if self.in_doubt().is_empty() {
                continue;
            }
            self.query_in_doubt().await;
            if let Err(e) = self.expire_in_doubt() {
                tracing::error!("{} in-doubt expiry failed: {}", self.id, e);
            }
        }
    }

    /// Drop log records of finished branches.
    ///
    /// Committed branches are only dropped when the store is durable; a
    /// volatile store is rebuilt from their records on restart.
    pub fn compact(&self) -> Result<usize> {
        let before = self.wal.durable_sequence() + 1;
        let removed = if self.store.is_durable() {
            self.wal.compact(before)?
        } else {
            self.wal.compact_retaining(before, |record| {
                matches!(
                    record.transition,
                    TxnTransition::Applied {
                        decision: Decision::Commit
                    }
                )
            })?
        };
        if removed > 0 {
            let live: HashSet<TxnId> = self.wal.replay(0)?.into_iter().map(|r| r.txn).collect();
            self.txns
                .lock()
                .retain(|id, t| !t.state.is_terminal() || live.contains(id));
        }
        Ok(removed)
    }

    /// Handle one protocol message, returning the reply if any
    pub fn handle(&self, envelope: &Envelope) -> Option<Envelope> {
        if !self.is_serving() {
            return None;
        }

        match &envelope.message {
            ProtocolMessage::Prepare {
                txn,
                payload,
                deadline_ms,
            } => {
                match self.prepare_from(
                    *txn,
                    envelope.from.clone(),
                    payload.clone(),
                    Some(*deadline_ms),
                ) {
                    Ok(vote) => Some(envelope.reply(ProtocolMessage::Vote { txn: *txn, vote })),
                    Err(e) => {
                        tracing::error!("{} failed to prepare {}: {}", self.id, txn, e);
                        None
                    }
                }
            }
            ProtocolMessage::Commit { txn } => self.answer_decision(envelope, *txn, Decision::Commit),
            ProtocolMessage::Abort { txn } => self.answer_decision(envelope, *txn, Decision::Abort),
            ProtocolMessage::StatusReply { txn, decision } => match decision {
                Some(decision) => self.answer_decision(envelope, *txn, *decision),
                None => {
                    tracing::debug!("{} still in doubt about {}", self.id, txn);
                    None
                }
            },
            ProtocolMessage::Ping { seq } => {
                Some(envelope.reply(ProtocolMessage::Pong { seq: *seq }))
            }
            ProtocolMessage::Vote { .. }
            | ProtocolMessage::Ack { .. }
            | ProtocolMessage::StatusQuery { .. }
            | ProtocolMessage::Pong { .. } => {
                tracing::debug!(
                    "{} ignoring {:?} from {}",
                    self.id,
                    envelope.message.message_type(),
                    envelope.from
                );
                None
            }
        }
    }

    fn answer_decision(&self, envelope: &Envelope, txn: TxnId, decision: Decision) -> Option<Envelope> {
        match self.decide(txn, decision) {
            Ok(()) => Some(envelope.reply(ProtocolMessage::Ack { txn, decision })),
            Err(e) => {
                tracing::error!("{} failed to apply {} for {}: {}", self.id, decision, txn, e);
                None
            }
        }
    }
}

impl std::fmt::Debug for ParticipantAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParticipantAgent")
            .field("id", &self.id)
            .field("coordinator", &self.coordinator)
            .field("transactions", &self.txns.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{LocalNetwork, RoutingTable};
    use concord_protocol::Operation;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        agent: ParticipantAgent,
        store: Arc<MemoryStore>,
        network: Arc<LocalNetwork>,
    }

    fn fixture(wal: Arc<Wal>) -> Fixture {
        let network = Arc::new(LocalNetwork::new(Arc::new(RoutingTable::new())));
        let store = Arc::new(MemoryStore::new());
        let agent = ParticipantAgent::new(
            "p1".into(),
            "coordinator".into(),
            ParticipantConfig::default().with_decision_timeout(Duration::from_secs(10)),
            wal,
            store.clone(),
            network.clone(),
            Arc::new(Metrics::new()),
        );
        Fixture {
            agent,
            store,
            network,
        }
    }

    fn txn(n: u64) -> TxnId {
        TxnId::new(0, n)
    }

    fn put(key: &str) -> Payload {
        vec![Operation::put(key, b"v".to_vec())]
    }

    #[test]
    fn test_prepare_commit() {
        let f = fixture(Arc::new(Wal::in_memory("p1")));
        assert_eq!(f.agent.prepare(txn(1), put("k")).unwrap(), Vote::Commit);
        assert_eq!(f.agent.locks().holder("k"), Some(txn(1)));

        f.agent.commit(txn(1)).unwrap();
        assert_eq!(f.store.get("k"), Some(b"v".to_vec()));
        assert_eq!(f.agent.locks().holder("k"), None);
        assert_eq!(f.agent.state_of(txn(1)), Some(LocalState::Committed));
    }

    #[test]
    fn test_double_commit_is_idempotent() {
        let f = fixture(Arc::new(Wal::in_memory("p1")));
        f.agent.prepare(txn(1), put("k")).unwrap();
        f.agent.commit(txn(1)).unwrap();
        let logged = f.agent.wal().len();

        f.agent.commit(txn(1)).unwrap();
        assert_eq!(f.store.applications(), 1);
        assert_eq!(f.agent.wal().len(), logged);
    }

    #[test]
    fn test_conflicting_prepare_votes_abort() {
        let f = fixture(Arc::new(Wal::in_memory("p1")));
        assert_eq!(f.agent.prepare(txn(1), put("k")).unwrap(), Vote::Commit);
        assert_eq!(f.agent.prepare(txn(2), put("k")).unwrap(), Vote::Abort);

        // The loser holds nothing and the winner keeps its lock
        assert_eq!(f.agent.locks().holder("k"), Some(txn(1)));
        assert!(f.agent.locks().held_by(txn(2)).is_empty());
    }

    #[test]
    fn test_failed_precondition_votes_abort() {
        let f = fixture(Arc::new(Wal::in_memory("p1")));
        let payload = vec![Operation::assert_eq("k", Some(b"x".to_vec()))];
        assert_eq!(f.agent.prepare(txn(1), payload).unwrap(), Vote::Abort);
        assert_eq!(f.agent.state_of(txn(1)), Some(LocalState::VotedAbort));
    }

    #[test]
    fn test_duplicate_prepare_repeats_vote() {
        let f = fixture(Arc::new(Wal::in_memory("p1")));
        f.agent.prepare(txn(1), put("k")).unwrap();
        assert_eq!(f.agent.prepare(txn(1), put("k")).unwrap(), Vote::Commit);
        assert_eq!(f.agent.wal().len(), 1);
    }

    #[test]
    fn test_abort_before_prepare() {
        let f = fixture(Arc::new(Wal::in_memory("p1")));
        f.agent.abort(txn(1)).unwrap();
        assert_eq!(f.agent.prepare(txn(1), put("k")).unwrap(), Vote::Abort);
        assert_eq!(f.agent.locks().holder("k"), None);
    }

    #[test]
    fn test_commit_after_abort_conflicts() {
        let f = fixture(Arc::new(Wal::in_memory("p1")));
        f.agent.prepare(txn(1), put("k")).unwrap();
        f.agent.abort(txn(1)).unwrap();
        assert!(matches!(
            f.agent.commit(txn(1)),
            Err(Error::ConflictingDecision(_))
        ));
        assert_eq!(f.store.get("k"), None);
    }

    #[test]
    fn test_recover_relocks_in_doubt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("p1.wal");

        {
            let wal = Arc::new(Wal::open(&path, Default::default()).unwrap());
            let f = fixture(wal);
            f.agent.prepare(txn(1), put("a")).unwrap();
            f.agent.prepare(txn(2), put("b")).unwrap();
            f.agent.commit(txn(2)).unwrap();
        }

        let wal = Arc::new(Wal::open(&path, Default::default()).unwrap());
        let f = fixture(wal);
        let report = f.agent.recover().unwrap();
        assert_eq!(report.in_doubt, vec![txn(1)]);
        assert_eq!(report.committed, 1);

        // In-doubt lock blocks a conflicting newcomer
        assert_eq!(f.agent.prepare(txn(3), put("a")).unwrap(), Vote::Abort);
        // Committed effect is back in the store
        assert_eq!(f.store.get("b"), Some(b"v".to_vec()));

        f.agent.commit(txn(1)).unwrap();
        assert_eq!(f.store.get("a"), Some(b"v".to_vec()));
    }

    #[test]
    fn test_compaction_keeps_committed_for_volatile_store() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("p1.wal");

        {
            let wal = Arc::new(Wal::open(&path, Default::default()).unwrap());
            let f = fixture(wal);
            f.agent.prepare(txn(1), put("kept")).unwrap();
            f.agent.commit(txn(1)).unwrap();
            f.agent.prepare(txn(2), put("dropped")).unwrap();
            f.agent.abort(txn(2)).unwrap();

            assert_eq!(f.agent.compact().unwrap(), 2);
            assert_eq!(f.agent.state_of(txn(1)), Some(LocalState::Committed));
            assert_eq!(f.agent.state_of(txn(2)), None);
        }

        // Fresh store after a restart
        let wal = Arc::new(Wal::open(&path, Default::default()).unwrap());
        let f = fixture(wal);
        let report = f.agent.recover().unwrap();
        assert_eq!(report.committed, 1);
        assert_eq!(f.store.get("kept"), Some(b"v".to_vec()));
        assert_eq!(f.store.get("dropped"), None);
    }

    struct DurableStore(MemoryStore);

    impl ResourceStore for DurableStore {
        fn validate(&self, op: &Operation) -> std::result::Result<(), String> {
            self.0.validate(op)
        }

        fn apply(&self, txn: TxnId, ops: &[Operation]) -> Result<bool> {
            self.0.apply(txn, ops)
        }

        fn get(&self, key: &str) -> Option<Vec<u8>> {
            self.0.get(key)
        }

        fn is_durable(&self) -> bool {
            true
        }
    }

    #[test]
    fn test_compaction_drops_committed_for_durable_store() {
        let agent = ParticipantAgent::new(
            "p1".into(),
            "coordinator".into(),
            ParticipantConfig::default(),
            Arc::new(Wal::in_memory("p1")),
            Arc::new(DurableStore(MemoryStore::new())),
            Arc::new(LocalNetwork::new(Arc::new(RoutingTable::new()))),
            Arc::new(Metrics::new()),
        );
        agent.prepare(txn(1), put("k")).unwrap();
        agent.commit(txn(1)).unwrap();

        assert_eq!(agent.compact().unwrap(), 2);
        assert!(agent.wal().is_empty());
        assert_eq!(agent.store().get("k"), Some(b"v".to_vec()));
    }

    #[test]
    fn test_in_doubt_expires_after_timeout() {
        let f = fixture(Arc::new(Wal::in_memory("p1")));
        f.agent.prepare(txn(1), put("k")).unwrap();

        let now = now_ms();
        assert!(f.agent.expire_in_doubt_at(now).unwrap().is_empty());

        let later = now + Duration::from_secs(11).as_millis() as u64;
        assert_eq!(f.agent.expire_in_doubt_at(later).unwrap(), vec![txn(1)]);
        assert_eq!(f.agent.state_of(txn(1)), Some(LocalState::Aborted));
        assert_eq!(f.agent.locks().holder("k"), None);
    }

    #[test]
    fn test_in_doubt_waits_out_voting_window() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("p1.wal");
        let now = now_ms();
        let phase1_deadline = now + Duration::from_secs(20).as_millis() as u64;
        let prepare = Envelope::new(
            "coordinator".into(),
            "p1".into(),
            ProtocolMessage::Prepare {
                txn: txn(1),
                payload: put("k"),
                deadline_ms: phase1_deadline,
            },
        );

        {
            let f = fixture(Arc::new(Wal::open(&path, Default::default()).unwrap()));
            f.agent.handle(&prepare).unwrap();
            // Past the decision timeout from the vote, but the coordinator
            // may still be collecting votes
            let after_vote = now + Duration::from_secs(11).as_millis() as u64;
            assert!(f.agent.expire_in_doubt_at(after_vote).unwrap().is_empty());
        }

        // The deadline survives a restart
        let f = fixture(Arc::new(Wal::open(&path, Default::default()).unwrap()));
        f.agent.recover().unwrap();
        let before = phase1_deadline + Duration::from_secs(9).as_millis() as u64;
        assert!(f.agent.expire_in_doubt_at(before).unwrap().is_empty());
        assert_eq!(f.agent.state_of(txn(1)), Some(LocalState::VotedCommit));

        let after = phase1_deadline + Duration::from_secs(10).as_millis() as u64;
        assert_eq!(f.agent.expire_in_doubt_at(after).unwrap(), vec![txn(1)]);
        assert_eq!(f.agent.locks().holder("k"), None);
    }

    #[tokio::test]
    async fn test_status_query_sent_for_in_doubt() {
        let f = fixture(Arc::new(Wal::in_memory("p1")));
        let mut coordinator_inbox = f.network.connect("coordinator".into());
        f.agent.prepare(txn(1), put("k")).unwrap();

        assert_eq!(f.agent.query_in_doubt().await, 1);
        let query = coordinator_inbox.recv().await.unwrap();
        assert_eq!(query.message, ProtocolMessage::StatusQuery { txn: txn(1) });

        let reply = f
            .agent
            .handle(&query.reply(ProtocolMessage::StatusReply {
                txn: txn(1),
                decision: Some(Decision::Commit),
            }))
            .unwrap();
        assert_eq!(
            reply.message,
            ProtocolMessage::Ack {
                txn: txn(1),
                decision: Decision::Commit
            }
        );
        assert!(f.agent.in_doubt().is_empty());
    }

    #[test]
    fn test_handle_prepare_replies_with_vote() {
        let f = fixture(Arc::new(Wal::in_memory("p1")));
        let prepare = Envelope::new(
            "coordinator".into(),
            "p1".into(),
            ProtocolMessage::Prepare {
                txn: txn(4),
                payload: put("k"),
                deadline_ms: 1000,
            },
        );
        let reply = f.agent.handle(&prepare).unwrap();
        assert_eq!(reply.to, NodeId::from("coordinator"));
        assert_eq!(
            reply.message,
            ProtocolMessage::Vote {
                txn: txn(4),
                vote: Vote::Commit
            }
        );
    }

    #[test]
    fn test_fenced_wal_stops_serving() {
        let dir = TempDir::new().unwrap();
        let wal = Arc::new(Wal::open(dir.path().join("p1.wal"), Default::default()).unwrap());
        let f = fixture(wal.clone());

        wal.fail_next_append();
        assert!(f.agent.prepare(txn(1), put("k")).is_err());
        assert_eq!(f.agent.locks().holder("k"), None);
        assert!(!f.agent.is_serving());
        assert!(
            f.agent
                .handle(&Envelope::new(
                    "coordinator".into(),
                    "p1".into(),
                    ProtocolMessage::Ping { seq: 1 }
                ))
                .is_none()
        );
    }
}
