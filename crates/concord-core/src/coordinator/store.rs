//! Transaction state owned by one coordinator instance

use concord_protocol::{
    AbortReason, Decision, NodeId, Outcome, Payload, TxnId, TxnState, VoteState,
};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::{Notify, watch};

/// Coordinator's record of one transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TxnId,
    pub participants: Vec<NodeId>,
    pub payloads: BTreeMap<NodeId, Payload>,
    pub state: TxnState,
    pub created_at_ms: u64,
    pub votes: BTreeMap<NodeId, VoteState>,
    pub acks: BTreeSet<NodeId>,
    pub decision: Option<Decision>,
    /// Sequence number of the decision record
    pub decision_sequence: Option<u64>,
    pub reason: Option<AbortReason>,
    /// The decision record is durable (and replicated where required)
    pub decision_durable: bool,
    pub phase1_deadline_ms: Option<u64>,
    pub phase2_deadline_ms: Option<u64>,
    pub abort_requested: bool,
    /// Every participant acknowledged; eligible for compaction
    pub retired: bool,
}

impl Transaction {
    pub fn new(
        id: TxnId,
        participants: Vec<NodeId>,
        payloads: BTreeMap<NodeId, Payload>,
        created_at_ms: u64,
    ) -> Self {
        let votes = participants
            .iter()
            .map(|p| (p.clone(), VoteState::Pending))
            .collect();
        Self {
            id,
            participants,
            payloads,
            state: TxnState::Init,
            created_at_ms,
            votes,
            acks: BTreeSet::new(),
            decision: None,
            decision_sequence: None,
            reason: None,
            decision_durable: false,
            phase1_deadline_ms: None,
            phase2_deadline_ms: None,
            abort_requested: false,
            retired: false,
        }
    }

    pub fn is_participant(&self, node: &NodeId) -> bool {
        self.participants.iter().any(|p| p == node)
    }

    /// Participants that have not acknowledged the decision
    pub fn unacknowledged(&self) -> Vec<NodeId> {
        self.participants
            .iter()
            .filter(|p| !self.acks.contains(*p))
            .cloned()
            .collect()
    }

    pub fn outcome(&self) -> Outcome {
        match self.state {
            TxnState::Committed => Outcome::Committed,
            TxnState::Aborted => Outcome::Aborted(self.reason.unwrap_or(AbortReason::Recovery)),
            TxnState::Init
            | TxnState::Preparing
            | TxnState::Prepared
            | TxnState::Committing
            | TxnState::Aborting => Outcome::InProgress,
        }
    }

    pub fn status(&self) -> TxnStatus {
        TxnStatus {
            id: self.id,
            state: self.state,
            outcome: self.outcome(),
            reason: self.reason,
            votes: self.votes.clone(),
            acknowledged: self.acks.clone(),
            unacknowledged: self.unacknowledged(),
        }
    }
}

/// Caller-facing view of a transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxnStatus {
    pub id: TxnId,
    pub state: TxnState,
    pub outcome: Outcome,
    pub reason: Option<AbortReason>,
    pub votes: BTreeMap<NodeId, VoteState>,
    pub acknowledged: BTreeSet<NodeId>,
    pub unacknowledged: Vec<NodeId>,
}

struct Entry {
    txn: Transaction,
    state_tx: watch::Sender<TxnState>,
    wake: Arc<Notify>,
}

/// Handle to the transactions of one coordinator.
///
/// Cloning shares the same map; nothing here is process-global.
#[derive(Clone, Default)]
pub struct TxnStore {
    entries: Arc<DashMap<TxnId, Entry>>,
}

impl TxnStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, txn: Transaction) {
        let (state_tx, _) = watch::channel(txn.state);
        self.entries.insert(
            txn.id,
            Entry {
                txn,
                state_tx,
                wake: Arc::new(Notify::new()),
            },
        );
    }

    pub fn get(&self, id: TxnId) -> Option<Transaction> {
        self.entries.get(&id).map(|e| e.txn.clone())
    }

    pub fn contains(&self, id: TxnId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Mutate a transaction in place; state watchers see the new state
    pub fn with_mut<R>(&self, id: TxnId, f: impl FnOnce(&mut Transaction) -> R) -> Option<R> {
        let mut entry = self.entries.get_mut(&id)?;
        let before = entry.txn.state;
        let result = f(&mut entry.txn);
        let after = entry.txn.state;
        if before != after {
            entry.state_tx.send_replace(after);
        }
        Some(result)
    }

    /// Wake the task driving `id`
    pub fn wake(&self, id: TxnId) {
        if let Some(entry) = self.entries.get(&id) {
            entry.wake.notify_one();
        }
    }

    pub fn notifier(&self, id: TxnId) -> Option<Arc<Notify>> {
        self.entries.get(&id).map(|e| e.wake.clone())
    }

    pub fn watch_state(&self, id: TxnId) -> Option<watch::Receiver<TxnState>> {
        self.entries.get(&id).map(|e| e.state_tx.subscribe())
    }

    pub fn remove(&self, id: TxnId) -> Option<Transaction> {
        self.entries.remove(&id).map(|(_, e)| e.txn)
    }

    pub fn ids(&self) -> Vec<TxnId> {
        let mut ids: Vec<TxnId> = self.entries.iter().map(|e| *e.key()).collect();
        ids.sort();
        ids
    }

    /// Decided transactions some participant has not acknowledged
    pub fn pending_delivery(&self) -> Vec<TxnId> {
        let mut ids: Vec<TxnId> = self
            .entries
            .iter()
            .filter(|e| e.txn.decision_durable && !e.txn.retired)
            .map(|e| *e.key())
            .collect();
        ids.sort();
        ids
    }

    /// Transactions without a decision
    pub fn active(&self) -> Vec<TxnId> {
        let mut ids: Vec<TxnId> = self
            .entries
            .iter()
            .filter(|e| e.txn.decision.is_none())
            .map(|e| *e.key())
            .collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for TxnStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxnStore")
            .field("transactions", &self.entries.len())
            .finish()
    }
}
