//! WAL record types

use concord_protocol::{AbortReason, Decision, NodeId, Payload, TxnId, Vote, VoteState};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One durable state transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalRecord {
    pub sequence: u64,
    pub txn: TxnId,
    pub transition: TxnTransition,
    pub timestamp_ms: u64,
}

/// Transitions recorded by coordinators and participants
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxnTransition {
    /// Coordinator created the transaction
    Begin {
        participants: Vec<NodeId>,
        payloads: BTreeMap<NodeId, Payload>,
    },
    /// Coordinator is about to send PREPARE
    Preparing,
    /// Participant voted; `operations` are the tentative effects
    Voted {
        vote: Vote,
        operations: Payload,
        coordinator: NodeId,
        /// Coordinator's phase-1 deadline carried by the PREPARE
        deadline_ms: Option<u64>,
    },
    /// Coordinator decision, the irrevocable point
    Decision {
        decision: Decision,
        votes: BTreeMap<NodeId, VoteState>,
        reason: Option<AbortReason>,
    },
    /// Coordinator received a participant's acknowledgment
    Acknowledged { participant: NodeId },
    /// Coordinator: every participant acknowledged
    Completed { decision: Decision },
    /// Participant applied or discarded its branch
    Applied { decision: Decision },
}

/// Compact tag for the persisted (sequence, txn, tag, payload) layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StateTag {
    Init,
    Preparing,
    Voted,
    Decided,
    Acknowledged,
    Completed,
    Applied,
}

impl WalRecord {
    pub fn state_tag(&self) -> StateTag {
        match self.transition {
            TxnTransition::Begin { .. } => StateTag::Init,
            TxnTransition::Preparing => StateTag::Preparing,
            TxnTransition::Voted { .. } => StateTag::Voted,
            TxnTransition::Decision { .. } => StateTag::Decided,
            TxnTransition::Acknowledged { .. } => StateTag::Acknowledged,
            TxnTransition::Completed { .. } => StateTag::Completed,
            TxnTransition::Applied { .. } => StateTag::Applied,
        }
    }

    /// True for records after which the transaction may be compacted
    pub fn retires(&self) -> bool {
        matches!(
            self.transition,
            TxnTransition::Completed { .. } | TxnTransition::Applied { .. }
        )
    }
}
