//! Rebuilding coordinator state from its log

use super::store::Transaction;
use crate::wal::{TxnTransition, WalRecord};
use concord_protocol::{Decision, TxnState};
use std::collections::BTreeMap;

/// What replay found for one transaction
#[derive(Debug, Clone)]
pub struct Replayed {
    pub txn: Transaction,
    pub completed: bool,
}

/// What the coordinator must do with a replayed transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Nothing left to do
    Retired,
    /// Decision durable, some participant not acknowledged: redeliver
    ResumeDelivery { decision: Decision, sequence: u64 },
    /// No decision was ever recorded: abort
    Abort,
}

impl Replayed {
    pub fn action(&self) -> RecoveryAction {
        match (self.completed, self.txn.decision, self.txn.decision_sequence) {
            (true, _, _) => RecoveryAction::Retired,
            (false, Some(decision), Some(sequence)) => {
                RecoveryAction::ResumeDelivery { decision, sequence }
            }
            (false, _, _) => RecoveryAction::Abort,
        }
    }
}

/// Replay coordinator records into per-transaction state
pub fn replay(records: &[WalRecord]) -> BTreeMap<concord_protocol::TxnId, Replayed> {
    let mut out: BTreeMap<concord_protocol::TxnId, Replayed> = BTreeMap::new();

    for record in records {
        match &record.transition {
            TxnTransition::Begin {
                participants,
                payloads,
            } => {
                out.insert(
                    record.txn,
                    Replayed {
                        txn: Transaction::new(
                            record.txn,
                            participants.clone(),
                            payloads.clone(),
                            record.timestamp_ms,
                        ),
                        completed: false,
                    },
                );
            }
            transition => {
                let Some(entry) = out.get_mut(&record.txn) else {
                    tracing::warn!(
                        "Record {} for {} has no INIT record; skipping",
                        record.sequence,
                        record.txn
                    );
                    continue;
                };
                apply(entry, record.sequence, transition);
            }
        }
    }

    out
}

fn apply(entry: &mut Replayed, sequence: u64, transition: &TxnTransition) {
    let txn = &mut entry.txn;
    match transition {
        TxnTransition::Begin { .. } => {}
        TxnTransition::Preparing => txn.state = TxnState::Preparing,
        TxnTransition::Decision {
            decision,
            votes,
            reason,
        } => {
            txn.decision = Some(*decision);
            txn.reason = *reason;
            txn.votes = votes.clone();
            txn.state = match decision {
                Decision::Commit => TxnState::Committing,
                Decision::Abort => TxnState::Aborting,
            };
            txn.decision_sequence = Some(sequence);
        }
        TxnTransition::Acknowledged { participant } => {
            txn.acks.insert(participant.clone());
        }
        TxnTransition::Completed { decision } => {
            txn.state = match decision {
                Decision::Commit => TxnState::Committed,
                Decision::Abort => TxnState::Aborted,
            };
            txn.retired = true;
            entry.completed = true;
        }
        TxnTransition::Voted { .. } | TxnTransition::Applied { .. } => {
            tracing::warn!("Participant record in coordinator log for {}", txn.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_protocol::{AbortReason, NodeId, TxnId};

    fn record(sequence: u64, transition: TxnTransition) -> WalRecord {
        WalRecord {
            sequence,
            txn: TxnId::new(0, 1),
            transition,
            timestamp_ms: 0,
        }
    }

    fn begin() -> TxnTransition {
        TxnTransition::Begin {
            participants: vec![NodeId::from("a"), NodeId::from("b")],
            payloads: BTreeMap::new(),
        }
    }

    #[test]
    fn test_preparing_only_aborts() {
        let records = vec![record(1, begin()), record(2, TxnTransition::Preparing)];
        let replayed = replay(&records);
        let entry = &replayed[&TxnId::new(0, 1)];
        assert_eq!(entry.txn.state, TxnState::Preparing);
        assert_eq!(entry.action(), RecoveryAction::Abort);
    }

    #[test]
    fn test_decision_resumes_delivery() {
        let records = vec![
            record(1, begin()),
            record(2, TxnTransition::Preparing),
            record(
                3,
                TxnTransition::Decision {
                    decision: Decision::Commit,
                    votes: BTreeMap::new(),
                    reason: None,
                },
            ),
            record(
                4,
                TxnTransition::Acknowledged {
                    participant: "a".into(),
                },
            ),
        ];
        let replayed = replay(&records);
        let entry = &replayed[&TxnId::new(0, 1)];
        assert_eq!(
            entry.action(),
            RecoveryAction::ResumeDelivery {
                decision: Decision::Commit,
                sequence: 3
            }
        );
        assert_eq!(entry.txn.unacknowledged(), vec![NodeId::from("b")]);
    }

    #[test]
    fn test_completed_is_retired() {
        let records = vec![
            record(1, begin()),
            record(
                2,
                TxnTransition::Decision {
                    decision: Decision::Abort,
                    votes: BTreeMap::new(),
                    reason: Some(AbortReason::ParticipantVote),
                },
            ),
            record(
                3,
                TxnTransition::Completed {
                    decision: Decision::Abort,
                },
            ),
        ];
        let replayed = replay(&records);
        let entry = &replayed[&TxnId::new(0, 1)];
        assert_eq!(entry.action(), RecoveryAction::Retired);
        assert_eq!(entry.txn.state, TxnState::Aborted);
    }
}
