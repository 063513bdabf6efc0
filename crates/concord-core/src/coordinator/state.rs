//! Coordinator-side transaction state machine

use crate::{Error, Result};
use concord_protocol::{Decision, TxnState};

/// Inputs that move a transaction between states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnEvent {
    /// PREPARING is durable and PREPARE is going out
    StartPrepare,
    /// Every participant voted COMMIT
    AllVotedCommit,
    /// Decision is being recorded
    Decide(Decision),
    /// Delivery finished: acknowledged by all, or the phase-2 deadline passed
    Complete,
}

/// Next state for `event` in `state`, or an error for an illegal pair
pub fn transition(state: TxnState, event: TxnEvent) -> Result<TxnState> {
    use TxnState::*;

    let next = match (state, event) {
        (Init, TxnEvent::StartPrepare) => Some(Preparing),
        (
            Preparing | Prepared | Committing | Committed | Aborting | Aborted,
            TxnEvent::StartPrepare,
        ) => None,

        (Preparing, TxnEvent::AllVotedCommit) => Some(Prepared),
        (Prepared, TxnEvent::AllVotedCommit) => Some(Prepared),
        (Init | Committing | Committed | Aborting | Aborted, TxnEvent::AllVotedCommit) => None,

        (Prepared, TxnEvent::Decide(Decision::Commit)) => Some(Committing),
        (
            Init | Preparing | Committing | Committed | Aborting | Aborted,
            TxnEvent::Decide(Decision::Commit),
        ) => None,

        // Abort is allowed until a commit decision exists
        (Init | Preparing | Prepared, TxnEvent::Decide(Decision::Abort)) => Some(Aborting),
        (Committing | Committed | Aborting | Aborted, TxnEvent::Decide(Decision::Abort)) => None,

        (Committing, TxnEvent::Complete) => Some(Committed),
        (Aborting, TxnEvent::Complete) => Some(Aborted),
        (Committed, TxnEvent::Complete) => Some(Committed),
        (Aborted, TxnEvent::Complete) => Some(Aborted),
        (Init | Preparing | Prepared, TxnEvent::Complete) => None,
    };

    next.ok_or_else(|| {
        Error::transaction(format!("illegal transition from {} on {:?}", state, event))
    })
}
