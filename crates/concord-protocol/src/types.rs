//! Transaction states, votes and outcomes

use serde::{Deserialize, Serialize};
use std::fmt;

/// Coordinator-side transaction state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxnState {
    /// Created, nothing sent yet
    Init,
    /// PREPARE sent, collecting votes
    Preparing,
    /// Every participant voted COMMIT
    Prepared,
    /// COMMIT decided and being delivered
    Committing,
    /// Terminal: committed
    Committed,
    /// ABORT decided and being delivered
    Aborting,
    /// Terminal: aborted
    Aborted,
}

impl TxnState {
    /// True once the transaction can no longer change outcome
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Committed | Self::Aborted)
    }

    /// The decision implied by this state, if one has been made
    pub fn decision(&self) -> Option<Decision> {
        match self {
            Self::Init | Self::Preparing | Self::Prepared => None,
            Self::Committing | Self::Committed => Some(Decision::Commit),
            Self::Aborting | Self::Aborted => Some(Decision::Abort),
        }
    }
}

impl fmt::Display for TxnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Init => "INIT",
            Self::Preparing => "PREPARING",
            Self::Prepared => "PREPARED",
            Self::Committing => "COMMITTING",
            Self::Committed => "COMMITTED",
            Self::Aborting => "ABORTING",
            Self::Aborted => "ABORTED",
        };
        f.write_str(s)
    }
}

/// A participant's vote
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Vote {
    Commit,
    Abort,
}

/// Coordinator's record of one participant's vote
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum VoteState {
    #[default]
    Pending,
    Commit,
    Abort,
}

impl From<Vote> for VoteState {
    fn from(vote: Vote) -> Self {
        match vote {
            Vote::Commit => Self::Commit,
            Vote::Abort => Self::Abort,
        }
    }
}

/// Global outcome decided by the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Decision {
    Commit,
    Abort,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Commit => f.write_str("COMMIT"),
            Self::Abort => f.write_str("ABORT"),
        }
    }
}

/// Why a transaction was aborted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AbortReason {
    /// A participant voted ABORT
    ParticipantVote,
    /// A vote did not arrive before the phase-1 deadline
    Timeout,
    /// Aborted through the control surface
    Administrative,
    /// Found undecided while replaying the log after a restart or promotion
    Recovery,
}

/// Outcome visible to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Committed,
    Aborted(AbortReason),
    InProgress,
}
