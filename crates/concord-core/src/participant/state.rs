//! Participant-side transaction state machine

use concord_protocol::{Decision, NodeId, Payload, Vote};

/// Local state of one transaction branch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalState {
    /// Voted COMMIT, holding locks, waiting for the decision
    VotedCommit,
    /// Voted ABORT, nothing held
    VotedAbort,
    Committed,
    Aborted,
}

impl LocalState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Committed | Self::Aborted)
    }
}

/// What a participant knows about one transaction
#[derive(Debug, Clone)]
pub struct LocalTxn {
    pub state: LocalState,
    pub operations: Payload,
    pub coordinator: NodeId,
    pub voted_at_ms: u64,
    /// Latest time the coordinator may still decide; the unilateral abort
    /// clock starts here
    pub decide_by_ms: u64,
}

impl LocalTxn {
    /// When the branch may be aborted without hearing from the coordinator
    pub fn expires_at_ms(&self, decision_timeout_ms: u64) -> u64 {
        self.decide_by_ms
            .max(self.voted_at_ms)
            .saturating_add(decision_timeout_ms)
    }
}

/// Reaction to a PREPARE
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrepareAction {
    /// First PREPARE: validate and lock
    Evaluate,
    /// Already voted or decided: answer with the same vote
    Repeat(Vote),
}

/// Reaction to a decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionAction {
    /// Apply the tentative effects and release locks
    Apply,
    /// Drop the tentative effects and release locks
    Discard,
    /// Same decision already applied
    Duplicate,
    /// ABORT for a transaction never prepared here: remember it so a
    /// late PREPARE votes ABORT
    RecordAbort,
    /// COMMIT for a transaction no longer in the log; it was applied and
    /// compacted
    AssumeApplied,
    /// Decision contradicts local state
    Conflict,
}

pub fn on_prepare(state: Option<LocalState>) -> PrepareAction {
    match state {
        None => PrepareAction::Evaluate,
        Some(LocalState::VotedCommit) | Some(LocalState::Committed) => {
            PrepareAction::Repeat(Vote::Commit)
        }
        Some(LocalState::VotedAbort) | Some(LocalState::Aborted) => {
            PrepareAction::Repeat(Vote::Abort)
        }
    }
}

pub fn on_decision(state: Option<LocalState>, decision: Decision) -> DecisionAction {
    match (state, decision) {
        (Some(LocalState::VotedCommit), Decision::Commit) => DecisionAction::Apply,
        (Some(LocalState::VotedCommit), Decision::Abort) => DecisionAction::Discard,
        (Some(LocalState::VotedAbort), Decision::Abort) => DecisionAction::Discard,
        (Some(LocalState::VotedAbort), Decision::Commit) => DecisionAction::Conflict,
        (Some(LocalState::Committed), Decision::Commit) => DecisionAction::Duplicate,
        (Some(LocalState::Aborted), Decision::Abort) => DecisionAction::Duplicate,
        (Some(LocalState::Committed), Decision::Abort) => DecisionAction::Conflict,
        (Some(LocalState::Aborted), Decision::Commit) => DecisionAction::Conflict,
        (None, Decision::Abort) => DecisionAction::RecordAbort,
        (None, Decision::Commit) => DecisionAction::AssumeApplied,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_decisions() {
        assert_eq!(
            on_decision(Some(LocalState::Committed), Decision::Commit),
            DecisionAction::Duplicate
        );
        assert_eq!(
            on_decision(Some(LocalState::Aborted), Decision::Abort),
            DecisionAction::Duplicate
        );
    }

    #[test]
    fn test_commit_after_abort_vote_conflicts() {
        assert_eq!(
            on_decision(Some(LocalState::VotedAbort), Decision::Commit),
            DecisionAction::Conflict
        );
    }

    #[test]
    fn test_prepare_repeats_vote() {
        assert_eq!(on_prepare(None), PrepareAction::Evaluate);
        assert_eq!(
            on_prepare(Some(LocalState::Aborted)),
            PrepareAction::Repeat(Vote::Abort)
        );
        assert_eq!(
            on_prepare(Some(LocalState::VotedCommit)),
            PrepareAction::Repeat(Vote::Commit)
        );
    }
}
