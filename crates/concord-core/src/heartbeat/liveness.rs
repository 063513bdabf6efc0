//! Per-node liveness state machine

use concord_protocol::NodeId;
use serde::{Deserialize, Serialize};

/// What the monitor believes about a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LivenessState {
    Up,
    Suspected,
    Down,
}

impl std::fmt::Display for LivenessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LivenessState::Up => "UP",
            LivenessState::Suspected => "SUSPECTED",
            LivenessState::Down => "DOWN",
        };
        f.write_str(s)
    }
}

/// Liveness of one monitored node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LivenessRecord {
    pub node: NodeId,
    pub state: LivenessState,
    pub consecutive_misses: u32,
    pub last_success_ms: Option<u64>,
    pub last_change_ms: u64,
}

impl LivenessRecord {
    /// A freshly joined node starts UP
    pub fn new(node: NodeId, now_ms: u64) -> Self {
        Self {
            node,
            state: LivenessState::Up,
            consecutive_misses: 0,
            last_success_ms: None,
            last_change_ms: now_ms,
        }
    }

    /// Fold one probe result in, returning `(from, to)` if the state changed
    pub fn observe(
        &mut self,
        success: bool,
        now_ms: u64,
        threshold: u32,
    ) -> Option<(LivenessState, LivenessState)> {
        let from = self.state;
        let to = if success {
            self.consecutive_misses = 0;
            self.last_success_ms = Some(now_ms);
            LivenessState::Up
        } else {
            self.consecutive_misses = self.consecutive_misses.saturating_add(1);
            match from {
                _ if self.consecutive_misses >= threshold => LivenessState::Down,
                LivenessState::Up | LivenessState::Suspected => LivenessState::Suspected,
                LivenessState::Down => LivenessState::Down,
            }
        };

        if from == to {
            return None;
        }
        self.state = to;
        self.last_change_ms = now_ms;
        Some((from, to))
    }
}

/// Published on every liveness transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LivenessEvent {
    pub node: NodeId,
    pub from: LivenessState,
    pub to: LivenessState,
    pub at_ms: u64,
}

impl LivenessEvent {
    pub fn is_failure(&self) -> bool {
        self.to == LivenessState::Down
    }

    /// A DOWN node answered again. It does not get its old roles back.
    pub fn is_recovery(&self) -> bool {
        self.from == LivenessState::Down && self.to == LivenessState::Up
    }
}
