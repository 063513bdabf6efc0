//! Durable record of failover progress

use crate::wal::LogFile;
use crate::{Result, now_ms};
use concord_protocol::NodeId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use uuid::Uuid;

const MAX_ENTRY_BYTES: usize = 64 * 1024;

/// One step of the detect → select → catch-up → promote → redirect sequence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailoverStep {
    Detected { failed: NodeId },
    Selected { standby: NodeId, lag: u64 },
    CaughtUp { applied: u64 },
    Promoted,
    Redirected,
    Abandoned { reason: String },
}

impl FailoverStep {
    pub fn is_terminal(&self) -> bool {
        matches!(self, FailoverStep::Redirected | FailoverStep::Abandoned { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            FailoverStep::Detected { .. } => "detected",
            FailoverStep::Selected { .. } => "selected",
            FailoverStep::CaughtUp { .. } => "caught-up",
            FailoverStep::Promoted => "promoted",
            FailoverStep::Redirected => "redirected",
            FailoverStep::Abandoned { .. } => "abandoned",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailoverEntry {
    pub failover_id: Uuid,
    pub role: NodeId,
    pub step: FailoverStep,
    pub at_ms: u64,
}

/// A failover whose last journaled step is not terminal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingFailover {
    pub failover_id: Uuid,
    pub role: NodeId,
    pub steps: Vec<FailoverStep>,
}

struct JournalInner {
    file: Option<LogFile<FailoverEntry>>,
    entries: Vec<FailoverEntry>,
}

/// Append-only failover journal
pub struct FailoverJournal {
    inner: Mutex<JournalInner>,
}

impl FailoverJournal {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let (file, entries) = LogFile::open(path, true, MAX_ENTRY_BYTES)?;
        tracing::info!(
            "Opened failover journal {} with {} entries",
            path.display(),
            entries.len()
        );
        Ok(Self {
            inner: Mutex::new(JournalInner {
                file: Some(file),
                entries,
            }),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            inner: Mutex::new(JournalInner {
                file: None,
                entries: Vec::new(),
            }),
        }
    }

    /// Durably append one step
    pub fn record(&self, failover_id: Uuid, role: &NodeId, step: FailoverStep) -> Result<()> {
        let entry = FailoverEntry {
            failover_id,
            role: role.clone(),
            step,
            at_ms: now_ms(),
        };
        let mut inner = self.inner.lock();
        if let Some(file) = inner.file.as_mut() {
            file.append(&entry)?;
        }
        tracing::info!(
            "Failover {} of {}: {} {:?}",
            failover_id,
            role,
            entry.step.name(),
            entry.step
        );
        inner.entries.push(entry);
        Ok(())
    }

    pub fn entries(&self) -> Vec<FailoverEntry> {
        self.inner.lock().entries.clone()
    }

    /// Steps of one failover in journal order
    pub fn history(&self, failover_id: Uuid) -> Vec<FailoverStep> {
        self.inner
            .lock()
            .entries
            .iter()
            .filter(|e| e.failover_id == failover_id)
            .map(|e| e.step.clone())
            .collect()
    }

    /// Failovers that were interrupted before a terminal step
    pub fn pending(&self) -> Vec<PendingFailover> {
        let inner = self.inner.lock();
        let mut order: Vec<PendingFailover> = Vec::new();
        for entry in &inner.entries {
            match order.iter_mut().find(|p| p.failover_id == entry.failover_id) {
                Some(pending) => pending.steps.push(entry.step.clone()),
                None => order.push(PendingFailover {
                    failover_id: entry.failover_id,
                    role: entry.role.clone(),
                    steps: vec![entry.step.clone()],
                }),
            }
        }
        order.retain(|p| p.steps.last().is_some_and(|s| !s.is_terminal()));
        order
    }
}

impl std::fmt::Debug for FailoverJournal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailoverJournal")
            .field("entries", &self.inner.lock().entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_pending_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("failover.journal");
        let done = Uuid::new_v4();
        let interrupted = Uuid::new_v4();

        {
            let journal = FailoverJournal::open(&path).unwrap();
            let role = NodeId::from("p1");
            journal
                .record(done, &role, FailoverStep::Detected { failed: "n1".into() })
                .unwrap();
            journal
                .record(
                    done,
                    &role,
                    FailoverStep::Abandoned {
                        reason: "no standby".into(),
                    },
                )
                .unwrap();
            journal
                .record(
                    interrupted,
                    &role,
                    FailoverStep::Detected { failed: "n1".into() },
                )
                .unwrap();
            journal
                .record(
                    interrupted,
                    &role,
                    FailoverStep::Selected {
                        standby: "n2".into(),
                        lag: 0,
                    },
                )
                .unwrap();
        }

        let journal = FailoverJournal::open(&path).unwrap();
        assert_eq!(journal.entries().len(), 4);
        let pending = journal.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].failover_id, interrupted);
        assert_eq!(pending[0].steps.len(), 2);
        assert_eq!(journal.history(done).len(), 2);
    }
}
