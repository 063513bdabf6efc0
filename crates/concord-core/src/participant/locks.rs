//! Exclusive per-key locks held by prepared transactions
//!
//! Acquisition never waits: the first PREPARE to lock a key wins and a
//! later conflicting PREPARE fails at once, which the agent turns into an
//! ABORT vote.

use concord_protocol::TxnId;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;

/// Lock holder information
#[derive(Debug, Clone)]
struct LockHolder {
    txn: TxnId,
    acquired_at: Instant,
}

/// A key already held by another transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockConflict {
    pub key: String,
    pub holder: TxnId,
}

/// Key lock table
#[derive(Debug, Clone, Default)]
pub struct LockTable {
    locks: Arc<RwLock<HashMap<String, LockHolder>>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock every key for `txn`, or none of them.
    ///
    /// Keys already held by `txn` are fine.
    pub fn try_acquire_all<'a, I>(&self, txn: TxnId, keys: I) -> Result<usize, LockConflict>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let keys: BTreeSet<&str> = keys.into_iter().collect();
        let mut locks = self.locks.write();

        for key in &keys {
            if let Some(holder) = locks.get(*key) {
                if holder.txn != txn {
                    return Err(LockConflict {
                        key: key.to_string(),
                        holder: holder.txn,
                    });
                }
            }
        }

        let now = Instant::now();
        for key in &keys {
            locks
                .entry(key.to_string())
                .or_insert_with(|| LockHolder { txn, acquired_at: now });
        }
        Ok(keys.len())
    }

    /// Lock keys unconditionally; used when replaying in-doubt transactions
    pub fn force_acquire<'a, I>(&self, txn: TxnId, keys: I)
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut locks = self.locks.write();
        let now = Instant::now();
        for key in keys {
            if let Some(previous) = locks.insert(key.to_string(), LockHolder { txn, acquired_at: now }) {
                if previous.txn != txn {
                    tracing::warn!(
                        "Lock on {} moved from {} to in-doubt {}",
                        key,
                        previous.txn,
                        txn
                    );
                }
            }
        }
    }

    /// Release every lock held by `txn`; returns how many were released
    pub fn release(&self, txn: TxnId) -> usize {
        let mut locks = self.locks.write();
        let before = locks.len();
        locks.retain(|_, holder| holder.txn != txn);
        before - locks.len()
    }

    pub fn holder(&self, key: &str) -> Option<TxnId> {
        self.locks.read().get(key).map(|h| h.txn)
    }

    /// Keys currently held by `txn`
    pub fn held_by(&self, txn: TxnId) -> Vec<String> {
        let mut keys: Vec<String> = self
            .locks
            .read()
            .iter()
            .filter(|(_, h)| h.txn == txn)
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Get lock statistics
    pub fn stats(&self) -> LockStats {
        let locks = self.locks.read();
        let holders: BTreeSet<TxnId> = locks.values().map(|h| h.txn).collect();
        let oldest = locks.values().map(|h| h.acquired_at).min();

        LockStats {
            locked_keys: locks.len(),
            holders: holders.len(),
            oldest_held_ms: oldest.map(|t| t.elapsed().as_millis() as u64),
        }
    }
}

/// Lock statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockStats {
    /// Number of keys locked
    pub locked_keys: usize,
    /// Number of distinct transactions holding locks
    pub holders: usize,
    /// Age of the oldest lock
    pub oldest_held_ms: Option<u64>,
}
