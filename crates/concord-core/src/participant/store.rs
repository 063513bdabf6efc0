//! Resource stores that participant agents apply committed branches to

use crate::Result;
use concord_protocol::{Action, Operation, TxnId};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashSet};

/// Local resources managed by one participant
pub trait ResourceStore: Send + Sync {
    /// Check that `op` can execute against the current state
    fn validate(&self, op: &Operation) -> std::result::Result<(), String>;

    /// Apply a committed branch.
    ///
    /// Must be idempotent per `txn`: returns `false` when the branch was
    /// already applied.
    fn apply(&self, txn: TxnId, ops: &[Operation]) -> Result<bool>;

    fn get(&self, key: &str) -> Option<Vec<u8>>;

    /// True when applied effects survive a restart without log replay
    fn is_durable(&self) -> bool {
        false
    }
}

#[derive(Debug, Default)]
struct StoreState {
    data: BTreeMap<String, Vec<u8>>,
    applied: HashSet<TxnId>,
    applications: u64,
}

/// In-memory key/value store
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every key and value
    pub fn snapshot(&self) -> BTreeMap<String, Vec<u8>> {
        self.state.read().data.clone()
    }

    /// Number of branches actually applied
    pub fn applications(&self) -> u64 {
        self.state.read().applications
    }

    pub fn was_applied(&self, txn: TxnId) -> bool {
        self.state.read().applied.contains(&txn)
    }
}

impl ResourceStore for MemoryStore {
    fn validate(&self, op: &Operation) -> std::result::Result<(), String> {
        if op.key.is_empty() {
            return Err("empty key".into());
        }

        match &op.action {
            Action::Put(_) | Action::Delete => Ok(()),
            Action::Assert { expected } => {
                let state = self.state.read();
                let current = state.data.get(&op.key);
                if current == expected.as_ref() {
                    Ok(())
                } else {
                    Err(format!("precondition on {} does not hold", op.key))
                }
            }
        }
    }

    fn apply(&self, txn: TxnId, ops: &[Operation]) -> Result<bool> {
        let mut state = self.state.write();
        if !state.applied.insert(txn) {
            return Ok(false);
        }

        for op in ops {
            match &op.action {
                Action::Put(value) => {
                    state.data.insert(op.key.clone(), value.clone());
                }
                Action::Delete => {
                    state.data.remove(&op.key);
                }
                Action::Assert { .. } => {}
            }
        }
        state.applications += 1;
        Ok(true)
    }

    fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.state.read().data.get(key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_once_per_txn() {
        let store = MemoryStore::new();
        let txn = TxnId::new(0, 1);
        let ops = vec![Operation::put("k", b"v".to_vec())];

        assert!(store.apply(txn, &ops).unwrap());
        assert!(!store.apply(txn, &ops).unwrap());
        assert_eq!(store.applications(), 1);
        assert_eq!(store.get("k"), Some(b"v".to_vec()));
    }

    #[test]
    fn test_assert_validation() {
        let store = MemoryStore::new();
        assert!(store.validate(&Operation::assert_eq("k", None)).is_ok());
        assert!(
            store
                .validate(&Operation::assert_eq("k", Some(b"v".to_vec())))
                .is_err()
        );

        store
            .apply(TxnId::new(0, 1), &[Operation::put("k", b"v".to_vec())])
            .unwrap();
        assert!(
            store
                .validate(&Operation::assert_eq("k", Some(b"v".to_vec())))
                .is_ok()
        );
    }

    #[test]
    fn test_delete() {
        let store = MemoryStore::new();
        store
            .apply(TxnId::new(0, 1), &[Operation::put("k", b"v".to_vec())])
            .unwrap();
        store
            .apply(TxnId::new(0, 2), &[Operation::delete("k")])
            .unwrap();
        assert!(store.snapshot().is_empty());
    }

    #[test]
    fn test_empty_key_rejected() {
        let store = MemoryStore::new();
        assert!(store.validate(&Operation::delete("")).is_err());
    }
}
