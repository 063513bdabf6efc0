//! Operations a participant executes for one branch of a transaction

use serde::{Deserialize, Serialize};

/// What to do with a key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    /// Store a value
    Put(Vec<u8>),
    /// Remove the key
    Delete,
    /// Precondition: the current value must equal `expected` (None = absent)
    Assert { expected: Option<Vec<u8>> },
}

/// A single keyed operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub key: String,
    pub action: Action,
}

impl Operation {
    pub fn put(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            action: Action::Put(value.into()),
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            action: Action::Delete,
        }
    }

    pub fn assert_eq(key: impl Into<String>, expected: Option<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            action: Action::Assert { expected },
        }
    }

    /// True if applying this operation changes stored data
    pub fn is_write(&self) -> bool {
        !matches!(self.action, Action::Assert { .. })
    }
}

/// The branch of a transaction sent to one participant with PREPARE
pub type Payload = Vec<Operation>;
