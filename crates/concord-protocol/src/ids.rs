//! Node and transaction identifiers

use serde::{Deserialize, Serialize};
use std::fmt;

/// Name of a node or of a logical role.
///
/// Physical nodes and the roles they host share this type; the routing
/// table maps a role name to the physical node currently holding it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    /// Create a new node id
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Number of low bits holding the per-shard sequence.
const SEQUENCE_BITS: u32 = 48;
const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;

/// Transaction identifier.
///
/// The high 16 bits carry the coordinator shard, the low 48 bits the
/// log sequence number of the transaction's first record. Ids therefore
/// increase monotonically within a shard and never collide across shards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxnId(u64);

impl TxnId {
    /// Build an id from a shard and a sequence number
    pub fn new(shard: u16, sequence: u64) -> Self {
        Self(((shard as u64) << SEQUENCE_BITS) | (sequence & SEQUENCE_MASK))
    }

    /// Rebuild an id from its raw representation
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw 64-bit representation
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Coordinator shard that allocated this id
    pub fn shard(&self) -> u16 {
        (self.0 >> SEQUENCE_BITS) as u16
    }

    /// Sequence component
    pub fn sequence(&self) -> u64 {
        self.0 & SEQUENCE_MASK
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}-{}", self.shard(), self.sequence())
    }
}
