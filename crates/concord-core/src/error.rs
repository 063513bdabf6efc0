//! Error types for Concord Core

use concord_protocol::{Decision, NodeId, ProtocolError, TxnId};
use thiserror::Error;

/// Result type alias using the core error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors from log files and sockets
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Wire protocol errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// WAL (write-ahead log) errors
    #[error("WAL error: {0}")]
    Wal(String),

    /// A WAL write failed earlier; the owning role no longer serves
    #[error("WAL fenced: {0}")]
    WalFenced(String),

    /// Transaction errors
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// Transaction id not known to this instance
    #[error("Unknown transaction: {0}")]
    UnknownTransaction(TxnId),

    /// Request conflicts with a durable decision
    #[error("Transaction {txn} already decided {decision}")]
    AlreadyDecided {
        /// Transaction id
        txn: TxnId,
        /// Decision already recorded
        decision: Decision,
    },

    /// Decision delivered to a participant contradicts its local state
    #[error("Conflicting decision: {0}")]
    ConflictingDecision(String),

    /// Replication errors
    #[error("Replication error: {0}")]
    Replication(String),

    /// Failover errors
    #[error("Failover error: {0}")]
    Failover(String),

    /// Destination node or role could not be reached
    #[error("Unreachable: {0}")]
    Unreachable(NodeId),

    /// No live holder exists for a role
    #[error("Role unavailable: {0}")]
    Unavailable(String),

    /// A bounded wait expired
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Looked-up entity not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Retryable errors (temporary failures)
    #[error("Retryable error: {0}")]
    Retryable(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a WAL error
    pub fn wal(msg: impl Into<String>) -> Self {
        Self::Wal(msg.into())
    }

    /// Create a fenced WAL error
    pub fn fenced(msg: impl Into<String>) -> Self {
        Self::WalFenced(msg.into())
    }

    /// Create a transaction error
    pub fn transaction(msg: impl Into<String>) -> Self {
        Self::Transaction(msg.into())
    }

    /// Create a conflicting decision error
    pub fn conflicting(msg: impl Into<String>) -> Self {
        Self::ConflictingDecision(msg.into())
    }

    /// Create a replication error
    pub fn replication(msg: impl Into<String>) -> Self {
        Self::Replication(msg.into())
    }

    /// Create a failover error
    pub fn failover(msg: impl Into<String>) -> Self {
        Self::Failover(msg.into())
    }

    /// Create an unavailable role error
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a not found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a retryable error
    pub fn retryable(msg: impl Into<String>) -> Self {
        Self::Retryable(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// True for errors that leave the local role unable to serve
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::WalFenced(_) | Self::Wal(_) | Self::Io(_))
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
