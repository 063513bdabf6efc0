//! Concord Protocol - wire-level types for the commit protocol
//!
//! Provides:
//! - Node and transaction identifiers
//! - Transaction states, votes, decisions and abort reasons
//! - Participant operations carried in PREPARE payloads
//! - The closed set of protocol messages and their framed codec
//!
//! # Wire Format
//!
//! ```text
//! [message_type:1][length:4][payload:N][crc32:4]
//! ```

#![warn(clippy::all)]

pub mod error;
pub mod ids;
pub mod message;
pub mod operation;
pub mod types;

pub use error::{ProtocolError, Result};
pub use ids::{NodeId, TxnId};
pub use message::{Envelope, MessageType, PROTOCOL_VERSION, ProtocolMessage};
pub use operation::{Action, Operation, Payload};
pub use types::{AbortReason, Decision, Outcome, TxnState, Vote, VoteState};
