//! Concord Core - Distributed Transaction Coordination
//!
//! This crate implements atomic commitment across independent nodes:
//! - Two-phase commit coordinator with durable, write-then-send decisions
//! - Participant agents with per-key locks and idempotent decision handling
//! - Write-ahead log with CRC-framed records, replay and compaction
//! - Heartbeat-based failure detection (UP / SUSPECTED / DOWN)
//! - Log shipping to standbys with quorum or active-passive durability
//! - Journaled, resumable failover with role redirection
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │                 Cluster                      │
//! │  (control surface, failure injection)       │
//! └──────┬───────────────────────────┬──────────┘
//!        │                           │
//! ┌──────┴────────────┐   ┌──────────┴──────────┐
//! │   Coordinator     │   │ Failover Controller │
//! │   Participants    │   │ Heartbeat Monitor   │
//! └──────┬────────────┘   └──────────┬──────────┘
//!        │                           │
//! ┌──────┴───────────────────────────┴──────────┐
//! │      Write-Ahead Log + Replication           │
//! └──────────────┬──────────────────────────────┘
//!                │
//! ┌──────────────┴──────────────────────────────┐
//! │        Transport (in-process / TCP)          │
//! └─────────────────────────────────────────────┘
//! ```

#![warn(clippy::all)]

pub mod cluster;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod failover;
pub mod heartbeat;
pub mod metrics;
pub mod node;
pub mod participant;
pub mod replication;
pub mod retry;
pub mod transport;
pub mod wal;

pub use cluster::{Cluster, ClusterBuilder, TopologySnapshot};
pub use config::ClusterConfig;
pub use coordinator::{Coordinator, CoordinatorEvent, TxnStatus};
pub use error::{Error, Result};
pub use metrics::{Metrics, MetricsSnapshot};
pub use participant::ParticipantAgent;

/// Wall-clock milliseconds since the Unix epoch
pub(crate) fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
