//! Configuration for every component of a node
//!
//! All structs are plain serde types with defaults; loading them from
//! files or the environment is left to the embedding application.

use crate::retry::RetryConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Replication policy for a role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicationPolicy {
    /// One primary, standbys apply records and serve nothing until promoted
    ActivePassive,
    /// A write is durable once applied by a majority of the replica set
    Quorum,
}

/// Write-ahead log settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WalConfig {
    /// fsync every append before returning
    pub sync_on_append: bool,
    /// Largest accepted encoded record
    pub max_record_bytes: usize,
    /// Minimum age of a retired transaction before compaction drops it.
    /// Zero compacts as soon as every participant acknowledged.
    #[serde(with = "serde_millis")]
    pub retention: Duration,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            sync_on_append: true,
            max_record_bytes: 4 * 1024 * 1024,
            retention: Duration::ZERO,
        }
    }
}

impl WalConfig {
    /// Keep retired transactions for at least `retention`
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.max_record_bytes < 64 {
            return Err("max_record_bytes must be at least 64".into());
        }
        Ok(())
    }
}

/// Transaction coordinator settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Shard number encoded into every transaction id
    pub shard: u16,
    /// Deadline for collecting votes
    #[serde(with = "serde_millis")]
    pub phase1_timeout: Duration,
    /// Deadline for collecting acknowledgments
    #[serde(with = "serde_millis")]
    pub phase2_timeout: Duration,
    /// Backoff between decision redeliveries
    pub redelivery: RetryConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            shard: 0,
            phase1_timeout: Duration::from_secs(5),
            phase2_timeout: Duration::from_secs(5),
            redelivery: RetryConfig {
                max_attempts: u32::MAX,
                initial_delay: Duration::from_millis(200),
                max_delay: Duration::from_secs(2),
                backoff_multiplier: 2.0,
                jitter_factor: 0.1,
            },
        }
    }
}

impl CoordinatorConfig {
    /// Set the shard
    pub fn with_shard(mut self, shard: u16) -> Self {
        self.shard = shard;
        self
    }

    /// Set both phase deadlines
    pub fn with_timeouts(mut self, phase1: Duration, phase2: Duration) -> Self {
        self.phase1_timeout = phase1;
        self.phase2_timeout = phase2;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.phase1_timeout.is_zero() {
            return Err("phase1_timeout must be positive".into());
        }
        if self.phase2_timeout.is_zero() {
            return Err("phase2_timeout must be positive".into());
        }
        self.redelivery.validate()
    }
}

/// Participant agent settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParticipantConfig {
    /// How long a voted-but-undecided transaction may wait for the
    /// coordinator before the participant aborts it unilaterally
    #[serde(with = "serde_millis")]
    pub decision_timeout: Duration,
    /// Period of the in-doubt resolver
    #[serde(with = "serde_millis")]
    pub resolve_interval: Duration,
}

impl Default for ParticipantConfig {
    fn default() -> Self {
        Self {
            decision_timeout: Duration::from_secs(30),
            resolve_interval: Duration::from_secs(2),
        }
    }
}

impl ParticipantConfig {
    /// Set the decision timeout
    pub fn with_decision_timeout(mut self, timeout: Duration) -> Self {
        self.decision_timeout = timeout;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.resolve_interval.is_zero() {
            return Err("resolve_interval must be positive".into());
        }
        Ok(())
    }
}

/// Heartbeat monitor settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Time between probes of one node
    #[serde(with = "serde_millis")]
    pub probe_interval: Duration,
    /// Bound on a single probe
    #[serde(with = "serde_millis")]
    pub probe_timeout: Duration,
    /// Consecutive misses before a node is DOWN
    pub miss_threshold: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(1),
            probe_timeout: Duration::from_millis(500),
            miss_threshold: 3,
        }
    }
}

impl HeartbeatConfig {
    /// Set interval and threshold
    pub fn with_interval(mut self, interval: Duration, miss_threshold: u32) -> Self {
        self.probe_interval = interval;
        self.probe_timeout = self.probe_timeout.min(interval / 2);
        self.miss_threshold = miss_threshold;
        self
    }

    /// Upper bound on detection latency, excluding jitter
    pub fn detection_window(&self) -> Duration {
        self.probe_interval * self.miss_threshold
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.miss_threshold == 0 {
            return Err("miss_threshold must be at least 1".into());
        }
        if self.probe_interval.is_zero() {
            return Err("probe_interval must be positive".into());
        }
        if self.probe_timeout > self.probe_interval {
            return Err("probe_timeout must not exceed probe_interval".into());
        }
        Ok(())
    }
}

/// Replication settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Policy for coordinator roles
    pub coordinator_policy: ReplicationPolicy,
    /// Policy for participant roles
    pub participant_policy: ReplicationPolicy,
    /// Bound on a single quorum wait before it is retried
    #[serde(with = "serde_millis")]
    pub quorum_timeout: Duration,
    /// Lag (in records) above which a standby is reported as lagging
    pub max_lag: u64,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            coordinator_policy: ReplicationPolicy::Quorum,
            participant_policy: ReplicationPolicy::ActivePassive,
            quorum_timeout: Duration::from_secs(2),
            max_lag: 1_000,
        }
    }
}

impl ReplicationConfig {
    /// Set coordinator policy
    pub fn with_coordinator_policy(mut self, policy: ReplicationPolicy) -> Self {
        self.coordinator_policy = policy;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.quorum_timeout.is_zero() {
            return Err("quorum_timeout must be positive".into());
        }
        Ok(())
    }
}

/// Failover controller settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailoverConfig {
    /// React to DOWN events automatically
    pub auto_failover: bool,
    /// Bound on the catch-up step
    #[serde(with = "serde_millis")]
    pub catch_up_timeout: Duration,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            auto_failover: true,
            catch_up_timeout: Duration::from_secs(5),
        }
    }
}

impl FailoverConfig {
    /// Enable/disable auto failover
    pub fn with_auto_failover(mut self, enabled: bool) -> Self {
        self.auto_failover = enabled;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.catch_up_timeout.is_zero() {
            return Err("catch_up_timeout must be positive".into());
        }
        Ok(())
    }
}

/// Aggregate configuration for a cluster
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub wal: WalConfig,
    pub coordinator: CoordinatorConfig,
    pub participant: ParticipantConfig,
    pub heartbeat: HeartbeatConfig,
    pub replication: ReplicationConfig,
    pub failover: FailoverConfig,
}

impl ClusterConfig {
    /// Validate every section plus the constraints between them
    pub fn validate(&self) -> Result<(), String> {
        self.wal.validate()?;
        self.coordinator.validate()?;
        self.participant.validate()?;
        self.heartbeat.validate()?;
        self.replication.validate()?;
        self.failover.validate()?;

        // A participant may vote at the start of phase 1; it must outwait
        // the whole voting window plus the acknowledgment window.
        let window = self.coordinator.phase1_timeout + self.coordinator.phase2_timeout;
        if self.participant.decision_timeout <= window {
            return Err(format!(
                "participant decision_timeout ({:?}) must be longer than coordinator phase1_timeout + phase2_timeout ({:?})",
                self.participant.decision_timeout, window
            ));
        }

        Ok(())
    }
}
