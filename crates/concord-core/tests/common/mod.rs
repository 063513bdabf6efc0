//! Shared helpers for integration tests

#![allow(dead_code)]

use concord_core::config::{ClusterConfig, HeartbeatConfig};
use concord_core::{Cluster, Coordinator};
use concord_protocol::{NodeId, Operation, Payload, TxnState};
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Install a test subscriber once; `RUST_LOG` controls verbosity
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Timings short enough to drive failover within a test
pub fn fast_config() -> ClusterConfig {
    let mut config = ClusterConfig::default();
    config.heartbeat = HeartbeatConfig::default().with_interval(Duration::from_millis(50), 3);
    config.coordinator.phase1_timeout = Duration::from_secs(10);
    config.coordinator.phase2_timeout = Duration::from_millis(500);
    config.coordinator.redelivery.initial_delay = Duration::from_millis(20);
    config.coordinator.redelivery.max_delay = Duration::from_millis(100);
    config.replication.quorum_timeout = Duration::from_millis(200);
    config.failover.catch_up_timeout = Duration::from_secs(2);
    config
}

/// One `Put` per participant role
pub fn puts(roles: &[&str]) -> BTreeMap<NodeId, Payload> {
    roles
        .iter()
        .map(|role| {
            (
                NodeId::from(*role),
                vec![Operation::put(format!("{}-key", role), role.as_bytes().to_vec())],
            )
        })
        .collect()
}

/// Poll `check` every 10ms until it holds or `timeout` passes
pub async fn eventually<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Like [`eventually`] for an async check
pub async fn eventually_async<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Coordinator state of `txn` in the currently serving coordinator
pub fn state_of(cluster: &Cluster, txn: concord_protocol::TxnId) -> Option<TxnState> {
    cluster.transaction_status(txn).map(|s| s.state)
}

pub fn serving_coordinator(cluster: &Cluster) -> Option<std::sync::Arc<Coordinator>> {
    cluster.coordinator().ok()
}
