//! Heartbeat monitor
//!
//! Each registered node gets its own probe task. Probes run on a fixed
//! interval, each bounded by `probe_timeout`; results are folded into the
//! node's [`LivenessRecord`] and every state change is published as a
//! [`LivenessEvent`]. The monitor only reports; reacting is the failover
//! controller's job.

pub mod liveness;

pub use liveness::{LivenessEvent, LivenessRecord, LivenessState};

use crate::config::HeartbeatConfig;
use crate::metrics::Metrics;
use crate::now_ms;
use crate::transport::Probe;
use concord_protocol::NodeId;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Periodic failure detector
pub struct HeartbeatMonitor {
    config: HeartbeatConfig,
    probe: Arc<dyn Probe>,
    records: RwLock<HashMap<NodeId, LivenessRecord>>,
    tasks: Mutex<HashMap<NodeId, CancellationToken>>,
    events: broadcast::Sender<LivenessEvent>,
    metrics: Arc<Metrics>,
    shutdown: CancellationToken,
}

impl HeartbeatMonitor {
    pub fn new(
        config: HeartbeatConfig,
        probe: Arc<dyn Probe>,
        metrics: Arc<Metrics>,
        shutdown: &CancellationToken,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            probe,
            records: RwLock::new(HashMap::new()),
            tasks: Mutex::new(HashMap::new()),
            events,
            metrics,
            shutdown: shutdown.child_token(),
        }
    }

    pub fn config(&self) -> &HeartbeatConfig {
        &self.config
    }

    /// Start monitoring `node`. Registering twice is a no-op.
    pub fn register(self: &Arc<Self>, node: NodeId) {
        let cancel = {
            let mut tasks = self.tasks.lock();
            if tasks.contains_key(&node) {
                return;
            }
            let cancel = self.shutdown.child_token();
            tasks.insert(node.clone(), cancel.clone());
            cancel
        };
        self.records
            .write()
            .insert(node.clone(), LivenessRecord::new(node.clone(), now_ms()));

        tracing::info!(
            "Monitoring {} every {:?} (down after {} misses)",
            node,
            self.config.probe_interval,
            self.config.miss_threshold
        );
        let monitor = self.clone();
        tokio::spawn(async move { monitor.run(node, cancel).await });
    }

    /// Stop monitoring `node` and forget its record
    pub fn decommission(&self, node: &NodeId) -> bool {
        let task = self.tasks.lock().remove(node);
        if let Some(cancel) = &task {
            cancel.cancel();
        }
        let removed = self.records.write().remove(node).is_some();
        if removed {
            tracing::info!("Decommissioned {}", node);
        }
        task.is_some() || removed
    }

    pub fn status(&self, node: &NodeId) -> Option<LivenessState> {
        self.records.read().get(node).map(|r| r.state)
    }

    pub fn record(&self, node: &NodeId) -> Option<LivenessRecord> {
        self.records.read().get(node).cloned()
    }

    pub fn records(&self) -> Vec<LivenessRecord> {
        let mut records: Vec<LivenessRecord> = self.records.read().values().cloned().collect();
        records.sort_by(|a, b| a.node.cmp(&b.node));
        records
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LivenessEvent> {
        self.events.subscribe()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    async fn run(self: Arc<Self>, node: NodeId, cancel: CancellationToken) {
        let interval = self.config.probe_interval;
        // First probe one interval after registration
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let success = matches!(
                tokio::time::timeout(self.config.probe_timeout, self.probe.probe(&node)).await,
                Ok(Ok(()))
            );
            if cancel.is_cancelled() {
                break;
            }
            self.observe(&node, success);
        }
        tracing::debug!("Probe task for {} stopped", node);
    }

    /// Fold one probe result into the record of `node`
    pub fn observe(&self, node: &NodeId, success: bool) -> Option<LivenessEvent> {
        let now = now_ms();
        let (from, to, misses) = {
            let mut records = self.records.write();
            let record = records.get_mut(node)?;
            let (from, to) = record.observe(success, now, self.config.miss_threshold)?;
            (from, to, record.consecutive_misses)
        };

        match to {
            LivenessState::Suspected => {
                Metrics::incr(&self.metrics.liveness_suspected);
                tracing::warn!("{} is SUSPECTED ({} missed probes)", node, misses);
            }
            LivenessState::Down => {
                Metrics::incr(&self.metrics.liveness_down);
                tracing::error!("{} is DOWN after {} missed probes", node, misses);
            }
            LivenessState::Up if from == LivenessState::Down => {
                Metrics::incr(&self.metrics.liveness_recovered);
                tracing::info!("{} recovered; it rejoins as a standby only", node);
            }
            LivenessState::Up => {
                tracing::info!("{} is UP again", node);
            }
        }

        let event = LivenessEvent {
            node: node.clone(),
            from,
            to,
            at_ms: now,
        };
        let _ = self.events.send(event.clone());
        Some(event)
    }
}

impl std::fmt::Debug for HeartbeatMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeartbeatMonitor")
            .field("nodes", &self.records.read().len())
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{LocalNetwork, RoutingTable};
    use std::time::Duration;

    fn monitor(network: Arc<LocalNetwork>) -> Arc<HeartbeatMonitor> {
        Arc::new(HeartbeatMonitor::new(
            HeartbeatConfig::default().with_interval(Duration::from_millis(100), 3),
            network,
            Arc::new(Metrics::new()),
            &CancellationToken::new(),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_node_goes_down() {
        let network = Arc::new(LocalNetwork::new(Arc::new(RoutingTable::new())));
        let _inbox = network.connect("n1".into());
        let monitor = monitor(network.clone());
        let mut events = monitor.subscribe();

        monitor.register("n1".into());
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(monitor.status(&"n1".into()), Some(LivenessState::Up));

        network.set_down(&"n1".into(), true);
        let suspected = events.recv().await.unwrap();
        assert_eq!(suspected.to, LivenessState::Suspected);
        let down = events.recv().await.unwrap();
        assert!(down.is_failure());

        network.set_down(&"n1".into(), false);
        let back = events.recv().await.unwrap();
        assert!(back.is_recovery());
    }

    #[tokio::test]
    async fn test_observe_without_task() {
        let network = Arc::new(LocalNetwork::new(Arc::new(RoutingTable::new())));
        let monitor = monitor(network);
        monitor
            .records
            .write()
            .insert("n1".into(), LivenessRecord::new("n1".into(), 0));

        assert!(monitor.observe(&"n1".into(), true).is_none());
        let event = monitor.observe(&"n1".into(), false).unwrap();
        assert_eq!(event.to, LivenessState::Suspected);
        assert!(monitor.observe(&"unknown".into(), false).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_decommission_stops_probing() {
        let network = Arc::new(LocalNetwork::new(Arc::new(RoutingTable::new())));
        let monitor = monitor(network);
        monitor.register("n1".into());
        assert!(monitor.decommission(&"n1".into()));
        assert!(monitor.status(&"n1".into()).is_none());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(monitor.records().is_empty());
        assert!(!monitor.decommission(&"n1".into()));
    }
}
