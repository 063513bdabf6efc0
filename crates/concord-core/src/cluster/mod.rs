//! Cluster control surface
//!
//! Assembles nodes, logs, heartbeat monitoring, replication and failover
//! into one running system on an in-process network:
//!
//! ```text
//! ClusterBuilder::build()
//!   ├─ Node per physical id (inbox → RoleHandler dispatch)
//!   ├─ ReplicationManager (one replica set per role)
//!   ├─ HeartbeatMonitor ──LivenessEvent──┐
//!   └─ Coordinator ──CoordinatorEvent────┴─▶ FailoverController
//! ```
//!
//! Failures are injected per node; a recovered node rejoins as a standby
//! unless it still holds its roles (no failover happened).

pub mod topology;

pub use topology::{NodeView, TopologySnapshot};

use crate::config::ClusterConfig;
use crate::coordinator::{Coordinator, CoordinatorEvent, DurabilityGate, TxnStatus};
use crate::failover::{FailoverController, FailoverJournal, RolePromoter};
use crate::heartbeat::HeartbeatMonitor;
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::node::{Node, RoleHandler};
use crate::participant::{MemoryStore, ParticipantAgent};
use crate::replication::{ReplicationManager, RoleKind};
use crate::transport::{LocalNetwork, RoutingTable, Transport};
use crate::wal::Wal;
use crate::{Error, Result, now_ms};
use async_trait::async_trait;
use concord_protocol::{NodeId, Outcome, Payload, TxnId};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast::error::RecvError, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Slice of a cluster-level outcome wait spent on one coordinator instance
const OUTCOME_POLL_SLICE: Duration = Duration::from_millis(50);
const OUTCOME_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Placement of one role
#[derive(Debug, Clone)]
struct RoleSpec {
    role: NodeId,
    kind: RoleKind,
    primary: NodeId,
    standbys: Vec<(NodeId, u32)>,
}

impl RoleSpec {
    fn members(&self) -> impl Iterator<Item = &NodeId> {
        std::iter::once(&self.primary).chain(self.standbys.iter().map(|(n, _)| n))
    }

    /// Priority `node` rejoins with; a former primary ranks last
    fn priority_of(&self, node: &NodeId) -> u32 {
        self.standbys
            .iter()
            .find(|(n, _)| n == node)
            .map(|(_, p)| *p)
            .unwrap_or(0)
    }
}

/// Builder for [`Cluster`]
#[derive(Debug, Default)]
pub struct ClusterBuilder {
    config: ClusterConfig,
    data_dir: Option<PathBuf>,
    coordinator: Option<RoleSpec>,
    participants: Vec<RoleSpec>,
}

impl ClusterBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: ClusterConfig) -> Self {
        self.config = config;
        self
    }

    /// Keep logs and the failover journal under `dir` instead of memory
    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    /// Place the coordinator role on `node` with the given standbys
    pub fn coordinator(
        mut self,
        role: impl Into<NodeId>,
        node: impl Into<NodeId>,
        standbys: &[(&str, u32)],
    ) -> Self {
        self.coordinator = Some(role_spec(role, node, RoleKind::Coordinator, standbys));
        self
    }

    /// Place a participant role on `node` with the given standbys
    pub fn participant(
        mut self,
        role: impl Into<NodeId>,
        node: impl Into<NodeId>,
        standbys: &[(&str, u32)],
    ) -> Self {
        self.participants
            .push(role_spec(role, node, RoleKind::Participant, standbys));
        self
    }

    /// Start every node and role
    pub async fn build(self) -> Result<Cluster> {
        self.config.validate().map_err(Error::config)?;
        let coordinator = self
            .coordinator
            .ok_or_else(|| Error::config("a cluster needs a coordinator role"))?;
        let mut seen = BTreeSet::new();
        for spec in std::iter::once(&coordinator).chain(&self.participants) {
            if !seen.insert(spec.role.clone()) {
                return Err(Error::config(format!("role {} placed twice", spec.role)));
            }
        }

        let shutdown = CancellationToken::new();
        let routing = Arc::new(RoutingTable::new());
        let network = Arc::new(LocalNetwork::new(routing.clone()));
        let metrics = Arc::new(Metrics::new());
        let replication = Arc::new(ReplicationManager::new(
            self.config.replication.clone(),
            &shutdown,
        ));
        let heartbeat = Arc::new(HeartbeatMonitor::new(
            self.config.heartbeat.clone(),
            network.clone(),
            metrics.clone(),
            &shutdown,
        ));
        let (hints_tx, hints_rx) = mpsc::unbounded_channel();

        let mut specs = self.participants;
        specs.push(coordinator.clone());

        let host = Arc::new(RoleHost {
            config: self.config.clone(),
            data_dir: self.data_dir.clone(),
            network,
            routing: routing.clone(),
            replication: replication.clone(),
            metrics: metrics.clone(),
            nodes: RwLock::new(BTreeMap::new()),
            crashed: RwLock::new(BTreeSet::new()),
            specs,
            coordinator_role: coordinator.role.clone(),
            hints: hints_tx,
            shutdown: shutdown.clone(),
        });

        let node_ids: BTreeSet<NodeId> = host
            .specs
            .iter()
            .flat_map(|s| s.members().cloned())
            .collect();
        for id in &node_ids {
            host.start_node(id.clone());
        }

        // Participants first so the coordinator's redelivery finds them
        for spec in &host.specs {
            routing.set(spec.role.clone(), spec.primary.clone());
            let wal = host.open_wal(&spec.primary, &spec.role)?;
            replication.register_role(
                spec.role.clone(),
                spec.kind,
                spec.primary.clone(),
                wal.clone(),
                replication.policy_for(spec.kind),
            );
            for (standby, priority) in &spec.standbys {
                let standby_wal = host.open_wal(standby, &spec.role)?;
                replication.resync(&spec.role, standby.clone(), standby_wal, *priority)?;
            }
            host.start_role(&spec.role, spec.kind, &spec.primary, wal)?;
        }

        let journal = match &self.data_dir {
            Some(dir) => FailoverJournal::open(dir.join("failover.journal"))?,
            None => FailoverJournal::in_memory(),
        };
        let failover = Arc::new(FailoverController::new(
            self.config.failover.clone(),
            journal,
            replication,
            routing,
            heartbeat.clone(),
            host.clone(),
            metrics,
        ));
        for outcome in failover.resume().await {
            tracing::info!("Resumed failover: {:?}", outcome);
        }

        let liveness = heartbeat.subscribe();
        tokio::spawn(
            failover
                .clone()
                .run_events(liveness, hints_rx, shutdown.child_token()),
        );
        for id in node_ids {
            heartbeat.register(id);
        }

        tracing::info!(
            "Cluster started with {} roles on {} nodes",
            host.specs.len(),
            host.nodes.read().len()
        );
        Ok(Cluster {
            config: self.config,
            host,
            heartbeat,
            failover,
            shutdown,
        })
    }
}

fn role_spec(
    role: impl Into<NodeId>,
    node: impl Into<NodeId>,
    kind: RoleKind,
    standbys: &[(&str, u32)],
) -> RoleSpec {
    RoleSpec {
        role: role.into(),
        kind,
        primary: node.into(),
        standbys: standbys
            .iter()
            .map(|(n, p)| (NodeId::from(*n), *p))
            .collect(),
    }
}

/// Starts roles on nodes; shared by the cluster and the failover controller
struct RoleHost {
    config: ClusterConfig,
    data_dir: Option<PathBuf>,
    network: Arc<LocalNetwork>,
    routing: Arc<RoutingTable>,
    replication: Arc<ReplicationManager>,
    metrics: Arc<Metrics>,
    nodes: RwLock<BTreeMap<NodeId, Arc<Node>>>,
    crashed: RwLock<BTreeSet<NodeId>>,
    specs: Vec<RoleSpec>,
    coordinator_role: NodeId,
    hints: mpsc::UnboundedSender<CoordinatorEvent>,
    shutdown: CancellationToken,
}

impl RoleHost {
    fn node(&self, id: &NodeId) -> Result<Arc<Node>> {
        if self.crashed.read().contains(id) {
            return Err(Error::Unreachable(id.clone()));
        }
        self.nodes
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("node {}", id)))
    }

    /// Create a node with a fresh inbox and start dispatching
    fn start_node(&self, id: NodeId) -> Arc<Node> {
        let transport: Arc<dyn Transport> = self.network.clone();
        let node = Arc::new(Node::new(id.clone(), transport, &self.shutdown));
        let inbox = self.network.connect(id.clone());
        tokio::spawn(node.clone().run(inbox));
        self.nodes.write().insert(id, node.clone());
        node
    }

    fn wal_path(dir: &Path, node: &NodeId, role: &NodeId) -> PathBuf {
        dir.join(node.as_str()).join(format!("{}.wal", role))
    }

    fn open_wal(&self, node: &NodeId, role: &NodeId) -> Result<Arc<Wal>> {
        let wal = match &self.data_dir {
            Some(dir) => {
                let path = Self::wal_path(dir, node, role);
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                Wal::open(path, self.config.wal.clone())?
            }
            None => Wal::in_memory(format!("{}/{}", node, role)),
        };
        Ok(Arc::new(wal.with_metrics(self.metrics.clone())))
    }

    /// Log for a primary restarting on its own node after a crash
    fn reopen_wal(&self, node: &NodeId, role: &NodeId) -> Result<Arc<Wal>> {
        if self.data_dir.is_some() {
            return self.open_wal(node, role);
        }
        let wal = self.open_wal(node, role)?;
        if let Some(previous) = self.replication.primary_wal(role) {
            for record in previous.replay(0)? {
                wal.append_replicated(record)?;
            }
        }
        Ok(wal)
    }

    fn start_role(&self, role: &NodeId, kind: RoleKind, node: &NodeId, wal: Arc<Wal>) -> Result<()> {
        match kind {
            RoleKind::Coordinator => self.start_coordinator(role, node, wal),
            RoleKind::Participant => self.start_participant(role, node, wal),
        }
    }

    fn start_coordinator(&self, role: &NodeId, node_id: &NodeId, wal: Arc<Wal>) -> Result<()> {
        let node = self.node(node_id)?;
        let transport: Arc<dyn Transport> = self.network.clone();
        let durability: Arc<dyn DurabilityGate> = self.replication.clone();
        let coordinator = Arc::new(Coordinator::new(
            role.clone(),
            self.config.coordinator.clone(),
            wal,
            transport,
            durability,
            self.metrics.clone(),
            node.token(),
        ));

        let mut events = coordinator.subscribe();
        let hints = self.hints.clone();
        let cancel = node.token().clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    biased;
                    // A crashed node reports nothing
                    _ = cancel.cancelled() => break,
                    event = events.recv() => event,
                };
                match event {
                    Ok(event) => {
                        if hints.send(event).is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!("Dropped {} coordinator events", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        node.host(role.clone(), RoleHandler::Coordinator(coordinator.clone()));
        let report = coordinator.recover()?;
        tracing::info!(
            "{} serving {} ({} transactions resumed, {} aborted)",
            node_id,
            role,
            report.resumed.len(),
            report.aborted.len()
        );
        Ok(())
    }

    fn start_participant(&self, role: &NodeId, node_id: &NodeId, wal: Arc<Wal>) -> Result<()> {
        let node = self.node(node_id)?;
        let transport: Arc<dyn Transport> = self.network.clone();
        let agent = Arc::new(ParticipantAgent::new(
            role.clone(),
            self.coordinator_role.clone(),
            self.config.participant.clone(),
            wal,
            Arc::new(MemoryStore::new()),
            transport,
            self.metrics.clone(),
        ));
        let report = agent.recover()?;
        node.host(role.clone(), RoleHandler::Participant(agent.clone()));
        tokio::spawn(agent.run_in_doubt_resolver(node.token().child_token()));
        tracing::info!(
            "{} serving {} ({} in doubt)",
            node_id,
            role,
            report.in_doubt.len()
        );
        Ok(())
    }

    /// Live coordinator instance, wherever it is routed
    fn coordinator(&self) -> Option<Arc<Coordinator>> {
        let node = self.routing.resolve(&self.coordinator_role);
        self.nodes
            .read()
            .get(&node)
            .and_then(|n| n.coordinator(&self.coordinator_role))
    }

    fn participant(&self, role: &NodeId) -> Option<Arc<ParticipantAgent>> {
        let node = self.routing.resolve(role);
        self.nodes.read().get(&node).and_then(|n| n.participant(role))
    }
}

#[async_trait]
impl RolePromoter for RoleHost {
    async fn promote(
        &self,
        role: &NodeId,
        kind: RoleKind,
        node: &NodeId,
        wal: Arc<Wal>,
    ) -> Result<()> {
        self.start_role(role, kind, node, wal)
    }

    async fn redirected(&self, role: &NodeId) {
        if role == &self.coordinator_role {
            let participants: Vec<Arc<ParticipantAgent>> = self
                .specs
                .iter()
                .filter(|s| s.kind == RoleKind::Participant)
                .filter_map(|s| self.participant(&s.role))
                .collect();
            for agent in participants {
                agent.query_in_doubt().await;
            }
        } else if let Some(coordinator) = self.coordinator() {
            coordinator.redeliver().await;
        }
    }
}

/// A running cluster
pub struct Cluster {
    config: ClusterConfig,
    host: Arc<RoleHost>,
    heartbeat: Arc<HeartbeatMonitor>,
    failover: Arc<FailoverController>,
    shutdown: CancellationToken,
}

impl Cluster {
    pub fn builder() -> ClusterBuilder {
        ClusterBuilder::new()
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn network(&self) -> &Arc<LocalNetwork> {
        &self.host.network
    }

    pub fn routing(&self) -> &Arc<RoutingTable> {
        &self.host.routing
    }

    pub fn replication(&self) -> &Arc<ReplicationManager> {
        &self.host.replication
    }

    pub fn heartbeat(&self) -> &Arc<HeartbeatMonitor> {
        &self.heartbeat
    }

    pub fn failover(&self) -> &Arc<FailoverController> {
        &self.failover
    }

    pub fn coordinator_role(&self) -> &NodeId {
        &self.host.coordinator_role
    }

    /// The coordinator currently serving
    pub fn coordinator(&self) -> Result<Arc<Coordinator>> {
        let role = &self.host.coordinator_role;
        if self.failover.is_unavailable(role) {
            return Err(Error::unavailable(role.to_string()));
        }
        self.host
            .coordinator()
            .filter(|c| c.is_serving())
            .ok_or_else(|| Error::unavailable(role.to_string()))
    }

    /// The agent currently serving a participant role
    pub fn participant(&self, role: &NodeId) -> Option<Arc<ParticipantAgent>> {
        self.host.participant(role)
    }

    /// Start a transaction executing `payloads[p]` at each participant `p`
    pub fn begin_transaction(&self, payloads: BTreeMap<NodeId, Payload>) -> Result<TxnId> {
        if let Some(role) = payloads.keys().find(|r| self.failover.is_unavailable(r)) {
            return Err(Error::unavailable(role.to_string()));
        }
        self.coordinator()?.begin_with_payloads(payloads)
    }

    /// Abort a transaction that has not committed
    pub fn abort_transaction(&self, txn: TxnId) -> Result<()> {
        self.coordinator()?.abort(txn)
    }

    pub fn transaction_status(&self, txn: TxnId) -> Option<TxnStatus> {
        self.coordinator().ok()?.status(txn)
    }

    /// Wait up to `timeout` for a terminal outcome, following the
    /// coordinator role across failovers
    pub async fn wait_for_outcome(&self, txn: TxnId, timeout: Duration) -> Result<Outcome> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let slice = remaining.min(OUTCOME_POLL_SLICE);
            let result = match self.coordinator() {
                Ok(coordinator) => coordinator.wait_for_outcome(txn, slice).await,
                Err(e) => Err(e),
            };
            if Instant::now() >= deadline {
                return result;
            }
            match result {
                Ok(Outcome::InProgress) => {}
                // Between failover steps, or not yet recovered by a new holder
                Err(_) => tokio::time::sleep(OUTCOME_RETRY_DELAY.min(slice)).await,
                done => return done,
            }
        }
    }

    /// Crash `node`: it stops answering probes and every role it hosts
    /// stops writing
    pub fn inject_failure(&self, node: &NodeId) -> Result<()> {
        let handle = self.host.node(node)?;
        tracing::warn!("Injecting failure of {}", node);
        self.host.network.set_down(node, true);
        self.host.crashed.write().insert(node.clone());
        handle.crash();
        // The replication stream to a dead process breaks at once
        self.host.replication.mark_offline(node);
        Ok(())
    }

    /// Restart a crashed node.
    ///
    /// Roles it still holds (no failover took place) restart in place from
    /// their logs; for every other role it rejoins as a standby.
    pub fn recover_node(&self, node: &NodeId) -> Result<()> {
        if !self.host.crashed.read().contains(node) {
            return Err(Error::not_found(format!("crashed node {}", node)));
        }
        tracing::info!("Recovering {}", node);
        self.host.crashed.write().remove(node);
        self.host.start_node(node.clone());
        self.host.network.set_down(node, false);

        let member_of: Vec<&RoleSpec> = self
            .host
            .specs
            .iter()
            .filter(|s| s.members().any(|m| m == node))
            .collect();
        for spec in member_of {
            let replication = &self.host.replication;
            if replication.primary(&spec.role).as_ref() == Some(node) {
                let wal = self.host.reopen_wal(node, &spec.role)?;
                replication.restart_primary(&spec.role, wal.clone())?;
                self.host.start_role(&spec.role, spec.kind, node, wal)?;
                self.host.routing.set(spec.role.clone(), node.clone());
                self.failover.mark_available(&spec.role);
            } else {
                let wal = self.host.open_wal(node, &spec.role)?;
                replication.resync(&spec.role, node.clone(), wal, spec.priority_of(node))?;
            }
        }
        Ok(())
    }

    pub fn topology_snapshot(&self) -> TopologySnapshot {
        let crashed = self.host.crashed.read().clone();
        let nodes = self
            .host
            .nodes
            .read()
            .iter()
            .map(|(id, node)| {
                let record = self.heartbeat.record(id);
                NodeView {
                    id: id.clone(),
                    liveness: record.as_ref().map(|r| r.state),
                    consecutive_misses: record.as_ref().map_or(0, |r| r.consecutive_misses),
                    last_success_ms: record.and_then(|r| r.last_success_ms),
                    crashed: crashed.contains(id),
                    roles: if crashed.contains(id) {
                        Vec::new()
                    } else {
                        node.roles()
                    },
                }
            })
            .collect();

        TopologySnapshot {
            taken_at_ms: now_ms(),
            nodes,
            routes: self.host.routing.routes(),
            routing_generation: self.host.routing.generation(),
            replica_sets: self.host.replication.replica_sets(),
            unavailable: self.failover.unavailable_roles(),
        }
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.host.metrics.snapshot()
    }

    /// Stop every task of the cluster
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("coordinator", &self.host.coordinator_role)
            .field("nodes", &self.host.nodes.read().keys().collect::<Vec<_>>())
            .finish()
    }
}
