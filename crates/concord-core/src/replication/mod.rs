//! Replication manager
//!
//! Every role (a coordinator or a participant identity) has one primary
//! WAL and an ordered set of standbys. Records are shipped to each standby
//! in production order: backlog replay first, then the primary's live
//! append stream. A standby's applied sequence never runs ahead of the
//! primary's durable sequence.
//!
//! Durability policy is chosen per role:
//! - active-passive: the primary's own fsync is enough
//! - quorum: a record counts once (n/2)+1 members of the replica set,
//!   primary included, have it

pub mod standby;

pub use standby::{Standby, StandbyState};

use crate::config::{ReplicationConfig, ReplicationPolicy};
use crate::coordinator::DurabilityGate;
use crate::wal::Wal;
use crate::{Error, Result};
use async_trait::async_trait;
use concord_protocol::NodeId;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Polling period of quorum waits
const QUORUM_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// What a role does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RoleKind {
    Coordinator,
    Participant,
}

/// Serializable view of one standby
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StandbyInfo {
    pub node: NodeId,
    pub priority: u32,
    pub applied_sequence: u64,
    pub lag: u64,
    pub state: StandbyState,
    /// Lag exceeds the configured bound
    pub lagging: bool,
}

/// Serializable view of one replica set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaSetInfo {
    pub role: NodeId,
    pub kind: RoleKind,
    pub policy: ReplicationPolicy,
    pub primary: NodeId,
    pub primary_up: bool,
    pub primary_sequence: u64,
    pub standbys: Vec<StandbyInfo>,
}

struct RoleReplication {
    kind: RoleKind,
    policy: ReplicationPolicy,
    primary: NodeId,
    primary_wal: Arc<Wal>,
    primary_up: bool,
    standbys: Vec<Arc<Standby>>,
}

impl RoleReplication {
    fn standby(&self, node: &NodeId) -> Option<&Arc<Standby>> {
        self.standbys.iter().find(|s| &s.node == node)
    }

    fn lag_of(&self, standby: &Standby) -> u64 {
        self.primary_wal
            .durable_sequence()
            .saturating_sub(standby.applied_sequence())
    }
}

/// Owns every replica set of a cluster
pub struct ReplicationManager {
    config: ReplicationConfig,
    roles: RwLock<HashMap<NodeId, RoleReplication>>,
    shutdown: CancellationToken,
}

impl ReplicationManager {
    pub fn new(config: ReplicationConfig, shutdown: &CancellationToken) -> Self {
        Self {
            config,
            roles: RwLock::new(HashMap::new()),
            shutdown: shutdown.child_token(),
        }
    }

    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    /// Configured policy for a kind of role
    pub fn policy_for(&self, kind: RoleKind) -> ReplicationPolicy {
        match kind {
            RoleKind::Coordinator => self.config.coordinator_policy,
            RoleKind::Participant => self.config.participant_policy,
        }
    }

    pub fn register_role(
        &self,
        role: NodeId,
        kind: RoleKind,
        primary: NodeId,
        primary_wal: Arc<Wal>,
        policy: ReplicationPolicy,
    ) {
        tracing::info!(
            "Replicating {} ({:?}, {:?}) from primary {}",
            role,
            kind,
            policy,
            primary
        );
        let previous = self.roles.write().insert(
            role,
            RoleReplication {
                kind,
                policy,
                primary,
                primary_wal,
                primary_up: true,
                standbys: Vec::new(),
            },
        );
        if let Some(previous) = previous {
            for standby in previous.standbys {
                standby.stop();
            }
        }
    }

    /// Add a standby and start shipping to it
    pub fn attach_standby(
        &self,
        role: &NodeId,
        node: NodeId,
        wal: Arc<Wal>,
        priority: u32,
    ) -> Result<()> {
        let mut roles = self.roles.write();
        let rep = roles
            .get_mut(role)
            .ok_or_else(|| Error::not_found(format!("replica set {}", role)))?;
        if rep.primary == node {
            return Err(Error::replication(format!(
                "{} is already the primary of {}",
                node, role
            )));
        }
        if rep.standby(&node).is_some() {
            return Err(Error::replication(format!(
                "{} is already a standby of {}",
                node, role
            )));
        }

        let standby = Standby::new(node.clone(), priority, wal, &self.shutdown);
        if rep.primary_up {
            standby.start(rep.primary_wal.clone());
        }
        tracing::info!(
            "Attached standby {} to {} (priority {}, applied {})",
            node,
            role,
            priority,
            standby.applied_sequence()
        );
        rep.standbys.push(standby);
        Ok(())
    }

    /// Stop shipping from a primary declared down.
    ///
    /// Standbys keep draining what they already received.
    pub fn detach_primary(&self, role: &NodeId) -> Result<NodeId> {
        let mut roles = self.roles.write();
        let rep = roles
            .get_mut(role)
            .ok_or_else(|| Error::not_found(format!("replica set {}", role)))?;
        rep.primary_up = false;
        for standby in &rep.standbys {
            standby.shipping.cancel();
        }
        tracing::warn!("Detached primary {} of {}", rep.primary, role);
        Ok(rep.primary.clone())
    }

    /// Wait until `node` applied everything shipped to it
    pub async fn catch_up(&self, role: &NodeId, node: &NodeId, timeout: Duration) -> Result<u64> {
        let standby = self
            .roles
            .read()
            .get(role)
            .and_then(|r| r.standby(node).cloned())
            .ok_or_else(|| Error::not_found(format!("standby {} of {}", node, role)))?;

        let mut applied = standby.applied.subscribe();
        let drained = async {
            loop {
                if *applied.borrow_and_update() >= standby.shipped_sequence() {
                    return Ok(());
                }
                if standby.state() == StandbyState::Offline {
                    return Err(Error::replication(format!("standby {} went offline", node)));
                }
                if applied.changed().await.is_err() {
                    return Err(Error::replication(format!("standby {} stopped", node)));
                }
            }
        };
        match tokio::time::timeout(timeout, drained).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(Error::timeout(format!(
                    "{} did not catch up on {} within {:?}",
                    node, role, timeout
                )));
            }
        }
        Ok(standby.applied_sequence())
    }

    /// Best promotion candidate: lowest lag, then highest priority
    pub fn select_candidate(&self, role: &NodeId) -> Option<(NodeId, u64)> {
        let roles = self.roles.read();
        let rep = roles.get(role)?;
        rep.standbys
            .iter()
            .filter(|s| s.state() != StandbyState::Offline && !s.wal.is_fenced())
            .map(|s| (s, rep.lag_of(s)))
            .min_by(|(a, lag_a), (b, lag_b)| {
                lag_a
                    .cmp(lag_b)
                    .then(b.priority.cmp(&a.priority))
                    .then(a.node.cmp(&b.node))
            })
            .map(|(s, lag)| (s.node.clone(), lag))
    }

    /// Make `node` the primary of `role`, returning its log.
    ///
    /// Remaining standbys are re-pointed at the new primary; any that ran
    /// ahead of it are resynchronized from scratch.
    pub fn promote(&self, role: &NodeId, node: &NodeId) -> Result<Arc<Wal>> {
        let mut roles = self.roles.write();
        let rep = roles
            .get_mut(role)
            .ok_or_else(|| Error::not_found(format!("replica set {}", role)))?;
        let index = rep
            .standbys
            .iter()
            .position(|s| &s.node == node)
            .ok_or_else(|| Error::not_found(format!("standby {} of {}", node, role)))?;

        let promoted = rep.standbys.remove(index);
        promoted.stop();
        let old_primary = std::mem::replace(&mut rep.primary, node.clone());
        rep.primary_wal = promoted.wal.clone();
        rep.primary_up = true;

        self.repoint_standbys(rep, node);

        tracing::info!(
            "Promoted {} to primary of {} (was {}, log at {})",
            node,
            role,
            old_primary,
            rep.primary_wal.durable_sequence()
        );
        Ok(rep.primary_wal.clone())
    }

    /// Restart shipping to every live standby from the current primary log
    fn repoint_standbys(&self, rep: &mut RoleReplication, primary: &NodeId) {
        let remaining = std::mem::take(&mut rep.standbys);
        for old in remaining {
            old.stop();
            if old.state() == StandbyState::Offline {
                rep.standbys.push(old);
                continue;
            }
            if old.wal.durable_sequence() > rep.primary_wal.durable_sequence() {
                let base = rep.primary_wal.first_sequence().saturating_sub(1);
                tracing::warn!(
                    "Standby {} is ahead of primary {}; resetting to {}",
                    old.node,
                    primary,
                    base
                );
                if let Err(e) = old.wal.reset(base) {
                    tracing::error!("Cannot reset standby {}: {}", old.node, e);
                    old.set_state(StandbyState::Offline);
                    rep.standbys.push(old);
                    continue;
                }
            }
            let standby = Standby::new(
                old.node.clone(),
                old.priority,
                old.wal.clone(),
                &self.shutdown,
            );
            standby.start(rep.primary_wal.clone());
            rep.standbys.push(standby);
        }
    }

    /// Resume a role on its own primary node with a reopened log
    pub fn restart_primary(&self, role: &NodeId, wal: Arc<Wal>) -> Result<()> {
        let mut roles = self.roles.write();
        let rep = roles
            .get_mut(role)
            .ok_or_else(|| Error::not_found(format!("replica set {}", role)))?;
        rep.primary_wal = wal;
        rep.primary_up = true;
        let primary = rep.primary.clone();
        self.repoint_standbys(rep, &primary);
        tracing::info!(
            "Primary {} of {} restarted at {}",
            primary,
            role,
            rep.primary_wal.durable_sequence()
        );
        Ok(())
    }

    pub fn primary_wal(&self, role: &NodeId) -> Option<Arc<Wal>> {
        self.roles.read().get(role).map(|r| r.primary_wal.clone())
    }

    /// Re-add a recovered node as a standby with an empty log
    pub fn resync(&self, role: &NodeId, node: NodeId, wal: Arc<Wal>, priority: u32) -> Result<()> {
        let base = {
            let mut roles = self.roles.write();
            let rep = roles
                .get_mut(role)
                .ok_or_else(|| Error::not_found(format!("replica set {}", role)))?;
            if let Some(index) = rep.standbys.iter().position(|s| s.node == node) {
                let old = rep.standbys.remove(index);
                old.stop();
            }
            rep.primary_wal.first_sequence().saturating_sub(1)
        };

        wal.reset(base)?;
        tracing::info!("Resynchronizing {} as standby of {} from {}", node, role, base);
        self.attach_standby(role, node, wal, priority)
    }

    /// Stop replicating to `node` everywhere; returns the roles affected
    pub fn mark_offline(&self, node: &NodeId) -> Vec<NodeId> {
        let roles = self.roles.read();
        let mut affected: Vec<NodeId> = Vec::new();
        for (role, rep) in roles.iter() {
            if let Some(standby) = rep.standby(node) {
                standby.stop();
                standby.set_state(StandbyState::Offline);
                affected.push(role.clone());
            }
        }
        affected.sort();
        if !affected.is_empty() {
            tracing::warn!("Standby {} offline for {:?}", node, affected);
        }
        affected
    }

    pub fn primary(&self, role: &NodeId) -> Option<NodeId> {
        self.roles.read().get(role).map(|r| r.primary.clone())
    }

    /// Roles whose primary is `node`
    pub fn primaries_on(&self, node: &NodeId) -> Vec<NodeId> {
        let mut roles: Vec<NodeId> = self
            .roles
            .read()
            .iter()
            .filter(|(_, r)| &r.primary == node)
            .map(|(role, _)| role.clone())
            .collect();
        roles.sort();
        roles
    }

    pub fn kind(&self, role: &NodeId) -> Option<RoleKind> {
        self.roles.read().get(role).map(|r| r.kind)
    }

    pub fn replica_set(&self, role: &NodeId) -> Option<ReplicaSetInfo> {
        let roles = self.roles.read();
        let rep = roles.get(role)?;
        let standbys = rep
            .standbys
            .iter()
            .map(|s| {
                let lag = rep.lag_of(s);
                let lagging = lag > self.config.max_lag;
                if lagging {
                    tracing::warn!(
                        "Standby {} of {} lags {} records behind",
                        s.node,
                        role,
                        lag
                    );
                }
                StandbyInfo {
                    node: s.node.clone(),
                    priority: s.priority,
                    applied_sequence: s.applied_sequence(),
                    lag,
                    state: s.state(),
                    lagging,
                }
            })
            .collect();
        Some(ReplicaSetInfo {
            role: role.clone(),
            kind: rep.kind,
            policy: rep.policy,
            primary: rep.primary.clone(),
            primary_up: rep.primary_up,
            primary_sequence: rep.primary_wal.durable_sequence(),
            standbys,
        })
    }

    pub fn replica_sets(&self) -> Vec<ReplicaSetInfo> {
        let mut roles: Vec<NodeId> = self.roles.read().keys().cloned().collect();
        roles.sort();
        roles.iter().filter_map(|r| self.replica_set(r)).collect()
    }

    /// Wait until `sequence` of `role` satisfies the role's policy
    pub async fn wait_durable_within(
        &self,
        role: &NodeId,
        sequence: u64,
        timeout: Duration,
    ) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let (have, need) = {
                let roles = self.roles.read();
                // Unreplicated roles are durable once written locally
                let Some(rep) = roles.get(role) else {
                    return Ok(());
                };
                match rep.policy {
                    ReplicationPolicy::ActivePassive => return Ok(()),
                    ReplicationPolicy::Quorum => {}
                }
                let members = rep.standbys.len() + 1;
                let primary = usize::from(rep.primary_wal.durable_sequence() >= sequence);
                let standbys = rep
                    .standbys
                    .iter()
                    .filter(|s| {
                        s.state() != StandbyState::Offline && s.applied_sequence() >= sequence
                    })
                    .count();
                (primary + standbys, members / 2 + 1)
            };

            if have >= need {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::timeout(format!(
                    "quorum for {} sequence {}: {} of {} required",
                    role, sequence, have, need
                )));
            }
            tokio::time::sleep(QUORUM_POLL_INTERVAL).await;
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
impl DurabilityGate for ReplicationManager {
    async fn wait_durable(&self, role: &NodeId, sequence: u64) -> Result<()> {
        self.wait_durable_within(role, sequence, self.config.quorum_timeout)
            .await
    }
}

impl std::fmt::Debug for ReplicationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationManager")
            .field("roles", &self.roles.read().len())
            .finish()
    }
}
