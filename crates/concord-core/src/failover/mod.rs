//! Failover controller
//!
//! Reacts to DOWN events from the heartbeat monitor (and to unresponsive
//! participant hints from coordinators) by moving every role the failed
//! node held as primary onto its best standby. Each failover walks
//!
//! ```text
//! Detected → Selected → CaughtUp → Promoted → Redirected
//!     └──────────┴── Abandoned (no usable standby)
//! ```
//!
//! and journals every step before taking the next one, so
//! [`FailoverController::resume`] can finish an interrupted failover.
//! A journaled failover only resumes while its failed node is still
//! known to be down; otherwise the old primary keeps the role.

pub mod journal;

pub use journal::{FailoverEntry, FailoverJournal, FailoverStep, PendingFailover};

use crate::config::FailoverConfig;
use crate::coordinator::CoordinatorEvent;
use crate::heartbeat::{HeartbeatMonitor, LivenessEvent, LivenessState};
use crate::metrics::Metrics;
use crate::replication::{ReplicationManager, RoleKind};
use crate::transport::RoutingTable;
use crate::wal::Wal;
use crate::{Error, Result};
use async_trait::async_trait;
use concord_protocol::NodeId;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Instantiates roles on promoted nodes
#[async_trait]
pub trait RolePromoter: Send + Sync {
    /// Start `role` on `node` from its replicated log and recover it
    async fn promote(&self, role: &NodeId, kind: RoleKind, node: &NodeId, wal: Arc<Wal>)
    -> Result<()>;

    /// Routing for `role` changed
    async fn redirected(&self, role: &NodeId);
}

/// How a failover request ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailoverOutcome {
    Completed { role: NodeId, promoted: NodeId },
    Abandoned { role: NodeId, reason: String },
    /// A journaled failover was dropped on resume because the failed
    /// node still holds the role
    Cancelled { role: NodeId, reason: String },
    /// Another failover of the role is running, or the node no longer
    /// holds it
    Skipped,
}

/// Moves roles off failed nodes
pub struct FailoverController {
    config: FailoverConfig,
    journal: FailoverJournal,
    replication: Arc<ReplicationManager>,
    routing: Arc<RoutingTable>,
    heartbeat: Arc<HeartbeatMonitor>,
    promoter: Arc<dyn RolePromoter>,
    metrics: Arc<Metrics>,
    in_progress: Mutex<HashSet<NodeId>>,
    unavailable: RwLock<BTreeSet<NodeId>>,
}

impl FailoverController {
    pub fn new(
        config: FailoverConfig,
        journal: FailoverJournal,
        replication: Arc<ReplicationManager>,
        routing: Arc<RoutingTable>,
        heartbeat: Arc<HeartbeatMonitor>,
        promoter: Arc<dyn RolePromoter>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            config,
            journal,
            replication,
            routing,
            heartbeat,
            promoter,
            metrics,
            in_progress: Mutex::new(HashSet::new()),
            unavailable: RwLock::new(BTreeSet::new()),
        }
    }

    pub fn journal(&self) -> &FailoverJournal {
        &self.journal
    }

    /// Roles left without a live holder
    pub fn unavailable_roles(&self) -> Vec<NodeId> {
        self.unavailable.read().iter().cloned().collect()
    }

    pub fn is_unavailable(&self, role: &NodeId) -> bool {
        self.unavailable.read().contains(role)
    }

    /// The role has a live holder again
    pub fn mark_available(&self, role: &NodeId) {
        if self.unavailable.write().remove(role) {
            tracing::info!("{} is available again", role);
        }
    }

    /// React to a liveness transition
    pub async fn on_liveness(&self, event: &LivenessEvent) -> Vec<FailoverOutcome> {
        if event.is_recovery() {
            tracing::info!(
                "{} is reachable again; it can only rejoin as a standby",
                event.node
            );
            return Vec::new();
        }
        if !event.is_failure() {
            return Vec::new();
        }

        self.replication.mark_offline(&event.node);

        let roles = self.replication.primaries_on(&event.node);
        if roles.is_empty() {
            return Vec::new();
        }
        if !self.config.auto_failover {
            tracing::warn!(
                "{} is DOWN holding {:?}; automatic failover is disabled",
                event.node,
                roles
            );
            return Vec::new();
        }

        let mut outcomes = Vec::with_capacity(roles.len());
        for role in roles {
            outcomes.push(self.fail_over(&role, &event.node).await);
        }
        outcomes
    }

    /// React to a coordinator notification
    pub async fn on_coordinator_event(&self, event: &CoordinatorEvent) -> Option<FailoverOutcome> {
        match event {
            CoordinatorEvent::ParticipantUnresponsive { txn, participant } => {
                let node = self.routing.resolve(participant);
                match self.heartbeat.status(&node) {
                    Some(LivenessState::Up) | None => {
                        tracing::debug!(
                            "{} on {} missed the deadline for {} but is UP; delivery keeps retrying",
                            participant,
                            node,
                            txn
                        );
                        None
                    }
                    Some(state @ (LivenessState::Suspected | LivenessState::Down)) => {
                        if !self.config.auto_failover {
                            return None;
                        }
                        tracing::warn!(
                            "{} on {} is {} and unresponsive for {}",
                            participant,
                            node,
                            state,
                            txn
                        );
                        Some(self.fail_over(participant, &node).await)
                    }
                }
            }
            CoordinatorEvent::Fenced { role } => {
                if !self.config.auto_failover {
                    return None;
                }
                let node = self.routing.resolve(role);
                Some(self.fail_over(role, &node).await)
            }
        }
    }

    /// Move `role` off `failed` onto its best standby
    pub async fn fail_over(&self, role: &NodeId, failed: &NodeId) -> FailoverOutcome {
        if self.replication.primary(role).as_ref() != Some(failed) {
            return FailoverOutcome::Skipped;
        }
        if !self.in_progress.lock().insert(role.clone()) {
            return FailoverOutcome::Skipped;
        }

        let failover_id = Uuid::new_v4();
        Metrics::incr(&self.metrics.failovers_started);
        tracing::warn!("Starting failover {} of {} from {}", failover_id, role, failed);

        let step = FailoverStep::Detected {
            failed: failed.clone(),
        };
        let outcome = match self.journal.record(failover_id, role, step.clone()) {
            Ok(()) => self.run(failover_id, role, vec![step]).await,
            Err(e) => self.abandon(failover_id, role, format!("journal write failed: {}", e)),
        };

        self.in_progress.lock().remove(role);
        outcome
    }

    /// Finish every journaled failover that did not reach a terminal step
    pub async fn resume(&self) -> Vec<FailoverOutcome> {
        let mut outcomes = Vec::new();
        for pending in self.journal.pending() {
            if !self.in_progress.lock().insert(pending.role.clone()) {
                continue;
            }
            let outcome = match self.stale_reason(&pending) {
                Some(reason) => self.cancel(pending.failover_id, &pending.role, reason),
                None => {
                    tracing::info!(
                        "Resuming failover {} of {} after {:?}",
                        pending.failover_id,
                        pending.role,
                        pending.steps.last().map(|s| s.name())
                    );
                    self.run(pending.failover_id, &pending.role, pending.steps)
                        .await
                }
            };
            self.in_progress.lock().remove(&pending.role);
            outcomes.push(outcome);
        }
        outcomes
    }

    /// Why a journaled failover must not continue, if it must not
    fn stale_reason(&self, pending: &PendingFailover) -> Option<String> {
        let failed = pending.steps.iter().find_map(|s| match s {
            FailoverStep::Detected { failed } => Some(failed),
            _ => None,
        });
        let Some(failed) = failed else {
            return Some("no detection in the journal".to_string());
        };
        if self.replication.primary(&pending.role).as_ref() != Some(failed) {
            return Some(format!("{} no longer holds {}", failed, pending.role));
        }
        match self.heartbeat.status(failed) {
            Some(LivenessState::Suspected | LivenessState::Down) => None,
            Some(LivenessState::Up) | None => {
                Some(format!("{} is not known to be down", failed))
            }
        }
    }

    async fn run(&self, id: Uuid, role: &NodeId, mut steps: Vec<FailoverStep>) -> FailoverOutcome {
        loop {
            let Some(last) = steps.last().cloned() else {
                return self.abandon(id, role, "empty failover history".to_string());
            };
            let standby = steps.iter().find_map(|s| match s {
                FailoverStep::Selected { standby, .. } => Some(standby.clone()),
                _ => None,
            });

            let next = match self.advance(role, &last, standby.as_ref()).await {
                Ok(next) => next,
                Err(e) => FailoverStep::Abandoned {
                    reason: e.to_string(),
                },
            };

            if let FailoverStep::Abandoned { reason } = &next {
                return self.abandon(id, role, reason.clone());
            }
            if let Err(e) = self.journal.record(id, role, next.clone()) {
                return self.abandon(id, role, format!("journal write failed: {}", e));
            }
            if next == FailoverStep::Redirected {
                self.promoter.redirected(role).await;
                Metrics::incr(&self.metrics.failovers_completed);
                self.mark_available(role);
                let promoted = standby.unwrap_or_else(|| self.routing.resolve(role));
                tracing::info!("Failover {} of {} to {} complete", id, role, promoted);
                return FailoverOutcome::Completed {
                    role: role.clone(),
                    promoted,
                };
            }
            steps.push(next);
        }
    }

    /// Perform the work that follows `last`
    async fn advance(
        &self,
        role: &NodeId,
        last: &FailoverStep,
        standby: Option<&NodeId>,
    ) -> Result<FailoverStep> {
        let chosen = || {
            standby
                .cloned()
                .ok_or_else(|| Error::failover(format!("no standby selected for {}", role)))
        };

        match last {
            FailoverStep::Detected { failed } => {
                if self.replication.primary(role).as_ref() == Some(failed) {
                    self.replication.detach_primary(role)?;
                }
                match self.replication.select_candidate(role) {
                    Some((standby, lag)) => Ok(FailoverStep::Selected { standby, lag }),
                    None => Ok(FailoverStep::Abandoned {
                        reason: format!("no standby available for {}", role),
                    }),
                }
            }
            FailoverStep::Selected { standby, .. } => {
                let applied = self
                    .replication
                    .catch_up(role, standby, self.config.catch_up_timeout)
                    .await?;
                Ok(FailoverStep::CaughtUp { applied })
            }
            FailoverStep::CaughtUp { .. } => {
                let standby = chosen()?;
                let kind = self
                    .replication
                    .kind(role)
                    .ok_or_else(|| Error::not_found(format!("replica set {}", role)))?;
                let wal = self.replication.promote(role, &standby)?;
                self.promoter.promote(role, kind, &standby, wal).await?;
                Ok(FailoverStep::Promoted)
            }
            FailoverStep::Promoted => {
                let standby = chosen()?;
                self.routing.set(role.clone(), standby);
                Ok(FailoverStep::Redirected)
            }
            FailoverStep::Redirected | FailoverStep::Abandoned { .. } => Err(Error::failover(
                format!("failover of {} already finished", role),
            )),
        }
    }

    fn abandon(&self, id: Uuid, role: &NodeId, reason: String) -> FailoverOutcome {
        let _ = self.journal.record(
            id,
            role,
            FailoverStep::Abandoned {
                reason: reason.clone(),
            },
        );
        Metrics::incr(&self.metrics.failovers_abandoned);
        self.unavailable.write().insert(role.clone());
        tracing::error!("Failover {} of {} abandoned: {}; role unavailable", id, role, reason);
        FailoverOutcome::Abandoned {
            role: role.clone(),
            reason,
        }
    }

    /// Close a journaled failover without touching the role
    fn cancel(&self, id: Uuid, role: &NodeId, reason: String) -> FailoverOutcome {
        if let Err(e) = self.journal.record(
            id,
            role,
            FailoverStep::Abandoned {
                reason: reason.clone(),
            },
        ) {
            tracing::error!("Failed to close failover {} of {}: {}", id, role, e);
        }
        tracing::warn!("Dropped failover {} of {}: {}", id, role, reason);
        FailoverOutcome::Cancelled {
            role: role.clone(),
            reason,
        }
    }

    /// Consume liveness events and coordinator hints until shutdown
    pub async fn run_events(
        self: Arc<Self>,
        mut liveness: broadcast::Receiver<LivenessEvent>,
        mut hints: mpsc::UnboundedReceiver<CoordinatorEvent>,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = liveness.recv() => match event {
                    Ok(event) => {
                        self.on_liveness(&event).await;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!("Failover controller missed {} liveness events", skipped);
                    }
                    Err(RecvError::Closed) => break,
                },
                hint = hints.recv() => match hint {
                    Some(hint) => {
                        self.on_coordinator_event(&hint).await;
                    }
                    None => break,
                },
            }
        }
        tracing::debug!("Failover controller stopped");
    }
}

impl std::fmt::Debug for FailoverController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailoverController")
            .field("config", &self.config)
            .field("unavailable", &*self.unavailable.read())
            .finish()
    }
}
