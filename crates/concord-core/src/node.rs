//! Node runtime
//!
//! A node is one physical process. It owns an inbox fed by the transport
//! and hosts any number of roles; every envelope is dispatched to the role
//! it is addressed to and the reply, if any, goes back through the
//! transport.

use crate::coordinator::Coordinator;
use crate::participant::ParticipantAgent;
use crate::transport::Transport;
use concord_protocol::{Envelope, NodeId};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// A role hosted on a node
#[derive(Clone)]
pub enum RoleHandler {
    Coordinator(Arc<Coordinator>),
    Participant(Arc<ParticipantAgent>),
}

impl RoleHandler {
    pub fn handle(&self, envelope: &Envelope) -> Option<Envelope> {
        match self {
            Self::Coordinator(c) => c.handle(envelope),
            Self::Participant(p) => p.handle(envelope),
        }
    }

    fn fence(&self, reason: &str) {
        match self {
            Self::Coordinator(c) => c.fence(reason),
            Self::Participant(p) => p.wal().fence(reason),
        }
    }
}

impl std::fmt::Debug for RoleHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Coordinator(c) => write!(f, "Coordinator({})", c.role()),
            Self::Participant(p) => write!(f, "Participant({})", p.id()),
        }
    }
}

/// One physical node
pub struct Node {
    id: NodeId,
    transport: Arc<dyn Transport>,
    roles: RwLock<HashMap<NodeId, RoleHandler>>,
    shutdown: CancellationToken,
}

impl Node {
    pub fn new(id: NodeId, transport: Arc<dyn Transport>, parent: &CancellationToken) -> Self {
        Self {
            id,
            transport,
            roles: RwLock::new(HashMap::new()),
            shutdown: parent.child_token(),
        }
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    /// Cancelled when the node crashes or the cluster shuts down
    pub fn token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub fn is_running(&self) -> bool {
        !self.shutdown.is_cancelled()
    }

    /// Start serving `role`, replacing a previous handler
    pub fn host(&self, role: NodeId, handler: RoleHandler) {
        tracing::info!("{} now hosts {:?}", self.id, handler);
        self.roles.write().insert(role, handler);
    }

    pub fn remove(&self, role: &NodeId) -> Option<RoleHandler> {
        self.roles.write().remove(role)
    }

    pub fn roles(&self) -> Vec<NodeId> {
        let mut roles: Vec<NodeId> = self.roles.read().keys().cloned().collect();
        roles.sort();
        roles
    }

    pub fn coordinator(&self, role: &NodeId) -> Option<Arc<Coordinator>> {
        match self.roles.read().get(role) {
            Some(RoleHandler::Coordinator(c)) => Some(c.clone()),
            _ => None,
        }
    }

    pub fn participant(&self, role: &NodeId) -> Option<Arc<ParticipantAgent>> {
        match self.roles.read().get(role) {
            Some(RoleHandler::Participant(p)) => Some(p.clone()),
            _ => None,
        }
    }

    /// Hand one envelope to its role and send the reply
    pub async fn dispatch(&self, envelope: Envelope) {
        let handler = self.roles.read().get(&envelope.to).cloned();
        let Some(handler) = handler else {
            tracing::debug!(
                "{} has no role {} for {:?} from {}",
                self.id,
                envelope.to,
                envelope.message.message_type(),
                envelope.from
            );
            return;
        };

        if let Some(reply) = handler.handle(&envelope) {
            if let Err(e) = self.transport.send(reply).await {
                tracing::debug!("{} could not reply to {}: {}", self.id, envelope.from, e);
            }
        }
    }

    /// Dispatch envelopes from `inbox` until the node stops
    pub async fn run(self: Arc<Self>, mut inbox: mpsc::UnboundedReceiver<Envelope>) {
        loop {
            let envelope = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                envelope = inbox.recv() => match envelope {
                    Some(envelope) => envelope,
                    None => break,
                },
            };
            self.dispatch(envelope).await;
        }
        tracing::debug!("{} stopped dispatching", self.id);
    }

    /// Simulate a process crash: every hosted role stops writing and every
    /// task of the node is cancelled
    pub fn crash(&self) {
        let roles: Vec<RoleHandler> = self.roles.write().drain().map(|(_, h)| h).collect();
        for role in &roles {
            role.fence("node crashed");
        }
        self.shutdown.cancel();
        tracing::warn!("{} crashed ({} roles lost)", self.id, roles.len());
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("roles", &self.roles())
            .field("running", &self.is_running())
            .finish()
    }
}
