//! Serializable view of a running cluster

use crate::heartbeat::LivenessState;
use crate::replication::ReplicaSetInfo;
use crate::Result;
use concord_protocol::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One physical node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeView {
    pub id: NodeId,
    /// `None` for a node the heartbeat monitor does not track
    pub liveness: Option<LivenessState>,
    pub consecutive_misses: u32,
    pub last_success_ms: Option<u64>,
    /// Failure was injected and the node has not been recovered
    pub crashed: bool,
    /// Roles the node currently serves
    pub roles: Vec<NodeId>,
}

/// Nodes, routes and replica sets at one instant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologySnapshot {
    pub taken_at_ms: u64,
    pub nodes: Vec<NodeView>,
    /// Role → node currently holding it
    pub routes: BTreeMap<NodeId, NodeId>,
    pub routing_generation: u64,
    pub replica_sets: Vec<ReplicaSetInfo>,
    /// Roles left without a live holder
    pub unavailable: Vec<NodeId>,
}

impl TopologySnapshot {
    pub fn node(&self, id: &NodeId) -> Option<&NodeView> {
        self.nodes.iter().find(|n| &n.id == id)
    }

    pub fn replica_set(&self, role: &NodeId) -> Option<&ReplicaSetInfo> {
        self.replica_sets.iter().find(|r| &r.role == role)
    }

    /// Node serving `role`
    pub fn holder(&self, role: &NodeId) -> Option<&NodeId> {
        self.routes.get(role)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
