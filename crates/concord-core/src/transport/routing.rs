//! Role to node routing

use concord_protocol::NodeId;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Which physical node currently holds each role.
///
/// A role with no entry is served by the node of the same name.
#[derive(Debug, Default)]
pub struct RoutingTable {
    routes: DashMap<NodeId, NodeId>,
    generation: AtomicU64,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Node that should receive messages for `role`
    pub fn resolve(&self, role: &NodeId) -> NodeId {
        self.routes
            .get(role)
            .map(|r| r.value().clone())
            .unwrap_or_else(|| role.clone())
    }

    /// Point `role` at `node`, returning the previous holder
    pub fn set(&self, role: NodeId, node: NodeId) -> Option<NodeId> {
        self.generation.fetch_add(1, Ordering::AcqRel);
        let previous = self.routes.insert(role.clone(), node.clone());
        tracing::info!(
            "Routing {} -> {} (was {})",
            role,
            node,
            previous.as_ref().map(|p| p.as_str()).unwrap_or("-")
        );
        previous
    }

    /// Roles whose messages go to `node`
    pub fn roles_on(&self, node: &NodeId) -> Vec<NodeId> {
        let mut roles: Vec<NodeId> = self
            .routes
            .iter()
            .filter(|r| r.value() == node)
            .map(|r| r.key().clone())
            .collect();
        roles.sort();
        roles
    }

    pub fn routes(&self) -> BTreeMap<NodeId, NodeId> {
        self.routes
            .iter()
            .map(|r| (r.key().clone(), r.value().clone()))
            .collect()
    }

    /// Incremented on every change
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unrouted_role_resolves_to_itself() {
        let table = RoutingTable::new();
        assert_eq!(table.resolve(&NodeId::from("p1")), NodeId::from("p1"));
    }

    #[test]
    fn test_redirect() {
        let table = RoutingTable::new();
        table.set("p1".into(), "node-a".into());
        assert_eq!(table.set("p1".into(), "node-b".into()), Some("node-a".into()));
        assert_eq!(table.resolve(&"p1".into()), NodeId::from("node-b"));
        assert_eq!(table.roles_on(&"node-b".into()), vec![NodeId::from("p1")]);
        assert!(table.roles_on(&"node-a".into()).is_empty());
        assert_eq!(table.generation(), 2);
    }
}
