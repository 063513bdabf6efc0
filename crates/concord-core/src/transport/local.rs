//! In-process network with failure injection

use super::{Probe, RoutingTable, Transport};
use crate::{Error, Result};
use async_trait::async_trait;
use concord_protocol::{Envelope, MessageType, NodeId};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

/// Silently lose matching messages.
///
/// Unset fields match anything; `remaining` limits how many messages the
/// rule drops before it expires.
#[derive(Debug, Clone, Default)]
pub struct DropRule {
    pub from: Option<NodeId>,
    pub to: Option<NodeId>,
    pub message: Option<MessageType>,
    pub remaining: Option<u32>,
}

impl DropRule {
    pub fn to(role: impl Into<NodeId>) -> Self {
        Self {
            to: Some(role.into()),
            ..Self::default()
        }
    }

    pub fn of(mut self, message: MessageType) -> Self {
        self.message = Some(message);
        self
    }

    pub fn times(mut self, n: u32) -> Self {
        self.remaining = Some(n);
        self
    }

    fn matches(&self, envelope: &Envelope) -> bool {
        self.from.as_ref().is_none_or(|f| *f == envelope.from)
            && self.to.as_ref().is_none_or(|t| *t == envelope.to)
            && self
                .message
                .is_none_or(|m| m == envelope.message.message_type())
    }
}

/// Delivers envelopes to per-node inboxes in the same process
pub struct LocalNetwork {
    routing: Arc<RoutingTable>,
    inboxes: RwLock<HashMap<NodeId, mpsc::UnboundedSender<Envelope>>>,
    down: RwLock<HashSet<NodeId>>,
    rules: Mutex<Vec<DropRule>>,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl LocalNetwork {
    pub fn new(routing: Arc<RoutingTable>) -> Self {
        Self {
            routing,
            inboxes: RwLock::new(HashMap::new()),
            down: RwLock::new(HashSet::new()),
            rules: Mutex::new(Vec::new()),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn routing(&self) -> &Arc<RoutingTable> {
        &self.routing
    }

    /// Attach a node, replacing any previous inbox
    pub fn connect(&self, node: NodeId) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inboxes.write().insert(node, tx);
        rx
    }

    pub fn disconnect(&self, node: &NodeId) {
        self.inboxes.write().remove(node);
    }

    /// Make a node unreachable (or reachable again)
    pub fn set_down(&self, node: &NodeId, down: bool) {
        let mut set = self.down.write();
        if down {
            set.insert(node.clone());
        } else {
            set.remove(node);
        }
    }

    pub fn is_down(&self, node: &NodeId) -> bool {
        self.down.read().contains(node)
    }

    pub fn drop_messages(&self, rule: DropRule) {
        self.rules.lock().push(rule);
    }

    pub fn clear_rules(&self) {
        self.rules.lock().clear();
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn should_drop(&self, envelope: &Envelope) -> bool {
        let mut rules = self.rules.lock();
        let Some(index) = rules.iter().position(|r| r.matches(envelope)) else {
            return false;
        };

        if let Some(remaining) = rules[index].remaining.as_mut() {
            *remaining = remaining.saturating_sub(1);
            if *remaining == 0 {
                rules.remove(index);
            }
        }
        true
    }
}

#[async_trait]
impl Transport for LocalNetwork {
    async fn send(&self, envelope: Envelope) -> Result<()> {
        let source = self.routing.resolve(&envelope.from);
        let target = self.routing.resolve(&envelope.to);
        if self.is_down(&source) || self.is_down(&target) {
            return Err(Error::Unreachable(envelope.to));
        }

        if self.should_drop(&envelope) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                "Dropped {:?} {} -> {}",
                envelope.message.message_type(),
                envelope.from,
                envelope.to
            );
            return Ok(());
        }

        let inboxes = self.inboxes.read();
        let inbox = inboxes
            .get(&target)
            .ok_or_else(|| Error::Unreachable(envelope.to.clone()))?;
        inbox
            .send(envelope)
            .map_err(|e| Error::Unreachable(e.0.to))?;
        self.delivered.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[async_trait]
impl Probe for LocalNetwork {
    async fn probe(&self, node: &NodeId) -> Result<()> {
        if self.is_down(node) {
            return Err(Error::Unreachable(node.clone()));
        }
        let inboxes = self.inboxes.read();
        match inboxes.get(node) {
            Some(inbox) if !inbox.is_closed() => Ok(()),
            _ => Err(Error::Unreachable(node.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_protocol::{ProtocolMessage, TxnId};

    fn commit(to: &str) -> Envelope {
        Envelope::new(
            "coordinator".into(),
            to.into(),
            ProtocolMessage::Commit {
                txn: TxnId::new(0, 1),
            },
        )
    }

    #[tokio::test]
    async fn test_routed_delivery() {
        let routing = Arc::new(RoutingTable::new());
        let network = LocalNetwork::new(routing.clone());
        let mut rx = network.connect("node-b".into());
        routing.set("p1".into(), "node-b".into());

        network.send(commit("p1")).await.unwrap();
        let env = rx.recv().await.unwrap();
        assert_eq!(env.to, NodeId::from("p1"));
        assert_eq!(network.delivered(), 1);
    }

    #[tokio::test]
    async fn test_down_node_unreachable() {
        let network = LocalNetwork::new(Arc::new(RoutingTable::new()));
        let _rx = network.connect("p1".into());
        network.set_down(&"p1".into(), true);

        assert!(matches!(
            network.send(commit("p1")).await,
            Err(Error::Unreachable(_))
        ));
        assert!(network.probe(&"p1".into()).await.is_err());

        network.set_down(&"p1".into(), false);
        assert!(network.probe(&"p1".into()).await.is_ok());
    }

    #[tokio::test]
    async fn test_drop_rule_expires() {
        let network = LocalNetwork::new(Arc::new(RoutingTable::new()));
        let mut rx = network.connect("p1".into());
        network.drop_messages(DropRule::to("p1").of(MessageType::Commit).times(1));

        network.send(commit("p1")).await.unwrap();
        network.send(commit("p1")).await.unwrap();

        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_err());
        assert_eq!(network.dropped(), 1);
    }

    #[tokio::test]
    async fn test_unknown_node() {
        let network = LocalNetwork::new(Arc::new(RoutingTable::new()));
        assert!(network.send(commit("nobody")).await.is_err());
        assert!(network.probe(&"nobody".into()).await.is_err());
    }
}
