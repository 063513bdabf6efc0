//! The commit protocol over real sockets

mod common;

use common::{eventually, init_tracing, puts};
use concord_core::config::{CoordinatorConfig, ParticipantConfig};
use concord_core::coordinator::LocalDurability;
use concord_core::node::{Node, RoleHandler};
use concord_core::participant::{LocalState, MemoryStore};
use concord_core::transport::{Probe, RoutingTable, TcpTransport, serve_tcp};
use concord_core::wal::Wal;
use concord_core::{Coordinator, Metrics, ParticipantAgent};
use concord_protocol::{NodeId, Outcome};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

struct TcpNode {
    node: Arc<Node>,
    transport: Arc<TcpTransport>,
    addr: SocketAddr,
}

async fn start(id: &str, routing: &Arc<RoutingTable>, shutdown: &CancellationToken) -> TcpNode {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
    let addr = serve_tcp(listener, id.into(), inbox_tx, shutdown.child_token()).unwrap();
    let transport = Arc::new(TcpTransport::new(id.into(), routing.clone()));
    let node = Arc::new(Node::new(id.into(), transport.clone(), shutdown));
    tokio::spawn(node.clone().run(inbox_rx));
    TcpNode {
        node,
        transport,
        addr,
    }
}

#[tokio::test]
async fn test_commit_over_tcp() {
    init_tracing();
    let shutdown = CancellationToken::new();
    let routing = Arc::new(RoutingTable::new());
    let metrics = Arc::new(Metrics::new());

    let nodes = [
        ("coordinator", start("n0", &routing, &shutdown).await),
        ("p1", start("n1", &routing, &shutdown).await),
        ("p2", start("n2", &routing, &shutdown).await),
    ];
    for (role, node) in &nodes {
        routing.set((*role).into(), node.node.id().clone());
    }
    // Full mesh
    for (_, from) in &nodes {
        for (_, to) in &nodes {
            from.transport.add_peer(to.node.id().clone(), to.addr);
        }
    }

    let mut agents = Vec::new();
    for (role, node) in &nodes[1..] {
        let agent = Arc::new(ParticipantAgent::new(
            (*role).into(),
            "coordinator".into(),
            ParticipantConfig::default(),
            Arc::new(Wal::in_memory(format!("{}/{}", node.node.id(), role))),
            Arc::new(MemoryStore::new()),
            node.transport.clone(),
            metrics.clone(),
        ));
        node.node
            .host((*role).into(), RoleHandler::Participant(agent.clone()));
        agents.push(agent);
    }
    let coordinator = Arc::new(Coordinator::new(
        "coordinator".into(),
        CoordinatorConfig::default(),
        Arc::new(Wal::in_memory("n0/coordinator")),
        nodes[0].1.transport.clone(),
        Arc::new(LocalDurability),
        metrics.clone(),
        &shutdown,
    ));
    nodes[0]
        .1
        .node
        .host("coordinator".into(), RoleHandler::Coordinator(coordinator.clone()));

    nodes[0].1.transport.probe(&"n1".into()).await.unwrap();
    assert!(nodes[0].1.transport.probe(&"n9".into()).await.is_err());

    let txn = coordinator
        .begin_with_payloads(puts(&["p1", "p2"]))
        .unwrap();
    assert_eq!(
        coordinator
            .wait_for_outcome(txn, Duration::from_secs(5))
            .await
            .unwrap(),
        Outcome::Committed
    );
    for agent in &agents {
        assert!(
            eventually(Duration::from_secs(2), || {
                agent.state_of(txn) == Some(LocalState::Committed)
            })
            .await
        );
        let key = format!("{}-key", agent.id());
        assert_eq!(agent.store().get(&key), Some(agent.id().as_str().as_bytes().to_vec()));
    }
    let status = coordinator.status(txn).unwrap();
    assert_eq!(
        status.acknowledged.into_iter().collect::<Vec<NodeId>>(),
        vec![NodeId::from("p1"), NodeId::from("p2")]
    );

    shutdown.cancel();
}
