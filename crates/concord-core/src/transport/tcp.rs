//! TCP transport using the framed envelope codec
//!
//! One persistent outbound connection per destination node, each behind
//! its own lock so a slow peer only delays sends to itself; inbound
//! connections feed a node inbox. Pings are answered on the connection
//! they arrive on so the same port serves liveness probes.

use super::{Probe, RoutingTable, Transport};
use crate::retry::{RetryConfig, retry};
use crate::{Error, Result};
use async_trait::async_trait;
use concord_protocol::{Envelope, NodeId, ProtocolError, ProtocolMessage};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// Client side of the TCP transport
pub struct TcpTransport {
    local: NodeId,
    routing: Arc<RoutingTable>,
    addresses: RwLock<HashMap<NodeId, SocketAddr>>,
    connections: DashMap<NodeId, Arc<Mutex<Option<TcpStream>>>>,
    connect_timeout: Duration,
    retry: RetryConfig,
    probe_seq: AtomicU64,
}

impl TcpTransport {
    pub fn new(local: NodeId, routing: Arc<RoutingTable>) -> Self {
        Self {
            local,
            routing,
            addresses: RwLock::new(HashMap::new()),
            connections: DashMap::new(),
            connect_timeout: Duration::from_secs(2),
            retry: RetryConfig::quick(),
            probe_seq: AtomicU64::new(0),
        }
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Register the address of a physical node
    pub fn add_peer(&self, node: NodeId, addr: SocketAddr) {
        self.addresses.write().insert(node, addr);
    }

    fn address_of(&self, node: &NodeId) -> Result<SocketAddr> {
        self.addresses
            .read()
            .get(node)
            .copied()
            .ok_or_else(|| Error::Unreachable(node.clone()))
    }

    async fn connect(&self, node: &NodeId) -> Result<TcpStream> {
        let addr = self.address_of(node)?;
        let stream = timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::timeout(format!("connect to {} ({})", node, addr)))??;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    fn slot(&self, node: &NodeId) -> Arc<Mutex<Option<TcpStream>>> {
        self.connections
            .entry(node.clone())
            .or_default()
            .value()
            .clone()
    }

    async fn send_once(&self, node: &NodeId, envelope: &Envelope) -> Result<()> {
        let slot = self.slot(node);
        let mut connection = slot.lock().await;
        if connection.is_none() {
            *connection = Some(self.connect(node).await?);
        }
        let Some(stream) = connection.as_mut() else {
            return Err(Error::Unreachable(node.clone()));
        };

        if let Err(e) = envelope.write_to(stream).await {
            *connection = None;
            return Err(match e {
                ProtocolError::Io(io) => Error::Io(io),
                other => Error::Protocol(other),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&self, envelope: Envelope) -> Result<()> {
        let node = self.routing.resolve(&envelope.to);
        retry(&self.retry, || self.send_once(&node, &envelope)).await
    }
}

#[async_trait]
impl Probe for TcpTransport {
    async fn probe(&self, node: &NodeId) -> Result<()> {
        let seq = self.probe_seq.fetch_add(1, Ordering::Relaxed);
        let mut stream = self.connect(node).await?;

        let ping = Envelope::new(self.local.clone(), node.clone(), ProtocolMessage::Ping { seq });
        ping.write_to(&mut stream).await?;

        let reply = timeout(self.connect_timeout, Envelope::read_from(&mut stream))
            .await
            .map_err(|_| Error::timeout(format!("pong from {}", node)))??;
        match reply.message {
            ProtocolMessage::Pong { seq: got } if got == seq => Ok(()),
            other => Err(Error::internal(format!(
                "unexpected probe reply from {}: {:?}",
                node,
                other.message_type()
            ))),
        }
    }
}

/// Accept connections on `listener` and forward envelopes to `inbox`.
///
/// Returns the bound address; the accept loop runs until `shutdown`.
pub fn serve_tcp(
    listener: TcpListener,
    local: NodeId,
    inbox: mpsc::UnboundedSender<Envelope>,
    shutdown: CancellationToken,
) -> Result<SocketAddr> {
    let addr = listener.local_addr()?;
    tracing::info!("{} listening on {}", local, addr);

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tracing::debug!("{} accepted connection from {}", local, peer);
                        tokio::spawn(read_connection(
                            stream,
                            local.clone(),
                            inbox.clone(),
                            shutdown.clone(),
                        ));
                    }
                    Err(e) => {
                        tracing::warn!("{} accept failed: {}", local, e);
                    }
                },
            }
        }
        tracing::info!("{} stopped listening", local);
    });

    Ok(addr)
}

async fn read_connection(
    mut stream: TcpStream,
    local: NodeId,
    inbox: mpsc::UnboundedSender<Envelope>,
    shutdown: CancellationToken,
) {
    loop {
        let envelope = tokio::select! {
            _ = shutdown.cancelled() => return,
            read = Envelope::read_from(&mut stream) => match read {
                Ok(envelope) => envelope,
                Err(ProtocolError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => return,
                Err(e) => {
                    tracing::warn!("{} dropping connection: {}", local, e);
                    return;
                }
            },
        };

        if let ProtocolMessage::Ping { seq } = envelope.message {
            let pong = envelope.reply(ProtocolMessage::Pong { seq });
            if let Err(e) = pong.write_to(&mut stream).await {
                tracing::debug!("{} failed to answer ping: {}", local, e);
                return;
            }
            continue;
        }

        if inbox.send(envelope).is_err() {
            return;
        }
    }
}
