//! Message delivery between roles and liveness probing of nodes
//!
//! Protocol messages are addressed to logical roles (a coordinator or a
//! participant identity). The [`RoutingTable`] maps each role to the
//! physical node currently holding it; failover only rewrites that table.

pub mod local;
pub mod routing;
pub mod tcp;

pub use local::{DropRule, LocalNetwork};
pub use routing::RoutingTable;
pub use tcp::{TcpTransport, serve_tcp};

use crate::Result;
use async_trait::async_trait;
use concord_protocol::{Envelope, NodeId};

/// At-least-once delivery of protocol envelopes
#[async_trait]
pub trait Transport: Send + Sync {
    /// Hand `envelope` to the node currently holding `envelope.to`
    async fn send(&self, envelope: Envelope) -> Result<()>;
}

/// Liveness probe of a physical node
#[async_trait]
pub trait Probe: Send + Sync {
    async fn probe(&self, node: &NodeId) -> Result<()>;
}
