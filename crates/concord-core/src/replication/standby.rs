//! Log shipping from a primary WAL to one standby

use crate::wal::{Wal, WalRecord};
use concord_protocol::NodeId;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

/// Replication state of a standby
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StandbyState {
    /// Still applying the backlog
    CatchingUp,
    InSync,
    /// Declared down; receives nothing until resynchronized
    Offline,
}

/// A shipped record plus the primary sequence that precedes it
#[derive(Debug, Clone)]
pub(crate) struct Shipment {
    pub previous: u64,
    pub record: WalRecord,
}

/// One standby of a role
pub struct Standby {
    pub(crate) node: NodeId,
    pub(crate) priority: u32,
    pub(crate) wal: Arc<Wal>,
    pub(crate) applied: watch::Sender<u64>,
    pub(crate) shipped: AtomicU64,
    pub(crate) state: RwLock<StandbyState>,
    /// Stops the shipper only
    pub(crate) shipping: CancellationToken,
    /// Stops both shipper and applier
    pub(crate) cancel: CancellationToken,
}

impl Standby {
    pub(crate) fn new(
        node: NodeId,
        priority: u32,
        wal: Arc<Wal>,
        parent: &CancellationToken,
    ) -> Arc<Self> {
        let applied = wal.durable_sequence();
        let cancel = parent.child_token();
        Arc::new(Self {
            node,
            priority,
            shipping: cancel.child_token(),
            cancel,
            applied: watch::channel(applied).0,
            shipped: AtomicU64::new(applied),
            state: RwLock::new(StandbyState::CatchingUp),
            wal,
        })
    }

    pub fn node(&self) -> &NodeId {
        &self.node
    }

    pub fn wal(&self) -> &Arc<Wal> {
        &self.wal
    }

    pub fn applied_sequence(&self) -> u64 {
        *self.applied.borrow()
    }

    pub fn shipped_sequence(&self) -> u64 {
        self.shipped.load(Ordering::Acquire)
    }

    pub fn state(&self) -> StandbyState {
        *self.state.read()
    }

    pub(crate) fn set_state(&self, state: StandbyState) {
        let mut current = self.state.write();
        // Only a resync (a fresh standby) leaves Offline
        if *current == StandbyState::Offline {
            return;
        }
        if *current != state {
            tracing::info!("Standby {} is now {:?}", self.node, state);
            *current = state;
        }
    }

    pub(crate) fn stop(&self) {
        self.cancel.cancel();
    }

    /// Start the shipper and applier tasks against `primary`
    pub(crate) fn start(self: &Arc<Self>, primary: Arc<Wal>) {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let shipper = self.clone();
        tokio::spawn(async move { shipper.ship(primary, inbox_tx).await });
        let applier = self.clone();
        tokio::spawn(async move { applier.apply(inbox_rx).await });
    }

    async fn ship(self: Arc<Self>, primary: Arc<Wal>, inbox: mpsc::UnboundedSender<Shipment>) {
        // Subscribe before reading the backlog so nothing falls between
        let mut updates = primary.subscribe();
        let mut last = self.wal.durable_sequence();

        if !self.ship_backlog(&primary, &inbox, &mut last) {
            return;
        }
        if last == self.applied_sequence() {
            self.set_state(StandbyState::InSync);
        }

        loop {
            let received = tokio::select! {
                _ = self.shipping.cancelled() => break,
                received = updates.recv() => received,
            };
            match received {
                Ok(record) => {
                    if record.sequence <= last {
                        continue;
                    }
                    if !self.forward(&inbox, last, record, &mut last) {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        "Shipper to {} lagged by {} records; replaying from {}",
                        self.node,
                        skipped,
                        last + 1
                    );
                    if !self.ship_backlog(&primary, &inbox, &mut last) {
                        break;
                    }
                }
                Err(RecvError::Closed) => break,
            }
        }
        tracing::debug!("Shipper to {} stopped at {}", self.node, last);
    }

    fn ship_backlog(
        &self,
        primary: &Wal,
        inbox: &mpsc::UnboundedSender<Shipment>,
        last: &mut u64,
    ) -> bool {
        let backlog = match primary.replay(*last + 1) {
            Ok(backlog) => backlog,
            Err(e) => {
                tracing::error!("Cannot read backlog for {}: {}", self.node, e);
                return false;
            }
        };
        if !backlog.is_empty() {
            tracing::info!(
                "Shipping {} backlog records to {} from {}",
                backlog.len(),
                self.node,
                *last + 1
            );
        }
        for record in backlog {
            let previous = *last;
            if !self.forward(inbox, previous, record, last) {
                return false;
            }
        }
        true
    }

    fn forward(
        &self,
        inbox: &mpsc::UnboundedSender<Shipment>,
        previous: u64,
        record: WalRecord,
        last: &mut u64,
    ) -> bool {
        let sequence = record.sequence;
        // Published before the send so catch-up never misses an in-flight record
        self.shipped.store(sequence, Ordering::Release);
        if inbox.send(Shipment { previous, record }).is_err() {
            return false;
        }
        *last = sequence;
        true
    }

    async fn apply(self: Arc<Self>, mut inbox: mpsc::UnboundedReceiver<Shipment>) {
        loop {
            let shipment = tokio::select! {
                _ = self.cancel.cancelled() => break,
                shipment = inbox.recv() => match shipment {
                    Some(shipment) => shipment,
                    None => break,
                },
            };

            let sequence = shipment.record.sequence;
            match self
                .wal
                .append_replicated_after(shipment.previous, shipment.record)
            {
                Ok(_) => {
                    self.applied.send_replace(self.wal.durable_sequence());
                }
                Err(e) => {
                    tracing::error!(
                        "Standby {} failed to apply sequence {}: {}",
                        self.node,
                        sequence,
                        e
                    );
                    self.set_state(StandbyState::Offline);
                    break;
                }
            }

            if inbox.is_empty() && self.state() == StandbyState::CatchingUp {
                self.set_state(StandbyState::InSync);
            }
        }
    }
}

impl std::fmt::Debug for Standby {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Standby")
            .field("node", &self.node)
            .field("priority", &self.priority)
            .field("applied", &self.applied_sequence())
            .field("state", &self.state())
            .finish()
    }
}
