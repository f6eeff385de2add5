//! Messaging between demanders and suppliers.

use crate::error::TransportError;
use crate::rebalance::message::{DemandMessage, GroupAdvertisement};
use crate::rebalance::supplier::{Supplier, SupplySink};
use crate::types::{GroupId, NodeId};
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

/// Delivers exchange advertisements and demand messages.
pub trait RebalanceTransport: Send + Sync {
    /// Serve demands addressed to `supplier.node()` with `supplier`.
    fn register(&self, supplier: Arc<Supplier>);

    /// Stop serving demands for `node`.
    fn unregister(&self, node: NodeId);

    /// Fetch the partition map `node` publishes for `group`.
    fn advertise(&self, node: NodeId, group: GroupId) -> Result<GroupAdvertisement, TransportError>;

    /// Send a demand to `supplier` and stream its supply messages to `sink`.
    fn demand(
        &self,
        supplier: NodeId,
        demander: NodeId,
        demand: &DemandMessage,
        sink: &mut SupplySink<'_>,
    ) -> Result<(), TransportError>;
}

/// A demand as seen by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DemandRecord {
    pub supplier: NodeId,
    pub demander: NodeId,
    pub demand: DemandMessage,
}

/// In-process transport over an explicit table of registered suppliers.
#[derive(Default)]
pub struct LocalTransport {
    suppliers: DashMap<NodeId, Arc<Supplier>>,
    unreachable: DashSet<NodeId>,
    demands: Mutex<Vec<DemandRecord>>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every request to `node` fail with [`TransportError::Unreachable`].
    pub fn set_unreachable(&self, node: NodeId, unreachable: bool) {
        if unreachable {
            self.unreachable.insert(node);
        } else {
            self.unreachable.remove(&node);
        }
    }

    /// Demands delivered so far, in delivery order.
    pub fn demands(&self) -> Vec<DemandRecord> {
        self.demands.lock().clone()
    }

    pub fn clear_demands(&self) {
        self.demands.lock().clear();
    }

    fn supplier(&self, node: NodeId) -> Result<Arc<Supplier>, TransportError> {
        if self.unreachable.contains(&node) {
            return Err(TransportError::Unreachable(node));
        }
        self.suppliers
            .get(&node)
            .map(|s| s.clone())
            .ok_or(TransportError::Unreachable(node))
    }
}

impl RebalanceTransport for LocalTransport {
    fn register(&self, supplier: Arc<Supplier>) {
        debug!(node = supplier.node(), "Supplier registered");
        self.suppliers.insert(supplier.node(), supplier);
    }

    fn unregister(&self, node: NodeId) {
        if self.suppliers.remove(&node).is_some() {
            debug!(node, "Supplier unregistered");
        }
    }

    fn advertise(&self, node: NodeId, group: GroupId) -> Result<GroupAdvertisement, TransportError> {
        Ok(self.supplier(node)?.advertise(group))
    }

    fn demand(
        &self,
        supplier: NodeId,
        demander: NodeId,
        demand: &DemandMessage,
        sink: &mut SupplySink<'_>,
    ) -> Result<(), TransportError> {
        let target = self.supplier(supplier)?;
        self.demands.lock().push(DemandRecord {
            supplier,
            demander,
            demand: demand.clone(),
        });
        target.handle_demand(demander, demand, sink);
        Ok(())
    }
}

impl std::fmt::Debug for LocalTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTransport")
            .field("suppliers", &self.suppliers.len())
            .field("unreachable", &self.unreachable.len())
            .finish()
    }
}
