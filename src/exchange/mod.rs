//! Partition map exchange.
//!
//! Topology changes are serialized through a single worker. Each exchange
//! hands the new node set to an [`ExchangeListener`], which computes the
//! [`AffinityAssignment`] of every cache group and starts rebalancing.
//!
//! ```text
//!  on_topology_change ──► ExchangeQueue ──► exchange-worker ──► on_exchange
//!                              ▲                                    │
//!                              │                                    ▼
//!                  RebalanceReassign ◄──── demander ◄──── rebalance planner
//! ```

mod affinity;
mod queue;
mod task;

pub use affinity::AffinityAssignment;
pub use queue::{ExchangeContext, ExchangeListener, ExchangeQueue, ExchangeWorker};
pub use task::{ExchangeFuture, ExchangeTask, HistoricalExclusions};
