//! Partition rebalancing between nodes.
//!
//! ```text
//!   demander                                   supplier
//! ┌────────────────────┐   DemandMessage    ┌────────────────────────┐
//! │ RebalancePlanner   │ ─────────────────► │ Supplier               │
//! │  historical / full │                    │  full: snapshot rows   │
//! │ Demander           │   SupplyMessage*   │  historical: WAL       │
//! │  per-supplier loop │ ◄───────────────── │   replay from history  │
//! │  partition workers │                    │   reservation          │
//! └────────────────────┘                    └────────────────────────┘
//!           │ historical failure
//!           ▼
//!   ExchangeTask::RebalanceReassign (supplier excluded, full next time)
//! ```
//!
//! A partition is demanded historically when the local node already has it
//! and some supplier with the highest counter keeps WAL history that reaches
//! back to the local counter. Everything else is demanded in full.

pub mod demander;
pub mod message;
pub mod planner;
pub mod state;
pub mod supplier;
pub mod transport;

pub use demander::{Demander, RebalanceFuture};
pub use message::{
    DemandMessage, GroupAdvertisement, HistoricalRecord, PartitionAdvert, SupplyMessage,
};
pub use planner::{FullReason, LocalPartitionInfo, RebalancePlan, RebalancePlanner};
pub use state::PartitionRebalanceState;
pub use supplier::{Supplier, SupplySink};
pub use transport::{DemandRecord, LocalTransport, RebalanceTransport};
