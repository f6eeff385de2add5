//! WAL-based historical rebalancing for a partitioned, replicated key-value
//! store.
//!
//! A node keeps every partition of its cache groups in memory, logs each
//! mutation to a segmented write-ahead log and periodically writes
//! checkpoints. The WAL retained between checkpoints is the node's
//! *history*. When a node comes back after a short absence it asks a peer to
//! replay only the missed updates from that history instead of shipping the
//! full partition.
//!
//! # Features
//!
//! - Segmented, checksummed WAL with archive and truncation
//! - Per-partition update counters with out-of-order gap tracking
//! - Checkpoint history bounding how far back replay can reach
//! - Historical or full rebalance chosen per partition, with fallback to
//!   full after a historical failure
//! - Exchange worker serializing topology changes and reassignments
//! - Persistent binary metadata store
//!
//! # Example
//!
//! ```rust,no_run
//! use partwal::{CacheGroupConfig, LocalTransport, Node, NodeConfig, TopologyEvent, TopologyVersion};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = NodeConfig::new(1, "./work");
//!     let groups = vec![CacheGroupConfig::new(1, "users").with_partitions(64).with_backups(1)];
//!     let transport = Arc::new(LocalTransport::new());
//!
//!     let node = Node::start(config, groups, transport, None)?;
//!     node.on_topology_change(TopologyVersion::new(1, 0), vec![1], TopologyEvent::Activated)
//!         .wait(Duration::from_secs(10));
//!
//!     node.put(1, "user:123", "Alice")?;
//!     assert!(node.get(1, b"user:123").is_some());
//!
//!     node.checkpoint()?;
//!     node.stop();
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                            Node                             │
//! │   put / remove / apply_replicated       on_topology_change  │
//! └──────────────┬─────────────────────────────────┬────────────┘
//!                │                                 │
//!                ▼                                 ▼
//! ┌───────────────────────────┐     ┌───────────────────────────┐
//! │ GroupContext              │     │ ExchangeWorker            │
//! │  partitions + counters    │     │  exchanges, reassignments │
//! └──────┬─────────────┬──────┘     └─────────────┬─────────────┘
//!        │             │                          │
//!        ▼             ▼                          ▼
//! ┌────────────┐ ┌────────────────┐     ┌───────────────────────┐
//! │ WalManager │ │ Checkpointer   │     │ RebalancePlanner      │
//! │  segments  │ │  + history     │     │ Demander / Supplier   │
//! └────────────┘ └────────────────┘     └───────────────────────┘
//! ```
//!
//! # Consistency Model
//!
//! - Mutations hold the write barrier shared; checkpoints hold it
//!   exclusively, so a checkpoint's counters match its WAL pointer
//! - Replaying a historical record that is already applied is a no-op
//! - A partition moves to `Owning` only after its counter reaches the
//!   supplier's final counter

pub mod binary;
pub mod checkpoint;
pub mod config;
pub mod counters;
pub mod error;
pub mod exchange;
pub mod failure;
pub mod future;
pub mod metrics;
pub mod node;
pub mod partition;
pub mod rebalance;
pub mod testing;
pub mod timeout;
pub mod types;
pub mod wal;

// Re-export main types for convenience
pub use config::{
    CacheGroupConfig, CheckpointConfig, ExchangeConfig, MetadataConfig, NodeConfig,
    RebalanceConfig, WalConfig, WalMode,
};
pub use error::{
    CounterError, Error, ExchangeError, MetadataError, RebalanceError, Result, TransportError,
    WalError,
};
pub use node::Node;
pub use types::{ExchangeId, GroupId, GroupPartition, NodeId, PartitionId, TopologyEvent, TopologyVersion};

// Re-export storage types
pub use checkpoint::{CheckpointInfo, Checkpointer};
pub use counters::{CheckpointHistory, CounterRange, PartitionUpdateCounter, UpdateCounterTracker};
pub use wal::{DataEntry, DataOp, WalManager, WalPointer, WalRecord};

// Re-export rebalancing types
pub use exchange::{AffinityAssignment, ExchangeFuture, ExchangeWorker};
pub use partition::{PartitionHash, PartitionState};
pub use rebalance::{
    LocalTransport, PartitionRebalanceState, RebalanceFuture, RebalancePlan, RebalanceTransport,
};

// Re-export metrics types
pub use metrics::{NodeMetrics, NodeMetricsSnapshot, RebalanceMetrics, WalMetrics};

// Re-export testing types
pub use testing::{FailpointAction, FailpointRegistry, TestCluster};
