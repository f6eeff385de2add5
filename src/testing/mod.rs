//! Testing utilities: failure injection and an in-process cluster.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          TestCluster                            │
//! │                                                                 │
//! │   ┌──────────┐      ┌──────────┐      ┌──────────┐              │
//! │   │  Node 1  │      │  Node 2  │      │  Node 3  │              │
//! │   │ failpts  │      │ failpts  │      │ failpts  │              │
//! │   └────┬─────┘      └────┬─────┘      └────┬─────┘              │
//! │        └─────────────────┼─────────────────┘                    │
//! │                          ▼                                      │
//! │                  LocalTransport (shared)                        │
//! │  - routes demands to registered suppliers                       │
//! │  - records demands, simulates unreachable nodes                 │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Failpoints are per registry, never global, so tests running in parallel
//! do not see each other's injected failures.
//!
//! # Example
//!
//! ```rust,ignore
//! use partwal::testing::{FailpointAction, TestCluster, names};
//!
//! let mut cluster = TestCluster::new(dir.path(), groups);
//! cluster.activate(&[1, 2])?;
//! cluster.put(1, "key", "value")?;
//!
//! cluster.failpoints(1).enable(names::WAL_ITERATOR_READ, FailpointAction::ErrorAfter(5));
//! cluster.stop_node(2)?;
//! cluster.start_node(2)?;
//! assert!(cluster.await_rebalance(1, Duration::from_secs(10)));
//! assert!(cluster.idle_verify(1).is_empty());
//! ```

pub mod cluster;
pub mod failpoint;

#[cfg(test)]
mod rebalance_tests;

pub use cluster::{IdleVerifyConflicts, TestCluster};
pub use failpoint::{names, FailpointAction, FailpointRegistry, FailpointResult, FailpointStats};
