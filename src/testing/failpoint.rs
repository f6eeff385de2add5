//! Failpoint injection for I/O failure scenarios.
//!
//! A [`FailpointRegistry`] is created by the test (or by whoever embeds the
//! node) and handed to the components by `Arc`. Components call
//! [`check_io`] at named points; an enabled failpoint turns that call into an
//! I/O error, a delay, or a corruption signal.
//!
//! ```rust,ignore
//! let failpoints = Arc::new(FailpointRegistry::new());
//! failpoints.enable(names::WAL_ITERATOR_READ, FailpointAction::ErrorAfter(10));
//! // the 10th record read by any WAL iterator now fails
//! ```

use parking_lot::RwLock;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Well-known failpoint names.
pub mod names {
    /// Every WAL append attempt.
    pub const WAL_APPEND: &str = "wal.append";
    /// fsync of the active segment.
    pub const WAL_FSYNC: &str = "wal.fsync";
    /// Opening a WAL iterator.
    pub const WAL_ITERATOR_OPEN: &str = "wal.iterator.open";
    /// Reading one record through a WAL iterator.
    pub const WAL_ITERATOR_READ: &str = "wal.iterator.read";
    /// Writing one binary metadata file.
    pub const METADATA_WRITE: &str = "metadata.write";
}

/// Action to take when a failpoint is hit.
#[derive(Debug, Clone, PartialEq)]
pub enum FailpointAction {
    /// Fail every hit.
    Error,
    /// Fail the first hit, then disarm.
    ErrorOnce,
    /// Fail from the N-th hit on (1-based).
    ErrorAfter(u64),
    /// Report corruption on every hit.
    Corrupt,
    /// Delay every hit.
    Sleep(Duration),
}

/// Outcome of checking a failpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum FailpointResult {
    /// Continue execution normally.
    Continue,
    /// Fail with an I/O error.
    Fail,
    /// Treat the data at this point as corrupted.
    Corrupt,
}

struct FailpointState {
    action: FailpointAction,
    hit_count: AtomicU64,
    triggered_count: AtomicU64,
    disarmed: AtomicBool,
}

/// Named failpoints shared by the components of one node or cluster.
pub struct FailpointRegistry {
    failpoints: RwLock<HashMap<String, Arc<FailpointState>>>,
}

impl Default for FailpointRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FailpointRegistry {
    pub fn new() -> Self {
        Self {
            failpoints: RwLock::new(HashMap::new()),
        }
    }

    /// Arm a failpoint. Replaces any previous action and resets its counters.
    pub fn enable(&self, name: &str, action: FailpointAction) {
        let state = Arc::new(FailpointState {
            action,
            hit_count: AtomicU64::new(0),
            triggered_count: AtomicU64::new(0),
            disarmed: AtomicBool::new(false),
        });
        self.failpoints.write().insert(name.to_string(), state);
    }

    /// Remove a failpoint.
    pub fn disable(&self, name: &str) {
        self.failpoints.write().remove(name);
    }

    /// Remove all failpoints.
    pub fn disable_all(&self) {
        self.failpoints.write().clear();
    }

    /// Evaluate a failpoint. Sleeps in place for [`FailpointAction::Sleep`].
    pub fn check(&self, name: &str) -> FailpointResult {
        let state = match self.failpoints.read().get(name) {
            Some(s) => s.clone(),
            None => return FailpointResult::Continue,
        };

        if state.disarmed.load(Ordering::Acquire) {
            return FailpointResult::Continue;
        }

        let hit = state.hit_count.fetch_add(1, Ordering::AcqRel) + 1;

        let result = match &state.action {
            FailpointAction::Error => FailpointResult::Fail,
            FailpointAction::ErrorOnce => {
                if state.disarmed.swap(true, Ordering::AcqRel) {
                    FailpointResult::Continue
                } else {
                    FailpointResult::Fail
                }
            }
            FailpointAction::ErrorAfter(n) if hit >= *n => FailpointResult::Fail,
            FailpointAction::ErrorAfter(_) => FailpointResult::Continue,
            FailpointAction::Corrupt => FailpointResult::Corrupt,
            FailpointAction::Sleep(d) => {
                std::thread::sleep(*d);
                FailpointResult::Continue
            }
        };

        if result != FailpointResult::Continue {
            state.triggered_count.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    /// Get statistics for a failpoint.
    pub fn stats(&self, name: &str) -> Option<FailpointStats> {
        self.failpoints.read().get(name).map(|state| FailpointStats {
            hit_count: state.hit_count.load(Ordering::Relaxed),
            triggered_count: state.triggered_count.load(Ordering::Relaxed),
        })
    }
}

impl std::fmt::Debug for FailpointRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self.failpoints.read().keys().cloned().collect();
        f.debug_struct("FailpointRegistry")
            .field("armed", &names)
            .finish()
    }
}

/// Statistics for a failpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailpointStats {
    /// Number of times the failpoint was hit.
    pub hit_count: u64,
    /// Number of hits that produced a failure.
    pub triggered_count: u64,
}

/// Evaluate `name` on an optional registry as an I/O result.
///
/// Corruption is reported as `io::ErrorKind::InvalidData` so callers that
/// care can tell it apart.
pub fn check_io(registry: Option<&FailpointRegistry>, name: &str) -> io::Result<()> {
    let Some(registry) = registry else {
        return Ok(());
    };
    match registry.check(name) {
        FailpointResult::Continue => Ok(()),
        FailpointResult::Fail => Err(io::Error::other(format!("failpoint {} triggered", name))),
        FailpointResult::Corrupt => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("failpoint {} injected corruption", name),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_failpoint_continues() {
        let registry = FailpointRegistry::new();
        assert_eq!(registry.check("missing"), FailpointResult::Continue);
        assert!(check_io(None, names::WAL_APPEND).is_ok());
    }

    #[test]
    fn test_error_once_disarms() {
        let registry = FailpointRegistry::new();
        registry.enable(names::WAL_APPEND, FailpointAction::ErrorOnce);

        assert!(check_io(Some(&registry), names::WAL_APPEND).is_err());
        assert!(check_io(Some(&registry), names::WAL_APPEND).is_ok());

        let stats = registry.stats(names::WAL_APPEND).unwrap();
        assert_eq!(stats.hit_count, 1);
        assert_eq!(stats.triggered_count, 1);
    }

    #[test]
    fn test_error_after_countdown() {
        let registry = FailpointRegistry::new();
        registry.enable("read", FailpointAction::ErrorAfter(3));

        assert_eq!(registry.check("read"), FailpointResult::Continue);
        assert_eq!(registry.check("read"), FailpointResult::Continue);
        assert_eq!(registry.check("read"), FailpointResult::Fail);
        assert_eq!(registry.check("read"), FailpointResult::Fail);
    }

    #[test]
    fn test_corrupt_maps_to_invalid_data() {
        let registry = FailpointRegistry::new();
        registry.enable("read", FailpointAction::Corrupt);
        let err = check_io(Some(&registry), "read").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_disable() {
        let registry = FailpointRegistry::new();
        registry.enable("x", FailpointAction::Error);
        registry.disable("x");
        assert_eq!(registry.check("x"), FailpointResult::Continue);
        assert!(registry.stats("x").is_none());
    }
}
