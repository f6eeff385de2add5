//! Process-wide failure signalling.
//!
//! Components that hit a node-fatal condition (a WAL append that exhausted
//! its retries, a metadata write failure, a system worker that died) report a
//! [`FailureContext`] to the node's [`FailureProcessor`]. The configured
//! [`FailureHandler`] decides whether the node stops.

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, warn};

/// Classification of a node-fatal failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureType {
    /// Durability of the log or the metadata can no longer be guaranteed.
    CriticalError,
    /// A system worker thread terminated unexpectedly.
    SystemWorkerTermination,
    /// A system worker stopped making progress.
    SystemWorkerBlocked,
}

impl fmt::Display for FailureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureType::CriticalError => "CRITICAL_ERROR",
            FailureType::SystemWorkerTermination => "SYSTEM_WORKER_TERMINATION",
            FailureType::SystemWorkerBlocked => "SYSTEM_WORKER_BLOCKED",
        };
        f.write_str(name)
    }
}

/// A failure together with its rendered causal chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureContext {
    pub failure_type: FailureType,
    pub error: String,
}

impl FailureContext {
    pub fn new(failure_type: FailureType, error: impl Into<String>) -> Self {
        Self {
            failure_type,
            error: error.into(),
        }
    }

    /// Build a context from an error, including all of its sources.
    pub fn from_error(
        failure_type: FailureType,
        err: &(dyn std::error::Error + 'static),
    ) -> Self {
        Self::new(failure_type, crate::error::chain(err))
    }
}

/// Decides what happens to the node when a failure is reported.
pub trait FailureHandler: Send + Sync {
    /// Returns `true` if the node must stop.
    fn on_failure(&self, ctx: &FailureContext) -> bool;
}

/// Logs the failure and keeps the node running.
#[derive(Debug, Default)]
pub struct NoOpFailureHandler;

impl FailureHandler for NoOpFailureHandler {
    fn on_failure(&self, ctx: &FailureContext) -> bool {
        warn!(failure = %ctx.failure_type, error = %ctx.error, "Failure ignored by handler");
        false
    }
}

/// Requests a node stop on every failure.
#[derive(Debug, Default)]
pub struct StopNodeFailureHandler;

impl FailureHandler for StopNodeFailureHandler {
    fn on_failure(&self, _ctx: &FailureContext) -> bool {
        true
    }
}

/// Routes failures to a handler and remembers the first one.
pub struct FailureProcessor {
    handler: Arc<dyn FailureHandler>,
    first: Mutex<Option<FailureContext>>,
    stopping: AtomicBool,
}

impl FailureProcessor {
    pub fn new(handler: Arc<dyn FailureHandler>) -> Self {
        Self {
            handler,
            first: Mutex::new(None),
            stopping: AtomicBool::new(false),
        }
    }

    /// Report a failure. Returns `true` if the node is now stopping.
    pub fn process(&self, ctx: FailureContext) -> bool {
        if self.stopping.load(Ordering::Acquire) {
            return true;
        }

        error!(failure = %ctx.failure_type, error = %ctx.error, "Critical system error detected");

        let stop = self.handler.on_failure(&ctx);
        {
            let mut first = self.first.lock();
            if first.is_none() {
                *first = Some(ctx);
            }
        }
        if stop {
            self.stopping.store(true, Ordering::Release);
        }
        stop
    }

    /// The first reported failure, if any.
    pub fn failure_context(&self) -> Option<FailureContext> {
        self.first.lock().clone()
    }

    /// Whether a handler requested the node to stop.
    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }
}

impl Default for FailureProcessor {
    fn default() -> Self {
        Self::new(Arc::new(StopNodeFailureHandler))
    }
}

impl fmt::Debug for FailureProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FailureProcessor")
            .field("stopping", &self.is_stopping())
            .field("first", &*self.first.lock())
            .finish()
    }
}
