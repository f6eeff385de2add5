//! The exchange worker: one topology change at a time, in submission order.
//!
//! Tasks are submitted through a cloneable [`ExchangeQueue`] and consumed by
//! the `exchange-worker` thread. With merging enabled, topology tasks that are
//! already queued behind the head are coalesced into a single exchange; a
//! task that opts out of merging ends the run and is processed on its own.

use crate::config::ExchangeConfig;
use crate::error::ExchangeError;
use crate::exchange::task::{ExchangeFuture, ExchangeTask, HistoricalExclusions};
use crate::types::{ExchangeId, NodeId, TopologyVersion};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// What an exchange hands to its listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeContext {
    /// Id of the exchange being completed (the last one when merged).
    pub id: ExchangeId,
    /// Node set of the new topology.
    pub nodes: Vec<NodeId>,
    /// Ids of the exchanges merged into this one, in submission order.
    pub merged: Vec<ExchangeId>,
}

/// Receives completed exchanges.
pub trait ExchangeListener: Send + Sync {
    /// Apply a new topology: compute affinity and start rebalancing.
    fn on_exchange(&self, ctx: &ExchangeContext) -> Result<(), ExchangeError>;

    /// Re-plan the rebalance of `exchange_id` with some suppliers excluded.
    fn on_reassign(&self, exchange_id: ExchangeId, exclusions: &HistoricalExclusions);
}

enum Message {
    Task(ExchangeTask),
    Shutdown,
}

#[derive(Default)]
struct QueueState {
    last_completed: Mutex<Option<ExchangeId>>,
    stopped: AtomicBool,
}

/// Submission side of the exchange worker.
#[derive(Clone)]
pub struct ExchangeQueue {
    tx: mpsc::UnboundedSender<Message>,
    state: Arc<QueueState>,
}

impl ExchangeQueue {
    /// Queue a task. A task submitted after stop fails right away.
    pub fn submit(&self, task: ExchangeTask) {
        if self.state.stopped.load(Ordering::Acquire) {
            task.fail(ExchangeError::Stopped);
            return;
        }
        if let Err(mpsc::error::SendError(Message::Task(task))) = self.tx.send(Message::Task(task))
        {
            task.fail(ExchangeError::Stopped);
        }
    }

    /// Queue a topology change and return its future.
    pub fn submit_topology(&self, id: ExchangeId, nodes: Vec<NodeId>) -> ExchangeFuture {
        let (task, future) = ExchangeTask::topology(id, nodes);
        self.submit(task);
        future
    }

    /// Id of the last exchange that completed successfully.
    pub fn last_completed(&self) -> Option<ExchangeId> {
        *self.state.last_completed.lock()
    }

    /// Topology version of the last completed exchange.
    pub fn last_version(&self) -> TopologyVersion {
        self.last_completed()
            .map(|id| id.version)
            .unwrap_or(TopologyVersion::NONE)
    }
}

/// Owns the `exchange-worker` thread.
pub struct ExchangeWorker {
    config: ExchangeConfig,
    queue: ExchangeQueue,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ExchangeWorker {
    /// Create the worker. Tasks can be queued before [`start`](Self::start).
    pub fn new(config: ExchangeConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            config,
            queue: ExchangeQueue {
                tx,
                state: Arc::new(QueueState::default()),
            },
            rx: Mutex::new(Some(rx)),
            handle: Mutex::new(None),
        }
    }

    pub fn queue(&self) -> ExchangeQueue {
        self.queue.clone()
    }

    /// Start the worker thread. The listener is held weakly so the worker
    /// never keeps its owner alive.
    pub fn start(&self, listener: Weak<dyn ExchangeListener>) -> Result<(), ExchangeError> {
        let Some(rx) = self.rx.lock().take() else {
            return Err(ExchangeError::Failed {
                version: TopologyVersion::NONE.to_string(),
                reason: "exchange worker already started".to_string(),
            });
        };
        let mut runner = Runner {
            merge: self.config.merge_exchanges,
            rx,
            pending: VecDeque::new(),
            state: self.queue.state.clone(),
            listener,
        };
        let handle = thread::Builder::new()
            .name("exchange-worker".to_string())
            .spawn(move || runner.run())
            .map_err(|e| ExchangeError::Failed {
                version: TopologyVersion::NONE.to_string(),
                reason: format!("cannot start exchange worker: {}", e),
            })?;
        *self.handle.lock() = Some(handle);
        Ok(())
    }

    /// Stop the worker. Queued tasks fail with [`ExchangeError::Stopped`].
    pub fn stop(&self) {
        if self.queue.state.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.queue.tx.send(Message::Shutdown);
        if let Some(handle) = self.handle.lock().take() {
            // The last owner may be dropped on the worker itself.
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                warn!("Exchange worker panicked");
            }
        }
        // Never started: fail what was queued.
        if let Some(mut rx) = self.rx.lock().take() {
            while let Ok(message) = rx.try_recv() {
                if let Message::Task(task) = message {
                    task.fail(ExchangeError::Stopped);
                }
            }
        }
        debug!("Exchange worker stopped");
    }
}

impl Drop for ExchangeWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Runner {
    merge: bool,
    rx: mpsc::UnboundedReceiver<Message>,
    /// Tasks pulled off the channel while looking for merge candidates.
    pending: VecDeque<ExchangeTask>,
    state: Arc<QueueState>,
    listener: Weak<dyn ExchangeListener>,
}

impl Runner {
    fn run(&mut self) {
        while let Some(task) = self.next_task() {
            let Some(listener) = self.listener.upgrade() else {
                task.fail(ExchangeError::Stopped);
                break;
            };
            match task {
                ExchangeTask::Topology { id, nodes, future } => {
                    let mut futures = vec![future];
                    let mut ctx = ExchangeContext {
                        id,
                        nodes,
                        merged: vec![id],
                    };
                    if self.merge {
                        self.merge_queued(&mut ctx, &mut futures);
                    }
                    self.process_topology(listener.as_ref(), ctx, futures);
                }
                ExchangeTask::RebalanceReassign {
                    exchange_id,
                    historical_exclusions,
                } => {
                    let current = *self.state.last_completed.lock();
                    if current != Some(exchange_id) {
                        debug!(
                            exchange = %exchange_id,
                            "Skipping stale rebalance reassignment"
                        );
                        continue;
                    }
                    info!(
                        exchange = %exchange_id,
                        exclusions = ?historical_exclusions,
                        "Reassigning rebalance suppliers"
                    );
                    listener.on_reassign(exchange_id, &historical_exclusions);
                }
            }
        }
        self.drain();
    }

    fn next_task(&mut self) -> Option<ExchangeTask> {
        if self.state.stopped.load(Ordering::Acquire) {
            return None;
        }
        if let Some(task) = self.pending.pop_front() {
            return Some(task);
        }
        match self.rx.blocking_recv() {
            Some(Message::Task(task)) => Some(task),
            Some(Message::Shutdown) | None => None,
        }
    }

    /// Fold already-queued topology tasks into `ctx`.
    fn merge_queued(&mut self, ctx: &mut ExchangeContext, futures: &mut Vec<ExchangeFuture>) {
        loop {
            while let Ok(message) = self.rx.try_recv() {
                match message {
                    Message::Task(task) => self.pending.push_back(task),
                    Message::Shutdown => {
                        self.state.stopped.store(true, Ordering::Release);
                        return;
                    }
                }
            }
            let mergeable = self
                .pending
                .front()
                .is_some_and(|t| !t.skip_for_exchange_merge());
            if !mergeable {
                return;
            }
            if let Some(ExchangeTask::Topology { id, nodes, future }) = self.pending.pop_front() {
                debug!(merged = %id, into = %ctx.id, "Merging exchange");
                ctx.id = id;
                ctx.nodes = nodes;
                ctx.merged.push(id);
                futures.push(future);
            }
        }
    }

    fn process_topology(
        &self,
        listener: &dyn ExchangeListener,
        ctx: ExchangeContext,
        futures: Vec<ExchangeFuture>,
    ) {
        let version = ctx.id.version;
        match listener.on_exchange(&ctx) {
            Ok(()) => {
                *self.state.last_completed.lock() = Some(ctx.id);
                info!(
                    version = %version,
                    nodes = ?ctx.nodes,
                    merged = ctx.merged.len(),
                    "Exchange completed"
                );
                for future in futures {
                    future.complete(Ok(version));
                }
            }
            Err(e) => {
                warn!(version = %version, error = %e, "Exchange failed");
                for future in futures {
                    future.complete(Err(e.clone()));
                }
            }
        }
    }

    fn drain(&mut self) {
        self.rx.close();
        for task in self.pending.drain(..) {
            task.fail(ExchangeError::Stopped);
        }
        while let Ok(message) = self.rx.try_recv() {
            if let Message::Task(task) = message {
                task.fail(ExchangeError::Stopped);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::future::FutureError;
    use crate::types::TopologyEvent;
    use std::sync::mpsc as std_mpsc;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        exchanges: Mutex<Vec<ExchangeContext>>,
        reassigns: Mutex<Vec<ExchangeId>>,
        /// Blocks the first exchange until released.
        gate: Mutex<Option<std_mpsc::Receiver<()>>>,
        fail_version: Mutex<Option<TopologyVersion>>,
    }

    impl ExchangeListener for Recorder {
        fn on_exchange(&self, ctx: &ExchangeContext) -> Result<(), ExchangeError> {
            if let Some(gate) = self.gate.lock().take() {
                let _ = gate.recv_timeout(Duration::from_secs(5));
            }
            self.exchanges.lock().push(ctx.clone());
            if *self.fail_version.lock() == Some(ctx.id.version) {
                return Err(ExchangeError::Failed {
                    version: ctx.id.version.to_string(),
                    reason: "injected".to_string(),
                });
            }
            Ok(())
        }

        fn on_reassign(&self, exchange_id: ExchangeId, _exclusions: &HistoricalExclusions) {
            self.reassigns.lock().push(exchange_id);
        }
    }

    fn id(major: u64, node: NodeId) -> ExchangeId {
        ExchangeId::new(TopologyVersion::new(major, 0), TopologyEvent::NodeJoined(node))
    }

    fn start(merge: bool, recorder: &Arc<Recorder>) -> ExchangeWorker {
        let worker = ExchangeWorker::new(ExchangeConfig::default().with_merge(merge));
        let listener: Arc<dyn ExchangeListener> = recorder.clone();
        worker.start(Arc::downgrade(&listener)).unwrap();
        worker
    }

    #[test]
    fn test_tasks_run_in_submission_order() {
        let recorder = Arc::new(Recorder::default());
        let worker = start(false, &recorder);
        let queue = worker.queue();

        let futures: Vec<_> = (1..=3)
            .map(|v| queue.submit_topology(id(v, v), (1..=v).collect()))
            .collect();
        for (i, f) in futures.iter().enumerate() {
            assert_eq!(
                f.wait(Duration::from_secs(5)),
                Some(Ok(TopologyVersion::new(i as u64 + 1, 0)))
            );
        }
        let versions: Vec<_> = recorder
            .exchanges
            .lock()
            .iter()
            .map(|c| c.id.version.major)
            .collect();
        assert_eq!(versions, vec![1, 2, 3]);
        assert_eq!(queue.last_version(), TopologyVersion::new(3, 0));
        worker.stop();
    }

    #[test]
    fn test_queued_topologies_merge() {
        let recorder = Arc::new(Recorder::default());
        let (release, gate) = std_mpsc::channel();
        *recorder.gate.lock() = Some(gate);
        let worker = start(true, &recorder);
        let queue = worker.queue();

        let first = queue.submit_topology(id(1, 1), vec![1]);
        // Let the worker pick up the first task and block in the listener.
        std::thread::sleep(Duration::from_millis(50));
        let second = queue.submit_topology(id(2, 2), vec![1, 2]);
        let third = queue.submit_topology(id(3, 3), vec![1, 2, 3]);
        release.send(()).unwrap();

        assert_eq!(first.get(), Ok(TopologyVersion::new(1, 0)));
        assert_eq!(second.get(), Ok(TopologyVersion::new(3, 0)));
        assert_eq!(third.get(), Ok(TopologyVersion::new(3, 0)));

        let exchanges = recorder.exchanges.lock().clone();
        assert_eq!(exchanges.len(), 2);
        assert_eq!(exchanges[1].merged, vec![id(2, 2), id(3, 3)]);
        assert_eq!(exchanges[1].nodes, vec![1, 2, 3]);
        worker.stop();
    }

    #[test]
    fn test_reassign_ends_merge_run() {
        let recorder = Arc::new(Recorder::default());
        let (release, gate) = std_mpsc::channel();
        *recorder.gate.lock() = Some(gate);
        let worker = start(true, &recorder);
        let queue = worker.queue();

        let first = queue.submit_topology(id(1, 1), vec![1]);
        std::thread::sleep(Duration::from_millis(50));
        queue.submit(ExchangeTask::RebalanceReassign {
            exchange_id: id(1, 1),
            historical_exclusions: HistoricalExclusions::new(),
        });
        let second = queue.submit_topology(id(2, 2), vec![1, 2]);
        release.send(()).unwrap();

        assert!(first.get().is_ok());
        assert!(second.get().is_ok());
        assert_eq!(recorder.reassigns.lock().clone(), vec![id(1, 1)]);
        assert_eq!(recorder.exchanges.lock().len(), 2);
        worker.stop();
    }

    #[test]
    fn test_stale_reassign_is_skipped() {
        let recorder = Arc::new(Recorder::default());
        let worker = start(false, &recorder);
        let queue = worker.queue();

        queue.submit_topology(id(1, 1), vec![1]).get().unwrap();
        queue.submit_topology(id(2, 2), vec![1, 2]).get().unwrap();
        queue.submit(ExchangeTask::RebalanceReassign {
            exchange_id: id(1, 1),
            historical_exclusions: HistoricalExclusions::new(),
        });
        queue.submit_topology(id(3, 3), vec![1, 2, 3]).get().unwrap();

        assert!(recorder.reassigns.lock().is_empty());
        worker.stop();
    }

    #[test]
    fn test_listener_failure_fails_future() {
        let recorder = Arc::new(Recorder::default());
        *recorder.fail_version.lock() = Some(TopologyVersion::new(1, 0));
        let worker = start(false, &recorder);
        let queue = worker.queue();

        let future = queue.submit_topology(id(1, 1), vec![1]);
        assert!(matches!(
            future.get(),
            Err(FutureError::Failed(ExchangeError::Failed { .. }))
        ));
        assert_eq!(queue.last_completed(), None);
        worker.stop();
    }

    #[test]
    fn test_submit_after_stop_fails() {
        let recorder = Arc::new(Recorder::default());
        let worker = start(false, &recorder);
        let queue = worker.queue();
        worker.stop();

        let future = queue.submit_topology(id(1, 1), vec![1]);
        assert_eq!(
            future.get(),
            Err(FutureError::Failed(ExchangeError::Stopped))
        );
    }
}
