//! Blocking completion futures.
//!
//! A [`CompletionFuture`] is a one-shot result slot shared between the thread
//! that produces a value and any number of threads that wait for it. Waiting
//! is synchronous (`get` / `wait(timeout)`), backed by a `parking_lot`
//! condition variable. Cancellation is a terminal state like success or
//! failure; whichever completion lands first wins.
//!
//! ```rust,ignore
//! let fut: CompletionFuture<u64, MetadataError> = CompletionFuture::new();
//! let producer = fut.clone();
//! std::thread::spawn(move || producer.complete(Ok(42)));
//! assert_eq!(fut.get(), Ok(42));
//! ```

use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Why a future did not produce a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FutureError<E> {
    /// The future was cancelled before completion.
    Cancelled,
    /// The producer failed.
    Failed(E),
}

impl<E: fmt::Display> fmt::Display for FutureError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FutureError::Cancelled => f.write_str("cancelled"),
            FutureError::Failed(e) => write!(f, "{}", e),
        }
    }
}

/// Final outcome of a future.
pub type Outcome<T, E> = Result<T, FutureError<E>>;

type Listener<T, E> = Box<dyn FnOnce(&Outcome<T, E>) + Send>;

struct State<T, E> {
    outcome: Option<Outcome<T, E>>,
    listeners: Vec<Listener<T, E>>,
}

struct Inner<T, E> {
    state: Mutex<State<T, E>>,
    cond: Condvar,
}

/// One-shot, cloneable, blocking future.
pub struct CompletionFuture<T, E> {
    inner: Arc<Inner<T, E>>,
}

impl<T, E> Clone for CompletionFuture<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone, E: Clone> Default for CompletionFuture<T, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone, E: Clone> CompletionFuture<T, E> {
    /// Create a pending future.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    outcome: None,
                    listeners: Vec::new(),
                }),
                cond: Condvar::new(),
            }),
        }
    }

    /// Create a future that is already completed with `value`.
    pub fn completed(value: T) -> Self {
        let fut = Self::new();
        fut.complete(Ok(value));
        fut
    }

    /// Complete with a value or a failure. Returns `false` if already done.
    pub fn complete(&self, result: Result<T, E>) -> bool {
        self.finish(result.map_err(FutureError::Failed))
    }

    /// Cancel the future. Returns `false` if already done.
    pub fn cancel(&self) -> bool {
        self.finish(Err(FutureError::Cancelled))
    }

    fn finish(&self, outcome: Outcome<T, E>) -> bool {
        let listeners = {
            let mut state = self.inner.state.lock();
            if state.outcome.is_some() {
                return false;
            }
            state.outcome = Some(outcome.clone());
            std::mem::take(&mut state.listeners)
        };
        self.inner.cond.notify_all();

        for listener in listeners {
            listener(&outcome);
        }
        true
    }

    /// Whether the future reached a terminal state.
    pub fn is_done(&self) -> bool {
        self.inner.state.lock().outcome.is_some()
    }

    /// Whether the future was cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self.inner.state.lock().outcome,
            Some(Err(FutureError::Cancelled))
        )
    }

    /// Non-blocking peek at the outcome.
    pub fn try_get(&self) -> Option<Outcome<T, E>> {
        self.inner.state.lock().outcome.clone()
    }

    /// Block until the future completes.
    pub fn get(&self) -> Outcome<T, E> {
        let mut state = self.inner.state.lock();
        loop {
            if let Some(outcome) = &state.outcome {
                return outcome.clone();
            }
            self.inner.cond.wait(&mut state);
        }
    }

    /// Block for at most `timeout`. Returns `None` if still pending.
    pub fn wait(&self, timeout: Duration) -> Option<Outcome<T, E>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        loop {
            if let Some(outcome) = &state.outcome {
                return Some(outcome.clone());
            }
            if self.inner.cond.wait_until(&mut state, deadline).timed_out() {
                return state.outcome.clone();
            }
        }
    }

    /// Run `f` on completion, or right away if already complete.
    pub fn listen<F>(&self, f: F)
    where
        F: FnOnce(&Outcome<T, E>) + Send + 'static,
    {
        let mut state = self.inner.state.lock();
        match state.outcome.clone() {
            Some(outcome) => {
                drop(state);
                f(&outcome);
            }
            None => state.listeners.push(Box::new(f)),
        }
    }
}

impl<T: fmt::Debug, E: fmt::Debug> fmt::Debug for CompletionFuture<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("CompletionFuture")
            .field("outcome", &state.outcome)
            .field("listeners", &state.listeners.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_first_completion_wins() {
        let fut: CompletionFuture<u32, String> = CompletionFuture::new();
        assert!(!fut.is_done());
        assert!(fut.complete(Ok(1)));
        assert!(!fut.complete(Ok(2)));
        assert!(!fut.cancel());
        assert_eq!(fut.get(), Ok(1));
        assert!(!fut.is_cancelled());
    }

    #[test]
    fn test_get_blocks_until_completed() {
        let fut: CompletionFuture<u32, String> = CompletionFuture::new();
        let producer = fut.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer.complete(Err("failed".to_string()));
        });
        assert_eq!(fut.get(), Err(FutureError::Failed("failed".to_string())));
        handle.join().unwrap();
    }

    #[test]
    fn test_wait_times_out() {
        let fut: CompletionFuture<(), ()> = CompletionFuture::new();
        assert!(fut.wait(Duration::from_millis(10)).is_none());
        fut.cancel();
        assert_eq!(
            fut.wait(Duration::from_millis(10)),
            Some(Err(FutureError::Cancelled))
        );
        assert!(fut.is_cancelled());
    }

    #[test]
    fn test_listeners_run_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let fut: CompletionFuture<u32, ()> = CompletionFuture::new();

        let c = calls.clone();
        fut.listen(move |outcome| {
            assert_eq!(outcome, &Ok(5));
            c.fetch_add(1, Ordering::SeqCst);
        });
        fut.complete(Ok(5));
        fut.complete(Ok(6));

        let c = calls.clone();
        fut.listen(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_completed_constructor() {
        let fut: CompletionFuture<&str, ()> = CompletionFuture::completed("ok");
        assert!(fut.is_done());
        assert_eq!(fut.try_get(), Some(Ok("ok")));
    }
}
