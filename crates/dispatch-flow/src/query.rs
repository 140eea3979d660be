//! Blocking bridge between foreign threads and the executor.
//!
//! Ordinary synchronous call sites (a property getter, a test) sometimes
//! need the result of a computation that must run on the session's
//! executor. A `Query` submits the computation and parks the calling thread
//! until it completes. The executor side may cancel an in-flight refresh,
//! in which case the blocked caller wakes with the previous cached value
//! rather than an error: best-effort refresh, keep the stale value.
//!
//! Nothing here ever blocks the executor thread itself; `get` asserts it is
//! called from a foreign thread, and `cancel` asserts the opposite.

use std::sync::{Arc, Condvar, Mutex};

use dispatch_executor::{SerializedExecutor, SubmitError};
use dispatch_monitor::{CancelHandle, CompletionToken, ErrorKind, ErrorStatus, Status};
use thiserror::Error;

/// Query error.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("query cancelled with no previous result")]
    Cancelled,
    #[error("query failed: {0}")]
    Failed(ErrorStatus),
    #[error("query submission rejected: {0}")]
    Rejected(#[from] SubmitError),
}

enum Outcome<V> {
    Value(V),
    Cancelled,
    Failed(ErrorStatus),
}

struct QueryState<V> {
    generation: u64,
    in_flight: bool,
    chain: Option<CancelHandle>,
    cached: Option<V>,
    outcome: Option<Outcome<V>>,
}

struct Shared<V> {
    state: Mutex<QueryState<V>>,
    wakeup: Condvar,
}

type ComputeFn<V> = Box<dyn FnMut(CompletionToken<V>) + Send + 'static>;

/// Bridge that lets a foreign thread block on an executor-side computation.
///
/// The handle is cheap to clone; typically one clone lives with the
/// executor-side service (to call [`Self::cancel`]) while callers share
/// another.
pub struct Query<V: Clone + Send + 'static> {
    executor: SerializedExecutor,
    compute: Arc<Mutex<ComputeFn<V>>>,
    shared: Arc<Shared<V>>,
}

impl<V: Clone + Send + 'static> Clone for Query<V> {
    fn clone(&self) -> Self {
        Self {
            executor: self.executor.clone(),
            compute: Arc::clone(&self.compute),
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<V: Clone + Send + 'static> Query<V> {
    /// Create a query around `compute`, which runs on `executor` for each
    /// [`Self::get`] and must eventually complete the token it is given
    /// (with a result on success, or a failure status).
    #[must_use]
    pub fn new<F>(executor: &SerializedExecutor, compute: F) -> Self
    where
        F: FnMut(CompletionToken<V>) + Send + 'static,
    {
        Self {
            executor: executor.clone(),
            compute: Arc::new(Mutex::new(Box::new(compute))),
            shared: Arc::new(Shared {
                state: Mutex::new(QueryState {
                    generation: 0,
                    in_flight: false,
                    chain: None,
                    cached: None,
                    outcome: None,
                }),
                wakeup: Condvar::new(),
            }),
        }
    }

    /// The last value a successful [`Self::get`] produced, if any.
    #[must_use]
    pub fn cached(&self) -> Option<V> {
        self.shared.state.lock().unwrap().cached.clone()
    }

    /// Run the computation on the executor and block until it completes.
    ///
    /// # Errors
    /// Returns [`QueryError::Rejected`] if the executor refuses the
    /// submission, [`QueryError::Failed`] if the computation fails, and
    /// [`QueryError::Cancelled`] if it was cancelled before any value was
    /// ever produced (a cancelled refresh with a cached value returns the
    /// cached value instead).
    ///
    /// # Panics
    /// Panics if called from the executor's own thread (it would deadlock
    /// the executor against itself) or while another `get` is in flight.
    pub fn get(&self) -> Result<V, QueryError> {
        assert!(
            !self.executor.is_on_executor_thread(),
            "Query::get would deadlock the executor against itself"
        );
        let token = {
            let mut state = self.shared.state.lock().unwrap();
            assert!(!state.in_flight, "a query is already in flight");
            state.generation += 1;
            state.in_flight = true;
            state.outcome = None;
            let token = self.make_token(state.generation);
            state.chain = Some(token.cancel_handle());
            token
        };

        let compute = Arc::clone(&self.compute);
        if let Err(error) = self.executor.submit(move || {
            let mut compute = compute.lock().unwrap();
            compute(token);
        }) {
            let mut state = self.shared.state.lock().unwrap();
            state.in_flight = false;
            state.chain = None;
            return Err(QueryError::Rejected(error));
        }

        let mut state = self.shared.state.lock().unwrap();
        while state.outcome.is_none() {
            state = self.shared.wakeup.wait(state).unwrap();
        }
        match state.outcome.take() {
            Some(Outcome::Value(value)) => Ok(value),
            Some(Outcome::Cancelled) => state.cached.clone().ok_or(QueryError::Cancelled),
            Some(Outcome::Failed(error)) => Err(QueryError::Failed(error)),
            None => unreachable!("wait loop exits with an outcome"),
        }
    }

    /// Abort the in-flight computation, waking the blocked caller with the
    /// cached value (if any). No-op when nothing is in flight.
    ///
    /// # Panics
    /// Panics if called from any thread but the executor's own.
    pub fn cancel(&self) {
        self.executor.check_confined();
        let mut state = self.shared.state.lock().unwrap();
        if !state.in_flight {
            return;
        }
        state.in_flight = false;
        state.outcome = Some(Outcome::Cancelled);
        // Advisory: let the abandoned computation notice and stop early.
        if let Some(chain) = state.chain.take() {
            chain.request_cancel();
        }
        self.shared.wakeup.notify_all();
    }

    fn make_token(&self, generation: u64) -> CompletionToken<V> {
        let shared = Arc::clone(&self.shared);
        CompletionToken::new(&self.executor).on_done(move |status, result: Option<V>, _parent| {
            let mut state = shared.state.lock().unwrap();
            // A completion from an aborted or superseded generation is
            // discarded; the caller already went away with the cached value.
            if state.generation != generation || !state.in_flight {
                return;
            }
            state.in_flight = false;
            state.chain = None;
            state.outcome = Some(match (status, result) {
                (Status::Ok, Some(value)) => {
                    state.cached = Some(value.clone());
                    Outcome::Value(value)
                }
                (Status::Ok, None) => Outcome::Failed(ErrorStatus::new(
                    ErrorKind::Internal,
                    "query computation completed with no result",
                )),
                (Status::Cancelled, _) => Outcome::Cancelled,
                (Status::Error(error), _) => Outcome::Failed(error),
            });
            shared.wakeup.notify_all();
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{AssertUnwindSafe, catch_unwind};
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    fn executor() -> SerializedExecutor {
        SerializedExecutor::new("query-test").expect("spawn worker")
    }

    /// Blocks until the hanging computation has parked its token.
    fn wait_for_pending(pending: &Arc<Mutex<Option<CompletionToken<u32>>>>) {
        while pending.lock().unwrap().is_none() {
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn returns_the_computed_value() {
        let executor = executor();
        let query = Query::new(&executor, |token| token.complete_with_result(7));
        assert_eq!(query.get().expect("query succeeded"), 7);
        assert_eq!(query.cached(), Some(7));
    }

    #[test]
    fn surfaces_computation_failure() {
        let executor = executor();
        let query = Query::new(&executor, |token: CompletionToken<u32>| {
            token.complete_with(Status::request_failed("no symbols loaded"));
        });
        match query.get() {
            Err(QueryError::Failed(error)) => {
                assert_eq!(error.message(), "no symbols loaded");
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn cancel_wakes_caller_with_stale_value() {
        let executor = executor();
        let pending: Arc<Mutex<Option<CompletionToken<u32>>>> = Arc::new(Mutex::new(None));
        let stash = Arc::clone(&pending);
        let mut first = true;
        let query = Query::new(&executor, move |token| {
            if first {
                first = false;
                token.complete_with_result(7);
            } else {
                // Leave the refresh hanging until someone cancels it.
                *stash.lock().unwrap() = Some(token);
            }
        });
        assert_eq!(query.get().expect("first query succeeded"), 7);

        let blocked = {
            let query = query.clone();
            thread::spawn(move || query.get())
        };
        wait_for_pending(&pending);
        let canceller = query.clone();
        executor
            .submit(move || canceller.cancel())
            .expect("submit cancel");
        let result = blocked.join().expect("caller thread");
        assert_eq!(result.expect("stale value returned"), 7);
        // The abandoned computation saw the advisory flag.
        let token = pending.lock().unwrap().take().expect("refresh was pending");
        assert!(token.is_cancel_requested());
        token.complete_with(Status::Cancelled);
    }

    #[test]
    fn cancel_without_cache_reports_cancelled() {
        let executor = executor();
        let pending: Arc<Mutex<Option<CompletionToken<u32>>>> = Arc::new(Mutex::new(None));
        let stash = Arc::clone(&pending);
        let query = Query::new(&executor, move |token| {
            *stash.lock().unwrap() = Some(token);
        });
        let blocked = {
            let query = query.clone();
            thread::spawn(move || query.get())
        };
        wait_for_pending(&pending);
        let canceller = query.clone();
        executor
            .submit(move || canceller.cancel())
            .expect("submit cancel");
        let result = blocked.join().expect("caller thread");
        assert!(matches!(result, Err(QueryError::Cancelled)));
    }

    #[test]
    fn stale_completion_after_cancel_is_discarded() {
        let executor = executor();
        let pending: Arc<Mutex<Option<CompletionToken<u32>>>> = Arc::new(Mutex::new(None));
        let stash = Arc::clone(&pending);
        let mut calls = 0;
        let query = Query::new(&executor, move |token| {
            calls += 1;
            if calls == 1 {
                *stash.lock().unwrap() = Some(token);
            } else {
                token.complete_with_result(2);
            }
        });

        let blocked = {
            let query = query.clone();
            thread::spawn(move || query.get())
        };
        wait_for_pending(&pending);
        let canceller = query.clone();
        executor
            .submit(move || canceller.cancel())
            .expect("submit cancel");
        assert!(matches!(
            blocked.join().expect("caller thread"),
            Err(QueryError::Cancelled)
        ));

        // The first generation completes late; it must not disturb the
        // second run.
        let stale = pending.lock().unwrap().take().expect("refresh was pending");
        stale.complete_with_result(1);
        assert_eq!(query.get().expect("second query succeeded"), 2);
    }

    #[test]
    fn get_on_executor_thread_is_refused() {
        let executor = executor();
        let query = Query::new(&executor, |token| token.complete_with_result(7));
        let (tx, rx) = mpsc::channel();
        let probe = query.clone();
        executor
            .submit(move || {
                let result = catch_unwind(AssertUnwindSafe(|| probe.get()));
                tx.send(result.is_err()).expect("report");
            })
            .expect("submit probe");
        assert!(rx.recv().expect("probe ran"), "get() must refuse the executor thread");
    }

    #[test]
    fn rejected_when_executor_is_shut_down() {
        let executor = executor();
        let query = Query::new(&executor, |token| token.complete_with_result(7));
        executor.shutdown();
        assert!(matches!(query.get(), Err(QueryError::Rejected(_))));
    }
}
