//! The single logical thread of control owning a debug session's state.
//!
//! Every piece of session state is documented as "confined to this executor"
//! and is only touched from work items running on it. Work items run strictly
//! one at a time, in submission order (delayed items by due time), which is
//! what replaces locking for the services layered on top.

use std::{
    any::Any,
    cmp::Ordering as CmpOrdering,
    collections::BinaryHeap,
    fmt, io,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc, OnceLock,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::{self, ThreadId},
    time::Duration,
};

use thiserror::Error;
use tokio::{
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    time::Instant,
};

/// Submission error.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("executor \"{0}\" is shut down")]
    ShutDown(String),
}

/// Best-effort handle onto a queued work item.
///
/// `cancel` prevents the item from running if it has not started yet; an item
/// already running (or already finished) is unaffected.
#[derive(Debug, Clone)]
pub struct WorkHandle {
    cancelled: Arc<AtomicBool>,
}

impl WorkHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

enum Message {
    Run(WorkItem),
    Shutdown,
}

struct WorkItem {
    due: Instant,
    seq: u64,
    cancelled: Arc<AtomicBool>,
    work: Box<dyn FnOnce() + Send>,
}

impl PartialEq for WorkItem {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for WorkItem {}

impl PartialOrd for WorkItem {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for WorkItem {
    // Reversed so the earliest (due, seq) pair sits at the top of the
    // max-heap; seq breaks ties in submission order.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct Inner {
    name: String,
    tx: UnboundedSender<Message>,
    shut_down: AtomicBool,
    next_seq: AtomicU64,
    worker: OnceLock<ThreadId>,
}

/// Builder for a [`SerializedExecutor`].
#[derive(Debug, Clone, Default)]
pub struct ExecutorBuilder {
    name: Option<String>,
}

impl ExecutorBuilder {
    /// Name the executor; used as the worker thread name and in log fields.
    #[must_use]
    pub fn name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Spawn the worker thread and return the executor handle.
    ///
    /// # Errors
    /// Returns error if the worker thread cannot be spawned.
    pub fn build(self) -> io::Result<SerializedExecutor> {
        let name = self.name.unwrap_or_else(|| "dispatch".to_string());
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            name: name.clone(),
            tx,
            shut_down: AtomicBool::new(false),
            next_seq: AtomicU64::new(0),
            worker: OnceLock::new(),
        });
        let worker_inner = Arc::clone(&inner);
        thread::Builder::new()
            .name(name)
            .spawn(move || worker_loop(&worker_inner, rx))?;
        Ok(SerializedExecutor { inner })
    }
}

/// One logical thread of execution for a debug session.
///
/// Submitted work items run strictly one at a time and never overlap; state
/// confined to this executor needs no locks. The handle is cheap to clone and
/// may be used from any thread.
#[derive(Clone)]
pub struct SerializedExecutor {
    inner: Arc<Inner>,
}

impl fmt::Debug for SerializedExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerializedExecutor")
            .field("name", &self.inner.name)
            .field("shut_down", &self.inner.shut_down.load(Ordering::Acquire))
            .finish()
    }
}

impl SerializedExecutor {
    #[must_use]
    pub fn builder() -> ExecutorBuilder {
        ExecutorBuilder::default()
    }

    /// Spawn a named executor with default options.
    ///
    /// # Errors
    /// Returns error if the worker thread cannot be spawned.
    pub fn new<S: Into<String>>(name: S) -> io::Result<Self> {
        Self::builder().name(name).build()
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Enqueue `work` to run on the executor thread.
    ///
    /// Items submitted through the same executor run in submission order.
    ///
    /// # Errors
    /// Returns [`SubmitError::ShutDown`] if the executor has been shut down;
    /// the rejection is synchronous and the work is never run.
    pub fn submit(
        &self,
        work: impl FnOnce() + Send + 'static,
    ) -> Result<WorkHandle, SubmitError> {
        self.schedule(Duration::ZERO, work)
    }

    /// Enqueue `work` to run after `delay`.
    ///
    /// Delayed items are ordered by due time, ties broken by submission
    /// order. A delayed item that is not yet due when the executor shuts
    /// down is discarded.
    ///
    /// # Errors
    /// Returns [`SubmitError::ShutDown`] if the executor has been shut down.
    pub fn submit_delayed(
        &self,
        delay: Duration,
        work: impl FnOnce() + Send + 'static,
    ) -> Result<WorkHandle, SubmitError> {
        self.schedule(delay, work)
    }

    fn schedule(
        &self,
        delay: Duration,
        work: impl FnOnce() + Send + 'static,
    ) -> Result<WorkHandle, SubmitError> {
        if self.inner.shut_down.load(Ordering::Acquire) {
            return Err(SubmitError::ShutDown(self.inner.name.clone()));
        }
        let cancelled = Arc::new(AtomicBool::new(false));
        let item = WorkItem {
            due: Instant::now() + delay,
            seq: self.inner.next_seq.fetch_add(1, Ordering::Relaxed),
            cancelled: Arc::clone(&cancelled),
            work: Box::new(work),
        };
        self.inner
            .tx
            .send(Message::Run(item))
            .map_err(|_| SubmitError::ShutDown(self.inner.name.clone()))?;
        Ok(WorkHandle { cancelled })
    }

    /// Whether the calling thread is this executor's worker thread.
    ///
    /// Services use this to assert that state confined to the executor is
    /// only touched from work items running on it.
    #[must_use]
    pub fn is_on_executor_thread(&self) -> bool {
        self.inner
            .worker
            .get()
            .is_some_and(|id| *id == thread::current().id())
    }

    /// Assert confinement.
    ///
    /// # Panics
    /// Panics if the calling thread is not the executor's worker thread.
    pub fn check_confined(&self) {
        assert!(
            self.is_on_executor_thread(),
            "must be called on executor \"{}\"",
            self.inner.name
        );
    }

    /// Shut the executor down. Idempotent.
    ///
    /// Work already queued and due still runs; delayed items not yet due are
    /// discarded. Subsequent submissions are rejected synchronously.
    pub fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(executor = %self.inner.name, "shutdown requested");
        let _ = self.inner.tx.send(Message::Shutdown);
    }

    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::Acquire)
    }
}

fn worker_loop(inner: &Arc<Inner>, mut rx: UnboundedReceiver<Message>) {
    let _ = inner.worker.set(thread::current().id());
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(executor = %inner.name, error = %e, "failed to build worker runtime");
            return;
        }
    };

    let span = tracing::debug_span!("dispatch", executor = %inner.name);
    let _guard = span.enter();

    runtime.block_on(async {
        let mut queue: BinaryHeap<WorkItem> = BinaryHeap::new();
        loop {
            while queue.peek().is_some_and(|item| item.due <= Instant::now()) {
                if let Some(item) = queue.pop() {
                    run_item(&inner.name, item);
                }
            }
            let message = match queue.peek().map(|item| item.due) {
                None => rx.recv().await,
                Some(due) => tokio::select! {
                    biased;
                    message = rx.recv() => message,
                    () = tokio::time::sleep_until(due) => continue,
                },
            };
            match message {
                Some(Message::Run(item)) => queue.push(item),
                Some(Message::Shutdown) | None => break,
            }
        }

        // Drain: anything accepted before shutdown that is already due still
        // runs; delayed items not yet due are dropped.
        while let Ok(Message::Run(item)) = rx.try_recv() {
            queue.push(item);
        }
        let now = Instant::now();
        while let Some(item) = queue.pop() {
            if item.due > now {
                break;
            }
            run_item(&inner.name, item);
        }
    });

    tracing::debug!(executor = %inner.name, "worker exited");
}

fn run_item(name: &str, item: WorkItem) {
    let WorkItem {
        cancelled, work, ..
    } = item;
    if cancelled.load(Ordering::Acquire) {
        return;
    }
    // An uncaught fault in one work item must not stop the ones behind it.
    if let Err(panic) = catch_unwind(AssertUnwindSafe(work)) {
        tracing::error!(
            executor = %name,
            panic = %panic_message(panic.as_ref()),
            "uncaught panic in work item"
        );
    }
}

fn panic_message(panic: &dyn Any) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, mpsc as std_mpsc};

    fn executor() -> SerializedExecutor {
        SerializedExecutor::new("test").expect("spawn worker")
    }

    /// Blocks until everything submitted before this call has run.
    fn drain(executor: &SerializedExecutor) {
        let (tx, rx) = std_mpsc::channel();
        executor
            .submit(move || {
                tx.send(()).expect("send sentinel");
            })
            .expect("submit sentinel");
        rx.recv().expect("sentinel ran");
    }

    #[test]
    fn serializes_concurrent_submissions() {
        let executor = executor();
        let counter = Arc::new(AtomicU64::new(0));
        let mut spawners = Vec::new();
        for _ in 0..4 {
            let executor = executor.clone();
            let counter = Arc::clone(&counter);
            spawners.push(thread::spawn(move || {
                for _ in 0..250 {
                    let counter = Arc::clone(&counter);
                    executor
                        .submit(move || {
                            // Unsynchronized read-modify-write; exact only
                            // because work items never overlap.
                            let value = counter.load(Ordering::Relaxed);
                            counter.store(value + 1, Ordering::Relaxed);
                        })
                        .expect("submit");
                }
            }));
        }
        for spawner in spawners {
            spawner.join().expect("spawner thread");
        }
        drain(&executor);
        assert_eq!(counter.load(Ordering::Relaxed), 1000);
    }

    #[test]
    fn runs_in_submission_order() {
        let executor = executor();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..100 {
            let log = Arc::clone(&log);
            executor
                .submit(move || log.lock().unwrap().push(i))
                .expect("submit");
        }
        drain(&executor);
        let log = log.lock().unwrap();
        assert_eq!(*log, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn delayed_items_run_by_due_time() {
        let executor = executor();
        let log = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = std_mpsc::channel();
        let slow = Arc::clone(&log);
        executor
            .submit_delayed(Duration::from_millis(120), move || {
                slow.lock().unwrap().push("slow");
                tx.send(()).expect("send");
            })
            .expect("submit slow");
        let fast = Arc::clone(&log);
        executor
            .submit_delayed(Duration::from_millis(30), move || {
                fast.lock().unwrap().push("fast");
            })
            .expect("submit fast");
        let immediate = Arc::clone(&log);
        executor
            .submit(move || immediate.lock().unwrap().push("now"))
            .expect("submit immediate");
        rx.recv().expect("slow item ran");
        assert_eq!(*log.lock().unwrap(), vec!["now", "fast", "slow"]);
    }

    #[test]
    fn rejects_after_shutdown() {
        let executor = executor();
        executor.shutdown();
        let result = executor.submit(|| {});
        assert!(matches!(result, Err(SubmitError::ShutDown(_))));
        assert!(executor.is_shut_down());
    }

    #[test]
    fn shutdown_drains_queued_work() {
        let executor = executor();
        let (tx, rx) = std_mpsc::channel();
        executor
            .submit(move || {
                tx.send(()).expect("send");
            })
            .expect("submit");
        executor.shutdown();
        rx.recv_timeout(Duration::from_secs(5))
            .expect("queued work ran before the worker exited");
    }

    #[test]
    fn panic_does_not_stop_later_items() {
        let executor = executor();
        executor
            .submit(|| panic!("work item fault"))
            .expect("submit panicking item");
        drain(&executor);
    }

    #[test]
    fn reports_executor_thread() {
        let executor = executor();
        assert!(!executor.is_on_executor_thread());
        let (tx, rx) = std_mpsc::channel();
        let on_thread = executor.clone();
        executor
            .submit(move || {
                tx.send(on_thread.is_on_executor_thread()).expect("send");
            })
            .expect("submit");
        assert!(rx.recv().expect("probe ran"));
    }

    #[test]
    #[should_panic(expected = "must be called on executor")]
    fn check_confined_panics_off_thread() {
        executor().check_confined();
    }

    #[test]
    fn cancelled_item_never_runs() {
        let executor = executor();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let handle = executor
            .submit_delayed(Duration::from_millis(50), move || {
                flag.store(true, Ordering::Release);
            })
            .expect("submit");
        handle.cancel();
        assert!(handle.is_cancelled());
        let (tx, rx) = std_mpsc::channel();
        executor
            .submit_delayed(Duration::from_millis(120), move || {
                tx.send(()).expect("send");
            })
            .expect("submit fence");
        rx.recv().expect("fence ran");
        assert!(!ran.load(Ordering::Acquire));
    }
}
