//! Ordered asynchronous workflows with compensating rollback.
//!
//! A sequence runs its steps one at a time on the session's executor. Each
//! step performs (possibly asynchronous) work and completes the token it is
//! given; on success the cursor advances, and once it passes the last step
//! the sequence's final token completes `Ok`. A step failure (or a
//! cancellation observed at a step boundary) captures the triggering
//! status and unwinds: every step that finished its execute phase has its
//! rollback invoked, in reverse order. The captured status is the
//! sequence's terminal status; rollback is best-effort cleanup and never
//! overwrites it.

use std::sync::{Arc, Mutex};

use dispatch_executor::SerializedExecutor;
use dispatch_monitor::{CancelHandle, CompletionToken, ErrorKind, Status};

use crate::{Query, QueryError};

/// One stage of a [`Sequence`].
///
/// `execute` performs the step's work and must eventually complete the
/// token: `complete()` to advance, or `complete_with(status)` to abort the
/// whole sequence with `status` as its terminal outcome. Long-running steps
/// should poll the token's cancellation flag at safe points and complete
/// with [`Status::Cancelled`] when it is set.
pub trait Step: Send + 'static {
    fn execute(&mut self, token: CompletionToken);

    /// Undo the step's work. Only ever invoked after `execute` completed
    /// successfully. The default has nothing to undo.
    fn roll_back(&mut self, token: CompletionToken) {
        token.complete();
    }

    /// Relative progress weight reported through the progress callback.
    fn ticks(&self) -> u32 {
        1
    }
}

/// A [`Step`] built from closures, for sequences simple enough not to
/// warrant a named type.
pub struct FnStep {
    execute: Option<Box<dyn FnOnce(CompletionToken) + Send>>,
    roll_back: Option<Box<dyn FnOnce(CompletionToken) + Send>>,
}

impl FnStep {
    #[must_use]
    pub fn new<F>(execute: F) -> Self
    where
        F: FnOnce(CompletionToken) + Send + 'static,
    {
        Self {
            execute: Some(Box::new(execute)),
            roll_back: None,
        }
    }

    #[must_use]
    pub fn with_roll_back<F>(mut self, roll_back: F) -> Self
    where
        F: FnOnce(CompletionToken) + Send + 'static,
    {
        self.roll_back = Some(Box::new(roll_back));
        self
    }
}

impl Step for FnStep {
    fn execute(&mut self, token: CompletionToken) {
        match self.execute.take() {
            Some(execute) => execute(token),
            None => token.complete_with(Status::error(
                ErrorKind::InvalidState,
                "step executed twice",
            )),
        }
    }

    fn roll_back(&mut self, token: CompletionToken) {
        match self.roll_back.take() {
            Some(roll_back) => roll_back(token),
            None => token.complete(),
        }
    }
}

type ProgressFn = Box<dyn FnMut(usize, u32) + Send>;

#[derive(Debug, PartialEq, Eq)]
enum Phase {
    Forward,
    RollingBack,
    Finished,
}

struct Driver {
    steps: Vec<Box<dyn Step>>,
    /// `[-1, steps.len()]`; only ever moves by one, via the step-finished
    /// and step-rolled-back signals.
    cursor: isize,
    phase: Phase,
    captured: Option<Status>,
    done: Option<CompletionToken>,
    done_chain: Option<CancelHandle>,
    progress: Option<ProgressFn>,
}

struct SequenceCore {
    executor: SerializedExecutor,
    cancel: CancelHandle,
    driver: Mutex<Driver>,
}

/// Builder for a [`Sequence`].
pub struct SequenceBuilder {
    executor: SerializedExecutor,
    steps: Vec<Box<dyn Step>>,
    progress: Option<ProgressFn>,
}

impl SequenceBuilder {
    #[must_use]
    pub fn step<S: Step>(mut self, step: S) -> Self {
        self.steps.push(Box::new(step));
        self
    }

    /// Append a closure step with no rollback action.
    #[must_use]
    pub fn step_fn<F>(self, execute: F) -> Self
    where
        F: FnOnce(CompletionToken) + Send + 'static,
    {
        self.step(FnStep::new(execute))
    }

    /// Report `(step_index, ticks)` after each completed forward step.
    #[must_use]
    pub fn on_progress<F>(mut self, progress: F) -> Self
    where
        F: FnMut(usize, u32) + Send + 'static,
    {
        self.progress = Some(Box::new(progress));
        self
    }

    #[must_use]
    pub fn build(self) -> Sequence {
        Sequence {
            core: Arc::new(SequenceCore {
                executor: self.executor,
                cancel: CancelHandle::new(),
                driver: Mutex::new(Driver {
                    steps: self.steps,
                    cursor: 0,
                    phase: Phase::Forward,
                    captured: None,
                    done: None,
                    done_chain: None,
                    progress: self.progress,
                }),
            }),
        }
    }
}

/// An ordered, rollback-capable multi-stage workflow on one executor.
///
/// Starting consumes the sequence, so it runs exactly once. Terminal states
/// are "completed forward" (final token `Ok`) and "rolled back to start"
/// (final token carries the captured failure or cancellation status).
pub struct Sequence {
    core: Arc<SequenceCore>,
}

impl Sequence {
    #[must_use]
    pub fn builder(executor: &SerializedExecutor) -> SequenceBuilder {
        SequenceBuilder {
            executor: executor.clone(),
            steps: Vec::new(),
            progress: None,
        }
    }

    /// Handle for requesting cancellation while the sequence runs. The
    /// driver polls it at step boundaries; running steps observe it through
    /// their token.
    #[must_use]
    pub fn cancel_handle(&self) -> CancelHandle {
        self.core.cancel.clone()
    }

    /// Run the sequence and block the calling thread until it finishes.
    ///
    /// # Errors
    /// Returns the sequence's terminal status as a [`QueryError`] when it
    /// does not complete forward.
    ///
    /// # Panics
    /// Panics if called from the executor's own thread.
    pub fn invoke(self) -> Result<(), QueryError> {
        let executor = self.core.executor.clone();
        let slot = Mutex::new(Some(self));
        let query = Query::new(&executor, move |token| {
            if let Some(sequence) = slot.lock().unwrap().take() {
                sequence.start(token);
            } else {
                token.complete_with(Status::error(
                    ErrorKind::InvalidState,
                    "sequence already started",
                ));
            }
        });
        query.get()
    }

    /// Start the sequence and return immediately. The terminal status goes
    /// to an unparented token (errors are logged, nothing else observes it).
    pub fn invoke_later(self) {
        let done =
            CompletionToken::new(&self.core.executor).with_cancel(&self.core.cancel);
        self.start(done);
    }

    /// Start the sequence and return immediately; `done` receives the
    /// terminal status.
    pub fn invoke_later_with(self, done: CompletionToken) {
        self.start(done);
    }

    fn start(self, done: CompletionToken) {
        let Self { core } = self;
        {
            let mut driver = core.driver.lock().unwrap();
            driver.done_chain = Some(done.cancel_handle());
            driver.done = Some(done);
        }
        let task = Arc::clone(&core);
        if let Err(error) = core.executor.submit(move || forward(&task)) {
            tracing::error!(error = %error, "sequence start rejected");
        }
    }
}

fn cancel_requested(core: &SequenceCore, driver: &Driver) -> bool {
    core.cancel.is_cancel_requested()
        || driver
            .done_chain
            .as_ref()
            .is_some_and(CancelHandle::is_cancel_requested)
}

fn forward(core: &Arc<SequenceCore>) {
    let mut driver = core.driver.lock().unwrap();
    debug_assert_eq!(driver.phase, Phase::Forward);
    if cancel_requested(core, &driver) {
        // The step at the cursor never ran; unwind from the one before it.
        driver.captured = Some(Status::Cancelled);
        driver.phase = Phase::RollingBack;
        driver.cursor -= 1;
        drop(driver);
        roll_back(core);
        return;
    }
    let index = usize::try_from(driver.cursor).expect("forward cursor is non-negative");
    if index == driver.steps.len() {
        finish(&mut driver, Status::Ok);
        return;
    }
    let task = Arc::clone(core);
    let token = CompletionToken::new(&core.executor)
        .with_cancel(&core.cancel)
        .on_done(move |status, _result, _parent| step_finished(&task, status));
    driver.steps[index].execute(token);
}

fn step_finished(core: &Arc<SequenceCore>, status: Status) {
    let mut driver = core.driver.lock().unwrap();
    debug_assert_eq!(driver.phase, Phase::Forward);
    if status.is_ok() {
        let index = usize::try_from(driver.cursor).expect("forward cursor is non-negative");
        let ticks = driver.steps[index].ticks();
        if let Some(progress) = driver.progress.as_mut() {
            progress(index, ticks);
        }
        if cancel_requested(core, &driver) {
            // This step finished its execute phase, so it is rolled back
            // along with its predecessors.
            driver.captured = Some(Status::Cancelled);
            driver.phase = Phase::RollingBack;
        } else {
            driver.cursor += 1;
            drop(driver);
            forward(core);
            return;
        }
    } else {
        // The step did not finish; unwind from the one before it, keeping
        // the step's own status as the terminal outcome.
        driver.captured = Some(status);
        driver.phase = Phase::RollingBack;
        driver.cursor -= 1;
    }
    drop(driver);
    roll_back(core);
}

fn roll_back(core: &Arc<SequenceCore>) {
    let mut driver = core.driver.lock().unwrap();
    debug_assert_eq!(driver.phase, Phase::RollingBack);
    if driver.cursor < 0 {
        let status = driver.captured.take().unwrap_or(Status::Cancelled);
        finish(&mut driver, status);
        return;
    }
    let index = usize::try_from(driver.cursor).expect("rollback cursor is non-negative here");
    let task = Arc::clone(core);
    // Rollback tokens stay off the cancellation chain: cleanup runs to
    // completion even while the sequence is cancelled.
    let token = CompletionToken::new(&core.executor)
        .on_done(move |status, _result, _parent| step_rolled_back(&task, &status));
    driver.steps[index].roll_back(token);
}

fn step_rolled_back(core: &Arc<SequenceCore>, status: &Status) {
    let mut driver = core.driver.lock().unwrap();
    debug_assert_eq!(driver.phase, Phase::RollingBack);
    if !status.is_ok() {
        // Best-effort cleanup: log, keep the captured status, keep going.
        tracing::warn!(step = driver.cursor, status = ?status, "rollback step failed");
    }
    driver.cursor -= 1;
    drop(driver);
    roll_back(core);
}

fn finish(driver: &mut Driver, status: Status) {
    driver.phase = Phase::Finished;
    if let Some(mut done) = driver.done.take() {
        done.set_result(());
        done.complete_with(status);
    }
}
