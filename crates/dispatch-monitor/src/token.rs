//! One-shot completion tokens with parent chaining.
//!
//! A token represents the result of one asynchronous operation. The caller
//! creates it (optionally wired to a parent token it received as an
//! argument), hands it to the callee, and the callee records an outcome and
//! completes it. Completion schedules the token's handler on the owning
//! executor.
//!
//! The default handler forwards to the parent: success forwards completion,
//! failure copies the status upward, and an unparented error is logged
//! (nothing else will ever observe it). This is what lets a deep chain of
//! asynchronous calls collapse to a single final notification with no
//! per-layer plumbing; a layer installs its own handler only when it needs
//! to interpret the child's result.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread,
};

use dispatch_executor::SerializedExecutor;

use crate::{ErrorKind, Status};

/// Process-unique token identity, used by the identity-tracking combinators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TokenId(u64);

fn next_token_id() -> TokenId {
    static NEXT: AtomicU64 = AtomicU64::new(0);
    TokenId(NEXT.fetch_add(1, Ordering::Relaxed))
}

/// Advisory cancellation flag shared by a whole token chain.
///
/// A child created with a parent joins the parent's chain, so a request made
/// at any level is observed at every level. Setting the flag never aborts
/// anything by itself; callees poll it at safe points and record
/// [`Status::Cancelled`] themselves.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_cancel_requested(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

type DoneFn<V> = Box<dyn FnOnce(Status, Option<V>, Option<CompletionToken>) + Send + 'static>;

struct TokenState<V: Send + 'static> {
    id: TokenId,
    executor: SerializedExecutor,
    cancel: CancelHandle,
    status: Status,
    result: Option<V>,
    parent: Option<Box<CompletionToken>>,
    behavior: DoneFn<V>,
}

/// One-shot handle for the result of an asynchronous operation.
///
/// The unit instantiation carries no data; a non-unit `V` is the
/// data-returning variant, whose value is handed to the success handler
/// (parents receive status only, never data).
///
/// Completion consumes the token, so completing twice is unrepresentable.
/// A token dropped without being completed completes itself with an
/// internal-fault status so its chain still unwinds.
pub struct CompletionToken<V: Send + 'static = ()> {
    state: Option<TokenState<V>>,
}

impl<V: Send + 'static> CompletionToken<V> {
    #[must_use]
    pub fn new(executor: &SerializedExecutor) -> Self {
        Self {
            state: Some(TokenState {
                id: next_token_id(),
                executor: executor.clone(),
                cancel: CancelHandle::new(),
                status: Status::Ok,
                result: None,
                parent: None,
                behavior: default_behavior(),
            }),
        }
    }

    /// Chain this token under `parent`.
    ///
    /// The parent is completed (or handed this token's failure status) by
    /// the default handler; the token also joins the parent's cancellation
    /// chain.
    #[must_use]
    pub fn with_parent(mut self, parent: CompletionToken) -> Self {
        let state = self.state_mut();
        state.cancel = parent.cancel_handle();
        state.parent = Some(Box::new(parent));
        self
    }

    /// Join an existing cancellation chain without chaining a parent token.
    #[must_use]
    pub fn with_cancel(mut self, chain: &CancelHandle) -> Self {
        self.state_mut().cancel = chain.clone();
        self
    }

    /// Override the success path only; errors and cancellations keep the
    /// default forwarding behavior. The handler receives the parent (if
    /// any) and is responsible for completing it.
    #[must_use]
    pub fn on_success<F>(mut self, f: F) -> Self
    where
        F: FnOnce(Option<CompletionToken>) + Send + 'static,
    {
        self.state_mut().behavior = Box::new(move |status, _result, parent| {
            if status.is_ok() {
                f(parent);
            } else {
                default_done(status, parent);
            }
        });
        self
    }

    /// Like [`Self::on_success`], but receives the recorded result value.
    #[must_use]
    pub fn on_result<F>(mut self, f: F) -> Self
    where
        F: FnOnce(V, Option<CompletionToken>) + Send + 'static,
    {
        self.state_mut().behavior = Box::new(move |status, result, parent| {
            if status.is_ok() {
                if let Some(value) = result {
                    f(value, parent);
                } else {
                    default_done(
                        Status::error(
                            ErrorKind::Internal,
                            "successful completion with no result recorded",
                        ),
                        parent,
                    );
                }
            } else {
                default_done(status, parent);
            }
        });
        self
    }

    /// Fully override completion handling. The handler receives the final
    /// status, the recorded result (if any), and the parent (if any).
    #[must_use]
    pub fn on_done<F>(mut self, f: F) -> Self
    where
        F: FnOnce(Status, Option<V>, Option<CompletionToken>) + Send + 'static,
    {
        self.state_mut().behavior = Box::new(f);
        self
    }

    /// Run `f` with the final status before the token's own completion
    /// behavior. Used by the combinators to check children off.
    pub(crate) fn observed<F>(mut self, f: F) -> Self
    where
        F: FnOnce(&Status) + Send + 'static,
    {
        let state = self.state_mut();
        let previous = std::mem::replace(&mut state.behavior, Box::new(|_, _, _| {}));
        state.behavior = Box::new(move |status, result, parent| {
            f(&status);
            previous(status, result, parent);
        });
        self
    }

    #[must_use]
    pub fn id(&self) -> TokenId {
        self.state_ref().id
    }

    #[must_use]
    pub fn executor(&self) -> &SerializedExecutor {
        &self.state_ref().executor
    }

    /// Handle onto this token's cancellation chain. Keep one around to
    /// request or observe cancellation after the token has been handed off.
    #[must_use]
    pub fn cancel_handle(&self) -> CancelHandle {
        self.state_ref().cancel.clone()
    }

    pub fn request_cancel(&self) {
        self.state_ref().cancel.request_cancel();
    }

    #[must_use]
    pub fn is_cancel_requested(&self) -> bool {
        self.state_ref().cancel.is_cancel_requested()
    }

    /// Record the outcome. No side effect until [`Self::complete`].
    pub fn set_status(&mut self, status: Status) {
        self.state_mut().status = status;
    }

    /// Record the result value. Only observed on successful completion.
    pub fn set_result(&mut self, value: V) {
        self.state_mut().result = Some(value);
    }

    /// Complete with the recorded status (`Ok` if none was set) and schedule
    /// the completion handler on the owning executor.
    pub fn complete(mut self) {
        let state = self
            .state
            .take()
            .expect("token state present until completion");
        dispatch(state);
    }

    /// Record `status` and complete.
    pub fn complete_with(mut self, status: Status) {
        self.set_status(status);
        self.complete();
    }

    /// Record a successful result and complete.
    pub fn complete_with_result(mut self, value: V) {
        self.set_result(value);
        self.complete();
    }

    fn state_ref(&self) -> &TokenState<V> {
        self.state
            .as_ref()
            .expect("token state present until completion")
    }

    fn state_mut(&mut self) -> &mut TokenState<V> {
        self.state
            .as_mut()
            .expect("token state present until completion")
    }
}

impl<V: Send + 'static> Drop for CompletionToken<V> {
    fn drop(&mut self) {
        if let Some(mut state) = self.state.take() {
            let message = if thread::panicking() {
                "token dropped during panic"
            } else {
                "token dropped without completion"
            };
            tracing::warn!(token = ?state.id, "{}", message);
            state.status = Status::error(ErrorKind::Internal, message);
            dispatch(state);
        }
    }
}

fn dispatch<V: Send + 'static>(state: TokenState<V>) {
    let executor = state.executor.clone();
    if executor.is_shut_down() {
        // The owning executor can no longer run the handler. Running it
        // inline keeps chains and blocked bridges live during teardown.
        run_handler(state);
        return;
    }
    if let Err(error) = executor.submit(move || run_handler(state)) {
        tracing::error!(error = %error, "completion handler dropped");
    }
}

fn run_handler<V: Send + 'static>(state: TokenState<V>) {
    let TokenState {
        status,
        result,
        parent,
        behavior,
        ..
    } = state;
    behavior(status, result, parent.map(|parent| *parent));
}

fn default_behavior<V: Send + 'static>() -> DoneFn<V> {
    Box::new(|status, _result, parent| default_done(status, parent))
}

fn default_done(status: Status, parent: Option<CompletionToken>) {
    match (status, parent) {
        // Pure forwarding: the parent completes with whatever status its
        // own caller recorded (Ok unless overridden).
        (Status::Ok, Some(parent)) => parent.complete(),
        (status @ (Status::Cancelled | Status::Error(_)), Some(parent)) => {
            parent.complete_with(status);
        }
        (Status::Error(error), None) => {
            tracing::error!(status = %error, "error status with nothing observing it");
        }
        // A cancelled unparented token is expected, user-initiated; not
        // worth a log line. Success needs no action at all.
        (Status::Ok | Status::Cancelled, None) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorStatus;
    use std::sync::mpsc;

    fn executor() -> SerializedExecutor {
        SerializedExecutor::new("token-test").expect("spawn worker")
    }

    /// Token whose handler reports the final status on a channel.
    fn reporting(executor: &SerializedExecutor) -> (CompletionToken, mpsc::Receiver<Status>) {
        let (tx, rx) = mpsc::channel();
        let token = CompletionToken::new(executor)
            .on_done(move |status, _result, _parent| tx.send(status).expect("report"));
        (token, rx)
    }

    #[test]
    fn completes_with_recorded_status() {
        let executor = executor();
        let (token, rx) = reporting(&executor);
        token.complete_with(Status::Cancelled);
        assert_eq!(rx.recv().expect("handler ran"), Status::Cancelled);
    }

    #[test]
    fn error_collapses_through_chain() {
        let executor = executor();
        let (root, rx) = reporting(&executor);
        let middle = CompletionToken::new(&executor).with_parent(root);
        let leaf: CompletionToken = CompletionToken::new(&executor).with_parent(middle);
        let failure = Status::request_failed("flash write failed");
        leaf.complete_with(failure.clone());
        // The middle layer forwards by default; the root observes the leaf's
        // exact status.
        assert_eq!(rx.recv().expect("handler ran"), failure);
    }

    #[test]
    fn success_forwards_to_parent() {
        let executor = executor();
        let (root, rx) = reporting(&executor);
        let leaf: CompletionToken = CompletionToken::new(&executor).with_parent(root);
        leaf.complete();
        assert_eq!(rx.recv().expect("handler ran"), Status::Ok);
    }

    #[test]
    fn cancellation_is_visible_chain_wide() {
        let executor = executor();
        let root = CompletionToken::new(&executor);
        let root_chain = root.cancel_handle();
        let mut leaf = root;
        for _ in 0..10 {
            leaf = CompletionToken::new(&executor).with_parent(leaf);
        }
        assert!(!root_chain.is_cancel_requested());
        leaf.request_cancel();
        assert!(root_chain.is_cancel_requested());
        assert!(leaf.is_cancel_requested());
        leaf.complete_with(Status::Cancelled);
    }

    #[test]
    fn result_is_delivered_to_success_handler() {
        let executor = executor();
        let (tx, rx) = mpsc::channel();
        let token = CompletionToken::<u32>::new(&executor)
            .on_result(move |value, _parent| tx.send(value).expect("report"));
        token.complete_with_result(42);
        assert_eq!(rx.recv().expect("handler ran"), 42);
    }

    #[test]
    fn missing_result_surfaces_internal_fault() {
        let executor = executor();
        let (tx, rx) = mpsc::channel();
        let parent = CompletionToken::new(&executor)
            .on_done(move |status, _result, _parent| tx.send(status).expect("report"));
        let token = CompletionToken::<u32>::new(&executor)
            .with_parent(parent)
            .on_result(|_value, _parent| unreachable!("no result was recorded"));
        token.complete();
        match rx.recv().expect("handler ran") {
            Status::Error(error) => assert_eq!(error.kind(), ErrorKind::Internal),
            status => panic!("expected internal fault, got {status:?}"),
        }
    }

    #[test]
    fn on_success_keeps_default_failure_path() {
        let executor = executor();
        let (root, rx) = reporting(&executor);
        let leaf: CompletionToken = CompletionToken::new(&executor)
            .with_parent(root)
            .on_success(|_parent| unreachable!("completion failed"));
        let failure = Status::Error(ErrorStatus::new(ErrorKind::InvalidState, "target running"));
        leaf.complete_with(failure.clone());
        assert_eq!(rx.recv().expect("handler ran"), failure);
    }

    #[test]
    fn dropped_token_unwinds_its_chain() {
        let executor = executor();
        let (root, rx) = reporting(&executor);
        let leaf: CompletionToken = CompletionToken::new(&executor).with_parent(root);
        drop(leaf);
        match rx.recv().expect("handler ran") {
            Status::Error(error) => {
                assert_eq!(error.kind(), ErrorKind::Internal);
                assert_eq!(error.message(), "token dropped without completion");
            }
            status => panic!("expected internal fault, got {status:?}"),
        }
    }
}
