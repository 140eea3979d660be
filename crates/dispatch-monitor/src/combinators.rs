//! Fan-in combinators aggregating N child completions into one.
//!
//! All three variants complete one parent token exactly once, after every
//! child has individually completed, with an aggregate status that keeps
//! every child failure for diagnostics. They differ in bookkeeping:
//! `CountingToken` counts anonymously, `TokenCollector` checks off child
//! identities, and `TokenTracker` additionally remembers each child's final
//! status.
//!
//! Children are minted (or wrapped) by the combinator itself, so a child
//! reporting in without being registered, or the aggregate firing before
//! all children are accounted for, is structurally impossible rather than
//! merely tested for. Misuse that remains expressible (an extra completion
//! after the aggregate fired, registering a child twice) is a programmer
//! error and panics.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use dispatch_executor::SerializedExecutor;

use crate::{CancelHandle, CompletionToken, ErrorStatus, Status, TokenId};

fn merged_status(total: usize, failures: Vec<Status>) -> Status {
    if failures.is_empty() {
        return Status::Ok;
    }
    if failures.iter().all(Status::is_cancelled) {
        return Status::Cancelled;
    }
    let failed = failures.len();
    Status::Error(ErrorStatus::merged(
        format!("{failed} of {total} child operations did not complete successfully"),
        failures,
    ))
}

struct CountingState {
    parent: Option<CompletionToken>,
    expected: Option<usize>,
    finished: usize,
    failures: Vec<Status>,
    fired: bool,
}

/// Pure counting fan-in: the parent completes once `expected` children have.
///
/// Used when only the number of outstanding sub-operations matters. Mint one
/// child token per sub-operation with [`Self::child`], then fix the count
/// with [`Self::set_expected`]; the order of the two does not matter.
#[derive(Clone)]
pub struct CountingToken {
    executor: SerializedExecutor,
    cancel: CancelHandle,
    shared: Arc<Mutex<CountingState>>,
}

impl CountingToken {
    #[must_use]
    pub fn new(parent: CompletionToken) -> Self {
        Self {
            executor: parent.executor().clone(),
            cancel: parent.cancel_handle(),
            shared: Arc::new(Mutex::new(CountingState {
                parent: Some(parent),
                expected: None,
                finished: 0,
                failures: Vec::new(),
                fired: false,
            })),
        }
    }

    /// Set the number of children that must complete. May only be set once;
    /// setting it to the number already finished (including zero) fires the
    /// aggregate immediately.
    ///
    /// # Panics
    /// Panics if the expected count was already set.
    pub fn set_expected(&self, count: usize) {
        let mut state = self.shared.lock().unwrap();
        assert!(state.expected.is_none(), "expected count set twice");
        state.expected = Some(count);
        maybe_fire_counting(&mut state);
    }

    /// Mint one child token. The child joins the parent's cancellation
    /// chain and reports back here when completed.
    ///
    /// # Panics
    /// Panics if the aggregate completion already fired.
    #[must_use]
    pub fn child(&self) -> CompletionToken {
        {
            let state = self.shared.lock().unwrap();
            assert!(!state.fired, "child minted after the aggregate fired");
        }
        let shared = Arc::clone(&self.shared);
        CompletionToken::new(&self.executor)
            .with_cancel(&self.cancel)
            .on_done(move |status, _result, _parent| {
                let mut state = shared.lock().unwrap();
                assert!(!state.fired, "child completed after the aggregate fired");
                state.finished += 1;
                if !status.is_ok() {
                    state.failures.push(status);
                }
                maybe_fire_counting(&mut state);
            })
    }
}

fn maybe_fire_counting(state: &mut CountingState) {
    let Some(expected) = state.expected else {
        return;
    };
    if state.finished < expected {
        return;
    }
    assert!(
        state.finished == expected,
        "more children completed than the expected count"
    );
    state.fired = true;
    let failures = std::mem::take(&mut state.failures);
    let parent = state
        .parent
        .take()
        .expect("parent present until the aggregate fires");
    parent.complete_with(merged_status(expected, failures));
}

#[derive(Default)]
struct Roster {
    children: HashMap<TokenId, Option<Status>>,
    sealed: bool,
    fired: bool,
}

impl Roster {
    fn register(&mut self, id: TokenId) {
        assert!(!self.sealed, "child registered after the roster was sealed");
        assert!(
            self.children.insert(id, None).is_none(),
            "child registered twice"
        );
    }

    fn check_off(&mut self, id: TokenId, status: &Status) {
        assert!(!self.fired, "child completed after the aggregate fired");
        let slot = self
            .children
            .get_mut(&id)
            .expect("completed child was registered");
        *slot = Some(status.clone());
    }

    /// True when registration is closed and every child has reported.
    fn complete(&self) -> bool {
        self.sealed && self.children.values().all(Option::is_some)
    }

    fn merged(&mut self) -> Status {
        self.fired = true;
        let total = self.children.len();
        let failures = self
            .children
            .values()
            .filter_map(|status| status.as_ref())
            .filter(|status| !status.is_ok())
            .cloned()
            .collect();
        merged_status(total, failures)
    }
}

struct RosterState {
    parent: Option<CompletionToken>,
    roster: Roster,
}

impl RosterState {
    fn new(parent: CompletionToken) -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Self {
            parent: Some(parent),
            roster: Roster::default(),
        }))
    }
}

fn roster_check_off(shared: &Arc<Mutex<RosterState>>, id: TokenId, status: &Status) {
    let mut state = shared.lock().unwrap();
    state.roster.check_off(id, status);
    maybe_fire_roster(&mut state);
}

fn maybe_fire_roster(state: &mut RosterState) {
    if !state.roster.complete() || state.roster.fired {
        return;
    }
    let status = state.roster.merged();
    let parent = state
        .parent
        .take()
        .expect("parent present until the aggregate fires");
    parent.complete_with(status);
}

/// Identity-checking fan-in: each registered child must individually check
/// off before the parent completes.
///
/// Register children while assembling the fan-out, then [`Self::seal`] the
/// roster; the aggregate can only fire once sealed, so a fast early child
/// can never complete the parent while later children are still being
/// registered.
#[derive(Clone)]
pub struct TokenCollector {
    executor: SerializedExecutor,
    cancel: CancelHandle,
    shared: Arc<Mutex<RosterState>>,
}

impl TokenCollector {
    #[must_use]
    pub fn new(parent: CompletionToken) -> Self {
        Self {
            executor: parent.executor().clone(),
            cancel: parent.cancel_handle(),
            shared: RosterState::new(parent),
        }
    }

    /// Register an externally built token. Returned so call sites can
    /// register and hand off in one expression.
    ///
    /// # Panics
    /// Panics if the token is already registered or the roster is sealed.
    #[must_use]
    pub fn add<V: Send + 'static>(&self, child: CompletionToken<V>) -> CompletionToken<V> {
        let id = child.id();
        self.shared.lock().unwrap().roster.register(id);
        let shared = Arc::clone(&self.shared);
        child.observed(move |status| roster_check_off(&shared, id, status))
    }

    /// Mint and register one child token on the parent's cancellation chain.
    #[must_use]
    pub fn child(&self) -> CompletionToken {
        self.add(CompletionToken::new(&self.executor).with_cancel(&self.cancel))
    }

    /// Close registration. The aggregate fires once every registered child
    /// has completed (immediately, if none were registered).
    pub fn seal(&self) {
        let mut state = self.shared.lock().unwrap();
        state.roster.sealed = true;
        maybe_fire_roster(&mut state);
    }
}

/// Like [`TokenCollector`], but remembers each child's final status so the
/// caller can find out which of N children failed after the aggregate fires.
#[derive(Clone)]
pub struct TokenTracker {
    executor: SerializedExecutor,
    cancel: CancelHandle,
    shared: Arc<Mutex<RosterState>>,
}

impl TokenTracker {
    #[must_use]
    pub fn new(parent: CompletionToken) -> Self {
        Self {
            executor: parent.executor().clone(),
            cancel: parent.cancel_handle(),
            shared: RosterState::new(parent),
        }
    }

    /// Register an externally built token; see [`TokenCollector::add`].
    ///
    /// # Panics
    /// Panics if the token is already registered or the roster is sealed.
    #[must_use]
    pub fn add<V: Send + 'static>(&self, child: CompletionToken<V>) -> CompletionToken<V> {
        let id = child.id();
        self.shared.lock().unwrap().roster.register(id);
        let shared = Arc::clone(&self.shared);
        child.observed(move |status| roster_check_off(&shared, id, status))
    }

    /// Mint and register one child token on the parent's cancellation chain.
    #[must_use]
    pub fn child(&self) -> CompletionToken {
        self.add(CompletionToken::new(&self.executor).with_cancel(&self.cancel))
    }

    /// Close registration; see [`TokenCollector::seal`].
    pub fn seal(&self) {
        let mut state = self.shared.lock().unwrap();
        state.roster.sealed = true;
        maybe_fire_roster(&mut state);
    }

    /// Final status of each child that has completed so far. Complete once
    /// the aggregate has fired.
    #[must_use]
    pub fn statuses(&self) -> HashMap<TokenId, Status> {
        let state = self.shared.lock().unwrap();
        state
            .roster
            .children
            .iter()
            .filter_map(|(id, status)| status.as_ref().map(|status| (*id, status.clone())))
            .collect()
    }
}
