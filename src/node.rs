//! The promise graph node and its settlement protocol.
//!
//! A [`PromiseNode`] owns the nodes that depend on it through its
//! [`DependentList`], while a dependent only holds weak references to its
//! prerequisites. A prerequisite is upgraded to a strong reference when it
//! settles and hands over its outcome, and released again once the
//! dependent's executor has consumed it.
//!
//! Settling takes no locks. The executor is handed out through an atomic
//! swap, and the outcome is written once before the dependent list's
//! compare-and-swap publishes the settlement. Only reading a payload briefly
//! locks it, since a moving reader may race shared ones.
use crate::checks::{report_api_error, ApiError, NodeChecks, SourceLocation, API_CHECKS};
use crate::dependent_list::{DependentList, SettledState};
use crate::executor::{Executor, ExecutorTraits, PrerequisitePolicy, Settlement};
use crate::sync::lock;
use crate::task_runner::{TaskRunner, TaskRunnerRef};
use crate::typed_value::TypedValue;
use std::any::Any;
use std::cell::Cell;
use std::fmt;
use std::panic::Location;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use tracing::{debug, trace};

/// How deeply eligible dependents may be run inline on the current sequence
/// before they are posted instead.
pub const MAX_INLINE_DEPTH: usize = 32;

const NO_PREREQUISITE: usize = usize::MAX;
const CANCELED_PREREQUISITE: usize = usize::MAX - 1;

thread_local! {
    static INLINE_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Whether a rejection of this node must reach a catch before the node is
/// destroyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RejectPolicy {
    #[default]
    MustCatchRejection,
    CatchNotRequired,
}

/// Holds the executor until exactly one caller takes it, either to run it or
/// to drop it on cancellation.
struct ExecutorSlot(AtomicPtr<Executor>);

impl ExecutorSlot {
    fn new(executor: Executor) -> Self {
        Self(AtomicPtr::new(Box::into_raw(Box::new(executor))))
    }

    fn empty() -> Self {
        Self(AtomicPtr::new(ptr::null_mut()))
    }

    fn take(&self) -> Option<Executor> {
        let raw = self.0.swap(ptr::null_mut(), Ordering::AcqRel);
        if raw.is_null() {
            return None;
        }
        // SAFETY: non-null pointers only come from `Box::into_raw` in `new`,
        // and the swap gives this caller sole ownership of it.
        Some(*unsafe { Box::from_raw(raw) })
    }

    fn is_set(&self) -> bool {
        !self.0.load(Ordering::Acquire).is_null()
    }
}

impl Drop for ExecutorSlot {
    fn drop(&mut self) {
        drop(self.take());
    }
}

/// What a node settled with. Written once, before the dependent list
/// publishes the settlement, and read without locking afterwards.
enum Outcome {
    Resolved(Payload),
    Rejected(Payload),
    Curried(Arc<PromiseNode>),
}

/// A settled value.
///
/// Shared readers and one moving reader may run on different threads, so
/// the cell is locked for the length of an `Arc` clone or a swap.
struct Payload(Mutex<TypedValue>);

impl Payload {
    fn new(value: TypedValue) -> Self {
        Self(Mutex::new(value))
    }

    fn share<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        lock(&self.0).share::<T>()
    }

    fn take<T: Any + Send + Sync>(&self) -> Option<T> {
        let mut value = lock(&self.0);
        match value.take().into_inner::<T>() {
            Ok(taken) => Some(taken),
            Err(restored) => {
                *value = restored;
                None
            }
        }
    }
}

struct Prerequisite {
    node: Weak<PromiseNode>,
    retained: AtomicPtr<PromiseNode>,
}

impl Prerequisite {
    fn new(node: &Arc<PromiseNode>) -> Self {
        Self {
            node: Arc::downgrade(node),
            retained: AtomicPtr::new(ptr::null_mut()),
        }
    }

    fn get(&self) -> Option<Arc<PromiseNode>> {
        self.node.upgrade()
    }

    fn retain(&self, node: &Arc<PromiseNode>) {
        let raw = Arc::into_raw(Arc::clone(node)).cast_mut();
        if self
            .retained
            .compare_exchange(ptr::null_mut(), raw, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // SAFETY: `raw` comes from `Arc::into_raw` above and was not stored.
            drop(unsafe { Arc::from_raw(raw) });
        }
    }

    fn release(&self) {
        let raw = self.retained.swap(ptr::null_mut(), Ordering::AcqRel);
        if !raw.is_null() {
            // SAFETY: only `retain` stores non-null pointers, each owning one
            // strong count, and the swap hands that count to us alone.
            drop(unsafe { Arc::from_raw(raw) });
        }
    }
}

impl Drop for Prerequisite {
    fn drop(&mut self) {
        self.release();
    }
}

#[derive(Debug, Clone, Copy)]
enum Slot {
    Prerequisite(usize),
    Curried,
}

struct Dependent {
    node: Arc<PromiseNode>,
    slot: Slot,
}

impl Dependent {
    fn notify(self, state: SettledState) {
        self.node.on_prerequisite_settled(self.slot, state);
    }
}

struct InlineScope;

impl InlineScope {
    fn enter() -> Option<Self> {
        INLINE_DEPTH.with(|depth| {
            (depth.get() < MAX_INLINE_DEPTH).then(|| {
                depth.set(depth.get() + 1);
                InlineScope
            })
        })
    }
}

impl Drop for InlineScope {
    fn drop(&mut self) {
        INLINE_DEPTH.with(|depth| depth.set(depth.get() - 1));
    }
}

/// A node waiting in a task queue. Discarding the task unrun cancels it.
struct PostedExecution(Option<Arc<PromiseNode>>);

impl PostedExecution {
    fn run(mut self) {
        if let Some(node) = self.0.take() {
            node.execute();
        }
    }
}

impl Drop for PostedExecution {
    fn drop(&mut self) {
        if let Some(node) = self.0.take() {
            node.on_canceled();
        }
    }
}

/// A node of the promise graph.
pub struct PromiseNode {
    location: SourceLocation,
    task_runner: Option<Weak<dyn TaskRunner>>,
    reject_policy: RejectPolicy,
    policy: PrerequisitePolicy,
    traits: ExecutorTraits,
    prerequisites: Box<[Prerequisite]>,
    // Unresolved prerequisites for `All`, uncanceled ones for `Any`.
    remaining: AtomicUsize,
    first_settled: AtomicUsize,
    scheduled: AtomicBool,
    dependents: DependentList<Dependent>,
    executor: ExecutorSlot,
    outcome: OnceLock<Outcome>,
    checks: Option<Box<NodeChecks>>,
}

impl PromiseNode {
    /// Creates a pending node that runs `executor` on `task_runner` once its
    /// prerequisites allow it. Without a task runner the executor runs inline
    /// on whichever thread makes the node eligible.
    ///
    /// The node only keeps a weak reference to its task runner. If the runner
    /// is gone by the time the node becomes eligible, the node is canceled.
    ///
    /// Prerequisites that are already settled are taken into account
    /// immediately, so the node may run before this returns.
    #[track_caller]
    pub fn create(
        task_runner: Option<TaskRunnerRef>,
        prerequisites: Vec<Arc<PromiseNode>>,
        reject_policy: RejectPolicy,
        executor: Executor,
    ) -> Arc<Self> {
        let location = Location::caller();
        let traits = *executor.traits();
        let checks = API_CHECKS.then(|| Box::new(NodeChecks::new(location, &traits, &prerequisites)));
        let node = Arc::new(Self {
            location,
            task_runner: task_runner.as_ref().map(Arc::downgrade),
            reject_policy,
            policy: executor.prerequisite_policy(),
            traits,
            prerequisites: prerequisites.iter().map(Prerequisite::new).collect(),
            remaining: AtomicUsize::new(prerequisites.len()),
            first_settled: AtomicUsize::new(NO_PREREQUISITE),
            scheduled: AtomicBool::new(false),
            dependents: DependentList::new(),
            executor: ExecutorSlot::new(executor),
            outcome: OnceLock::new(),
            checks,
        });
        for (index, prerequisite) in prerequisites.iter().enumerate() {
            if node.is_settled() {
                break;
            }
            let dependent = Dependent {
                node: Arc::clone(&node),
                slot: Slot::Prerequisite(index),
            };
            if let Err(blocked) = prerequisite.dependents.insert(dependent) {
                drop(blocked.item);
                if blocked.state != SettledState::Canceled {
                    node.prerequisites[index].retain(prerequisite);
                }
                node.on_prerequisite_settled(Slot::Prerequisite(index), blocked.state);
            }
        }
        node
    }

    /// Creates a node that is resolved with `value` from the start.
    #[track_caller]
    pub fn create_resolved(value: TypedValue) -> Arc<Self> {
        Self::create_settled(
            Outcome::Resolved(Payload::new(value)),
            SettledState::Resolved,
            RejectPolicy::default(),
        )
    }

    /// Creates a node that is rejected with `value` from the start.
    #[track_caller]
    pub fn create_rejected(value: TypedValue, reject_policy: RejectPolicy) -> Arc<Self> {
        Self::create_settled(Outcome::Rejected(Payload::new(value)), SettledState::Rejected, reject_policy)
    }

    #[track_caller]
    fn create_settled(outcome: Outcome, state: SettledState, reject_policy: RejectPolicy) -> Arc<Self> {
        let location = Location::caller();
        let executor = Executor::do_nothing(
            state == SettledState::Resolved,
            state == SettledState::Rejected,
        );
        trace!(%location, ?state, "promise created settled");
        Arc::new(Self {
            location,
            task_runner: None,
            reject_policy,
            policy: executor.prerequisite_policy(),
            traits: *executor.traits(),
            prerequisites: Box::new([]),
            remaining: AtomicUsize::new(0),
            first_settled: AtomicUsize::new(NO_PREREQUISITE),
            scheduled: AtomicBool::new(true),
            dependents: DependentList::new_settled(state),
            executor: ExecutorSlot::empty(),
            outcome: OnceLock::from(outcome),
            checks: API_CHECKS.then(Box::default),
        })
    }

    pub fn location(&self) -> SourceLocation {
        self.location
    }

    /// The task runner this node runs on, if it has one and it is still alive.
    pub fn task_runner(&self) -> Option<TaskRunnerRef> {
        self.task_runner.as_ref()?.upgrade()
    }

    pub fn reject_policy(&self) -> RejectPolicy {
        self.reject_policy
    }

    pub fn prerequisite_policy(&self) -> PrerequisitePolicy {
        self.policy
    }

    pub fn traits(&self) -> &ExecutorTraits {
        &self.traits
    }

    pub(crate) fn checks(&self) -> Option<&NodeChecks> {
        self.checks.as_deref()
    }

    pub fn state(&self) -> Option<SettledState> {
        self.dependents.state()
    }

    pub fn is_settled(&self) -> bool {
        self.dependents.is_settled()
    }

    pub fn is_resolved(&self) -> bool {
        self.dependents.is_resolved()
    }

    pub fn is_rejected(&self) -> bool {
        self.dependents.is_rejected()
    }

    pub fn is_canceled(&self) -> bool {
        self.dependents.is_canceled()
    }

    pub fn has_executor(&self) -> bool {
        self.executor.is_set()
    }

    /// The promise whose outcome this node takes on, if any.
    pub fn curried_promise(&self) -> Option<Arc<Self>> {
        match self.outcome.get()? {
            Outcome::Curried(target) => Some(Arc::clone(target)),
            _ => None,
        }
    }

    pub fn is_resolved_with_promise(&self) -> bool {
        self.curried_promise().is_some()
    }

    /// Follows the curried chain to the node that actually holds the value.
    pub fn find_non_curried_ancestor(self: &Arc<Self>) -> Arc<Self> {
        let mut current = Arc::clone(self);
        while let Some(next) = current.curried_promise() {
            current = next;
        }
        current
    }

    /// Where the rejection held by this node was produced, and under which
    /// policy.
    pub(crate) fn rejection_origin(&self) -> (SourceLocation, RejectPolicy) {
        match self.curried_promise() {
            Some(target) => {
                let origin = target.find_non_curried_ancestor();
                (origin.location, origin.reject_policy)
            }
            None => (self.location, self.reject_policy),
        }
    }

    pub fn ignore_uncaught_catch_for_testing(&self) {
        if let Some(checks) = self.checks() {
            checks.ignore_uncaught_catch();
        }
    }

    pub fn prerequisite_count(&self) -> usize {
        self.prerequisites.len()
    }

    pub fn only_prerequisite(&self) -> Option<Arc<Self>> {
        match &*self.prerequisites {
            [only] => only.get(),
            _ => None,
        }
    }

    /// The prerequisite whose settlement made this node eligible: the first
    /// to settle for `Any`, the first to reject for `All`.
    pub fn first_settled_prerequisite(&self) -> Option<Arc<Self>> {
        let index = self.first_settled.load(Ordering::Acquire);
        self.prerequisites.get(index)?.get()
    }

    /// The first rejected prerequisite in adjacency order.
    pub fn first_rejected_prerequisite(&self) -> Option<Arc<Self>> {
        self.prerequisites
            .iter()
            .filter_map(Prerequisite::get)
            .find(|prerequisite| prerequisite.is_rejected())
    }

    /// All prerequisites in adjacency order, or `None` if one is gone.
    pub fn prerequisite_nodes(&self) -> Option<Vec<Arc<Self>>> {
        self.prerequisites.iter().map(Prerequisite::get).collect()
    }

    /// Stores the value this node resolves with. Takes effect once the node
    /// is settled with [`PromiseNode::on_resolved`].
    pub fn emplace_resolved<T: Any + Send + Sync>(&self, value: T) {
        self.set_outcome(Outcome::Resolved(Payload::new(TypedValue::new(value))));
    }

    pub fn emplace_rejected<E: Any + Send + Sync>(&self, error: E) {
        self.set_outcome(Outcome::Rejected(Payload::new(TypedValue::new(error))));
    }

    /// Makes this node take on the eventual outcome of `target` once it is
    /// settled with [`PromiseNode::on_resolved`].
    pub fn emplace_curried(&self, target: Arc<PromiseNode>) {
        self.set_outcome(Outcome::Curried(target));
    }

    fn set_outcome(&self, outcome: Outcome) {
        if self.outcome.set(outcome).is_err() && !self.is_canceled() {
            report_api_error(ApiError::AlreadySettled {
                location: self.location,
            });
        }
    }

    /// Runs `f` on the payload the node settled with in `state`, following
    /// curried promises. A node that settled otherwise, or was canceled after
    /// a value was stored, has no payload.
    fn with_payload<R>(
        self: &Arc<Self>,
        state: SettledState,
        f: impl FnOnce(&Payload) -> Option<R>,
    ) -> Option<R> {
        let source = self.find_non_curried_ancestor();
        if source.state() != Some(state) {
            return None;
        }
        match (source.outcome.get()?, state) {
            (Outcome::Resolved(payload), SettledState::Resolved)
            | (Outcome::Rejected(payload), SettledState::Rejected) => f(payload),
            _ => None,
        }
    }

    /// A shared handle to the resolved value, following curried promises.
    pub fn resolved_value<T: Any + Send + Sync>(self: &Arc<Self>) -> Option<Arc<T>> {
        self.with_payload(SettledState::Resolved, Payload::share::<T>)
    }

    pub fn rejected_value<E: Any + Send + Sync>(self: &Arc<Self>) -> Option<Arc<E>> {
        self.with_payload(SettledState::Rejected, Payload::share::<E>)
    }

    /// Moves the resolved value out, following curried promises. Fails while
    /// another reader still holds a shared handle.
    pub fn take_resolved_value<T: Any + Send + Sync>(self: &Arc<Self>) -> Option<T> {
        self.with_payload(SettledState::Resolved, Payload::take::<T>)
    }

    pub fn take_rejected_value<E: Any + Send + Sync>(self: &Arc<Self>) -> Option<E> {
        self.with_payload(SettledState::Rejected, Payload::take::<E>)
    }

    /// Settles the node as resolved, or starts following the promise it was
    /// curried onto.
    pub fn on_resolved(self: &Arc<Self>) {
        self.settle_with(SettledState::Resolved);
    }

    pub fn on_rejected(self: &Arc<Self>) {
        self.settle_with(SettledState::Rejected);
    }

    /// Cancels the node and, transitively, its dependents. Repeated calls are
    /// ignored.
    pub fn on_canceled(self: &Arc<Self>) {
        if self.cancel_dependents() {
            drop(self.executor.take());
        }
    }

    fn cancel_dependents(&self) -> bool {
        let canceled = self
            .dependents
            .settle_and_dispatch(SettledState::Canceled, |dependent| {
                dependent.notify(SettledState::Canceled)
            });
        if canceled {
            debug!(location = %self.location, "promise canceled");
        }
        canceled
    }

    fn settle_with(self: &Arc<Self>, state: SettledState) {
        if let Some(target) = self.curried_promise() {
            self.follow(target);
            return;
        }
        match state {
            SettledState::Resolved if !self.traits.can_resolve => {
                report_api_error(ApiError::CannotResolve {
                    location: self.location,
                });
            }
            SettledState::Rejected if !self.traits.can_reject => {
                report_api_error(ApiError::CannotReject {
                    location: self.location,
                });
            }
            _ => {}
        }
        self.settle(state);
    }

    fn settle(self: &Arc<Self>, state: SettledState) {
        let settled = self.dependents.settle_and_dispatch(state, |dependent| {
            if let Slot::Prerequisite(index) = dependent.slot {
                dependent.node.prerequisites[index].retain(self);
            }
            dependent.notify(state);
        });
        if settled {
            trace!(location = %self.location, ?state, "promise settled");
        } else if !self.is_canceled() {
            report_api_error(ApiError::AlreadySettled {
                location: self.location,
            });
        }
    }

    fn follow(self: &Arc<Self>, target: Arc<Self>) {
        if let Some(checks) = target.checks() {
            checks.pass_catch_responsibility();
        }
        let dependent = Dependent {
            node: Arc::clone(self),
            slot: Slot::Curried,
        };
        if let Err(blocked) = target.dependents.insert(dependent) {
            drop(blocked.item);
            self.settle_from_curried(blocked.state);
        }
    }

    fn settle_from_curried(self: &Arc<Self>, state: SettledState) {
        match state {
            SettledState::Canceled => self.on_canceled(),
            state => self.settle(state),
        }
    }

    fn on_prerequisite_settled(self: &Arc<Self>, slot: Slot, state: SettledState) {
        let index = match slot {
            Slot::Curried => return self.settle_from_curried(state),
            Slot::Prerequisite(index) => index,
        };
        match (self.policy, state) {
            (PrerequisitePolicy::Never, _) => {}
            (PrerequisitePolicy::All, SettledState::Canceled) => {
                // Once a rejection made the node eligible, it decides the outcome.
                let claimed = self
                    .first_settled
                    .compare_exchange(
                        NO_PREREQUISITE,
                        CANCELED_PREREQUISITE,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok();
                if claimed {
                    self.on_canceled();
                }
            }
            (PrerequisitePolicy::All, SettledState::Resolved) => {
                if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    self.mark_eligible();
                }
            }
            (PrerequisitePolicy::All, SettledState::Rejected)
            | (PrerequisitePolicy::Any, SettledState::Resolved | SettledState::Rejected) => {
                let claimed = self
                    .first_settled
                    .compare_exchange(NO_PREREQUISITE, index, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok();
                if claimed {
                    self.mark_eligible();
                }
            }
            (PrerequisitePolicy::Any, SettledState::Canceled) => {
                if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    self.on_canceled();
                }
            }
        }
    }

    fn mark_eligible(self: &Arc<Self>) {
        if !self.scheduled.swap(true, Ordering::AcqRel) {
            self.dispatch(true);
        }
    }

    /// Posts a node that has no prerequisites to its task runner, or runs it
    /// right away if it has none.
    pub fn schedule(self: &Arc<Self>) {
        if !self.scheduled.swap(true, Ordering::AcqRel) {
            self.dispatch(false);
        }
    }

    /// Claims the right to settle a manually settled node. Only the first
    /// caller gets it, and nobody once the node is canceled.
    pub fn claim_manual_settlement(&self) -> bool {
        self.policy == PrerequisitePolicy::Never
            && !self.is_canceled()
            && !self.scheduled.swap(true, Ordering::AcqRel)
    }

    fn dispatch(self: &Arc<Self>, allow_inline: bool) {
        let runner = match &self.task_runner {
            Some(runner) if !self.is_canceled() => runner.upgrade(),
            _ => return self.execute(),
        };
        let Some(runner) = runner else {
            debug!(location = %self.location, "task runner is gone");
            return self.on_canceled();
        };
        if allow_inline && runner.runs_tasks_in_current_sequence() {
            if let Some(_scope) = InlineScope::enter() {
                return self.execute();
            }
        }
        trace!(location = %self.location, "promise posted");
        let posted = PostedExecution(Some(Arc::clone(self)));
        if let Err(error) = runner.post_task(Box::new(move || posted.run())) {
            debug!(location = %self.location, %error, "could not post promise");
            self.on_canceled();
        }
    }

    /// Runs the executor once. Called by the task runner when the node is
    /// eligible; later calls do nothing.
    pub fn execute(self: &Arc<Self>) {
        let Some(executor) = self.executor.take() else {
            return;
        };
        if self.is_canceled() {
            return;
        }
        if executor.is_cancelled() {
            debug!(location = %self.location, "promise executor invalidated");
            drop(executor);
            self.on_canceled();
            return;
        }
        let settlement = executor.execute(self);
        self.apply(settlement);
        for prerequisite in self.prerequisites.iter() {
            prerequisite.release();
        }
    }

    fn apply(self: &Arc<Self>, settlement: Settlement) {
        match settlement {
            Settlement::Resolved(value) => {
                self.set_outcome(Outcome::Resolved(Payload::new(value)));
                self.on_resolved();
            }
            Settlement::Rejected(value) => {
                self.set_outcome(Outcome::Rejected(Payload::new(value)));
                self.on_rejected();
            }
            Settlement::Curried(target) => {
                self.set_outcome(Outcome::Curried(target));
                self.on_resolved();
            }
            Settlement::Canceled => self.on_canceled(),
        }
    }
}

impl Drop for PromiseNode {
    fn drop(&mut self) {
        // Nothing can settle this node anymore.
        if !self.dependents.is_settled() {
            self.cancel_dependents();
        }
        if let Some(checks) = &self.checks {
            checks.check_uncaught_rejection(self);
        }
    }
}

impl fmt::Debug for PromiseNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PromiseNode")
            .field("location", &self.location)
            .field("state", &self.state())
            .field("policy", &self.policy)
            .field("reject_policy", &self.reject_policy)
            .field("prerequisites", &self.prerequisites.len())
            .finish()
    }
}
