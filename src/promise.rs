//! Typed handles over promise nodes.
use crate::checks::{report_api_error, ApiError, ArgumentPassing};
use crate::executor::{Executor, ExecutorTraits, NodeCallback, Settlement};
use crate::node::{PromiseNode, RejectPolicy};
use crate::task_runner::TaskRunnerRef;
use crate::typed_value::TypedValue;
use crate::Value;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Weak};

/// The rejection type of a promise that never rejects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoReject {}

/// A callback result that always resolves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved<T>(pub T);

/// A callback result that always rejects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejected<E>(pub E);

/// A callback result that may resolve, reject or defer to another promise.
pub enum PromiseResult<T, E> {
    Resolved(T),
    Rejected(E),
    Curried(Promise<T, E>),
}

/// What a continuation callback may return.
///
/// The constants say which outcomes the returned type can produce at all;
/// the runtime checks report a settlement that contradicts them.
pub trait IntoPromiseResult<T, E> {
    const CAN_RESOLVE: bool = true;
    const CAN_REJECT: bool = true;

    fn into_settlement(self) -> Settlement;
}

impl<T: Value, E: Value> IntoPromiseResult<T, E> for Result<T, E> {
    fn into_settlement(self) -> Settlement {
        match self {
            Ok(value) => Settlement::Resolved(TypedValue::new(value)),
            Err(error) => Settlement::Rejected(TypedValue::new(error)),
        }
    }
}

impl<T: Value, E: Value> IntoPromiseResult<T, E> for PromiseResult<T, E> {
    fn into_settlement(self) -> Settlement {
        match self {
            PromiseResult::Resolved(value) => Settlement::Resolved(TypedValue::new(value)),
            PromiseResult::Rejected(error) => Settlement::Rejected(TypedValue::new(error)),
            PromiseResult::Curried(promise) => Settlement::Curried(promise.node),
        }
    }
}

impl<T, E> IntoPromiseResult<T, E> for Promise<T, E> {
    fn into_settlement(self) -> Settlement {
        Settlement::Curried(self.node)
    }
}

impl<T: Value, E> IntoPromiseResult<T, E> for Resolved<T> {
    const CAN_REJECT: bool = false;

    fn into_settlement(self) -> Settlement {
        Settlement::Resolved(TypedValue::new(self.0))
    }
}

impl<T, E: Value> IntoPromiseResult<T, E> for Rejected<E> {
    const CAN_RESOLVE: bool = false;

    fn into_settlement(self) -> Settlement {
        Settlement::Rejected(TypedValue::new(self.0))
    }
}

impl<E> IntoPromiseResult<(), E> for () {
    const CAN_REJECT: bool = false;

    fn into_settlement(self) -> Settlement {
        Settlement::Resolved(TypedValue::new(()))
    }
}

/// A callback result whose type fixes the rejection type of the promise it
/// settles. A catch callback that cannot reject yields a promise that cannot
/// reject either.
pub trait CatchResult<T> {
    type Reject: Value;
}

impl<T: Value, E: Value> CatchResult<T> for Result<T, E> {
    type Reject = E;
}

impl<T: Value, E: Value> CatchResult<T> for PromiseResult<T, E> {
    type Reject = E;
}

impl<T: Value, E: Value> CatchResult<T> for Promise<T, E> {
    type Reject = E;
}

impl<T: Value> CatchResult<T> for Resolved<T> {
    type Reject = NoReject;
}

impl<T: Value, E: Value> CatchResult<T> for Rejected<E> {
    type Reject = E;
}

impl CatchResult<()> for () {
    type Reject = NoReject;
}

pub(crate) fn value_unavailable(node: &PromiseNode) -> Settlement {
    report_api_error(ApiError::ValueUnavailable {
        location: node.location(),
    });
    Settlement::Canceled
}

type Read<V> = fn(&Arc<PromiseNode>) -> Option<V>;

/// Wraps `f` into a callback that reads the prerequisite with `read`.
fn reading<V: 'static>(read: Read<V>, f: impl FnOnce(V) -> Settlement + Send + 'static) -> NodeCallback {
    Box::new(move |prerequisite: &Arc<PromiseNode>| match read(prerequisite) {
        Some(value) => f(value),
        None => value_unavailable(prerequisite),
    })
}

/// A handle to a node of the promise graph that resolves with `T` or rejects
/// with `E`.
///
/// Handles are cheap to clone. Every continuation creates a new node that
/// depends on this one and returns its handle.
///
/// # Examples
///
/// ```
/// use promise_graph::{ManualTaskRunner, Promise, TaskRunnerRef};
///
/// let runner = ManualTaskRunner::new();
/// let handle: TaskRunnerRef = runner.clone();
///
/// let length = Promise::<String>::resolved("🍓🍓".into()).then(&handle, |s: &String| {
///     Ok(s.chars().count())
/// });
/// runner.run_until_idle();
/// assert_eq!(length.value().as_deref(), Some(&2));
/// ```
pub struct Promise<T, E = NoReject> {
    node: Arc<PromiseNode>,
    _marker: PhantomData<fn() -> (T, E)>,
}

impl<T, E> Clone for Promise<T, E> {
    fn clone(&self) -> Self {
        Self::from_node(Arc::clone(&self.node))
    }
}

impl<T, E> fmt::Debug for Promise<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Promise").field(&self.node).finish()
    }
}

impl<T, E> Promise<T, E> {
    /// Wraps `node`. The caller vouches that its payloads are `T` and `E`.
    pub fn from_node(node: Arc<PromiseNode>) -> Self {
        Self {
            node,
            _marker: PhantomData,
        }
    }

    pub fn node(&self) -> &Arc<PromiseNode> {
        &self.node
    }

    pub fn into_node(self) -> Arc<PromiseNode> {
        self.node
    }

    pub fn is_resolved(&self) -> bool {
        self.node.is_resolved()
    }

    pub fn is_rejected(&self) -> bool {
        self.node.is_rejected()
    }

    pub fn is_canceled(&self) -> bool {
        self.node.is_canceled()
    }

    pub fn is_settled(&self) -> bool {
        self.node.is_settled()
    }

    /// Cancels this promise and everything that depends on it, unless it
    /// already settled.
    pub fn cancel(&self) {
        self.node.on_canceled();
    }

    pub fn ignore_uncaught_catch_for_testing(&self) {
        self.node.ignore_uncaught_catch_for_testing();
    }

    #[track_caller]
    fn chain<U, F>(&self, task_runner: &TaskRunnerRef, executor: Executor) -> Promise<U, F> {
        Promise::from_node(PromiseNode::create(
            Some(Arc::clone(task_runner)),
            vec![Arc::clone(&self.node)],
            RejectPolicy::MustCatchRejection,
            executor,
        ))
    }
}

impl<T: Value, E: Value> Promise<T, E> {
    #[track_caller]
    pub fn resolved(value: T) -> Self {
        Self::from_node(PromiseNode::create_resolved(TypedValue::new(value)))
    }

    #[track_caller]
    pub fn rejected(error: E) -> Self {
        Self::rejected_with_policy(error, RejectPolicy::MustCatchRejection)
    }

    #[track_caller]
    pub fn rejected_with_policy(error: E, reject_policy: RejectPolicy) -> Self {
        Self::from_node(PromiseNode::create_rejected(TypedValue::new(error), reject_policy))
    }

    /// Runs `task` on `task_runner` and settles with what it returns.
    #[track_caller]
    pub fn post_task<R>(task_runner: &TaskRunnerRef, task: impl FnOnce() -> R + Send + 'static) -> Self
    where
        R: IntoPromiseResult<T, E> + 'static,
    {
        let traits = ExecutorTraits::new(ArgumentPassing::NoArgument, ArgumentPassing::NoArgument)
            .with_outcomes(R::CAN_RESOLVE, R::CAN_REJECT);
        let executor = Executor::post_task(Box::new(move || task().into_settlement()), traits);
        let node = PromiseNode::create(
            Some(Arc::clone(task_runner)),
            Vec::new(),
            RejectPolicy::MustCatchRejection,
            executor,
        );
        node.schedule();
        Self::from_node(node)
    }

    /// A shared handle to the resolved value.
    pub fn value(&self) -> Option<Arc<T>> {
        self.node.resolved_value::<T>()
    }

    pub fn error(&self) -> Option<Arc<E>> {
        self.node.rejected_value::<E>()
    }

    fn can_resolve(&self) -> bool {
        self.node.traits().can_resolve
    }

    fn can_reject(&self) -> bool {
        self.node.traits().can_reject
    }

    /// Runs `on_resolve` with a reference to the value once this promise
    /// resolves. A rejection skips the callback and passes through.
    #[track_caller]
    pub fn then<U, R>(
        &self,
        task_runner: &TaskRunnerRef,
        on_resolve: impl FnOnce(&T) -> R + Send + 'static,
    ) -> Promise<U, E>
    where
        U: Value,
        R: IntoPromiseResult<U, E> + 'static,
    {
        let traits = ExecutorTraits::new(ArgumentPassing::Normal, ArgumentPassing::NoCallback)
            .with_outcomes(R::CAN_RESOLVE, R::CAN_REJECT || self.can_reject());
        let on_resolve = reading(PromiseNode::resolved_value::<T>, move |value| {
            on_resolve(&*value).into_settlement()
        });
        self.chain(task_runner, Executor::then_and_catch(Some(on_resolve), None, traits))
    }

    /// Like [`Promise::then`], but the callback takes the value by move. Only
    /// one dependent of a promise may do so.
    #[track_caller]
    pub fn then_move<U, R>(
        &self,
        task_runner: &TaskRunnerRef,
        on_resolve: impl FnOnce(T) -> R + Send + 'static,
    ) -> Promise<U, E>
    where
        U: Value,
        R: IntoPromiseResult<U, E> + 'static,
    {
        let traits = ExecutorTraits::new(ArgumentPassing::Move, ArgumentPassing::NoCallback)
            .with_outcomes(R::CAN_RESOLVE, R::CAN_REJECT || self.can_reject());
        let on_resolve = reading(PromiseNode::take_resolved_value::<T>, move |value| {
            on_resolve(value).into_settlement()
        });
        self.chain(task_runner, Executor::then_and_catch(Some(on_resolve), None, traits))
    }

    /// Runs `on_reject` once this promise rejects. A resolution passes
    /// through.
    ///
    /// The returned promise rejects only with what the callback rejects
    /// with, so a callback returning [`Resolved`] yields a promise that
    /// cannot reject.
    #[track_caller]
    pub fn catch<R>(
        &self,
        task_runner: &TaskRunnerRef,
        on_reject: impl FnOnce(&E) -> R + Send + 'static,
    ) -> Promise<T, R::Reject>
    where
        R: CatchResult<T> + IntoPromiseResult<T, <R as CatchResult<T>>::Reject> + 'static,
    {
        let traits = ExecutorTraits::new(ArgumentPassing::NoCallback, ArgumentPassing::Normal)
            .with_outcomes(R::CAN_RESOLVE || self.can_resolve(), R::CAN_REJECT);
        let on_reject = reading(PromiseNode::rejected_value::<E>, move |error| {
            on_reject(&*error).into_settlement()
        });
        self.chain(task_runner, Executor::then_and_catch(None, Some(on_reject), traits))
    }

    #[track_caller]
    pub fn catch_move<R>(
        &self,
        task_runner: &TaskRunnerRef,
        on_reject: impl FnOnce(E) -> R + Send + 'static,
    ) -> Promise<T, R::Reject>
    where
        R: CatchResult<T> + IntoPromiseResult<T, <R as CatchResult<T>>::Reject> + 'static,
    {
        let traits = ExecutorTraits::new(ArgumentPassing::NoCallback, ArgumentPassing::Move)
            .with_outcomes(R::CAN_RESOLVE || self.can_resolve(), R::CAN_REJECT);
        let on_reject = reading(PromiseNode::take_rejected_value::<E>, move |error| {
            on_reject(error).into_settlement()
        });
        self.chain(task_runner, Executor::then_and_catch(None, Some(on_reject), traits))
    }

    /// Handles both outcomes. Exactly one of the callbacks runs.
    #[track_caller]
    pub fn then_and_catch<U, F, R1, R2>(
        &self,
        task_runner: &TaskRunnerRef,
        on_resolve: impl FnOnce(&T) -> R1 + Send + 'static,
        on_reject: impl FnOnce(&E) -> R2 + Send + 'static,
    ) -> Promise<U, F>
    where
        U: Value,
        F: Value,
        R1: IntoPromiseResult<U, F> + 'static,
        R2: IntoPromiseResult<U, F> + 'static,
    {
        let traits = ExecutorTraits::new(ArgumentPassing::Normal, ArgumentPassing::Normal).with_outcomes(
            R1::CAN_RESOLVE || R2::CAN_RESOLVE,
            R1::CAN_REJECT || R2::CAN_REJECT,
        );
        let on_resolve = reading(PromiseNode::resolved_value::<T>, move |value| {
            on_resolve(&*value).into_settlement()
        });
        let on_reject = reading(PromiseNode::rejected_value::<E>, move |error| {
            on_reject(&*error).into_settlement()
        });
        self.chain(
            task_runner,
            Executor::then_and_catch(Some(on_resolve), Some(on_reject), traits),
        )
    }

    /// Runs `callback` once this promise settles either way. The callback's
    /// result becomes the outcome of the returned promise.
    #[track_caller]
    pub fn finally<U, R>(&self, task_runner: &TaskRunnerRef, callback: impl FnOnce() -> R + Send + 'static) -> Promise<U, E>
    where
        U: Value,
        R: IntoPromiseResult<U, E> + 'static,
    {
        let traits = ExecutorTraits::new(ArgumentPassing::NoArgument, ArgumentPassing::NoArgument)
            .with_outcomes(R::CAN_RESOLVE, R::CAN_REJECT);
        self.chain(
            task_runner,
            Executor::finally(Box::new(move || callback().into_settlement()), traits),
        )
    }

    /// Like [`Promise::then`], bound to `receiver`. Once the receiver is
    /// gone the returned promise is canceled instead of running.
    #[track_caller]
    pub fn then_weak<O, U, R>(
        &self,
        task_runner: &TaskRunnerRef,
        receiver: &Weak<O>,
        on_resolve: impl FnOnce(&O, &T) -> R + Send + 'static,
    ) -> Promise<U, E>
    where
        O: Send + Sync + 'static,
        U: Value,
        R: IntoPromiseResult<U, E> + 'static,
    {
        let traits = ExecutorTraits::new(ArgumentPassing::Normal, ArgumentPassing::NoCallback)
            .with_outcomes(R::CAN_RESOLVE, R::CAN_REJECT || self.can_reject());
        let (receiver, guard) = (Weak::clone(receiver), Weak::clone(receiver));
        let on_resolve = reading(PromiseNode::resolved_value::<T>, move |value| {
            match receiver.upgrade() {
                Some(receiver) => on_resolve(&*receiver, &*value).into_settlement(),
                None => Settlement::Canceled,
            }
        });
        let executor = Executor::then_and_catch(Some(on_resolve), None, traits)
            .with_cancel_guard(move || guard.strong_count() == 0);
        self.chain(task_runner, executor)
    }
}

impl<T: Value> Promise<T, NoReject> {
    /// Retypes a promise that cannot reject so it can be chained with
    /// callbacks that reject with `F`.
    pub fn into_rejectable<F: Value>(self) -> Promise<T, F> {
        Promise::from_node(self.node)
    }
}
