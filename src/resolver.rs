//! Promises settled by hand.
use crate::checks::{report_api_error, ApiError};
use crate::executor::Executor;
use crate::node::{PromiseNode, RejectPolicy};
use crate::promise::{NoReject, Promise};
use crate::Value;
use std::any::TypeId;
use std::sync::Arc;

/// Owns a promise that is settled explicitly rather than by an executor.
///
/// Settling twice is reported as [`ApiError::AlreadySettled`]; settling a
/// promise that was canceled meanwhile does nothing. Dropping the resolver
/// before it settled cancels the promise and everything chained to it.
///
/// # Examples
///
/// ```
/// use promise_graph::{ManualPromiseResolver, ManualTaskRunner, TaskRunnerRef};
/// use std::thread;
///
/// let runner = ManualTaskRunner::new();
/// let handle: TaskRunnerRef = runner.clone();
/// let resolver = ManualPromiseResolver::<String>::new();
/// let greeting = resolver.promise().then(&handle, |name: &String| {
///     Ok(format!("hello {name}"))
/// });
///
/// let resolve = resolver.resolve_callback();
/// thread::spawn(move || resolve("🍓".into()))
///     .join()
///     .expect("The task1 thread has panicked");
/// runner.run_until_idle();
/// assert_eq!(greeting.value().as_deref().map(String::as_str), Some("hello 🍓"));
/// ```
pub struct ManualPromiseResolver<T, E = NoReject> {
    promise: Promise<T, E>,
}

impl<T: Value, E: Value> Default for ManualPromiseResolver<T, E> {
    #[track_caller]
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Value, E: Value> ManualPromiseResolver<T, E> {
    #[track_caller]
    pub fn new() -> Self {
        Self::with_reject_policy(RejectPolicy::MustCatchRejection)
    }

    #[track_caller]
    pub fn with_reject_policy(reject_policy: RejectPolicy) -> Self {
        let can_reject = TypeId::of::<E>() != TypeId::of::<NoReject>();
        let node = PromiseNode::create(
            None,
            Vec::new(),
            reject_policy,
            Executor::do_nothing(true, can_reject),
        );
        Self {
            promise: Promise::from_node(node),
        }
    }

    pub fn promise(&self) -> Promise<T, E> {
        self.promise.clone()
    }

    pub fn resolve(&self, value: T) {
        resolve(self.promise.node(), value);
    }

    pub fn reject(&self, error: E) {
        reject(self.promise.node(), error);
    }

    /// Settles with whatever `promise` settles with, once it does.
    pub fn resolve_with(&self, promise: Promise<T, E>) {
        let node = self.promise.node();
        if claim(node) {
            node.emplace_curried(promise.into_node());
            node.on_resolved();
        }
    }

    pub fn resolve_callback(&self) -> impl FnOnce(T) + Send + 'static {
        let node = Arc::clone(self.promise.node());
        move |value| resolve(&node, value)
    }

    pub fn reject_callback(&self) -> impl FnOnce(E) + Send + 'static {
        let node = Arc::clone(self.promise.node());
        move |error| reject(&node, error)
    }

    /// A callback that may be called more than once. Only the first call
    /// settles; later ones are reported.
    pub fn repeating_resolve_callback(&self) -> impl Fn(T) + Send + Sync + 'static {
        let node = Arc::clone(self.promise.node());
        move |value| resolve(&node, value)
    }

    pub fn repeating_reject_callback(&self) -> impl Fn(E) + Send + Sync + 'static {
        let node = Arc::clone(self.promise.node());
        move |error| reject(&node, error)
    }
}

fn claim(node: &Arc<PromiseNode>) -> bool {
    if node.claim_manual_settlement() {
        return true;
    }
    if !node.is_canceled() {
        report_api_error(ApiError::AlreadySettled {
            location: node.location(),
        });
    }
    false
}

fn resolve<T: Value>(node: &Arc<PromiseNode>, value: T) {
    if claim(node) {
        node.emplace_resolved(value);
        node.on_resolved();
    }
}

fn reject<E: Value>(node: &Arc<PromiseNode>, error: E) {
    if claim(node) {
        node.emplace_rejected(error);
        node.on_rejected();
    }
}

impl<T, E> Drop for ManualPromiseResolver<T, E> {
    fn drop(&mut self) {
        let node = self.promise.node();
        if node.claim_manual_settlement() {
            node.on_canceled();
        }
    }
}

impl<T, E> std::fmt::Debug for ManualPromiseResolver<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManualPromiseResolver")
            .field("promise", &self.promise)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::ManualPromiseResolver;
    use crate::{capture_api_errors, ApiError, Promise};

    #[test]
    fn test_resolve() {
        let resolver = ManualPromiseResolver::<i32>::new();
        let promise = resolver.promise();
        assert!(!promise.is_settled());
        resolver.resolve(5);
        assert_eq!(promise.value().as_deref(), Some(&5));
    }

    #[test]
    fn test_repeating_callback_reports_second_call() {
        let resolver = ManualPromiseResolver::<i32>::new();
        let resolve = resolver.repeating_resolve_callback();
        let ((), errors) = capture_api_errors(|| {
            resolve(1);
            resolve(2);
        });
        assert!(matches!(errors[..], [ApiError::AlreadySettled { .. }]));
        assert_eq!(resolver.promise().value().as_deref(), Some(&1));
    }

    #[test]
    fn test_drop_cancels_unsettled_promise() {
        let resolver = ManualPromiseResolver::<i32, String>::new();
        let promise = resolver.promise();
        drop(resolver);
        assert!(promise.is_canceled());
    }

    #[test]
    fn test_settle_after_cancel_is_ignored() {
        let resolver = ManualPromiseResolver::<i32, String>::new();
        let promise = resolver.promise();
        promise.cancel();
        let ((), errors) = capture_api_errors(|| resolver.reject("late".into()));
        assert!(errors.is_empty());
        assert!(promise.is_canceled());
    }

    #[test]
    fn test_resolve_with_waits_for_target() {
        let target = ManualPromiseResolver::<i32>::new();
        let resolver = ManualPromiseResolver::<i32>::new();
        resolver.resolve_with(target.promise());
        drop(resolver.promise());
        assert!(!resolver.promise().is_settled());
        assert!(resolver.promise().node().is_resolved_with_promise());

        target.resolve(11);
        assert!(resolver.promise().is_resolved());
        assert_eq!(resolver.promise().value().as_deref(), Some(&11));
    }

    #[test]
    fn test_resolve_with_settled_promise() {
        let resolver = ManualPromiseResolver::<i32, String>::new();
        resolver.resolve_with(Promise::rejected("💥".into()));
        let promise = resolver.promise();
        assert!(promise.is_rejected());
        assert_eq!(promise.error().as_deref().map(String::as_str), Some("💥"));
        promise.ignore_uncaught_catch_for_testing();
    }
}
