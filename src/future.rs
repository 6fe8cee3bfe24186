//! Awaiting a promise from async code.
use crate::checks::ArgumentPassing;
use crate::executor::{Executor, ExecutorTraits, Settlement};
use crate::node::{PromiseNode, RejectPolicy};
use crate::promise::{value_unavailable, Promise};
use crate::sync::lock;
use crate::typed_value::TypedValue;
use crate::{Error, Value};
use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

#[derive(Debug)]
enum WakerState {
    Fresh,
    Tainted,
}

struct Inner<T, E> {
    value: Option<Result<T, E>>,
    waker: Result<Waker, WakerState>,
}

/// The producing half, shared by both callbacks of the awaiting node. When
/// the last one goes away the consumer is woken, with or without a value.
struct Completion<T, E>(Arc<Mutex<Inner<T, E>>>);

impl<T, E> Completion<T, E> {
    fn complete(&self, value: Result<T, E>) {
        lock(&self.0).value = Some(value);
    }
}

impl<T, E> Drop for Completion<T, E> {
    fn drop(&mut self) {
        let mut inner = lock(&self.0);
        if let Ok(waker) = std::mem::replace(&mut inner.waker, Err(WakerState::Tainted)) {
            drop(inner);
            waker.wake();
        }
    }
}

/// Resolves with the outcome of a promise, or [`Error::Canceled`] if the
/// promise is canceled.
///
/// The outcome is read by reference and cloned out, so awaiting does not
/// compete with other dependents of the promise. Awaiting it alongside a
/// [`Promise::then_move`] or [`Promise::catch_move`] of the same outcome is a
/// move hazard.
///
/// # Examples
///
/// ```
/// use futures::executor::block_on;
/// use promise_graph::{Error, ManualPromiseResolver};
/// use std::future::IntoFuture;
/// use std::thread;
///
/// let resolver = ManualPromiseResolver::<String, String>::new();
/// let promise = resolver.promise();
/// let task1 = thread::spawn(move || block_on(async { promise.await }));
/// resolver.reject("💥".into());
/// let outcome = task1.join().expect("The task1 thread has panicked");
/// assert_eq!(outcome, Ok(Err("💥".to_string())));
///
/// let canceled = ManualPromiseResolver::<u8>::new();
/// let promise = canceled.promise();
/// drop(canceled);
/// assert_eq!(block_on(promise.into_future()), Err(Error::Canceled));
/// ```
pub struct PromiseFuture<T, E> {
    inner: Arc<Mutex<Inner<T, E>>>,
    _node: Arc<PromiseNode>,
}

impl<T: Value + Clone, E: Value + Clone> PromiseFuture<T, E> {
    #[track_caller]
    fn new(promise: Promise<T, E>) -> Self {
        let inner = Arc::new(Mutex::new(Inner {
            value: None,
            waker: Err(WakerState::Fresh),
        }));
        let on_resolve = Arc::new(Completion(Arc::clone(&inner)));
        let on_reject = Arc::clone(&on_resolve);
        let traits = ExecutorTraits::new(ArgumentPassing::Normal, ArgumentPassing::Normal)
            .with_outcomes(true, false);
        let executor = Executor::then_and_catch(
            Some(Box::new(move |prerequisite: &Arc<PromiseNode>| {
                match prerequisite.resolved_value::<T>() {
                    Some(value) => {
                        on_resolve.complete(Ok(T::clone(&value)));
                        Settlement::Resolved(TypedValue::new(()))
                    }
                    None => value_unavailable(prerequisite),
                }
            })),
            Some(Box::new(move |prerequisite: &Arc<PromiseNode>| {
                match prerequisite.rejected_value::<E>() {
                    Some(error) => {
                        on_reject.complete(Err(E::clone(&error)));
                        Settlement::Resolved(TypedValue::new(()))
                    }
                    None => value_unavailable(prerequisite),
                }
            })),
            traits,
        );
        let node = PromiseNode::create(
            None,
            vec![promise.into_node()],
            RejectPolicy::CatchNotRequired,
            executor,
        );
        Self { inner, _node: node }
    }
}

impl<T, E> Future for PromiseFuture<T, E> {
    type Output = Result<Result<T, E>, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut inner = lock(&self.inner);
        match inner.value.take() {
            Some(value) => Poll::Ready(Ok(value)),
            None => match std::mem::replace(&mut inner.waker, Ok(cx.waker().clone())) {
                Err(WakerState::Tainted) => Poll::Ready(Err(Error::Canceled)),
                _ => Poll::Pending,
            },
        }
    }
}

impl<T: Value + Clone, E: Value + Clone> IntoFuture for Promise<T, E> {
    type Output = Result<Result<T, E>, Error>;
    type IntoFuture = PromiseFuture<T, E>;

    #[track_caller]
    fn into_future(self) -> Self::IntoFuture {
        PromiseFuture::new(self)
    }
}
