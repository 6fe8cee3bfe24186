//! Joining several promises into one.
//!
//! Combinator nodes have no task runner: they run inline on whichever thread
//! settles the prerequisite that makes them eligible.
use crate::checks::ArgumentPassing;
use crate::executor::{Executor, ExecutorTraits, Settlement};
use crate::node::{PromiseNode, RejectPolicy};
use crate::promise::{value_unavailable, Promise};
use crate::typed_value::TypedValue;
use crate::Value;
use std::sync::Arc;

/// A tuple of promises that [`all`] can join.
pub trait AllTuple {
    type Output: Value;
    type Error: Value;

    fn into_nodes(self) -> Vec<Arc<PromiseNode>>;

    /// Moves every resolved value out of `prerequisites`, or returns the
    /// index of one that could not be read.
    fn collect(prerequisites: &[Arc<PromiseNode>]) -> Result<Self::Output, usize>;
}

macro_rules! impl_all_tuple {
    ($($name:ident $index:tt),+) => {
        impl<E: Value, $($name: Value),+> AllTuple for ($(Promise<$name, E>,)+) {
            type Output = ($($name,)+);
            type Error = E;

            fn into_nodes(self) -> Vec<Arc<PromiseNode>> {
                vec![$(self.$index.into_node()),+]
            }

            fn collect(prerequisites: &[Arc<PromiseNode>]) -> Result<Self::Output, usize> {
                Ok(($(
                    prerequisites
                        .get($index)
                        .and_then(|node| node.take_resolved_value::<$name>())
                        .ok_or::<usize>($index)?,
                )+))
            }
        }
    };
}

impl_all_tuple!(A 0);
impl_all_tuple!(A 0, B 1);
impl_all_tuple!(A 0, B 1, C 2);
impl_all_tuple!(A 0, B 1, C 2, D 3);
impl_all_tuple!(A 0, B 1, C 2, D 3, F 4);
impl_all_tuple!(A 0, B 1, C 2, D 3, F 4, G 5);

fn any_can_reject(nodes: &[Arc<PromiseNode>]) -> bool {
    nodes.iter().any(|node| node.traits().can_reject)
}

#[track_caller]
fn join<T, E>(nodes: Vec<Arc<PromiseNode>>, executor: Executor) -> Promise<T, E> {
    Promise::from_node(PromiseNode::create(
        None,
        nodes,
        RejectPolicy::MustCatchRejection,
        executor,
    ))
}

/// Resolves with a tuple of every value once all `promises` resolve, or
/// rejects with the first rejection in argument order.
///
/// # Examples
///
/// ```
/// use promise_graph::{all, ManualPromiseResolver, Promise};
///
/// let name = ManualPromiseResolver::<String>::new();
/// let both = all((Promise::resolved(1_u8), name.promise()));
/// assert!(!both.is_settled());
///
/// name.resolve("one".into());
/// let (number, text) = &*both.value().unwrap();
/// assert_eq!((*number, text.as_str()), (1, "one"));
/// ```
#[track_caller]
pub fn all<P: AllTuple + 'static>(promises: P) -> Promise<P::Output, P::Error> {
    let nodes = promises.into_nodes();
    let traits = ExecutorTraits::new(ArgumentPassing::Move, ArgumentPassing::NoCallback)
        .with_outcomes(true, any_can_reject(&nodes));
    let executor = Executor::all(
        Box::new(|prerequisites: &[Arc<PromiseNode>]| match P::collect(prerequisites) {
            Ok(values) => Settlement::Resolved(TypedValue::new(values)),
            Err(index) => value_unavailable(&prerequisites[index]),
        }),
        traits,
    );
    join(nodes, executor)
}

/// Like [`all`] for any number of promises of one type. An empty input
/// resolves right away with an empty vector.
#[track_caller]
pub fn all_vec<T: Value, E: Value>(promises: impl IntoIterator<Item = Promise<T, E>>) -> Promise<Vec<T>, E> {
    let nodes: Vec<_> = promises.into_iter().map(Promise::into_node).collect();
    if nodes.is_empty() {
        return Promise::resolved(Vec::new());
    }
    let traits = ExecutorTraits::new(ArgumentPassing::Move, ArgumentPassing::NoCallback)
        .with_outcomes(true, any_can_reject(&nodes));
    let executor = Executor::all(
        Box::new(|prerequisites: &[Arc<PromiseNode>]| {
            let values = prerequisites
                .iter()
                .map(|node| node.take_resolved_value::<T>().ok_or(node))
                .collect::<Result<Vec<T>, _>>();
            match values {
                Ok(values) => Settlement::Resolved(TypedValue::new(values)),
                Err(node) => value_unavailable(node),
            }
        }),
        traits,
    );
    join(nodes, executor)
}

/// Resolves with `()` once all `promises` resolve.
#[track_caller]
pub fn all_unit<E: Value>(promises: impl IntoIterator<Item = Promise<(), E>>) -> Promise<(), E> {
    let nodes: Vec<_> = promises.into_iter().map(Promise::into_node).collect();
    if nodes.is_empty() {
        return Promise::resolved(());
    }
    let traits = ExecutorTraits::new(ArgumentPassing::NoArgument, ArgumentPassing::NoCallback)
        .with_outcomes(true, any_can_reject(&nodes));
    let executor = Executor::all(Box::new(|_: &[Arc<PromiseNode>]| Settlement::Resolved(TypedValue::new(()))), traits);
    join(nodes, executor)
}

/// Takes on the outcome of whichever of `promises` settles first. Canceled
/// only once all of them are canceled, or right away if there are none.
#[track_caller]
pub fn any<T: Value, E: Value>(promises: impl IntoIterator<Item = Promise<T, E>>) -> Promise<T, E> {
    let nodes: Vec<_> = promises.into_iter().map(Promise::into_node).collect();
    let can_resolve = nodes.iter().any(|node| node.traits().can_resolve);
    let traits = ExecutorTraits::new(ArgumentPassing::NoCallback, ArgumentPassing::NoCallback)
        .with_outcomes(can_resolve, any_can_reject(&nodes));
    let empty = nodes.is_empty();
    let promise = join(nodes, Executor::any(traits));
    if empty {
        promise.cancel();
    }
    promise
}

#[cfg(test)]
mod tests {
    use super::{all, all_unit, all_vec, any};
    use crate::{ManualPromiseResolver, Promise};

    #[test]
    fn test_all_waits_for_every_prerequisite() {
        let first = ManualPromiseResolver::<i32, String>::new();
        let second = ManualPromiseResolver::<String, String>::new();
        let joined = all((first.promise(), second.promise()));
        first.resolve(1);
        assert!(!joined.is_settled());
        second.resolve("two".into());
        assert_eq!(joined.value().as_deref(), Some(&(1, "two".to_string())));
    }

    #[test]
    fn test_all_vec_empty_resolves() {
        let joined = all_vec(Vec::<Promise<i32>>::new());
        assert_eq!(joined.value().as_deref(), Some(&Vec::new()));
        assert!(all_unit(Vec::<Promise<()>>::new()).is_resolved());
    }

    #[test]
    fn test_all_unit() {
        let resolvers: Vec<_> = (0..3).map(|_| ManualPromiseResolver::<()>::new()).collect();
        let joined = all_unit(resolvers.iter().map(ManualPromiseResolver::promise));
        for resolver in &resolvers {
            assert!(!joined.is_settled());
            resolver.resolve(());
        }
        assert!(joined.is_resolved());
    }

    #[test]
    fn test_any_of_nothing_is_canceled() {
        assert!(any(Vec::<Promise<i32>>::new()).is_canceled());
    }

    #[test]
    fn test_any_takes_first_settled() {
        let slow = ManualPromiseResolver::<i32>::new();
        let fast = ManualPromiseResolver::<i32>::new();
        let first = any([slow.promise(), fast.promise()]);
        fast.resolve(2);
        slow.resolve(1);
        assert_eq!(first.value().as_deref(), Some(&2));
    }
}
