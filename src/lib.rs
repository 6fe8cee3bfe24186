//! A graph of promises whose continuations run on task runners.
//!
//! Every promise is a node holding a one-shot executor. A node becomes
//! eligible once its prerequisites settle, runs on its task runner and then
//! settles itself, which in turn notifies the nodes depending on it.
//! Cancellation flows the same way, synchronously.
//!
//! # Examples
//!
//! ```
//! use futures::executor::block_on;
//! use promise_graph::{ManualPromiseResolver, ManualTaskRunner, TaskRunnerRef};
//!
//! let runner = ManualTaskRunner::new();
//! let handle: TaskRunnerRef = runner.clone();
//!
//! let resolver = ManualPromiseResolver::<i32, String>::new();
//! let doubled = resolver.promise().then(&handle, |v: &i32| Ok::<_, String>(v * 2));
//!
//! resolver.resolve(21);
//! runner.run_until_idle();
//! assert_eq!(block_on(async { doubled.await }), Ok(Ok(42)));
//! ```
use std::any::Any;
use thiserror::Error;

mod sync;

pub mod checks;
pub mod combinators;
pub mod dependent_list;
pub mod executor;
pub mod future;
pub mod node;
pub mod promise;
pub mod resolver;
pub mod task_runner;
pub mod typed_value;

pub use checks::{capture_api_errors, report_api_error, ApiError, ArgumentPassing, SourceLocation, API_CHECKS};
pub use combinators::{all, all_unit, all_vec, any, AllTuple};
pub use dependent_list::{Blocked, DependentList, SettledState};
pub use executor::{Executor, ExecutorKind, ExecutorTraits, PrerequisitePolicy, Settlement};
pub use future::PromiseFuture;
pub use node::{PromiseNode, RejectPolicy, MAX_INLINE_DEPTH};
pub use promise::{CatchResult, IntoPromiseResult, NoReject, Promise, PromiseResult, Rejected, Resolved};
pub use resolver::ManualPromiseResolver;
pub use task_runner::{ManualTaskRunner, Task, TaskRunner, TaskRunnerRef, ThreadTaskRunner, ThreadTaskRunnerConfig};
pub use typed_value::TypedValue;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("the promise was canceled")]
    Canceled,
    #[error("{}", .0.insert_failure())]
    InsertBlocked(SettledState),
    #[error("the task runner has stopped")]
    TaskRunnerStopped,
}

/// A type promises can resolve or reject with.
pub trait Value: Any + Send + Sync {}

impl<T: Any + Send + Sync> Value for T {}
