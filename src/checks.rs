//! Runtime detection of promise API misuse.
//!
//! Two classes of bugs are caught while the graph is built or torn down:
//! two continuations that would both move the same value out of a shared
//! ancestor, and rejections that reach the end of a chain without a catch.
//! Violations go through [`report_api_error`], which panics unless the
//! current thread is collecting errors with [`capture_api_errors`].
use crate::node::{PromiseNode, RejectPolicy};
use crate::sync::lock;
use std::cell::RefCell;
use std::panic::Location;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::error;

/// Whether move-hazard and uncaught-rejection tracking is active.
pub const API_CHECKS: bool = cfg!(any(debug_assertions, feature = "api-checks"));

/// Where a promise was created.
pub type SourceLocation = &'static Location<'static>;

/// A programmer error in the use of the promise API.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ApiError {
    #[error("promise at {dependent} moves a value already moved by the promise at {previous}")]
    DoubleMove {
        dependent: SourceLocation,
        previous: SourceLocation,
    },
    #[error("promise at {dependent} mixes move and non-move access with the promise at {previous}")]
    MixedMove {
        dependent: SourceLocation,
        previous: SourceLocation,
    },
    #[error("promise chain ending at {location} has no catch for the rejection from {origin}")]
    UncaughtRejection {
        location: SourceLocation,
        origin: SourceLocation,
    },
    #[error("promise at {location} was already settled")]
    AlreadySettled { location: SourceLocation },
    #[error("promise at {location} was declared as never resolving")]
    CannotResolve { location: SourceLocation },
    #[error("promise at {location} was declared as never rejecting")]
    CannotReject { location: SourceLocation },
    #[error("manually settled promise at {location} was executed")]
    NeverPolicyExecuted { location: SourceLocation },
    #[error("value of promise at {location} was already moved out or is still borrowed")]
    ValueUnavailable { location: SourceLocation },
}

thread_local! {
    static CAPTURED: RefCell<Option<Vec<ApiError>>> = const { RefCell::new(None) };
}

/// Reports `error`.
///
/// # Panics
///
/// Panics unless the calling thread is inside [`capture_api_errors`] or is
/// already unwinding.
pub fn report_api_error(error: ApiError) {
    error!(%error, "promise API misuse");
    let captured = CAPTURED.with(|captured| match captured.borrow_mut().as_mut() {
        Some(errors) => {
            errors.push(error.clone());
            true
        }
        None => false,
    });
    if !captured && !std::thread::panicking() {
        panic!("{error}");
    }
}

/// Runs `f`, collecting the API errors reported on this thread instead of
/// panicking on them.
///
/// # Examples
///
/// ```
/// use promise_graph::{capture_api_errors, ApiError, ManualPromiseResolver};
///
/// let resolver = ManualPromiseResolver::<i32>::new();
/// let ((), errors) = capture_api_errors(|| {
///     resolver.resolve(1);
///     resolver.resolve(2);
/// });
/// assert!(matches!(errors[..], [ApiError::AlreadySettled { .. }]));
/// ```
pub fn capture_api_errors<R>(f: impl FnOnce() -> R) -> (R, Vec<ApiError>) {
    struct Restore(Option<Option<Vec<ApiError>>>);

    impl Drop for Restore {
        fn drop(&mut self) {
            if let Some(previous) = self.0.take() {
                CAPTURED.with(|captured| *captured.borrow_mut() = previous);
            }
        }
    }

    let mut restore = Restore(Some(CAPTURED.with(|c| c.replace(Some(Vec::new())))));
    let result = f();
    let errors = CAPTURED.with(|captured| captured.replace(restore.0.take().flatten()));
    (result, errors.unwrap_or_default())
}

/// How a continuation receives the value of its prerequisite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgumentPassing {
    /// No callback for this outcome; the value is forwarded untouched.
    NoCallback,
    /// A callback runs but never looks at the value.
    NoArgument,
    /// The callback borrows the value.
    Normal,
    /// The callback takes ownership of the value.
    Move,
}

#[derive(Debug, Default)]
struct Readers {
    normal: Option<SourceLocation>,
    moved: Option<SourceLocation>,
}

/// Records who reads the value produced by one promise outcome.
#[derive(Debug, Default)]
pub(crate) struct MoveDetector {
    readers: Mutex<Readers>,
}

impl MoveDetector {
    fn check(&self, dependent: SourceLocation, passing: ArgumentPassing) {
        let error = {
            let mut readers = lock(&self.readers);
            match passing {
                ArgumentPassing::NoCallback | ArgumentPassing::NoArgument => None,
                ArgumentPassing::Normal => {
                    readers.normal.get_or_insert(dependent);
                    readers
                        .moved
                        .map(|previous| ApiError::MixedMove { dependent, previous })
                }
                ArgumentPassing::Move => match (readers.moved, readers.normal) {
                    (Some(previous), _) => Some(ApiError::DoubleMove { dependent, previous }),
                    (None, Some(previous)) => Some(ApiError::MixedMove { dependent, previous }),
                    (None, None) => {
                        readers.moved = Some(dependent);
                        None
                    }
                },
            }
        };
        if let Some(error) = error {
            report_api_error(error);
        }
    }
}

/// Per-node bookkeeping for the runtime checks.
#[derive(Debug, Default)]
pub(crate) struct NodeChecks {
    resolve_detector: Arc<MoveDetector>,
    reject_detector: Arc<MoveDetector>,
    resolve_ancestor: Option<Arc<MoveDetector>>,
    reject_ancestor: Option<Arc<MoveDetector>>,
    passed_catch_responsibility: AtomicBool,
    ignore_uncaught_catch: AtomicBool,
}

impl NodeChecks {
    /// Sets up the checks of a node created at `location` and validates its
    /// argument passing against the other readers of each prerequisite.
    pub(crate) fn new(
        location: SourceLocation,
        traits: &crate::ExecutorTraits,
        prerequisites: &[Arc<PromiseNode>],
    ) -> Self {
        let mut checks = Self::default();
        for prerequisite in prerequisites {
            let Some(parent) = prerequisite.checks() else {
                continue;
            };
            parent.pass_catch_responsibility();

            let parent_traits = prerequisite.traits();
            let resolve_source = Self::source(
                parent_traits.resolve_passing,
                parent_traits.can_resolve,
                &parent.resolve_ancestor,
                &parent.resolve_detector,
            );
            let reject_source = Self::source(
                parent_traits.reject_passing,
                parent_traits.can_reject,
                &parent.reject_ancestor,
                &parent.reject_detector,
            );
            if let Some(detector) = &resolve_source {
                detector.check(location, traits.resolve_passing);
            }
            if let Some(detector) = &reject_source {
                detector.check(location, traits.reject_passing);
            }
            if prerequisites.len() == 1 {
                checks.resolve_ancestor = resolve_source;
                checks.reject_ancestor = reject_source;
            }
        }
        checks
    }

    /// The detector guarding the value a dependent of this node would read
    /// for one outcome: inherited through nodes that have no callback for it,
    /// otherwise this node's own when it can produce that outcome.
    fn source(
        passing: ArgumentPassing,
        can_produce: bool,
        ancestor: &Option<Arc<MoveDetector>>,
        own: &Arc<MoveDetector>,
    ) -> Option<Arc<MoveDetector>> {
        let inherited = match passing {
            ArgumentPassing::NoCallback => ancestor.clone(),
            _ => None,
        };
        inherited.or_else(|| can_produce.then(|| Arc::clone(own)))
    }

    /// A dependent or a curried promise now observes this node's outcome.
    pub(crate) fn pass_catch_responsibility(&self) {
        self.passed_catch_responsibility.store(true, Ordering::Release);
    }

    pub(crate) fn ignore_uncaught_catch(&self) {
        self.ignore_uncaught_catch.store(true, Ordering::Release);
    }

    /// Runs when `node` is destroyed.
    pub(crate) fn check_uncaught_rejection(&self, node: &PromiseNode) {
        if !node.is_rejected()
            || !node.traits().can_reject
            || node.reject_policy() != RejectPolicy::MustCatchRejection
            || self.passed_catch_responsibility.load(Ordering::Acquire)
            || self.ignore_uncaught_catch.load(Ordering::Acquire)
        {
            return;
        }
        let (origin, origin_policy) = node.rejection_origin();
        if origin_policy == RejectPolicy::MustCatchRejection {
            report_api_error(ApiError::UncaughtRejection {
                location: node.location(),
                origin,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{capture_api_errors, report_api_error, ApiError, ArgumentPassing, MoveDetector};
    use std::panic::Location;

    #[test]
    fn test_capture_collects_instead_of_panicking() {
        let location = Location::caller();
        let ((), errors) = capture_api_errors(|| {
            report_api_error(ApiError::AlreadySettled { location });
            report_api_error(ApiError::CannotReject { location });
        });
        assert_eq!(
            errors,
            vec![
                ApiError::AlreadySettled { location },
                ApiError::CannotReject { location }
            ]
        );
    }

    #[test]
    fn test_nested_capture_restores_outer() {
        let location = Location::caller();
        let (inner, outer) = capture_api_errors(|| {
            let ((), inner) = capture_api_errors(|| {
                report_api_error(ApiError::CannotResolve { location });
            });
            report_api_error(ApiError::AlreadySettled { location });
            inner
        });
        assert_eq!(inner, vec![ApiError::CannotResolve { location }]);
        assert_eq!(outer, vec![ApiError::AlreadySettled { location }]);
    }

    #[test]
    #[should_panic(expected = "was already settled")]
    fn test_uncaptured_error_panics() {
        report_api_error(ApiError::AlreadySettled {
            location: Location::caller(),
        });
    }

    #[test]
    fn test_move_detector() {
        let first = Location::caller();
        let second = Location::caller();

        let detector = MoveDetector::default();
        let ((), errors) = capture_api_errors(|| {
            detector.check(first, ArgumentPassing::NoCallback);
            detector.check(first, ArgumentPassing::NoArgument);
            detector.check(first, ArgumentPassing::Normal);
            detector.check(second, ArgumentPassing::Normal);
        });
        assert!(errors.is_empty());

        let ((), errors) = capture_api_errors(|| detector.check(second, ArgumentPassing::Move));
        assert_eq!(
            errors,
            vec![ApiError::MixedMove {
                dependent: second,
                previous: first
            }]
        );

        let detector = MoveDetector::default();
        let ((), errors) = capture_api_errors(|| {
            detector.check(first, ArgumentPassing::Move);
            detector.check(second, ArgumentPassing::Move);
        });
        assert_eq!(
            errors,
            vec![ApiError::DoubleMove {
                dependent: second,
                previous: first
            }]
        );
    }
}
