//! Deferred computations attached to pending promise nodes.
use crate::checks::{report_api_error, ApiError, ArgumentPassing};
use crate::node::PromiseNode;
use crate::typed_value::TypedValue;
use std::fmt;
use std::sync::Arc;

/// When a node becomes eligible to run, given its prerequisites.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrerequisitePolicy {
    /// Every prerequisite resolved, or any one rejected. Canceled as soon
    /// as one prerequisite is canceled.
    All,
    /// The first prerequisite to resolve or reject. Canceled only once every
    /// prerequisite is canceled.
    Any,
    /// Never run by dispatch; the node is settled by hand.
    Never,
}

/// Static facts about an executor, kept on the node after the executor is
/// consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorTraits {
    pub resolve_passing: ArgumentPassing,
    pub reject_passing: ArgumentPassing,
    pub can_resolve: bool,
    pub can_reject: bool,
}

impl ExecutorTraits {
    pub const fn new(resolve_passing: ArgumentPassing, reject_passing: ArgumentPassing) -> Self {
        Self {
            resolve_passing,
            reject_passing,
            can_resolve: true,
            can_reject: true,
        }
    }

    pub const fn with_outcomes(mut self, can_resolve: bool, can_reject: bool) -> Self {
        self.can_resolve = can_resolve;
        self.can_reject = can_reject;
        self
    }
}

/// What running an executor produced.
pub enum Settlement {
    Resolved(TypedValue),
    Rejected(TypedValue),
    /// The node takes on the eventual outcome of another promise.
    Curried(Arc<PromiseNode>),
    Canceled,
}

impl fmt::Debug for Settlement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Settlement::Resolved(value) => f.debug_tuple("Resolved").field(value).finish(),
            Settlement::Rejected(value) => f.debug_tuple("Rejected").field(value).finish(),
            Settlement::Curried(node) => f.debug_tuple("Curried").field(&node.location()).finish(),
            Settlement::Canceled => f.write_str("Canceled"),
        }
    }
}

/// Receives the node the callback reads from: the prerequisite for
/// [`ExecutorKind::ThenAndCatch`], the executing node for
/// [`ExecutorKind::Custom`].
pub type NodeCallback = Box<dyn FnOnce(&Arc<PromiseNode>) -> Settlement + Send>;
pub type TaskCallback = Box<dyn FnOnce() -> Settlement + Send>;
pub type AllCallback = Box<dyn FnOnce(&[Arc<PromiseNode>]) -> Settlement + Send>;
pub type CancelGuard = Box<dyn Fn() -> bool + Send + Sync>;

pub enum ExecutorKind {
    /// Leaf settled by hand.
    DoNothing,
    /// A missing callback forwards the prerequisite's outcome.
    ThenAndCatch {
        on_resolve: Option<NodeCallback>,
        on_reject: Option<NodeCallback>,
    },
    Finally(TaskCallback),
    /// Called only when no prerequisite rejected.
    All(AllCallback),
    Any,
    PostTask(TaskCallback),
    Custom(NodeCallback),
}

impl ExecutorKind {
    fn name(&self) -> &'static str {
        match self {
            ExecutorKind::DoNothing => "DoNothing",
            ExecutorKind::ThenAndCatch { .. } => "ThenAndCatch",
            ExecutorKind::Finally(_) => "Finally",
            ExecutorKind::All(_) => "All",
            ExecutorKind::Any => "Any",
            ExecutorKind::PostTask(_) => "PostTask",
            ExecutorKind::Custom(_) => "Custom",
        }
    }
}

/// The single-shot computation of a pending node.
pub struct Executor {
    kind: ExecutorKind,
    policy: PrerequisitePolicy,
    traits: ExecutorTraits,
    guard: Option<CancelGuard>,
}

impl Executor {
    pub fn new(kind: ExecutorKind, policy: PrerequisitePolicy, traits: ExecutorTraits) -> Self {
        Self {
            kind,
            policy,
            traits,
            guard: None,
        }
    }

    pub fn do_nothing(can_resolve: bool, can_reject: bool) -> Self {
        let traits = ExecutorTraits::new(ArgumentPassing::NoCallback, ArgumentPassing::NoCallback)
            .with_outcomes(can_resolve, can_reject);
        Self::new(ExecutorKind::DoNothing, PrerequisitePolicy::Never, traits)
    }

    pub fn then_and_catch(
        on_resolve: Option<NodeCallback>,
        on_reject: Option<NodeCallback>,
        traits: ExecutorTraits,
    ) -> Self {
        let kind = ExecutorKind::ThenAndCatch {
            on_resolve,
            on_reject,
        };
        Self::new(kind, PrerequisitePolicy::All, traits)
    }

    pub fn finally(callback: TaskCallback, traits: ExecutorTraits) -> Self {
        Self::new(ExecutorKind::Finally(callback), PrerequisitePolicy::All, traits)
    }

    pub fn all(callback: AllCallback, traits: ExecutorTraits) -> Self {
        Self::new(ExecutorKind::All(callback), PrerequisitePolicy::All, traits)
    }

    pub fn any(traits: ExecutorTraits) -> Self {
        Self::new(ExecutorKind::Any, PrerequisitePolicy::Any, traits)
    }

    pub fn post_task(callback: TaskCallback, traits: ExecutorTraits) -> Self {
        Self::new(ExecutorKind::PostTask(callback), PrerequisitePolicy::All, traits)
    }

    pub fn custom(policy: PrerequisitePolicy, traits: ExecutorTraits, callback: NodeCallback) -> Self {
        Self::new(ExecutorKind::Custom(callback), policy, traits)
    }

    /// Cancels the node instead of running once `guard` returns `true`.
    pub fn with_cancel_guard(mut self, guard: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        self.guard = Some(Box::new(guard));
        self
    }

    pub fn prerequisite_policy(&self) -> PrerequisitePolicy {
        self.policy
    }

    pub fn traits(&self) -> &ExecutorTraits {
        &self.traits
    }

    pub fn is_cancelled(&self) -> bool {
        self.guard.as_ref().is_some_and(|guard| guard())
    }

    /// Runs the computation for `node`, consuming the executor.
    pub(crate) fn execute(self, node: &Arc<PromiseNode>) -> Settlement {
        match self.kind {
            ExecutorKind::DoNothing => {
                report_api_error(ApiError::NeverPolicyExecuted {
                    location: node.location(),
                });
                Settlement::Canceled
            }
            ExecutorKind::ThenAndCatch {
                on_resolve,
                on_reject,
            } => {
                let Some(prerequisite) = node.only_prerequisite() else {
                    return Settlement::Canceled;
                };
                let callback = if prerequisite.is_resolved() {
                    on_resolve
                } else if prerequisite.is_rejected() {
                    on_reject
                } else {
                    return Settlement::Canceled;
                };
                match callback {
                    Some(callback) => callback(&prerequisite),
                    None => Settlement::Curried(prerequisite),
                }
            }
            ExecutorKind::Finally(callback) | ExecutorKind::PostTask(callback) => callback(),
            ExecutorKind::All(callback) => {
                if let Some(rejected) = node.first_rejected_prerequisite() {
                    return Settlement::Curried(rejected);
                }
                match node.prerequisite_nodes() {
                    Some(prerequisites) => callback(&prerequisites),
                    None => Settlement::Canceled,
                }
            }
            ExecutorKind::Any => match node.first_settled_prerequisite() {
                Some(settled) => Settlement::Curried(settled),
                None => Settlement::Canceled,
            },
            ExecutorKind::Custom(callback) => callback(node),
        }
    }
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("kind", &self.kind.name())
            .field("policy", &self.policy)
            .field("traits", &self.traits)
            .field("guarded", &self.guard.is_some())
            .finish()
    }
}
