//! Where promise executors run.
//!
//! A [`TaskRunner`] accepts boxed callbacks and runs them later in order.
//! [`ManualTaskRunner`] runs its queue only when asked, which makes it the
//! natural driver for deterministic tests. [`ThreadTaskRunner`] owns a worker
//! thread fed through a channel.
use crate::sync::lock;
use crate::Error;
use std::cell::Cell;
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle, ThreadId};
use tracing::{debug, error};

/// A unit of posted work.
pub type Task = Box<dyn FnOnce() + Send>;

pub type TaskRunnerRef = Arc<dyn TaskRunner>;

pub trait TaskRunner: Send + Sync {
    /// Queues `task`. A runner that refuses the task drops it unrun.
    fn post_task(&self, task: Task) -> Result<(), Error>;

    /// Whether the caller is already running inside this runner's sequence.
    fn runs_tasks_in_current_sequence(&self) -> bool;
}

thread_local! {
    static RUNNING_MANUAL: Cell<usize> = const { Cell::new(0) };
}

/// A FIFO queue that only runs when told to.
///
/// # Examples
///
/// ```
/// use promise_graph::{ManualTaskRunner, TaskRunner};
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use std::sync::Arc;
///
/// let runner = ManualTaskRunner::new();
/// let counter = Arc::new(AtomicUsize::new(0));
/// for _ in 0..3 {
///     let counter = Arc::clone(&counter);
///     runner
///         .post_task(Box::new(move || {
///             counter.fetch_add(1, Ordering::SeqCst);
///         }))
///         .unwrap();
/// }
/// assert_eq!(runner.pending_task_count(), 3);
/// assert_eq!(runner.run_until_idle(), 3);
/// assert_eq!(counter.load(Ordering::SeqCst), 3);
/// ```
#[derive(Default)]
pub struct ManualTaskRunner {
    queue: Mutex<VecDeque<Task>>,
}

struct RunningScope(usize);

impl RunningScope {
    fn enter(runner: &ManualTaskRunner) -> Self {
        let id = runner as *const ManualTaskRunner as usize;
        RunningScope(RUNNING_MANUAL.with(|running| running.replace(id)))
    }
}

impl Drop for RunningScope {
    fn drop(&mut self) {
        RUNNING_MANUAL.with(|running| running.set(self.0));
    }
}

impl ManualTaskRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn pop(&self) -> Option<Task> {
        lock(&self.queue).pop_front()
    }

    /// Runs tasks until the queue is empty, including tasks posted by the
    /// tasks it runs. Returns how many ran.
    pub fn run_until_idle(&self) -> usize {
        let _scope = RunningScope::enter(self);
        let mut ran = 0;
        while let Some(task) = self.pop() {
            task();
            ran += 1;
        }
        ran
    }

    /// Runs only the tasks that were queued when called.
    pub fn run_pending_tasks(&self) -> usize {
        let _scope = RunningScope::enter(self);
        let pending = self.pending_task_count();
        let mut ran = 0;
        while ran < pending {
            let Some(task) = self.pop() else {
                break;
            };
            task();
            ran += 1;
        }
        ran
    }

    pub fn pending_task_count(&self) -> usize {
        lock(&self.queue).len()
    }

    pub fn has_pending_tasks(&self) -> bool {
        self.pending_task_count() > 0
    }

    /// Drops every queued task without running it.
    pub fn clear_pending_tasks(&self) {
        // Dropping a task may post more work, so never while holding the lock.
        let tasks = std::mem::take(&mut *lock(&self.queue));
        debug!(count = tasks.len(), "clearing pending tasks");
        drop(tasks);
    }
}

impl TaskRunner for ManualTaskRunner {
    fn post_task(&self, task: Task) -> Result<(), Error> {
        lock(&self.queue).push_back(task);
        Ok(())
    }

    fn runs_tasks_in_current_sequence(&self) -> bool {
        RUNNING_MANUAL.with(Cell::get) == self as *const Self as usize
    }
}

impl std::fmt::Debug for ManualTaskRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManualTaskRunner")
            .field("pending", &self.pending_task_count())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct ThreadTaskRunnerConfig {
    pub name: String,
    pub stack_size: Option<usize>,
}

impl Default for ThreadTaskRunnerConfig {
    fn default() -> Self {
        Self {
            name: "promise-runner".into(),
            stack_size: None,
        }
    }
}

/// A dedicated worker thread running posted tasks in order.
#[derive(Debug)]
pub struct ThreadTaskRunner {
    name: String,
    sender: Mutex<Option<Sender<Task>>>,
    stopping: Arc<AtomicBool>,
    thread_id: ThreadId,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ThreadTaskRunner {
    pub fn start(config: ThreadTaskRunnerConfig) -> io::Result<Arc<Self>> {
        let (sender, receiver) = channel::<Task>();
        let stopping = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stopping);
        let mut builder = thread::Builder::new().name(config.name.clone());
        if let Some(stack_size) = config.stack_size {
            builder = builder.stack_size(stack_size);
        }
        let handle = builder.spawn(move || {
            for task in receiver {
                if flag.load(Ordering::Acquire) {
                    drop(task);
                } else {
                    task();
                }
            }
        })?;
        debug!(name = %config.name, "task runner started");
        Ok(Arc::new(Self {
            name: config.name,
            sender: Mutex::new(Some(sender)),
            stopping,
            thread_id: handle.thread().id(),
            handle: Mutex::new(Some(handle)),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Refuses new tasks, drops the queued ones and waits for the worker to
    /// finish the task it is running.
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::Release);
        drop(lock(&self.sender).take());
        let Some(handle) = lock(&self.handle).take() else {
            return;
        };
        if thread::current().id() == self.thread_id {
            return;
        }
        if handle.join().is_err() {
            error!(name = %self.name, "task runner thread panicked");
        }
        debug!(name = %self.name, "task runner stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }
}

impl TaskRunner for ThreadTaskRunner {
    fn post_task(&self, task: Task) -> Result<(), Error> {
        let sender = lock(&self.sender).clone();
        match sender {
            Some(sender) => sender.send(task).map_err(|_| Error::TaskRunnerStopped),
            None => Err(Error::TaskRunnerStopped),
        }
    }

    fn runs_tasks_in_current_sequence(&self) -> bool {
        thread::current().id() == self.thread_id
    }
}

impl Drop for ThreadTaskRunner {
    fn drop(&mut self) {
        self.stop();
    }
}
