use crate::errors::{BoxError, PoolError, SharedError, TaskError, TaskPanic};
use std::fmt;
use std::future::{Future, IntoFuture};
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, trace};

pub type TaskId = u64;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

fn next_task_id() -> TaskId {
    NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed)
}

/// Per-task options given at spawn time.
#[derive(Clone, Debug, Default)]
pub struct SpawnOptions {
    pub name: Option<String>,
    /// Time budget counted from submission. Once elapsed the task is marked as timed out, even if
    /// its callable is still running.
    pub timeout: Option<Duration>,
}

impl SpawnOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A snapshot of where a task is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl TaskStatus {
    /// Terminal states never change once reached.
    pub fn is_terminal(self) -> bool {
        !matches!(self, TaskStatus::Pending | TaskStatus::Running)
    }
}

enum TaskState<T> {
    Pending,
    Running,
    Completed(T),
    Failed(SharedError),
    Cancelled,
    TimedOut(Duration),
}

impl<T> TaskState<T> {
    fn status(&self) -> TaskStatus {
        match self {
            TaskState::Pending => TaskStatus::Pending,
            TaskState::Running => TaskStatus::Running,
            TaskState::Completed(_) => TaskStatus::Completed,
            TaskState::Failed(_) => TaskStatus::Failed,
            TaskState::Cancelled => TaskStatus::Cancelled,
            TaskState::TimedOut(_) => TaskStatus::TimedOut,
        }
    }

    fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    fn from_outcome(outcome: Result<T, TaskError>) -> Self {
        match outcome {
            Ok(value) => TaskState::Completed(value),
            Err(TaskError::Failed(err)) => TaskState::Failed(err),
            Err(TaskError::Cancelled) => TaskState::Cancelled,
            Err(TaskError::TimedOut(timeout)) => TaskState::TimedOut(timeout),
        }
    }
}

impl<T: Clone> TaskState<T> {
    fn outcome(&self) -> Option<Result<T, TaskError>> {
        match self {
            TaskState::Pending | TaskState::Running => None,
            TaskState::Completed(value) => Some(Ok(value.clone())),
            TaskState::Failed(err) => Some(Err(TaskError::Failed(Arc::clone(err)))),
            TaskState::Cancelled => Some(Err(TaskError::Cancelled)),
            TaskState::TimedOut(timeout) => Some(Err(TaskError::TimedOut(*timeout))),
        }
    }
}

/// The one-shot result cell of a task. It is shared by the pool job, the timeout timer and every
/// `TaskHandle`; the watch channel lock serialises the transitions, so exactly one of completion,
/// cancellation and timeout records the terminal state.
pub(crate) struct TaskCell<T> {
    id: TaskId,
    name: Option<String>,
    state: watch::Sender<TaskState<T>>,
}

impl<T> TaskCell<T> {
    pub(crate) fn new(name: Option<String>) -> Arc<Self> {
        let (state, _) = watch::channel(TaskState::Pending);
        Arc::new(Self {
            id: next_task_id(),
            name,
            state,
        })
    }

    fn transition(&self, allowed: impl FnOnce(&TaskState<T>) -> bool, next: TaskState<T>) -> bool {
        self.state.send_if_modified(|state| {
            if allowed(state) {
                *state = next;
                true
            } else {
                false
            }
        })
    }

    /// Pending -> Running. Fails if the task was cancelled or timed out while queued.
    pub(crate) fn begin(&self) -> bool {
        self.transition(|state| matches!(state, TaskState::Pending), TaskState::Running)
    }

    /// Records the outcome unless a terminal state is already there.
    pub(crate) fn finish(&self, outcome: Result<T, TaskError>) -> bool {
        self.transition(|state| !state.is_terminal(), TaskState::from_outcome(outcome))
    }

    pub(crate) fn cancel(&self) -> bool {
        let cancelled = self.transition(|state| !state.is_terminal(), TaskState::Cancelled);
        if cancelled {
            trace!(task = self.id, "task cancelled");
        }
        cancelled
    }

    pub(crate) fn time_out(&self, timeout: Duration) -> bool {
        let timed_out = self.transition(|state| !state.is_terminal(), TaskState::TimedOut(timeout));
        if timed_out {
            debug!(task = self.id, name = ?self.name, ?timeout, "task timed out");
        }
        timed_out
    }

    fn status(&self) -> TaskStatus {
        self.state.borrow().status()
    }
}

impl<T: Send + Sync + 'static> TaskCell<T> {
    /// Wraps `f` into the closure a pool thread runs: errors and panics are captured into the
    /// returned `Completion`, never propagated to the thread. Nothing is visible to the handles
    /// until the completion is published.
    pub(crate) fn runner<F, E>(self: &Arc<Self>, f: F) -> Box<dyn FnOnce() -> Completion + Send>
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        let cell = Arc::clone(self);
        Box::new(move || {
            let outcome = match panic::catch_unwind(AssertUnwindSafe(f)) {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(err)) => Err(TaskError::failed(err)),
                Err(payload) => Err(TaskError::failed(TaskPanic::from_payload(payload))),
            };
            if let Err(err) = &outcome {
                debug!(task = cell.id, name = ?cell.name, error = %err, "task failed");
            }
            Completion {
                publish: Box::new(move || {
                    let recorded = cell.finish(outcome);
                    if !recorded {
                        trace!(task = cell.id, "task result discarded, the task was already over");
                    }
                    recorded
                }),
            }
        })
    }
}

/// The outcome of a callable that ran, not yet recorded in its task cell.
pub(crate) struct Completion {
    publish: Box<dyn FnOnce() -> bool + Send>,
}

impl Completion {
    /// Records the outcome. Returns `false` if the task was cancelled or timed out meanwhile.
    pub(crate) fn publish(self) -> bool {
        (self.publish)()
    }
}

/// The type-erased side of a task cell the pool keeps around to schedule and cancel it.
pub(crate) trait TaskControl: Send + Sync {
    fn id(&self) -> TaskId;
    fn begin(&self) -> bool;
    fn cancel(&self) -> bool;
    fn status(&self) -> TaskStatus;
}

impl<T: Send + Sync> TaskControl for TaskCell<T> {
    fn id(&self) -> TaskId {
        self.id
    }

    fn begin(&self) -> bool {
        TaskCell::begin(self)
    }

    fn cancel(&self) -> bool {
        TaskCell::cancel(self)
    }

    fn status(&self) -> TaskStatus {
        TaskCell::status(self)
    }
}

/// A handle on the eventual result of a spawned task. Handles are cheap to clone, every clone
/// observes the same task. Use an `Executor` to block on it, or `.await` it from async code.
pub struct TaskHandle<T> {
    cell: Arc<TaskCell<T>>,
}

impl<T> TaskHandle<T> {
    pub(crate) fn new(cell: Arc<TaskCell<T>>) -> Self {
        Self { cell }
    }

    /// Returns a handle that is already failed with `err`, used when a task could not be submitted.
    pub(crate) fn rejected(err: PoolError) -> Self {
        debug!(error = %err, "task rejected");
        let cell = TaskCell::new(None);
        cell.finish(Err(TaskError::failed(err)));
        Self { cell }
    }

    pub fn id(&self) -> TaskId {
        self.cell.id
    }

    pub fn name(&self) -> Option<&str> {
        self.cell.name.as_deref()
    }

    pub fn status(&self) -> TaskStatus {
        self.cell.status()
    }

    /// Returns `true` once the task reached a terminal state.
    pub fn is_done(&self) -> bool {
        self.status().is_terminal()
    }

    /// Requests the cancellation of the task. Returns `true` if the task was still pending or
    /// running and is now cancelled, `false` if it was already over.
    ///
    /// A callable that is already running is not interrupted: it runs to completion on its pool
    /// thread, with all its side effects, and its result is discarded.
    pub fn cancel(&self) -> bool {
        self.cell.cancel()
    }
}

impl<T: Clone> TaskHandle<T> {
    /// Returns the outcome if the task is over, without waiting.
    pub fn try_result(&self) -> Option<Result<T, TaskError>> {
        self.cell.state.borrow().outcome()
    }

    /// Waits for the task to be over and returns its outcome.
    pub async fn wait(&self) -> Result<T, TaskError> {
        let mut state = self.cell.state.subscribe();
        let outcome = state
            .wait_for(TaskState::is_terminal)
            .await
            .ok()
            .and_then(|state| state.outcome());
        match outcome {
            Some(outcome) => outcome,
            None => unreachable!("the state sender lives as long as the handle"),
        }
    }
}

impl<T> Clone for TaskHandle<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<T> fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id())
            .field("name", &self.cell.name)
            .field("status", &self.status())
            .finish()
    }
}

impl<T: Clone + Send + Sync + 'static> IntoFuture for TaskHandle<T> {
    type Output = Result<T, TaskError>;
    type IntoFuture = Pin<Box<dyn Future<Output = Self::Output> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move { self.wait().await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_first_terminal_state_wins() {
        let cell = TaskCell::<u32>::new(Some("first".to_string()));
        let handle = TaskHandle::new(Arc::clone(&cell));
        assert_eq!(handle.status(), TaskStatus::Pending);
        assert!(handle.try_result().is_none());

        assert!(cell.begin());
        assert!(!cell.begin());
        assert_eq!(handle.status(), TaskStatus::Running);

        assert!(cell.finish(Ok(7)));
        assert!(!handle.cancel());
        assert!(!cell.time_out(Duration::from_millis(1)));
        assert!(!cell.finish(Ok(8)));
        assert_eq!(handle.try_result().unwrap().unwrap(), 7);
        assert_eq!(handle.name(), Some("first"));
    }

    #[test]
    fn test_cancel_before_start() {
        let cell = TaskCell::<u32>::new(None);
        let handle = TaskHandle::new(Arc::clone(&cell));

        assert!(handle.cancel());
        assert!(!handle.cancel());
        assert!(!cell.begin());
        assert!(!cell.finish(Ok(1)));
        assert_eq!(handle.status(), TaskStatus::Cancelled);
        assert!(handle.try_result().unwrap().unwrap_err().is_cancelled());
    }

    #[test]
    fn test_timeout_is_sticky() {
        let cell = TaskCell::<u32>::new(None);
        let handle = TaskHandle::new(Arc::clone(&cell));
        cell.begin();

        assert!(cell.time_out(Duration::from_millis(100)));
        assert!(!cell.finish(Ok(1)));
        assert!(!handle.cancel());
        match handle.try_result() {
            Some(Err(TaskError::TimedOut(budget))) => {
                assert_eq!(budget, Duration::from_millis(100))
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_runner_captures_errors_and_panics() {
        let cell = TaskCell::<u32>::new(None);
        let handle = TaskHandle::new(Arc::clone(&cell));
        cell.begin();
        let completion =
            (cell.runner(|| Err::<u32, _>(io::Error::new(io::ErrorKind::Other, "broken pipe"))))();
        assert!(handle.try_result().is_none());
        assert!(completion.publish());

        let err = handle.try_result().unwrap().unwrap_err();
        assert_eq!(err.to_string(), "broken pipe");
        assert_eq!(
            err.downcast_ref::<io::Error>().map(io::Error::kind),
            Some(io::ErrorKind::Other)
        );

        let cell = TaskCell::<u32>::new(None);
        let handle = TaskHandle::new(Arc::clone(&cell));
        assert!((cell.runner(|| -> Result<u32, BoxError> { panic!("worker exploded") }))().publish());
        let err = handle.try_result().unwrap().unwrap_err();
        assert_eq!(
            err.downcast_ref::<TaskPanic>().map(|p| p.message.as_str()),
            Some("worker exploded")
        );
    }

    #[test]
    fn test_completion_loses_to_cancel() {
        let cell = TaskCell::<u32>::new(None);
        let handle = TaskHandle::new(Arc::clone(&cell));
        cell.begin();
        let completion = (cell.runner(|| Ok::<_, BoxError>(3)))();

        assert!(handle.cancel());
        assert!(!completion.publish());
        assert_eq!(handle.status(), TaskStatus::Cancelled);
    }

    #[test]
    fn test_rejected_handle_is_failed() {
        let handle = TaskHandle::<u32>::rejected(PoolError::ShutDown);
        assert_eq!(handle.status(), TaskStatus::Failed);
        let err = handle.try_result().unwrap().unwrap_err();
        assert!(matches!(err.downcast_ref::<PoolError>(), Some(PoolError::ShutDown)));
    }

    #[tokio::test]
    async fn test_wait_resolves_on_completion() {
        let cell = TaskCell::<String>::new(None);
        let handle = TaskHandle::new(Arc::clone(&cell));
        let waiters: Vec<_> = (0..3)
            .map(|_| tokio::spawn(handle.clone().into_future()))
            .collect();

        tokio::time::sleep(Duration::from_millis(10)).await;
        cell.finish(Ok("done".to_string()));

        for waiter in waiters {
            assert_eq!(waiter.await.unwrap().unwrap(), "done");
        }
        assert_eq!(handle.await.unwrap(), "done");
    }

    #[tokio::test]
    async fn test_wait_on_already_cancelled_task() {
        let handle = TaskHandle::new(TaskCell::<u8>::new(None));
        handle.cancel();
        assert!(handle.wait().await.unwrap_err().is_cancelled());
    }
}
