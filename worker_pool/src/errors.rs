use std::any::Any;
use std::error::Error;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// The error type a fallible task may return, anything convertible into it is accepted.
pub type BoxError = Box<dyn Error + Send + Sync + 'static>;

/// A task error shared by every handle observing the same task.
pub type SharedError = Arc<dyn Error + Send + Sync + 'static>;

pub type PoolResult<T> = Result<T, PoolError>;

/// The reasons why awaiting a task did not produce a value.
#[derive(Debug, Clone, Error)]
pub enum TaskError {
    /// The task was cancelled before it produced a result.
    #[error("task was cancelled")]
    Cancelled,

    /// The task did not produce a result within its time budget.
    #[error("task timed out after {0:?}")]
    TimedOut(Duration),

    /// The task returned an error or panicked. The original error is kept untouched, use
    /// [`TaskError::downcast_ref`] to get it back.
    #[error(transparent)]
    Failed(SharedError),
}

impl TaskError {
    pub(crate) fn failed<E: Into<BoxError>>(err: E) -> Self {
        TaskError::Failed(Arc::from(err.into()))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, TaskError::Cancelled)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, TaskError::TimedOut(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, TaskError::Failed(_))
    }

    /// Returns the original error of a failed task if it is of type `E`.
    pub fn downcast_ref<E: Error + 'static>(&self) -> Option<&E> {
        match self {
            TaskError::Failed(err) => err.as_ref().downcast_ref::<E>(),
            _ => None,
        }
    }
}

/// The error recorded for a task whose callable panicked.
#[derive(Debug, Clone, Error)]
#[error("task panicked: {message}")]
pub struct TaskPanic {
    pub message: String,
}

impl TaskPanic {
    pub(crate) fn from_payload(payload: Box<dyn Any + Send>) -> Self {
        let message = match payload.downcast::<String>() {
            Ok(message) => *message,
            Err(payload) => match payload.downcast_ref::<&'static str>() {
                Some(message) => message.to_string(),
                None => "unknown panic payload".to_string(),
            },
        };
        Self { message }
    }
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("The worker pool has already started running tasks, it can no longer be configured")]
    AlreadyStarted,

    #[error("A worker pool needs at least one thread")]
    NoWorkers,

    #[error("The worker pool has been shut down")]
    ShutDown,

    #[error("Failed to spawn a pool thread: {0}")]
    Spawn(#[source] io::Error),

    #[error("Failed to build the task driver: {0}")]
    Runtime(#[source] io::Error),
}
