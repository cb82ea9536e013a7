use crate::errors::{PoolError, PoolResult, TaskError};
use crate::task::TaskHandle;
use std::future::Future;
use std::time::Duration;
use tokio::runtime::{self, Runtime};
use tokio::time;
use tracing::debug;

/// Blocks synchronous callers on the completion of tasks.
///
/// Every executor drives its own single-threaded runtime, so independent executors on different
/// threads can wait on the same handle at once. An executor must not be used, nor dropped, from
/// inside an async context.
pub struct Executor {
    runtime: Runtime,
}

impl Executor {
    pub fn new() -> PoolResult<Self> {
        let runtime = runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .map_err(PoolError::Runtime)?;
        Ok(Self { runtime })
    }

    /// Blocks until the task is over and returns its value, or why there is none.
    pub fn run_until_complete<T: Clone>(&self, handle: &TaskHandle<T>) -> Result<T, TaskError> {
        self.runtime.block_on(handle.wait())
    }

    /// Like `run_until_complete`, but gives up after `timeout`. The task is then cancelled and
    /// `TaskError::TimedOut` is returned, unless it ended in the meantime.
    pub fn run_until_complete_timeout<T: Clone>(
        &self,
        handle: &TaskHandle<T>,
        timeout: Duration,
    ) -> Result<T, TaskError> {
        self.runtime.block_on(async {
            match time::timeout(timeout, handle.wait()).await {
                Ok(outcome) => outcome,
                Err(_) if handle.cancel() => {
                    debug!(task = handle.id(), ?timeout, "gave up waiting on task");
                    Err(TaskError::TimedOut(timeout))
                }
                Err(_) => handle
                    .try_result()
                    .unwrap_or(Err(TaskError::TimedOut(timeout))),
            }
        })
    }

    /// Drives any future to completion on the calling thread.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }
}
