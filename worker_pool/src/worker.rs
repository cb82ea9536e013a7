use crate::errors::{BoxError, PoolError, PoolResult};
use crate::task::{SpawnOptions, TaskHandle};
use crate::task_pool::{PoolConfig, WorkerPool};
use std::sync::{Mutex, OnceLock};
use sync_tools::LockExt;
use tracing::debug;

static GLOBAL: OnceLock<Worker> = OnceLock::new();

struct PoolSlot {
    config: PoolConfig,
    pool: Option<WorkerPool>,
}

/// The entry point to run callables in the background.
///
/// A `Worker` owns a lazily created `WorkerPool`. Spawning never fails: when the pool cannot take
/// the task, the returned handle is already failed with the `PoolError`.
///
/// ```rust
/// use worker_pool::{Executor, Worker};
///
/// let worker = Worker::new();
/// let handle = worker.spawn(|| (1..=10u32).sum::<u32>());
/// let executor = Executor::new().unwrap();
/// assert_eq!(executor.run_until_complete(&handle).unwrap(), 55);
/// worker.shutdown(true);
/// ```
pub struct Worker {
    slot: Mutex<PoolSlot>,
}

impl Default for Worker {
    fn default() -> Self {
        Self::new()
    }
}

impl Worker {
    pub fn new() -> Self {
        Self::with_config(PoolConfig::default())
    }

    pub fn with_config(config: PoolConfig) -> Self {
        Self {
            slot: Mutex::new(PoolSlot { config, pool: None }),
        }
    }

    /// Returns the process-wide worker, created on first use.
    pub fn global() -> &'static Worker {
        GLOBAL.get_or_init(Worker::new)
    }

    /// Returns the pool of this worker, creating it if there is none or if it was shut down.
    pub fn get_pool(&self) -> PoolResult<WorkerPool> {
        let mut slot = self.slot.locked();
        if let Some(pool) = slot.pool.as_ref().filter(|pool| !pool.is_shut_down()) {
            return Ok(pool.clone());
        }
        let pool = WorkerPool::with_config(slot.config.clone())?;
        slot.pool = Some(pool.clone());
        Ok(pool)
    }

    /// Sets the number of pool threads. Fails with `PoolError::AlreadyStarted` once the pool has
    /// started running tasks.
    pub fn configure_pool(&self, max_workers: usize) -> PoolResult<()> {
        let mut slot = self.slot.locked();
        match &slot.pool {
            Some(pool) if !pool.is_shut_down() => pool.configure(max_workers)?,
            _ if max_workers == 0 => return Err(PoolError::NoWorkers),
            _ => {}
        }
        slot.config.max_workers = max_workers;
        Ok(())
    }

    pub fn spawn<T, F>(&self, f: F) -> TaskHandle<T>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.spawn_with(f, SpawnOptions::new())
    }

    pub fn spawn_with<T, F>(&self, f: F, options: SpawnOptions) -> TaskHandle<T>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.get_pool()
            .and_then(|pool| pool.submit(f, options))
            .unwrap_or_else(TaskHandle::rejected)
    }

    pub fn try_spawn<T, E, F>(&self, f: F) -> TaskHandle<T>
    where
        T: Send + Sync + 'static,
        E: Into<BoxError> + 'static,
        F: FnOnce() -> Result<T, E> + Send + 'static,
    {
        self.try_spawn_with(f, SpawnOptions::new())
    }

    pub fn try_spawn_with<T, E, F>(&self, f: F, options: SpawnOptions) -> TaskHandle<T>
    where
        T: Send + Sync + 'static,
        E: Into<BoxError> + 'static,
        F: FnOnce() -> Result<T, E> + Send + 'static,
    {
        self.get_pool()
            .and_then(|pool| pool.try_submit(f, options))
            .unwrap_or_else(TaskHandle::rejected)
    }

    /// Spawns one task per callable and returns a handle on their results, in the callables'
    /// order. The handle fails as soon as one task fails; the other tasks are not cancelled.
    pub fn spawn_all<T, F, I>(&self, callables: I) -> TaskHandle<Vec<T>>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> T + Send + 'static,
        I: IntoIterator<Item = F>,
    {
        self.get_pool()
            .and_then(|pool| pool.submit_all(callables, SpawnOptions::new()))
            .unwrap_or_else(TaskHandle::rejected)
    }

    pub fn try_spawn_all<T, E, F, I>(&self, callables: I) -> TaskHandle<Vec<T>>
    where
        T: Clone + Send + Sync + 'static,
        E: Into<BoxError> + 'static,
        F: FnOnce() -> Result<T, E> + Send + 'static,
        I: IntoIterator<Item = F>,
    {
        self.get_pool()
            .and_then(|pool| pool.try_submit_all(callables, SpawnOptions::new()))
            .unwrap_or_else(TaskHandle::rejected)
    }

    /// Shuts the current pool down, see `WorkerPool::shutdown`, and forgets it. The next spawn
    /// creates a fresh pool.
    pub fn shutdown(&self, wait: bool) {
        let pool = self.slot.locked().pool.take();
        if let Some(pool) = pool {
            pool.shutdown(wait);
        }
    }

    /// Drops the current pool without waiting for its threads.
    pub fn reset(&self) {
        debug!("resetting worker");
        self.shutdown(false);
    }
}
