use crate::errors::{BoxError, PoolError, PoolResult, TaskError};
use crate::task::{Completion, SpawnOptions, TaskCell, TaskControl, TaskHandle, TaskId, TaskStatus};
use std::collections::{HashMap, VecDeque};
use std::convert::Infallible;
use std::fmt;
use std::mem;
use std::num::NonZeroUsize;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use sync_tools::{CondvarExt, LockExt};
use tokio::runtime::{self, Handle, Runtime};
use tokio::task::{AbortHandle, JoinSet};
use tokio::time;
use tracing::{debug, trace};

const DEFAULT_THREAD_NAME: &str = "worker-pool";

/// Returns the number of threads a pool starts when nothing else is configured: the detected
/// hardware parallelism, and never less than 4.
pub fn default_max_workers() -> usize {
    thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(4)
        .max(4)
}

#[derive(Clone, Debug)]
pub struct PoolConfig {
    pub max_workers: usize,
    /// Pool threads are named `{thread_name}-{index}`.
    pub thread_name: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            thread_name: DEFAULT_THREAD_NAME.to_string(),
        }
    }
}

impl PoolConfig {
    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    pub fn with_thread_name(mut self, thread_name: impl Into<String>) -> Self {
        self.thread_name = thread_name.into();
        self
    }
}

/// The counters of one pool thread.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub name: String,
    pub tasks_executed: u64,
    /// Time spent running callables.
    pub busy_time: Duration,
    /// Time spent waiting for a task.
    pub idle_time: Duration,
}

/// A snapshot of the pool counters.
///
/// A task is counted as completed, failed, cancelled or timed out once the pool is done with it:
/// when its callable returns, or when it is dequeued already over and skipped.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PoolMetrics {
    pub tasks_submitted: u64,
    /// Submissions refused because the pool was shut down or could not start its threads.
    pub tasks_rejected: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub tasks_cancelled: u64,
    pub tasks_timed_out: u64,
    pub queued: usize,
    pub running: usize,
    pub workers: Vec<WorkerStats>,
}

impl PoolMetrics {
    fn record_settled(&mut self, status: TaskStatus) {
        match status {
            TaskStatus::Completed => self.tasks_completed += 1,
            TaskStatus::Failed => self.tasks_failed += 1,
            TaskStatus::Cancelled => self.tasks_cancelled += 1,
            TaskStatus::TimedOut => self.tasks_timed_out += 1,
            TaskStatus::Pending | TaskStatus::Running => {}
        }
    }
}

/// A queued unit of work: the type-erased control of its task, the closure to run and the timer
/// armed for its timeout, if any.
struct Job {
    control: Arc<dyn TaskControl>,
    run: Box<dyn FnOnce() -> Completion + Send>,
    timer: Option<AbortHandle>,
}

struct PoolState {
    config: PoolConfig,
    queue: VecDeque<Job>,
    /// Every task submitted and not yet picked up or finished by a pool thread.
    live: HashMap<TaskId, Arc<dyn TaskControl>>,
    threads: Vec<JoinHandle<()>>,
    /// Counters only, `queued` and `running` are computed on snapshots.
    metrics: PoolMetrics,
    started: bool,
    accepting: bool,
}

impl PoolState {
    fn running(&self) -> usize {
        self.live
            .values()
            .filter(|control| control.status() == TaskStatus::Running)
            .count()
    }

    fn worker_stats(&mut self, index: usize) -> Option<&mut WorkerStats> {
        self.metrics.workers.get_mut(index)
    }
}

/// The part of the pool its threads hold on to.
struct Shared {
    state: Mutex<PoolState>,
    work_ready: Condvar,
    /// Drives the timeout timers and the `submit_all` aggregation, pool threads only run callables.
    driver: Option<Runtime>,
    handle: Handle,
}

impl Shared {
    fn new(config: PoolConfig) -> PoolResult<Self> {
        if config.max_workers == 0 {
            return Err(PoolError::NoWorkers);
        }
        let driver = runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name(format!("{}-driver", config.thread_name))
            .enable_time()
            .build()
            .map_err(PoolError::Runtime)?;
        let handle = driver.handle().clone();
        Ok(Self {
            state: Mutex::new(PoolState {
                config,
                queue: VecDeque::new(),
                live: HashMap::new(),
                threads: Vec::new(),
                metrics: PoolMetrics::default(),
                started: false,
                accepting: true,
            }),
            work_ready: Condvar::new(),
            driver: Some(driver),
            handle,
        })
    }

    /// Starts the pool threads on the first submission.
    fn start(self: &Arc<Self>, state: &mut PoolState) -> PoolResult<()> {
        if state.started {
            return Ok(());
        }
        for index in 0..state.config.max_workers {
            let shared = Arc::clone(self);
            let name = format!("{}-{index}", state.config.thread_name);
            let spawned = thread::Builder::new()
                .name(name.clone())
                .spawn(move || shared.work(index));
            match spawned {
                Ok(thread) => {
                    state.threads.push(thread);
                    state.metrics.workers.push(WorkerStats {
                        name,
                        ..WorkerStats::default()
                    });
                }
                Err(err) => {
                    // Keep going with the threads that did start, if any.
                    state.started = !state.threads.is_empty();
                    return Err(PoolError::Spawn(err));
                }
            }
        }
        state.started = true;
        debug!(
            threads = state.threads.len(),
            name = %state.config.thread_name,
            "worker pool started"
        );
        Ok(())
    }

    fn work(&self, index: usize) {
        trace!(thread = ?thread::current().name(), "pool thread started");
        while let Some(job) = self.next_job(index) {
            self.run(index, job);
        }
        trace!(thread = ?thread::current().name(), "pool thread stopped");
    }

    /// Blocks until a job can run. Returns `None` once the pool is stopped and its queue drained.
    fn next_job(&self, index: usize) -> Option<Job> {
        let mut state = self.state.locked();
        let idle_since = Instant::now();
        loop {
            while let Some(job) = state.queue.pop_front() {
                if job.control.begin() {
                    if let Some(stats) = state.worker_stats(index) {
                        stats.idle_time += idle_since.elapsed();
                    }
                    return Some(job);
                }
                // Cancelled or timed out while queued, the callable never runs.
                let id = job.control.id();
                let status = job.control.status();
                trace!(task = id, ?status, "skipping finished task");
                state.live.remove(&id);
                state.metrics.record_settled(status);
                if let Some(timer) = job.timer {
                    timer.abort();
                }
            }
            if !state.accepting {
                if let Some(stats) = state.worker_stats(index) {
                    stats.idle_time += idle_since.elapsed();
                }
                return None;
            }
            state = self.work_ready.wait_on(state);
        }
    }

    fn run(&self, index: usize, job: Job) {
        let Job {
            control,
            run,
            timer,
        } = job;
        let started = Instant::now();
        let completion = run();
        let busy = started.elapsed();
        if let Some(timer) = timer {
            timer.abort();
        }

        // The outcome becomes visible with the pool lock held, so a waiter woken by it never
        // observes the task as still live or the counters as stale.
        let mut state = self.state.locked();
        state.live.remove(&control.id());
        completion.publish();
        state.metrics.record_settled(control.status());
        if let Some(stats) = state.worker_stats(index) {
            stats.tasks_executed += 1;
            stats.busy_time += busy;
        }
    }

    fn arm_timer<T: Send + Sync + 'static>(
        &self,
        cell: Arc<TaskCell<T>>,
        budget: Duration,
    ) -> AbortHandle {
        self.handle
            .spawn(async move {
                time::sleep(budget).await;
                cell.time_out(budget);
            })
            .abort_handle()
    }

    fn stop(&self) {
        let was_accepting = mem::replace(&mut self.state.locked().accepting, false);
        if was_accepting {
            debug!("worker pool shutting down");
        }
        self.work_ready.notify_all();
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.take() {
            // Never blocks, so the last pool thread or an async context can drop it.
            driver.shutdown_background();
        }
    }
}

struct PoolInner {
    shared: Arc<Shared>,
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        self.shared.stop();
    }
}

/// A fixed-size pool of OS threads running submitted callables in submission order.
///
/// Threads are started lazily by the first submission. The pool is cheap to clone, clones share
/// the same threads; dropping the last clone stops the pool without waiting for it.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    /// Creates a pool with the default configuration.
    pub fn new() -> PoolResult<Self> {
        Self::with_config(PoolConfig::default())
    }

    pub fn with_config(config: PoolConfig) -> PoolResult<Self> {
        Ok(Self {
            inner: Arc::new(PoolInner {
                shared: Arc::new(Shared::new(config)?),
            }),
        })
    }

    fn shared(&self) -> &Arc<Shared> {
        &self.inner.shared
    }

    /// Changes the number of threads. Fails once the pool has started running tasks.
    pub fn configure(&self, max_workers: usize) -> PoolResult<()> {
        if max_workers == 0 {
            return Err(PoolError::NoWorkers);
        }
        let mut state = self.shared().state.locked();
        if state.started {
            return Err(PoolError::AlreadyStarted);
        }
        state.config.max_workers = max_workers;
        Ok(())
    }

    pub fn max_workers(&self) -> usize {
        self.shared().state.locked().config.max_workers
    }

    pub fn submit<T, F>(&self, f: F, options: SpawnOptions) -> PoolResult<TaskHandle<T>>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.try_submit(move || Ok::<T, Infallible>(f()), options)
    }

    /// Submits a fallible callable, an `Err` it returns fails the task with that error.
    pub fn try_submit<T, E, F>(&self, f: F, options: SpawnOptions) -> PoolResult<TaskHandle<T>>
    where
        T: Send + Sync + 'static,
        E: Into<BoxError> + 'static,
        F: FnOnce() -> Result<T, E> + Send + 'static,
    {
        let cell = TaskCell::new(options.name);
        let run = cell.runner(f);
        let shared = self.shared();

        let mut state = shared.state.locked();
        if !state.accepting {
            state.metrics.tasks_rejected += 1;
            return Err(PoolError::ShutDown);
        }
        if let Err(err) = shared.start(&mut state) {
            state.metrics.tasks_rejected += 1;
            return Err(err);
        }
        state.metrics.tasks_submitted += 1;
        let timer = options
            .timeout
            .map(|budget| shared.arm_timer(Arc::clone(&cell), budget));
        let control: Arc<dyn TaskControl> = cell.clone();
        let id = control.id();
        state.live.insert(id, Arc::clone(&control));
        state.queue.push_back(Job {
            control,
            run,
            timer,
        });
        drop(state);

        shared.work_ready.notify_one();
        trace!(task = id, "task queued");
        Ok(TaskHandle::new(cell))
    }

    /// Submits every callable in order, and returns a handle on their ordered results.
    ///
    /// The aggregate fails as soon as one of the tasks does, with the same error. The other tasks
    /// are left running and their results are dropped.
    pub fn submit_all<T, F, I>(
        &self,
        callables: I,
        options: SpawnOptions,
    ) -> PoolResult<TaskHandle<Vec<T>>>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> T + Send + 'static,
        I: IntoIterator<Item = F>,
    {
        self.try_submit_all(
            callables
                .into_iter()
                .map(|f| move || Ok::<T, Infallible>(f())),
            options,
        )
    }

    pub fn try_submit_all<T, E, F, I>(
        &self,
        callables: I,
        options: SpawnOptions,
    ) -> PoolResult<TaskHandle<Vec<T>>>
    where
        T: Clone + Send + Sync + 'static,
        E: Into<BoxError> + 'static,
        F: FnOnce() -> Result<T, E> + Send + 'static,
        I: IntoIterator<Item = F>,
    {
        let handles = callables
            .into_iter()
            .map(|f| self.try_submit(f, SpawnOptions::new()))
            .collect::<PoolResult<Vec<_>>>()?;

        let cell = TaskCell::new(options.name);
        cell.begin();
        let shared = self.shared();
        let timer = options
            .timeout
            .map(|budget| shared.arm_timer(Arc::clone(&cell), budget));
        let aggregate = Arc::clone(&cell);
        shared.handle.spawn(async move {
            aggregate.finish(join_in_order(handles).await);
            if let Some(timer) = timer {
                timer.abort();
            }
        });
        Ok(TaskHandle::new(cell))
    }

    /// Returns the number of tasks in the `Running` state. The callable of a task that timed out
    /// or was cancelled keeps its thread busy until it returns, but is no longer counted.
    pub fn get_active_count(&self) -> usize {
        self.shared().state.locked().running()
    }

    /// Returns a snapshot of the pool counters.
    pub fn metrics(&self) -> PoolMetrics {
        let state = self.shared().state.locked();
        PoolMetrics {
            queued: state.queue.len(),
            running: state.running(),
            ..state.metrics.clone()
        }
    }

    /// Returns the number of tasks waiting for a free thread.
    pub fn queued_count(&self) -> usize {
        self.shared().state.locked().queue.len()
    }

    /// Cancels every task of the pool that is not over yet, queued or running. Returns how many
    /// tasks got cancelled.
    pub fn cancel_all(&self) -> usize {
        let live: Vec<_> = self.shared().state.locked().live.values().cloned().collect();
        let cancelled = live.iter().filter(|control| control.cancel()).count();
        debug!(cancelled, "cancelled pool tasks");
        cancelled
    }

    /// Stops accepting tasks. Already queued tasks still run. With `wait`, blocks until every pool
    /// thread has exited; a pool thread calling this does not wait for itself.
    pub fn shutdown(&self, wait: bool) {
        let shared = self.shared();
        shared.stop();
        if !wait {
            return;
        }
        let threads = mem::take(&mut shared.state.locked().threads);
        let current = thread::current().id();
        for thread in threads {
            if thread.thread().id() == current {
                continue;
            }
            if thread.join().is_err() {
                debug!("a pool thread panicked");
            }
        }
    }

    pub fn is_shut_down(&self) -> bool {
        !self.shared().state.locked().accepting
    }
}

impl PartialEq for WorkerPool {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for WorkerPool {}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared().state.locked();
        f.debug_struct("WorkerPool")
            .field("max_workers", &state.config.max_workers)
            .field("started", &state.started)
            .field("running", &state.running())
            .field("queued", &state.queue.len())
            .field("accepting", &state.accepting)
            .finish()
    }
}

/// Collects the outcomes of `handles` in their order, or the first error observed.
async fn join_in_order<T>(handles: Vec<TaskHandle<T>>) -> Result<Vec<T>, TaskError>
where
    T: Clone + Send + Sync + 'static,
{
    let mut slots: Vec<Option<T>> = handles.iter().map(|_| None).collect();
    let mut waiters = JoinSet::new();
    for (index, handle) in handles.into_iter().enumerate() {
        waiters.spawn(async move { (index, handle.await) });
    }
    while let Some(joined) = waiters.join_next().await {
        match joined {
            Ok((index, Ok(value))) => slots[index] = Some(value),
            // Dropping the set only stops the waiters, not the tasks.
            Ok((_, Err(err))) => return Err(err),
            Err(err) => return Err(TaskError::failed(err.to_string())),
        }
    }
    Ok(slots.into_iter().flatten().collect())
}
