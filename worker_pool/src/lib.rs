//! # Worker Pool
//! Run blocking callables on a bounded set of OS threads and get their results back through
//! handles that can be cancelled, time-limited, awaited or blocked on.
//!
//! ## Overview
//! - **`Worker`**: the spawn entry point, owning a lazily started `WorkerPool`.
//! - **`TaskHandle`**: the eventual result of a task. The first of completion, cancellation and
//!   timeout wins, later ones are ignored.
//! - **`Executor`**: blocks a synchronous caller until a task is over.
//!
//! Cancellation is best-effort: a callable already running is never interrupted, its result is
//! discarded.

/// Error types for tasks and pools.
pub mod errors;
/// Task handles and their state cell.
pub mod task;
/// The thread pool.
pub mod task_pool;
/// The spawn entry point.
pub mod worker;
/// Synchronous waiting on tasks.
pub mod executor;

pub use errors::{BoxError, PoolError, PoolResult, TaskError, TaskPanic};
pub use executor::Executor;
pub use task::{SpawnOptions, TaskHandle, TaskId, TaskStatus};
pub use task_pool::{default_max_workers, PoolConfig, PoolMetrics, WorkerPool, WorkerStats};
pub use worker::Worker;
