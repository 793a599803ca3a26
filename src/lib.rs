//! A Tokio-based task manager with bounded admission, configurable error
//! policies and fail-fast shutdown on top of a fixed-capacity worker pool.
//!
//! Work is recorded with [`TaskManager::submit`] and [`TaskManager::map`] and
//! admitted by [`TaskManager::run`], [`TaskManager::join`] or
//! [`TaskManager::as_completed`]. No more than the pool's `max_workers` tasks
//! are ever in flight; when the window is full, one completion is drained
//! before the next task is dispatched.

mod error;
mod handle;
mod manager;
mod monitor;
mod policy;
mod pool;
mod source;
mod task;
mod task_queue;

pub use error::{BoxError, ConfigError, ManagerError, PoolError, TaskFailure};
pub use handle::DispatchHandle;
pub use manager::{RunState, TaskManager};
pub use policy::ErrorPolicy;
pub use pool::{PoolConfig, TaskPool, WorkerPool, DEFAULT_MONITOR_INTERVAL};
pub use task::{Task, TaskFn, TaskHandle, TaskToExecute};
