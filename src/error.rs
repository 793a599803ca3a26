use std::error::Error as StdError;
use std::sync::Arc;

use thiserror::Error;

/// A boxed error returned by a task's callable.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Errors that can occur within the worker pool.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PoolError {
  #[error("Task result channel error (task was dropped before it ran): {0}")]
  ResultChannelError(String),

  #[error("Pool's internal task queue (sender side) was closed unexpectedly")]
  QueueSendChannelClosed,

  #[error("Submitted task future panicked: {0}")]
  TaskPanicked(String),

  #[error("Pool is shutting down or already shut down, cannot accept new tasks")]
  PoolShuttingDown,

  #[error("Pool worker loop failed to join: {0}")]
  WorkerJoinFailed(String),
}

/// Invalid configuration, reported when a pool or manager is constructed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
  #[error("Unknown error policy '{0}', expected one of: raise, log, ignore")]
  UnknownErrorPolicy(String),

  #[error("Pool capacity (max_workers) must be at least 1")]
  ZeroCapacity,

  #[error("Pool capacity (max_workers) of {0} exceeds the supported maximum")]
  CapacityTooLarge(usize),
}

/// The failure captured as a task's result.
#[derive(Error, Debug, Clone)]
pub enum TaskFailure {
  /// The callable ran and returned an error.
  #[error("{0}")]
  Error(Arc<dyn StdError + Send + Sync + 'static>),

  /// The callable panicked, either while building its work or while running.
  #[error("task panicked: {0}")]
  Panicked(String),

  /// The pool refused or lost the work before it could produce an outcome.
  #[error("task was not executed: {0}")]
  Rejected(PoolError),
}

impl TaskFailure {
  /// Returns the callable's error as `E` if it is one.
  pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
    match self {
      TaskFailure::Error(err) => err.downcast_ref::<E>(),
      _ => None,
    }
  }

  pub fn is_panic(&self) -> bool {
    matches!(self, TaskFailure::Panicked(_))
  }
}

impl From<BoxError> for TaskFailure {
  fn from(err: BoxError) -> Self {
    TaskFailure::Error(Arc::from(err))
  }
}

impl From<PoolError> for TaskFailure {
  fn from(err: PoolError) -> Self {
    match err {
      PoolError::TaskPanicked(message) => TaskFailure::Panicked(message),
      other => TaskFailure::Rejected(other),
    }
  }
}

/// Errors surfaced by the task manager's `run`, `join` and `as_completed`.
#[derive(Error, Debug, Clone)]
pub enum ManagerError {
  /// A task failed while the error policy was `Raise`. The pool has already been
  /// joined when this is returned.
  #[error("Task {task_id} failed: {failure}")]
  TaskFailed { task_id: u64, failure: TaskFailure },

  #[error(transparent)]
  Pool(#[from] PoolError),

  #[error("Completion channel closed while {0} task(s) were still in flight")]
  CompletionChannelClosed(usize),
}

impl ManagerError {
  /// The task failure behind this error, if it is one.
  pub fn task_failure(&self) -> Option<&TaskFailure> {
    match self {
      ManagerError::TaskFailed { failure, .. } => Some(failure),
      _ => None,
    }
  }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
  if let Some(message) = payload.downcast_ref::<&'static str>() {
    (*message).to_string()
  } else if let Some(message) = payload.downcast_ref::<String>() {
    message.clone()
  } else {
    "non-string panic payload".to_string()
  }
}
