use crate::error::{BoxError, TaskFailure};

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

lazy_static::lazy_static! {
  static ref NEXT_TASK_ID_COUNTER: AtomicU64 = AtomicU64::new(0);
}

/// The type of future that the pool executes.
/// It must be `Send` and `'static`, and produce a result of type `R`.
pub type TaskToExecute<R> = Pin<Box<dyn Future<Output = R> + Send + 'static>>;

/// A type-erased callable: takes the task's arguments and builds the work to run.
pub type TaskFn<A, R> = Arc<dyn Fn(A) -> TaskToExecute<Result<R, BoxError>> + Send + Sync + 'static>;

pub(crate) fn erase<A, R, F, Fut, E>(callable: F) -> TaskFn<A, R>
where
  A: 'static,
  R: 'static,
  F: Fn(A) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<R, E>> + Send + 'static,
  E: Into<BoxError> + 'static,
{
  Arc::new(move |args: A| -> TaskToExecute<Result<R, BoxError>> {
    let work = callable(args);
    Box::pin(async move { work.await.map_err(Into::into) })
  })
}

/// Identifies one submitted task. Equality and hashing are by identity, so two
/// submissions with equal arguments get distinct handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskHandle {
  pub(crate) id: u64,
}

impl TaskHandle {
  pub(crate) fn next() -> Self {
    Self {
      id: NEXT_TASK_ID_COUNTER.fetch_add(1, AtomicOrdering::Relaxed),
    }
  }

  pub fn id(&self) -> u64 {
    self.id
  }
}

/// One unit of submitted work and, once it has run, its outcome.
///
/// The record the manager dispatches and the record it hands back after
/// completion are distinct values; the latter is built by [`Task::into_completed`]
/// on the worker side and carries the same handle, callable and arguments.
pub struct Task<A, R> {
  handle: TaskHandle,
  callable: TaskFn<A, R>,
  args: A,
  result: Option<Result<R, TaskFailure>>,
}

impl<A, R> Task<A, R> {
  pub(crate) fn new(callable: TaskFn<A, R>, args: A) -> Self {
    Self {
      handle: TaskHandle::next(),
      callable,
      args,
      result: None,
    }
  }

  pub fn handle(&self) -> TaskHandle {
    self.handle
  }

  pub fn id(&self) -> u64 {
    self.handle.id
  }

  pub fn args(&self) -> &A {
    &self.args
  }

  /// `true` once the completion handler has attached an outcome.
  pub fn is_complete(&self) -> bool {
    self.result.is_some()
  }

  /// The outcome, or `None` while the task has not completed.
  pub fn result(&self) -> Option<&Result<R, TaskFailure>> {
    self.result.as_ref()
  }

  pub fn value(&self) -> Option<&R> {
    self.result.as_ref().and_then(|r| r.as_ref().ok())
  }

  pub fn failure(&self) -> Option<&TaskFailure> {
    self.result.as_ref().and_then(|r| r.as_ref().err())
  }

  pub(crate) fn callable(&self) -> &TaskFn<A, R> {
    &self.callable
  }

  /// Builds the completion copy of this record holding `outcome`.
  pub(crate) fn into_completed(self, outcome: Result<R, TaskFailure>) -> Self {
    Self {
      result: Some(outcome),
      ..self
    }
  }
}

impl<A: fmt::Debug, R: fmt::Debug> fmt::Debug for Task<A, R> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Task")
      .field("id", &self.handle.id)
      .field("args", &self.args)
      .field("result", &self.result)
      .finish_non_exhaustive()
  }
}
