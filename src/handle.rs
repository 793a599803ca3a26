use crate::error::PoolError;

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing;

type CompletionCallback<T> = Box<dyn FnOnce(Result<T, PoolError>) + Send + 'static>;

/// Meeting point of a task's outcome and its completion callback. Whichever
/// side arrives second runs the callback.
struct CompletionSlot<T> {
  outcome: Option<Result<T, PoolError>>,
  callback: Option<CompletionCallback<T>>,
}

/// Creates the worker-side completer and the caller-side handle of one dispatch.
pub(crate) fn completion_pair<T: Send + 'static>(task_id: u64) -> (Completer<T>, DispatchHandle<T>) {
  let slot = Arc::new(Mutex::new(CompletionSlot {
    outcome: None,
    callback: None,
  }));
  (
    Completer {
      task_id,
      slot: slot.clone(),
      fulfilled: false,
    },
    DispatchHandle { task_id, slot },
  )
}

/// Worker-side half: delivers the outcome exactly once. If it is dropped
/// unfulfilled (the work never ran) it delivers `PoolError::ResultChannelError`.
pub(crate) struct Completer<T: Send + 'static> {
  task_id: u64,
  slot: Arc<Mutex<CompletionSlot<T>>>,
  fulfilled: bool,
}

impl<T: Send + 'static> Completer<T> {
  pub(crate) fn complete(mut self, outcome: Result<T, PoolError>) {
    self.fulfil(outcome);
  }

  fn fulfil(&mut self, outcome: Result<T, PoolError>) {
    self.fulfilled = true;
    let callback = {
      let mut slot = self.slot.lock();
      match slot.callback.take() {
        Some(callback) => callback,
        None => {
          slot.outcome = Some(outcome);
          return;
        }
      }
    };
    callback(outcome);
  }
}

impl<T: Send + 'static> Drop for Completer<T> {
  fn drop(&mut self) {
    if !self.fulfilled {
      tracing::warn!(task_id = %self.task_id, "Task dropped before it ran; delivering channel error.");
      let task_id = self.task_id;
      self.fulfil(Err(PoolError::ResultChannelError(format!(
        "task (id: {}) was dropped by the pool before producing an outcome",
        task_id
      ))));
    }
  }
}

/// A handle to work dispatched to a `WorkerPool`.
///
/// The outcome is consumed exactly once, either by a completion callback or by
/// awaiting it.
pub struct DispatchHandle<T: Send + 'static> {
  task_id: u64,
  slot: Arc<Mutex<CompletionSlot<T>>>,
}

impl<T: Send + 'static> fmt::Debug for DispatchHandle<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("DispatchHandle")
      .field("task_id", &self.task_id)
      .field("is_finished", &self.is_finished())
      .finish()
  }
}

impl<T: Send + 'static> DispatchHandle<T> {
  /// Returns the pool-assigned ID of this dispatch.
  pub fn id(&self) -> u64 {
    self.task_id
  }

  /// `true` once the outcome is available.
  pub fn is_finished(&self) -> bool {
    self.slot.lock().outcome.is_some()
  }

  /// Registers `callback` to receive the outcome.
  ///
  /// The callback runs exactly once: on the worker that finishes the task, or
  /// immediately on the calling thread if the outcome is already available.
  pub fn on_complete<F>(self, callback: F)
  where
    F: FnOnce(Result<T, PoolError>) + Send + 'static,
  {
    let ready = {
      let mut slot = self.slot.lock();
      match slot.outcome.take() {
        Some(outcome) => outcome,
        None => {
          slot.callback = Some(Box::new(callback));
          return;
        }
      }
    };
    callback(ready);
  }

  /// Awaits the completion of the task and returns its outcome.
  ///
  /// # Errors
  /// Returns `PoolError::TaskPanicked` if the task panicked during execution.
  /// Returns `PoolError::ResultChannelError` if the pool dropped the task before running it.
  pub async fn await_result(self) -> Result<T, PoolError> {
    let task_id = self.task_id;
    let (tx, rx) = oneshot::channel();
    self.on_complete(move |outcome| {
      let _ = tx.send(outcome);
    });
    match rx.await {
      Ok(outcome) => outcome,
      Err(recv_error) => {
        tracing::warn!(task_id = %task_id, "Result channel receive error: {}", recv_error);
        Err(PoolError::ResultChannelError(format!(
          "Task (id: {}) result channel unexpectedly closed: {}",
          task_id, recv_error
        )))
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};

  #[test]
  fn test_callback_attached_before_completion_runs_on_complete() {
    let (completer, handle) = completion_pair::<u32>(1);
    let seen = Arc::new(Mutex::new(None));
    let sink = seen.clone();
    handle.on_complete(move |outcome| *sink.lock() = Some(outcome));
    assert!(seen.lock().is_none());

    completer.complete(Ok(5));
    assert_eq!(*seen.lock(), Some(Ok(5)));
  }

  #[test]
  fn test_callback_attached_after_completion_runs_immediately() {
    let (completer, handle) = completion_pair::<u32>(2);
    completer.complete(Ok(8));
    assert!(handle.is_finished());

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    handle.on_complete(move |outcome| {
      assert_eq!(outcome, Ok(8));
      counter.fetch_add(1, Ordering::SeqCst);
    });
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn test_dropped_completer_delivers_channel_error_once() {
    let (completer, handle) = completion_pair::<u32>(3);
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    handle.on_complete(move |outcome| {
      assert!(matches!(outcome, Err(PoolError::ResultChannelError(_))));
      counter.fetch_add(1, Ordering::SeqCst);
    });
    drop(completer);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_await_result_receives_outcome() {
    let (completer, handle) = completion_pair::<String>(4);
    tokio::spawn(async move { completer.complete(Ok("done".to_string())) });
    assert_eq!(handle.await_result().await, Ok("done".to_string()));
  }
}
