use crate::error::PoolError;
use crate::handle::Completer;
use crate::task::TaskToExecute;

use fibre::mpsc::{self, AsyncReceiver, AsyncSender, RecvError};
use std::fmt;
use tokio_util::sync::CancellationToken;

/// A unit of dispatched work travelling from `WorkerPool::dispatch` to the worker loop.
pub(crate) struct Job<T: Send + 'static> {
  pub(crate) task_id: u64,
  pub(crate) future: TaskToExecute<T>,
  pub(crate) completer: Completer<T>,
}

impl<T: Send + 'static> fmt::Debug for Job<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Job")
      .field("task_id", &self.task_id)
      .finish_non_exhaustive()
  }
}

/// An unbounded, multi-producer, single-consumer queue of jobs.
///
/// Capacity is enforced upstream: the pool's semaphore bounds how many jobs
/// run, and the task manager bounds how many are dispatched.
#[derive(Debug)]
pub(crate) struct TaskQueue<T: Send + 'static> {
  tx: AsyncSender<Job<T>>,
  rx: AsyncReceiver<Job<T>>,
}

impl<T: Send + 'static> TaskQueue<T> {
  pub(crate) fn new() -> Self {
    let (tx, rx) = mpsc::unbounded_async();
    Self { tx, rx }
  }

  /// Splits the queue into its producer and consumer halves.
  pub(crate) fn split(self) -> (QueueProducer<T>, QueueConsumer<T>) {
    (QueueProducer { tx: self.tx }, QueueConsumer { rx: self.rx })
  }
}

/// The producer handle for the `TaskQueue`.
#[derive(Clone)]
pub(crate) struct QueueProducer<T: Send + 'static> {
  tx: AsyncSender<Job<T>>,
}

/// The consumer handle for the `TaskQueue`. It cannot be cloned, enforcing
/// the single-consumer pattern.
#[derive(Debug)]
pub(crate) struct QueueConsumer<T: Send + 'static> {
  rx: AsyncReceiver<Job<T>>,
}

impl<T: Send + 'static> fmt::Debug for QueueProducer<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueueProducer")
      .field("len", &self.len())
      .field("closed", &self.is_closed())
      .finish()
  }
}

impl<T: Send + 'static> QueueProducer<T> {
  /// Sends a job into the queue unless the pool is shutting down.
  ///
  /// A job that cannot be sent is dropped, which fulfils its completer with a
  /// channel error.
  pub(crate) async fn send(&self, job: Job<T>, shutdown_token: &CancellationToken) -> Result<(), PoolError> {
    if shutdown_token.is_cancelled() || self.tx.is_closed() {
      return Err(PoolError::PoolShuttingDown);
    }

    if self.tx.send(job).await.is_ok() {
      Ok(())
    } else if shutdown_token.is_cancelled() {
      Err(PoolError::PoolShuttingDown)
    } else {
      Err(PoolError::QueueSendChannelClosed)
    }
  }

  /// Closes the sending side of the queue. The consumer still receives
  /// everything sent before the close.
  pub(crate) fn close(&self) {
    let _ = self.tx.close();
  }

  /// Returns `true` if the queue's sender has been closed.
  pub(crate) fn is_closed(&self) -> bool {
    self.tx.is_closed()
  }

  /// Returns the number of jobs waiting in the underlying channel.
  pub(crate) fn len(&self) -> usize {
    self.tx.len()
  }
}

impl<T: Send + 'static> QueueConsumer<T> {
  /// Receives the next job, or `RecvError::Disconnected` once the queue is
  /// closed and empty.
  pub(crate) async fn recv(&self) -> Result<Job<T>, RecvError> {
    self.rx.recv().await
  }
}
