use crate::error::{panic_message, BoxError, ConfigError, ManagerError, PoolError, TaskFailure};
use crate::policy::ErrorPolicy;
use crate::pool::TaskPool;
use crate::source::TaskSource;
use crate::task::{erase, Task, TaskHandle};

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::stream::{self, Stream};
use parking_lot::Mutex;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{debug, error, info, trace, warn};

/// Lifecycle of one manager's run.
///
/// `Admitting` pulls and dispatches tasks. `Aborting` is entered when a failure
/// is raised: nothing more is admitted while the pool joins. A run stays
/// `Aborting` if the call raising the failure is cancelled; the next `run`,
/// `join` or `as_completed` finishes the join and returns the failure. `Drained`
/// is final; the pool has been joined and no task will be admitted again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
  Admitting,
  Aborting,
  Drained,
}

/// Feeds tasks to a [`TaskPool`] with bounded admission and applies an
/// [`ErrorPolicy`] to every completion.
///
/// `submit` and `map` only record work. It is admitted by `run`, `join` or
/// `as_completed`: a task is dispatched only while fewer than `max_workers`
/// tasks are in flight, otherwise one completion is drained first.
///
/// There is no separate scope guard: `run` (or exhausting `as_completed`)
/// already joins the pool, so submitting work and awaiting `run` is the whole
/// lifecycle. Use `join` instead to stop after the work already admitted.
pub struct TaskManager<A, R>
where
  A: Clone + Send + Sync + 'static,
  R: Send + Sync + 'static,
{
  pool: Arc<TaskPool<R>>,
  error_policy: ErrorPolicy,
  source: Mutex<TaskSource<A, R>>,
  lifecycle: Mutex<RunState>,
  completion_tx: mpsc::UnboundedSender<Task<A, R>>,
  // Held by whichever caller is admitting and draining; the counters below
  // are only modified under it.
  completions: AsyncMutex<mpsc::UnboundedReceiver<Task<A, R>>>,
  admitted: AtomicUsize,
  in_flight: AtomicUsize,
  completed: Mutex<Vec<Arc<Task<A, R>>>>,
  // The raised failure, kept until some caller has returned it.
  raised: Mutex<Option<ManagerError>>,
}

impl<A, R> std::fmt::Debug for TaskManager<A, R>
where
  A: Clone + Send + Sync + 'static,
  R: Send + Sync + 'static,
{
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let completed = self.completed.lock().len();
    let pending_sources = self.source.lock().pending_segments();
    f.debug_struct("TaskManager")
      .field("pool", &self.pool)
      .field("error_policy", &self.error_policy)
      .field("state", &self.state())
      .field("admitted", &self.admitted_count())
      .field("in_flight", &self.in_flight_count())
      .field("completed", &completed)
      .field("pending_sources", &pending_sources)
      .finish_non_exhaustive()
  }
}

impl<A, R> TaskManager<A, R>
where
  A: Clone + Send + Sync + 'static,
  R: Send + Sync + 'static,
{
  pub fn new(pool: Arc<TaskPool<R>>, error_policy: ErrorPolicy) -> Self {
    let (completion_tx, completion_rx) = mpsc::unbounded_channel();
    debug!(pool_name = %pool.name(), %error_policy, "Task manager created.");
    Self {
      pool,
      error_policy,
      source: Mutex::new(TaskSource::new()),
      lifecycle: Mutex::new(RunState::Admitting),
      completion_tx,
      completions: AsyncMutex::new(completion_rx),
      admitted: AtomicUsize::new(0),
      in_flight: AtomicUsize::new(0),
      completed: Mutex::new(Vec::new()),
      raised: Mutex::new(None),
    }
  }

  /// Creates a manager from an error policy name such as `"raise"`, `"LOG"` or `"Ignore"`.
  ///
  /// # Errors
  /// Returns `ConfigError::UnknownErrorPolicy` for any other name.
  pub fn with_policy_name(pool: Arc<TaskPool<R>>, error_policy: &str) -> Result<Self, ConfigError> {
    let error_policy = error_policy.parse::<ErrorPolicy>()?;
    Ok(Self::new(pool, error_policy))
  }

  pub fn pool(&self) -> &Arc<TaskPool<R>> {
    &self.pool
  }

  pub fn error_policy(&self) -> ErrorPolicy {
    self.error_policy
  }

  pub fn state(&self) -> RunState {
    *self.lifecycle.lock()
  }

  /// Number of tasks dispatched so far.
  pub fn admitted_count(&self) -> usize {
    self.admitted.load(Ordering::SeqCst)
  }

  /// Number of dispatched tasks whose completion has not been drained yet.
  /// Never exceeds the pool's `max_workers`.
  pub fn in_flight_count(&self) -> usize {
    self.in_flight.load(Ordering::SeqCst)
  }

  /// Records one task. It is admitted, in submission order, by the next `run`,
  /// `join` or `as_completed`.
  ///
  /// # Errors
  /// Returns `PoolError::PoolShuttingDown` once the run has aborted or drained.
  pub fn submit<F, Fut, E>(&self, callable: F, args: A) -> Result<TaskHandle, PoolError>
  where
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
    E: Into<BoxError> + 'static,
  {
    let mut source = self.source.lock();
    self.ensure_admitting()?;
    let task = Task::new(erase(callable), args);
    let handle = task.handle();
    trace!(task_id = handle.id(), "Task submitted.");
    source.push(task);
    Ok(handle)
  }

  /// Records one task per element of `items`. Elements are pulled only as
  /// tasks are admitted, so `items` may be unbounded.
  ///
  /// # Errors
  /// Returns `PoolError::PoolShuttingDown` once the run has aborted or drained.
  pub fn map<F, Fut, E, I>(&self, callable: F, items: I) -> Result<(), PoolError>
  where
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
    E: Into<BoxError> + 'static,
    I: IntoIterator<Item = A>,
    I::IntoIter: Send + 'static,
  {
    let mut source = self.source.lock();
    self.ensure_admitting()?;
    let callable = erase(callable);
    source.extend_lazy(items.into_iter().map(move |args| Task::new(callable.clone(), args)));
    Ok(())
  }

  /// Admits and drains every recorded task, then joins the pool.
  ///
  /// # Errors
  /// Under `ErrorPolicy::Raise`, returns `ManagerError::TaskFailed` for the first
  /// failure drained; the pool has been joined by then. A failure whose raising
  /// call was cancelled is returned by the next call instead. Pool join
  /// failures are returned as `ManagerError::Pool`.
  pub async fn run(&self) -> Result<(), ManagerError> {
    let mut completions = self.completions.lock().await;
    while self.next_completion(&mut completions).await?.is_some() {}
    Ok(())
  }

  /// Lazily admits and drains, yielding each completion as it is drained.
  ///
  /// The schedule is the same as `run`. Tasks submitted while the stream is
  /// being consumed are picked up before it ends. The stream ends after
  /// yielding an error, and once exhausted the pool has been joined.
  pub fn as_completed(&self) -> impl Stream<Item = Result<Arc<Task<A, R>>, ManagerError>> + '_ {
    stream::unfold(Some(self), |manager| async move {
      let manager = manager?;
      let mut completions = manager.completions.lock().await;
      match manager.next_completion(&mut completions).await {
        Ok(Some(task)) => Some((Ok(task), Some(manager))),
        Ok(None) => None,
        Err(err) => Some((Err(err), None)),
      }
    })
  }

  /// Drains every task already admitted, then joins the pool. Tasks recorded
  /// but never admitted are discarded. Calling it again is a no-op.
  ///
  /// # Errors
  /// If a raised failure was never returned because the call raising it was
  /// cancelled, `join` finishes joining the pool and returns that failure.
  pub async fn join(&self) -> Result<(), ManagerError> {
    let mut completions = self.completions.lock().await;
    match self.state() {
      RunState::Drained => {
        trace!(pool_name = %self.pool.name(), "Join: run already drained.");
        return Ok(());
      }
      RunState::Aborting => return self.resume_abort().await,
      RunState::Admitting => {}
    }

    while self.in_flight_count() > 0 {
      self.drain_one(&mut completions).await?;
    }

    let discarded = self.source.lock().clear();
    if discarded > 0 {
      warn!(pool_name = %self.pool.name(), discarded, "Join: discarding task sources that were never admitted.");
    }
    self.finish().await
  }

  /// Snapshot of every completion drained so far, in completion order.
  pub fn completed_tasks(&self) -> Vec<Arc<Task<A, R>>> {
    self.completed.lock().clone()
  }

  /// Values of the successful completions drained so far, in completion order.
  pub fn results(&self) -> Vec<R>
  where
    R: Clone,
  {
    self.completed.lock().iter().filter_map(|task| task.value().cloned()).collect()
  }

  /// Failures of the completions drained so far, in completion order.
  pub fn failures(&self) -> Vec<TaskFailure> {
    self.completed.lock().iter().filter_map(|task| task.failure().cloned()).collect()
  }

  fn ensure_admitting(&self) -> Result<(), PoolError> {
    if self.state() != RunState::Admitting || self.pool.is_shutting_down() {
      warn!(pool_name = %self.pool.name(), "Submit: run is no longer admitting tasks.");
      return Err(PoolError::PoolShuttingDown);
    }
    Ok(())
  }

  fn set_state(&self, state: RunState) {
    let mut lifecycle = self.lifecycle.lock();
    debug!(from = ?*lifecycle, to = ?state, "Run state transition.");
    *lifecycle = state;
  }

  /// One step of the admission/drain schedule: admits tasks while the window
  /// has room, then drains and returns one completion. Returns `None` once the
  /// source is exhausted and nothing is in flight, joining the pool first.
  async fn next_completion(
    &self,
    completions: &mut mpsc::UnboundedReceiver<Task<A, R>>,
  ) -> Result<Option<Arc<Task<A, R>>>, ManagerError> {
    loop {
      match self.state() {
        RunState::Admitting => {}
        RunState::Aborting => {
          self.resume_abort().await?;
          return Ok(None);
        }
        RunState::Drained => return Ok(None),
      }

      if self.in_flight_count() >= self.pool.max_workers() {
        return self.drain_one(completions).await.map(Some);
      }

      let next = self.source.lock().next_task();
      match next {
        Some(task) => self.admit(task).await,
        None if self.in_flight_count() > 0 => return self.drain_one(completions).await.map(Some),
        None => {
          self.finish().await?;
          return Ok(None);
        }
      }
    }
  }

  /// Dispatches `task` and arranges for exactly one completion to reach the
  /// completion channel, whether it runs, panics while building its work or is
  /// refused by the pool.
  async fn admit(&self, task: Task<A, R>) {
    let task_id = task.id();
    let callable = task.callable().clone();
    let args = task.args().clone();
    self.admitted.fetch_add(1, Ordering::SeqCst);
    self.in_flight.fetch_add(1, Ordering::SeqCst);

    let work = match std::panic::catch_unwind(AssertUnwindSafe(move || callable(args))) {
      Ok(work) => work,
      Err(panic_payload) => {
        let message = panic_message(&*panic_payload);
        warn!(task_id, %message, "Task failed at dispatch.");
        self.deliver(task.into_completed(Err(TaskFailure::Panicked(message))));
        return;
      }
    };

    match self.pool.dispatch(work).await {
      Ok(handle) => {
        debug!(task_id, pool_task_id = handle.id(), "Task admitted.");
        let completion_tx = self.completion_tx.clone();
        handle.on_complete(move |outcome| {
          let outcome = outcome
            .map_err(TaskFailure::from)
            .and_then(|result| result.map_err(TaskFailure::from));
          if completion_tx.send(task.into_completed(outcome)).is_err() {
            trace!(task_id, "Manager gone; completion discarded.");
          }
        });
      }
      Err(pool_error) => {
        warn!(task_id, %pool_error, "Pool refused task at dispatch.");
        self.deliver(task.into_completed(Err(TaskFailure::from(pool_error))));
      }
    }
  }

  fn deliver(&self, completed: Task<A, R>) {
    // The manager owns a receiver, so sending cannot fail while `self` is alive.
    let _ = self.completion_tx.send(completed);
  }

  /// Waits for one completion, records it and applies the error policy.
  async fn drain_one(
    &self,
    completions: &mut mpsc::UnboundedReceiver<Task<A, R>>,
  ) -> Result<Arc<Task<A, R>>, ManagerError> {
    let completed = match completions.recv().await {
      Some(task) => Arc::new(task),
      None => return Err(ManagerError::CompletionChannelClosed(self.in_flight_count())),
    };
    self.in_flight.fetch_sub(1, Ordering::SeqCst);
    self.completed.lock().push(completed.clone());
    debug!(task_id = completed.id(), "Completed task received.");

    if let Some(failure) = completed.failure() {
      match self.error_policy {
        ErrorPolicy::Raise => self.abort(completed.id(), failure.clone()).await?,
        ErrorPolicy::Log => {
          error!(task_id = completed.id(), error = %failure, "Task raised an error.");
        }
        ErrorPolicy::Ignore => {
          trace!(task_id = completed.id(), error = %failure, "Task failure kept as result.");
        }
      }
    }
    Ok(completed)
  }

  /// Stops admission and joins the pool before the failure leaves the manager.
  /// Completions still in flight are not drained.
  async fn abort(&self, task_id: u64, failure: TaskFailure) -> Result<(), ManagerError> {
    info!(pool_name = %self.pool.name(), task_id, "Raising task failure and shutting down.");
    *self.raised.lock() = Some(ManagerError::TaskFailed { task_id, failure });
    self.set_state(RunState::Aborting);
    self.source.lock().clear();
    self.resume_abort().await
  }

  /// Joins the pool of an aborting run, then hands out the raised failure
  /// once. Safe to call again after being cancelled.
  async fn resume_abort(&self) -> Result<(), ManagerError> {
    if let Err(pool_error) = self.pool.join().await {
      error!(pool_name = %self.pool.name(), %pool_error, "Pool failed to join while aborting.");
    }
    self.set_state(RunState::Drained);
    let raised = self.raised.lock().take();
    match raised {
      Some(err) => Err(err),
      None => Ok(()),
    }
  }

  async fn finish(&self) -> Result<(), ManagerError> {
    let pulled = self.source.lock().pulled();
    let completed = self.completed.lock().len();
    info!(
      pool_name = %self.pool.name(),
      admitted = self.admitted_count(),
      pulled,
      completed,
      "All admitted tasks drained; joining pool."
    );
    let joined = self.pool.join().await;
    self.set_state(RunState::Drained);
    joined.map_err(ManagerError::from)
  }
}
