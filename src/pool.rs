use crate::error::{panic_message, BoxError, ConfigError, PoolError};
use crate::handle::{completion_pair, DispatchHandle};
use crate::monitor::ThroughputMonitor;
use crate::task::TaskToExecute;
use crate::task_queue::{Job, QueueConsumer, QueueProducer, TaskQueue};

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use fibre::mpsc::RecvError;
use futures::FutureExt;
use tokio::runtime::Handle as TokioHandle;
use tokio::sync::{Mutex as AsyncMutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

lazy_static::lazy_static! {
  static ref NEXT_POOL_TASK_ID_COUNTER: AtomicU64 = AtomicU64::new(0);
}

/// How often the monitor reports throughput unless configured otherwise.
pub const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_secs(2);

/// A pool whose work produces a task's callable outcome; this is what the
/// `TaskManager` dispatches to.
pub type TaskPool<R> = WorkerPool<Result<R, BoxError>>;

/// Construction parameters for a [`WorkerPool`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
  /// Used in log fields and span names.
  pub name: String,
  /// Number of tasks allowed to run at once. Must be at least 1.
  pub max_workers: usize,
  /// Period of the throughput monitor; `Duration::ZERO` disables it.
  pub monitor_interval: Duration,
}

impl PoolConfig {
  pub fn new(max_workers: usize) -> Self {
    Self {
      name: "worker_pool".to_string(),
      max_workers,
      monitor_interval: DEFAULT_MONITOR_INTERVAL,
    }
  }

  pub fn name(mut self, name: impl Into<String>) -> Self {
    self.name = name.into();
    self
  }

  pub fn monitor_interval(mut self, interval: Duration) -> Self {
    self.monitor_interval = interval;
    self
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.max_workers == 0 {
      return Err(ConfigError::ZeroCapacity);
    }
    if self.max_workers > Semaphore::MAX_PERMITS || u32::try_from(self.max_workers).is_err() {
      return Err(ConfigError::CapacityTooLarge(self.max_workers));
    }
    Ok(())
  }
}

/// A fixed-capacity pool running dispatched futures on a Tokio runtime.
///
/// At most `max_workers` dispatched futures run at once; the rest wait in the
/// pool's queue. [`WorkerPool::join`] stops accepting work, lets everything
/// already dispatched finish and then stops the pool.
pub struct WorkerPool<T: Send + 'static> {
  pool_name: Arc<String>,
  max_workers: usize,
  semaphore: Arc<Semaphore>,
  queue: QueueProducer<T>,
  active_task_info: Arc<DashMap<u64, Instant>>,
  shutdown_token: CancellationToken,
  worker_join_handle: AsyncMutex<Option<JoinHandle<()>>>,
  joined: AtomicBool,
  monitor: ThroughputMonitor,
}

impl<T: Send + 'static> std::fmt::Debug for WorkerPool<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("WorkerPool")
      .field("name", &self.pool_name)
      .field("max_workers", &self.max_workers)
      .field("active", &self.active_task_info.len())
      .field("shutting_down", &self.shutdown_token.is_cancelled())
      .field("monitor", &self.monitor)
      .finish_non_exhaustive()
  }
}

impl<T: Send + 'static> WorkerPool<T> {
  /// Creates the pool and spawns its worker loop on `tokio_handle`.
  pub fn new(config: PoolConfig, tokio_handle: TokioHandle) -> Result<Arc<Self>, ConfigError> {
    config.validate()?;

    let (producer, consumer) = TaskQueue::new().split();
    let shutdown_token = CancellationToken::new();
    let pool_name = Arc::new(config.name);
    let semaphore = Arc::new(Semaphore::new(config.max_workers));
    let active_task_info = Arc::new(DashMap::new());
    let monitor = ThroughputMonitor::new(
      config.monitor_interval,
      tokio_handle.clone(),
      shutdown_token.clone(),
      pool_name.clone(),
    );

    let worker_loop_join_handle = tokio_handle.spawn(
      Self::run_worker_loop(
        pool_name.clone(),
        semaphore.clone(),
        consumer,
        tokio_handle.clone(),
        active_task_info.clone(),
        monitor.completion_counter(),
      )
      .instrument(info_span!("worker_pool_loop", name = %pool_name)),
    );

    info!(pool_name = %pool_name, max_workers = config.max_workers, "Worker pool created.");

    Ok(Arc::new(Self {
      pool_name,
      max_workers: config.max_workers,
      semaphore,
      queue: producer,
      active_task_info,
      shutdown_token,
      worker_join_handle: AsyncMutex::new(Some(worker_loop_join_handle)),
      joined: AtomicBool::new(false),
      monitor,
    }))
  }

  pub fn name(&self) -> &str {
    &self.pool_name
  }

  pub fn max_workers(&self) -> usize {
    self.max_workers
  }

  /// Number of dispatched tasks currently executing.
  pub fn active_task_count(&self) -> usize {
    self.active_task_info.len()
  }

  /// Returns the current number of dispatched tasks waiting for a free worker.
  pub fn queued_task_count(&self) -> usize {
    self.queue.len()
  }

  pub fn is_shutting_down(&self) -> bool {
    self.shutdown_token.is_cancelled()
  }

  /// `true` once the throughput monitor has been started by a dispatch.
  pub fn is_monitoring(&self) -> bool {
    self.monitor.is_started()
  }

  /// Queues `task_future` for execution and returns a handle to its outcome.
  ///
  /// # Errors
  /// Returns `PoolError::PoolShuttingDown` once `join` has started or the pool was dropped.
  pub async fn dispatch(&self, task_future: TaskToExecute<T>) -> Result<DispatchHandle<T>, PoolError> {
    if self.shutdown_token.is_cancelled() || self.queue.is_closed() {
      warn!(pool_name = %self.pool_name, "Dispatch: Attempted to dispatch to a pool that is shutting down or closed.");
      return Err(PoolError::PoolShuttingDown);
    }
    self.monitor.ensure_started(self.active_task_info.clone());

    let task_id = NEXT_POOL_TASK_ID_COUNTER.fetch_add(1, AtomicOrdering::Relaxed);
    let (completer, handle) = completion_pair(task_id);
    let job = Job {
      task_id,
      future: task_future,
      completer,
    };

    debug!(pool_name = %self.pool_name, %task_id, "Dispatching task to queue.");
    match self.queue.send(job, &self.shutdown_token).await {
      Ok(()) => Ok(handle),
      Err(e) => {
        error!(pool_name = %self.pool_name, %task_id, "Dispatch: Failed to send task to queue: {}", e);
        Err(e)
      }
    }
  }

  /// Stops accepting work, waits for every dispatched task to finish and stops
  /// the worker loop and monitor. Calling it again is a no-op.
  ///
  /// Cancelling a `join` leaves the pool shutting down; the next `join` picks
  /// up where the cancelled one stopped and still waits for every task.
  pub async fn join(&self) -> Result<(), PoolError> {
    let mut worker_guard = self.worker_join_handle.lock().await;
    if self.joined.load(AtomicOrdering::Acquire) {
      trace!(pool_name = %self.pool_name, "Join: pool already joined.");
      return Ok(());
    }

    info!(pool_name = %self.pool_name, "Joining pool: closing queue and waiting for dispatched tasks.");
    self.shutdown_token.cancel();
    self.queue.close();

    let mut outcome = Ok(());
    if let Some(handle) = worker_guard.as_mut() {
      let joined_loop = handle.await;
      *worker_guard = None;
      if let Err(join_error) = joined_loop {
        error!(pool_name = %self.pool_name, "Error joining worker loop: {:?}. Worker loop might have panicked.", join_error);
        outcome = Err(PoolError::WorkerJoinFailed(join_error.to_string()));
      }
    }

    // Every spawned task holds a permit until it has delivered its outcome.
    match self.semaphore.acquire_many(self.max_workers as u32).await {
      Ok(permits) => {
        drop(permits);
        self.semaphore.close();
      }
      Err(_) => {
        trace!(pool_name = %self.pool_name, "Join: all tasks already observed finishing.");
      }
    }

    self.monitor.await_shutdown().await;
    self.joined.store(true, AtomicOrdering::Release);
    info!(pool_name = %self.pool_name, "Pool joined.");
    outcome
  }

  async fn run_worker_loop(
    pool_name: Arc<String>,
    semaphore: Arc<Semaphore>,
    task_queue_rx: QueueConsumer<T>,
    tasks_tokio_handle: TokioHandle,
    active_task_info_map: Arc<DashMap<u64, Instant>>,
    completion_counter: Arc<AtomicUsize>,
  ) {
    info!(name = %*pool_name, "Worker loop started.");

    loop {
      let job = match task_queue_rx.recv().await {
        Ok(job) => job,
        Err(RecvError::Disconnected) => {
          info!(name = %*pool_name, "Task queue closed and empty. Worker loop terminating.");
          break;
        }
      };

      let permit = match semaphore.clone().acquire_owned().await {
        Ok(p) => p,
        Err(_) => {
          error!(name = %*pool_name, task_id = job.task_id, "Semaphore closed. Worker loop exiting.");
          break;
        }
      };
      trace!(name = %*pool_name, "Acquired semaphore permit. Available: {}", semaphore.available_permits());

      let Job {
        task_id,
        future,
        completer,
      } = job;
      active_task_info_map.insert(task_id, Instant::now());
      debug!(name = %*pool_name, %task_id, "Dequeued task. Spawning with permit.");

      let active_task_info_map_cleanup = active_task_info_map.clone();
      let completion_counter = completion_counter.clone();
      let pool_name_for_task_execution = pool_name.clone();

      tasks_tokio_handle.spawn(
        async move {
          let _permit_guard = permit;

          let execution_outcome = match AssertUnwindSafe(future).catch_unwind().await {
            Ok(actual_result) => {
              trace!(pool_name = %*pool_name_for_task_execution, %task_id, "Task executed.");
              Ok(actual_result)
            }
            Err(panic_payload) => {
              let message = panic_message(&*panic_payload);
              error!(pool_name = %*pool_name_for_task_execution, %task_id, %message, "Task panicked during execution.");
              Err(PoolError::TaskPanicked(message))
            }
          };

          let started_at = active_task_info_map_cleanup.remove(&task_id).map(|(_, started)| started);
          completion_counter.fetch_add(1, AtomicOrdering::AcqRel);
          debug!(
            pool_name = %*pool_name_for_task_execution,
            %task_id,
            elapsed = ?started_at.map(|s| s.elapsed()),
            "Managed task finished processing."
          );
          completer.complete(execution_outcome);
        }
        .instrument(info_span!("managed_task", pool_name = %*pool_name, %task_id)),
      );
    }

    info!(
      name = %*pool_name,
      "Worker loop stopped. Tasks still running: {}",
      active_task_info_map.len()
    );
  }
}

impl<T: Send + 'static> Drop for WorkerPool<T> {
  fn drop(&mut self) {
    if !self.shutdown_token.is_cancelled() {
      info!(
        pool_name = %*self.pool_name,
        "WorkerPool instance dropped. Initiating implicit shutdown (signaling monitor to stop, closing queue)."
      );
      // The worker loop finishes whatever is already queued and exits once
      // the queue is closed and empty; it is not awaited here.
      self.shutdown_token.cancel();
      self.queue.close();
    } else {
      trace!(pool_name = %*self.pool_name, "Drop: Shutdown already in progress or completed.");
    }
  }
}
