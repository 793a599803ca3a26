use dashmap::DashMap;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::{Duration, Instant};
use tokio::runtime::Handle as TokioHandle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, Instrument};

struct MonitorInternalState {
  tokio_handle: TokioHandle,
  pool_shutdown_token: CancellationToken,
  pool_name_for_logging: Arc<String>,
  worker_join_handle: Option<JoinHandle<()>>,
}

/// Periodic throughput reporter for a `WorkerPool`.
///
/// The monitor runs as its own runtime task, outside the pool's semaphore, so
/// it never occupies one of the pool's `max_workers` slots. It is started on
/// the first dispatch and stops when the pool's shutdown token is cancelled.
pub(crate) struct ThroughputMonitor {
  interval: Duration,
  completions: Arc<AtomicUsize>,
  init_once: Once,
  // Set only once the reporting loop has actually been spawned.
  started: AtomicBool,
  internal_state: Mutex<MonitorInternalState>,
}

impl fmt::Debug for ThroughputMonitor {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ThroughputMonitor")
      .field("interval", &self.interval)
      .field("started", &self.is_started())
      .field("pending_completions", &self.completions.load(Ordering::Relaxed))
      .finish()
  }
}

impl ThroughputMonitor {
  pub(crate) fn new(
    interval: Duration,
    tokio_handle: TokioHandle,
    pool_shutdown_token: CancellationToken,
    pool_name_for_logging: Arc<String>,
  ) -> Self {
    Self {
      interval,
      completions: Arc::new(AtomicUsize::new(0)),
      init_once: Once::new(),
      started: AtomicBool::new(false),
      internal_state: Mutex::new(MonitorInternalState {
        tokio_handle,
        pool_shutdown_token,
        pool_name_for_logging,
        worker_join_handle: None,
      }),
    }
  }

  pub(crate) fn is_enabled(&self) -> bool {
    !self.interval.is_zero()
  }

  pub(crate) fn is_started(&self) -> bool {
    self.started.load(Ordering::Acquire)
  }

  /// Counter the pool's workers bump once per finished task.
  pub(crate) fn completion_counter(&self) -> Arc<AtomicUsize> {
    self.completions.clone()
  }

  /// Spawns the reporting loop the first time it is called. A zero interval
  /// disables the monitor.
  pub(crate) fn ensure_started(&self, active_tasks: Arc<DashMap<u64, Instant>>) {
    if !self.is_enabled() {
      return;
    }
    self.init_once.call_once(|| {
      let mut state_guard = self.internal_state.lock();
      if state_guard.pool_shutdown_token.is_cancelled() {
        trace!(pool_name = %*state_guard.pool_name_for_logging, "Monitor: pool already shutting down, not starting.");
        return;
      }
      info!(pool_name = %*state_guard.pool_name_for_logging, interval = ?self.interval, "Starting pool monitor.");

      let worker_jh = state_guard.tokio_handle.spawn(
        Self::run_monitor_loop(
          self.interval,
          self.completions.clone(),
          active_tasks,
          state_guard.pool_shutdown_token.clone(),
        )
        .instrument(info_span!("pool_monitor_loop", pool_name = %*state_guard.pool_name_for_logging)),
      );
      state_guard.worker_join_handle = Some(worker_jh);
      self.started.store(true, Ordering::Release);
    });
  }

  async fn run_monitor_loop(
    interval: Duration,
    completions: Arc<AtomicUsize>,
    active_tasks: Arc<DashMap<u64, Instant>>,
    pool_shutdown_token: CancellationToken,
  ) {
    let mut window_start = Instant::now();
    loop {
      tokio::select! {
        biased;

        _ = pool_shutdown_token.cancelled() => {
          info!("Shutting down monitor.");
          break;
        }

        _ = tokio::time::sleep(interval) => {
          let done = completions.swap(0, Ordering::AcqRel);
          let in_flight = active_tasks.len();
          if done == 0 && in_flight == 0 {
            debug!("No current tasks.");
          } else {
            info!(
              completed = done,
              in_flight,
              "{} task(s) completed in the last {:.2} second(s)",
              done,
              window_start.elapsed().as_secs_f64()
            );
          }
          window_start = Instant::now();
        }
      }
    }
  }

  /// Waits for the reporting loop to exit. The pool's shutdown token must
  /// already be cancelled.
  pub(crate) async fn await_shutdown(&self) {
    let (handle_option, pool_name) = {
      let mut guard = self.internal_state.lock();
      (guard.worker_join_handle.take(), guard.pool_name_for_logging.clone())
    };

    if let Some(handle) = handle_option {
      if let Err(e) = handle.await {
        error!(pool_name = %*pool_name, "Monitor: Error joining monitor loop: {:?}", e);
      } else {
        debug!(pool_name = %*pool_name, "Monitor: monitor loop joined.");
      }
    } else {
      trace!(pool_name = %*pool_name, "Monitor: not started or already joined.");
    }
  }
}
