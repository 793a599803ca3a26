use futures_backpressure::{ConfigError, PoolConfig, PoolError, TaskToExecute, WorkerPool};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;

// Helper to create a task future
fn create_task(
  task_id_for_log: usize,
  duration_ms: u64,
  output_value: String,
  should_panic: bool,
  completion_flag: Option<Arc<AtomicBool>>, // External flag to verify completion
) -> TaskToExecute<String> {
  Box::pin(async move {
    sleep(Duration::from_millis(duration_ms)).await;

    if should_panic {
      tracing::info!("Task {} panicking as requested.", task_id_for_log);
      panic!("Task {} intentionally panicked!", task_id_for_log);
    }

    if let Some(flag) = completion_flag {
      flag.store(true, Ordering::SeqCst);
    }
    tracing::info!("Task {} completed successfully.", task_id_for_log);
    output_value
  })
}

// Helper to initialize tracing for tests (call once per test run, not per test function)
fn setup_tracing_for_test() {
  use std::sync::Once;
  use tracing_subscriber::{fmt, EnvFilter};
  static TRACING_INIT: Once = Once::new();

  TRACING_INIT.call_once(|| {
    let filter =
      EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,futures_backpressure=trace"));

    fmt::Subscriber::builder()
      .with_env_filter(filter)
      .with_test_writer()
      .try_init()
      .ok();
  });
}

fn new_pool(pool_name: &str, max_workers: usize) -> Arc<WorkerPool<String>> {
  WorkerPool::new(
    PoolConfig::new(max_workers).name(pool_name).monitor_interval(Duration::ZERO),
    tokio::runtime::Handle::current(),
  )
  .unwrap()
}

#[tokio::test]
async fn test_dispatch_and_await_basic_task() {
  setup_tracing_for_test();
  let pool = new_pool("test_pool_basic_dispatch", 2);
  assert_eq!(pool.name(), "test_pool_basic_dispatch");
  assert_eq!(pool.max_workers(), 2);

  let handle = pool
    .dispatch(create_task(1, 50, "task1_done".to_string(), false, None))
    .await
    .unwrap();
  assert_eq!(handle.await_result().await, Ok("task1_done".to_string()));

  pool.join().await.unwrap();
}

#[tokio::test]
async fn test_task_panics_are_captured() {
  setup_tracing_for_test();
  let pool = new_pool("test_pool_panic_handling", 1);

  let handle_panic = pool
    .dispatch(create_task(1, 20, "wont_complete".to_string(), true, None))
    .await
    .unwrap();
  match handle_panic.await_result().await {
    Err(PoolError::TaskPanicked(message)) => assert!(message.contains("intentionally panicked")),
    other => panic!("Expected TaskPanicked error, got {:?}", other),
  }

  // The pool keeps working after a panic.
  let handle_normal = pool
    .dispatch(create_task(2, 20, "task2_done".to_string(), false, None))
    .await
    .unwrap();
  assert_eq!(handle_normal.await_result().await, Ok("task2_done".to_string()));

  pool.join().await.unwrap();
}

#[tokio::test]
async fn test_completion_callback_runs_exactly_once() {
  setup_tracing_for_test();
  let pool = new_pool("test_pool_callback", 2);
  let calls = Arc::new(AtomicUsize::new(0));
  let seen = Arc::new(Mutex::new(Vec::new()));

  // Attached while the task is still running.
  let running = pool
    .dispatch(create_task(1, 100, "slow".to_string(), false, None))
    .await
    .unwrap();
  {
    let calls = calls.clone();
    let seen = seen.clone();
    running.on_complete(move |outcome| {
      calls.fetch_add(1, Ordering::SeqCst);
      seen.lock().unwrap().push(outcome);
    });
  }

  // Attached after the outcome is already available.
  let finished = pool
    .dispatch(create_task(2, 0, "fast".to_string(), false, None))
    .await
    .unwrap();
  while !finished.is_finished() {
    sleep(Duration::from_millis(5)).await;
  }
  {
    let calls = calls.clone();
    let seen = seen.clone();
    finished.on_complete(move |outcome| {
      calls.fetch_add(1, Ordering::SeqCst);
      seen.lock().unwrap().push(outcome);
    });
  }

  pool.join().await.unwrap();
  assert_eq!(calls.load(Ordering::SeqCst), 2);
  let mut outcomes: Vec<String> = seen.lock().unwrap().drain(..).map(|o| o.unwrap()).collect();
  outcomes.sort();
  assert_eq!(outcomes, vec!["fast".to_string(), "slow".to_string()]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrency_limit_is_respected() {
  setup_tracing_for_test();
  let pool = WorkerPool::<usize>::new(
    PoolConfig::new(2).name("test_pool_limit").monitor_interval(Duration::ZERO),
    tokio::runtime::Handle::current(),
  )
  .unwrap();
  let running = Arc::new(AtomicUsize::new(0));
  let peak = Arc::new(AtomicUsize::new(0));

  let mut handles = Vec::new();
  for i in 0..8usize {
    let running = running.clone();
    let peak = peak.clone();
    let future: TaskToExecute<usize> = Box::pin(async move {
      let now = running.fetch_add(1, Ordering::SeqCst) + 1;
      peak.fetch_max(now, Ordering::SeqCst);
      sleep(Duration::from_millis(30)).await;
      running.fetch_sub(1, Ordering::SeqCst);
      i
    });
    handles.push(pool.dispatch(future).await.unwrap());
  }

  sleep(Duration::from_millis(10)).await;
  assert!(pool.active_task_count() <= 2);

  let mut results = Vec::new();
  for handle in handles {
    results.push(handle.await_result().await.unwrap());
  }
  results.sort();
  assert_eq!(results, (0..8).collect::<Vec<_>>());
  assert_eq!(peak.load(Ordering::SeqCst), 2);

  pool.join().await.unwrap();
}

#[tokio::test]
async fn test_join_waits_for_dispatched_tasks() {
  setup_tracing_for_test();
  let pool = new_pool("test_pool_join_waits", 2);

  let flags: Vec<Arc<AtomicBool>> = (0..3).map(|_| Arc::new(AtomicBool::new(false))).collect();
  let mut handles = Vec::new();
  for (i, flag) in flags.iter().enumerate() {
    let future = create_task(i, 100 + 50 * i as u64, format!("task{}_done", i), false, Some(flag.clone()));
    handles.push(pool.dispatch(future).await.unwrap());
  }

  sleep(Duration::from_millis(20)).await;
  assert_eq!(pool.active_task_count(), 2);

  pool.join().await.unwrap();
  assert!(pool.is_shutting_down());
  assert_eq!(pool.active_task_count(), 0);
  assert_eq!(pool.queued_task_count(), 0);
  for (i, flag) in flags.iter().enumerate() {
    assert!(flag.load(Ordering::SeqCst), "Task {} should have run before join returned.", i);
  }
  for (i, handle) in handles.into_iter().enumerate() {
    assert!(handle.is_finished());
    assert_eq!(handle.await_result().await, Ok(format!("task{}_done", i)));
  }
}

#[tokio::test]
async fn test_join_is_idempotent_and_rejects_new_work() {
  setup_tracing_for_test();
  let pool = new_pool("test_pool_join_twice", 1);

  pool.join().await.unwrap();
  pool.join().await.unwrap();

  let result = pool.dispatch(create_task(1, 0, "late".to_string(), false, None)).await;
  assert!(matches!(result, Err(PoolError::PoolShuttingDown)));
}

#[tokio::test]
async fn test_concurrent_joins_both_return_after_work_finishes() {
  setup_tracing_for_test();
  let pool = new_pool("test_pool_concurrent_join", 1);
  let flag = Arc::new(AtomicBool::new(false));
  let _handle = pool
    .dispatch(create_task(1, 100, "done".to_string(), false, Some(flag.clone())))
    .await
    .unwrap();

  let (first, second) = tokio::join!(pool.join(), pool.join());
  first.unwrap();
  second.unwrap();
  assert!(flag.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_monitor_starts_on_first_dispatch_only_when_enabled() {
  setup_tracing_for_test();
  let monitored = WorkerPool::<String>::new(
    PoolConfig::new(1).name("test_pool_monitor").monitor_interval(Duration::from_millis(10)),
    tokio::runtime::Handle::current(),
  )
  .unwrap();
  assert!(!monitored.is_monitoring());
  let handle = monitored
    .dispatch(create_task(1, 40, "watched".to_string(), false, None))
    .await
    .unwrap();
  assert!(monitored.is_monitoring());
  assert_eq!(handle.await_result().await, Ok("watched".to_string()));
  tokio::time::timeout(Duration::from_secs(2), monitored.join())
    .await
    .expect("Join should stop the monitor")
    .unwrap();

  let silent = new_pool("test_pool_no_monitor", 1);
  let handle = silent.dispatch(create_task(2, 0, "quiet".to_string(), false, None)).await.unwrap();
  assert!(!silent.is_monitoring());
  assert_eq!(handle.await_result().await, Ok("quiet".to_string()));
  silent.join().await.unwrap();
}

#[tokio::test]
async fn test_invalid_capacity_is_a_config_error() {
  setup_tracing_for_test();
  let result = WorkerPool::<String>::new(PoolConfig::new(0), tokio::runtime::Handle::current());
  assert!(matches!(result, Err(ConfigError::ZeroCapacity)));
}

#[tokio::test]
async fn test_drop_pool_signals_shutdown() {
  setup_tracing_for_test();
  let pool = new_pool("test_pool_drop", 1);
  let flag = Arc::new(AtomicBool::new(false));
  let handle = pool
    .dispatch(create_task(1, 50, "survives_drop".to_string(), false, Some(flag.clone())))
    .await
    .unwrap();

  drop(pool);

  // Work dispatched before the drop still runs to completion.
  assert_eq!(handle.await_result().await, Ok("survives_drop".to_string()));
  assert!(flag.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_cancelled_join_is_resumed_by_next_join() {
  setup_tracing_for_test();
  let pool = new_pool("test_pool_cancelled_join", 1);
  let flag = Arc::new(AtomicBool::new(false));
  let handle = pool
    .dispatch(create_task(1, 200, "slow".to_string(), false, Some(flag.clone())))
    .await
    .unwrap();

  assert!(tokio::time::timeout(Duration::from_millis(20), pool.join()).await.is_err());
  assert!(pool.is_shutting_down());
  assert!(!flag.load(Ordering::SeqCst));

  pool.join().await.unwrap();
  assert!(flag.load(Ordering::SeqCst), "The resumed join must wait for dispatched work");
  assert!(handle.is_finished());
  pool.join().await.unwrap();
}
