//! Circuit breaker built from a control hub and `switch_on_next`.
//!
//! The control hub carries the flow that is currently allowed to feed the
//! output. The main flow is hot; its failures are counted and retried. Once
//! three failures accumulate the breaker opens: the fallback flow is switched
//! in and a timer on a virtual clock closes the breaker again by switching
//! back to the main flow.

use fluxweave::consumers::VecConsumer;
use fluxweave::scheduler::VirtualScheduler;
use fluxweave::{ErrorStrategy, Flow, FlowError, Hub, HubConfig};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

const THRESHOLD: usize = 3;
const RESET_AFTER: Duration = Duration::from_secs(1);

struct CircuitBreaker {
  control: Hub<Flow<String>>,
  main: OnceLock<Flow<String>>,
  fallback: Flow<String>,
  failures: AtomicUsize,
  opened: AtomicUsize,
  scheduler: VirtualScheduler,
}

impl CircuitBreaker {
  fn new(
    source: &Hub<Result<String, String>>,
    fallback: Flow<String>,
    scheduler: VirtualScheduler,
  ) -> Arc<Self> {
    let breaker = Arc::new(Self {
      control: Hub::new(HubConfig::default()).unwrap(),
      main: OnceLock::new(),
      fallback,
      failures: AtomicUsize::new(0),
      opened: AtomicUsize::new(0),
      scheduler,
    });
    let weak = Arc::downgrade(&breaker);
    let main = source
      .flow()
      .try_map(|result: Result<String, String>| result.map_err(FlowError::msg))
      .do_on_error(move |_| {
        if let Some(breaker) = weak.upgrade() {
          breaker.record_failure();
        }
      })
      .retry(ErrorStrategy::RetryForever);
    assert!(breaker.main.set(main).is_ok());
    breaker
  }

  fn output(&self) -> Flow<String> {
    self.control.flow().switch_on_next()
  }

  fn close(&self) {
    self.failures.store(0, Ordering::SeqCst);
    if let Some(main) = self.main.get() {
      self.control.on_next(main.clone());
    }
  }

  fn record_failure(self: &Arc<Self>) {
    if self.failures.fetch_add(1, Ordering::SeqCst) + 1 != THRESHOLD {
      return;
    }
    self.opened.fetch_add(1, Ordering::SeqCst);
    self.control.on_next(self.fallback.clone());
    let weak = Arc::downgrade(self);
    Flow::timer(RESET_AFTER, self.scheduler.clone()).for_each(move |_| {
      if let Some(breaker) = weak.upgrade() {
        breaker.close();
      }
    });
  }
}

fn ok(value: &str) -> Result<String, String> {
  Ok(value.to_string())
}

fn init_tracing() {
  let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

#[test]
fn test_breaker_opens_after_three_failures_and_closes_on_timer() {
  init_tracing();
  let scheduler = VirtualScheduler::new();
  let source: Hub<Result<String, String>> = Hub::new(HubConfig::default()).unwrap();
  let breaker = CircuitBreaker::new(
    &source,
    Flow::just("Alternative Message".to_string()),
    scheduler.clone(),
  );
  let consumer = VecConsumer::new();
  let handle = consumer.handle();
  breaker.output().subscribe(consumer);
  breaker.close();

  for value in ["test1", "test2", "test3"] {
    source.on_next(ok(value));
  }
  for failure in ["boom1", "boom2", "boom3"] {
    source.on_next(Err(failure.to_string()));
  }
  assert_eq!(breaker.opened.load(Ordering::SeqCst), 1);
  assert_eq!(source.subscriber_count(), 0);

  // Open: the main flow is detached, so these never reach the output.
  source.on_next(ok("test4"));
  source.on_next(ok("test5"));
  source.on_next(ok("test6"));

  scheduler.advance(RESET_AFTER);
  assert_eq!(source.subscriber_count(), 1);
  source.on_next(ok("test7"));
  source.on_next(ok("test8"));

  breaker.control.on_complete();
  assert!(!handle.is_complete());
  source.on_complete();

  assert_eq!(
    handle.items(),
    vec!["test1", "test2", "test3", "Alternative Message", "test7", "test8"]
  );
  assert!(handle.is_complete());
}

#[test]
fn test_cancelled_inner_contributes_nothing_after_switch() {
  init_tracing();
  let scheduler = VirtualScheduler::new();
  let source: Hub<Result<String, String>> = Hub::new(HubConfig::default()).unwrap();
  let fallback: Hub<String> = Hub::new(HubConfig::default()).unwrap();
  let breaker = CircuitBreaker::new(&source, fallback.flow(), scheduler.clone());
  let consumer = VecConsumer::new();
  let handle = consumer.handle();
  breaker.output().subscribe(consumer);
  breaker.close();

  for failure in 0..THRESHOLD {
    source.on_next(Err(format!("failure {failure}")));
  }
  fallback.on_next("degraded".to_string());
  scheduler.advance(RESET_AFTER);
  assert_eq!(fallback.subscriber_count(), 0);
  fallback.on_next("stale".to_string());
  source.on_next(ok("recovered"));

  assert_eq!(handle.items(), vec!["degraded", "recovered"]);
  assert!(handle.error().is_none());
}

#[test]
fn test_failures_below_threshold_keep_main_flow() {
  init_tracing();
  let scheduler = VirtualScheduler::new();
  let source: Hub<Result<String, String>> = Hub::new(HubConfig::default()).unwrap();
  let breaker = CircuitBreaker::new(
    &source,
    Flow::just("Alternative Message".to_string()),
    scheduler.clone(),
  );
  let consumer = VecConsumer::new();
  let handle = consumer.handle();
  breaker.output().subscribe(consumer);
  breaker.close();

  source.on_next(Err("one".into()));
  source.on_next(ok("a"));
  source.on_next(Err("two".into()));
  source.on_next(ok("b"));

  assert_eq!(breaker.opened.load(Ordering::SeqCst), 0);
  assert_eq!(scheduler.pending(), 0);
  assert_eq!(handle.items(), vec!["a", "b"]);
}
