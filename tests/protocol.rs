//! Protocol-level guarantees that hold across producers and operators.

use fluxweave::consumers::VecConsumer;
use fluxweave::hub::{Hub, HubConfig};
use fluxweave::{Consumer, Flow, FlowError, SubscriptionRef};
use proptest::prelude::*;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

fn init_tracing() {
  let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

#[derive(Default)]
struct Tally {
  items: AtomicUsize,
  terminals: AtomicUsize,
  overlaps: AtomicUsize,
  busy: AtomicBool,
  subscription: Mutex<Option<SubscriptionRef>>,
}

impl Tally {
  fn subscription(&self) -> SubscriptionRef {
    self.subscription.lock().unwrap().clone().unwrap()
  }

  fn enter(&self) {
    if self.busy.swap(true, Ordering::SeqCst) {
      self.overlaps.fetch_add(1, Ordering::SeqCst);
    }
  }

  fn leave(&self) {
    self.busy.store(false, Ordering::SeqCst);
  }
}

struct TallyConsumer(Arc<Tally>);

impl<T: Send + 'static> Consumer<T> for TallyConsumer {
  fn on_subscribe(&mut self, subscription: SubscriptionRef) {
    *self.0.subscription.lock().unwrap() = Some(subscription);
  }

  fn on_next(&mut self, _item: T) {
    self.0.enter();
    self.0.items.fetch_add(1, Ordering::SeqCst);
    self.0.leave();
  }

  fn on_error(&mut self, _error: FlowError) {
    self.0.enter();
    self.0.terminals.fetch_add(1, Ordering::SeqCst);
    self.0.leave();
  }

  fn on_complete(&mut self) {
    self.0.enter();
    self.0.terminals.fetch_add(1, Ordering::SeqCst);
    self.0.leave();
  }
}

fn counted_source(limit: u32, disposed: Arc<AtomicUsize>) -> Flow<u32> {
  Flow::generate(
    || Ok(0u32),
    move |n: &mut u32| {
      *n += 1;
      Ok((*n <= limit).then_some(*n))
    },
    move |_| {
      disposed.fetch_add(1, Ordering::SeqCst);
      Ok(())
    },
  )
}

#[test]
fn test_single_terminal_under_cancel_race() {
  init_tracing();
  for _ in 0..200 {
    let disposed = Arc::new(AtomicUsize::new(0));
    let tally = Arc::new(Tally::default());
    counted_source(16, disposed.clone()).subscribe(TallyConsumer(tally.clone()));
    let subscription = tally.subscription();
    let canceller = {
      let subscription = subscription.clone();
      thread::spawn(move || subscription.cancel())
    };
    for _ in 0..17 {
      subscription.request(1);
    }
    canceller.join().unwrap();
    assert!(tally.terminals.load(Ordering::SeqCst) <= 1);
    assert_eq!(disposed.load(Ordering::SeqCst), 1);
    assert_eq!(tally.overlaps.load(Ordering::SeqCst), 0);
  }
}

#[test]
fn test_disposal_runs_once_per_lifecycle() {
  init_tracing();
  // completion
  let disposed = Arc::new(AtomicUsize::new(0));
  let consumer = VecConsumer::new();
  let handle = consumer.handle();
  counted_source(3, disposed.clone()).subscribe(consumer);
  assert!(handle.is_complete());
  assert_eq!(disposed.load(Ordering::SeqCst), 1);

  // error
  let disposed = Arc::new(AtomicUsize::new(0));
  let counter = disposed.clone();
  let consumer = VecConsumer::new();
  let handle = consumer.handle();
  Flow::<u32>::generate(
    || Ok(()),
    |_| Err(FlowError::msg("broken")),
    move |_| {
      counter.fetch_add(1, Ordering::SeqCst);
      Ok(())
    },
  )
  .subscribe(consumer);
  assert!(handle.error().is_some());
  assert_eq!(disposed.load(Ordering::SeqCst), 1);

  // cancellation, twice
  let disposed = Arc::new(AtomicUsize::new(0));
  let consumer = VecConsumer::with_initial_request(2);
  let handle = consumer.handle();
  counted_source(100, disposed.clone()).subscribe(consumer);
  handle.cancel();
  handle.cancel();
  assert_eq!(handle.len(), 2);
  assert_eq!(disposed.load(Ordering::SeqCst), 1);
}

#[test]
fn test_concurrent_requests_are_serialized() {
  init_tracing();
  let disposed = Arc::new(AtomicUsize::new(0));
  let tally = Arc::new(Tally::default());
  counted_source(10_000, disposed.clone()).subscribe(TallyConsumer(tally.clone()));
  let subscription = tally.subscription();
  let workers: Vec<_> = (0..4)
    .map(|_| {
      let subscription = subscription.clone();
      thread::spawn(move || {
        for _ in 0..500 {
          subscription.request(1);
        }
      })
    })
    .collect();
  for worker in workers {
    worker.join().unwrap();
  }
  assert_eq!(tally.items.load(Ordering::SeqCst), 2_000);
  assert_eq!(tally.overlaps.load(Ordering::SeqCst), 0);
  subscription.cancel();
  assert_eq!(disposed.load(Ordering::SeqCst), 1);
}

#[test]
fn test_unbounded_request_drains_the_source() {
  init_tracing();
  let requests = Arc::new(AtomicUsize::new(0));
  let seen = requests.clone();
  let consumer = VecConsumer::new();
  let handle = consumer.handle();
  counted_source(1_000, Arc::new(AtomicUsize::new(0)))
    .do_on_request(move |_| {
      seen.fetch_add(1, Ordering::SeqCst);
    })
    .subscribe(consumer);
  assert_eq!(handle.len(), 1_000);
  assert!(handle.is_complete());
  assert_eq!(requests.load(Ordering::SeqCst), 1);
}

#[test]
fn test_zero_request_is_a_protocol_error() {
  init_tracing();
  let consumer = VecConsumer::with_initial_request(0);
  let handle = consumer.handle();
  Flow::range(0, 5).map(|x| x + 1).subscribe(consumer);
  handle.request(0);
  assert!(handle.error().is_some_and(|e| e.is_protocol_violation()));
  assert!(handle.is_empty());
}

#[test]
fn test_capacity_caps_every_upstream_request() {
  init_tracing();
  let requests = Arc::new(Mutex::new(Vec::new()));
  let seen = requests.clone();
  let consumer = VecConsumer::new();
  let handle = consumer.handle();
  counted_source(20, Arc::new(AtomicUsize::new(0)))
    .do_on_request(move |n| seen.lock().unwrap().push(n))
    .capacity(4)
    .subscribe(consumer);
  assert_eq!(handle.len(), 20);
  assert!(handle.is_complete());
  let requests = requests.lock().unwrap();
  assert!(requests.len() >= 5);
  assert!(requests.iter().all(|n| *n == 4));
}

#[test]
fn test_amb_loser_is_cancelled_and_silent() {
  init_tracing();
  let a: Hub<i32> = Hub::new(HubConfig::default()).unwrap();
  let b: Hub<i32> = Hub::new(HubConfig::default()).unwrap();
  let a_cancelled = Arc::new(AtomicBool::new(false));
  let flag = a_cancelled.clone();
  let consumer = VecConsumer::new();
  let handle = consumer.handle();
  Flow::amb(vec![
    a.flow().do_on_cancel(move || flag.store(true, Ordering::SeqCst)),
    b.flow(),
  ])
  .subscribe(consumer);
  b.on_next(1);
  assert!(a_cancelled.load(Ordering::SeqCst));
  a.on_next(100);
  a.on_complete();
  b.on_next(2);
  assert_eq!(handle.items(), vec![1, 2]);
  assert!(!handle.is_complete());
}

#[tokio::test]
async fn test_into_stream_keeps_prefetch_in_flight() {
  use futures::StreamExt;
  init_tracing();
  let outstanding = Arc::new(AtomicU64::new(0));
  let seen = outstanding.clone();
  let stream = Flow::range(0, 50)
    .do_on_request(move |n| {
      seen.fetch_max(n, Ordering::SeqCst);
    })
    .into_stream(8);
  let items: Vec<i32> = stream.map(Result::unwrap).collect().await;
  assert_eq!(items, (0..50).collect::<Vec<_>>());
  assert!(outstanding.load(Ordering::SeqCst) <= 8);
}

proptest! {
  #[test]
  fn test_never_over_delivers(requests in proptest::collection::vec(1u64..5, 0..12)) {
    let consumer = VecConsumer::with_initial_request(0);
    let handle = consumer.handle();
    Flow::range(0, 1_000)
      .filter(|x| x % 3 != 0)
      .map(|x| x * 2)
      .take(500)
      .subscribe(consumer);
    let mut total = 0u64;
    for n in requests {
      handle.request(n);
      total += n;
      prop_assert_eq!(handle.len() as u64, total);
    }
  }

  #[test]
  fn test_flat_map_never_over_delivers(
    requests in proptest::collection::vec(1u64..4, 0..8),
    width in 1u32..5,
  ) {
    let consumer = VecConsumer::with_initial_request(0);
    let handle = consumer.handle();
    Flow::range(0, 10)
      .flat_map(move |n| Flow::range(n * 10, width))
      .subscribe(consumer);
    let available = 10 * width as u64;
    let mut total = 0u64;
    for n in requests {
      handle.request(n);
      total += n;
      prop_assert_eq!(handle.len() as u64, total.min(available));
    }
  }
}
