//! Producers that need no per-subscription state: empty, error, never and
//! defer.

use crate::consumer::BoxConsumer;
use crate::error::FlowError;
use crate::flow::Flow;
use crate::producer::Producer;
use crate::subscription::noop;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

/// Completes immediately.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyProducer;

impl<T: Send + 'static> Producer<T> for EmptyProducer {
  fn subscribe(&self, mut consumer: BoxConsumer<T>) {
    consumer.on_subscribe(noop());
    consumer.on_complete();
  }
}

/// Fails immediately with a fixed error.
#[derive(Debug, Clone)]
pub struct ErrorProducer {
  error: FlowError,
}

impl ErrorProducer {
  /// Fails every subscriber with a clone of `error`.
  pub fn new(error: FlowError) -> Self {
    Self { error }
  }
}

impl<T: Send + 'static> Producer<T> for ErrorProducer {
  fn subscribe(&self, mut consumer: BoxConsumer<T>) {
    consumer.on_subscribe(noop());
    consumer.on_error(self.error.clone());
  }
}

/// Never signals anything after the subscription.
#[derive(Debug, Default, Clone, Copy)]
pub struct NeverProducer;

impl<T: Send + 'static> Producer<T> for NeverProducer {
  fn subscribe(&self, mut consumer: BoxConsumer<T>) {
    consumer.on_subscribe(noop());
  }
}

type FlowFactory<T> = dyn Fn() -> Flow<T> + Send + Sync;

/// Builds the actual flow at subscription time.
pub struct DeferProducer<T> {
  factory: Arc<FlowFactory<T>>,
}

impl<T: Send + 'static> DeferProducer<T> {
  /// Calls `factory` once per subscription.
  pub fn new<F>(factory: F) -> Self
  where
    F: Fn() -> Flow<T> + Send + Sync + 'static,
  {
    Self {
      factory: Arc::new(factory),
    }
  }
}

impl<T: Send + 'static> Producer<T> for DeferProducer<T> {
  fn subscribe(&self, mut consumer: BoxConsumer<T>) {
    match catch_unwind(AssertUnwindSafe(|| (self.factory)())) {
      Ok(flow) => flow.subscribe_boxed(consumer),
      Err(panic) => {
        consumer.on_subscribe(noop());
        consumer.on_error(FlowError::from_panic(panic));
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::consumers::VecConsumer;
  use std::sync::atomic::{AtomicUsize, Ordering};

  #[test]
  fn test_error_producer_fails_every_subscriber() {
    let flow: Flow<u8> = Flow::error(FlowError::msg("down"));
    for _ in 0..2 {
      let consumer = VecConsumer::new();
      let handle = consumer.handle();
      flow.subscribe(consumer);
      assert!(handle.is_subscribed());
      assert!(matches!(handle.error(), Some(FlowError::Message(m)) if m == "down"));
    }
  }

  #[test]
  fn test_never_stays_open() {
    let consumer = VecConsumer::new();
    let handle = consumer.handle();
    Flow::<u8>::never().subscribe(consumer);
    assert!(handle.is_subscribed());
    assert!(!handle.is_terminated());
  }

  #[test]
  fn test_defer_runs_factory_per_subscription() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counted = calls.clone();
    let flow = Flow::defer(move || {
      let n = counted.fetch_add(1, Ordering::SeqCst) as i32;
      Flow::range(n, 1)
    });
    let first = VecConsumer::new();
    let first_handle = first.handle();
    flow.subscribe(first);
    let second = VecConsumer::new();
    let second_handle = second.handle();
    flow.subscribe(second);
    assert_eq!(first_handle.items(), vec![0]);
    assert_eq!(second_handle.items(), vec![1]);
  }
}
