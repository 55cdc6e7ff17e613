//! Bounded capacity decorator.
//!
//! Rewrites downstream demand into upstream requests of at most `capacity`
//! items. The next chunk is requested only once the previous one has been
//! fully delivered, so the source never has more than `capacity` items in
//! flight, even under unbounded downstream demand.

use crate::consumer::{BoxConsumer, Consumer};
use crate::demand::Demand;
use crate::error::FlowError;
use crate::subscription::{Subscription, SubscriptionRef, UpstreamSlot};
use crate::transformer::Transformer;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

/// Chunks demand into requests of at most `capacity`.
#[derive(Debug, Clone, Copy)]
pub struct CapacityTransformer {
  capacity: u64,
}

impl CapacityTransformer {
  /// Creates the decorator. `capacity` must be at least one; use
  /// [`crate::Flow::capacity`] to get the check.
  pub fn new(capacity: usize) -> Self {
    Self {
      capacity: (capacity as u64).max(1),
    }
  }
}

impl<T: Send + 'static> Transformer<T, T> for CapacityTransformer {
  fn apply(&self, downstream: BoxConsumer<T>) -> BoxConsumer<T> {
    Box::new(CapacityConsumer {
      downstream,
      state: Arc::new(CapacityState {
        capacity: self.capacity,
        upstream: UpstreamSlot::new(),
        pending: Demand::new(),
        in_flight: AtomicU64::new(0),
      }),
    })
  }

  fn name(&self) -> &str {
    "capacity"
  }
}

struct CapacityState {
  capacity: u64,
  upstream: UpstreamSlot,
  /// Downstream demand not yet turned into upstream requests.
  pending: Demand,
  /// Items requested upstream but not yet delivered.
  in_flight: AtomicU64,
}

impl CapacityState {
  fn replenish(&self) {
    let pending = self.pending.get();
    if pending == 0 {
      return;
    }
    let chunk = pending.min(self.capacity);
    if self
      .in_flight
      .compare_exchange(0, chunk, Ordering::AcqRel, Ordering::Acquire)
      .is_err()
    {
      return;
    }
    self.pending.produced(chunk);
    trace!(chunk, "requesting chunk");
    self.upstream.request(chunk);
  }
}

impl Subscription for CapacityState {
  fn request(&self, n: u64) {
    if n == 0 {
      self.upstream.request(0);
      return;
    }
    self.pending.add(n);
    self.replenish();
  }

  fn cancel(&self) {
    self.upstream.cancel();
  }
}

struct CapacityConsumer<T> {
  downstream: BoxConsumer<T>,
  state: Arc<CapacityState>,
}

impl<T: Send + 'static> Consumer<T> for CapacityConsumer<T> {
  fn on_subscribe(&mut self, subscription: SubscriptionRef) {
    self.state.upstream.set(subscription);
    self.downstream.on_subscribe(self.state.clone());
  }

  fn on_next(&mut self, item: T) {
    self.downstream.on_next(item);
    if self.state.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
      self.state.replenish();
    }
  }

  fn on_error(&mut self, error: FlowError) {
    self.downstream.on_error(error);
  }

  fn on_complete(&mut self) {
    self.downstream.on_complete();
  }
}

#[cfg(test)]
mod tests {
  use crate::Flow;
  use crate::consumers::VecConsumer;
  use crate::error::FlowError;
  use proptest::prelude::*;
  use std::sync::{Arc, Mutex};

  fn recorded_requests(capacity: usize, initial: u64) -> (Vec<u64>, Vec<i32>) {
    let requests = Arc::new(Mutex::new(Vec::new()));
    let seen = requests.clone();
    let consumer = VecConsumer::with_initial_request(initial);
    let handle = consumer.handle();
    Flow::range(0, 10)
      .do_on_request(move |n| seen.lock().unwrap().push(n))
      .capacity(capacity)
      .subscribe(consumer);
    let requests = requests.lock().unwrap().clone();
    (requests, handle.items())
  }

  #[test]
  fn test_unbounded_demand_is_chunked() {
    let (requests, items) = recorded_requests(4, u64::MAX);
    assert_eq!(items, (0..10).collect::<Vec<_>>());
    assert_eq!(requests, vec![4, 4, 4]);
  }

  #[test]
  fn test_small_demand_is_not_rounded_up() {
    let (requests, items) = recorded_requests(4, 6);
    assert_eq!(items, (0..6).collect::<Vec<_>>());
    assert_eq!(requests, vec![4, 2]);
  }

  #[test]
  fn test_zero_capacity_is_rejected() {
    let consumer = VecConsumer::new();
    let handle = consumer.handle();
    Flow::range(0, 3).capacity(0).subscribe(consumer);
    assert!(matches!(handle.error(), Some(FlowError::Config(_))));
  }

  proptest! {
    #[test]
    fn test_requests_never_exceed_capacity(capacity in 1usize..8, initial in 1u64..40) {
      let (requests, items) = recorded_requests(capacity, initial);
      prop_assert!(requests.iter().all(|n| *n <= capacity as u64));
      prop_assert_eq!(items.len() as u64, initial.min(10));
    }
  }
}
