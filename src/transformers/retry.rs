//! # Retry
//!
//! Resubscribes to the source after an error, as an [`ErrorStrategy`]
//! decides. Items already delivered stay delivered; a new attempt starts the
//! source from scratch, so a cold source replays from its beginning.
//!
//! Demand carries over between attempts: a fresh attempt is requested
//! whatever the downstream has asked for and not yet received.
//!
//! Attempts are started from a trampoline, so a source that fails
//! synchronously on subscribe does not grow the stack with every retry.
//!
//! ## Example
//!
//! ```rust
//! use fluxweave::consumers::VecConsumer;
//! use fluxweave::error::{ErrorStrategy, FlowError};
//! use fluxweave::Flow;
//!
//! let consumer = VecConsumer::new();
//! let handle = consumer.handle();
//! Flow::range(0, 2)
//!   .concat_with(&Flow::error(FlowError::msg("flaky")))
//!   .retry(ErrorStrategy::Retry(1))
//!   .subscribe(consumer);
//! assert_eq!(handle.items(), vec![0, 1, 0, 1]);
//! assert!(handle.error().is_some());
//! ```

use crate::consumer::{BoxConsumer, Consumer, SerializedConsumer};
use crate::demand::Demand;
use crate::error::{ErrorAction, ErrorStrategy, FlowError, ProtocolViolation};
use crate::flow::Flow;
use crate::producer::Producer;
use crate::subscription::{Drain, Subscription, SubscriptionRef, UpstreamSlot};
use crate::sync::lock;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Producer that resubscribes to `source` on failure.
pub struct RetryProducer<T> {
  source: Flow<T>,
  strategy: ErrorStrategy,
}

impl<T> RetryProducer<T> {
  /// Creates the producer.
  pub fn new(source: Flow<T>, strategy: ErrorStrategy) -> Self {
    Self { source, strategy }
  }
}

impl<T: Send + 'static> Producer<T> for RetryProducer<T> {
  fn subscribe(&self, consumer: BoxConsumer<T>) {
    let state = Arc::new(RetryState {
      source: self.source.clone(),
      strategy: self.strategy.clone(),
      downstream: SerializedConsumer::new(consumer),
      current: Mutex::new(Arc::new(UpstreamSlot::new())),
      demand: Demand::new(),
      retries: AtomicUsize::new(0),
      trampoline: Drain::new(),
      cancelled: AtomicBool::new(false),
    });
    state.downstream.subscribe(Arc::new(RetrySubscription {
      state: state.clone(),
    }));
    state.resubscribe();
  }
}

struct RetryState<T> {
  source: Flow<T>,
  strategy: ErrorStrategy,
  downstream: SerializedConsumer<T>,
  current: Mutex<Arc<UpstreamSlot>>,
  demand: Demand,
  retries: AtomicUsize,
  trampoline: Drain,
  cancelled: AtomicBool,
}

impl<T: Send + 'static> RetryState<T> {
  fn resubscribe(self: &Arc<Self>) {
    if !self.trampoline.enter() {
      return;
    }
    let mut missed = 1;
    loop {
      if !self.cancelled.load(Ordering::Acquire) {
        self.attempt();
      }
      missed = self.trampoline.leave(missed);
      if missed == 0 {
        break;
      }
    }
  }

  fn attempt(self: &Arc<Self>) {
    let slot = Arc::new(UpstreamSlot::new());
    let outstanding = {
      let mut current = lock(&self.current);
      *current = slot.clone();
      self.demand.get()
    };
    if self.cancelled.load(Ordering::Acquire) {
      slot.cancel();
      return;
    }
    if outstanding > 0 {
      slot.request(outstanding);
    }
    self.source.subscribe(AttemptConsumer {
      slot,
      state: self.clone(),
    });
  }

  fn cancel_current(&self) {
    let current = lock(&self.current).clone();
    current.cancel();
  }
}

struct RetrySubscription<T> {
  state: Arc<RetryState<T>>,
}

impl<T: Send + 'static> Subscription for RetrySubscription<T> {
  fn request(&self, n: u64) {
    if n == 0 {
      if !self.state.cancelled.swap(true, Ordering::AcqRel) {
        self.state.cancel_current();
        self
          .state
          .downstream
          .error(ProtocolViolation::NonPositiveRequest.into());
      }
      return;
    }
    let slot = {
      let current = lock(&self.state.current);
      self.state.demand.add(n);
      current.clone()
    };
    slot.request(n);
  }

  fn cancel(&self) {
    if !self.state.cancelled.swap(true, Ordering::AcqRel) {
      self.state.cancel_current();
      self.state.downstream.cancel();
    }
  }
}

struct AttemptConsumer<T> {
  slot: Arc<UpstreamSlot>,
  state: Arc<RetryState<T>>,
}

impl<T: Send + 'static> Consumer<T> for AttemptConsumer<T> {
  fn on_subscribe(&mut self, subscription: SubscriptionRef) {
    self.slot.set(subscription);
  }

  fn on_next(&mut self, item: T) {
    self.state.demand.produced(1);
    self.state.downstream.next(item);
  }

  fn on_error(&mut self, error: FlowError) {
    if self.state.cancelled.load(Ordering::Acquire) {
      return;
    }
    let retries = self.state.retries.load(Ordering::Acquire);
    match self.state.strategy.decide(&error, retries) {
      ErrorAction::Retry => {
        self.state.retries.fetch_add(1, Ordering::AcqRel);
        debug!(attempt = retries + 1, %error, "resubscribing after failure");
        self.state.resubscribe();
      }
      ErrorAction::Stop => {
        warn!(retries, %error, "giving up after failure");
        self.state.downstream.error(error);
      }
    }
  }

  fn on_complete(&mut self) {
    self.state.downstream.complete();
  }
}

#[cfg(test)]
mod tests {
  use crate::Flow;
  use crate::consumers::VecConsumer;
  use crate::error::{ErrorAction, ErrorStrategy, FlowError};
  use std::sync::Arc;
  use std::sync::atomic::{AtomicUsize, Ordering};

  fn failing_first(failures: usize) -> Flow<i32> {
    let attempts = Arc::new(AtomicUsize::new(0));
    Flow::defer(move || {
      if attempts.fetch_add(1, Ordering::SeqCst) < failures {
        Flow::range(0, 2).concat_with(&Flow::error(FlowError::msg("flaky")))
      } else {
        Flow::range(0, 2)
      }
    })
  }

  #[test]
  fn test_retry_until_success() {
    let consumer = VecConsumer::new();
    let handle = consumer.handle();
    failing_first(2)
      .retry(ErrorStrategy::Retry(2))
      .subscribe(consumer);
    assert_eq!(handle.items(), vec![0, 1, 0, 1, 0, 1]);
    assert!(handle.is_complete());
  }

  #[test]
  fn test_retry_budget_exhausted() {
    let consumer = VecConsumer::new();
    let handle = consumer.handle();
    failing_first(5)
      .retry(ErrorStrategy::Retry(1))
      .subscribe(consumer);
    assert_eq!(handle.items(), vec![0, 1, 0, 1]);
    assert!(matches!(handle.error(), Some(FlowError::Message(_))));
  }

  #[test]
  fn test_outstanding_demand_carries_over() {
    let consumer = VecConsumer::with_initial_request(3);
    let handle = consumer.handle();
    failing_first(1)
      .retry(ErrorStrategy::RetryForever)
      .subscribe(consumer);
    assert_eq!(handle.items(), vec![0, 1, 0]);
    handle.cancel();
    assert!(!handle.is_terminated());
  }

  #[test]
  fn test_synchronous_failures_do_not_recurse() {
    let consumer = VecConsumer::new();
    let handle = consumer.handle();
    Flow::<i32>::error(FlowError::msg("always"))
      .retry(ErrorStrategy::Retry(50_000))
      .subscribe(consumer);
    assert!(handle.error().is_some());
  }

  #[test]
  fn test_custom_strategy_sees_retry_count() {
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    let consumer = VecConsumer::new();
    let handle = consumer.handle();
    Flow::<i32>::error(FlowError::msg("x"))
      .retry(ErrorStrategy::new_custom(move |_, retries| {
        counter.store(retries, Ordering::SeqCst);
        if retries < 3 {
          ErrorAction::Retry
        } else {
          ErrorAction::Stop
        }
      }))
      .subscribe(consumer);
    assert_eq!(seen.load(Ordering::SeqCst), 3);
    assert!(handle.error().is_some());
  }
}
