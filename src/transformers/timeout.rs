//! # Timeout Transformer
//!
//! Fails the flow with [`FlowError::Timeout`] when no signal arrives within
//! the configured duration of subscription or of the previous item.
//!
//! Each item moves the flow to a new index and arms a check for that index on
//! the scheduler. A check that still finds its own index when it fires wins
//! the race, cancels the upstream and delivers the timeout. A terminal signal
//! or a cancel parks the index at a sentinel so that no check can win.
//!
//! A scheduler that cannot delay work (such as
//! [`crate::scheduler::ImmediateScheduler`]) fails the flow with its error.

use crate::consumer::{BoxConsumer, Consumer, SerializedConsumer};
use crate::error::FlowError;
use crate::scheduler::SchedulerRef;
use crate::subscription::{Subscription, SubscriptionRef, UpstreamSlot};
use crate::transformer::Transformer;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

const STOPPED: u64 = u64::MAX;

/// Fails a flow that goes quiet for too long.
#[derive(Clone)]
pub struct TimeoutTransformer {
  duration: Duration,
  scheduler: SchedulerRef,
}

impl TimeoutTransformer {
  /// Creates the transformer.
  pub fn new(duration: Duration, scheduler: SchedulerRef) -> Self {
    Self {
      duration,
      scheduler,
    }
  }
}

impl<T: Send + 'static> Transformer<T, T> for TimeoutTransformer {
  fn apply(&self, downstream: BoxConsumer<T>) -> BoxConsumer<T> {
    Box::new(TimeoutConsumer {
      state: Arc::new(TimeoutState {
        duration: self.duration,
        scheduler: self.scheduler.clone(),
        downstream: SerializedConsumer::new(downstream),
        upstream: UpstreamSlot::new(),
        index: AtomicU64::new(0),
      }),
    })
  }

  fn name(&self) -> &str {
    "timeout"
  }
}

struct TimeoutState<T> {
  duration: Duration,
  scheduler: SchedulerRef,
  downstream: SerializedConsumer<T>,
  upstream: UpstreamSlot,
  index: AtomicU64,
}

impl<T: Send + 'static> TimeoutState<T> {
  fn arm(self: &Arc<Self>, index: u64) {
    let state = self.clone();
    let armed = self.scheduler.schedule_after(
      self.duration,
      Box::new(move || state.expire(index, FlowError::Timeout(state.duration))),
    );
    if let Err(error) = armed {
      debug!(%error, "timeout check could not be scheduled");
      let current = self.index.load(Ordering::Acquire);
      self.expire(current, error);
    }
  }

  fn expire(&self, index: u64, error: FlowError) {
    if index != STOPPED
      && self
      .index
      .compare_exchange(index, STOPPED, Ordering::AcqRel, Ordering::Acquire)
      .is_ok()
    {
      debug!(%error, "timing out");
      self.upstream.cancel();
      self.downstream.error(error);
    }
  }

  /// Parks the index. Returns `false` if it was already parked.
  fn stop(&self) -> bool {
    self.index.swap(STOPPED, Ordering::AcqRel) != STOPPED
  }
}

struct TimeoutSubscription<T> {
  state: Arc<TimeoutState<T>>,
}

impl<T: Send + 'static> Subscription for TimeoutSubscription<T> {
  fn request(&self, n: u64) {
    self.state.upstream.request(n);
  }

  fn cancel(&self) {
    if self.state.stop() {
      self.state.upstream.cancel();
      self.state.downstream.cancel();
    }
  }
}

struct TimeoutConsumer<T> {
  state: Arc<TimeoutState<T>>,
}

impl<T: Send + 'static> Consumer<T> for TimeoutConsumer<T> {
  fn on_subscribe(&mut self, subscription: SubscriptionRef) {
    self.state.upstream.set(subscription);
    self.state.downstream.subscribe(Arc::new(TimeoutSubscription {
      state: self.state.clone(),
    }));
    self.state.arm(0);
  }

  fn on_next(&mut self, item: T) {
    let index = self.state.index.load(Ordering::Acquire);
    if index == STOPPED
      || self
        .state
        .index
        .compare_exchange(index, index + 1, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
      return;
    }
    self.state.downstream.next(item);
    self.state.arm(index + 1);
  }

  fn on_error(&mut self, error: FlowError) {
    if self.state.stop() {
      self.state.downstream.error(error);
    }
  }

  fn on_complete(&mut self) {
    if self.state.stop() {
      self.state.downstream.complete();
    }
  }
}
