//! # Switch Transformer
//!
//! Flattens a flow of flows by always mirroring the most recent inner flow.
//! When a new inner flow arrives the previous one is cancelled, and anything
//! it still emits is dropped.
//!
//! ## Demand
//!
//! The outer flow is requested unbounded. Downstream demand goes to the
//! current inner flow; a freshly attached inner flow is requested whatever
//! demand is still outstanding.
//!
//! ## Termination
//!
//! Completes once the outer flow has completed and the last inner flow has
//! completed. An error from the outer flow or the current inner flow cancels
//! everything and is delivered.

use crate::consumer::{BoxConsumer, Consumer, SerializedConsumer};
use crate::demand::{Demand, UNBOUNDED};
use crate::error::{FlowError, ProtocolViolation};
use crate::flow::Flow;
use crate::subscription::{Subscription, SubscriptionRef, UpstreamSlot};
use crate::sync::lock;
use crate::transformer::Transformer;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::trace;

/// Switches to each new inner flow.
#[derive(Debug, Default, Clone, Copy)]
pub struct SwitchTransformer;

impl SwitchTransformer {
  /// Creates the transformer.
  pub fn new() -> Self {
    Self
  }
}

impl<T: Send + 'static> Transformer<Flow<T>, T> for SwitchTransformer {
  fn apply(&self, downstream: BoxConsumer<T>) -> BoxConsumer<Flow<T>> {
    Box::new(OuterConsumer {
      state: Arc::new(SwitchState {
        downstream: SerializedConsumer::new(downstream),
        outer: UpstreamSlot::new(),
        active: Mutex::new(Active {
          generation: 0,
          slot: None,
          outer_done: false,
        }),
        demand: Demand::new(),
        finished: AtomicBool::new(false),
      }),
    })
  }

  fn name(&self) -> &str {
    "switch_on_next"
  }
}

struct Active {
  generation: u64,
  slot: Option<Arc<UpstreamSlot>>,
  outer_done: bool,
}

struct SwitchState<T> {
  downstream: SerializedConsumer<T>,
  outer: UpstreamSlot,
  active: Mutex<Active>,
  demand: Demand,
  finished: AtomicBool,
}

impl<T: Send + 'static> SwitchState<T> {
  fn fail(&self, error: FlowError) {
    if self.finished.swap(true, Ordering::AcqRel) {
      return;
    }
    self.cancel_upstreams();
    self.downstream.error(error);
  }

  fn complete(&self) {
    if !self.finished.swap(true, Ordering::AcqRel) {
      self.downstream.complete();
    }
  }

  fn cancel_upstreams(&self) {
    self.outer.cancel();
    let current = lock(&self.active).slot.take();
    if let Some(slot) = current {
      slot.cancel();
    }
  }
}

struct SwitchSubscription<T> {
  state: Arc<SwitchState<T>>,
}

impl<T: Send + 'static> Subscription for SwitchSubscription<T> {
  fn request(&self, n: u64) {
    if n == 0 {
      self.state.fail(ProtocolViolation::NonPositiveRequest.into());
      return;
    }
    let current = {
      let active = lock(&self.state.active);
      self.state.demand.add(n);
      active.slot.clone()
    };
    if let Some(slot) = current {
      slot.request(n);
    }
  }

  fn cancel(&self) {
    if !self.state.finished.swap(true, Ordering::AcqRel) {
      self.state.cancel_upstreams();
      self.state.downstream.cancel();
    }
  }
}

struct OuterConsumer<T> {
  state: Arc<SwitchState<T>>,
}

impl<T: Send + 'static> Consumer<Flow<T>> for OuterConsumer<T> {
  fn on_subscribe(&mut self, subscription: SubscriptionRef) {
    self.state.outer.set(subscription);
    self.state.downstream.subscribe(Arc::new(SwitchSubscription {
      state: self.state.clone(),
    }));
    self.state.outer.request(UNBOUNDED);
  }

  fn on_next(&mut self, flow: Flow<T>) {
    if self.state.finished.load(Ordering::Acquire) {
      return;
    }
    let slot = Arc::new(UpstreamSlot::new());
    let (generation, previous, outstanding) = {
      let mut active = lock(&self.state.active);
      active.generation += 1;
      let previous = active.slot.replace(slot.clone());
      (active.generation, previous, self.state.demand.get())
    };
    if let Some(previous) = previous {
      trace!(generation, "switching to newer inner flow");
      previous.cancel();
    }
    if outstanding > 0 {
      slot.request(outstanding);
    }
    flow.subscribe(InnerConsumer {
      generation,
      slot,
      state: self.state.clone(),
    });
  }

  fn on_error(&mut self, error: FlowError) {
    self.state.fail(error);
  }

  fn on_complete(&mut self) {
    let idle = {
      let mut active = lock(&self.state.active);
      active.outer_done = true;
      active.slot.is_none()
    };
    if idle {
      self.state.complete();
    }
  }
}

struct InnerConsumer<T> {
  generation: u64,
  slot: Arc<UpstreamSlot>,
  state: Arc<SwitchState<T>>,
}

impl<T: Send + 'static> InnerConsumer<T> {
  fn is_current(&self) -> bool {
    lock(&self.state.active).generation == self.generation
  }
}

impl<T: Send + 'static> Consumer<T> for InnerConsumer<T> {
  fn on_subscribe(&mut self, subscription: SubscriptionRef) {
    self.slot.set(subscription);
  }

  fn on_next(&mut self, item: T) {
    let pushed = {
      let active = lock(&self.state.active);
      if active.generation != self.generation {
        false
      } else {
        self.state.demand.produced(1);
        self.state.downstream.push_next(item)
      }
    };
    if pushed {
      self.state.downstream.drain();
    }
  }

  fn on_error(&mut self, error: FlowError) {
    if self.is_current() {
      self.state.fail(error);
    }
  }

  fn on_complete(&mut self) {
    let finished = {
      let mut active = lock(&self.state.active);
      if active.generation != self.generation {
        return;
      }
      active.slot = None;
      active.outer_done
    };
    if finished {
      self.state.complete();
    }
  }
}

#[cfg(test)]
mod tests {
  use crate::Flow;
  use crate::consumers::VecConsumer;
  use crate::error::FlowError;
  use crate::hub::{Hub, HubConfig};

  fn hub<T: Clone + Send + Sync + 'static>() -> Hub<T> {
    Hub::new(HubConfig::default()).unwrap()
  }

  #[test]
  fn test_switches_to_latest_inner() {
    let outer: Hub<Flow<i32>> = hub();
    let a: Hub<i32> = hub();
    let b: Hub<i32> = hub();
    let consumer = VecConsumer::new();
    let handle = consumer.handle();
    outer.flow().switch_on_next().subscribe(consumer);
    outer.on_next(a.flow());
    a.on_next(1);
    outer.on_next(b.flow());
    assert_eq!(a.subscriber_count(), 0);
    a.on_next(2);
    b.on_next(3);
    outer.on_complete();
    assert!(!handle.is_complete());
    b.on_complete();
    assert_eq!(handle.items(), vec![1, 3]);
    assert!(handle.is_complete());
  }

  #[test]
  fn test_outstanding_demand_moves_to_new_inner() {
    let outer: Hub<Flow<i32>> = hub();
    let consumer = VecConsumer::with_initial_request(3);
    let handle = consumer.handle();
    outer.flow().switch_on_next().subscribe(consumer);
    outer.on_next(Flow::range(0, 2));
    outer.on_next(Flow::range(10, 5));
    assert_eq!(handle.items(), vec![0, 1, 10]);
  }

  #[test]
  fn test_inner_error_cancels_outer() {
    let outer: Hub<Flow<i32>> = hub();
    let consumer = VecConsumer::new();
    let handle = consumer.handle();
    outer.flow().switch_on_next().subscribe(consumer);
    outer.on_next(Flow::error(FlowError::msg("inner")));
    assert!(handle.error().is_some());
    assert_eq!(outer.subscriber_count(), 0);
  }
}
