//! Error fallback (`on_error_resume`, `on_error_return`, `switch_on_error`).
//!
//! When the upstream fails, the error is handed to a function that returns a
//! fallback flow, and the downstream continues on that flow. The downstream
//! keeps the same subscription throughout; demand it had outstanding at the
//! time of the failure is requested from the fallback.
//!
//! Protocol violations are never resumed: they are delivered as they are.
//! An error from the fallback itself is delivered too.

use crate::consumer::{BoxConsumer, Consumer};
use crate::demand::Demand;
use crate::error::FlowError;
use crate::flow::Flow;
use crate::subscription::{Subscription, SubscriptionRef, UpstreamSlot};
use crate::sync::lock;
use crate::transformer::Transformer;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Continues on a fallback flow after an error.
pub struct ResumeTransformer<F> {
  fallback: Arc<F>,
}

impl<F> ResumeTransformer<F> {
  /// Creates the transformer.
  pub fn new(fallback: F) -> Self {
    Self {
      fallback: Arc::new(fallback),
    }
  }
}

impl<T, F> Transformer<T, T> for ResumeTransformer<F>
where
  T: Send + 'static,
  F: Fn(FlowError) -> Flow<T> + Send + Sync + 'static,
{
  fn apply(&self, downstream: BoxConsumer<T>) -> BoxConsumer<T> {
    Box::new(PrimaryConsumer {
      downstream: Some(downstream),
      fallback: self.fallback.clone(),
      shared: Arc::new(Shared {
        current: Mutex::new(Arc::new(UpstreamSlot::new())),
        demand: Demand::new(),
        cancelled: AtomicBool::new(false),
      }),
    })
  }

  fn name(&self) -> &str {
    "on_error_resume"
  }
}

struct Shared {
  current: Mutex<Arc<UpstreamSlot>>,
  demand: Demand,
  cancelled: AtomicBool,
}

impl Shared {
  fn current(&self) -> Arc<UpstreamSlot> {
    lock(&self.current).clone()
  }

  /// Installs a fresh slot and returns it with the demand it inherits.
  fn switch(&self) -> (Arc<UpstreamSlot>, u64) {
    let slot = Arc::new(UpstreamSlot::new());
    let outstanding = {
      let mut current = lock(&self.current);
      *current = slot.clone();
      self.demand.get()
    };
    if self.cancelled.load(Ordering::Acquire) {
      slot.cancel();
    }
    (slot, outstanding)
  }
}

impl Subscription for Shared {
  fn request(&self, n: u64) {
    if n == 0 {
      self.current().request(0);
      return;
    }
    let slot = {
      let current = lock(&self.current);
      self.demand.add(n);
      current.clone()
    };
    slot.request(n);
  }

  fn cancel(&self) {
    if !self.cancelled.swap(true, Ordering::AcqRel) {
      self.current().cancel();
    }
  }
}

struct PrimaryConsumer<T, F> {
  downstream: Option<BoxConsumer<T>>,
  fallback: Arc<F>,
  shared: Arc<Shared>,
}

impl<T, F> Consumer<T> for PrimaryConsumer<T, F>
where
  T: Send + 'static,
  F: Fn(FlowError) -> Flow<T> + Send + Sync + 'static,
{
  fn on_subscribe(&mut self, subscription: SubscriptionRef) {
    self.shared.current().set(subscription);
    if let Some(downstream) = self.downstream.as_mut() {
      downstream.on_subscribe(self.shared.clone());
    }
  }

  fn on_next(&mut self, item: T) {
    self.shared.demand.produced(1);
    if let Some(downstream) = self.downstream.as_mut() {
      downstream.on_next(item);
    }
  }

  fn on_error(&mut self, error: FlowError) {
    let Some(mut downstream) = self.downstream.take() else {
      return;
    };
    if error.is_protocol_violation() || self.shared.cancelled.load(Ordering::Acquire) {
      downstream.on_error(error);
      return;
    }
    debug!(%error, "switching to fallback flow");
    let flow = (self.fallback)(error);
    let (slot, outstanding) = self.shared.switch();
    if outstanding > 0 {
      slot.request(outstanding);
    }
    flow.subscribe(FallbackConsumer {
      downstream,
      slot,
      shared: self.shared.clone(),
    });
  }

  fn on_complete(&mut self) {
    if let Some(mut downstream) = self.downstream.take() {
      downstream.on_complete();
    }
  }
}

struct FallbackConsumer<T> {
  downstream: BoxConsumer<T>,
  slot: Arc<UpstreamSlot>,
  shared: Arc<Shared>,
}

impl<T: Send + 'static> Consumer<T> for FallbackConsumer<T> {
  fn on_subscribe(&mut self, subscription: SubscriptionRef) {
    self.slot.set(subscription);
  }

  fn on_next(&mut self, item: T) {
    self.shared.demand.produced(1);
    self.downstream.on_next(item);
  }

  fn on_error(&mut self, error: FlowError) {
    self.downstream.on_error(error);
  }

  fn on_complete(&mut self) {
    self.downstream.on_complete();
  }
}
