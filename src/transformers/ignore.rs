//! Ignore-elements transformer: drops every item and keeps only the terminal
//! signal. Upstream is requested unbounded since nothing reaches the
//! downstream to pace it.

use crate::consumer::{BoxConsumer, Consumer};
use crate::demand::UNBOUNDED;
use crate::error::FlowError;
use crate::subscription::{Subscription, SubscriptionRef};
use crate::transformer::Transformer;
use std::sync::Arc;

/// Drops every item.
#[derive(Debug, Default, Clone, Copy)]
pub struct IgnoreElementsTransformer;

impl IgnoreElementsTransformer {
  /// Creates the transformer.
  pub fn new() -> Self {
    Self
  }
}

impl<T: Send + 'static> Transformer<T, T> for IgnoreElementsTransformer {
  fn apply(&self, downstream: BoxConsumer<T>) -> BoxConsumer<T> {
    Box::new(IgnoreConsumer { downstream })
  }

  fn name(&self) -> &str {
    "ignore_elements"
  }
}

struct CancelOnly(SubscriptionRef);

impl Subscription for CancelOnly {
  fn request(&self, _n: u64) {}

  fn cancel(&self) {
    self.0.cancel();
  }
}

struct IgnoreConsumer<T> {
  downstream: BoxConsumer<T>,
}

impl<T: Send + 'static> Consumer<T> for IgnoreConsumer<T> {
  fn on_subscribe(&mut self, subscription: SubscriptionRef) {
    self
      .downstream
      .on_subscribe(Arc::new(CancelOnly(subscription.clone())));
    subscription.request(UNBOUNDED);
  }

  fn on_next(&mut self, _item: T) {}

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

  #[test]
  fn test_only_terminal_reaches_downstream() {
    let consumer = VecConsumer::with_initial_request(0);
    let handle = consumer.handle();
    Flow::range(0, 50).ignore_elements().subscribe(consumer);
    assert!(handle.is_empty());
    assert!(handle.is_complete());
  }
}
