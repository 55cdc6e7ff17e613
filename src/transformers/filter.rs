//! Filter transformer.
//!
//! Forwards only the items matching a predicate. Every dropped item is
//! replaced by a `request(1)` upstream, so a downstream request is never left
//! waiting on items the filter swallowed. A panicking predicate cancels
//! upstream and ends the flow with [`FlowError::Panicked`].

use crate::consumer::{BoxConsumer, Consumer};
use crate::error::FlowError;
use crate::subscription::SubscriptionRef;
use crate::transformer::Transformer;
use crate::transformers::map::fail_upstream;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use tracing::trace;

/// Keeps the items for which the predicate returns `true`.
pub struct FilterTransformer<F> {
  predicate: Arc<F>,
}

impl<F> FilterTransformer<F> {
  /// Creates a transformer keeping items matching `predicate`.
  pub fn new(predicate: F) -> Self {
    Self {
      predicate: Arc::new(predicate),
    }
  }
}

impl<T, F> Transformer<T, T> for FilterTransformer<F>
where
  T: Send + 'static,
  F: Fn(&T) -> bool + Send + Sync + 'static,
{
  fn apply(&self, downstream: BoxConsumer<T>) -> BoxConsumer<T> {
    Box::new(FilterConsumer {
      downstream,
      predicate: self.predicate.clone(),
      upstream: None,
      done: false,
    })
  }

  fn name(&self) -> &str {
    "filter"
  }
}

struct FilterConsumer<T, F> {
  downstream: BoxConsumer<T>,
  predicate: Arc<F>,
  upstream: Option<SubscriptionRef>,
  done: bool,
}

impl<T, F> Consumer<T> for FilterConsumer<T, F>
where
  T: Send + 'static,
  F: Fn(&T) -> bool + Send + Sync + 'static,
{
  fn on_subscribe(&mut self, subscription: SubscriptionRef) {
    self.upstream = Some(subscription.clone());
    self.downstream.on_subscribe(subscription);
  }

  fn on_next(&mut self, item: T) {
    if self.done {
      return;
    }
    let predicate = &self.predicate;
    match catch_unwind(AssertUnwindSafe(|| predicate(&item))) {
      Ok(true) => self.downstream.on_next(item),
      Ok(false) => {
        if let Some(upstream) = &self.upstream {
          trace!("filtered, requesting replacement");
          upstream.request(1);
        }
      }
      Err(panic) => {
        self.done = true;
        fail_upstream(&mut self.upstream, &mut self.downstream, FlowError::from_panic(panic));
      }
    }
  }

  fn on_error(&mut self, error: FlowError) {
    if !self.done {
      self.done = true;
      self.upstream = None;
      self.downstream.on_error(error);
    }
  }

  fn on_complete(&mut self) {
    if !self.done {
      self.done = true;
      self.upstream = None;
      self.downstream.on_complete();
    }
  }
}

#[cfg(test)]
mod tests {
  use crate::Flow;
  use crate::consumers::VecConsumer;
  use crate::error::FlowError;
  use proptest::prelude::*;

  #[test]
  fn test_filter_does_not_stall() {
    let consumer = VecConsumer::with_initial_request(2);
    let handle = consumer.handle();
    Flow::range(0, 100).filter(|x| x % 10 == 0).subscribe(consumer);
    assert_eq!(handle.items(), vec![0, 10]);
    handle.request(1);
    assert_eq!(handle.items(), vec![0, 10, 20]);
  }

  #[test]
  fn test_panicking_predicate_fails_the_flow() {
    let consumer = VecConsumer::new();
    let handle = consumer.handle();
    Flow::range(0, 10)
      .filter(|x| {
        assert!(*x < 4, "predicate rejected {x}");
        x % 2 == 0
      })
      .subscribe(consumer);
    assert_eq!(handle.items(), vec![0, 2]);
    assert!(matches!(handle.error(), Some(FlowError::Panicked(m)) if m.contains("rejected 4")));
  }

  proptest! {
    #[test]
    fn test_filter_never_over_delivers(requested in 1u64..20, modulo in 1i32..5) {
      let consumer = VecConsumer::with_initial_request(requested);
      let handle = consumer.handle();
      Flow::range(0, 200).filter(move |x| x % modulo == 0).subscribe(consumer);
      prop_assert!(handle.len() as u64 <= requested);
      let expected: Vec<i32> = (0..200).filter(|x| x % modulo == 0).take(requested as usize).collect();
      prop_assert_eq!(handle.items(), expected);
    }
  }
}
