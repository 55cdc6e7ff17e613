//! Take transformer.
//!
//! Forwards the first `n` items, then cancels upstream and completes. Requests
//! are capped so that no more than `n` items are ever asked of the source.

use crate::consumer::{BoxConsumer, Consumer};
use crate::error::FlowError;
use crate::subscription::{Subscription, SubscriptionRef, noop};
use crate::transformer::Transformer;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Limits a flow to its first `limit` items.
#[derive(Debug, Clone, Copy)]
pub struct TakeTransformer {
  limit: u64,
}

impl TakeTransformer {
  /// Creates a transformer forwarding at most `limit` items.
  pub fn new(limit: u64) -> Self {
    Self { limit }
  }
}

impl<T: Send + 'static> Transformer<T, T> for TakeTransformer {
  fn apply(&self, downstream: BoxConsumer<T>) -> BoxConsumer<T> {
    Box::new(TakeConsumer {
      downstream,
      limit: self.limit,
      received: 0,
      upstream: None,
      done: false,
    })
  }

  fn name(&self) -> &str {
    "take"
  }
}

struct TakeSubscription {
  upstream: SubscriptionRef,
  unrequested: AtomicU64,
}

impl Subscription for TakeSubscription {
  fn request(&self, n: u64) {
    if n == 0 {
      self.upstream.request(0);
      return;
    }
    let mut current = self.unrequested.load(Ordering::Acquire);
    loop {
      if current == 0 {
        return;
      }
      let granted = n.min(current);
      match self.unrequested.compare_exchange_weak(
        current,
        current - granted,
        Ordering::AcqRel,
        Ordering::Acquire,
      ) {
        Ok(_) => {
          self.upstream.request(granted);
          return;
        }
        Err(actual) => current = actual,
      }
    }
  }

  fn cancel(&self) {
    self.upstream.cancel();
  }
}

struct TakeConsumer<T> {
  downstream: BoxConsumer<T>,
  limit: u64,
  received: u64,
  upstream: Option<SubscriptionRef>,
  done: bool,
}

impl<T: Send + 'static> Consumer<T> for TakeConsumer<T> {
  fn on_subscribe(&mut self, subscription: SubscriptionRef) {
    if self.limit == 0 {
      subscription.cancel();
      self.done = true;
      self.downstream.on_subscribe(noop());
      self.downstream.on_complete();
      return;
    }
    self.upstream = Some(subscription.clone());
    self.downstream.on_subscribe(Arc::new(TakeSubscription {
      upstream: subscription,
      unrequested: AtomicU64::new(self.limit),
    }));
  }

  fn on_next(&mut self, item: T) {
    if self.done {
      return;
    }
    self.received += 1;
    self.downstream.on_next(item);
    if self.received >= self.limit {
      self.done = true;
      if let Some(upstream) = self.upstream.take() {
        upstream.cancel();
      }
      self.downstream.on_complete();
    }
  }

  fn on_error(&mut self, error: FlowError) {
    if !self.done {
      self.done = true;
      self.downstream.on_error(error);
    }
  }

  fn on_complete(&mut self) {
    if !self.done {
      self.done = true;
      self.downstream.on_complete();
    }
  }
}
