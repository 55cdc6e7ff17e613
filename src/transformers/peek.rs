//! Side-effect hooks (`do_on_*`).
//!
//! [`PeekTransformer`] runs user callbacks as signals pass downstream and as
//! requests and cancels pass upstream, without changing the flow.

use crate::consumer::{BoxConsumer, Consumer};
use crate::error::FlowError;
use crate::subscription::{Subscription, SubscriptionRef};
use crate::transformer::Transformer;
use std::sync::Arc;

type Hook = Arc<dyn Fn() + Send + Sync>;
type ItemHook<T> = Arc<dyn Fn(&T) + Send + Sync>;
type ErrorHook = Arc<dyn Fn(&FlowError) + Send + Sync>;
type RequestHook = Arc<dyn Fn(u64) + Send + Sync>;

/// Set of callbacks run by a [`PeekTransformer`].
pub struct PeekHooks<T> {
  on_subscribe: Option<Hook>,
  on_next: Option<ItemHook<T>>,
  on_error: Option<ErrorHook>,
  on_complete: Option<Hook>,
  on_terminate: Option<Hook>,
  on_cancel: Option<Hook>,
  on_request: Option<RequestHook>,
}

impl<T> Default for PeekHooks<T> {
  fn default() -> Self {
    Self {
      on_subscribe: None,
      on_next: None,
      on_error: None,
      on_complete: None,
      on_terminate: None,
      on_cancel: None,
      on_request: None,
    }
  }
}

impl<T> Clone for PeekHooks<T> {
  fn clone(&self) -> Self {
    Self {
      on_subscribe: self.on_subscribe.clone(),
      on_next: self.on_next.clone(),
      on_error: self.on_error.clone(),
      on_complete: self.on_complete.clone(),
      on_terminate: self.on_terminate.clone(),
      on_cancel: self.on_cancel.clone(),
      on_request: self.on_request.clone(),
    }
  }
}

impl<T> PeekHooks<T> {
  /// Runs `f` when the downstream attaches.
  pub fn on_subscribe(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
    self.on_subscribe = Some(Arc::new(f));
    self
  }

  /// Runs `f` on every item before it is forwarded.
  pub fn on_next(mut self, f: impl Fn(&T) + Send + Sync + 'static) -> Self {
    self.on_next = Some(Arc::new(f));
    self
  }

  /// Runs `f` on the error before it is forwarded.
  pub fn on_error(mut self, f: impl Fn(&FlowError) + Send + Sync + 'static) -> Self {
    self.on_error = Some(Arc::new(f));
    self
  }

  /// Runs `f` before completion is forwarded.
  pub fn on_complete(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
    self.on_complete = Some(Arc::new(f));
    self
  }

  /// Runs `f` before either terminal signal is forwarded.
  pub fn on_terminate(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
    self.on_terminate = Some(Arc::new(f));
    self
  }

  /// Runs `f` when the downstream cancels.
  pub fn on_cancel(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
    self.on_cancel = Some(Arc::new(f));
    self
  }

  /// Runs `f` with every demand sent upstream.
  pub fn on_request(mut self, f: impl Fn(u64) + Send + Sync + 'static) -> Self {
    self.on_request = Some(Arc::new(f));
    self
  }
}

/// Runs [`PeekHooks`] around a flow.
pub struct PeekTransformer<T> {
  hooks: PeekHooks<T>,
}

impl<T> PeekTransformer<T> {
  /// Creates a transformer running `hooks`.
  pub fn new(hooks: PeekHooks<T>) -> Self {
    Self { hooks }
  }
}

impl<T: Send + 'static> Transformer<T, T> for PeekTransformer<T> {
  fn apply(&self, downstream: BoxConsumer<T>) -> BoxConsumer<T> {
    Box::new(PeekConsumer {
      downstream,
      hooks: self.hooks.clone(),
    })
  }

  fn name(&self) -> &str {
    "peek"
  }
}

struct PeekSubscription {
  upstream: SubscriptionRef,
  on_request: Option<RequestHook>,
  on_cancel: Option<Hook>,
}

impl Subscription for PeekSubscription {
  fn request(&self, n: u64) {
    if let Some(hook) = &self.on_request {
      hook(n);
    }
    self.upstream.request(n);
  }

  fn cancel(&self) {
    if let Some(hook) = &self.on_cancel {
      hook();
    }
    self.upstream.cancel();
  }
}

struct PeekConsumer<T> {
  downstream: BoxConsumer<T>,
  hooks: PeekHooks<T>,
}

impl<T: Send + 'static> Consumer<T> for PeekConsumer<T> {
  fn on_subscribe(&mut self, subscription: SubscriptionRef) {
    if let Some(hook) = &self.hooks.on_subscribe {
      hook();
    }
    let subscription: SubscriptionRef =
      if self.hooks.on_request.is_some() || self.hooks.on_cancel.is_some() {
        Arc::new(PeekSubscription {
          upstream: subscription,
          on_request: self.hooks.on_request.clone(),
          on_cancel: self.hooks.on_cancel.clone(),
        })
      } else {
        subscription
      };
    self.downstream.on_subscribe(subscription);
  }

  fn on_next(&mut self, item: T) {
    if let Some(hook) = &self.hooks.on_next {
      hook(&item);
    }
    self.downstream.on_next(item);
  }

  fn on_error(&mut self, error: FlowError) {
    if let Some(hook) = &self.hooks.on_error {
      hook(&error);
    }
    if let Some(hook) = &self.hooks.on_terminate {
      hook();
    }
    self.downstream.on_error(error);
  }

  fn on_complete(&mut self) {
    if let Some(hook) = &self.hooks.on_complete {
      hook();
    }
    if let Some(hook) = &self.hooks.on_terminate {
      hook();
    }
    self.downstream.on_complete();
  }
}

#[cfg(test)]
mod tests {
  use crate::Flow;
  use crate::consumers::VecConsumer;
  use crate::error::FlowError;
  use std::sync::{Arc, Mutex};

  fn log() -> Arc<Mutex<Vec<String>>> {
    Arc::new(Mutex::new(Vec::new()))
  }

  #[test]
  fn test_hooks_fire_in_order() {
    let events = log();
    let (a, b, c, d, e) = (
      events.clone(),
      events.clone(),
      events.clone(),
      events.clone(),
      events.clone(),
    );
    let consumer = VecConsumer::new();
    Flow::range(0, 2)
      .do_on_request(move |n| a.lock().unwrap().push(format!("request {n}")))
      .do_on_subscribe(move || b.lock().unwrap().push("subscribe".into()))
      .do_on_next(move |x| c.lock().unwrap().push(format!("next {x}")))
      .do_on_complete(move || d.lock().unwrap().push("complete".into()))
      .do_on_terminate(move || e.lock().unwrap().push("terminate".into()))
      .subscribe(consumer);
    assert_eq!(
      *events.lock().unwrap(),
      vec![
        "subscribe".to_string(),
        format!("request {}", u64::MAX),
        "next 0".into(),
        "next 1".into(),
        "complete".into(),
        "terminate".into(),
      ]
    );
  }

  #[test]
  fn test_do_on_error_sees_error() {
    let events = log();
    let seen = events.clone();
    let consumer = VecConsumer::new();
    let handle = consumer.handle();
    Flow::<i32>::error(FlowError::msg("x"))
      .do_on_error(move |e| seen.lock().unwrap().push(e.to_string()))
      .subscribe(consumer);
    assert_eq!(*events.lock().unwrap(), vec!["source failure: x"]);
    assert!(handle.error().is_some());
  }

  #[test]
  fn test_do_on_cancel() {
    let events = log();
    let seen = events.clone();
    let consumer = VecConsumer::with_initial_request(1);
    let handle = consumer.handle();
    Flow::range(0, 10)
      .do_on_cancel(move || seen.lock().unwrap().push("cancel".into()))
      .subscribe(consumer);
    handle.cancel();
    handle.cancel();
    assert_eq!(*events.lock().unwrap(), vec!["cancel"]);
  }
}
