//! Map transformers.
//!
//! [`MapTransformer`] applies a function to each item, one output per input.
//! [`TryMapTransformer`] does the same with a fallible function: the first
//! `Err` cancels upstream and becomes the flow's error.
//!
//! Both pass demand through unchanged: the downstream receives the upstream
//! subscription itself. A panic inside the function is treated like an
//! `Err`: upstream is cancelled and the downstream sees
//! [`FlowError::Panicked`].

use crate::consumer::{BoxConsumer, Consumer};
use crate::error::FlowError;
use crate::subscription::SubscriptionRef;
use crate::transformer::Transformer;
use std::marker::PhantomData;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

/// Applies a function to each item.
pub struct MapTransformer<F> {
  f: Arc<F>,
}

impl<F> MapTransformer<F> {
  /// Creates a transformer applying `f`.
  pub fn new(f: F) -> Self {
    Self { f: Arc::new(f) }
  }
}

impl<I, O, F> Transformer<I, O> for MapTransformer<F>
where
  I: Send + 'static,
  O: Send + 'static,
  F: Fn(I) -> O + Send + Sync + 'static,
{
  fn apply(&self, downstream: BoxConsumer<O>) -> BoxConsumer<I> {
    Box::new(MapConsumer {
      downstream,
      f: self.f.clone(),
      upstream: None,
      done: false,
      _input: PhantomData,
    })
  }

  fn name(&self) -> &str {
    "map"
  }
}

struct MapConsumer<I, O, F> {
  downstream: BoxConsumer<O>,
  f: Arc<F>,
  upstream: Option<SubscriptionRef>,
  done: bool,
  _input: PhantomData<fn(I)>,
}

impl<I, O, F> Consumer<I> for MapConsumer<I, O, F>
where
  I: Send + 'static,
  O: Send + 'static,
  F: Fn(I) -> O + Send + Sync + 'static,
{
  fn on_subscribe(&mut self, subscription: SubscriptionRef) {
    self.upstream = Some(subscription.clone());
    self.downstream.on_subscribe(subscription);
  }

  fn on_next(&mut self, item: I) {
    if self.done {
      return;
    }
    let f = &self.f;
    match catch_unwind(AssertUnwindSafe(|| f(item))) {
      Ok(value) => self.downstream.on_next(value),
      Err(panic) => {
        self.done = true;
        fail_upstream(&mut self.upstream, &mut self.downstream, FlowError::from_panic(panic));
      }
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

/// Cancels `upstream` and delivers `error` downstream.
pub(crate) fn fail_upstream<O: 'static>(
  upstream: &mut Option<SubscriptionRef>,
  downstream: &mut BoxConsumer<O>,
  error: FlowError,
) {
  if let Some(upstream) = upstream.take() {
    upstream.cancel();
  }
  downstream.on_error(error);
}

/// Applies a fallible function to each item.
pub struct TryMapTransformer<F> {
  f: Arc<F>,
}

impl<F> TryMapTransformer<F> {
  /// Creates a transformer applying `f`.
  pub fn new(f: F) -> Self {
    Self { f: Arc::new(f) }
  }
}

impl<I, O, F> Transformer<I, O> for TryMapTransformer<F>
where
  I: Send + 'static,
  O: Send + 'static,
  F: Fn(I) -> Result<O, FlowError> + Send + Sync + 'static,
{
  fn apply(&self, downstream: BoxConsumer<O>) -> BoxConsumer<I> {
    Box::new(TryMapConsumer {
      downstream,
      f: self.f.clone(),
      upstream: None,
      done: false,
      _input: PhantomData,
    })
  }

  fn name(&self) -> &str {
    "try_map"
  }
}

struct TryMapConsumer<I, O, F> {
  downstream: BoxConsumer<O>,
  f: Arc<F>,
  upstream: Option<SubscriptionRef>,
  done: bool,
  _input: PhantomData<fn(I)>,
}

impl<I, O, F> Consumer<I> for TryMapConsumer<I, O, F>
where
  I: Send + 'static,
  O: Send + 'static,
  F: Fn(I) -> Result<O, FlowError> + Send + Sync + 'static,
{
  fn on_subscribe(&mut self, subscription: SubscriptionRef) {
    self.upstream = Some(subscription.clone());
    self.downstream.on_subscribe(subscription);
  }

  fn on_next(&mut self, item: I) {
    if self.done {
      return;
    }
    let f = &self.f;
    let result = catch_unwind(AssertUnwindSafe(|| f(item)))
      .unwrap_or_else(|panic| Err(FlowError::from_panic(panic)));
    match result {
      Ok(value) => self.downstream.on_next(value),
      Err(error) => {
        self.done = true;
        fail_upstream(&mut self.upstream, &mut self.downstream, error);
      }
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

#[cfg(test)]
mod tests {
  use crate::Flow;
  use crate::consumers::VecConsumer;
  use crate::error::FlowError;
  use std::sync::Arc;
  use std::sync::atomic::{AtomicBool, Ordering};

  #[test]
  fn test_map_changes_type() {
    let consumer = VecConsumer::new();
    let handle = consumer.handle();
    Flow::range(1, 3).map(|x| format!("#{x}")).subscribe(consumer);
    assert_eq!(handle.items(), vec!["#1", "#2", "#3"]);
  }

  #[test]
  fn test_map_passes_demand_through() {
    let consumer = VecConsumer::with_initial_request(2);
    let handle = consumer.handle();
    Flow::range(0, 10).map(|x| x * 2).subscribe(consumer);
    assert_eq!(handle.items(), vec![0, 2]);
    assert!(!handle.is_terminated());
  }

  #[test]
  fn test_try_map_error_cancels_upstream() {
    let cancelled = Arc::new(AtomicBool::new(false));
    let flag = cancelled.clone();
    let consumer = VecConsumer::new();
    let handle = consumer.handle();
    Flow::range(0, 10)
      .do_on_cancel(move || flag.store(true, Ordering::SeqCst))
      .try_map(|x| {
        if x < 2 {
          Ok(x)
        } else {
          Err(FlowError::msg(format!("bad {x}")))
        }
      })
      .subscribe(consumer);
    assert_eq!(handle.items(), vec![0, 1]);
    assert!(matches!(handle.error(), Some(FlowError::Message(m)) if m == "bad 2"));
    assert!(cancelled.load(Ordering::SeqCst));
  }

  #[test]
  fn test_map_panic_becomes_error() {
    let cancelled = Arc::new(AtomicBool::new(false));
    let flag = cancelled.clone();
    let consumer = VecConsumer::new();
    let handle = consumer.handle();
    Flow::range(0, 10)
      .do_on_cancel(move || flag.store(true, Ordering::SeqCst))
      .map(|x| {
        if x == 3 {
          panic!("cannot map 3");
        }
        x
      })
      .subscribe(consumer);
    assert_eq!(handle.items(), vec![0, 1, 2]);
    assert!(matches!(handle.error(), Some(FlowError::Panicked(m)) if m == "cannot map 3"));
    assert!(cancelled.load(Ordering::SeqCst));
  }

  #[test]
  fn test_try_map_panic_becomes_error() {
    let consumer = VecConsumer::new();
    let handle = consumer.handle();
    Flow::range(0, 5)
      .try_map(|x| -> Result<i32, FlowError> {
        if x == 1 {
          panic!("boom");
        }
        Ok(x)
      })
      .subscribe(consumer);
    assert_eq!(handle.items(), vec![0]);
    assert!(matches!(handle.error(), Some(FlowError::Panicked(_))));
  }
}
