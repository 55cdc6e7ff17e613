use crate::consumer::Consumer;
use crate::demand::UNBOUNDED;
use crate::error::FlowError;
use crate::subscription::{SubscriptionRef, UpstreamSlot};
use std::sync::Arc;
use tracing::warn;

type NextFn<T> = Box<dyn FnMut(T) + Send>;
type ErrorFn = Box<dyn FnOnce(FlowError) + Send>;
type CompleteFn = Box<dyn FnOnce() + Send>;

/// Consumer built from closures.
///
/// Requests unbounded demand on subscription. An error without an `on_error`
/// callback is logged at `warn` level.
///
/// ```rust
/// use fluxweave::consumers::LambdaConsumer;
/// use fluxweave::Flow;
/// use std::sync::{Arc, Mutex};
///
/// let sum = Arc::new(Mutex::new(0));
/// let total = sum.clone();
/// Flow::range(1, 4).subscribe(LambdaConsumer::new(move |x| *total.lock().unwrap() += x));
/// assert_eq!(*sum.lock().unwrap(), 10);
/// ```
pub struct LambdaConsumer<T> {
  on_next: NextFn<T>,
  on_error: Option<ErrorFn>,
  on_complete: Option<CompleteFn>,
  upstream: Arc<UpstreamSlot>,
  initial_request: u64,
}

impl<T: Send + 'static> LambdaConsumer<T> {
  /// Calls `on_next` for every item.
  pub fn new<F>(on_next: F) -> Self
  where
    F: FnMut(T) + Send + 'static,
  {
    Self {
      on_next: Box::new(on_next),
      on_error: None,
      on_complete: None,
      upstream: Arc::new(UpstreamSlot::new()),
      initial_request: UNBOUNDED,
    }
  }

  /// Calls `on_error` on failure.
  pub fn with_error<F>(mut self, on_error: F) -> Self
  where
    F: FnOnce(FlowError) + Send + 'static,
  {
    self.on_error = Some(Box::new(on_error));
    self
  }

  /// Calls `on_complete` on completion.
  pub fn with_complete<F>(mut self, on_complete: F) -> Self
  where
    F: FnOnce() + Send + 'static,
  {
    self.on_complete = Some(Box::new(on_complete));
    self
  }

  /// Requests `n` items on subscription instead of unbounded demand.
  pub fn with_initial_request(mut self, n: u64) -> Self {
    self.initial_request = n;
    self
  }

  /// Installs the upstream subscription into `slot`, so the caller can
  /// request or cancel through it.
  pub fn with_slot(mut self, slot: Arc<UpstreamSlot>) -> Self {
    self.upstream = slot;
    self
  }
}

impl<T: Send + 'static> Consumer<T> for LambdaConsumer<T> {
  fn on_subscribe(&mut self, subscription: SubscriptionRef) {
    self.upstream.set(subscription);
    if self.initial_request > 0 {
      self.upstream.request(self.initial_request);
    }
  }

  fn on_next(&mut self, item: T) {
    (self.on_next)(item);
  }

  fn on_error(&mut self, error: FlowError) {
    match self.on_error.take() {
      Some(on_error) => on_error(error),
      None => warn!(%error, "unhandled flow error"),
    }
  }

  fn on_complete(&mut self) {
    if let Some(on_complete) = self.on_complete.take() {
      on_complete();
    }
  }
}
