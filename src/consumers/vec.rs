use crate::consumer::Consumer;
use crate::demand::UNBOUNDED;
use crate::error::FlowError;
use crate::subscription::{SubscriptionRef, UpstreamSlot};
use crate::sync::lock;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

struct VecState<T> {
  items: Vec<T>,
  complete: bool,
  error: Option<FlowError>,
  subscribed: bool,
}

struct Shared<T> {
  state: Mutex<VecState<T>>,
  upstream: UpstreamSlot,
  changed: Notify,
}

/// Point-in-time copy of what a [`VecConsumer`] has received.
#[derive(Debug, Clone)]
pub struct VecSnapshot<T> {
  /// Items received so far.
  pub items: Vec<T>,
  /// Whether `on_complete` was received.
  pub complete: bool,
  /// The error, if `on_error` was received.
  pub error: Option<FlowError>,
}

/// Consumer that collects every item into a vector.
///
/// The consumer itself is moved into the flow on subscription; keep a
/// [`VecHandle`] to inspect what it received and to pace it by hand.
pub struct VecConsumer<T> {
  shared: Arc<Shared<T>>,
  initial_request: u64,
}

impl<T: Send + 'static> VecConsumer<T> {
  /// Collects everything: requests unbounded demand on subscription.
  pub fn new() -> Self {
    Self::with_initial_request(UNBOUNDED)
  }

  /// Requests `n` items on subscription; `0` requests nothing.
  pub fn with_initial_request(n: u64) -> Self {
    Self {
      shared: Arc::new(Shared {
        state: Mutex::new(VecState {
          items: Vec::new(),
          complete: false,
          error: None,
          subscribed: false,
        }),
        upstream: UpstreamSlot::new(),
        changed: Notify::new(),
      }),
      initial_request: n,
    }
  }

  /// Handle observing this consumer.
  pub fn handle(&self) -> VecHandle<T> {
    VecHandle {
      shared: self.shared.clone(),
    }
  }
}

impl<T: Send + 'static> Default for VecConsumer<T> {
  fn default() -> Self {
    Self::new()
  }
}

impl<T: Send + 'static> Consumer<T> for VecConsumer<T> {
  fn on_subscribe(&mut self, subscription: SubscriptionRef) {
    lock(&self.shared.state).subscribed = true;
    self.shared.upstream.set(subscription);
    if self.initial_request > 0 {
      self.shared.upstream.request(self.initial_request);
    }
    self.shared.changed.notify_waiters();
  }

  fn on_next(&mut self, item: T) {
    lock(&self.shared.state).items.push(item);
    self.shared.changed.notify_waiters();
  }

  fn on_error(&mut self, error: FlowError) {
    lock(&self.shared.state).error = Some(error);
    self.shared.changed.notify_waiters();
  }

  fn on_complete(&mut self) {
    lock(&self.shared.state).complete = true;
    self.shared.changed.notify_waiters();
  }
}

/// Observer and remote control of a [`VecConsumer`].
pub struct VecHandle<T> {
  shared: Arc<Shared<T>>,
}

impl<T> Clone for VecHandle<T> {
  fn clone(&self) -> Self {
    Self {
      shared: self.shared.clone(),
    }
  }
}

impl<T> VecHandle<T> {
  /// Items received so far.
  pub fn items(&self) -> Vec<T>
  where
    T: Clone,
  {
    lock(&self.shared.state).items.clone()
  }

  /// Everything received so far.
  pub fn snapshot(&self) -> VecSnapshot<T>
  where
    T: Clone,
  {
    let state = lock(&self.shared.state);
    VecSnapshot {
      items: state.items.clone(),
      complete: state.complete,
      error: state.error.clone(),
    }
  }

  /// Number of items received.
  pub fn len(&self) -> usize {
    lock(&self.shared.state).items.len()
  }

  /// Whether no item was received.
  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Whether `on_subscribe` was received.
  pub fn is_subscribed(&self) -> bool {
    lock(&self.shared.state).subscribed
  }

  /// Whether `on_complete` was received.
  pub fn is_complete(&self) -> bool {
    lock(&self.shared.state).complete
  }

  /// The error, if `on_error` was received.
  pub fn error(&self) -> Option<FlowError> {
    lock(&self.shared.state).error.clone()
  }

  /// Whether any terminal signal was received.
  pub fn is_terminated(&self) -> bool {
    let state = lock(&self.shared.state);
    state.complete || state.error.is_some()
  }

  /// Requests `n` more items.
  pub fn request(&self, n: u64) {
    self.shared.upstream.request(n);
  }

  /// Cancels the subscription.
  pub fn cancel(&self) {
    self.shared.upstream.cancel();
  }

  /// Waits until a terminal signal was received.
  pub async fn terminated(&self) {
    loop {
      let changed = self.shared.changed.notified();
      if self.is_terminated() {
        return;
      }
      changed.await;
    }
  }

  /// Waits until at least `n` items, or a terminal signal, were received.
  pub async fn wait_for_items(&self, n: usize) {
    loop {
      let changed = self.shared.changed.notified();
      if self.len() >= n || self.is_terminated() {
        return;
      }
      changed.await;
    }
  }
}
