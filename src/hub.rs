//! # Multicast Hub
//!
//! A push-driven producer that fans one sequence of signals out to every
//! attached consumer. An external actor calls [`Hub::on_next`],
//! [`Hub::on_complete`] and [`Hub::on_error`] directly, or
//! [`Hub::connect`]s the hub to a flow.
//!
//! ## Overview
//!
//! Every consumer gets its own subscription, demand counter and bounded
//! buffer. Items that arrive while a consumer has no outstanding demand wait
//! in its buffer; when the buffer would exceed `capacity` that consumer
//! alone fails with [`FlowError::Overflow`] and is detached. Cancelling one
//! consumer never affects another, nor the upstream.
//!
//! ## Backpressure policies
//!
//! - [`BackpressurePolicy::Buffer`]: a connected upstream is requested
//!   unbounded and per-consumer buffers absorb the difference.
//! - [`BackpressurePolicy::SlowestConsumer`]: a connected upstream is
//!   requested no faster than the smallest outstanding demand across attached
//!   consumers. Pushers that are not flows read [`Hub::demand`] to gate
//!   themselves.
//!
//! ## Replay
//!
//! With `replay > 0` the hub keeps the most recent `replay` items. A consumer
//! attaching later first receives that history; one attaching after the hub
//! terminated receives the history and then the terminal signal.
//!
//! ## Example
//!
//! ```rust
//! use fluxweave::consumers::VecConsumer;
//! use fluxweave::hub::{Hub, HubConfig};
//!
//! let hub: Hub<&str> = Hub::new(HubConfig::default().with_replay(1)).unwrap();
//! hub.on_next("missed");
//! hub.on_next("replayed");
//!
//! let consumer = VecConsumer::new();
//! let handle = consumer.handle();
//! hub.flow().subscribe(consumer);
//! hub.on_next("live");
//! hub.on_complete();
//!
//! assert_eq!(handle.items(), vec!["replayed", "live"]);
//! assert!(handle.is_complete());
//! ```

use crate::consumer::{BoxConsumer, Consumer};
use crate::demand::{Demand, UNBOUNDED};
use crate::error::{FlowError, ProtocolViolation};
use crate::flow::Flow;
use crate::producer::Producer;
use crate::subscription::{Drain, Subscription, SubscriptionRef, UpstreamSlot};
use crate::sync::lock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, trace, warn};

/// How a hub paces its upstream against its consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressurePolicy {
  /// Request the upstream unbounded; buffer per consumer up to `capacity`.
  #[default]
  Buffer,
  /// Request the upstream no faster than the slowest consumer.
  SlowestConsumer,
}

/// Configuration of a [`Hub`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
  /// Upstream pacing policy.
  pub policy: BackpressurePolicy,
  /// Undelivered items each consumer may hold before it overflows.
  pub capacity: usize,
  /// Number of recent items replayed to late consumers.
  pub replay: usize,
}

impl Default for HubConfig {
  fn default() -> Self {
    Self {
      policy: BackpressurePolicy::Buffer,
      capacity: 256,
      replay: 0,
    }
  }
}

impl HubConfig {
  /// Sets the backpressure policy.
  #[must_use]
  pub fn with_policy(mut self, policy: BackpressurePolicy) -> Self {
    self.policy = policy;
    self
  }

  /// Sets the per-consumer buffer capacity.
  #[must_use]
  pub fn with_capacity(mut self, capacity: usize) -> Self {
    self.capacity = capacity;
    self
  }

  /// Sets the replay history size.
  #[must_use]
  pub fn with_replay(mut self, replay: usize) -> Self {
    self.replay = replay;
    self
  }

  /// Checks that the capacity is at least one and that the replay history
  /// fits in a consumer's buffer.
  pub fn validate(&self) -> Result<(), FlowError> {
    if self.capacity == 0 {
      return Err(FlowError::Config("hub capacity must be at least 1".into()));
    }
    if self.replay > self.capacity {
      return Err(FlowError::Config(format!(
        "hub replay {} exceeds capacity {}",
        self.replay, self.capacity
      )));
    }
    Ok(())
  }
}

#[derive(Debug, Clone)]
enum Terminal {
  Complete,
  Error(FlowError),
}

struct Registry<T> {
  subscribers: BTreeMap<u64, Arc<HubSubscription<T>>>,
  history: VecDeque<T>,
  terminal: Option<Terminal>,
}

struct HubInner<T> {
  config: HubConfig,
  registry: Mutex<Registry<T>>,
  next_id: AtomicU64,
  upstream: Mutex<Option<Arc<UpstreamSlot>>>,
  /// Items requested from the connected upstream and not yet received.
  owed: Mutex<u64>,
}

/// Push-driven multicast producer.
pub struct Hub<T> {
  inner: Arc<HubInner<T>>,
}

impl<T> Clone for Hub<T> {
  fn clone(&self) -> Self {
    Self {
      inner: self.inner.clone(),
    }
  }
}

impl<T> fmt::Debug for Hub<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Hub")
      .field("config", &self.inner.config)
      .finish_non_exhaustive()
  }
}

impl<T: Clone + Send + 'static> Hub<T> {
  /// Creates a hub. Fails when `config` does not validate.
  pub fn new(config: HubConfig) -> Result<Self, FlowError> {
    config.validate()?;
    Ok(Self {
      inner: Arc::new(HubInner {
        config,
        registry: Mutex::new(Registry {
          subscribers: BTreeMap::new(),
          history: VecDeque::new(),
          terminal: None,
        }),
        next_id: AtomicU64::new(0),
        upstream: Mutex::new(None),
        owed: Mutex::new(0),
      }),
    })
  }

  /// The configuration this hub was built with.
  pub fn config(&self) -> &HubConfig {
    &self.inner.config
  }

  /// The hub as a flow. Every subscription attaches a new consumer.
  pub fn flow(&self) -> Flow<T> {
    Flow::from_producer(self.clone())
  }

  /// Pushes an item to every attached consumer.
  pub fn on_next(&self, item: T) {
    self.inner.push(item);
  }

  /// Completes every attached consumer and every later one.
  pub fn on_complete(&self) {
    self.inner.terminate(Terminal::Complete);
  }

  /// Fails every attached consumer and every later one.
  pub fn on_error(&self, error: FlowError) {
    self.inner.terminate(Terminal::Error(error));
  }

  /// Smallest demand that every attached consumer can still take without
  /// buffering. Zero when no consumer is attached.
  pub fn demand(&self) -> u64 {
    self.inner.demand()
  }

  /// Number of attached consumers.
  pub fn subscriber_count(&self) -> usize {
    lock(&self.inner.registry).subscribers.len()
  }

  /// Whether the hub has received a terminal signal.
  pub fn is_terminated(&self) -> bool {
    lock(&self.inner.registry).terminal.is_some()
  }

  /// Subscribes the hub to `source` and forwards its signals. Replaces (and
  /// cancels) any previously connected source.
  pub fn connect(&self, source: &Flow<T>) {
    let slot = Arc::new(UpstreamSlot::new());
    let previous = lock(&self.inner.upstream).replace(slot.clone());
    if let Some(previous) = previous {
      debug!("hub reconnected, cancelling previous source");
      previous.cancel();
    }
    match self.inner.config.policy {
      BackpressurePolicy::Buffer => {
        *lock(&self.inner.owed) = UNBOUNDED;
        slot.request(UNBOUNDED);
      }
      BackpressurePolicy::SlowestConsumer => {
        *lock(&self.inner.owed) = 0;
        self.inner.replenish();
      }
    }
    source.subscribe(ConnectConsumer {
      slot,
      hub: self.inner.clone(),
    });
  }

  /// Cancels the connected source, if any. Attached consumers stay attached.
  pub fn disconnect(&self) {
    let previous = lock(&self.inner.upstream).take();
    if let Some(previous) = previous {
      debug!("hub disconnected");
      previous.cancel();
    }
  }
}

impl<T: Clone + Send + 'static> HubInner<T> {
  fn push(&self, item: T) {
    let targets: Vec<Arc<HubSubscription<T>>> = {
      let mut registry = lock(&self.registry);
      if registry.terminal.is_some() {
        warn!(
          violation = %ProtocolViolation::SignalAfterTerminal,
          "hub received on_next after terminal, ignoring"
        );
        return;
      }
      if self.config.replay > 0 {
        if registry.history.len() == self.config.replay {
          registry.history.pop_front();
        }
        registry.history.push_back(item.clone());
      }
      registry.subscribers.values().cloned().collect()
    };
    trace!(subscribers = targets.len(), "hub fan-out");
    for target in targets {
      target.offer(item.clone());
    }
  }

  fn terminate(&self, terminal: Terminal) {
    let targets = {
      let mut registry = lock(&self.registry);
      if registry.terminal.is_some() {
        warn!(
          violation = %ProtocolViolation::SignalAfterTerminal,
          "hub received a second terminal, ignoring"
        );
        return;
      }
      registry.terminal = Some(terminal.clone());
      std::mem::take(&mut registry.subscribers)
    };
    debug!(subscribers = targets.len(), "hub terminated");
    let upstream = lock(&self.upstream).take();
    if let Some(upstream) = upstream {
      upstream.cancel();
    }
    for target in targets.into_values() {
      target.finish(terminal.clone());
    }
  }

  fn demand(&self) -> u64 {
    let registry = lock(&self.registry);
    registry
      .subscribers
      .values()
      .map(|subscription| subscription.need())
      .min()
      .unwrap_or(0)
  }

  fn detach(&self, id: u64) {
    if lock(&self.registry).subscribers.remove(&id).is_some() {
      debug!(id, "hub consumer detached");
    }
  }

  /// Tops up the connected upstream to the slowest consumer's need.
  fn replenish(&self) {
    if self.config.policy != BackpressurePolicy::SlowestConsumer {
      return;
    }
    let Some(slot) = lock(&self.upstream).clone() else {
      return;
    };
    let need = self.demand();
    let request = {
      let mut owed = lock(&self.owed);
      if *owed == UNBOUNDED || need <= *owed {
        return;
      }
      let request = if need == UNBOUNDED {
        UNBOUNDED
      } else {
        need - *owed
      };
      *owed = need;
      request
    };
    trace!(request, "hub replenishing upstream");
    slot.request(request);
  }

  fn received(&self) {
    let mut owed = lock(&self.owed);
    if *owed != UNBOUNDED {
      *owed = owed.saturating_sub(1);
    }
  }
}

impl<T: Clone + Send + 'static> Producer<T> for Hub<T> {
  fn subscribe(&self, consumer: BoxConsumer<T>) {
    let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
    let subscription = Arc::new(HubSubscription {
      id,
      capacity: self.inner.config.capacity,
      hub: Arc::downgrade(&self.inner),
      demand: Demand::new(),
      queue: Mutex::new(VecDeque::new()),
      terminal: Mutex::new(None),
      failure: Mutex::new(None),
      consumer: Mutex::new(Some(consumer)),
      drain: Drain::new(),
      cancelled: AtomicBool::new(false),
    });
    {
      let mut registry = lock(&self.inner.registry);
      lock(&subscription.queue).extend(registry.history.iter().cloned());
      match &registry.terminal {
        Some(terminal) => *lock(&subscription.terminal) = Some(terminal.clone()),
        None => {
          registry.subscribers.insert(id, subscription.clone());
        }
      }
    }
    debug!(id, "hub consumer attached");
    let handle: SubscriptionRef = subscription.clone();
    subscription.drain(Some(handle));
    self.inner.replenish();
  }
}

/// One consumer's attachment to a hub.
struct HubSubscription<T> {
  id: u64,
  capacity: usize,
  hub: Weak<HubInner<T>>,
  demand: Demand,
  queue: Mutex<VecDeque<T>>,
  /// Terminal delivered once the queue has drained.
  terminal: Mutex<Option<Terminal>>,
  /// Failure delivered ahead of the queue.
  failure: Mutex<Option<FlowError>>,
  consumer: Mutex<Option<BoxConsumer<T>>>,
  drain: Drain,
  cancelled: AtomicBool,
}

impl<T: Clone + Send + 'static> HubSubscription<T> {
  fn offer(&self, item: T) {
    if self.cancelled.load(Ordering::Acquire) {
      return;
    }
    let overflowed = {
      let mut queue = lock(&self.queue);
      if queue.len() >= self.capacity {
        queue.clear();
        true
      } else {
        queue.push_back(item);
        false
      }
    };
    if overflowed {
      warn!(id = self.id, capacity = self.capacity, "hub consumer overflowed");
      self.fail(FlowError::Overflow {
        capacity: self.capacity,
      });
    } else {
      self.drain(None);
    }
  }

  fn finish(&self, terminal: Terminal) {
    *lock(&self.terminal) = Some(terminal);
    self.drain(None);
  }

  fn fail(&self, error: FlowError) {
    self.detach();
    *lock(&self.failure) = Some(error);
    self.drain(None);
  }

  fn detach(&self) {
    if let Some(hub) = self.hub.upgrade() {
      hub.detach(self.id);
      hub.replenish();
    }
  }

  fn need(&self) -> u64 {
    let demand = self.demand.get();
    if demand == UNBOUNDED {
      return UNBOUNDED;
    }
    demand.saturating_sub(lock(&self.queue).len() as u64)
  }

  fn drain(&self, mut attach: Option<SubscriptionRef>) {
    if !self.drain.enter() {
      return;
    }
    let mut missed = 1;
    loop {
      {
        let mut guard = lock(&self.consumer);
        let finished = match guard.as_mut() {
          Some(consumer) => !self.pass(consumer, attach.take()),
          None => false,
        };
        if finished {
          guard.take();
        }
      }
      missed = self.drain.leave(missed);
      if missed == 0 {
        break;
      }
    }
  }

  /// Delivers what is ready. Returns `false` once the consumer is done with.
  fn pass(&self, consumer: &mut BoxConsumer<T>, attach: Option<SubscriptionRef>) -> bool {
    if let Some(subscription) = attach {
      consumer.on_subscribe(subscription);
    }
    loop {
      if self.cancelled.load(Ordering::Acquire) {
        lock(&self.queue).clear();
        return false;
      }
      let failure = lock(&self.failure).take();
      if let Some(error) = failure {
        lock(&self.queue).clear();
        consumer.on_error(error);
        return false;
      }
      if self.demand.has_demand() {
        let next = lock(&self.queue).pop_front();
        if let Some(item) = next {
          self.demand.produced(1);
          consumer.on_next(item);
          continue;
        }
      }
      if lock(&self.queue).is_empty() {
        let terminal = lock(&self.terminal).take();
        match terminal {
          Some(Terminal::Complete) => {
            consumer.on_complete();
            return false;
          }
          Some(Terminal::Error(error)) => {
            consumer.on_error(error);
            return false;
          }
          None => {}
        }
      }
      return true;
    }
  }
}

impl<T: Clone + Send + 'static> Subscription for HubSubscription<T> {
  fn request(&self, n: u64) {
    if n == 0 {
      self.fail(ProtocolViolation::NonPositiveRequest.into());
      return;
    }
    self.demand.add(n);
    self.drain(None);
    if let Some(hub) = self.hub.upgrade() {
      hub.replenish();
    }
  }

  fn cancel(&self) {
    if !self.cancelled.swap(true, Ordering::AcqRel) {
      trace!(id = self.id, "hub consumer cancelled");
      self.detach();
      self.drain(None);
    }
  }
}

struct ConnectConsumer<T> {
  slot: Arc<UpstreamSlot>,
  hub: Arc<HubInner<T>>,
}

impl<T: Clone + Send + 'static> Consumer<T> for ConnectConsumer<T> {
  fn on_subscribe(&mut self, subscription: SubscriptionRef) {
    self.slot.set(subscription);
  }

  fn on_next(&mut self, item: T) {
    self.hub.received();
    self.hub.push(item);
    self.hub.replenish();
  }

  fn on_error(&mut self, error: FlowError) {
    self.hub.terminate(Terminal::Error(error));
  }

  fn on_complete(&mut self) {
    self.hub.terminate(Terminal::Complete);
  }
}
