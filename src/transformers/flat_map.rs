//! # Flat-Map Transformer
//!
//! Maps every upstream item to an inner flow and merges the inner flows into
//! one downstream sequence.
//!
//! ## Demand
//!
//! - The outer source is asked for `max_concurrency` items up front and for
//!   one more each time an inner flow completes, so at most
//!   `max_concurrency` inner flows are attached at once.
//! - Each inner flow is asked for `prefetch` items and replenished in batches
//!   as its items are delivered.
//! - Inner items wait in a shared queue and are handed downstream only while
//!   the single downstream demand counter allows it.
//!
//! With `max_concurrency == 1` inner flows run strictly one after the other,
//! in outer order (`concat_map`).
//!
//! The first error from the outer source or any inner flow cancels
//! everything else and is delivered right away; queued items are dropped.

use crate::consumer::{BoxConsumer, Consumer};
use crate::demand::{Demand, UNBOUNDED};
use crate::error::{FlowError, ProtocolViolation};
use crate::flow::Flow;
use crate::subscription::{Drain, Subscription, SubscriptionRef, UpstreamSlot};
use crate::sync::lock;
use crate::transformer::Transformer;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, trace};

/// Concurrency and prefetch settings of a flat-map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlatMapConfig {
  /// Maximum number of inner flows attached at once.
  pub max_concurrency: usize,
  /// Items requested ahead from each inner flow.
  pub prefetch: usize,
}

impl Default for FlatMapConfig {
  fn default() -> Self {
    Self {
      max_concurrency: 256,
      prefetch: 32,
    }
  }
}

impl FlatMapConfig {
  /// Sets the maximum number of concurrent inner flows.
  pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
    self.max_concurrency = max_concurrency;
    self
  }

  /// Sets the per-inner prefetch.
  pub fn with_prefetch(mut self, prefetch: usize) -> Self {
    self.prefetch = prefetch;
    self
  }

  /// Checks that both settings are at least one.
  pub fn validate(&self) -> Result<(), FlowError> {
    if self.max_concurrency == 0 {
      return Err(FlowError::Config("max_concurrency must be at least 1".into()));
    }
    if self.prefetch == 0 {
      return Err(FlowError::Config("prefetch must be at least 1".into()));
    }
    Ok(())
  }

  fn outer_request(&self) -> u64 {
    if self.max_concurrency == usize::MAX {
      UNBOUNDED
    } else {
      self.max_concurrency as u64
    }
  }
}

/// Maps items to flows and merges them.
pub struct FlatMapTransformer<F> {
  f: Arc<F>,
  config: FlatMapConfig,
}

impl<F> FlatMapTransformer<F> {
  /// Creates the transformer. `config` is expected to be valid.
  pub fn new(f: F, config: FlatMapConfig) -> Self {
    Self {
      f: Arc::new(f),
      config,
    }
  }
}

impl<T, R, F> Transformer<T, R> for FlatMapTransformer<F>
where
  T: Send + 'static,
  R: Send + 'static,
  F: Fn(T) -> Flow<R> + Send + Sync + 'static,
{
  fn apply(&self, downstream: BoxConsumer<R>) -> BoxConsumer<T> {
    let prefetch = self.config.prefetch.max(1) as u64;
    Box::new(OuterConsumer {
      f: self.f.clone(),
      state: Arc::new(FlatMapState {
        outer_request: self.config.outer_request(),
        prefetch,
        limit: prefetch - prefetch / 4,
        downstream: Mutex::new(Some(downstream)),
        handoff: Mutex::new(None),
        queue: Mutex::new(VecDeque::new()),
        demand: Demand::new(),
        drain: Drain::new(),
        outer: UpstreamSlot::new(),
        inners: Mutex::new(HashMap::new()),
        next_id: AtomicU64::new(0),
        active: AtomicUsize::new(0),
        outer_done: AtomicBool::new(false),
        error: Mutex::new(None),
        failed: AtomicBool::new(false),
        cancelled: AtomicBool::new(false),
      }),
    })
  }

  fn name(&self) -> &str {
    if self.config.max_concurrency == 1 {
      "concat_map"
    } else {
      "flat_map"
    }
  }
}

struct Inner {
  upstream: UpstreamSlot,
  consumed: AtomicU64,
}

struct FlatMapState<R> {
  outer_request: u64,
  prefetch: u64,
  limit: u64,
  downstream: Mutex<Option<BoxConsumer<R>>>,
  handoff: Mutex<Option<SubscriptionRef>>,
  queue: Mutex<VecDeque<(Arc<Inner>, R)>>,
  demand: Demand,
  drain: Drain,
  outer: UpstreamSlot,
  inners: Mutex<HashMap<u64, Arc<Inner>>>,
  next_id: AtomicU64,
  active: AtomicUsize,
  outer_done: AtomicBool,
  error: Mutex<Option<FlowError>>,
  failed: AtomicBool,
  cancelled: AtomicBool,
}

impl<R: Send + 'static> FlatMapState<R> {
  fn drain(&self) {
    if !self.drain.enter() {
      return;
    }
    let mut missed = 1;
    loop {
      let taken = lock(&self.downstream).take();
      if let Some(mut consumer) = taken {
        if self.pass(&mut consumer) {
          *lock(&self.downstream) = Some(consumer);
        }
      }
      missed = self.drain.leave(missed);
      if missed == 0 {
        break;
      }
    }
  }

  /// Delivers what is ready. Returns `false` once the downstream is finished
  /// with.
  fn pass(&self, consumer: &mut BoxConsumer<R>) -> bool {
    let handoff = lock(&self.handoff).take();
    if let Some(subscription) = handoff {
      consumer.on_subscribe(subscription);
    }
    loop {
      if self.cancelled.load(Ordering::Acquire) {
        lock(&self.queue).clear();
        return false;
      }
      let error = lock(&self.error).take();
      if let Some(error) = error {
        lock(&self.queue).clear();
        consumer.on_error(error);
        return false;
      }
      if self.demand.has_demand() {
        let next = lock(&self.queue).pop_front();
        if let Some((inner, item)) = next {
          consumer.on_next(item);
          self.demand.produced(1);
          self.replenish(&inner);
          continue;
        }
      }
      let finished = self.outer_done.load(Ordering::Acquire)
        && self.active.load(Ordering::Acquire) == 0
        && lock(&self.queue).is_empty();
      if finished && !self.failed.load(Ordering::Acquire) {
        consumer.on_complete();
        return false;
      }
      return true;
    }
  }

  fn replenish(&self, inner: &Inner) {
    let consumed = inner.consumed.fetch_add(1, Ordering::AcqRel) + 1;
    if consumed == self.limit {
      inner.consumed.store(0, Ordering::Release);
      inner.upstream.request(self.limit);
    }
  }

  fn fail(&self, error: FlowError) {
    if self.failed.swap(true, Ordering::AcqRel) {
      debug!(%error, "dropping error after first failure");
      return;
    }
    *lock(&self.error) = Some(error);
    self.cancel_upstreams();
    self.drain();
  }

  fn cancel_upstreams(&self) {
    self.outer.cancel();
    let inners: Vec<Arc<Inner>> = lock(&self.inners).drain().map(|(_, inner)| inner).collect();
    for inner in inners {
      inner.upstream.cancel();
    }
  }

  fn inner_done(&self, id: u64) {
    lock(&self.inners).remove(&id);
    self.active.fetch_sub(1, Ordering::AcqRel);
    if !self.outer_done.load(Ordering::Acquire) {
      self.outer.request(1);
    }
  }
}

struct FlatMapSubscription<R> {
  state: Arc<FlatMapState<R>>,
}

impl<R: Send + 'static> Subscription for FlatMapSubscription<R> {
  fn request(&self, n: u64) {
    if n == 0 {
      self.state.fail(ProtocolViolation::NonPositiveRequest.into());
      return;
    }
    self.state.demand.add(n);
    self.state.drain();
  }

  fn cancel(&self) {
    if !self.state.cancelled.swap(true, Ordering::AcqRel) {
      trace!("flat_map cancelled");
      self.state.cancel_upstreams();
      self.state.drain();
    }
  }
}

struct OuterConsumer<F, R> {
  f: Arc<F>,
  state: Arc<FlatMapState<R>>,
}

impl<T, R, F> Consumer<T> for OuterConsumer<F, R>
where
  T: Send + 'static,
  R: Send + 'static,
  F: Fn(T) -> Flow<R> + Send + Sync + 'static,
{
  fn on_subscribe(&mut self, subscription: SubscriptionRef) {
    self.state.outer.set(subscription);
    *lock(&self.state.handoff) = Some(Arc::new(FlatMapSubscription {
      state: self.state.clone(),
    }));
    self.state.drain();
    self.state.outer.request(self.state.outer_request);
  }

  fn on_next(&mut self, item: T) {
    let state = &self.state;
    if state.cancelled.load(Ordering::Acquire) || state.failed.load(Ordering::Acquire) {
      return;
    }
    let flow = (self.f)(item);
    let id = state.next_id.fetch_add(1, Ordering::AcqRel);
    let inner = Arc::new(Inner {
      upstream: UpstreamSlot::new(),
      consumed: AtomicU64::new(0),
    });
    lock(&state.inners).insert(id, inner.clone());
    state.active.fetch_add(1, Ordering::AcqRel);
    flow.subscribe(InnerConsumer {
      id,
      inner,
      state: state.clone(),
    });
  }

  fn on_error(&mut self, error: FlowError) {
    self.state.fail(error);
  }

  fn on_complete(&mut self) {
    self.state.outer_done.store(true, Ordering::Release);
    self.state.drain();
  }
}

struct InnerConsumer<R> {
  id: u64,
  inner: Arc<Inner>,
  state: Arc<FlatMapState<R>>,
}

impl<R: Send + 'static> Consumer<R> for InnerConsumer<R> {
  fn on_subscribe(&mut self, subscription: SubscriptionRef) {
    if self.inner.upstream.set(subscription) {
      self.inner.upstream.request(self.state.prefetch);
    }
    if self.state.cancelled.load(Ordering::Acquire) || self.state.failed.load(Ordering::Acquire) {
      self.inner.upstream.cancel();
    }
  }

  fn on_next(&mut self, item: R) {
    lock(&self.state.queue).push_back((self.inner.clone(), item));
    self.state.drain();
  }

  fn on_error(&mut self, error: FlowError) {
    self.state.inner_done(self.id);
    self.state.fail(error);
  }

  fn on_complete(&mut self) {
    self.state.inner_done(self.id);
    self.state.drain();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::consumers::VecConsumer;
  use crate::hub::{Hub, HubConfig};
  use proptest::prelude::*;

  #[test]
  fn test_config_defaults_and_validation() {
    let config = FlatMapConfig::default();
    assert_eq!(config.max_concurrency, 256);
    assert_eq!(config.prefetch, 32);
    assert!(config.validate().is_ok());
    assert!(config.with_prefetch(0).validate().is_err());
    assert!(config.with_max_concurrency(0).validate().is_err());
  }

  #[test]
  fn test_config_deserializes_with_defaults() {
    let config: FlatMapConfig = serde_json::from_str(r#"{"prefetch": 4}"#).unwrap();
    assert_eq!(config, FlatMapConfig::default().with_prefetch(4));
  }

  #[test]
  fn test_flat_map_expands_items() {
    let consumer = VecConsumer::new();
    let handle = consumer.handle();
    Flow::range(1, 3)
      .flat_map(|n| Flow::range(0, n as u32).map(move |i| n * 10 + i))
      .subscribe(consumer);
    assert_eq!(handle.items(), vec![10, 20, 21, 30, 31, 32]);
    assert!(handle.is_complete());
  }

  #[test]
  fn test_merge_interleaves_hot_sources() {
    let a: Hub<&str> = Hub::new(HubConfig::default()).unwrap();
    let b: Hub<&str> = Hub::new(HubConfig::default()).unwrap();
    let consumer = VecConsumer::new();
    let handle = consumer.handle();
    a.flow().merge_with(&b.flow()).subscribe(consumer);
    a.on_next("a1");
    b.on_next("b1");
    a.on_next("a2");
    a.on_complete();
    assert!(!handle.is_complete());
    b.on_complete();
    assert_eq!(handle.items(), vec!["a1", "b1", "a2"]);
    assert!(handle.is_complete());
  }

  #[test]
  fn test_concat_map_waits_for_previous_inner() {
    let first: Hub<i32> = Hub::new(HubConfig::default()).unwrap();
    let second = Flow::range(100, 2);
    let sources = vec![first.flow(), second];
    let consumer = VecConsumer::new();
    let handle = consumer.handle();
    Flow::concat(sources).subscribe(consumer);
    first.on_next(1);
    assert_eq!(handle.items(), vec![1]);
    first.on_next(2);
    first.on_complete();
    assert_eq!(handle.items(), vec![1, 2, 100, 101]);
    assert!(handle.is_complete());
  }

  #[test]
  fn test_inner_error_cancels_everything() {
    let other: Hub<i32> = Hub::new(HubConfig::default()).unwrap();
    let consumer = VecConsumer::new();
    let handle = consumer.handle();
    Flow::merge(vec![other.flow(), Flow::error(FlowError::msg("inner"))]).subscribe(consumer);
    assert!(matches!(handle.error(), Some(FlowError::Message(m)) if m == "inner"));
    assert_eq!(other.subscriber_count(), 0);
  }

  #[test]
  fn test_downstream_demand_bounds_delivery() {
    let consumer = VecConsumer::with_initial_request(3);
    let handle = consumer.handle();
    Flow::range(0, 4)
      .flat_map(|n| Flow::range(n * 10, 5))
      .subscribe(consumer);
    assert_eq!(handle.len(), 3);
    handle.request(2);
    assert_eq!(handle.len(), 5);
    handle.cancel();
  }

  proptest! {
    #[test]
    fn test_all_items_arrive_once(
      outer in 0u32..6,
      inner in 0u32..6,
      concurrency in 1usize..4,
      prefetch in 1usize..4,
    ) {
      let consumer = VecConsumer::new();
      let handle = consumer.handle();
      let config = FlatMapConfig::default()
        .with_max_concurrency(concurrency)
        .with_prefetch(prefetch);
      Flow::range(0, outer)
        .flat_map_with(move |n| Flow::range(n * 100, inner), config)
        .subscribe(consumer);
      let mut items = handle.items();
      items.sort();
      let mut expected: Vec<i32> = (0..outer as i32)
        .flat_map(|n| (0..inner as i32).map(move |i| n * 100 + i))
        .collect();
      expected.sort();
      prop_assert_eq!(items, expected);
      prop_assert!(handle.is_complete());
    }
  }
}
