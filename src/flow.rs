//! # Flow
//!
//! [`Flow<T>`] is the user-facing handle over a [`Producer<T>`]. It is cheap to
//! clone (one `Arc`) and every operator returns a new `Flow` without touching
//! the original, so a flow can be subscribed any number of times.
//!
//! ## Example
//!
//! ```rust
//! use fluxweave::consumers::VecConsumer;
//! use fluxweave::Flow;
//!
//! let consumer = VecConsumer::new();
//! let handle = consumer.handle();
//! Flow::range(1, 10)
//!   .filter(|x| x % 2 == 0)
//!   .map(|x| x * x)
//!   .take(3)
//!   .subscribe(consumer);
//! assert_eq!(handle.items(), vec![4, 16, 36]);
//! assert!(handle.is_complete());
//! ```

use crate::consumer::{BoxConsumer, Consumer};
use crate::consumers::{FlowStream, LambdaConsumer};
use crate::error::{ErrorStrategy, FlowError};
use crate::hub::{Hub, HubConfig};
use crate::producer::Producer;
use crate::producers::{
  DeferProducer, EmptyProducer, ErrorProducer, FactoryProducer, IntervalProducer, NeverProducer,
  Sink, StreamProducer,
};
use crate::scheduler::Scheduler;
use crate::subscription::{SubscriptionRef, UpstreamSlot};
use crate::transformer::{Lift, Transformer};
use crate::transformers::{
  AmbProducer, CapacityTransformer, FilterTransformer, FlatMapConfig, FlatMapTransformer,
  IgnoreElementsTransformer, LogTransformer, MapTransformer, PeekHooks, PeekTransformer,
  PublishOnTransformer, ResumeTransformer, RetryProducer, SubscribeOnProducer, SwitchTransformer,
  TakeTransformer, TimeoutTransformer, TryMapTransformer, ZipProducer,
};
use futures::Stream;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::Level;

/// Composable handle over a producer.
pub struct Flow<T> {
  producer: Arc<dyn Producer<T>>,
}

impl<T> Clone for Flow<T> {
  fn clone(&self) -> Self {
    Self {
      producer: self.producer.clone(),
    }
  }
}

impl<T> fmt::Debug for Flow<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Flow").finish_non_exhaustive()
  }
}

impl<T: Send + 'static> Producer<T> for Flow<T> {
  fn subscribe(&self, consumer: BoxConsumer<T>) {
    self.producer.subscribe(consumer);
  }
}

// Sources
impl<T: Send + 'static> Flow<T> {
  /// Wraps an arbitrary producer.
  pub fn from_producer<P>(producer: P) -> Self
  where
    P: Producer<T>,
  {
    Self {
      producer: Arc::new(producer),
    }
  }

  /// Cold source whose fulfillment function is handed the outstanding demand
  /// and emits through a [`Sink`].
  ///
  /// ```rust
  /// use fluxweave::consumers::VecConsumer;
  /// use fluxweave::producers::Sink;
  /// use fluxweave::Flow;
  ///
  /// let countdown = Flow::create(
  ///   || Ok(3u32),
  ///   |requested, sink: &mut Sink<'_, u32, u32>| {
  ///     for _ in 0..requested {
  ///       let left = *sink.context();
  ///       if left == 0 {
  ///         sink.complete();
  ///         break;
  ///       }
  ///       *sink.context() -= 1;
  ///       sink.next(left)?;
  ///     }
  ///     Ok(())
  ///   },
  ///   |_| Ok(()),
  /// );
  /// let consumer = VecConsumer::new();
  /// let handle = consumer.handle();
  /// countdown.subscribe(consumer);
  /// assert_eq!(handle.items(), vec![3, 2, 1]);
  /// ```
  pub fn create<C, CF, F, D>(context_factory: CF, fulfill: F, dispose: D) -> Self
  where
    C: Send + 'static,
    CF: Fn() -> Result<C, FlowError> + Send + Sync + 'static,
    F: Fn(u64, &mut Sink<'_, T, C>) -> Result<(), FlowError> + Send + Sync + 'static,
    D: Fn(C) -> Result<(), FlowError> + Send + Sync + 'static,
  {
    Self::from_producer(FactoryProducer::consumer_driven(
      context_factory,
      fulfill,
      dispose,
    ))
  }

  /// Cold source whose `next` function is called once per requested item.
  /// `Ok(None)` ends the sequence.
  pub fn generate<C, CF, N, D>(context_factory: CF, next: N, dispose: D) -> Self
  where
    C: Send + 'static,
    CF: Fn() -> Result<C, FlowError> + Send + Sync + 'static,
    N: Fn(&mut C) -> Result<Option<T>, FlowError> + Send + Sync + 'static,
    D: Fn(C) -> Result<(), FlowError> + Send + Sync + 'static,
  {
    Self::from_producer(FactoryProducer::loop_driven(context_factory, next, dispose))
  }

  /// Emits the items of `iter`, restarting from a fresh clone for every
  /// subscription.
  pub fn from_iter<I>(iter: I) -> Self
  where
    I: IntoIterator<Item = T> + Clone + Send + Sync + 'static,
    I::IntoIter: Send + 'static,
  {
    Self::generate(
      move || Ok(iter.clone().into_iter()),
      |items: &mut I::IntoIter| Ok(items.next()),
      |_| Ok(()),
    )
  }

  /// Emits `value` once, then completes.
  pub fn just(value: T) -> Self
  where
    T: Clone + Sync,
  {
    Self::from_iter(std::iter::once(value))
  }

  /// Completes right after subscription.
  pub fn empty() -> Self {
    Self::from_producer(EmptyProducer)
  }

  /// Fails with `error` right after subscription.
  pub fn error(error: FlowError) -> Self {
    Self::from_producer(ErrorProducer::new(error))
  }

  /// Never emits anything.
  pub fn never() -> Self {
    Self::from_producer(NeverProducer)
  }

  /// Builds the flow to subscribe to lazily, once per subscription.
  pub fn defer<F>(factory: F) -> Self
  where
    F: Fn() -> Flow<T> + Send + Sync + 'static,
  {
    Self::from_producer(DeferProducer::new(factory))
  }

  /// Drives the stream built by `factory` on `handle`, pulling only as many
  /// items as the consumer requested. A fresh stream is built per
  /// subscription.
  pub fn from_stream<S, F>(factory: F, handle: Handle) -> Self
  where
    F: Fn() -> S + Send + Sync + 'static,
    S: Stream<Item = T> + Send + 'static,
  {
    Self::from_producer(StreamProducer::new(factory, handle))
  }

  /// Subscribes to every source at once and interleaves their items.
  pub fn merge(sources: Vec<Flow<T>>) -> Self {
    Flow::from_iter(sources).flat_map(|flow| flow)
  }

  /// Subscribes to the sources one after the other.
  pub fn concat(sources: Vec<Flow<T>>) -> Self {
    Flow::from_iter(sources).concat_map(|flow| flow)
  }

  /// Mirrors whichever source signals first and cancels the others.
  pub fn amb(sources: Vec<Flow<T>>) -> Self {
    Self::from_producer(AmbProducer::new(sources))
  }

  /// Emits one row per index once every source has produced a value for it.
  pub fn zip_all(sources: Vec<Flow<T>>) -> Flow<Vec<T>> {
    Flow::from_producer(ZipProducer::new(sources, Ok))
  }
}

impl Flow<i32> {
  /// Emits `count` consecutive integers starting at `start`.
  pub fn range(start: i32, count: u32) -> Self {
    let Some(end) = start.checked_add_unsigned(count) else {
      return Flow::error(FlowError::Config(format!(
        "range {start}+{count} overflows i32"
      )));
    };
    Flow::from_iter(start..end)
  }
}

impl Flow<u64> {
  /// Emits `0, 1, 2, ...`, one value per `period`, on `scheduler`.
  ///
  /// A tick that finds no outstanding demand fails the flow with
  /// [`FlowError::MissingDemand`].
  pub fn interval<S: Scheduler>(period: Duration, scheduler: S) -> Self {
    Flow::from_producer(IntervalProducer::interval(period, Arc::new(scheduler)))
  }

  /// Emits `0` once after `delay`, then completes.
  pub fn timer<S: Scheduler>(delay: Duration, scheduler: S) -> Self {
    Flow::from_producer(IntervalProducer::timer(delay, Arc::new(scheduler)))
  }
}

impl<A: Send + 'static> Flow<A> {
  /// Pairs the items of two flows by index.
  pub fn zip<B: Send + 'static>(left: Flow<A>, right: Flow<B>) -> Flow<(A, B)> {
    left.zip_with(&right)
  }
}

// Subscribing
impl<T: Send + 'static> Flow<T> {
  /// Attaches `consumer`.
  pub fn subscribe<C>(&self, consumer: C)
  where
    C: Consumer<T>,
  {
    self.producer.subscribe(Box::new(consumer));
  }

  /// Attaches an already boxed consumer.
  pub fn subscribe_boxed(&self, consumer: BoxConsumer<T>) {
    self.producer.subscribe(consumer);
  }

  /// Requests everything and calls `on_next` for each item. The returned
  /// handle cancels the subscription.
  pub fn for_each<F>(&self, on_next: F) -> SubscriptionRef
  where
    F: FnMut(T) + Send + 'static,
  {
    let slot = Arc::new(UpstreamSlot::new());
    self.subscribe(LambdaConsumer::new(on_next).with_slot(slot.clone()));
    slot
  }

  /// Like [`Flow::for_each`] with terminal callbacks.
  pub fn subscribe_with<N, E, C>(&self, on_next: N, on_error: E, on_complete: C) -> SubscriptionRef
  where
    N: FnMut(T) + Send + 'static,
    E: FnOnce(FlowError) + Send + 'static,
    C: FnOnce() + Send + 'static,
  {
    let slot = Arc::new(UpstreamSlot::new());
    self.subscribe(
      LambdaConsumer::new(on_next)
        .with_error(on_error)
        .with_complete(on_complete)
        .with_slot(slot.clone()),
    );
    slot
  }

  /// Subscribes and exposes the items as a [`futures::Stream`] keeping at most
  /// `prefetch` items in flight. Dropping the stream cancels the subscription.
  pub fn into_stream(&self, prefetch: usize) -> FlowStream<T> {
    FlowStream::subscribe(self, prefetch)
  }

  /// Turns this cold flow into a hub connected to it.
  pub fn share(&self, config: HubConfig) -> Result<Hub<T>, FlowError>
  where
    T: Clone,
  {
    let hub = Hub::new(config)?;
    hub.connect(self);
    Ok(hub)
  }
}

// Operators
impl<T: Send + 'static> Flow<T> {
  /// Applies a transformer.
  pub fn lift<O, X>(&self, transformer: X) -> Flow<O>
  where
    O: Send + 'static,
    X: Transformer<T, O>,
  {
    Flow::from_producer(Lift::new(self.clone(), transformer))
  }

  /// Maps every item.
  pub fn map<O, F>(&self, f: F) -> Flow<O>
  where
    O: Send + 'static,
    F: Fn(T) -> O + Send + Sync + 'static,
  {
    self.lift(MapTransformer::new(f))
  }

  /// Maps every item; an `Err` cancels upstream and fails the flow.
  pub fn try_map<O, F>(&self, f: F) -> Flow<O>
  where
    O: Send + 'static,
    F: Fn(T) -> Result<O, FlowError> + Send + Sync + 'static,
  {
    self.lift(TryMapTransformer::new(f))
  }

  /// Keeps the items matching `predicate`.
  pub fn filter<F>(&self, predicate: F) -> Flow<T>
  where
    F: Fn(&T) -> bool + Send + Sync + 'static,
  {
    self.lift(FilterTransformer::new(predicate))
  }

  /// Maps every item to an inner flow and merges the inner flows with the
  /// default [`FlatMapConfig`].
  pub fn flat_map<O, F>(&self, f: F) -> Flow<O>
  where
    O: Send + 'static,
    F: Fn(T) -> Flow<O> + Send + Sync + 'static,
  {
    self.flat_map_with(f, FlatMapConfig::default())
  }

  /// [`Flow::flat_map`] with explicit concurrency and prefetch.
  pub fn flat_map_with<O, F>(&self, f: F, config: FlatMapConfig) -> Flow<O>
  where
    O: Send + 'static,
    F: Fn(T) -> Flow<O> + Send + Sync + 'static,
  {
    if let Err(error) = config.validate() {
      return Flow::error(error);
    }
    self.lift(FlatMapTransformer::new(f, config))
  }

  /// Maps every item to an inner flow and subscribes to them one at a time,
  /// in source order.
  pub fn concat_map<O, F>(&self, f: F) -> Flow<O>
  where
    O: Send + 'static,
    F: Fn(T) -> Flow<O> + Send + Sync + 'static,
  {
    self.flat_map_with(f, FlatMapConfig::default().with_max_concurrency(1))
  }

  /// Merges this flow with `other`.
  pub fn merge_with(&self, other: &Flow<T>) -> Flow<T> {
    Flow::merge(vec![self.clone(), other.clone()])
  }

  /// Appends `other` after this flow completes.
  pub fn concat_with(&self, other: &Flow<T>) -> Flow<T> {
    Flow::concat(vec![self.clone(), other.clone()])
  }

  /// Pairs the items of this flow and `other` by index.
  pub fn zip_with<B>(&self, other: &Flow<B>) -> Flow<(T, B)>
  where
    B: Send + 'static,
  {
    let left = self.map(Either::Left);
    let right = other.map(Either::Right);
    Flow::from_producer(ZipProducer::new(vec![left, right], |row: Vec<Either<T, B>>| {
      let mut cells = row.into_iter();
      match (cells.next(), cells.next()) {
        (Some(Either::Left(a)), Some(Either::Right(b))) => Ok((a, b)),
        _ => Err(FlowError::msg("zip row out of order")),
      }
    }))
  }

  /// Requests from upstream in chunks of at most `capacity`.
  pub fn capacity(&self, capacity: usize) -> Flow<T> {
    if capacity == 0 {
      return Flow::error(FlowError::Config("capacity must be at least 1".into()));
    }
    self.lift(CapacityTransformer::new(capacity))
  }

  /// Emits the first `n` items, then cancels upstream and completes.
  pub fn take(&self, n: u64) -> Flow<T> {
    self.lift(TakeTransformer::new(n))
  }

  /// Emits the first item only.
  pub fn first(&self) -> Flow<T> {
    self.take(1)
  }

  /// Drops every item and forwards the terminal signal.
  pub fn ignore_elements(&self) -> Flow<T> {
    self.lift(IgnoreElementsTransformer::new())
  }

  fn peek(&self, hooks: PeekHooks<T>) -> Flow<T> {
    self.lift(PeekTransformer::new(hooks))
  }

  /// Runs `f` when the downstream attaches.
  pub fn do_on_subscribe<F>(&self, f: F) -> Flow<T>
  where
    F: Fn() + Send + Sync + 'static,
  {
    self.peek(PeekHooks::default().on_subscribe(f))
  }

  /// Runs `f` on every item before it is forwarded.
  pub fn do_on_next<F>(&self, f: F) -> Flow<T>
  where
    F: Fn(&T) + Send + Sync + 'static,
  {
    self.peek(PeekHooks::default().on_next(f))
  }

  /// Runs `f` on the error before it is forwarded.
  pub fn do_on_error<F>(&self, f: F) -> Flow<T>
  where
    F: Fn(&FlowError) + Send + Sync + 'static,
  {
    self.peek(PeekHooks::default().on_error(f))
  }

  /// Runs `f` before completion is forwarded.
  pub fn do_on_complete<F>(&self, f: F) -> Flow<T>
  where
    F: Fn() + Send + Sync + 'static,
  {
    self.peek(PeekHooks::default().on_complete(f))
  }

  /// Runs `f` before either terminal signal is forwarded.
  pub fn do_on_terminate<F>(&self, f: F) -> Flow<T>
  where
    F: Fn() + Send + Sync + 'static,
  {
    self.peek(PeekHooks::default().on_terminate(f))
  }

  /// Runs `f` when the downstream cancels.
  pub fn do_on_cancel<F>(&self, f: F) -> Flow<T>
  where
    F: Fn() + Send + Sync + 'static,
  {
    self.peek(PeekHooks::default().on_cancel(f))
  }

  /// Runs `f` with every demand the downstream sends upstream.
  pub fn do_on_request<F>(&self, f: F) -> Flow<T>
  where
    F: Fn(u64) + Send + Sync + 'static,
  {
    self.peek(PeekHooks::default().on_request(f))
  }

  /// Emits a `tracing` event at `level` for every signal, request and cancel.
  pub fn log(&self, category: impl Into<String>, level: Level) -> Flow<T>
  where
    T: fmt::Debug,
  {
    self.lift(LogTransformer::new(category, level))
  }

  /// Resubscribes after an error as `strategy` decides.
  pub fn retry(&self, strategy: ErrorStrategy) -> Flow<T> {
    Flow::from_producer(RetryProducer::new(self.clone(), strategy))
  }

  /// Replaces an error with the flow returned by `fallback`.
  pub fn on_error_resume<F>(&self, fallback: F) -> Flow<T>
  where
    F: Fn(FlowError) -> Flow<T> + Send + Sync + 'static,
  {
    self.lift(ResumeTransformer::new(fallback))
  }

  /// Replaces an error with a single `value`, then completes.
  pub fn on_error_return(&self, value: T) -> Flow<T>
  where
    T: Clone + Sync,
  {
    self.on_error_resume(move |_| Flow::just(value.clone()))
  }

  /// Replaces an error with `fallback`.
  pub fn switch_on_error(&self, fallback: &Flow<T>) -> Flow<T> {
    let fallback = fallback.clone();
    self.on_error_resume(move |_| fallback.clone())
  }

  /// Fails with [`FlowError::Timeout`] when no signal arrives within
  /// `duration` of subscription or of the previous item.
  pub fn timeout<S: Scheduler>(&self, duration: Duration, scheduler: S) -> Flow<T> {
    self.lift(TimeoutTransformer::new(duration, Arc::new(scheduler)))
  }

  /// Delivers every signal on `scheduler`, in order.
  pub fn publish_on<S: Scheduler>(&self, scheduler: S) -> Flow<T> {
    self.lift(PublishOnTransformer::new(Arc::new(scheduler)))
  }

  /// Subscribes to this flow on `scheduler`.
  pub fn subscribe_on<S: Scheduler>(&self, scheduler: S) -> Flow<T> {
    Flow::from_producer(SubscribeOnProducer::new(self.clone(), Arc::new(scheduler)))
  }
}

impl<T: Send + 'static> Flow<Flow<T>> {
  /// Mirrors the most recent inner flow, cancelling the previous one.
  pub fn switch_on_next(&self) -> Flow<T> {
    self.lift(SwitchTransformer::new())
  }

  /// Merges the inner flows.
  pub fn flatten(&self) -> Flow<T> {
    self.flat_map(|flow| flow)
  }
}

enum Either<A, B> {
  Left(A),
  Right(B),
}
