//! # Cold Source Factory
//!
//! Builds cold producers out of three collaborator functions:
//!
//! - a **context factory**, run once per attachment, that opens whatever the
//!   source reads from (a cursor, a connection, an iterator),
//! - a **fulfillment** function that turns demand into items,
//! - a **dispose** function, run exactly once when the subscription completes,
//!   fails or is cancelled.
//!
//! ## Fulfillment shapes
//!
//! The shape is picked once, at construction:
//!
//! - [`Fulfillment::PerRequest`] (consumer-driven): called with the outstanding
//!   demand and a [`Sink`]; it emits up to that many items itself.
//! - [`Fulfillment::PerItem`] (loop-driven): called once per item by the
//!   subscription's own loop; `Ok(None)` means the source is exhausted.
//!
//! Errors returned by either function, and panics raised inside them, become
//! an `Error` signal. Disposal runs before the terminal signal: if it fails on
//! natural completion the consumer sees `FlowError::Disposal` instead of
//! `on_complete`; otherwise the disposal failure is only logged.

use crate::consumer::BoxConsumer;
use crate::demand::Demand;
use crate::error::{FlowError, ProtocolViolation};
use crate::producer::Producer;
use crate::subscription::{Drain, Subscription, SubscriptionRef, TerminalFlag};
use crate::sync::lock;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, trace, warn};

type ContextFactory<C> = dyn Fn() -> Result<C, FlowError> + Send + Sync;
type Dispose<C> = dyn Fn(C) -> Result<(), FlowError> + Send + Sync;
type PerRequestFn<T, C> = dyn Fn(u64, &mut Sink<'_, T, C>) -> Result<(), FlowError> + Send + Sync;
type PerItemFn<T, C> = dyn Fn(&mut C) -> Result<Option<T>, FlowError> + Send + Sync;

/// How a factory turns demand into items.
pub enum Fulfillment<T, C> {
  /// Called once per loop pass with the outstanding demand.
  PerRequest(Arc<PerRequestFn<T, C>>),
  /// Called once per item.
  PerItem(Arc<PerItemFn<T, C>>),
}

impl<T, C> Clone for Fulfillment<T, C> {
  fn clone(&self) -> Self {
    match self {
      Fulfillment::PerRequest(f) => Fulfillment::PerRequest(f.clone()),
      Fulfillment::PerItem(f) => Fulfillment::PerItem(f.clone()),
    }
  }
}

enum Outcome {
  Complete,
  Error(FlowError),
}

/// Emission handle given to consumer-driven fulfillment functions.
pub struct Sink<'a, T, C> {
  consumer: &'a mut BoxConsumer<T>,
  context: &'a mut C,
  demand: &'a Demand,
  terminated: &'a TerminalFlag,
  outcome: Option<Outcome>,
}

impl<'a, T: 'static, C> Sink<'a, T, C> {
  /// The per-subscription context.
  pub fn context(&mut self) -> &mut C {
    self.context
  }

  /// Demand still outstanding.
  pub fn requested(&self) -> u64 {
    self.demand.get()
  }

  /// Whether the consumer cancelled. Fulfillment should stop emitting.
  pub fn is_cancelled(&self) -> bool {
    self.terminated.is_set()
  }

  /// Delivers one item.
  ///
  /// Fails without delivering when the sequence already ended, the consumer
  /// cancelled, or no demand is outstanding.
  pub fn next(&mut self, item: T) -> Result<(), FlowError> {
    if self.outcome.is_some() {
      return Err(ProtocolViolation::SignalAfterTerminal.into());
    }
    if self.terminated.is_set() {
      return Err(FlowError::Cancelled);
    }
    if !self.demand.has_demand() {
      return Err(ProtocolViolation::DemandExceeded.into());
    }
    self.consumer.on_next(item);
    self.demand.produced(1);
    Ok(())
  }

  /// Ends the sequence successfully once fulfillment returns.
  pub fn complete(&mut self) {
    if self.outcome.is_none() {
      self.outcome = Some(Outcome::Complete);
    }
  }

  /// Ends the sequence with `error` once fulfillment returns.
  pub fn error(&mut self, error: FlowError) {
    if self.outcome.is_none() {
      self.outcome = Some(Outcome::Error(error));
    }
  }
}

/// Cold producer assembled from context, fulfillment and disposal functions.
pub struct FactoryProducer<T, C> {
  context_factory: Arc<ContextFactory<C>>,
  fulfillment: Fulfillment<T, C>,
  dispose: Arc<Dispose<C>>,
}

impl<T, C> FactoryProducer<T, C>
where
  T: Send + 'static,
  C: Send + 'static,
{
  /// Creates a factory with an explicit fulfillment shape.
  pub fn new<CF, D>(context_factory: CF, fulfillment: Fulfillment<T, C>, dispose: D) -> Self
  where
    CF: Fn() -> Result<C, FlowError> + Send + Sync + 'static,
    D: Fn(C) -> Result<(), FlowError> + Send + Sync + 'static,
  {
    Self {
      context_factory: Arc::new(context_factory),
      fulfillment,
      dispose: Arc::new(dispose),
    }
  }

  /// Consumer-driven factory: `fulfill` loops up to the demand it is given.
  pub fn consumer_driven<CF, F, D>(context_factory: CF, fulfill: F, dispose: D) -> Self
  where
    CF: Fn() -> Result<C, FlowError> + Send + Sync + 'static,
    F: Fn(u64, &mut Sink<'_, T, C>) -> Result<(), FlowError> + Send + Sync + 'static,
    D: Fn(C) -> Result<(), FlowError> + Send + Sync + 'static,
  {
    Self::new(
      context_factory,
      Fulfillment::PerRequest(Arc::new(fulfill)),
      dispose,
    )
  }

  /// Loop-driven factory: `next` produces a single item per call.
  pub fn loop_driven<CF, N, D>(context_factory: CF, next: N, dispose: D) -> Self
  where
    CF: Fn() -> Result<C, FlowError> + Send + Sync + 'static,
    N: Fn(&mut C) -> Result<Option<T>, FlowError> + Send + Sync + 'static,
    D: Fn(C) -> Result<(), FlowError> + Send + Sync + 'static,
  {
    Self::new(context_factory, Fulfillment::PerItem(Arc::new(next)), dispose)
  }
}

impl<T, C> Producer<T> for FactoryProducer<T, C>
where
  T: Send + 'static,
  C: Send + 'static,
{
  fn subscribe(&self, consumer: BoxConsumer<T>) {
    let factory = self.context_factory.clone();
    let (context, startup_error) = match catch_unwind(AssertUnwindSafe(|| factory())) {
      Ok(Ok(context)) => (Some(context), None),
      Ok(Err(error)) => (None, Some(error)),
      Err(panic) => (None, Some(FlowError::from_panic(panic))),
    };
    if let Some(error) = &startup_error {
      debug!(%error, "context factory failed");
    }
    let subscription = Arc::new(FactorySubscription {
      demand: Demand::new(),
      drain: Drain::new(),
      terminated: TerminalFlag::new(),
      violation: AtomicBool::new(false),
      fulfillment: self.fulfillment.clone(),
      dispose: self.dispose.clone(),
      state: Mutex::new(Some(LoopState {
        consumer,
        context,
        startup_error,
      })),
    });
    let handle: SubscriptionRef = subscription.clone();
    subscription.run(Some(handle));
  }
}

struct LoopState<T, C> {
  consumer: BoxConsumer<T>,
  context: Option<C>,
  startup_error: Option<FlowError>,
}

struct FactorySubscription<T, C> {
  demand: Demand,
  drain: Drain,
  terminated: TerminalFlag,
  violation: AtomicBool,
  fulfillment: Fulfillment<T, C>,
  dispose: Arc<Dispose<C>>,
  state: Mutex<Option<LoopState<T, C>>>,
}

impl<T, C> FactorySubscription<T, C>
where
  T: Send + 'static,
  C: Send + 'static,
{
  fn run(&self, mut attach: Option<SubscriptionRef>) {
    if !self.drain.enter() {
      return;
    }
    let mut missed = 1;
    loop {
      {
        let mut guard = lock(&self.state);
        let finished = match guard.as_mut() {
          Some(state) => self.pass(state, attach.take()),
          None => false,
        };
        if finished {
          *guard = None;
        }
      }
      missed = self.drain.leave(missed);
      if missed == 0 {
        break;
      }
    }
  }

  /// One pass of the fulfillment loop. Returns `true` once the subscription
  /// is finished and its state can be dropped.
  fn pass(&self, state: &mut LoopState<T, C>, attach: Option<SubscriptionRef>) -> bool {
    if let Some(handle) = attach {
      state.consumer.on_subscribe(handle);
    }
    if let Some(error) = state.startup_error.take() {
      if self.terminated.try_set() {
        state.consumer.on_error(error);
      }
      return true;
    }
    if self.terminated.is_set() {
      self.dispose_quietly(state, "cancel");
      return true;
    }
    if self.violation.swap(false, Ordering::AcqRel) {
      warn!("request(0) received, terminating subscription");
      return self.finish(
        state,
        Some(ProtocolViolation::NonPositiveRequest.into()),
      );
    }
    match self.fulfillment.clone() {
      Fulfillment::PerItem(next) => self.pass_per_item(state, next.as_ref()),
      Fulfillment::PerRequest(fulfill) => self.pass_per_request(state, fulfill.as_ref()),
    }
  }

  fn pass_per_item(&self, state: &mut LoopState<T, C>, next: &PerItemFn<T, C>) -> bool {
    loop {
      if self.terminated.is_set() {
        self.dispose_quietly(state, "cancel");
        return true;
      }
      if !self.demand.has_demand() {
        return false;
      }
      let Some(context) = state.context.as_mut() else {
        return true;
      };
      match catch_unwind(AssertUnwindSafe(|| next(context))) {
        Ok(Ok(Some(item))) => {
          if self.terminated.is_set() {
            trace!("dropping item obtained after cancel");
            self.dispose_quietly(state, "cancel");
            return true;
          }
          state.consumer.on_next(item);
          self.demand.produced(1);
        }
        Ok(Ok(None)) => return self.finish(state, None),
        Ok(Err(error)) => return self.finish(state, Some(error)),
        Err(panic) => return self.finish(state, Some(FlowError::from_panic(panic))),
      }
    }
  }

  fn pass_per_request(&self, state: &mut LoopState<T, C>, fulfill: &PerRequestFn<T, C>) -> bool {
    let requested = self.demand.get();
    if requested == 0 {
      return false;
    }
    let Some(context) = state.context.as_mut() else {
      return true;
    };
    let mut sink = Sink {
      consumer: &mut state.consumer,
      context,
      demand: &self.demand,
      terminated: &self.terminated,
      outcome: None,
    };
    trace!(requested, "fulfilling request");
    let result = catch_unwind(AssertUnwindSafe(|| fulfill(requested, &mut sink)));
    let outcome = sink.outcome.take();
    if self.terminated.is_set() {
      self.dispose_quietly(state, "cancel");
      return true;
    }
    match (result, outcome) {
      (Err(panic), _) => self.finish(state, Some(FlowError::from_panic(panic))),
      (Ok(Err(error)), _) => self.finish(state, Some(error)),
      (Ok(Ok(())), Some(Outcome::Complete)) => self.finish(state, None),
      (Ok(Ok(())), Some(Outcome::Error(error))) => self.finish(state, Some(error)),
      (Ok(Ok(())), None) => false,
    }
  }

  /// Disposes the context and delivers the terminal signal, unless a cancel
  /// won the race for the terminal flag.
  fn finish(&self, state: &mut LoopState<T, C>, error: Option<FlowError>) -> bool {
    if !self.terminated.try_set() {
      self.dispose_quietly(state, "cancel");
      return true;
    }
    let disposed = match state.context.take() {
      Some(context) => (self.dispose)(context),
      None => Ok(()),
    };
    match (error, disposed) {
      (None, Ok(())) => state.consumer.on_complete(),
      (None, Err(failure)) => state.consumer.on_error(FlowError::Disposal(Box::new(failure))),
      (Some(error), Ok(())) => state.consumer.on_error(error),
      (Some(error), Err(failure)) => {
        warn!(%failure, "disposal failed after error, not reported");
        state.consumer.on_error(error);
      }
    }
    true
  }

  fn dispose_quietly(&self, state: &mut LoopState<T, C>, reason: &'static str) {
    if let Some(context) = state.context.take() {
      if let Err(failure) = (self.dispose)(context) {
        warn!(%failure, reason, "disposal failed, not reported");
      }
    }
  }
}

impl<T, C> Subscription for FactorySubscription<T, C>
where
  T: Send + 'static,
  C: Send + 'static,
{
  fn request(&self, n: u64) {
    if n == 0 {
      self.violation.store(true, Ordering::Release);
    } else {
      self.demand.add(n);
    }
    self.run(None);
  }

  fn cancel(&self) {
    if self.terminated.try_set() {
      trace!("subscription cancelled");
      self.run(None);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::Flow;
  use crate::consumers::VecConsumer;
  use crate::demand::UNBOUNDED;
  use std::sync::atomic::AtomicUsize;

  fn counting_source(limit: u32, disposals: Arc<AtomicUsize>) -> Flow<u32> {
    Flow::generate(
      || Ok(0u32),
      move |n: &mut u32| {
        if *n >= limit {
          return Ok(None);
        }
        *n += 1;
        Ok(Some(*n))
      },
      move |_| {
        disposals.fetch_add(1, Ordering::SeqCst);
        Ok(())
      },
    )
  }

  #[test]
  fn test_loop_driven_respects_demand() {
    let disposals = Arc::new(AtomicUsize::new(0));
    let consumer = VecConsumer::with_initial_request(2);
    let handle = consumer.handle();
    counting_source(10, disposals.clone()).subscribe(consumer);
    assert_eq!(handle.items(), vec![1, 2]);
    handle.request(3);
    assert_eq!(handle.items(), vec![1, 2, 3, 4, 5]);
    assert!(!handle.is_terminated());
    assert_eq!(disposals.load(Ordering::SeqCst), 0);
  }

  #[test]
  fn test_loop_driven_completes_and_disposes_once() {
    let disposals = Arc::new(AtomicUsize::new(0));
    let consumer = VecConsumer::new();
    let handle = consumer.handle();
    counting_source(3, disposals.clone()).subscribe(consumer);
    assert_eq!(handle.items(), vec![1, 2, 3]);
    assert!(handle.is_complete());
    handle.cancel();
    assert_eq!(disposals.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn test_cancel_disposes_once() {
    let disposals = Arc::new(AtomicUsize::new(0));
    let consumer = VecConsumer::with_initial_request(1);
    let handle = consumer.handle();
    counting_source(10, disposals.clone()).subscribe(consumer);
    handle.cancel();
    handle.cancel();
    handle.request(5);
    assert_eq!(handle.items(), vec![1]);
    assert!(!handle.is_terminated());
    assert_eq!(disposals.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn test_zero_request_is_protocol_violation() {
    let disposals = Arc::new(AtomicUsize::new(0));
    let consumer = VecConsumer::with_initial_request(1);
    let handle = consumer.handle();
    counting_source(10, disposals.clone()).subscribe(consumer);
    handle.request(0);
    assert!(matches!(
      handle.error(),
      Some(FlowError::Protocol(ProtocolViolation::NonPositiveRequest))
    ));
    assert_eq!(disposals.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn test_consumer_driven_receives_outstanding_demand() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorded = seen.clone();
    let flow = Flow::create(
      || Ok(0u64),
      move |requested, sink: &mut Sink<'_, u64, u64>| {
        recorded.lock().unwrap().push(requested);
        for _ in 0..requested {
          let value = *sink.context();
          *sink.context() += 1;
          sink.next(value)?;
        }
        Ok(())
      },
      |_| Ok(()),
    );
    let consumer = VecConsumer::with_initial_request(3);
    let handle = consumer.handle();
    flow.subscribe(consumer);
    handle.request(2);
    assert_eq!(handle.items(), vec![0, 1, 2, 3, 4]);
    assert_eq!(*seen.lock().unwrap(), vec![3, 2]);
  }

  #[test]
  fn test_consumer_driven_overemission_is_rejected() {
    let flow = Flow::create(
      || Ok(()),
      |_requested, sink: &mut Sink<'_, u32, ()>| {
        sink.next(1)?;
        sink.next(2)?;
        Ok(())
      },
      |_| Ok(()),
    );
    let consumer = VecConsumer::with_initial_request(1);
    let handle = consumer.handle();
    flow.subscribe(consumer);
    assert_eq!(handle.items(), vec![1]);
    assert!(matches!(
      handle.error(),
      Some(FlowError::Protocol(ProtocolViolation::DemandExceeded))
    ));
  }

  #[test]
  fn test_fulfillment_panic_becomes_error() {
    let flow: Flow<u32> = Flow::generate(|| Ok(()), |_| panic!("boom"), |_| Ok(()));
    let consumer = VecConsumer::new();
    let handle = consumer.handle();
    flow.subscribe(consumer);
    assert!(matches!(handle.error(), Some(FlowError::Panicked(msg)) if msg == "boom"));
  }

  #[test]
  fn test_context_factory_failure() {
    let disposals = Arc::new(AtomicUsize::new(0));
    let counted = disposals.clone();
    let flow: Flow<u32> = Flow::generate(
      || Err::<(), _>(FlowError::msg("no connection")),
      |_| Ok(Some(1)),
      move |_| {
        counted.fetch_add(1, Ordering::SeqCst);
        Ok(())
      },
    );
    let consumer = VecConsumer::new();
    let handle = consumer.handle();
    flow.subscribe(consumer);
    assert!(handle.is_subscribed());
    assert!(matches!(handle.error(), Some(FlowError::Message(m)) if m == "no connection"));
    assert_eq!(disposals.load(Ordering::SeqCst), 0);
  }

  #[test]
  fn test_disposal_failure_replaces_completion() {
    let flow = Flow::generate(
      || Ok(0u32),
      |n: &mut u32| {
        *n += 1;
        Ok((*n <= 2).then_some(*n))
      },
      |_| Err(FlowError::msg("close failed")),
    );
    let consumer = VecConsumer::with_initial_request(UNBOUNDED);
    let handle = consumer.handle();
    flow.subscribe(consumer);
    assert_eq!(handle.items(), vec![1, 2]);
    assert!(!handle.is_complete());
    assert!(matches!(handle.error(), Some(FlowError::Disposal(_))));
  }

  #[test]
  fn test_disposal_failure_after_error_keeps_original() {
    let flow: Flow<u32> = Flow::generate(
      || Ok(()),
      |_| Err(FlowError::msg("read failed")),
      |_| Err(FlowError::msg("close failed")),
    );
    let consumer = VecConsumer::new();
    let handle = consumer.handle();
    flow.subscribe(consumer);
    assert!(matches!(handle.error(), Some(FlowError::Message(m)) if m == "read failed"));
  }

  #[test]
  fn test_each_attachment_gets_fresh_context() {
    let created = Arc::new(AtomicUsize::new(0));
    let counter = created.clone();
    let flow: Flow<u32> = Flow::generate(
      move || Ok(counter.fetch_add(1, Ordering::SeqCst) as u32 * 10),
      |n: &mut u32| {
        *n += 1;
        Ok(Some(*n))
      },
      |_| Ok(()),
    );
    let first = VecConsumer::with_initial_request(2);
    let first_handle = first.handle();
    flow.subscribe(first);
    let second = VecConsumer::with_initial_request(2);
    let second_handle = second.handle();
    flow.subscribe(second);
    assert_eq!(first_handle.items(), vec![1, 2]);
    assert_eq!(second_handle.items(), vec![11, 12]);
    assert_eq!(created.load(Ordering::SeqCst), 2);
    first_handle.cancel();
    second_handle.cancel();
  }
}
