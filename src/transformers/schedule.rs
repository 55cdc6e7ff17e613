//! Thread hopping (`publish_on`, `subscribe_on`).
//!
//! [`PublishOnTransformer`] queues every signal and delivers the queue from a
//! task on the scheduler. At most one delivery task runs at a time, so the
//! downstream still sees its signals one at a time and in order.
//!
//! [`SubscribeOnProducer`] performs the subscription itself on the scheduler.

use crate::consumer::{BoxConsumer, Consumer};
use crate::error::FlowError;
use crate::flow::Flow;
use crate::producer::Producer;
use crate::scheduler::SchedulerRef;
use crate::signal::Signal;
use crate::subscription::{Drain, Subscription, SubscriptionRef};
use crate::sync::lock;
use crate::transformer::Transformer;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::trace;

/// Delivers signals on a scheduler.
#[derive(Clone)]
pub struct PublishOnTransformer {
  scheduler: SchedulerRef,
}

impl PublishOnTransformer {
  /// Creates the transformer.
  pub fn new(scheduler: SchedulerRef) -> Self {
    Self { scheduler }
  }
}

impl<T: Send + 'static> Transformer<T, T> for PublishOnTransformer {
  fn apply(&self, downstream: BoxConsumer<T>) -> BoxConsumer<T> {
    Box::new(PublishConsumer {
      state: Arc::new(PublishState {
        scheduler: self.scheduler.clone(),
        queue: Mutex::new(VecDeque::new()),
        downstream: Mutex::new(Some(downstream)),
        drain: Drain::new(),
        cancelled: AtomicBool::new(false),
      }),
    })
  }

  fn name(&self) -> &str {
    "publish_on"
  }
}

enum Step<T> {
  Subscribe(SubscriptionRef),
  Signal(Signal<T>),
}

struct PublishState<T> {
  scheduler: SchedulerRef,
  queue: Mutex<VecDeque<Step<T>>>,
  downstream: Mutex<Option<BoxConsumer<T>>>,
  drain: Drain,
  cancelled: AtomicBool,
}

impl<T: Send + 'static> PublishState<T> {
  fn push(self: &Arc<Self>, step: Step<T>) {
    lock(&self.queue).push_back(step);
    self.schedule();
  }

  fn schedule(self: &Arc<Self>) {
    if self.drain.enter() {
      let state = self.clone();
      self.scheduler.schedule(Box::new(move || state.run()));
    }
  }

  fn run(&self) {
    trace!("publish_on delivery task");
    let mut missed = 1;
    loop {
      self.deliver();
      missed = self.drain.leave(missed);
      if missed == 0 {
        break;
      }
    }
  }

  fn deliver(&self) {
    let mut downstream = lock(&self.downstream);
    loop {
      if self.cancelled.load(Ordering::Acquire) {
        lock(&self.queue).clear();
        downstream.take();
        return;
      }
      let Some(consumer) = downstream.as_mut() else {
        lock(&self.queue).clear();
        return;
      };
      let step = lock(&self.queue).pop_front();
      match step {
        None => return,
        Some(Step::Subscribe(subscription)) => consumer.on_subscribe(subscription),
        Some(Step::Signal(signal)) => {
          let terminal = signal.is_terminal();
          signal.dispatch(consumer);
          if terminal {
            downstream.take();
          }
        }
      }
    }
  }
}

struct PublishSubscription<T> {
  upstream: SubscriptionRef,
  state: Arc<PublishState<T>>,
}

impl<T: Send + 'static> Subscription for PublishSubscription<T> {
  fn request(&self, n: u64) {
    self.upstream.request(n);
  }

  fn cancel(&self) {
    if !self.state.cancelled.swap(true, Ordering::AcqRel) {
      self.upstream.cancel();
      self.state.schedule();
    }
  }
}

struct PublishConsumer<T> {
  state: Arc<PublishState<T>>,
}

impl<T: Send + 'static> Consumer<T> for PublishConsumer<T> {
  fn on_subscribe(&mut self, subscription: SubscriptionRef) {
    let subscription = Arc::new(PublishSubscription {
      upstream: subscription,
      state: self.state.clone(),
    });
    self.state.push(Step::Subscribe(subscription));
  }

  fn on_next(&mut self, item: T) {
    self.state.push(Step::Signal(Signal::Next(item)));
  }

  fn on_error(&mut self, error: FlowError) {
    self.state.push(Step::Signal(Signal::Error(error)));
  }

  fn on_complete(&mut self) {
    self.state.push(Step::Signal(Signal::Complete));
  }
}

/// Subscribes to a flow on a scheduler.
pub struct SubscribeOnProducer<T> {
  source: Flow<T>,
  scheduler: SchedulerRef,
}

impl<T> SubscribeOnProducer<T> {
  /// Creates the producer.
  pub fn new(source: Flow<T>, scheduler: SchedulerRef) -> Self {
    Self { source, scheduler }
  }
}

impl<T: Send + 'static> Producer<T> for SubscribeOnProducer<T> {
  fn subscribe(&self, consumer: BoxConsumer<T>) {
    let source = self.source.clone();
    self
      .scheduler
      .schedule(Box::new(move || source.subscribe_boxed(consumer)));
  }
}
