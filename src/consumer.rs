//! # Consumer Trait
//!
//! This module defines the `Consumer` trait for components that receive
//! signals from a producer. Consumers are the end point of every flow; every
//! operator is also a consumer of its upstream.
//!
//! ## Contract
//!
//! A consumer receives:
//!
//! 1. exactly one [`Consumer::on_subscribe`],
//! 2. zero or more [`Consumer::on_next`], never more than it has requested,
//! 3. at most one of [`Consumer::on_complete`] / [`Consumer::on_error`].
//!
//! Calls to one consumer are never concurrent. Methods take `&mut self`; the
//! producer owns the consumer for the lifetime of the subscription and drops
//! it after the terminal signal or cancellation.
//!
//! ## Example
//!
//! ```rust
//! use fluxweave::consumer::Consumer;
//! use fluxweave::error::FlowError;
//! use fluxweave::subscription::SubscriptionRef;
//! use fluxweave::Flow;
//!
//! struct Printer {
//!   subscription: Option<SubscriptionRef>,
//! }
//!
//! impl Consumer<i32> for Printer {
//!   fn on_subscribe(&mut self, subscription: SubscriptionRef) {
//!     subscription.request(1);
//!     self.subscription = Some(subscription);
//!   }
//!
//!   fn on_next(&mut self, item: i32) {
//!     println!("{item}");
//!     if let Some(subscription) = &self.subscription {
//!       subscription.request(1);
//!     }
//!   }
//!
//!   fn on_error(&mut self, error: FlowError) {
//!     eprintln!("{error}");
//!   }
//!
//!   fn on_complete(&mut self) {}
//! }
//!
//! Flow::range(0, 3).subscribe(Printer { subscription: None });
//! ```
//!
//! ## Serialized delivery
//!
//! Operators that merge signals from several upstreams (merge, zip, amb,
//! switch, retry) hand them to a [`SerializedConsumer`], which queues them and
//! lets a single loop owner deliver them in order.

use crate::error::FlowError;
use crate::signal::Signal;
use crate::subscription::{Drain, SubscriptionRef, TerminalFlag};
use crate::sync::lock;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::trace;

/// Trait for components that receive signals.
pub trait Consumer<T>: Send + 'static {
  /// Called once, before any other signal, with the subscription to request from.
  fn on_subscribe(&mut self, subscription: SubscriptionRef);

  /// Called for each item, only while demand is outstanding.
  fn on_next(&mut self, item: T);

  /// Terminal failure.
  fn on_error(&mut self, error: FlowError);

  /// Terminal success.
  fn on_complete(&mut self);
}

impl<T, C> Consumer<T> for Box<C>
where
  C: Consumer<T> + ?Sized,
{
  fn on_subscribe(&mut self, subscription: SubscriptionRef) {
    (**self).on_subscribe(subscription);
  }

  fn on_next(&mut self, item: T) {
    (**self).on_next(item);
  }

  fn on_error(&mut self, error: FlowError) {
    (**self).on_error(error);
  }

  fn on_complete(&mut self) {
    (**self).on_complete();
  }
}

/// Boxed consumer, the currency of [`crate::producer::Producer::subscribe`].
pub type BoxConsumer<T> = Box<dyn Consumer<T>>;

struct Pending<T> {
  subscription: Option<SubscriptionRef>,
  subscribed: bool,
  signals: VecDeque<Signal<T>>,
}

/// Thread-safe front for a consumer that may be fed from several upstreams.
///
/// Signals are queued and delivered by whichever caller owns the drain loop,
/// so the wrapped consumer is never invoked concurrently or re-entrantly. The
/// first terminal signal wins; anything pushed after it is dropped. Signals
/// pushed before the subscription are held back until it is delivered.
pub struct SerializedConsumer<T> {
  pending: Mutex<Pending<T>>,
  downstream: Mutex<Option<BoxConsumer<T>>>,
  drain: Drain,
  terminated: TerminalFlag,
  cancelled: AtomicBool,
}

impl<T: Send + 'static> SerializedConsumer<T> {
  /// Wraps `downstream`.
  pub fn new(downstream: BoxConsumer<T>) -> Self {
    Self {
      pending: Mutex::new(Pending {
        subscription: None,
        subscribed: false,
        signals: VecDeque::new(),
      }),
      downstream: Mutex::new(Some(downstream)),
      drain: Drain::new(),
      terminated: TerminalFlag::new(),
      cancelled: AtomicBool::new(false),
    }
  }

  /// Queues the subscription. Only the first one is kept.
  pub fn push_subscribe(&self, subscription: SubscriptionRef) {
    let mut pending = lock(&self.pending);
    if !pending.subscribed && pending.subscription.is_none() {
      pending.subscription = Some(subscription);
    }
  }

  /// Queues an item. Returns `false` if the sequence already terminated.
  pub fn push_next(&self, item: T) -> bool {
    if self.terminated.is_set() || self.cancelled.load(Ordering::Acquire) {
      return false;
    }
    lock(&self.pending).signals.push_back(Signal::Next(item));
    true
  }

  /// Queues a failure. Returns `false` if another terminal got there first.
  pub fn push_error(&self, error: FlowError) -> bool {
    self.push_terminal(Signal::Error(error))
  }

  /// Queues completion. Returns `false` if another terminal got there first.
  pub fn push_complete(&self) -> bool {
    self.push_terminal(Signal::Complete)
  }

  fn push_terminal(&self, signal: Signal<T>) -> bool {
    if !self.terminated.try_set() {
      trace!(signal = signal.name(), "dropping terminal after terminal");
      return false;
    }
    lock(&self.pending).signals.push_back(signal);
    true
  }

  /// Queues the subscription and delivers.
  pub fn subscribe(&self, subscription: SubscriptionRef) {
    self.push_subscribe(subscription);
    self.drain();
  }

  /// Queues an item and delivers.
  pub fn next(&self, item: T) {
    if self.push_next(item) {
      self.drain();
    }
  }

  /// Queues a failure and delivers.
  pub fn error(&self, error: FlowError) {
    if self.push_error(error) {
      self.drain();
    }
  }

  /// Queues completion and delivers.
  pub fn complete(&self) {
    if self.push_complete() {
      self.drain();
    }
  }

  /// Stops all further delivery and drops the wrapped consumer.
  pub fn cancel(&self) {
    if !self.cancelled.swap(true, Ordering::AcqRel) {
      self.drain();
    }
  }

  /// Whether a terminal signal has been accepted.
  pub fn is_terminated(&self) -> bool {
    self.terminated.is_set()
  }

  /// Whether [`SerializedConsumer::cancel`] was called.
  pub fn is_cancelled(&self) -> bool {
    self.cancelled.load(Ordering::Acquire)
  }

  /// Delivers everything queued, unless another caller is already doing so.
  pub fn drain(&self) {
    if !self.drain.enter() {
      return;
    }
    let mut missed = 1;
    loop {
      self.deliver_pending();
      missed = self.drain.leave(missed);
      if missed == 0 {
        break;
      }
    }
  }

  fn deliver_pending(&self) {
    loop {
      if self.cancelled.load(Ordering::Acquire) {
        lock(&self.pending).signals.clear();
        lock(&self.downstream).take();
        return;
      }
      let step = {
        let mut pending = lock(&self.pending);
        if let Some(subscription) = pending.subscription.take() {
          pending.subscribed = true;
          Some(Step::Subscribe(subscription))
        } else if pending.subscribed {
          pending.signals.pop_front().map(Step::Signal)
        } else {
          None
        }
      };
      let Some(step) = step else {
        return;
      };
      let mut downstream = lock(&self.downstream);
      let Some(consumer) = downstream.as_mut() else {
        return;
      };
      match step {
        Step::Subscribe(subscription) => consumer.on_subscribe(subscription),
        Step::Signal(signal) => {
          let terminal = signal.is_terminal();
          signal.dispatch(consumer);
          if terminal {
            downstream.take();
            lock(&self.pending).signals.clear();
            return;
          }
        }
      }
    }
  }
}

enum Step<T> {
  Subscribe(SubscriptionRef),
  Signal(Signal<T>),
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::subscription::noop;
  use std::sync::Arc;

  #[derive(Default)]
  struct Log {
    events: Vec<String>,
  }

  struct Recorder(Arc<Mutex<Log>>);

  impl Consumer<i32> for Recorder {
    fn on_subscribe(&mut self, _subscription: SubscriptionRef) {
      self.0.lock().unwrap().events.push("subscribe".into());
    }

    fn on_next(&mut self, item: i32) {
      self.0.lock().unwrap().events.push(format!("next {item}"));
    }

    fn on_error(&mut self, error: FlowError) {
      self.0.lock().unwrap().events.push(format!("error {error}"));
    }

    fn on_complete(&mut self) {
      self.0.lock().unwrap().events.push("complete".into());
    }
  }

  fn recorder() -> (Arc<Mutex<Log>>, SerializedConsumer<i32>) {
    let log = Arc::new(Mutex::new(Log::default()));
    let serialized = SerializedConsumer::new(Box::new(Recorder(log.clone())));
    (log, serialized)
  }

  #[test]
  fn test_signals_wait_for_subscription() {
    let (log, serialized) = recorder();
    serialized.next(1);
    assert!(log.lock().unwrap().events.is_empty());
    serialized.subscribe(noop());
    assert_eq!(log.lock().unwrap().events, vec!["subscribe", "next 1"]);
  }

  #[test]
  fn test_single_terminal() {
    let (log, serialized) = recorder();
    serialized.subscribe(noop());
    serialized.complete();
    serialized.error(FlowError::msg("late"));
    serialized.next(5);
    assert_eq!(log.lock().unwrap().events, vec!["subscribe", "complete"]);
  }

  #[test]
  fn test_cancel_drops_queued() {
    let (log, serialized) = recorder();
    serialized.push_next(1);
    serialized.cancel();
    serialized.subscribe(noop());
    assert!(log.lock().unwrap().events.is_empty());
    assert!(serialized.is_cancelled());
  }

  #[test]
  fn test_concurrent_pushes_are_serialized() {
    let log = Arc::new(Mutex::new(Log::default()));
    let serialized = Arc::new(SerializedConsumer::new(Box::new(Recorder(log.clone()))));
    serialized.subscribe(noop());
    let handles: Vec<_> = (0..4)
      .map(|t| {
        let serialized = serialized.clone();
        std::thread::spawn(move || {
          for i in 0..100 {
            serialized.next(t * 100 + i);
          }
        })
      })
      .collect();
    for handle in handles {
      handle.join().unwrap();
    }
    serialized.complete();
    let events = &log.lock().unwrap().events;
    assert_eq!(events.len(), 402);
    assert_eq!(events.last().map(String::as_str), Some("complete"));
  }
}
