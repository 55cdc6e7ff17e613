//! Interval and timer producers.
//!
//! [`IntervalProducer`] emits `0, 1, 2, ...` on a [`Scheduler`], one value per
//! period. Ticks are not buffered: a tick that fires while the consumer has no
//! outstanding demand fails the subscription with
//! [`FlowError::MissingDemand`]. Pair it with [`crate::Flow::capacity`] or a
//! consumer that keeps demand open.
//!
//! In timer mode a single `0` is emitted after the delay and the subscription
//! completes.

use crate::consumer::BoxConsumer;
use crate::demand::Demand;
use crate::error::{FlowError, ProtocolViolation};
use crate::producer::Producer;
use crate::scheduler::SchedulerRef;
use crate::subscription::{Drain, Subscription, SubscriptionRef, TerminalFlag};
use crate::sync::lock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, trace};

/// Emits a counter on a fixed period.
pub struct IntervalProducer {
  period: Duration,
  once: bool,
  scheduler: SchedulerRef,
}

impl IntervalProducer {
  /// Emits forever, one value per `period`.
  pub fn interval(period: Duration, scheduler: SchedulerRef) -> Self {
    Self {
      period,
      once: false,
      scheduler,
    }
  }

  /// Emits one value after `delay`, then completes.
  pub fn timer(delay: Duration, scheduler: SchedulerRef) -> Self {
    Self {
      period: delay,
      once: true,
      scheduler,
    }
  }
}

impl Producer<u64> for IntervalProducer {
  fn subscribe(&self, consumer: BoxConsumer<u64>) {
    let state = Arc::new(IntervalState {
      period: self.period,
      once: self.once,
      scheduler: self.scheduler.clone(),
      demand: Demand::new(),
      drain: Drain::new(),
      terminated: TerminalFlag::new(),
      violation: AtomicBool::new(false),
      fired: AtomicU64::new(0),
      failure: Mutex::new(None),
      consumer: Mutex::new(Some(consumer)),
      next_tick: AtomicU64::new(0),
    });
    let handle: SubscriptionRef = state.clone();
    state.drain(Some(handle));
    IntervalState::arm(&state);
  }
}

struct IntervalState {
  period: Duration,
  once: bool,
  scheduler: SchedulerRef,
  demand: Demand,
  drain: Drain,
  terminated: TerminalFlag,
  violation: AtomicBool,
  /// Ticks fired but not yet handled by the loop owner.
  fired: AtomicU64,
  failure: Mutex<Option<FlowError>>,
  consumer: Mutex<Option<BoxConsumer<u64>>>,
  next_tick: AtomicU64,
}

impl IntervalState {
  fn arm(state: &Arc<Self>) {
    if state.terminated.is_set() {
      return;
    }
    let tick_state = state.clone();
    let scheduled = state.scheduler.schedule_after(
      state.period,
      Box::new(move || {
        tick_state.fired.fetch_add(1, Ordering::AcqRel);
        tick_state.drain(None);
        if !tick_state.once {
          IntervalState::arm(&tick_state);
        }
      }),
    );
    if let Err(error) = scheduled {
      debug!(%error, "interval could not be scheduled");
      *lock(&state.failure) = Some(error);
      state.drain(None);
    }
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
          Some(consumer) => self.pass(consumer, attach.take()),
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

  fn pass(&self, consumer: &mut BoxConsumer<u64>, attach: Option<SubscriptionRef>) -> bool {
    if let Some(handle) = attach {
      consumer.on_subscribe(handle);
    }
    if let Some(error) = lock(&self.failure).take() {
      if self.terminated.try_set() {
        consumer.on_error(error);
      }
      return true;
    }
    if self.violation.swap(false, Ordering::AcqRel) {
      if self.terminated.try_set() {
        consumer.on_error(ProtocolViolation::NonPositiveRequest.into());
      }
      return true;
    }
    loop {
      if self.terminated.is_set() {
        return true;
      }
      if self.fired.load(Ordering::Acquire) == 0 {
        return false;
      }
      self.fired.fetch_sub(1, Ordering::AcqRel);
      let tick = self.next_tick.fetch_add(1, Ordering::AcqRel);
      if !self.demand.try_consume() {
        if self.terminated.try_set() {
          consumer.on_error(FlowError::MissingDemand { tick });
        }
        return true;
      }
      trace!(tick, "tick");
      consumer.on_next(tick);
      if self.once {
        if self.terminated.try_set() {
          consumer.on_complete();
        }
        return true;
      }
    }
  }
}

impl Subscription for IntervalState {
  fn request(&self, n: u64) {
    if n == 0 {
      self.violation.store(true, Ordering::Release);
      self.drain(None);
    } else {
      self.demand.add(n);
    }
  }

  fn cancel(&self) {
    if self.terminated.try_set() {
      self.drain(None);
    }
  }
}
