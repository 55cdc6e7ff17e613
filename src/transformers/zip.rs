//! # Zip
//!
//! Combines N flows by index: the k-th output is built from the k-th item of
//! every source.
//!
//! ## Demand
//!
//! Each unit of downstream demand starts one *round*: every source is asked
//! for exactly one item. When all slots are filled the row is handed to the
//! combiner and the slots are cleared for the next round. Sources are never
//! asked for more than one item ahead, so no source buffers unboundedly.
//!
//! ## Termination
//!
//! - The sequence completes as soon as some source has completed with an
//!   empty slot; no further row can ever be built. Every other source is
//!   cancelled.
//! - The first error from any source (or from the combiner) cancels the
//!   others and is delivered.
//! - Zipping zero sources completes immediately.

use crate::consumer::{BoxConsumer, Consumer, SerializedConsumer};
use crate::demand::Demand;
use crate::error::{FlowError, ProtocolViolation};
use crate::flow::Flow;
use crate::producer::Producer;
use crate::subscription::{Drain, Subscription, SubscriptionRef, UpstreamSlot, noop};
use crate::sync::lock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, trace};

/// Producer zipping a list of flows with a row combiner.
pub struct ZipProducer<T, F> {
  sources: Vec<Flow<T>>,
  combiner: Arc<F>,
}

impl<T, F> ZipProducer<T, F> {
  /// Creates a producer that combines one item of every source into one output.
  pub fn new(sources: Vec<Flow<T>>, combiner: F) -> Self {
    Self {
      sources,
      combiner: Arc::new(combiner),
    }
  }
}

impl<T, O, F> Producer<O> for ZipProducer<T, F>
where
  T: Send + 'static,
  O: Send + 'static,
  F: Fn(Vec<T>) -> Result<O, FlowError> + Send + Sync + 'static,
{
  fn subscribe(&self, mut consumer: BoxConsumer<O>) {
    if self.sources.is_empty() {
      consumer.on_subscribe(noop());
      consumer.on_complete();
      return;
    }
    let width = self.sources.len();
    let state = Arc::new(ZipState {
      downstream: SerializedConsumer::new(consumer),
      combiner: self.combiner.clone(),
      slots: (0..width).map(|_| UpstreamSlot::new()).collect(),
      rows: Mutex::new(Rows {
        values: (0..width).map(|_| None).collect(),
        done: vec![false; width],
        round_in_flight: false,
      }),
      demand: Demand::new(),
      drain: Drain::new(),
      finished: AtomicBool::new(false),
    });
    state.downstream.subscribe(Arc::new(ZipSubscription {
      state: state.clone(),
    }));
    for (index, source) in self.sources.iter().enumerate() {
      source.subscribe(SourceConsumer {
        index,
        state: state.clone(),
      });
    }
  }
}

struct Rows<T> {
  values: Vec<Option<T>>,
  done: Vec<bool>,
  round_in_flight: bool,
}

enum Step<T> {
  Emit(Vec<T>),
  Request,
  Complete,
  Idle,
}

struct ZipState<T, O, F> {
  downstream: SerializedConsumer<O>,
  combiner: Arc<F>,
  slots: Vec<UpstreamSlot>,
  rows: Mutex<Rows<T>>,
  demand: Demand,
  drain: Drain,
  finished: AtomicBool,
}

impl<T, O, F> ZipState<T, O, F>
where
  T: Send + 'static,
  O: Send + 'static,
  F: Fn(Vec<T>) -> Result<O, FlowError> + Send + Sync + 'static,
{
  fn drain(&self) {
    if !self.drain.enter() {
      return;
    }
    let mut missed = 1;
    loop {
      self.pass();
      missed = self.drain.leave(missed);
      if missed == 0 {
        break;
      }
    }
  }

  fn pass(&self) {
    loop {
      if self.finished.load(Ordering::Acquire) {
        return;
      }
      match self.next_step() {
        Step::Emit(row) => {
          self.demand.produced(1);
          match (self.combiner)(row) {
            Ok(output) => self.downstream.next(output),
            Err(error) => {
              self.fail(error);
              return;
            }
          }
        }
        Step::Request => {
          for slot in &self.slots {
            slot.request(1);
          }
          return;
        }
        Step::Complete => {
          if !self.finished.swap(true, Ordering::AcqRel) {
            trace!("zip source exhausted, completing");
            self.cancel_sources();
            self.downstream.complete();
          }
          return;
        }
        Step::Idle => return,
      }
    }
  }

  fn next_step(&self) -> Step<T> {
    let mut rows = lock(&self.rows);
    if rows.values.iter().all(Option::is_some) {
      rows.round_in_flight = false;
      let row = rows.values.iter_mut().filter_map(Option::take).collect();
      return Step::Emit(row);
    }
    let exhausted = rows
      .done
      .iter()
      .zip(rows.values.iter())
      .any(|(done, value)| *done && value.is_none());
    if exhausted {
      return Step::Complete;
    }
    if !rows.round_in_flight && self.demand.has_demand() {
      rows.round_in_flight = true;
      return Step::Request;
    }
    Step::Idle
  }

  fn fail(&self, error: FlowError) {
    if self.finished.swap(true, Ordering::AcqRel) {
      debug!(%error, "dropping error after zip terminated");
      return;
    }
    self.cancel_sources();
    self.downstream.error(error);
  }

  fn cancel_sources(&self) {
    for slot in &self.slots {
      slot.cancel();
    }
  }
}

struct ZipSubscription<T, O, F> {
  state: Arc<ZipState<T, O, F>>,
}

impl<T, O, F> Subscription for ZipSubscription<T, O, F>
where
  T: Send + 'static,
  O: Send + 'static,
  F: Fn(Vec<T>) -> Result<O, FlowError> + Send + Sync + 'static,
{
  fn request(&self, n: u64) {
    if n == 0 {
      self.state.fail(ProtocolViolation::NonPositiveRequest.into());
      return;
    }
    self.state.demand.add(n);
    self.state.drain();
  }

  fn cancel(&self) {
    if !self.state.finished.swap(true, Ordering::AcqRel) {
      self.state.cancel_sources();
      self.state.downstream.cancel();
    }
  }
}

struct SourceConsumer<T, O, F> {
  index: usize,
  state: Arc<ZipState<T, O, F>>,
}

impl<T, O, F> Consumer<T> for SourceConsumer<T, O, F>
where
  T: Send + 'static,
  O: Send + 'static,
  F: Fn(Vec<T>) -> Result<O, FlowError> + Send + Sync + 'static,
{
  fn on_subscribe(&mut self, subscription: SubscriptionRef) {
    self.state.slots[self.index].set(subscription);
  }

  fn on_next(&mut self, item: T) {
    lock(&self.state.rows).values[self.index] = Some(item);
    self.state.drain();
  }

  fn on_error(&mut self, error: FlowError) {
    self.state.fail(error);
  }

  fn on_complete(&mut self) {
    lock(&self.state.rows).done[self.index] = true;
    self.state.drain();
  }
}
