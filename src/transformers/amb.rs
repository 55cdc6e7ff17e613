//! First-to-signal race (`amb`).
//!
//! Subscribes to every candidate and mirrors whichever emits first (an item,
//! a completion or an error). The losers are cancelled the moment the winner
//! is known. Demand requested before that goes to every candidate; after it,
//! only to the winner.

use crate::consumer::{BoxConsumer, Consumer, SerializedConsumer};
use crate::error::{FlowError, ProtocolViolation};
use crate::flow::Flow;
use crate::producer::Producer;
use crate::subscription::{Subscription, SubscriptionRef, UpstreamSlot, noop};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tracing::trace;

const NO_WINNER: usize = usize::MAX;

/// Mirrors the first of several flows to signal.
pub struct AmbProducer<T> {
  sources: Vec<Flow<T>>,
}

impl<T> AmbProducer<T> {
  /// Creates the race.
  pub fn new(sources: Vec<Flow<T>>) -> Self {
    Self { sources }
  }
}

impl<T: Send + 'static> Producer<T> for AmbProducer<T> {
  fn subscribe(&self, mut consumer: BoxConsumer<T>) {
    if self.sources.is_empty() {
      consumer.on_subscribe(noop());
      consumer.on_complete();
      return;
    }
    let state = Arc::new(AmbState {
      downstream: SerializedConsumer::new(consumer),
      slots: self.sources.iter().map(|_| UpstreamSlot::new()).collect(),
      winner: AtomicUsize::new(NO_WINNER),
      cancelled: AtomicBool::new(false),
    });
    state.downstream.subscribe(Arc::new(AmbSubscription {
      state: state.clone(),
    }));
    for (index, source) in self.sources.iter().enumerate() {
      if state.cancelled.load(Ordering::Acquire) || !state.may_signal(index) {
        break;
      }
      source.subscribe(CandidateConsumer {
        index,
        state: state.clone(),
      });
    }
  }
}

struct AmbState<T> {
  downstream: SerializedConsumer<T>,
  slots: Vec<UpstreamSlot>,
  winner: AtomicUsize,
  cancelled: AtomicBool,
}

impl<T: Send + 'static> AmbState<T> {
  /// Claims the race for `index`. Returns whether `index` is (now) the winner.
  fn claim(&self, index: usize) -> bool {
    match self
      .winner
      .compare_exchange(NO_WINNER, index, Ordering::AcqRel, Ordering::Acquire)
    {
      Ok(_) => {
        trace!(winner = index, "amb race decided");
        for (other, slot) in self.slots.iter().enumerate() {
          if other != index {
            slot.cancel();
          }
        }
        true
      }
      Err(current) => current == index,
    }
  }

  fn may_signal(&self, index: usize) -> bool {
    let winner = self.winner.load(Ordering::Acquire);
    winner == NO_WINNER || winner == index
  }
}

struct AmbSubscription<T> {
  state: Arc<AmbState<T>>,
}

impl<T: Send + 'static> Subscription for AmbSubscription<T> {
  fn request(&self, n: u64) {
    if n == 0 {
      if !self.state.cancelled.swap(true, Ordering::AcqRel) {
        for slot in &self.state.slots {
          slot.cancel();
        }
        self
          .state
          .downstream
          .error(ProtocolViolation::NonPositiveRequest.into());
      }
      return;
    }
    match self.state.winner.load(Ordering::Acquire) {
      NO_WINNER => {
        for slot in &self.state.slots {
          slot.request(n);
        }
      }
      winner => self.state.slots[winner].request(n),
    }
  }

  fn cancel(&self) {
    if !self.state.cancelled.swap(true, Ordering::AcqRel) {
      for slot in &self.state.slots {
        slot.cancel();
      }
      self.state.downstream.cancel();
    }
  }
}

struct CandidateConsumer<T> {
  index: usize,
  state: Arc<AmbState<T>>,
}

impl<T: Send + 'static> Consumer<T> for CandidateConsumer<T> {
  fn on_subscribe(&mut self, subscription: SubscriptionRef) {
    if self.state.may_signal(self.index) {
      self.state.slots[self.index].set(subscription);
    } else {
      subscription.cancel();
    }
  }

  fn on_next(&mut self, item: T) {
    if self.state.claim(self.index) {
      self.state.downstream.next(item);
    }
  }

  fn on_error(&mut self, error: FlowError) {
    if self.state.claim(self.index) {
      self.state.downstream.error(error);
    }
  }

  fn on_complete(&mut self) {
    if self.state.claim(self.index) {
      self.state.downstream.complete();
    }
  }
}
