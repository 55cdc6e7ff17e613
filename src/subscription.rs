//! # Demand-Negotiation Protocol
//!
//! A [`Subscription`] is the exclusive control channel between one producer
//! and one consumer. The consumer authorizes items with [`Subscription::request`]
//! and withdraws with [`Subscription::cancel`]; the producer answers with
//! signals on the consumer.
//!
//! ## Rules
//!
//! - `request(0)` is a protocol violation. It is reported to the consumer as an
//!   `Error` signal, never as a panic.
//! - Demand accumulates with saturation (see [`crate::demand`]).
//! - `cancel()` is idempotent. Only the first call has an effect.
//! - Neither call ever blocks or re-enters the consumer. Work triggered by a
//!   `request()` made from inside a signal handler is picked up by the
//!   fulfillment loop that is already running (see [`Drain`]).
//!
//! The building blocks in this module are shared by every producer and
//! operator in the crate:
//!
//! - [`Drain`]: the non-blocking loop-owner counter.
//! - [`TerminalFlag`]: the once-only terminal/cancelled flag.
//! - [`UpstreamSlot`]: holds an upstream subscription that may arrive later
//!   than the first `request()` or `cancel()` aimed at it.

use crate::demand::saturating_add;
use crate::sync::lock;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::trace;

/// Control channel from a consumer back to its producer.
pub trait Subscription: Send + Sync {
  /// Authorizes `n` more items. `n == 0` is a protocol violation.
  fn request(&self, n: u64);

  /// Stops the flow of signals and releases the producer's resources.
  fn cancel(&self);
}

/// Shared handle to a subscription.
pub type SubscriptionRef = Arc<dyn Subscription>;

/// Subscription that ignores every call.
///
/// Handed to consumers of producers that terminate right away.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSubscription;

impl Subscription for NoopSubscription {
  fn request(&self, _n: u64) {}

  fn cancel(&self) {}
}

/// Returns a [`NoopSubscription`] handle.
pub fn noop() -> SubscriptionRef {
  Arc::new(NoopSubscription)
}

/// Loop-owner counter for a fulfillment loop.
///
/// The caller that moves the counter from zero owns the loop. Everybody else
/// only bumps the counter, which tells the owner to make another pass. No
/// caller ever blocks or recurses.
///
/// ```rust
/// use fluxweave::subscription::Drain;
///
/// let drain = Drain::new();
/// if drain.enter() {
///   let mut missed = 1;
///   loop {
///     // deliver what is ready
///     missed = drain.leave(missed);
///     if missed == 0 {
///       break;
///     }
///   }
/// }
/// assert!(!drain.is_running());
/// ```
#[derive(Debug, Default)]
pub struct Drain {
  wip: AtomicUsize,
}

impl Drain {
  /// Creates an idle drain.
  pub fn new() -> Self {
    Self {
      wip: AtomicUsize::new(0),
    }
  }

  /// Registers work. Returns `true` when the caller became the loop owner.
  #[inline]
  pub fn enter(&self) -> bool {
    self.wip.fetch_add(1, Ordering::AcqRel) == 0
  }

  /// Acknowledges `missed` passes. Returns the passes registered meanwhile;
  /// zero means the owner has released the loop.
  #[inline]
  pub fn leave(&self, missed: usize) -> usize {
    self.wip.fetch_sub(missed, Ordering::AcqRel) - missed
  }

  /// Whether some caller currently owns the loop.
  pub fn is_running(&self) -> bool {
    self.wip.load(Ordering::Acquire) != 0
  }
}

/// Once-only flag guarding terminal delivery and cancellation.
#[derive(Debug, Default)]
pub struct TerminalFlag {
  set: AtomicBool,
}

impl TerminalFlag {
  /// Creates an unset flag.
  pub fn new() -> Self {
    Self {
      set: AtomicBool::new(false),
    }
  }

  /// Sets the flag. Only the first caller gets `true`.
  #[inline]
  pub fn try_set(&self) -> bool {
    self
      .set
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .is_ok()
  }

  /// Whether the flag has been set.
  #[inline]
  pub fn is_set(&self) -> bool {
    self.set.load(Ordering::Acquire)
  }
}

#[derive(Default)]
struct SlotState {
  subscription: Option<SubscriptionRef>,
  pending: u64,
  violation: bool,
  cancelled: bool,
}

/// Holder for an upstream subscription that may not exist yet.
///
/// Requests made before the upstream attaches accumulate and are replayed as a
/// single `request()` once it does; a `cancel()` made before it attaches
/// cancels it on arrival.
#[derive(Default)]
pub struct UpstreamSlot {
  state: Mutex<SlotState>,
}

impl UpstreamSlot {
  /// Creates an empty slot.
  pub fn new() -> Self {
    Self::default()
  }

  /// Installs the upstream subscription.
  ///
  /// Returns `false` if the slot was cancelled or already filled, in which case
  /// `subscription` has been cancelled.
  pub fn set(&self, subscription: SubscriptionRef) -> bool {
    let accepted = {
      let mut state = lock(&self.state);
      if state.cancelled || state.subscription.is_some() {
        None
      } else {
        state.subscription = Some(subscription.clone());
        let pending = std::mem::take(&mut state.pending);
        let violation = std::mem::take(&mut state.violation);
        Some((pending, violation))
      }
    };
    match accepted {
      None => {
        trace!("upstream arrived after cancel, cancelling it");
        subscription.cancel();
        false
      }
      Some((pending, violation)) => {
        if violation {
          subscription.request(0);
        } else if pending > 0 {
          subscription.request(pending);
        }
        true
      }
    }
  }

  /// Replaces the current upstream with a fresh one without cancelling the
  /// old one. Used when the old one has already terminated.
  ///
  /// Returns `false` if the slot was cancelled, in which case `subscription`
  /// has been cancelled.
  pub fn replace(&self, subscription: SubscriptionRef) -> bool {
    let cancelled = {
      let mut state = lock(&self.state);
      if !state.cancelled {
        state.subscription = Some(subscription.clone());
      }
      state.cancelled
    };
    if cancelled {
      subscription.cancel();
    }
    !cancelled
  }

  /// Forwards `n` upstream, or records it until the upstream attaches.
  pub fn request(&self, n: u64) {
    let target = {
      let mut state = lock(&self.state);
      if state.cancelled {
        return;
      }
      match &state.subscription {
        Some(subscription) => Some(subscription.clone()),
        None => {
          if n == 0 {
            state.violation = true;
          } else {
            state.pending = saturating_add(state.pending, n);
          }
          None
        }
      }
    };
    if let Some(subscription) = target {
      subscription.request(n);
    }
  }

  /// Cancels the upstream now or as soon as it attaches. Idempotent.
  pub fn cancel(&self) {
    let target = {
      let mut state = lock(&self.state);
      if state.cancelled {
        return;
      }
      state.cancelled = true;
      state.subscription.take()
    };
    if let Some(subscription) = target {
      subscription.cancel();
    }
  }

  /// Whether [`UpstreamSlot::cancel`] has been called.
  pub fn is_cancelled(&self) -> bool {
    lock(&self.state).cancelled
  }

  /// Whether an upstream subscription is installed.
  pub fn is_set(&self) -> bool {
    lock(&self.state).subscription.is_some()
  }
}

impl Subscription for UpstreamSlot {
  fn request(&self, n: u64) {
    UpstreamSlot::request(self, n);
  }

  fn cancel(&self) {
    UpstreamSlot::cancel(self);
  }
}
