//! Outstanding-demand accounting.
//!
//! A [`Demand`] counts the items a consumer has authorized but not yet
//! received. It only moves through compare-and-set loops, so `request()` on
//! one thread and delivery on another never lose an update.
//!
//! ## Saturation rule
//!
//! [`UNBOUNDED`] (`u64::MAX`) is absorbing: adding to it, or any addition whose
//! sum would reach `u64::MAX`, leaves the counter at `UNBOUNDED` for good, and
//! consuming from it never decrements.

use std::sync::atomic::{AtomicU64, Ordering};

/// The distinguished "no limit" demand value.
pub const UNBOUNDED: u64 = u64::MAX;

/// Adds two demand values under the saturation rule.
#[inline]
pub fn saturating_add(current: u64, n: u64) -> u64 {
  if current == UNBOUNDED || n == UNBOUNDED {
    return UNBOUNDED;
  }
  current.saturating_add(n)
}

/// Lock-free outstanding-demand counter.
#[derive(Debug, Default)]
pub struct Demand {
  value: AtomicU64,
}

impl Demand {
  /// Creates a counter with no outstanding demand.
  pub fn new() -> Self {
    Self {
      value: AtomicU64::new(0),
    }
  }

  /// Adds `n` and returns the previous value.
  pub fn add(&self, n: u64) -> u64 {
    let mut current = self.value.load(Ordering::Acquire);
    loop {
      let next = saturating_add(current, n);
      if next == current {
        return current;
      }
      match self
        .value
        .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
      {
        Ok(previous) => return previous,
        Err(actual) => current = actual,
      }
    }
  }

  /// Takes one unit of demand. Returns `false` when none is outstanding.
  #[inline]
  pub fn try_consume(&self) -> bool {
    let mut current = self.value.load(Ordering::Acquire);
    loop {
      if current == 0 {
        return false;
      }
      if current == UNBOUNDED {
        return true;
      }
      match self.value.compare_exchange_weak(
        current,
        current - 1,
        Ordering::AcqRel,
        Ordering::Acquire,
      ) {
        Ok(_) => return true,
        Err(actual) => current = actual,
      }
    }
  }

  /// Records `n` delivered items, never going below zero.
  pub fn produced(&self, n: u64) {
    let mut current = self.value.load(Ordering::Acquire);
    loop {
      if current == UNBOUNDED || n == 0 {
        return;
      }
      let next = current.saturating_sub(n);
      match self
        .value
        .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
      {
        Ok(_) => return,
        Err(actual) => current = actual,
      }
    }
  }

  /// Current outstanding demand.
  #[inline]
  pub fn get(&self) -> u64 {
    self.value.load(Ordering::Acquire)
  }

  /// Whether the counter has saturated to [`UNBOUNDED`].
  #[inline]
  pub fn is_unbounded(&self) -> bool {
    self.get() == UNBOUNDED
  }

  /// Whether any demand is outstanding.
  #[inline]
  pub fn has_demand(&self) -> bool {
    self.get() > 0
  }
}
