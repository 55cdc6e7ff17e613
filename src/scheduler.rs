//! # Schedulers
//!
//! Execution contexts for time-based producers ([`crate::Flow::interval`],
//! [`crate::Flow::timer`]), timed operators ([`crate::Flow::timeout`]) and
//! thread hopping ([`crate::Flow::publish_on`], [`crate::Flow::subscribe_on`]).
//!
//! There is no process-wide default: a scheduler is always passed explicitly.
//!
//! - [`ImmediateScheduler`] runs tasks inline and cannot delay them.
//! - [`TokioScheduler`] spawns tasks on a tokio runtime.
//! - [`VirtualScheduler`] runs tasks against a manual clock, for tests.

use crate::error::FlowError;
use crate::sync::lock;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::trace;

/// A unit of work handed to a scheduler.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Execution context for scheduled work.
pub trait Scheduler: Send + Sync + 'static {
  /// Runs `task` as soon as possible.
  fn schedule(&self, task: Task);

  /// Runs `task` once `delay` has elapsed.
  ///
  /// Fails with [`FlowError::Config`] when the scheduler cannot delay work.
  fn schedule_after(&self, delay: Duration, task: Task) -> Result<(), FlowError>;
}

/// Shared handle to a scheduler.
pub type SchedulerRef = Arc<dyn Scheduler>;

impl<S: Scheduler + ?Sized> Scheduler for Arc<S> {
  fn schedule(&self, task: Task) {
    (**self).schedule(task);
  }

  fn schedule_after(&self, delay: Duration, task: Task) -> Result<(), FlowError> {
    (**self).schedule_after(delay, task)
  }
}

/// Runs every task on the calling thread, right away.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImmediateScheduler;

impl Scheduler for ImmediateScheduler {
  fn schedule(&self, task: Task) {
    task();
  }

  fn schedule_after(&self, delay: Duration, _task: Task) -> Result<(), FlowError> {
    Err(FlowError::Config(format!(
      "ImmediateScheduler cannot delay work by {delay:?}"
    )))
  }
}

/// Spawns tasks on a tokio runtime.
#[derive(Debug, Clone)]
pub struct TokioScheduler {
  handle: Handle,
}

impl TokioScheduler {
  /// Schedules onto the runtime behind `handle`.
  pub fn new(handle: Handle) -> Self {
    Self { handle }
  }

  /// Schedules onto the runtime the caller is running in.
  ///
  /// Fails outside of a tokio runtime.
  pub fn current() -> Result<Self, FlowError> {
    Handle::try_current()
      .map(Self::new)
      .map_err(|e| FlowError::Config(format!("no tokio runtime: {e}")))
  }
}

impl Scheduler for TokioScheduler {
  fn schedule(&self, task: Task) {
    self.handle.spawn(async move { task() });
  }

  fn schedule_after(&self, delay: Duration, task: Task) -> Result<(), FlowError> {
    self.handle.spawn(async move {
      tokio::time::sleep(delay).await;
      task();
    });
    Ok(())
  }
}

#[derive(Default)]
struct VirtualClock {
  now: Duration,
  sequence: u64,
  queue: BTreeMap<(Duration, u64), Task>,
}

/// Scheduler driven by a manual clock.
///
/// Nothing runs until [`VirtualScheduler::advance`] or
/// [`VirtualScheduler::run_pending`] is called. Tasks run in due-time order,
/// and tasks scheduled while running are picked up in the same call if they
/// are already due.
///
/// ```rust
/// use fluxweave::scheduler::{Scheduler, VirtualScheduler};
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// let scheduler = VirtualScheduler::new();
/// let fired = Arc::new(AtomicUsize::new(0));
/// let counter = fired.clone();
/// scheduler
///   .schedule_after(Duration::from_secs(1), Box::new(move || {
///     counter.fetch_add(1, Ordering::SeqCst);
///   }))
///   .unwrap();
/// scheduler.advance(Duration::from_millis(999));
/// assert_eq!(fired.load(Ordering::SeqCst), 0);
/// scheduler.advance(Duration::from_millis(1));
/// assert_eq!(fired.load(Ordering::SeqCst), 1);
/// ```
#[derive(Clone, Default)]
pub struct VirtualScheduler {
  clock: Arc<Mutex<VirtualClock>>,
}

impl VirtualScheduler {
  /// Creates a scheduler at time zero.
  pub fn new() -> Self {
    Self::default()
  }

  /// Current virtual time.
  pub fn now(&self) -> Duration {
    lock(&self.clock).now
  }

  /// Number of tasks waiting to run.
  pub fn pending(&self) -> usize {
    lock(&self.clock).queue.len()
  }

  /// Moves the clock forward by `by`, running every task that falls due, in
  /// order, with the clock set to each task's due time.
  pub fn advance(&self, by: Duration) {
    let target = lock(&self.clock).now.saturating_add(by);
    self.run_until(target);
    let mut clock = lock(&self.clock);
    if clock.now < target {
      clock.now = target;
    }
  }

  /// Runs every task already due at the current time.
  pub fn run_pending(&self) {
    let now = lock(&self.clock).now;
    self.run_until(now);
  }

  fn run_until(&self, target: Duration) {
    loop {
      let task = {
        let mut clock = lock(&self.clock);
        let due = match clock.queue.keys().next() {
          Some(&(due, sequence)) if due <= target => (due, sequence),
          _ => return,
        };
        clock.now = clock.now.max(due.0);
        clock.queue.remove(&due)
      };
      if let Some(task) = task {
        trace!("virtual task due");
        task();
      }
    }
  }

  fn enqueue(&self, delay: Duration, task: Task) {
    let mut clock = lock(&self.clock);
    let due = clock.now.saturating_add(delay);
    let sequence = clock.sequence;
    clock.sequence += 1;
    clock.queue.insert((due, sequence), task);
  }
}

impl Scheduler for VirtualScheduler {
  fn schedule(&self, task: Task) {
    self.enqueue(Duration::ZERO, task);
  }

  fn schedule_after(&self, delay: Duration, task: Task) -> Result<(), FlowError> {
    self.enqueue(delay, task);
    Ok(())
  }
}
