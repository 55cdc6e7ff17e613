//! # Error Handling
//!
//! Every failure that crosses a subscription boundary travels as a
//! [`FlowError`] inside an `Error` signal. Nothing in the protocol panics or
//! unwinds across a component: protocol violations, source failures and
//! disposal failures are all typed variants.
//!
//! ## Taxonomy
//!
//! - **Protocol violations** ([`ProtocolViolation`]): `request(0)`, items past
//!   demand, signals after a terminal. Reported to the offending consumer only.
//! - **Source failures** ([`FlowError::Source`], [`FlowError::Message`],
//!   [`FlowError::Panicked`], [`FlowError::Disposal`]): faults raised while
//!   producing or releasing a context.
//! - **Flow-control failures** ([`FlowError::Overflow`],
//!   [`FlowError::MissingDemand`], [`FlowError::Timeout`]).
//!
//! `FlowError` is `Clone` so a multicast hub can hand the same failure to
//! every attached consumer.
//!
//! ## Error Strategies
//!
//! [`ErrorStrategy`] decides whether a failed subscription is retried. It is
//! consumed by the `retry` operator:
//!
//! - **Stop**: forward the error downstream (default)
//! - **Retry(n)**: resubscribe up to `n` times
//! - **RetryForever**: always resubscribe
//! - **Custom**: user-defined decision from the error and the attempt count

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Breach of the producer/consumer contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtocolViolation {
  /// `request(0)` was called; demand must be positive.
  #[error("request(0): demand must be positive")]
  NonPositiveRequest,
  /// A signal was emitted after the subscription already terminated.
  #[error("signal emitted after a terminal signal")]
  SignalAfterTerminal,
  /// More items were emitted than the consumer requested.
  #[error("item emitted without outstanding demand")]
  DemandExceeded,
}

/// Failure carried by an `Error` signal.
#[derive(Debug, Clone, Error)]
pub enum FlowError {
  /// The producer/consumer contract was broken.
  #[error("protocol violation: {0}")]
  Protocol(#[from] ProtocolViolation),
  /// A source raised an error value.
  #[error("source failure: {0}")]
  Source(Arc<dyn StdError + Send + Sync>),
  /// A source failed with a plain message.
  #[error("source failure: {0}")]
  Message(String),
  /// User code panicked inside a fulfillment function.
  #[error("panic while producing: {0}")]
  Panicked(String),
  /// Releasing a subscription context failed.
  #[error("disposal failed: {0}")]
  Disposal(Box<FlowError>),
  /// A per-consumer buffer exceeded its capacity.
  #[error("buffer overflow: capacity {capacity} exceeded")]
  Overflow {
    /// The configured capacity.
    capacity: usize,
  },
  /// A timed producer fired while its consumer had no outstanding demand.
  #[error("could not emit tick {tick}: no outstanding demand")]
  MissingDemand {
    /// The tick that could not be delivered.
    tick: u64,
  },
  /// No signal arrived in time.
  #[error("no signal within {0:?}")]
  Timeout(Duration),
  /// A component was built with an invalid configuration.
  #[error("invalid configuration: {0}")]
  Config(String),
  /// The subscription was cancelled; returned to emitting code, never delivered.
  #[error("subscription cancelled")]
  Cancelled,
}

impl FlowError {
  /// Wraps an arbitrary error value as a source failure.
  pub fn from_source<E>(error: E) -> Self
  where
    E: StdError + Send + Sync + 'static,
  {
    FlowError::Source(Arc::new(error))
  }

  /// Creates a source failure from a message.
  pub fn msg(message: impl Into<String>) -> Self {
    FlowError::Message(message.into())
  }

  /// Returns `true` for protocol violations.
  pub fn is_protocol_violation(&self) -> bool {
    matches!(self, FlowError::Protocol(_))
  }

  pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
    let message = if let Some(s) = payload.downcast_ref::<&str>() {
      (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
      s.clone()
    } else {
      "non-string panic payload".to_string()
    };
    FlowError::Panicked(message)
  }
}

/// Action to take when a subscription fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
  /// Forward the error downstream.
  Stop,
  /// Resubscribe to the source.
  Retry,
}

type CustomErrorHandler = Arc<dyn Fn(&FlowError, usize) -> ErrorAction + Send + Sync>;

/// Strategy deciding what happens after a failed attempt.
///
/// ```rust
/// use fluxweave::error::{ErrorAction, ErrorStrategy, FlowError};
///
/// let strategy = ErrorStrategy::new_custom(|error, attempts| {
///   if attempts < 2 && !error.is_protocol_violation() {
///     ErrorAction::Retry
///   } else {
///     ErrorAction::Stop
///   }
/// });
/// assert_eq!(strategy.decide(&FlowError::msg("boom"), 0), ErrorAction::Retry);
/// ```
#[derive(Clone, Default)]
pub enum ErrorStrategy {
  /// Never retry.
  #[default]
  Stop,
  /// Retry at most this many times.
  Retry(usize),
  /// Retry without bound.
  RetryForever,
  /// Custom decision from the error and the number of retries already made.
  Custom(CustomErrorHandler),
}

impl ErrorStrategy {
  /// Creates a custom strategy from a decision function.
  pub fn new_custom<F>(f: F) -> Self
  where
    F: Fn(&FlowError, usize) -> ErrorAction + Send + Sync + 'static,
  {
    Self::Custom(Arc::new(f))
  }

  /// Decides the action for `error` after `retries` retries have already happened.
  pub fn decide(&self, error: &FlowError, retries: usize) -> ErrorAction {
    match self {
      ErrorStrategy::Stop => ErrorAction::Stop,
      ErrorStrategy::Retry(max) if retries < *max => ErrorAction::Retry,
      ErrorStrategy::Retry(_) => ErrorAction::Stop,
      ErrorStrategy::RetryForever => ErrorAction::Retry,
      ErrorStrategy::Custom(handler) => handler(error, retries),
    }
  }
}

impl fmt::Debug for ErrorStrategy {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ErrorStrategy::Stop => write!(f, "ErrorStrategy::Stop"),
      ErrorStrategy::Retry(n) => write!(f, "ErrorStrategy::Retry({})", n),
      ErrorStrategy::RetryForever => write!(f, "ErrorStrategy::RetryForever"),
      ErrorStrategy::Custom(_) => write!(f, "ErrorStrategy::Custom"),
    }
  }
}

impl PartialEq for ErrorStrategy {
  fn eq(&self, other: &Self) -> bool {
    match (self, other) {
      (ErrorStrategy::Stop, ErrorStrategy::Stop) => true,
      (ErrorStrategy::Retry(a), ErrorStrategy::Retry(b)) => a == b,
      (ErrorStrategy::RetryForever, ErrorStrategy::RetryForever) => true,
      (ErrorStrategy::Custom(a), ErrorStrategy::Custom(b)) => Arc::ptr_eq(a, b),
      _ => false,
    }
  }
}
