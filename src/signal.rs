//! The unit of the producer-to-consumer protocol.

use crate::consumer::Consumer;
use crate::error::FlowError;

/// One signal travelling downstream.
#[derive(Debug, Clone)]
pub enum Signal<T> {
  /// An item.
  Next(T),
  /// Successful completion.
  Complete,
  /// Failure.
  Error(FlowError),
}

impl<T> Signal<T> {
  /// Whether this signal ends the sequence.
  pub fn is_terminal(&self) -> bool {
    !matches!(self, Signal::Next(_))
  }

  /// Short name used in log events.
  pub fn name(&self) -> &'static str {
    match self {
      Signal::Next(_) => "on_next",
      Signal::Complete => "on_complete",
      Signal::Error(_) => "on_error",
    }
  }

  /// Delivers this signal to `consumer`.
  pub fn dispatch<C>(self, consumer: &mut C)
  where
    C: Consumer<T> + ?Sized,
  {
    match self {
      Signal::Next(item) => consumer.on_next(item),
      Signal::Complete => consumer.on_complete(),
      Signal::Error(error) => consumer.on_error(error),
    }
  }

  /// Returns the item of a `Next` signal.
  pub fn into_next(self) -> Option<T> {
    match self {
      Signal::Next(item) => Some(item),
      _ => None,
    }
  }
}
