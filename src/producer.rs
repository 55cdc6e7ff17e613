//! # Producer Trait
//!
//! A [`Producer`] creates a fresh subscription for every consumer attached to
//! it. Producers come in two flavours:
//!
//! - **Cold** producers build new state for each attachment and replay from
//!   the start (every producer in [`crate::producers`]).
//! - **Hot** producers share state; an attachment only sees what happens after
//!   it ([`crate::hub::Hub`]).
//!
//! Implementations should not be used directly in pipelines; wrap them in a
//! [`crate::Flow`] with [`crate::Flow::from_producer`] to get the operator API.

use crate::consumer::BoxConsumer;

/// Trait for components that hand out subscriptions.
pub trait Producer<T>: Send + Sync + 'static {
  /// Attaches `consumer`. The producer must call `on_subscribe` on it exactly
  /// once before any other signal.
  fn subscribe(&self, consumer: BoxConsumer<T>);
}
