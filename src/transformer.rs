//! # Transformer Trait
//!
//! This module defines the `Transformer` trait, the generic operator framework
//! of fluxweave. A transformer intercepts the protocol between a source and a
//! consumer: it receives the downstream consumer and returns the
//! upstream-facing consumer to attach to the source in its place.
//!
//! ## Overview
//!
//! Every transformer must preserve three properties:
//!
//! - **Single terminal**: the downstream sees at most one `on_complete` or
//!   `on_error`.
//! - **Cancellation propagation**: cancelling the downstream cancels every
//!   upstream subscription the transformer created.
//! - **Demand translation**: the transformer never delivers more items than
//!   the downstream requested, and never stalls a request that the source
//!   could satisfy.
//!
//! Stateless 1:1 transformers hand the upstream subscription straight through;
//! transformers that drop, buffer or combine items wrap it.
//!
//! ## Example
//!
//! ```rust
//! use fluxweave::consumer::BoxConsumer;
//! use fluxweave::consumers::VecConsumer;
//! use fluxweave::transformers::MapTransformer;
//! use fluxweave::Flow;
//!
//! let consumer = VecConsumer::new();
//! let handle = consumer.handle();
//! Flow::range(1, 3)
//!   .lift(MapTransformer::new(|x: i32| x * 10))
//!   .subscribe(consumer);
//! assert_eq!(handle.items(), vec![10, 20, 30]);
//! ```
//!
//! Closures of the shape `Fn(BoxConsumer<O>) -> BoxConsumer<I>` are
//! transformers too.

use crate::consumer::BoxConsumer;
use crate::flow::Flow;
use crate::producer::Producer;
use std::sync::Arc;
use tracing::trace;

/// Trait for components that build a new producer out of an existing one by
/// intercepting its protocol.
pub trait Transformer<I, O>: Send + Sync + 'static {
  /// Wraps `downstream` into the consumer that will be attached upstream.
  fn apply(&self, downstream: BoxConsumer<O>) -> BoxConsumer<I>;

  /// Name used in log events.
  fn name(&self) -> &str {
    "transformer"
  }
}

impl<I, O, F> Transformer<I, O> for F
where
  F: Fn(BoxConsumer<O>) -> BoxConsumer<I> + Send + Sync + 'static,
{
  fn apply(&self, downstream: BoxConsumer<O>) -> BoxConsumer<I> {
    self(downstream)
  }
}

/// Producer made of a source and a transformer applied to each attachment.
pub struct Lift<I, O> {
  source: Flow<I>,
  transformer: Arc<dyn Transformer<I, O>>,
}

impl<I, O> Lift<I, O>
where
  I: Send + 'static,
  O: Send + 'static,
{
  /// Lifts `transformer` over `source`.
  pub fn new<X>(source: Flow<I>, transformer: X) -> Self
  where
    X: Transformer<I, O>,
  {
    Self {
      source,
      transformer: Arc::new(transformer),
    }
  }
}

impl<I, O> Producer<O> for Lift<I, O>
where
  I: Send + 'static,
  O: Send + 'static,
{
  fn subscribe(&self, consumer: BoxConsumer<O>) {
    trace!(transformer = self.transformer.name(), "subscribe");
    let upstream = self.transformer.apply(consumer);
    self.source.subscribe_boxed(upstream);
  }
}
