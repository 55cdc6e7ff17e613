//! Built-in consumer implementations.
//!
//! This module provides consumers for collecting items in memory, for
//! closure-based handling, and for bridging a flow into async code.

/// Closure-based consumer.
pub mod lambda;
/// Bridge into `futures::Stream`.
pub mod stream;
/// Vec consumer for collecting items into vectors.
pub mod vec;

pub use lambda::LambdaConsumer;
pub use stream::FlowStream;
pub use vec::{VecConsumer, VecHandle, VecSnapshot};
