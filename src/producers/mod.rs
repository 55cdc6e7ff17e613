//! # Producers
//!
//! Ready-made producers. Most users reach them through the constructors on
//! [`crate::Flow`].

// Cold sources built from context / fulfillment / disposal functions
pub mod factory;

// Stateless producers
pub mod basic;

// Producers driven by a scheduler or a runtime
pub mod interval;
pub mod stream;

pub use basic::{DeferProducer, EmptyProducer, ErrorProducer, NeverProducer};
pub use factory::{FactoryProducer, Fulfillment, Sink};
pub use interval::IntervalProducer;
pub use stream::StreamProducer;
