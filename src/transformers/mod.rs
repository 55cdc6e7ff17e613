//! # Transformers Module
//!
//! The operators behind the combinator methods of [`crate::Flow`].
//!
//! ## Overview
//!
//! - **Item-wise**: [`MapTransformer`], [`TryMapTransformer`],
//!   [`FilterTransformer`], [`IgnoreElementsTransformer`]
//! - **Demand shaping**: [`TakeTransformer`], [`CapacityTransformer`]
//! - **Combining**: [`FlatMapTransformer`], [`SwitchTransformer`],
//!   [`ZipProducer`], [`AmbProducer`]
//! - **Errors and time**: [`RetryProducer`], [`ResumeTransformer`],
//!   [`TimeoutTransformer`]
//! - **Observation**: [`PeekTransformer`], [`LogTransformer`]
//! - **Execution context**: [`PublishOnTransformer`], [`SubscribeOnProducer`]
//!
//! Operators that start several subscriptions of their own (zip, amb, retry,
//! subscribe_on) are producers rather than transformers: they need the
//! source flows themselves, not just a downstream consumer.
//!
//! ## Writing a transformer
//!
//! ```rust
//! use fluxweave::consumer::{BoxConsumer, Consumer};
//! use fluxweave::consumers::VecConsumer;
//! use fluxweave::error::FlowError;
//! use fluxweave::subscription::SubscriptionRef;
//! use fluxweave::Flow;
//!
//! struct Doubler(BoxConsumer<i32>);
//!
//! impl Consumer<i32> for Doubler {
//!   fn on_subscribe(&mut self, subscription: SubscriptionRef) {
//!     self.0.on_subscribe(subscription);
//!   }
//!   fn on_next(&mut self, item: i32) {
//!     self.0.on_next(item * 2);
//!   }
//!   fn on_error(&mut self, error: FlowError) {
//!     self.0.on_error(error);
//!   }
//!   fn on_complete(&mut self) {
//!     self.0.on_complete();
//!   }
//! }
//!
//! let consumer = VecConsumer::new();
//! let handle = consumer.handle();
//! Flow::range(1, 3)
//!   .lift(|downstream: BoxConsumer<i32>| -> BoxConsumer<i32> { Box::new(Doubler(downstream)) })
//!   .subscribe(consumer);
//! assert_eq!(handle.items(), vec![2, 4, 6]);
//! ```

pub mod amb;
pub mod capacity;
pub mod filter;
pub mod flat_map;
pub mod ignore;
pub mod log;
pub mod map;
pub mod peek;
pub mod resume;
pub mod retry;
pub mod schedule;
pub mod switch;
pub mod take;
pub mod timeout;
pub mod zip;

pub use amb::AmbProducer;
pub use capacity::CapacityTransformer;
pub use filter::FilterTransformer;
pub use flat_map::{FlatMapConfig, FlatMapTransformer};
pub use ignore::IgnoreElementsTransformer;
pub use log::LogTransformer;
pub use map::{MapTransformer, TryMapTransformer};
pub use peek::{PeekHooks, PeekTransformer};
pub use resume::ResumeTransformer;
pub use retry::RetryProducer;
pub use schedule::{PublishOnTransformer, SubscribeOnProducer};
pub use switch::SwitchTransformer;
pub use take::TakeTransformer;
pub use timeout::TimeoutTransformer;
pub use zip::ZipProducer;
