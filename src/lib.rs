//! # FluxWeave
//!
//! Backpressure-aware, composable reactive streams in pure Rust.
//!
//! FluxWeave implements the demand-negotiation protocol between producers
//! and consumers: a consumer authorizes items with `request(n)` and a
//! producer never emits more than was authorized. Operators compose on top
//! of the protocol through the [`Flow`] handle.
//!
//! ## Key Features
//!
//! - **Demand negotiation**: saturating `u64` demand, with `u64::MAX` meaning
//!   unbounded; `request(0)` is reported as an error, never a panic
//! - **Cold sources**: producers built from a context factory, a fulfillment
//!   function and a disposal function, released exactly once
//! - **Operators**: map, filter, flat-map / concat-map, switch, zip, amb,
//!   take, capacity, retry, error fallback, timeout and more
//! - **Multicast hub**: push-driven fan-out with per-consumer buffers and an
//!   explicit backpressure policy
//! - **Schedulers**: inline, tokio and a virtual clock for deterministic tests
//!
//! ## Quick Start
//!
//! ```rust
//! use fluxweave::consumers::VecConsumer;
//! use fluxweave::Flow;
//!
//! let consumer = VecConsumer::with_initial_request(2);
//! let handle = consumer.handle();
//! Flow::range(0, 100).map(|x| x * 2).subscribe(consumer);
//! assert_eq!(handle.items(), vec![0, 2]);
//!
//! handle.request(1);
//! assert_eq!(handle.items(), vec![0, 2, 4]);
//! handle.cancel();
//! ```

// Documentation enforcement - treat missing docs as errors
#![deny(missing_docs)]

/// Consumer trait and serialized delivery.
pub mod consumer;
/// Built-in consumers.
pub mod consumers;
/// Outstanding-demand accounting.
pub mod demand;
/// Error types and retry strategies.
pub mod error;
/// The composable `Flow` handle.
pub mod flow;
/// Push-driven multicast producer.
pub mod hub;
/// Producer trait.
pub mod producer;
/// Built-in producers.
pub mod producers;
/// Execution contexts.
pub mod scheduler;
/// Protocol signals.
pub mod signal;
/// Subscription trait and shared protocol primitives.
pub mod subscription;
/// Transformer trait and lifting.
pub mod transformer;
/// Built-in operators.
pub mod transformers;

mod sync;


pub use consumer::{BoxConsumer, Consumer};
pub use demand::UNBOUNDED;
pub use error::{ErrorAction, ErrorStrategy, FlowError, ProtocolViolation};
pub use flow::Flow;
pub use hub::{BackpressurePolicy, Hub, HubConfig};
pub use producer::Producer;
pub use scheduler::{ImmediateScheduler, Scheduler, TokioScheduler, VirtualScheduler};
pub use subscription::{Subscription, SubscriptionRef};
pub use transformer::Transformer;
