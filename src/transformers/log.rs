//! Log transformer.
//!
//! Emits a `tracing` event for every signal going downstream and every
//! request or cancel going upstream. The flow itself is left untouched.
//!
//! ```rust
//! use fluxweave::Flow;
//! use fluxweave::consumers::VecConsumer;
//! use tracing::Level;
//!
//! Flow::range(0, 3)
//!   .log("numbers", Level::DEBUG)
//!   .subscribe(VecConsumer::new());
//! ```

use crate::consumer::{BoxConsumer, Consumer};
use crate::error::FlowError;
use crate::subscription::{Subscription, SubscriptionRef};
use crate::transformer::Transformer;
use std::fmt::Debug;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::Level;

macro_rules! event_at {
  ($level:expr, $($arg:tt)+) => {
    if $level == Level::ERROR {
      tracing::error!($($arg)+)
    } else if $level == Level::WARN {
      tracing::warn!($($arg)+)
    } else if $level == Level::INFO {
      tracing::info!($($arg)+)
    } else if $level == Level::DEBUG {
      tracing::debug!($($arg)+)
    } else {
      tracing::trace!($($arg)+)
    }
  };
}

/// Logs the protocol traffic of a flow under `category`.
#[derive(Debug, Clone)]
pub struct LogTransformer {
  category: Arc<str>,
  level: Level,
}

impl LogTransformer {
  /// Creates a transformer logging at `level`.
  pub fn new(category: impl Into<String>, level: Level) -> Self {
    Self {
      category: Arc::from(category.into()),
      level,
    }
  }
}

impl<T: Debug + Send + 'static> Transformer<T, T> for LogTransformer {
  fn apply(&self, downstream: BoxConsumer<T>) -> BoxConsumer<T> {
    Box::new(LogConsumer {
      downstream,
      category: self.category.clone(),
      level: self.level,
      _item: PhantomData,
    })
  }

  fn name(&self) -> &str {
    &self.category
  }
}

struct LogSubscription {
  upstream: SubscriptionRef,
  category: Arc<str>,
  level: Level,
}

impl Subscription for LogSubscription {
  fn request(&self, n: u64) {
    event_at!(self.level, category = %self.category, n, "request");
    self.upstream.request(n);
  }

  fn cancel(&self) {
    event_at!(self.level, category = %self.category, "cancel");
    self.upstream.cancel();
  }
}

struct LogConsumer<T> {
  downstream: BoxConsumer<T>,
  category: Arc<str>,
  level: Level,
  _item: PhantomData<fn(T)>,
}

impl<T: Debug + Send + 'static> Consumer<T> for LogConsumer<T> {
  fn on_subscribe(&mut self, subscription: SubscriptionRef) {
    event_at!(self.level, category = %self.category, "on_subscribe");
    self.downstream.on_subscribe(Arc::new(LogSubscription {
      upstream: subscription,
      category: self.category.clone(),
      level: self.level,
    }));
  }

  fn on_next(&mut self, item: T) {
    event_at!(self.level, category = %self.category, item = ?item, "on_next");
    self.downstream.on_next(item);
  }

  fn on_error(&mut self, error: FlowError) {
    event_at!(self.level, category = %self.category, %error, "on_error");
    self.downstream.on_error(error);
  }

  fn on_complete(&mut self) {
    event_at!(self.level, category = %self.category, "on_complete");
    self.downstream.on_complete();
  }
}
