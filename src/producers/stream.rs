//! Bridge from [`futures::Stream`] into a flow.
//!
//! Every subscription builds a fresh stream from the factory and polls it on
//! a tokio task. The task only polls while the consumer has outstanding
//! demand, so a slow consumer stalls the stream instead of buffering it.

use crate::consumer::BoxConsumer;
use crate::demand::Demand;
use crate::error::ProtocolViolation;
use crate::producer::Producer;
use crate::subscription::{Subscription, SubscriptionRef, TerminalFlag};
use futures::{Stream, StreamExt};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tracing::trace;

type StreamFactory<S> = dyn Fn() -> S + Send + Sync;

/// Cold producer over a stream factory.
pub struct StreamProducer<S> {
  factory: Arc<StreamFactory<S>>,
  handle: Handle,
}

impl<S> StreamProducer<S>
where
  S: Stream + Send + 'static,
  S::Item: Send + 'static,
{
  /// Polls streams built by `factory` on `handle`.
  pub fn new<F>(factory: F, handle: Handle) -> Self
  where
    F: Fn() -> S + Send + Sync + 'static,
  {
    Self {
      factory: Arc::new(factory),
      handle,
    }
  }
}

struct StreamSubscription {
  demand: Demand,
  terminated: TerminalFlag,
  violation: AtomicBool,
  wake: Notify,
}

impl Subscription for StreamSubscription {
  fn request(&self, n: u64) {
    if n == 0 {
      self.violation.store(true, Ordering::Release);
    } else {
      self.demand.add(n);
    }
    self.wake.notify_one();
  }

  fn cancel(&self) {
    if self.terminated.try_set() {
      self.wake.notify_one();
    }
  }
}

impl<S> Producer<S::Item> for StreamProducer<S>
where
  S: Stream + Send + 'static,
  S::Item: Send + 'static,
{
  fn subscribe(&self, mut consumer: BoxConsumer<S::Item>) {
    let subscription = Arc::new(StreamSubscription {
      demand: Demand::new(),
      terminated: TerminalFlag::new(),
      violation: AtomicBool::new(false),
      wake: Notify::new(),
    });
    let handle: SubscriptionRef = subscription.clone();
    consumer.on_subscribe(handle);
    let factory = self.factory.clone();
    self.handle.spawn(async move {
      let mut stream = Box::pin(factory());
      loop {
        if subscription.violation.swap(false, Ordering::AcqRel) {
          if subscription.terminated.try_set() {
            consumer.on_error(ProtocolViolation::NonPositiveRequest.into());
          }
          return;
        }
        if subscription.terminated.is_set() {
          trace!("stream subscription cancelled");
          return;
        }
        if !subscription.demand.has_demand() {
          subscription.wake.notified().await;
          continue;
        }
        tokio::select! {
          item = stream.next() => match item {
            Some(item) => {
              if subscription.terminated.is_set() {
                return;
              }
              consumer.on_next(item);
              subscription.demand.produced(1);
            }
            None => {
              if subscription.terminated.try_set() {
                consumer.on_complete();
              }
              return;
            }
          },
          _ = subscription.wake.notified() => {}
        }
      }
    });
  }
}

#[cfg(test)]
mod tests {
  use crate::Flow;
  use crate::consumers::VecConsumer;
  use futures::stream;
  use tokio::runtime::Handle;

  #[tokio::test]
  async fn test_stream_is_pulled_on_demand() {
    let flow = Flow::from_stream(|| stream::iter(1..=5), Handle::current());
    let consumer = VecConsumer::with_initial_request(2);
    let handle = consumer.handle();
    flow.subscribe(consumer);
    handle.wait_for_items(2).await;
    tokio::task::yield_now().await;
    assert_eq!(handle.items(), vec![1, 2]);
    handle.request(10);
    handle.terminated().await;
    assert_eq!(handle.items(), vec![1, 2, 3, 4, 5]);
    assert!(handle.is_complete());
  }

  #[tokio::test]
  async fn test_stream_factory_runs_per_subscription() {
    let flow = Flow::from_stream(|| stream::iter(vec!["a", "b"]), Handle::current());
    for _ in 0..2 {
      let consumer = VecConsumer::new();
      let handle = consumer.handle();
      flow.subscribe(consumer);
      handle.terminated().await;
      assert_eq!(handle.items(), vec!["a", "b"]);
    }
  }

  #[tokio::test]
  async fn test_cancel_stops_a_slow_stream() {
    let flow = Flow::from_stream(
      || {
        async_stream::stream! {
          let mut tick = 0u32;
          loop {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            yield tick;
            tick += 1;
          }
        }
      },
      Handle::current(),
    );
    let consumer = VecConsumer::new();
    let handle = consumer.handle();
    flow.subscribe(consumer);
    handle.wait_for_items(3).await;
    handle.cancel();
    let seen = handle.len();
    tokio::time::sleep(std::time::Duration::from_millis(30)).await;
    assert_eq!(handle.len(), seen);
    assert!(!handle.is_terminated());
  }
}
