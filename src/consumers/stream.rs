//! Bridge from a flow into a [`futures::Stream`].

use crate::consumer::Consumer;
use crate::error::FlowError;
use crate::flow::Flow;
use crate::subscription::{SubscriptionRef, UpstreamSlot};
use crate::sync::lock;
use futures::Stream;
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

struct Buffer<T> {
  items: VecDeque<Result<T, FlowError>>,
  done: bool,
  waker: Option<Waker>,
}

struct Shared<T> {
  buffer: Mutex<Buffer<T>>,
  upstream: UpstreamSlot,
}

impl<T> Shared<T> {
  fn push(&self, entry: Option<Result<T, FlowError>>) {
    let waker = {
      let mut buffer = lock(&self.buffer);
      match entry {
        Some(entry) => buffer.items.push_back(entry),
        None => buffer.done = true,
      }
      buffer.waker.take()
    };
    if let Some(waker) = waker {
      waker.wake();
    }
  }
}

struct StreamConsumer<T> {
  shared: Arc<Shared<T>>,
  prefetch: u64,
}

impl<T: Send + 'static> Consumer<T> for StreamConsumer<T> {
  fn on_subscribe(&mut self, subscription: SubscriptionRef) {
    self.shared.upstream.set(subscription);
    self.shared.upstream.request(self.prefetch);
  }

  fn on_next(&mut self, item: T) {
    self.shared.push(Some(Ok(item)));
  }

  fn on_error(&mut self, error: FlowError) {
    self.shared.push(Some(Err(error)));
    self.shared.push(None);
  }

  fn on_complete(&mut self) {
    self.shared.push(None);
  }
}

/// [`futures::Stream`] over a flow's signals.
///
/// Keeps at most `prefetch` items requested ahead of the reader and
/// replenishes in batches as items are read. An error is yielded as the last
/// item. Dropping the stream cancels the subscription.
pub struct FlowStream<T> {
  shared: Arc<Shared<T>>,
  consumed: u64,
  limit: u64,
}

impl<T: Send + 'static> FlowStream<T> {
  /// Subscribes to `flow`. A `prefetch` of zero is treated as one.
  pub fn subscribe(flow: &Flow<T>, prefetch: usize) -> Self {
    let prefetch = prefetch.max(1) as u64;
    let shared = Arc::new(Shared {
      buffer: Mutex::new(Buffer {
        items: VecDeque::new(),
        done: false,
        waker: None,
      }),
      upstream: UpstreamSlot::new(),
    });
    flow.subscribe(StreamConsumer {
      shared: shared.clone(),
      prefetch,
    });
    Self {
      shared,
      consumed: 0,
      limit: prefetch - prefetch / 4,
    }
  }
}

impl<T> Stream for FlowStream<T> {
  type Item = Result<T, FlowError>;

  fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
    let this = self.get_mut();
    let next = {
      let mut buffer = lock(&this.shared.buffer);
      match buffer.items.pop_front() {
        Some(entry) => Some(entry),
        None if buffer.done => return Poll::Ready(None),
        None => {
          buffer.waker = Some(cx.waker().clone());
          None
        }
      }
    };
    match next {
      Some(Ok(item)) => {
        this.consumed += 1;
        if this.consumed == this.limit {
          this.consumed = 0;
          this.shared.upstream.request(this.limit);
        }
        Poll::Ready(Some(Ok(item)))
      }
      Some(Err(error)) => Poll::Ready(Some(Err(error))),
      None => Poll::Pending,
    }
  }
}

impl<T> Drop for FlowStream<T> {
  fn drop(&mut self) {
    self.shared.upstream.cancel();
  }
}

#[cfg(test)]
mod tests {
  use crate::Flow;
  use crate::error::FlowError;
  use futures::StreamExt;
  use std::sync::Arc;
  use std::sync::atomic::{AtomicU64, Ordering};

  #[tokio::test]
  async fn test_into_stream_yields_items() {
    let items: Vec<_> = Flow::range(0, 5).into_stream(2).collect().await;
    let items: Vec<i32> = items.into_iter().map(Result::unwrap).collect();
    assert_eq!(items, vec![0, 1, 2, 3, 4]);
  }

  #[tokio::test]
  async fn test_into_stream_yields_error_last() {
    let mut stream = Flow::just(1)
      .concat_with(&Flow::error(FlowError::msg("bad")))
      .into_stream(8);
    assert_eq!(stream.next().await.unwrap().unwrap(), 1);
    assert!(stream.next().await.unwrap().is_err());
    assert!(stream.next().await.is_none());
  }

  #[tokio::test]
  async fn test_into_stream_bounds_requests() {
    let max = Arc::new(AtomicU64::new(0));
    let seen = max.clone();
    let mut stream = Flow::range(0, 100)
      .do_on_request(move |n| {
        seen.fetch_max(n, Ordering::SeqCst);
      })
      .into_stream(4);
    for _ in 0..10 {
      stream.next().await;
    }
    drop(stream);
    assert_eq!(max.load(Ordering::SeqCst), 4);
  }
}
