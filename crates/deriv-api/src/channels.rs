//! Fire-and-forget broadcast channels: the error channel and lifecycle events.
//!
//! Publishing never waits on consumers. A consumer that falls behind by more
//! than the channel capacity skips the oldest items.

use futures::StreamExt;
use futures::stream::BoxStream;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::warn;

use deriv_core::ClosureCause;

/// Multi-consumer broadcast with per-consumer cursors.
#[derive(Clone, Debug)]
pub struct Broadcast<T> {
    tx: broadcast::Sender<T>,
}

impl<T: Clone + Send + 'static> Broadcast<T> {
    /// Create a channel holding at most `capacity` undelivered items.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish to every current consumer. No-op without consumers.
    pub fn publish(&self, item: T) {
        let _ = self.tx.send(item);
    }

    /// Attach a new consumer; it sees items published from now on.
    pub fn subscribe(&self) -> BoxStream<'static, T> {
        BroadcastStream::new(self.tx.subscribe())
            .filter_map(|item| {
                futures::future::ready(match item {
                    Ok(item) => Some(item),
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        warn!(skipped, "broadcast consumer lagged");
                        None
                    }
                })
            })
            .boxed()
    }

    /// Number of attached consumers.
    pub fn consumers(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Connection lifecycle event.
#[derive(Clone, Debug, PartialEq)]
pub enum ApiEvent {
    /// A request was handed to the transport (after id stamping).
    Sent(Value),
    /// An inbound message was parsed, before routing.
    Message(Value),
    /// The connection failed or was closed.
    Closed(ClosureCause),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn every_consumer_sees_every_item() {
        let channel = Broadcast::new(8);
        let mut a = channel.subscribe();
        let mut b = channel.subscribe();
        assert_eq!(channel.consumers(), 2);

        channel.publish(1);
        channel.publish(2);

        assert_eq!(a.next().await, Some(1));
        assert_eq!(a.next().await, Some(2));
        assert_eq!(b.next().await, Some(1));
        assert_eq!(b.next().await, Some(2));
    }

    #[test]
    fn publish_without_consumers_is_noop() {
        let channel = Broadcast::new(1);
        channel.publish(ApiEvent::Sent(json!({"ping": 1})));
        channel.publish(ApiEvent::Sent(json!({"ping": 1})));
    }

    #[tokio::test]
    async fn lagging_consumer_skips_oldest() {
        let channel = Broadcast::new(2);
        let mut slow = channel.subscribe();
        for i in 0..5 {
            channel.publish(i);
        }
        assert_eq!(slow.next().await, Some(3));
        assert_eq!(slow.next().await, Some(4));
    }
}
