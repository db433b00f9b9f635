//! Channel → subscriber registry and publish fan-out.
//!
//! Subscribers are connection outboxes: bounded senders of pre-encoded
//! frames. PUBLISH walks a channel's subscribers in registration order
//! and pushes one `message` frame to each; delivery is fire-and-forget.
//! A subscriber whose outbox is full is considered too slow, gets
//! dropped from every channel and has its connection killed.

use crate::protocol::RespValue;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// The delivery endpoints a connection registers with the hub.
#[derive(Debug, Clone)]
pub struct SubscriberHandle {
    /// Frames pushed here are written by the connection's outbox loop.
    pub tx: mpsc::Sender<Bytes>,
    /// Fired when the hub decides the connection must be closed.
    pub kill: Arc<Notify>,
}

struct Subscriber {
    conn_id: u64,
    handle: SubscriberHandle,
}

/// The process-wide pub/sub state.
#[derive(Default)]
pub struct PubSubHub {
    channels: RwLock<HashMap<Bytes, Vec<Subscriber>>>,
}

impl PubSubHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connection on a channel. Re-subscribing to a channel
    /// the connection already holds is a no-op, so subscriber counts
    /// stay stable.
    pub fn subscribe(&self, conn_id: u64, channel: Bytes, handle: SubscriberHandle) {
        let mut channels = self.channels.write().unwrap();
        let subscribers = channels.entry(channel).or_default();
        if subscribers.iter().any(|s| s.conn_id == conn_id) {
            return;
        }
        subscribers.push(Subscriber { conn_id, handle });
    }

    /// Removes a connection from one channel.
    pub fn unsubscribe(&self, conn_id: u64, channel: &[u8]) {
        let mut channels = self.channels.write().unwrap();
        if let Some(subscribers) = channels.get_mut(channel) {
            subscribers.retain(|s| s.conn_id != conn_id);
            if subscribers.is_empty() {
                channels.remove(channel);
            }
        }
    }

    /// Removes a connection from every channel (connection teardown,
    /// UNSUBSCRIBE with no arguments).
    pub fn unsubscribe_all(&self, conn_id: u64) {
        let mut channels = self.channels.write().unwrap();
        channels.retain(|_, subscribers| {
            subscribers.retain(|s| s.conn_id != conn_id);
            !subscribers.is_empty()
        });
    }

    /// Delivers `payload` to every subscriber of `channel` in
    /// registration order. Returns the number of subscribers reached.
    pub fn publish(&self, channel: &[u8], payload: Bytes) -> usize {
        let frame = RespValue::array(vec![
            RespValue::bulk_string("message"),
            RespValue::bulk_string(Bytes::copy_from_slice(channel)),
            RespValue::BulkString(payload),
        ]);
        let encoded = Bytes::from(frame.serialize());

        let mut delivered = 0;
        let mut dead: Vec<u64> = Vec::new();
        {
            let channels = self.channels.read().unwrap();
            let subscribers = match channels.get(channel) {
                Some(subscribers) => subscribers,
                None => return 0,
            };
            for subscriber in subscribers {
                match subscriber.handle.tx.try_send(encoded.clone()) {
                    Ok(()) => delivered += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(conn = subscriber.conn_id, "subscriber outbox full, dropping");
                        subscriber.handle.kill.notify_one();
                        dead.push(subscriber.conn_id);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        debug!(conn = subscriber.conn_id, "subscriber gone, dropping");
                        dead.push(subscriber.conn_id);
                    }
                }
            }
        }

        for conn_id in dead {
            self.unsubscribe_all(conn_id);
        }
        delivered
    }

    /// How many connections are subscribed to `channel`.
    pub fn subscriber_count(&self, channel: &[u8]) -> usize {
        let channels = self.channels.read().unwrap();
        channels.get(channel).map(|s| s.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(capacity: usize) -> (SubscriberHandle, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            SubscriberHandle {
                tx,
                kill: Arc::new(Notify::new()),
            },
            rx,
        )
    }

    #[tokio::test]
    async fn publish_reaches_subscribers_in_order() {
        let hub = PubSubHub::new();
        let (h1, mut rx1) = handle(8);
        let (h2, mut rx2) = handle(8);

        hub.subscribe(1, Bytes::from("ch"), h1);
        hub.subscribe(2, Bytes::from("ch"), h2);

        assert_eq!(hub.publish(b"ch", Bytes::from("hi")), 2);

        let expected = b"*3\r\n$7\r\nmessage\r\n$2\r\nch\r\n$2\r\nhi\r\n".to_vec();
        assert_eq!(rx1.recv().await.unwrap(), Bytes::from(expected.clone()));
        assert_eq!(rx2.recv().await.unwrap(), Bytes::from(expected));
    }

    #[tokio::test]
    async fn publish_without_subscribers_returns_zero() {
        let hub = PubSubHub::new();
        assert_eq!(hub.publish(b"nobody", Bytes::from("x")), 0);
    }

    #[tokio::test]
    async fn duplicate_subscribe_is_idempotent() {
        let hub = PubSubHub::new();
        let (h, _rx) = handle(8);
        hub.subscribe(1, Bytes::from("ch"), h.clone());
        hub.subscribe(1, Bytes::from("ch"), h);
        assert_eq!(hub.subscriber_count(b"ch"), 1);
    }

    #[tokio::test]
    async fn unsubscribe_removes_only_that_channel() {
        let hub = PubSubHub::new();
        let (h, _rx) = handle(8);
        hub.subscribe(1, Bytes::from("a"), h.clone());
        hub.subscribe(1, Bytes::from("b"), h);

        hub.unsubscribe(1, b"a");
        assert_eq!(hub.subscriber_count(b"a"), 0);
        assert_eq!(hub.subscriber_count(b"b"), 1);

        hub.unsubscribe_all(1);
        assert_eq!(hub.subscriber_count(b"b"), 0);
    }

    #[tokio::test]
    async fn slow_subscriber_is_dropped_and_killed() {
        let hub = PubSubHub::new();
        let (h, _rx) = handle(1);
        let kill = Arc::clone(&h.kill);
        hub.subscribe(1, Bytes::from("ch"), h);

        // First publish fills the 1-slot outbox, second overflows it.
        assert_eq!(hub.publish(b"ch", Bytes::from("a")), 1);
        let killed = kill.notified();
        assert_eq!(hub.publish(b"ch", Bytes::from("b")), 0);

        tokio::time::timeout(std::time::Duration::from_secs(1), killed)
            .await
            .expect("kill signal not fired");
        assert_eq!(hub.subscriber_count(b"ch"), 0);
    }

    #[tokio::test]
    async fn closed_receiver_is_pruned() {
        let hub = PubSubHub::new();
        let (h, rx) = handle(8);
        hub.subscribe(1, Bytes::from("ch"), h);
        drop(rx);

        assert_eq!(hub.publish(b"ch", Bytes::from("x")), 0);
        assert_eq!(hub.subscriber_count(b"ch"), 0);
    }
}
