//! Event Hub (C5): in-process, topic-keyed pub/sub used to stream
//! node events, inference tokens, and status changes to subscribers.
//!
//! Ported from `dennett/core/eventhub.py`'s `EventHub`. The Python hub
//! serializes publication behind a single lock and lets a broken
//! subscriber break the whole fan-out with an uncaught exception; here
//! each subscriber gets its own bounded channel and a bounded wait, so
//! one slow or dead subscriber can be dropped without blocking the
//! others or the publisher for longer than the wait. The subscriber
//! table itself is mutated under one lock, but `publish` only holds it
//! long enough to snapshot a topic's senders — delivery happens against
//! that snapshot, so a publish to one topic never waits behind a
//! concurrent publish to another.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};

/// Default bound on how long `publish` waits for a single subscriber's
/// channel to have room before giving up on that subscriber.
pub const DEFAULT_DELIVERY_WAIT: Duration = Duration::from_secs(1);

/// Per-subscriber channel depth. Bursts beyond this queue up to
/// `DEFAULT_DELIVERY_WAIT` worth of backpressure before being dropped.
const SUBSCRIBER_CHANNEL_CAPACITY: usize = 64;

pub type SubscriptionId = u64;

struct Subscriber {
    id: SubscriptionId,
    tx: mpsc::Sender<serde_json::Value>,
}

/// A handle returned by [`EventHub::subscribe`]. Dropping it does not
/// unsubscribe automatically — call [`EventHub::unsubscribe`] with the
/// id, mirroring the explicit subscribe/unsubscribe pairing in the
/// ported Python hub.
pub struct Subscription {
    pub id: SubscriptionId,
    pub receiver: mpsc::Receiver<serde_json::Value>,
}

/// In-process pub/sub fan-out, keyed by opaque topic strings such as
/// `execution:{id}` or `inference:{task_id}`.
pub struct EventHub {
    topics: Mutex<HashMap<String, Vec<Subscriber>>>,
    delivery_wait: Duration,
    next_id: AtomicU64,
}

impl EventHub {
    pub fn new() -> Self {
        Self::with_delivery_wait(DEFAULT_DELIVERY_WAIT)
    }

    pub fn with_delivery_wait(delivery_wait: Duration) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            delivery_wait,
            next_id: AtomicU64::new(1),
        }
    }

    /// Subscribe to `topic`, returning a receiver for events published
    /// on it from this point forward. No replay of past events.
    pub async fn subscribe(&self, topic: impl Into<String>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CHANNEL_CAPACITY);
        let mut topics = self.topics.lock().await;
        topics.entry(topic.into()).or_default().push(Subscriber { id, tx });
        Subscription { id, receiver: rx }
    }

    pub async fn unsubscribe(&self, topic: &str, id: SubscriptionId) {
        let mut topics = self.topics.lock().await;
        if let Some(subs) = topics.get_mut(topic) {
            subs.retain(|s| s.id != id);
            if subs.is_empty() {
                topics.remove(topic);
            }
        }
    }

    /// Publish `event` to every current subscriber of `topic`. Ordered
    /// per publisher (subscribers are walked in subscribe order and
    /// each send is awaited before the next). Non-blocking to the
    /// caller beyond the bounded per-subscriber wait; subscribers that
    /// don't drain in time are dropped.
    ///
    /// The subscriber table lock is held only long enough to snapshot
    /// this topic's sender handles — delivery runs against that
    /// snapshot with the lock released, so a slow or dead subscriber on
    /// one topic never blocks a concurrent publish to another topic.
    pub async fn publish(&self, topic: &str, event: serde_json::Value) {
        let snapshot: Vec<(SubscriptionId, mpsc::Sender<serde_json::Value>)> = {
            let topics = self.topics.lock().await;
            match topics.get(topic) {
                Some(subs) => subs.iter().map(|s| (s.id, s.tx.clone())).collect(),
                None => return,
            }
        };

        let mut dead = Vec::new();
        for (id, tx) in &snapshot {
            match tokio::time::timeout(self.delivery_wait, tx.send(event.clone())).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => dead.push(*id),
                Err(_) => {
                    tracing::warn!(topic, subscriber = id, "dropping slow event subscriber");
                    dead.push(*id);
                }
            }
        }

        if !dead.is_empty() {
            let mut topics = self.topics.lock().await;
            if let Some(subs) = topics.get_mut(topic) {
                subs.retain(|s| !dead.contains(&s.id));
                if subs.is_empty() {
                    topics.remove(topic);
                }
            }
        }
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_delivers_to_all_subscribers() {
        let hub = EventHub::new();
        let mut a = hub.subscribe("execution:1").await;
        let mut b = hub.subscribe("execution:1").await;

        hub.publish("execution:1", serde_json::json!({"status": "RUNNING"}))
            .await;

        assert_eq!(a.receiver.recv().await.unwrap()["status"], "RUNNING");
        assert_eq!(b.receiver.recv().await.unwrap()["status"], "RUNNING");
    }

    #[tokio::test]
    async fn publish_to_unknown_topic_is_a_no_op() {
        let hub = EventHub::new();
        hub.publish("nobody:listening", serde_json::json!({})).await;
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let hub = EventHub::new();
        let sub = hub.subscribe("inference:1").await;
        hub.unsubscribe("inference:1", sub.id).await;
        hub.publish("inference:1", serde_json::json!({"token": "hi"}))
            .await;
        // topic should have been cleaned up entirely once empty
        let topics = hub.topics.lock().await;
        assert!(!topics.contains_key("inference:1"));
    }

    #[tokio::test]
    async fn dead_receiver_is_pruned_without_blocking_publish() {
        let hub = EventHub::with_delivery_wait(Duration::from_millis(50));
        {
            let _sub = hub.subscribe("execution:2").await;
            // drop receiver immediately so the channel is closed
        }
        hub.publish("execution:2", serde_json::json!({"x": 1})).await;
        let topics = hub.topics.lock().await;
        assert!(!topics.contains_key("execution:2"));
    }
}
