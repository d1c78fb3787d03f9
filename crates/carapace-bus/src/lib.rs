//! Topic-prefix event bus. Per `SPEC_FULL.md` §4.1: single-writer per
//! publisher, multi-reader; subscriptions match by topic **prefix**
//! (`response.` matches `response.chunk`, `response.end`); per-publisher
//! messages are delivered in publish order to each subscriber; the bus
//! never blocks a publisher on a slow subscriber — it drops the **oldest**
//! queued message for that subscriber once its bounded queue is full.
//!
//! The subscriber-registry shape (atomic id counter, `DashMap` keyed on
//! subscriber id, per-subscriber stats) is grounded on the `other_examples`
//! `libretto` plugin-system `event_bus.rs`. That implementation drops the
//! *newest* message via `try_send`/`TrySendError::Full`; this bus inverts
//! that to drop-oldest using a bounded ring buffer plus a `Notify`, since
//! `tokio::sync::mpsc` has no drop-oldest send primitive.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use carapace_domain::envelope::EventEnvelope;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;

pub const DEFAULT_QUEUE_DEPTH: usize = 1024;

struct SubscriberState {
    prefix: String,
    queue: Mutex<VecDeque<EventEnvelope>>,
    notify: Notify,
    capacity: usize,
}

/// A live subscription. One subscriber = one stream; every message whose
/// topic matches the subscribed prefix is delivered, in publish order per
/// publisher. Dropped automatically removes the subscriber from the bus.
pub struct Subscription {
    id: u64,
    state: Arc<SubscriberState>,
    bus: Arc<InProcessBus>,
}

impl Subscription {
    /// Await the next message matching this subscription's prefix.
    pub async fn recv(&self) -> EventEnvelope {
        loop {
            if let Some(envelope) = self.state.queue.lock().pop_front() {
                return envelope;
            }
            self.state.notify.notified().await;
        }
    }

    /// Non-blocking poll; `None` if no message is queued right now.
    pub fn try_recv(&self) -> Option<EventEnvelope> {
        self.state.queue.lock().pop_front()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.subscribers.remove(&self.id);
    }
}

/// In-process implementation. A wire implementation would republish over
/// the same request-socket framing used for container traffic, but the
/// core's own `response.*`/dispatcher inputs never leave the process, so
/// this is the only implementation Carapace needs.
pub struct InProcessBus {
    subscribers: DashMap<u64, Arc<SubscriberState>>,
    next_id: AtomicU64,
    queue_depth: usize,
    dropped: AtomicU64,
}

impl InProcessBus {
    pub fn new(queue_depth: usize) -> Arc<Self> {
        Arc::new(Self {
            subscribers: DashMap::new(),
            next_id: AtomicU64::new(1),
            queue_depth,
            dropped: AtomicU64::new(0),
        })
    }

    pub async fn publish(self: &Arc<Self>, envelope: EventEnvelope) {
        for entry in self.subscribers.iter() {
            let state = entry.value();
            if !envelope.topic.starts_with(state.prefix.as_str()) {
                continue;
            }
            let mut queue = state.queue.lock();
            if queue.len() >= state.capacity {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(topic = %envelope.topic, prefix = %state.prefix, "bus.dropped: subscriber queue full, oldest message dropped");
            }
            queue.push_back(envelope.clone());
            drop(queue);
            state.notify.notify_one();
        }
    }

    pub fn subscribe(self: &Arc<Self>, prefix: impl Into<String>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let state = Arc::new(SubscriberState {
            prefix: prefix.into(),
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity: self.queue_depth,
        });
        self.subscribers.insert(id, state.clone());
        Subscription {
            id,
            state,
            bus: self.clone(),
        }
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use carapace_domain::envelope::Group;

    fn event(topic: &str) -> EventEnvelope {
        EventEnvelope::new_event(topic, "test", Group::from("g1"), serde_json::json!({}))
    }

    #[tokio::test]
    async fn prefix_match_delivers() {
        let bus = InProcessBus::new(16);
        let sub = bus.subscribe("response.");
        bus.publish(event("response.chunk")).await;
        bus.publish(event("other.topic")).await;

        let received = sub.recv().await;
        assert_eq!(received.topic, "response.chunk");
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn publish_order_preserved_per_subscriber() {
        let bus = InProcessBus::new(16);
        let sub = bus.subscribe("response.");
        bus.publish(event("response.1")).await;
        bus.publish(event("response.2")).await;
        bus.publish(event("response.3")).await;

        assert_eq!(sub.recv().await.topic, "response.1");
        assert_eq!(sub.recv().await.topic, "response.2");
        assert_eq!(sub.recv().await.topic, "response.3");
    }

    #[tokio::test]
    async fn drops_oldest_when_queue_full() {
        let bus = InProcessBus::new(2);
        let sub = bus.subscribe("response.");
        bus.publish(event("response.1")).await;
        bus.publish(event("response.2")).await;
        bus.publish(event("response.3")).await;

        assert_eq!(bus.dropped_count(), 1);
        assert_eq!(sub.recv().await.topic, "response.2");
        assert_eq!(sub.recv().await.topic, "response.3");
    }

    #[tokio::test]
    async fn unsubscribe_on_drop() {
        let bus = InProcessBus::new(16);
        {
            let _sub = bus.subscribe("response.");
            assert_eq!(bus.subscriber_count(), 1);
        }
        assert_eq!(bus.subscriber_count(), 0);
    }
}
