//! Fan-out pub/sub for session lifecycle events.

use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

/// Lifecycle event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Connected,
    Disconnected,
    Updated,
}

/// An event as delivered to subscribers and serialized on the wire.
#[derive(Debug, Clone, Serialize)]
pub struct SessionEvent<D> {
    pub event_type: EventKind,
    pub sequence_num: u64,
    #[serde(flatten)]
    pub session: D,
}

/// Fan-out bus with one bounded buffer per subscriber.
///
/// Publishing never blocks: a subscriber whose buffer is full misses the
/// event and can detect the gap from `sequence_num`, then reconcile with a
/// list snapshot.
pub struct EventBus<D> {
    inner: Arc<Mutex<BusInner<D>>>,
}

struct BusInner<D> {
    sequence: u64,
    next_subscriber: u64,
    subscribers: Vec<(u64, mpsc::Sender<SessionEvent<D>>)>,
}

/// A live subscription; dropping it unsubscribes.
pub struct Subscription<D> {
    id: u64,
    rx: mpsc::Receiver<SessionEvent<D>>,
    bus: Arc<Mutex<BusInner<D>>>,
}

impl<D> Subscription<D> {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Receives the next event; `None` once unsubscribed or the bus is gone.
    pub async fn recv(&mut self) -> Option<SessionEvent<D>> {
        self.rx.recv().await
    }
}

impl<D> Drop for Subscription<D> {
    fn drop(&mut self) {
        if let Ok(mut inner) = self.bus.lock() {
            inner.subscribers.retain(|(id, _)| *id != self.id);
        }
    }
}

impl<D: Clone> EventBus<D> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(BusInner {
                sequence: 0,
                next_subscriber: 0,
                subscribers: Vec::new(),
            })),
        }
    }

    /// Registers a subscriber with its own buffer of `buffer` events.
    pub fn subscribe(&self, buffer: usize) -> Subscription<D> {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let mut inner = self.inner.lock().expect("event bus lock poisoned");
        let id = inner.next_subscriber;
        inner.next_subscriber += 1;
        inner.subscribers.push((id, tx));
        Subscription {
            id,
            rx,
            bus: Arc::clone(&self.inner),
        }
    }

    /// Removes a subscriber; a no-op when it is already gone.
    pub fn unsubscribe(&self, id: u64) {
        let mut inner = self.inner.lock().expect("event bus lock poisoned");
        inner.subscribers.retain(|(sub, _)| *sub != id);
    }

    /// Stamps the event with the next sequence number and fans it out.
    /// Returns the sequence number assigned.
    pub fn publish(&self, event_type: EventKind, session: D) -> u64 {
        let mut inner = self.inner.lock().expect("event bus lock poisoned");
        inner.sequence += 1;
        let event = SessionEvent {
            event_type,
            sequence_num: inner.sequence,
            session,
        };
        let sequence = inner.sequence;
        inner.subscribers.retain(|(id, tx)| {
            match tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!(subscriber = *id, sequence, "dropping event for slow subscriber");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
        sequence
    }

    /// The sequence number of the most recently published event.
    pub fn sequence(&self) -> u64 {
        self.inner.lock().expect("event bus lock poisoned").sequence
    }

    #[cfg(test)]
    fn subscriber_count(&self) -> usize {
        self.inner.lock().unwrap().subscribers.len()
    }
}

impl<D: Clone> Default for EventBus<D> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize)]
    struct Desc {
        name: &'static str,
    }

    const ALPHA: Desc = Desc { name: "alpha" };

    #[tokio::test]
    async fn delivers_in_publish_order() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(8);

        assert_eq!(bus.publish(EventKind::Connected, ALPHA), 1);
        assert_eq!(bus.publish(EventKind::Updated, ALPHA), 2);
        assert_eq!(bus.publish(EventKind::Disconnected, ALPHA), 3);

        let first = sub.recv().await.unwrap();
        assert_eq!(first.event_type, EventKind::Connected);
        assert_eq!(first.sequence_num, 1);
        let second = sub.recv().await.unwrap();
        assert_eq!(second.sequence_num, 2);
        let third = sub.recv().await.unwrap();
        assert_eq!(third.event_type, EventKind::Disconnected);
        assert_eq!(third.sequence_num, 3);
    }

    #[tokio::test]
    async fn slow_subscriber_drops_but_sequence_stays_ordered() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(1);

        bus.publish(EventKind::Connected, ALPHA);
        bus.publish(EventKind::Updated, ALPHA);
        bus.publish(EventKind::Updated, ALPHA);

        let first = sub.recv().await.unwrap();
        assert_eq!(first.sequence_num, 1);

        // Buffer was full for 2 and 3; the next delivered event exposes the gap.
        bus.publish(EventKind::Disconnected, ALPHA);
        let next = sub.recv().await.unwrap();
        assert_eq!(next.sequence_num, 4);
        assert!(next.sequence_num > first.sequence_num + 1);
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent() {
        let bus: EventBus<Desc> = EventBus::new();
        let mut sub = bus.subscribe(1);
        let id = sub.id();

        bus.unsubscribe(id);
        bus.unsubscribe(id);
        assert_eq!(bus.subscriber_count(), 0);
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn dropping_subscription_unsubscribes() {
        let bus: EventBus<Desc> = EventBus::new();
        let sub = bus.subscribe(1);
        assert_eq!(bus.subscriber_count(), 1);
        drop(sub);
        assert_eq!(bus.subscriber_count(), 0);
        bus.publish(EventKind::Connected, ALPHA);
        assert_eq!(bus.sequence(), 1);
    }

    #[test]
    fn event_serializes_with_flattened_descriptor() {
        let event = SessionEvent {
            event_type: EventKind::Connected,
            sequence_num: 7,
            session: ALPHA,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event_type"], "connected");
        assert_eq!(json["sequence_num"], 7);
        assert_eq!(json["name"], "alpha");
    }
}
