use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use dashmap::DashMap;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::events::{DispatchEvent, Envelope, Topic};
use crate::observability::metrics::Metrics;

pub type ConnectionId = u64;

struct Connection {
    identity: Topic,
    sender: mpsc::Sender<Envelope>,
    topics: HashSet<Topic>,
}

struct Inner {
    topics: DashMap<Topic, HashMap<ConnectionId, mpsc::Sender<Envelope>>>,
    connections: DashMap<ConnectionId, Connection>,
    next_id: AtomicU64,
    buffer_size: usize,
    metrics: Metrics,
}

/// Topic-scoped fan-out to connected subscribers.
///
/// Each connection gets its own bounded queue, so events published from
/// one task arrive in publish order on every channel. A full queue drops
/// the event for that connection only.
#[derive(Clone)]
pub struct EventBroadcaster {
    inner: Arc<Inner>,
}

impl EventBroadcaster {
    pub fn new(buffer_size: usize, metrics: Metrics) -> Self {
        Self {
            inner: Arc::new(Inner {
                topics: DashMap::new(),
                connections: DashMap::new(),
                next_id: AtomicU64::new(1),
                buffer_size: buffer_size.max(1),
                metrics,
            }),
        }
    }

    /// Registers a connection already subscribed to its own identity channel.
    pub fn connect(&self, identity: Topic) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(self.inner.buffer_size);

        self.inner.connections.insert(
            id,
            Connection {
                identity,
                sender: sender.clone(),
                topics: HashSet::from([identity]),
            },
        );
        self.inner
            .topics
            .entry(identity)
            .or_default()
            .insert(id, sender);

        debug!(connection_id = id, channel = %identity, "subscriber connected");

        Subscription {
            id,
            identity,
            events: ReceiverStream::new(receiver),
            broadcaster: self.clone(),
        }
    }

    /// Returns false when the connection is gone.
    pub fn subscribe(&self, connection_id: ConnectionId, topic: Topic) -> bool {
        let sender = match self.inner.connections.get_mut(&connection_id) {
            Some(mut connection) => {
                connection.topics.insert(topic);
                connection.sender.clone()
            }
            None => return false,
        };

        self.inner
            .topics
            .entry(topic)
            .or_default()
            .insert(connection_id, sender);
        true
    }

    /// Leaves a channel. A connection cannot leave its own identity channel.
    pub fn unsubscribe(&self, connection_id: ConnectionId, topic: Topic) -> bool {
        let removed = match self.inner.connections.get_mut(&connection_id) {
            Some(mut connection) if connection.identity != topic => connection.topics.remove(&topic),
            _ => false,
        };

        if removed {
            self.remove_from_topic(topic, connection_id);
        }
        removed
    }

    pub fn disconnect(&self, connection_id: ConnectionId) {
        let Some((_, connection)) = self.inner.connections.remove(&connection_id) else {
            return;
        };

        for topic in connection.topics {
            self.remove_from_topic(topic, connection_id);
        }

        debug!(connection_id, "subscriber disconnected");
    }

    /// Delivers to every current subscriber of `topic` without waiting.
    /// Returns how many subscribers accepted the event.
    pub fn publish(&self, topic: Topic, event: &DispatchEvent) -> usize {
        let subscribers: Vec<(ConnectionId, mpsc::Sender<Envelope>)> =
            match self.inner.topics.get(&topic) {
                Some(subscribers) => subscribers
                    .iter()
                    .map(|(id, sender)| (*id, sender.clone()))
                    .collect(),
                None => return 0,
            };

        let mut delivered = 0;
        let mut closed = Vec::new();

        for (connection_id, sender) in subscribers {
            let envelope = Envelope {
                channel: topic,
                event: event.clone(),
            };

            match sender.try_send(envelope) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    self.inner.metrics.events_dropped_total.inc();
                    warn!(
                        connection_id,
                        channel = %topic,
                        kind = event.kind(),
                        "subscriber buffer full; dropping event"
                    );
                }
                Err(TrySendError::Closed(_)) => closed.push(connection_id),
            }
        }

        for connection_id in closed {
            self.remove_from_topic(topic, connection_id);
        }

        self.inner
            .metrics
            .events_published_total
            .with_label_values(&[event.kind()])
            .inc();

        delivered
    }

    pub fn publish_all(&self, topics: &[Topic], event: &DispatchEvent) -> usize {
        topics.iter().map(|topic| self.publish(*topic, event)).sum()
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.inner
            .topics
            .get(&topic)
            .map(|subscribers| subscribers.len())
            .unwrap_or(0)
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.len()
    }

    fn remove_from_topic(&self, topic: Topic, connection_id: ConnectionId) {
        if let Some(mut subscribers) = self.inner.topics.get_mut(&topic) {
            subscribers.remove(&connection_id);
        }
        self.inner
            .topics
            .remove_if(&topic, |_, subscribers| subscribers.is_empty());
    }
}

/// A live connection. Dropping it disconnects from every channel.
pub struct Subscription {
    id: ConnectionId,
    identity: Topic,
    events: ReceiverStream<Envelope>,
    broadcaster: EventBroadcaster,
}

impl Subscription {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn identity(&self) -> Topic {
        self.identity
    }

    pub async fn recv(&mut self) -> Option<Envelope> {
        self.events.next().await
    }
}

impl Stream for Subscription {
    type Item = Envelope;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.events).poll_next(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.broadcaster.disconnect(self.id);
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use super::EventBroadcaster;
    use crate::events::{DispatchEvent, Topic};
    use crate::models::driver::GeoPoint;
    use crate::observability::metrics::Metrics;

    fn broadcaster(buffer_size: usize) -> EventBroadcaster {
        EventBroadcaster::new(buffer_size, Metrics::new())
    }

    fn location_event(lat: f64) -> DispatchEvent {
        DispatchEvent::LocationUpdate {
            driver_id: Uuid::from_u128(1),
            location: GeoPoint { lat, lng: 13.4 },
            recorded_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn connection_receives_its_identity_channel() {
        let broadcaster = broadcaster(8);
        let driver = Topic::Driver(Uuid::from_u128(1));
        let mut subscription = broadcaster.connect(driver);
        assert_eq!(subscription.identity(), driver);

        assert_eq!(broadcaster.publish(driver, &location_event(52.5)), 1);

        let envelope = subscription.recv().await.unwrap();
        assert_eq!(envelope.channel, driver);
        assert!(matches!(
            envelope.event,
            DispatchEvent::LocationUpdate { location, .. } if location.lat == 52.5
        ));
    }

    #[tokio::test]
    async fn order_channel_requires_subscription() {
        let broadcaster = broadcaster(8);
        let customer = Topic::Customer(Uuid::from_u128(5));
        let order = Topic::Order(Uuid::from_u128(9));
        let mut subscription = broadcaster.connect(customer);

        assert_eq!(broadcaster.publish(order, &location_event(1.0)), 0);

        assert!(broadcaster.subscribe(subscription.id(), order));
        assert_eq!(broadcaster.publish(order, &location_event(2.0)), 1);
        assert_eq!(subscription.recv().await.unwrap().channel, order);

        assert!(broadcaster.unsubscribe(subscription.id(), order));
        assert_eq!(broadcaster.publish(order, &location_event(3.0)), 0);
        assert_eq!(broadcaster.subscriber_count(order), 0);
    }

    #[tokio::test]
    async fn identity_channel_cannot_be_left() {
        let broadcaster = broadcaster(8);
        let merchant = Topic::Merchant(Uuid::from_u128(3));
        let subscription = broadcaster.connect(merchant);

        assert!(!broadcaster.unsubscribe(subscription.id(), merchant));
        assert_eq!(broadcaster.subscriber_count(merchant), 1);
    }

    #[tokio::test]
    async fn dropping_subscription_disconnects_everywhere() {
        let broadcaster = broadcaster(8);
        let customer = Topic::Customer(Uuid::from_u128(5));
        let order = Topic::Order(Uuid::from_u128(9));

        let subscription = broadcaster.connect(customer);
        broadcaster.subscribe(subscription.id(), order);
        assert_eq!(broadcaster.connection_count(), 1);

        drop(subscription);

        assert_eq!(broadcaster.connection_count(), 0);
        assert_eq!(broadcaster.subscriber_count(customer), 0);
        assert_eq!(broadcaster.subscriber_count(order), 0);
        assert_eq!(broadcaster.publish(order, &location_event(1.0)), 0);
    }

    #[tokio::test]
    async fn full_buffer_drops_instead_of_blocking() {
        let broadcaster = broadcaster(1);
        let driver = Topic::Driver(Uuid::from_u128(1));
        let mut subscription = broadcaster.connect(driver);

        assert_eq!(broadcaster.publish(driver, &location_event(1.0)), 1);
        assert_eq!(broadcaster.publish(driver, &location_event(2.0)), 0);

        let first = subscription.recv().await.unwrap();
        assert!(matches!(
            first.event,
            DispatchEvent::LocationUpdate { location, .. } if location.lat == 1.0
        ));
    }

    #[tokio::test]
    async fn events_arrive_in_publish_order() {
        let broadcaster = broadcaster(64);
        let driver = Topic::Driver(Uuid::from_u128(1));
        let mut subscription = broadcaster.connect(driver);

        for step in 0..20 {
            broadcaster.publish(driver, &location_event(step as f64));
        }

        for step in 0..20 {
            let envelope = subscription.recv().await.unwrap();
            assert!(matches!(
                envelope.event,
                DispatchEvent::LocationUpdate { location, .. } if location.lat == step as f64
            ));
        }
    }

    #[tokio::test]
    async fn publish_all_counts_each_channel() {
        let broadcaster = broadcaster(8);
        let order_id = Uuid::from_u128(9);
        let customer = broadcaster.connect(Topic::Customer(Uuid::from_u128(5)));
        let _merchant = broadcaster.connect(Topic::Merchant(Uuid::from_u128(6)));
        broadcaster.subscribe(customer.id(), Topic::Order(order_id));

        let delivered = broadcaster.publish_all(
            &[
                Topic::Order(order_id),
                Topic::Customer(Uuid::from_u128(5)),
                Topic::Merchant(Uuid::from_u128(6)),
                Topic::Driver(Uuid::from_u128(7)),
            ],
            &location_event(1.0),
        );

        assert_eq!(delivered, 3);
    }
}
