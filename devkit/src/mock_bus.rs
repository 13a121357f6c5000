/*!
Mock bus channel for tests without a broker.

Records every publication and subscription. The test drives the event side:
connection, incoming messages and connection loss.
*/

use ac_bridge::bus::{BusEvent, BusSink, BusSource};
use ac_bridge::error::{BridgeError, Channel, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::QoS;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tracing::info;

#[derive(Debug, Clone)]
pub struct MockMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

impl MockMessage {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    pub fn json(&self) -> Option<Value> {
        serde_json::from_slice(&self.payload).ok()
    }
}

#[derive(Clone)]
pub struct MockBus {
    published: Arc<Mutex<Vec<MockMessage>>>,
    subscriptions: Arc<Mutex<Vec<String>>>,
    closed: Arc<AtomicBool>,
    fail_publish: Arc<AtomicBool>,
    requests: Arc<RequestQueue>,
    events: mpsc::UnboundedSender<Result<BusEvent>>,
}

pub struct MockBusEvents {
    rx: mpsc::UnboundedReceiver<Result<BusEvent>>,
    requests: Arc<RequestQueue>,
}

/// Outgoing requests waiting for the event side to be polled, like the
/// request channel between a rumqttc client and its event loop.
struct RequestQueue {
    capacity: AtomicUsize,
    queued: AtomicUsize,
    pending: Notify,
    drained: Notify,
}

impl RequestQueue {
    async fn push(&self) {
        loop {
            let drained = self.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();
            let queued = self.queued.load(Ordering::SeqCst);
            if queued < self.capacity.load(Ordering::SeqCst) {
                self.queued.store(queued + 1, Ordering::SeqCst);
                self.pending.notify_one();
                return;
            }
            drained.await;
        }
    }

    fn drain(&self) {
        self.queued.store(0, Ordering::SeqCst);
        self.drained.notify_waiters();
    }
}

pub fn mock_bus() -> (MockBus, MockBusEvents) {
    let (events, rx) = mpsc::unbounded_channel();
    let requests = Arc::new(RequestQueue {
        capacity: AtomicUsize::new(usize::MAX),
        queued: AtomicUsize::new(0),
        pending: Notify::new(),
        drained: Notify::new(),
    });
    let bus = MockBus {
        published: Arc::new(Mutex::new(Vec::new())),
        subscriptions: Arc::new(Mutex::new(Vec::new())),
        closed: Arc::new(AtomicBool::new(false)),
        fail_publish: Arc::new(AtomicBool::new(false)),
        requests: requests.clone(),
        events,
    };
    (bus, MockBusEvents { rx, requests })
}

impl MockBus {
    /// The broker accepted the connection.
    pub fn connect(&self) {
        let _ = self.events.send(Ok(BusEvent::Connected));
    }

    pub fn simulate_incoming(&self, topic: &str, payload: impl Into<Vec<u8>>) {
        let message = BusEvent::Message { topic: topic.to_string(), payload: payload.into() };
        let _ = self.events.send(Ok(message));
        info!("[MOCK] incoming on {}", topic);
    }

    pub fn drop_connection(&self, reason: &str) {
        let _ = self.events.send(Err(BridgeError::connection_lost(Channel::Bus, reason)));
    }

    /// Every later publish fails as if the connection were gone.
    pub fn fail_publishes(&self) {
        self.fail_publish.store(true, Ordering::SeqCst);
    }

    /// Publishes beyond `capacity` wait until the event side is polled again.
    pub fn limit_request_queue(&self, capacity: usize) {
        self.requests.capacity.store(capacity.max(1), Ordering::SeqCst);
    }

    pub fn published_messages(&self) -> Vec<MockMessage> {
        self.published.lock().clone()
    }

    pub fn find_messages_by_topic(&self, topic: &str) -> Vec<MockMessage> {
        self.published.lock().iter().filter(|m| m.topic == topic).cloned().collect()
    }

    /// JSON payloads published on a topic, oldest first.
    pub fn json_messages(&self, topic: &str) -> Vec<Value> {
        self.find_messages_by_topic(topic).iter().filter_map(MockMessage::json).collect()
    }

    pub fn text_messages(&self, topic: &str) -> Vec<String> {
        self.find_messages_by_topic(topic).iter().map(MockMessage::text).collect()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BusSink for MockBus {
    async fn publish(&self, topic: &str, qos: QoS, retain: bool, payload: Vec<u8>) -> Result<()> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(BridgeError::connection_lost(Channel::Bus, "mock publish failure"));
        }
        self.requests.push().await;
        info!("[MOCK] published to {}: {} bytes", topic, payload.len());
        self.published.lock().push(MockMessage { topic: topic.to_string(), payload, qos, retain });
        Ok(())
    }

    async fn subscribe(&self, topic: &str, _qos: QoS) -> Result<()> {
        self.subscriptions.lock().push(topic.to_string());
        Ok(())
    }

    /// Behaves like a flushed event loop: the source reports `Closed` next.
    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.events.send(Ok(BusEvent::Closed));
        Ok(())
    }
}

#[async_trait]
impl BusSource for MockBusEvents {
    async fn next_event(&mut self) -> Result<BusEvent> {
        loop {
            tokio::select! {
                event = self.rx.recv() => {
                    self.requests.drain();
                    return match event {
                        Some(event) => event,
                        None => Err(BridgeError::connection_lost(Channel::Bus, "mock bus dropped")),
                    };
                }
                _ = self.requests.pending.notified() => self.requests.drain(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_records_publications_and_subscriptions() {
        let (bus, _events) = mock_bus();
        bus.subscribe("ac/+/cmd", QoS::ExactlyOnce).await.unwrap();
        let payload = br#"{"Name":"den"}"#.to_vec();
        bus.publish("ac/den/status", QoS::ExactlyOnce, false, payload).await.unwrap();

        assert_eq!(bus.subscriptions(), vec!["ac/+/cmd"]);
        assert_eq!(bus.json_messages("ac/den/status")[0]["Name"], "den");
        assert!(!bus.find_messages_by_topic("ac/den/status")[0].retain);
    }

    #[tokio::test]
    async fn test_event_side_follows_the_test() {
        let (bus, mut events) = mock_bus();
        bus.connect();
        bus.simulate_incoming("ac/cmd", "status");
        bus.close().await.unwrap();

        assert_eq!(events.next_event().await.unwrap(), BusEvent::Connected);
        let incoming = events.next_event().await.unwrap();
        assert!(matches!(incoming, BusEvent::Message { topic, .. } if topic == "ac/cmd"));
        assert_eq!(events.next_event().await.unwrap(), BusEvent::Closed);
        assert!(bus.is_closed());
    }

    #[tokio::test]
    async fn test_publish_failure() {
        let (bus, _events) = mock_bus();
        bus.fail_publishes();
        let err = bus
            .publish("ac/status", QoS::ExactlyOnce, true, b"online".to_vec())
            .await
            .unwrap_err();
        assert_eq!(err.channel(), Some(Channel::Bus));
        assert!(bus.published_messages().is_empty());
    }

    #[tokio::test]
    async fn test_full_request_queue_waits_for_the_event_side() {
        let (bus, mut events) = mock_bus();
        bus.limit_request_queue(1);
        bus.publish("ac/status", QoS::ExactlyOnce, true, b"online".to_vec()).await.unwrap();

        let second = tokio::spawn({
            let bus = bus.clone();
            async move { bus.publish("ac/status", QoS::ExactlyOnce, true, b"x".to_vec()).await }
        });
        tokio::task::yield_now().await;
        assert_eq!(bus.published_messages().len(), 1);

        bus.connect();
        assert_eq!(events.next_event().await.unwrap(), BusEvent::Connected);
        second.await.unwrap().unwrap();
        assert_eq!(bus.published_messages().len(), 2);
    }
}
