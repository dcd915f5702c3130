//! Event producer.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info};

use eventide_events::DomainEvent;

use crate::outbox::EventPublisher;

use super::message::EventMessage;
use super::topics::TopicRouter;
use super::{BrokerError, MessageTransport, OutgoingMessage};

/// Serialises events and sends them to the topic chosen by the router.
///
/// The aggregate id is the message key, so events of one stream land on one
/// partition in order.
pub struct EventProducer {
    transport: Arc<dyn MessageTransport>,
    router: TopicRouter,
    connected: AtomicBool,
}

impl EventProducer {
    pub fn new(transport: Arc<dyn MessageTransport>, router: TopicRouter) -> Self {
        Self {
            transport,
            router,
            connected: AtomicBool::new(false),
        }
    }

    pub async fn connect(&self) -> Result<(), BrokerError> {
        self.transport.connect().await?;
        self.connected.store(true, Ordering::Release);
        info!(topics = ?self.router.topics(), "event producer connected");
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn router(&self) -> &TopicRouter {
        &self.router
    }

    fn ensure_connected(&self) -> Result<(), BrokerError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(BrokerError::NotConnected)
        }
    }

    fn encode(&self, event: &DomainEvent) -> Result<OutgoingMessage, BrokerError> {
        let message = EventMessage::from_event(event, Utc::now());
        Ok(OutgoingMessage {
            topic: self.router.route(event.event_type()).to_string(),
            key: event.aggregate_id().to_string(),
            payload: message.to_bytes()?,
            headers: message.headers(),
        })
    }

    pub async fn publish(&self, event: &DomainEvent) -> Result<(), BrokerError> {
        self.ensure_connected()?;
        let message = self.encode(event)?;
        let topic = message.topic.clone();
        self.transport.send(message).await?;

        debug!(
            topic = %topic,
            event_id = %event.id(),
            stream_id = %event.aggregate_id(),
            event_type = %event.event_type(),
            "published event"
        );
        Ok(())
    }

    /// Publish several events, one `send_batch` per topic.
    ///
    /// Topics are sent in order of first appearance; the relative order of
    /// events within a topic is preserved.
    pub async fn publish_batch(&self, events: &[DomainEvent]) -> Result<(), BrokerError> {
        self.ensure_connected()?;

        let mut groups: Vec<(String, Vec<OutgoingMessage>)> = Vec::new();
        for event in events {
            let message = self.encode(event)?;
            match groups.iter_mut().find(|(topic, _)| *topic == message.topic) {
                Some((_, batch)) => batch.push(message),
                None => groups.push((message.topic.clone(), vec![message])),
            }
        }

        for (topic, batch) in groups {
            let count = batch.len();
            self.transport.send_batch(batch).await?;
            debug!(topic = %topic, count, "published event batch");
        }
        Ok(())
    }
}

impl std::fmt::Debug for EventProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventProducer")
            .field("router", &self.router)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl EventPublisher for EventProducer {
    async fn publish(&self, event: &DomainEvent) -> anyhow::Result<()> {
        EventProducer::publish(self, event).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use eventide_core::{StreamId, TenantId};

    use crate::broker::InMemoryBroker;

    use super::*;

    fn event(stream: &str, version: u64, event_type: &str) -> DomainEvent {
        DomainEvent::new(StreamId::new(stream), TenantId::new(), version, event_type, json!({}))
    }

    #[tokio::test]
    async fn publishing_before_connect_fails_loudly() {
        let producer = EventProducer::new(Arc::new(InMemoryBroker::new(1)), TopicRouter::default());
        let err = producer.publish(&event("acc-1", 1, "AccountCreated")).await.unwrap_err();
        assert!(matches!(err, BrokerError::NotConnected));
        assert!(matches!(
            producer.publish_batch(&[]).await,
            Err(BrokerError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn events_are_keyed_by_aggregate_and_routed_by_type() {
        let broker = Arc::new(InMemoryBroker::new(4));
        let producer = EventProducer::new(broker.clone(), TopicRouter::default());
        producer.connect().await.unwrap();

        producer.publish(&event("acc-1", 1, "AccountCreated")).await.unwrap();
        producer.publish(&event("sku-9", 1, "StockAdjusted")).await.unwrap();

        let accounting = broker.messages("accounting.events.v1");
        assert_eq!(accounting.len(), 1);
        assert_eq!(accounting[0].key.as_deref(), Some("acc-1"));
        assert_eq!(accounting[0].header("event-type"), Some("AccountCreated"));
        assert_eq!(broker.messages("inventory.events.v1").len(), 1);
    }

    #[tokio::test]
    async fn batches_are_grouped_by_topic_in_order() {
        let broker = Arc::new(InMemoryBroker::new(1));
        let producer = EventProducer::new(broker.clone(), TopicRouter::default());
        producer.connect().await.unwrap();

        let events = vec![
            event("acc-1", 1, "AccountCreated"),
            event("sku-1", 1, "StockAdjusted"),
            event("acc-1", 2, "AccountRenamed"),
        ];
        producer.publish_batch(&events).await.unwrap();

        let versions: Vec<u64> = broker
            .messages("accounting.events.v1")
            .iter()
            .map(|m| EventMessage::from_bytes(&m.payload).unwrap().version)
            .collect();
        assert_eq!(versions, vec![1, 2]);
        assert_eq!(broker.messages("inventory.events.v1").len(), 1);
    }

    #[tokio::test]
    async fn transport_failures_surface_to_the_outbox() {
        let broker = Arc::new(InMemoryBroker::new(1));
        let producer = EventProducer::new(broker.clone(), TopicRouter::default());
        producer.connect().await.unwrap();
        broker.fail_next_sends(1);

        let publisher: &dyn EventPublisher = &producer;
        assert!(publisher.publish(&event("acc-1", 1, "AccountCreated")).await.is_err());
        assert!(publisher.publish(&event("acc-1", 1, "AccountCreated")).await.is_ok());
    }
}
