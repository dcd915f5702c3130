//! Broker producer and consumer.
//!
//! Topic naming: `{domain}.events.v1`, chosen by a static prefix match on the
//! event type ([`TopicRouter`]).
//! Message key: aggregate (stream) id, which keeps per-aggregate ordering.
//!
//! Transports are abstracted behind [`MessageTransport`] / [`MessageSource`];
//! [`InMemoryBroker`] backs tests and local runs, the rdkafka transport is
//! behind the `kafka` feature.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use eventide_core::EventId;
use eventide_events::UpcastError;

pub mod consumer;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod memory;
pub mod message;
pub mod producer;
pub mod topics;

pub use consumer::{Checkpoint, ConsumeSummary, ConsumerHandle, DeduplicatingHandler, EventConsumer};
#[cfg(feature = "kafka")]
pub use kafka::{KafkaSource, KafkaTransport};
pub use memory::InMemoryBroker;
pub use message::{
    EventMessage, HEADER_CAUSATION_ID, HEADER_CORRELATION_ID, HEADER_EVENT_TYPE,
    HEADER_SCHEMA_VERSION, HEADER_TENANT_ID, MessageMetadata,
};
pub use producer::EventProducer;
pub use topics::TopicRouter;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("producer not connected; call connect() first")]
    NotConnected,

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("publish to {topic} failed: {message}")]
    Publish { topic: String, message: String },

    #[error("consume failed: {0}")]
    Consume(String),

    #[error("commit failed for {topic}/{partition}: {message}")]
    Commit {
        topic: String,
        partition: i32,
        message: String,
    },

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("upcast failed for event {event_id}: {source}")]
    Upcast {
        event_id: EventId,
        #[source]
        source: UpcastError,
    },
}

/// Message handed to a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub topic: String,
    pub key: String,
    pub payload: Vec<u8>,
    pub headers: Vec<(String, String)>,
}

/// Message read from a source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub timestamp: DateTime<Utc>,
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub headers: Vec<(String, String)>,
}

impl ReceivedMessage {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Sending side of a broker.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    async fn connect(&self) -> Result<(), BrokerError>;

    async fn send(&self, message: OutgoingMessage) -> Result<(), BrokerError>;

    /// Send messages for one topic, in order.
    async fn send_batch(&self, messages: Vec<OutgoingMessage>) -> Result<(), BrokerError> {
        for message in messages {
            self.send(message).await?;
        }
        Ok(())
    }
}

/// Receiving side of a broker (one consumer group).
#[async_trait]
pub trait MessageSource: Send + Sync {
    async fn subscribe(&self, topics: &[String]) -> Result<(), BrokerError>;

    /// Up to `max` messages after the committed position of each partition.
    async fn poll(&self, max: usize, timeout: Duration) -> Result<Vec<ReceivedMessage>, BrokerError>;

    /// Mark `offset` (inclusive) as processed for the partition.
    async fn commit(&self, topic: &str, partition: i32, offset: i64) -> Result<(), BrokerError>;

    /// Move the read position of the partition back to `offset`, so the next
    /// poll returns it again. Called for messages that were polled but not
    /// committed.
    async fn rewind(&self, topic: &str, partition: i32, offset: i64) -> Result<(), BrokerError>;
}

/// Collect up to `max` results from `recv`, waiting `timeout` for the first
/// and 1ms for each one after it.
///
/// An error after at least one message ends the batch early and the messages
/// already received are returned; they have left the source's fetch position
/// and would otherwise be skipped. The error is only returned for an empty
/// batch.
#[cfg_attr(not(feature = "kafka"), allow(dead_code))]
pub(crate) async fn fill_batch<T, E, F, Fut>(max: usize, timeout: Duration, mut recv: F) -> Result<Vec<T>, E>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut batch = Vec::new();
    let mut wait = timeout;

    while batch.len() < max {
        match tokio::time::timeout(wait, recv()).await {
            Ok(Ok(message)) => batch.push(message),
            Ok(Err(err)) if batch.is_empty() => return Err(err),
            Ok(Err(err)) => {
                tracing::warn!(received = batch.len(), error = %err, "receive failed mid-batch, returning partial batch");
                break;
            }
            Err(_) => break,
        }
        wait = Duration::from_millis(1);
    }
    Ok(batch)
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;

    const WAIT: Duration = Duration::from_millis(20);

    /// A receiver that yields `script` in order, then never resolves.
    fn scripted(
        script: Vec<Result<u32, String>>,
    ) -> impl FnMut() -> std::pin::Pin<Box<dyn Future<Output = Result<u32, String>> + Send>> {
        let mut script = VecDeque::from(script);
        move || {
            let next = script.pop_front();
            Box::pin(async move {
                match next {
                    Some(result) => result,
                    None => std::future::pending().await,
                }
            })
        }
    }

    #[tokio::test]
    async fn error_after_messages_returns_what_was_received() {
        let recv = scripted(vec![Ok(1), Ok(2), Err("broker went away".into()), Ok(3)]);
        let batch = fill_batch(10, WAIT, recv).await.unwrap();
        assert_eq!(batch, vec![1, 2]);
    }

    #[tokio::test]
    async fn error_before_any_message_is_returned() {
        let recv = scripted(vec![Err("broker went away".into()), Ok(1)]);
        let err = fill_batch(10, WAIT, recv).await.unwrap_err();
        assert_eq!(err, "broker went away");
    }

    #[tokio::test]
    async fn batch_stops_at_max_or_when_idle() {
        let batch = fill_batch(2, WAIT, scripted(vec![Ok(1), Ok(2), Ok(3)])).await.unwrap();
        assert_eq!(batch, vec![1, 2]);

        let batch = fill_batch(10, WAIT, scripted(vec![Ok(1)])).await.unwrap();
        assert_eq!(batch, vec![1]);

        let batch = fill_batch(10, WAIT, scripted(Vec::new())).await.unwrap();
        assert!(batch.is_empty());
    }
}
