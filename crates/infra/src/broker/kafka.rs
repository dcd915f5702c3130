//! rdkafka transport.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rdkafka::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Header, Headers, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::{Offset, TopicPartitionList};
use tracing::{debug, info};

use crate::config::BrokerConfig;

use super::{BrokerError, MessageSource, MessageTransport, OutgoingMessage, ReceivedMessage, fill_batch};

const METADATA_TIMEOUT: Duration = Duration::from_secs(5);
const SEEK_TIMEOUT: Duration = Duration::from_secs(5);

/// Idempotent producer (`acks=all`).
#[derive(Clone)]
pub struct KafkaTransport {
    producer: FutureProducer,
    send_timeout: Duration,
}

impl KafkaTransport {
    pub fn new(config: &BrokerConfig) -> Result<Self, BrokerError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("client.id", &config.client_id)
            .set("message.timeout.ms", config.send_timeout.as_millis().to_string())
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .create()
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        Ok(Self {
            producer,
            send_timeout: config.send_timeout,
        })
    }
}

#[async_trait]
impl MessageTransport for KafkaTransport {
    async fn connect(&self) -> Result<(), BrokerError> {
        let producer = self.producer.clone();
        let metadata = tokio::task::spawn_blocking(move || {
            producer
                .client()
                .fetch_metadata(None, METADATA_TIMEOUT)
                .map(|m| m.brokers().len())
        })
        .await
        .map_err(|e| BrokerError::Connection(e.to_string()))?
        .map_err(|e| BrokerError::Connection(e.to_string()))?;

        info!(brokers = metadata, "kafka producer connected");
        Ok(())
    }

    async fn send(&self, message: OutgoingMessage) -> Result<(), BrokerError> {
        let mut headers = OwnedHeaders::new();
        for (key, value) in &message.headers {
            headers = headers.insert(Header {
                key,
                value: Some(value.as_str()),
            });
        }

        let record = FutureRecord::to(&message.topic)
            .key(&message.key)
            .payload(&message.payload)
            .headers(headers);

        let (partition, offset) = self
            .producer
            .send(record, Timeout::After(self.send_timeout))
            .await
            .map_err(|(err, _)| BrokerError::Publish {
                topic: message.topic.clone(),
                message: err.to_string(),
            })?;

        debug!(topic = %message.topic, partition, offset, "kafka delivery confirmed");
        Ok(())
    }
}

/// Consumer-group member with manual commits.
pub struct KafkaSource {
    consumer: StreamConsumer,
}

impl KafkaSource {
    pub fn new(config: &BrokerConfig) -> Result<Self, BrokerError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("client.id", &config.client_id)
            .set("group.id", &config.group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .create()
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        Ok(Self { consumer })
    }
}

fn received(message: &BorrowedMessage<'_>) -> ReceivedMessage {
    let timestamp = message
        .timestamp()
        .to_millis()
        .and_then(DateTime::from_timestamp_millis)
        .unwrap_or_else(Utc::now);

    let headers = message
        .headers()
        .map(|headers| {
            headers
                .iter()
                .map(|h| {
                    let value = h.value.map(String::from_utf8_lossy).unwrap_or_default();
                    (h.key.to_string(), value.into_owned())
                })
                .collect()
        })
        .unwrap_or_default();

    ReceivedMessage {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        timestamp,
        key: message.key().map(|k| String::from_utf8_lossy(k).into_owned()),
        payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        headers,
    }
}

#[async_trait]
impl MessageSource for KafkaSource {
    async fn subscribe(&self, topics: &[String]) -> Result<(), BrokerError> {
        let topics: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer
            .subscribe(&topics)
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        info!(?topics, "kafka consumer subscribed");
        Ok(())
    }

    /// Wait up to `timeout` for the first message, then drain whatever is
    /// already buffered up to `max`.
    async fn poll(&self, max: usize, timeout: Duration) -> Result<Vec<ReceivedMessage>, BrokerError> {
        let consumer = &self.consumer;
        fill_batch(max, timeout, || async move {
            consumer.recv().await.map(|message| received(&message))
        })
        .await
        .map_err(|e| BrokerError::Consume(e.to_string()))
    }

    async fn commit(&self, topic: &str, partition: i32, offset: i64) -> Result<(), BrokerError> {
        let commit_error = |message: String| BrokerError::Commit {
            topic: topic.to_string(),
            partition,
            message,
        };

        let mut offsets = TopicPartitionList::new();
        offsets
            .add_partition_offset(topic, partition, Offset::Offset(offset + 1))
            .map_err(|e| commit_error(e.to_string()))?;
        self.consumer
            .commit(&offsets, CommitMode::Sync)
            .map_err(|e| commit_error(e.to_string()))
    }

    /// Seek the fetch position back; the consumer's position has already
    /// moved past everything `recv()` returned.
    async fn rewind(&self, topic: &str, partition: i32, offset: i64) -> Result<(), BrokerError> {
        self.consumer
            .seek(topic, partition, Offset::Offset(offset), SEEK_TIMEOUT)
            .map_err(|e| BrokerError::Consume(format!("seek {topic}/{partition} to {offset}: {e}")))?;
        debug!(topic, partition, offset, "kafka partition rewound");
        Ok(())
    }
}
