//! Event consumer.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use eventide_core::EventId;
use eventide_events::{DomainEvent, EventHandler, HandlerRegistry, SchemaRegistry, UpcasterPipeline};

use super::message::EventMessage;
use super::{BrokerError, MessageSource, ReceivedMessage};

const DEFAULT_BATCH_SIZE: usize = 100;
const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(500);
const IDLE_BACKOFF: Duration = Duration::from_millis(200);

/// Last processed position of one topic-partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Checkpoint {
    pub offset: i64,
    pub timestamp: DateTime<Utc>,
}

/// What one `poll_once` did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConsumeSummary {
    pub received: usize,
    pub dispatched: usize,
    pub skipped_malformed: usize,
    pub skipped_invalid: usize,
    pub handler_failures: usize,
}

/// Reads messages from a [`MessageSource`], upcasts and validates them, and
/// dispatches to registered handlers.
///
/// A message is committed once every handler has seen it, whether or not the
/// handlers succeeded. Malformed and schema-invalid messages are committed
/// without dispatch.
pub struct EventConsumer {
    source: Arc<dyn MessageSource>,
    handlers: HandlerRegistry,
    schemas: Option<Arc<SchemaRegistry>>,
    upcasters: Option<Arc<UpcasterPipeline>>,
    topics: Vec<String>,
    checkpoints: Mutex<HashMap<(String, i32), Checkpoint>>,
    batch_size: usize,
    poll_timeout: Duration,
}

impl EventConsumer {
    pub fn new(source: Arc<dyn MessageSource>, handlers: HandlerRegistry, topics: Vec<String>) -> Self {
        Self {
            source,
            handlers,
            schemas: None,
            upcasters: None,
            topics,
            checkpoints: Mutex::new(HashMap::new()),
            batch_size: DEFAULT_BATCH_SIZE,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
        }
    }

    pub fn with_schemas(mut self, schemas: Arc<SchemaRegistry>) -> Self {
        self.schemas = Some(schemas);
        self
    }

    pub fn with_upcasters(mut self, upcasters: Arc<UpcasterPipeline>) -> Self {
        self.upcasters = Some(upcasters);
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }

    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    pub async fn start(&self) -> Result<(), BrokerError> {
        self.source.subscribe(&self.topics).await?;
        info!(topics = ?self.topics, handlers = ?self.handlers.names(), "event consumer subscribed");
        Ok(())
    }

    pub fn checkpoint(&self, topic: &str, partition: i32) -> Option<Checkpoint> {
        self.checkpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(topic.to_string(), partition))
            .copied()
    }

    pub fn checkpoints(&self) -> HashMap<(String, i32), Checkpoint> {
        self.checkpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Poll one batch and process it in order.
    ///
    /// Stops at the first message whose upcast or commit fails. That message
    /// and the rest of the batch stay uncommitted, and their partitions are
    /// rewound so the next poll delivers them again.
    pub async fn poll_once(&self) -> Result<ConsumeSummary, BrokerError> {
        let messages = self.source.poll(self.batch_size, self.poll_timeout).await?;
        let mut summary = ConsumeSummary {
            received: messages.len(),
            ..ConsumeSummary::default()
        };

        let mut pending = messages.into_iter();
        while let Some(message) = pending.next() {
            if let Err(err) = self.process(&message, &mut summary).await {
                self.rewind(std::iter::once(&message).chain(pending.as_slice()))
                    .await;
                return Err(err);
            }
        }

        if summary.received > 0 {
            debug!(?summary, "consumer batch processed");
        }
        Ok(summary)
    }

    async fn process(
        &self,
        message: &ReceivedMessage,
        summary: &mut ConsumeSummary,
    ) -> Result<(), BrokerError> {
        let event = match decode(message) {
            Ok(event) => event,
            Err(err) => {
                warn!(
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    error = %err,
                    "skipping malformed message"
                );
                summary.skipped_malformed += 1;
                return self.acknowledge(message).await;
            }
        };

        let event = match &self.upcasters {
            Some(upcasters) => {
                let event_id = event.id();
                upcasters
                    .upcast(event)
                    .map_err(|source| BrokerError::Upcast { event_id, source })?
            }
            None => event,
        };

        if let Some(schemas) = &self.schemas {
            if !schemas.validate_event(&event) {
                summary.skipped_invalid += 1;
                return self.acknowledge(message).await;
            }
        }

        for handler in self.handlers.handlers_for(&event) {
            if let Err(err) = handler.handle(&event).await {
                summary.handler_failures += 1;
                error!(
                    handler = handler.name(),
                    event_id = %event.id(),
                    event_type = %event.event_type(),
                    stream_id = %event.aggregate_id(),
                    error = %err,
                    "event handler failed"
                );
            }
        }
        summary.dispatched += 1;
        self.acknowledge(message).await
    }

    /// Rewind every partition in `unprocessed` to its lowest offset.
    async fn rewind<'a>(&self, unprocessed: impl Iterator<Item = &'a ReceivedMessage>) {
        let mut positions: HashMap<(&str, i32), i64> = HashMap::new();
        for message in unprocessed {
            positions
                .entry((message.topic.as_str(), message.partition))
                .and_modify(|offset| *offset = (*offset).min(message.offset))
                .or_insert(message.offset);
        }

        for ((topic, partition), offset) in positions {
            match self.source.rewind(topic, partition, offset).await {
                Ok(()) => debug!(topic, partition, offset, "partition rewound"),
                Err(err) => error!(
                    topic,
                    partition,
                    offset,
                    error = %err,
                    "could not rewind partition; uncommitted messages may be skipped"
                ),
            }
        }
    }

    async fn acknowledge(&self, message: &ReceivedMessage) -> Result<(), BrokerError> {
        self.source
            .commit(&message.topic, message.partition, message.offset)
            .await?;
        self.checkpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                (message.topic.clone(), message.partition),
                Checkpoint {
                    offset: message.offset,
                    timestamp: message.timestamp,
                },
            );
        Ok(())
    }

    /// Subscribe, then poll until the handle is shut down.
    pub fn spawn(self: Arc<Self>) -> ConsumerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let consumer = self.clone();

        let join = tokio::spawn(async move {
            if let Err(err) = consumer.start().await {
                error!(error = %err, "event consumer failed to subscribe");
                return;
            }
            loop {
                if *shutdown_rx.borrow() {
                    break;
                }

                let delay = match consumer.poll_once().await {
                    Ok(summary) if summary.received > 0 => Duration::ZERO,
                    Ok(_) => IDLE_BACKOFF,
                    Err(err) => {
                        error!(error = %err, "event consumer poll failed, backing off");
                        IDLE_BACKOFF
                    }
                };

                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            info!("event consumer stopped");
        });

        ConsumerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            consumer: self,
        }
    }
}

fn decode(message: &ReceivedMessage) -> Result<DomainEvent, BrokerError> {
    EventMessage::from_bytes(&message.payload)?.to_event()
}

/// Handle to control a running consumer.
pub struct ConsumerHandle {
    shutdown: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
    consumer: Arc<EventConsumer>,
}

impl ConsumerHandle {
    pub fn checkpoint(&self, topic: &str, partition: i32) -> Option<Checkpoint> {
        self.consumer.checkpoint(topic, partition)
    }

    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(join) = self.join.take() {
            if let Err(err) = join.await {
                error!(error = %err, "event consumer task failed");
            }
        }
    }
}

#[derive(Debug, Default)]
struct SeenIds {
    order: VecDeque<EventId>,
    ids: HashSet<EventId>,
}

/// Drops events whose id was already handled.
///
/// Remembers the last `capacity` ids; older ids are forgotten. An id is only
/// recorded after the inner handler succeeds, so failures are retried on
/// redelivery.
pub struct DeduplicatingHandler {
    inner: Arc<dyn EventHandler>,
    capacity: usize,
    seen: Mutex<SeenIds>,
}

impl DeduplicatingHandler {
    pub fn new(inner: Arc<dyn EventHandler>, capacity: usize) -> Self {
        Self {
            inner,
            capacity: capacity.max(1),
            seen: Mutex::new(SeenIds::default()),
        }
    }

    fn seen(&self) -> std::sync::MutexGuard<'_, SeenIds> {
        self.seen.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remember(&self, id: EventId) {
        let mut seen = self.seen();
        if !seen.ids.insert(id) {
            return;
        }
        seen.order.push_back(id);
        while seen.order.len() > self.capacity {
            if let Some(oldest) = seen.order.pop_front() {
                seen.ids.remove(&oldest);
            }
        }
    }
}

#[async_trait]
impl EventHandler for DeduplicatingHandler {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn can_handle(&self, event: &DomainEvent) -> bool {
        self.inner.can_handle(event)
    }

    async fn handle(&self, event: &DomainEvent) -> anyhow::Result<()> {
        if self.seen().ids.contains(&event.id()) {
            debug!(handler = self.inner.name(), event_id = %event.id(), "duplicate event dropped");
            return Ok(());
        }
        self.inner.handle(event).await?;
        self.remember(event.id());
        Ok(())
    }
}
