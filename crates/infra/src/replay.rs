//! Replay engine for rebuilding projections from the event store.
//!
//! Events are read in batches, upcast, and pushed through the handlers of a
//! [`HandlerRegistry`] in registration order. Runs report progress through a
//! [`ReplayHandle`] and can be cancelled cooperatively between batches.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use eventide_core::StreamId;
use eventide_events::{DomainEvent, HandlerRegistry, UpcastError, UpcasterPipeline};

use crate::config::ReplayConfig;
use crate::event_store::{EventStore, EventStoreError, TimestampPosition};

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("event store error: {0}")]
    Store(#[from] EventStoreError),

    #[error("upcast failed: {0}")]
    Upcast(#[from] UpcastError),

    #[error("handler {handler} failed on {stream_id} v{version}: {source}")]
    Handler {
        handler: String,
        stream_id: StreamId,
        version: u64,
        last_checkpoint: Option<ReplayCheckpoint>,
        #[source]
        source: anyhow::Error,
    },

    #[error("replay cancelled")]
    Cancelled { last_checkpoint: Option<ReplayCheckpoint> },

    #[error("replay task aborted: {0}")]
    Aborted(String),
}

impl ReplayError {
    /// Position a caller can resume from, when known.
    pub fn last_checkpoint(&self) -> Option<&ReplayCheckpoint> {
        match self {
            Self::Handler { last_checkpoint, .. } | Self::Cancelled { last_checkpoint } => {
                last_checkpoint.as_ref()
            }
            _ => None,
        }
    }
}

/// What to replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayTarget {
    /// One stream, starting at `from_version`.
    Stream { stream_id: StreamId, from_version: u64 },
    /// Every stream, events with `occurred_at >= timestamp`, read one batch
    /// at a time. Clock skew is corrected within a batch, not across batches.
    FromTimestamp(DateTime<Utc>),
    /// Several streams in full, one after the other.
    Streams(Vec<StreamId>),
}

/// Last fully handled event at checkpoint time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplayCheckpoint {
    pub stream_id: StreamId,
    pub version: u64,
    pub events_processed: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplayReport {
    pub events_processed: u64,
    pub handler_invocations: u64,
    /// Distinct streams touched.
    pub streams: usize,
    pub last_checkpoint: Option<ReplayCheckpoint>,
    #[serde(with = "duration_ms")]
    pub elapsed: Duration,
}

mod duration_ms {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u128(d.as_millis())
    }
}

/// Phase of a replay run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayPhase {
    Pending,
    Replaying,
    Complete,
    Failed,
    Cancelled,
}

/// Progress information for a running replay.
#[derive(Debug, Clone, Serialize)]
pub struct ReplayProgress {
    pub phase: ReplayPhase,
    pub events_processed: u64,
    pub handler_invocations: u64,
    pub last_checkpoint: Option<ReplayCheckpoint>,
    pub error: Option<String>,
}

impl Default for ReplayProgress {
    fn default() -> Self {
        Self {
            phase: ReplayPhase::Pending,
            events_processed: 0,
            handler_invocations: 0,
            last_checkpoint: None,
            error: None,
        }
    }
}

/// Handle for monitoring and cancelling a replay.
#[derive(Debug, Clone, Default)]
pub struct ReplayHandle {
    progress: Arc<RwLock<ReplayProgress>>,
    cancellation: Arc<AtomicBool>,
}

impl ReplayHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn progress(&self) -> ReplayProgress {
        self.progress.read().await.clone()
    }

    /// Request cancellation; honoured before the next batch starts.
    pub fn cancel(&self) {
        self.cancellation.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.load(Ordering::Relaxed)
    }
}

/// Replay running on a background task.
#[derive(Debug)]
pub struct ReplayTask {
    handle: ReplayHandle,
    join: JoinHandle<Result<ReplayReport, ReplayError>>,
}

impl ReplayTask {
    pub fn handle(&self) -> &ReplayHandle {
        &self.handle
    }

    pub fn cancel(&self) {
        self.handle.cancel();
    }

    /// Wait for the run to finish.
    pub async fn join(self) -> Result<ReplayReport, ReplayError> {
        self.join
            .await
            .map_err(|e| ReplayError::Aborted(e.to_string()))?
    }
}

/// Rebuilds projections by replaying stored events through handlers.
#[derive(Debug, Clone)]
pub struct ReplayEngine<S> {
    store: S,
    handlers: HandlerRegistry,
    upcasters: Option<Arc<UpcasterPipeline>>,
    config: ReplayConfig,
}

impl<S: EventStore> ReplayEngine<S> {
    pub fn new(store: S, handlers: HandlerRegistry, config: ReplayConfig) -> Self {
        Self {
            store,
            handlers,
            upcasters: None,
            config,
        }
    }

    pub fn with_upcasters(mut self, upcasters: Arc<UpcasterPipeline>) -> Self {
        self.upcasters = Some(upcasters);
        self
    }

    pub async fn replay_stream(
        &self,
        stream_id: &StreamId,
        from_version: u64,
    ) -> Result<ReplayReport, ReplayError> {
        let target = ReplayTarget::Stream {
            stream_id: stream_id.clone(),
            from_version,
        };
        self.run(target, &ReplayHandle::new()).await
    }

    pub async fn replay_from_timestamp(
        &self,
        timestamp: DateTime<Utc>,
    ) -> Result<ReplayReport, ReplayError> {
        self.run(ReplayTarget::FromTimestamp(timestamp), &ReplayHandle::new())
            .await
    }

    pub async fn replay_streams(&self, stream_ids: &[StreamId]) -> Result<ReplayReport, ReplayError> {
        self.run(ReplayTarget::Streams(stream_ids.to_vec()), &ReplayHandle::new())
            .await
    }

    /// Replay `target`, reporting through `handle`.
    #[tracing::instrument(skip(self, handle), err)]
    pub async fn run(
        &self,
        target: ReplayTarget,
        handle: &ReplayHandle,
    ) -> Result<ReplayReport, ReplayError> {
        handle.progress.write().await.phase = ReplayPhase::Replaying;

        let mut run = Run::new(self, handle);
        let result = match target {
            ReplayTarget::Stream {
                stream_id,
                from_version,
            } => run.stream(&stream_id, from_version).await,
            ReplayTarget::FromTimestamp(timestamp) => run.from_timestamp(timestamp).await,
            ReplayTarget::Streams(stream_ids) => {
                let mut result = Ok(());
                for stream_id in &stream_ids {
                    result = run.stream(stream_id, 1).await;
                    if result.is_err() {
                        break;
                    }
                }
                result
            }
        };

        let report = run.report();
        {
            let mut progress = handle.progress.write().await;
            progress.events_processed = report.events_processed;
            progress.handler_invocations = report.handler_invocations;
            progress.last_checkpoint = report.last_checkpoint.clone();
            match &result {
                Ok(()) => progress.phase = ReplayPhase::Complete,
                Err(ReplayError::Cancelled { .. }) => progress.phase = ReplayPhase::Cancelled,
                Err(e) => {
                    progress.phase = ReplayPhase::Failed;
                    progress.error = Some(e.to_string());
                }
            }
        }

        result?;
        tracing::info!(
            events = report.events_processed,
            handler_invocations = report.handler_invocations,
            streams = report.streams,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "replay complete"
        );
        Ok(report)
    }
}

impl<S> ReplayEngine<S>
where
    S: EventStore + Clone + 'static,
{
    /// Run `target` on a background task.
    pub fn spawn(&self, target: ReplayTarget) -> ReplayTask {
        let handle = ReplayHandle::new();
        let engine = self.clone();
        let task_handle = handle.clone();
        let join = tokio::spawn(async move { engine.run(target, &task_handle).await });
        ReplayTask { handle, join }
    }
}

/// State of one replay run.
struct Run<'a, S> {
    engine: &'a ReplayEngine<S>,
    handle: &'a ReplayHandle,
    started: Instant,
    events_processed: u64,
    handler_invocations: u64,
    streams: HashSet<StreamId>,
    last_checkpoint: Option<ReplayCheckpoint>,
    last_position: Option<(StreamId, u64)>,
}

impl<'a, S: EventStore> Run<'a, S> {
    fn new(engine: &'a ReplayEngine<S>, handle: &'a ReplayHandle) -> Self {
        Self {
            engine,
            handle,
            started: Instant::now(),
            events_processed: 0,
            handler_invocations: 0,
            streams: HashSet::new(),
            last_checkpoint: None,
            last_position: None,
        }
    }

    fn report(&self) -> ReplayReport {
        ReplayReport {
            events_processed: self.events_processed,
            handler_invocations: self.handler_invocations,
            streams: self.streams.len(),
            last_checkpoint: self.last_checkpoint.clone(),
            elapsed: self.started.elapsed(),
        }
    }

    async fn stream(&mut self, stream_id: &StreamId, from_version: u64) -> Result<(), ReplayError> {
        let batch_size = self.engine.config.batch_size.max(1);
        let mut next = from_version.max(1);

        loop {
            self.check_cancelled()?;

            let batch = self
                .engine
                .store
                .get_events_batch(stream_id, next, batch_size)
                .await?;
            let Some(last) = batch.last() else {
                return Ok(());
            };
            next = last.version() + 1;
            let exhausted = batch.len() < batch_size;

            self.batch(batch).await?;
            if exhausted {
                return Ok(());
            }
        }
    }

    /// Page through the store's timestamp order, merging each page by
    /// occurrence so skewed clocks within a page keep per-stream version order.
    async fn from_timestamp(&mut self, timestamp: DateTime<Utc>) -> Result<(), ReplayError> {
        let batch_size = self.engine.config.batch_size.max(1);
        let mut after: Option<TimestampPosition> = None;
        let mut heads: HashMap<StreamId, u64> = HashMap::new();

        loop {
            self.check_cancelled()?;

            let page = self
                .engine
                .store
                .get_events_from_timestamp_batch(timestamp, after.as_ref(), batch_size)
                .await?;
            let Some(last) = page.last() else {
                return Ok(());
            };
            after = Some(TimestampPosition::of(last));
            let exhausted = page.len() < batch_size;

            let merged = merge_by_occurrence(page);
            for event in &merged {
                let head = heads.entry(event.aggregate_id().clone()).or_insert(0);
                if event.version() < *head {
                    tracing::warn!(
                        stream_id = %event.aggregate_id(),
                        version = event.version(),
                        after_version = *head,
                        "clock skew wider than a replay batch, event delivered out of version order"
                    );
                }
                *head = (*head).max(event.version());
            }

            self.batch(merged).await?;
            if exhausted {
                return Ok(());
            }
        }
    }

    async fn batch(&mut self, batch: Vec<DomainEvent>) -> Result<(), ReplayError> {
        for event in batch {
            let event = match &self.engine.upcasters {
                Some(upcasters) => upcasters.upcast(event)?,
                None => event,
            };
            self.dispatch(&event).await?;
        }

        // Batch boundaries always checkpoint so a cancelled run resumes exactly.
        self.checkpoint();
        self.publish_progress().await;
        Ok(())
    }

    async fn dispatch(&mut self, event: &DomainEvent) -> Result<(), ReplayError> {
        for handler in self.engine.handlers.handlers_for(event) {
            handler
                .handle(event)
                .await
                .map_err(|source| ReplayError::Handler {
                    handler: handler.name().to_string(),
                    stream_id: event.aggregate_id().clone(),
                    version: event.version(),
                    last_checkpoint: self.last_checkpoint.clone(),
                    source,
                })?;
            self.handler_invocations += 1;
        }

        self.events_processed += 1;
        self.streams.insert(event.aggregate_id().clone());
        self.last_position = Some((event.aggregate_id().clone(), event.version()));

        let interval = self.engine.config.checkpoint_interval;
        if interval > 0 && self.events_processed % interval == 0 {
            self.checkpoint();
        }
        Ok(())
    }

    fn checkpoint(&mut self) {
        let Some((stream_id, version)) = self.last_position.clone() else {
            return;
        };
        if self
            .last_checkpoint
            .as_ref()
            .is_some_and(|c| c.events_processed == self.events_processed)
        {
            return;
        }

        tracing::info!(
            stream_id = %stream_id,
            version,
            events_processed = self.events_processed,
            "replay checkpoint"
        );
        self.last_checkpoint = Some(ReplayCheckpoint {
            stream_id,
            version,
            events_processed: self.events_processed,
        });
    }

    async fn publish_progress(&self) {
        let mut progress = self.handle.progress.write().await;
        progress.events_processed = self.events_processed;
        progress.handler_invocations = self.handler_invocations;
        progress.last_checkpoint = self.last_checkpoint.clone();
    }

    fn check_cancelled(&self) -> Result<(), ReplayError> {
        if self.handle.is_cancelled() {
            tracing::warn!(events_processed = self.events_processed, "replay cancelled");
            return Err(ReplayError::Cancelled {
                last_checkpoint: self.last_checkpoint.clone(),
            });
        }
        Ok(())
    }
}

/// k-way merge of per-stream histories by occurrence time.
///
/// Each stream stays strictly ascending by version even when its timestamps
/// are not (clock skew between writers); ties go to the smaller stream id.
fn merge_by_occurrence(events: Vec<DomainEvent>) -> Vec<DomainEvent> {
    let mut streams: BTreeMap<StreamId, Vec<DomainEvent>> = BTreeMap::new();
    for event in events {
        streams.entry(event.aggregate_id().clone()).or_default().push(event);
    }

    let mut queues: Vec<VecDeque<DomainEvent>> = streams
        .into_values()
        .map(|mut events| {
            events.sort_by_key(DomainEvent::version);
            VecDeque::from(events)
        })
        .collect();

    let mut heap = BinaryHeap::new();
    for (idx, queue) in queues.iter().enumerate() {
        if let Some(head) = queue.front() {
            heap.push(Reverse((head.occurred_at(), idx)));
        }
    }

    let mut merged = Vec::new();
    while let Some(Reverse((_, idx))) = heap.pop() {
        let Some(event) = queues[idx].pop_front() else {
            continue;
        };
        merged.push(event);
        if let Some(head) = queues[idx].front() {
            heap.push(Reverse((head.occurred_at(), idx)));
        }
    }
    merged
}
