//! Outbox worker: claims pending records, publishes them and drives the
//! retry / dead-letter state machine.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use eventide_events::DomainEvent;

use crate::config::OutboxConfig;

use super::store::OutboxStore;
use super::types::{ClaimRequest, OutboxError, OutboxRecord, OutboxStats};

/// Number of recent records the average processing time is computed over.
const METRICS_WINDOW: usize = 100;

/// Destination of outbox records (usually the broker producer).
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: &DomainEvent) -> anyhow::Result<()>;
}

#[async_trait]
impl<P: EventPublisher + ?Sized> EventPublisher for Arc<P> {
    async fn publish(&self, event: &DomainEvent) -> anyhow::Result<()> {
        (**self).publish(event).await
    }
}

/// Running worker metrics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct OutboxMetrics {
    pub processed: u64,
    pub failed: u64,
    pub dlq: u64,
    /// Rolling average over the last 100 processed records.
    pub avg_processing_ms: f64,
    pub last_processed_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    window: VecDeque<Duration>,
}

impl OutboxMetrics {
    fn record_success(&mut self, elapsed: Duration, at: DateTime<Utc>) {
        self.processed += 1;
        self.last_processed_at = Some(at);

        if self.window.len() == METRICS_WINDOW {
            self.window.pop_front();
        }
        self.window.push_back(elapsed);
        let total: Duration = self.window.iter().sum();
        self.avg_processing_ms = total.as_secs_f64() * 1000.0 / self.window.len() as f64;
    }
}

/// Metrics together with the store's status counts.
#[derive(Debug, Clone, Serialize)]
pub struct OutboxReport {
    pub metrics: OutboxMetrics,
    pub stats: OutboxStats,
}

/// What happened to one claimed record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Published,
    Retried { retry_count: u32 },
    DeadLettered { retry_count: u32 },
}

/// Summary of one `process_batch` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub claimed: usize,
    pub published: usize,
    pub retried: usize,
    pub dead_lettered: usize,
}

/// Outbox polling worker.
///
/// Several workers (in one process or many) may share a store; exclusive
/// claiming keeps them from publishing the same record concurrently.
pub struct OutboxWorker {
    name: String,
    store: Arc<dyn OutboxStore>,
    publisher: Arc<dyn EventPublisher>,
    config: OutboxConfig,
    metrics: Arc<Mutex<OutboxMetrics>>,
}

impl OutboxWorker {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        publisher: Arc<dyn EventPublisher>,
        config: OutboxConfig,
    ) -> Self {
        Self {
            name: "outbox-worker".to_string(),
            store,
            publisher,
            config,
            metrics: Arc::new(Mutex::new(OutboxMetrics::default())),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn config(&self) -> &OutboxConfig {
        &self.config
    }

    pub fn metrics(&self) -> OutboxMetrics {
        self.metrics.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub async fn report(&self) -> Result<OutboxReport, OutboxError> {
        Ok(OutboxReport {
            metrics: self.metrics(),
            stats: self.store.stats().await?,
        })
    }

    fn update_metrics(&self, f: impl FnOnce(&mut OutboxMetrics)) {
        f(&mut self.metrics.lock().unwrap_or_else(PoisonError::into_inner));
    }

    /// Claim one batch and process every record in it.
    ///
    /// Errors are loop-level failures (claim or status update); individual
    /// publish failures are handled through the retry/DLQ path.
    pub async fn process_batch(&self) -> Result<BatchSummary, OutboxError> {
        let claimed = self
            .store
            .claim_batch(ClaimRequest {
                batch_size: self.config.batch_size,
                now: Utc::now(),
                claim_timeout: self.config.claim_timeout,
            })
            .await?;

        let mut summary = BatchSummary {
            claimed: claimed.len(),
            ..Default::default()
        };
        if claimed.is_empty() {
            return Ok(summary);
        }
        debug!(worker = %self.name, claimed = claimed.len(), "claimed outbox batch");

        for record in claimed {
            match self.process_record(record).await? {
                RecordOutcome::Published => summary.published += 1,
                RecordOutcome::Retried { .. } => summary.retried += 1,
                RecordOutcome::DeadLettered { .. } => summary.dead_lettered += 1,
            }
        }
        Ok(summary)
    }

    async fn process_record(&self, record: OutboxRecord) -> Result<RecordOutcome, OutboxError> {
        let started = Instant::now();

        let event = match record.to_event() {
            Ok(event) => event,
            Err(err) => {
                // Cannot ever be published; skip the retries.
                let retry_count = record.retry_count + 1;
                self.store.mark_dlq(record.id, retry_count, &err.to_string()).await?;
                self.update_metrics(|m| {
                    m.failed += 1;
                    m.dlq += 1;
                });
                error!(outbox_id = %record.id, error = %err, "malformed outbox record moved to dlq");
                return Ok(RecordOutcome::DeadLettered { retry_count });
            }
        };

        match self.publisher.publish(&event).await {
            Ok(()) => {
                let now = Utc::now();
                self.store.mark_done(record.id, now).await?;
                self.update_metrics(|m| m.record_success(started.elapsed(), now));
                debug!(
                    outbox_id = %record.id,
                    stream_id = %record.aggregate_id,
                    event_type = %record.event_type,
                    "published outbox record"
                );
                Ok(RecordOutcome::Published)
            }
            Err(err) => self.handle_failure(&record, &format!("{err:#}")).await,
        }
    }

    async fn handle_failure(
        &self,
        record: &OutboxRecord,
        error: &str,
    ) -> Result<RecordOutcome, OutboxError> {
        let retry_count = record.retry_count + 1;

        if retry_count >= self.config.dlq_threshold {
            self.store.mark_dlq(record.id, retry_count, error).await?;
            self.update_metrics(|m| {
                m.failed += 1;
                m.dlq += 1;
            });
            error!(
                outbox_id = %record.id,
                stream_id = %record.aggregate_id,
                retry_count,
                error,
                "outbox record moved to dlq"
            );
            return Ok(RecordOutcome::DeadLettered { retry_count });
        }

        let delay = self.config.retry_delay(retry_count);
        let next_attempt_at = Utc::now() + chrono::Duration::milliseconds(delay.as_millis() as i64);
        self.store
            .mark_retry(record.id, retry_count, error, next_attempt_at)
            .await?;
        self.update_metrics(|m| m.failed += 1);
        warn!(
            outbox_id = %record.id,
            stream_id = %record.aggregate_id,
            retry_count,
            delay_ms = delay.as_millis() as u64,
            error,
            "outbox publish failed, scheduled retry"
        );
        Ok(RecordOutcome::Retried { retry_count })
    }

    /// Run the polling loop on the tokio runtime until the handle is shut down.
    pub fn spawn(self) -> OutboxWorkerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let metrics = self.metrics.clone();
        let store = self.store.clone();

        let join = tokio::spawn(async move {
            info!(worker = %self.name, "outbox worker started");
            loop {
                if *shutdown_rx.borrow() {
                    break;
                }

                let delay = match self.process_batch().await {
                    Ok(_) => self.config.poll_interval,
                    Err(err) => {
                        error!(worker = %self.name, error = %err, "outbox poll failed, backing off");
                        self.config.error_backoff()
                    }
                };

                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            info!(worker = %self.name, "outbox worker stopped");
        });

        OutboxWorkerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            metrics,
            store,
        }
    }
}

/// Handle to control a running worker.
pub struct OutboxWorkerHandle {
    shutdown: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
    metrics: Arc<Mutex<OutboxMetrics>>,
    store: Arc<dyn OutboxStore>,
}

impl OutboxWorkerHandle {
    pub fn metrics(&self) -> OutboxMetrics {
        self.metrics.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub async fn report(&self) -> Result<OutboxReport, OutboxError> {
        Ok(OutboxReport {
            metrics: self.metrics(),
            stats: self.store.stats().await?,
        })
    }

    /// Stop the loop and wait for the in-flight batch to finish.
    ///
    /// A pending sleep is interrupted; no retry timer outlives the worker.
    pub async fn shutdown(mut self) -> OutboxMetrics {
        let _ = self.shutdown.send(true);
        if let Some(join) = self.join.take() {
            if let Err(err) = join.await {
                error!(error = %err, "outbox worker task failed");
            }
        }
        self.metrics()
    }
}
