//! Outbox storage contract.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use eventide_core::EventId;

use super::types::{ClaimRequest, OutboxError, OutboxRecord, OutboxStats};

/// Durable queue of events awaiting publication.
///
/// Implementations must guarantee that concurrent `claim_batch` calls never
/// return the same record. All `mark_*` transitions start from `processing`.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Insert pending records outside of an event append (replays, backfills).
    /// Records whose id already exists are ignored.
    async fn enqueue(&self, records: Vec<OutboxRecord>) -> Result<(), OutboxError>;

    /// Claim up to `batch_size` eligible records, oldest first, moving them to `processing`.
    async fn claim_batch(&self, request: ClaimRequest) -> Result<Vec<OutboxRecord>, OutboxError>;

    async fn mark_done(&self, id: EventId, processed_at: DateTime<Utc>) -> Result<(), OutboxError>;

    /// Back to `pending`, not claimable before `next_attempt_at`.
    async fn mark_retry(
        &self,
        id: EventId,
        retry_count: u32,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<(), OutboxError>;

    async fn mark_dlq(&self, id: EventId, retry_count: u32, error: &str) -> Result<(), OutboxError>;

    async fn get(&self, id: EventId) -> Result<Option<OutboxRecord>, OutboxError>;

    async fn stats(&self) -> Result<OutboxStats, OutboxError>;

    /// Dead-lettered records, oldest first.
    async fn list_dlq(&self, limit: usize) -> Result<Vec<OutboxRecord>, OutboxError>;

    /// Operator action: move a `dlq` record back to `pending` with its retry count reset.
    async fn requeue_dlq(&self, id: EventId) -> Result<(), OutboxError>;
}

#[async_trait]
impl<S> OutboxStore for Arc<S>
where
    S: OutboxStore + ?Sized,
{
    async fn enqueue(&self, records: Vec<OutboxRecord>) -> Result<(), OutboxError> {
        (**self).enqueue(records).await
    }

    async fn claim_batch(&self, request: ClaimRequest) -> Result<Vec<OutboxRecord>, OutboxError> {
        (**self).claim_batch(request).await
    }

    async fn mark_done(&self, id: EventId, processed_at: DateTime<Utc>) -> Result<(), OutboxError> {
        (**self).mark_done(id, processed_at).await
    }

    async fn mark_retry(
        &self,
        id: EventId,
        retry_count: u32,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<(), OutboxError> {
        (**self).mark_retry(id, retry_count, error, next_attempt_at).await
    }

    async fn mark_dlq(&self, id: EventId, retry_count: u32, error: &str) -> Result<(), OutboxError> {
        (**self).mark_dlq(id, retry_count, error).await
    }

    async fn get(&self, id: EventId) -> Result<Option<OutboxRecord>, OutboxError> {
        (**self).get(id).await
    }

    async fn stats(&self) -> Result<OutboxStats, OutboxError> {
        (**self).stats().await
    }

    async fn list_dlq(&self, limit: usize) -> Result<Vec<OutboxRecord>, OutboxError> {
        (**self).list_dlq(limit).await
    }

    async fn requeue_dlq(&self, id: EventId) -> Result<(), OutboxError> {
        (**self).requeue_dlq(id).await
    }
}
