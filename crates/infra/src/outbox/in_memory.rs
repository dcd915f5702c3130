//! In-memory outbox for tests/dev.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use eventide_core::EventId;

use super::store::OutboxStore;
use super::types::{ClaimRequest, OutboxError, OutboxRecord, OutboxStats, OutboxStatus};

/// In-memory outbox.
///
/// All state sits behind one mutex, so claims are trivially exclusive.
#[derive(Debug, Default)]
pub struct InMemoryOutboxStore {
    records: Mutex<HashMap<EventId, OutboxRecord>>,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self, operation: &str) -> Result<MutexGuard<'_, HashMap<EventId, OutboxRecord>>, OutboxError> {
        self.records
            .lock()
            .map_err(|_| OutboxError::storage(operation, "lock poisoned"))
    }

    /// Synchronous insert used by the in-memory event store while it holds its
    /// own stream lock, so events and outbox rows become visible together.
    pub(crate) fn insert_pending(&self, records: Vec<OutboxRecord>) -> Result<(), OutboxError> {
        let mut map = self.lock("insert_pending")?;
        for record in records {
            map.entry(record.id).or_insert(record);
        }
        Ok(())
    }

    /// All records, oldest first (test helper).
    pub fn snapshot(&self) -> Result<Vec<OutboxRecord>, OutboxError> {
        let map = self.lock("snapshot")?;
        let mut records: Vec<OutboxRecord> = map.values().cloned().collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(records)
    }

    fn transition<F>(
        &self,
        id: EventId,
        from: OutboxStatus,
        to: OutboxStatus,
        apply: F,
    ) -> Result<(), OutboxError>
    where
        F: FnOnce(&mut OutboxRecord),
    {
        let mut map = self.lock("transition")?;
        let record = map.get_mut(&id).ok_or(OutboxError::NotFound(id))?;
        if record.status != from {
            return Err(OutboxError::InvalidTransition {
                id,
                from: record.status,
                to,
            });
        }
        record.status = to;
        apply(record);
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn enqueue(&self, records: Vec<OutboxRecord>) -> Result<(), OutboxError> {
        self.insert_pending(records)
    }

    async fn claim_batch(&self, request: ClaimRequest) -> Result<Vec<OutboxRecord>, OutboxError> {
        let mut map = self.lock("claim_batch")?;

        let mut eligible: Vec<(DateTime<Utc>, EventId)> = map
            .values()
            .filter(|r| r.is_claimable(request.now, request.claim_timeout))
            .map(|r| (r.created_at, r.id))
            .collect();
        eligible.sort();
        eligible.truncate(request.batch_size);

        let mut claimed = Vec::with_capacity(eligible.len());
        for (_, id) in eligible {
            if let Some(record) = map.get_mut(&id) {
                if record.status == OutboxStatus::Processing {
                    tracing::warn!(outbox_id = %id, "reclaiming stale outbox record");
                }
                record.status = OutboxStatus::Processing;
                record.claimed_at = Some(request.now);
                claimed.push(record.clone());
            }
        }
        Ok(claimed)
    }

    async fn mark_done(&self, id: EventId, processed_at: DateTime<Utc>) -> Result<(), OutboxError> {
        self.transition(id, OutboxStatus::Processing, OutboxStatus::Done, |r| {
            r.processed_at = Some(processed_at);
            r.claimed_at = None;
        })
    }

    async fn mark_retry(
        &self,
        id: EventId,
        retry_count: u32,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<(), OutboxError> {
        self.transition(id, OutboxStatus::Processing, OutboxStatus::Pending, |r| {
            r.retry_count = retry_count;
            r.error_message = Some(error.to_string());
            r.next_attempt_at = Some(next_attempt_at);
            r.claimed_at = None;
        })
    }

    async fn mark_dlq(&self, id: EventId, retry_count: u32, error: &str) -> Result<(), OutboxError> {
        self.transition(id, OutboxStatus::Processing, OutboxStatus::Dlq, |r| {
            r.retry_count = retry_count;
            r.error_message = Some(error.to_string());
            r.claimed_at = None;
        })
    }

    async fn get(&self, id: EventId) -> Result<Option<OutboxRecord>, OutboxError> {
        Ok(self.lock("get")?.get(&id).cloned())
    }

    async fn stats(&self) -> Result<OutboxStats, OutboxError> {
        let map = self.lock("stats")?;
        let mut stats = OutboxStats::default();
        for record in map.values() {
            stats.count(record.status);
        }
        Ok(stats)
    }

    async fn list_dlq(&self, limit: usize) -> Result<Vec<OutboxRecord>, OutboxError> {
        let mut dlq: Vec<OutboxRecord> = self
            .snapshot()?
            .into_iter()
            .filter(|r| r.status == OutboxStatus::Dlq)
            .collect();
        dlq.truncate(limit);
        Ok(dlq)
    }

    async fn requeue_dlq(&self, id: EventId) -> Result<(), OutboxError> {
        self.transition(id, OutboxStatus::Dlq, OutboxStatus::Pending, |r| {
            r.retry_count = 0;
            r.next_attempt_at = None;
            r.error_message = None;
        })?;
        tracing::info!(outbox_id = %id, "requeued dead-lettered outbox record");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use eventide_core::{StreamId, TenantId};
    use eventide_events::DomainEvent;

    use super::*;

    fn record(n: u64) -> OutboxRecord {
        let event = DomainEvent::new(
            StreamId::new("acc-1"),
            TenantId::new(),
            n,
            "Deposited",
            serde_json::json!({"amount": n}),
        );
        OutboxRecord::from_event(&event)
    }

    fn claim(batch_size: usize) -> ClaimRequest {
        ClaimRequest {
            batch_size,
            now: Utc::now(),
            claim_timeout: Duration::from_secs(300),
        }
    }

    #[tokio::test]
    async fn claims_oldest_first_and_only_once() {
        let store = InMemoryOutboxStore::new();
        let records: Vec<OutboxRecord> = (1..=3).map(record).collect();
        let ids: Vec<EventId> = records.iter().map(|r| r.id).collect();
        store.enqueue(records).await.unwrap();

        let first = store.claim_batch(claim(2)).await.unwrap();
        assert_eq!(first.iter().map(|r| r.id).collect::<Vec<_>>(), ids[..2]);
        assert!(first.iter().all(|r| r.status == OutboxStatus::Processing));

        let second = store.claim_batch(claim(10)).await.unwrap();
        assert_eq!(second.iter().map(|r| r.id).collect::<Vec<_>>(), ids[2..]);
        assert!(store.claim_batch(claim(10)).await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claims_never_share_a_record() {
        let store = Arc::new(InMemoryOutboxStore::new());
        store.enqueue((1..=50).map(record).collect()).await.unwrap();

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move { store.claim_batch(claim(10)).await.unwrap() }));
        }

        let mut seen = std::collections::HashSet::new();
        for task in tasks {
            for r in task.await.unwrap() {
                assert!(seen.insert(r.id), "record {} claimed twice", r.id);
            }
        }
        assert_eq!(seen.len(), 50);
    }

    #[tokio::test]
    async fn retried_records_wait_for_their_next_attempt() {
        let store = InMemoryOutboxStore::new();
        let r = record(1);
        let id = r.id;
        store.enqueue(vec![r]).await.unwrap();
        store.claim_batch(claim(1)).await.unwrap();

        let later = Utc::now() + chrono::Duration::seconds(30);
        store.mark_retry(id, 1, "broker down", later).await.unwrap();
        assert!(store.claim_batch(claim(1)).await.unwrap().is_empty());

        let at_later = ClaimRequest { now: later, ..claim(1) };
        let reclaimed = store.claim_batch(at_later).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].retry_count, 1);
    }

    #[tokio::test]
    async fn stale_processing_records_are_reclaimed() {
        let store = InMemoryOutboxStore::new();
        store.enqueue(vec![record(1)]).await.unwrap();
        store.claim_batch(claim(1)).await.unwrap();

        let after_timeout = ClaimRequest {
            now: Utc::now() + chrono::Duration::seconds(301),
            ..claim(1)
        };
        assert_eq!(store.claim_batch(after_timeout).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn dlq_records_can_be_requeued() {
        let store = InMemoryOutboxStore::new();
        let r = record(1);
        let id = r.id;
        store.enqueue(vec![r]).await.unwrap();
        store.claim_batch(claim(1)).await.unwrap();
        store.mark_dlq(id, 5, "poison").await.unwrap();

        assert_eq!(store.stats().await.unwrap().dlq, 1);
        assert_eq!(store.list_dlq(10).await.unwrap().len(), 1);

        store.requeue_dlq(id).await.unwrap();
        let requeued = store.get(id).await.unwrap().unwrap();
        assert_eq!(requeued.status, OutboxStatus::Pending);
        assert_eq!(requeued.retry_count, 0);
        assert!(store.requeue_dlq(id).await.is_err());
    }

    #[tokio::test]
    async fn transitions_require_a_claimed_record() {
        let store = InMemoryOutboxStore::new();
        let r = record(1);
        let id = r.id;
        store.enqueue(vec![r]).await.unwrap();

        let err = store.mark_done(id, Utc::now()).await.unwrap_err();
        assert!(matches!(
            err,
            OutboxError::InvalidTransition { from: OutboxStatus::Pending, to: OutboxStatus::Done, .. }
        ));
    }
}
