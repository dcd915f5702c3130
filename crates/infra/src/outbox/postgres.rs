//! Postgres outbox (`outbox_events` table, see `event_store::schema`).
//!
//! Claims use a CTE with `FOR UPDATE SKIP LOCKED`, so any number of relay
//! processes can poll the same table without handing out a row twice.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::{Span, instrument};
use uuid::Uuid;

use eventide_core::{EventId, StreamId, TenantId};
use eventide_events::Metadata;

use super::store::OutboxStore;
use super::types::{ClaimRequest, OutboxError, OutboxRecord, OutboxStats, OutboxStatus};

const RECORD_COLUMNS: &str = "id, aggregate_id, event_type, event_data, metadata, tenant_id, \
     created_at, processed_at, retry_count, status, error_message, correlation_id, \
     causation_id, next_attempt_at, claimed_at";

#[derive(Debug, Clone)]
pub struct PostgresOutboxStore {
    pool: Arc<PgPool>,
}

impl PostgresOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Arc::new(pool) }
    }

    /// Resolve why a `processing`-guarded update touched no row.
    async fn transition_error(&self, id: EventId, to: OutboxStatus) -> OutboxError {
        let status: Result<Option<String>, _> =
            sqlx::query_scalar("SELECT status FROM outbox_events WHERE id = $1")
                .bind(id.as_uuid())
                .fetch_optional(&*self.pool)
                .await;

        match status {
            Ok(None) => OutboxError::NotFound(id),
            Ok(Some(raw)) => match OutboxStatus::parse(&raw) {
                Some(from) => OutboxError::InvalidTransition { id, from, to },
                None => OutboxError::MalformedRecord {
                    id,
                    message: format!("unknown status {raw:?}"),
                },
            },
            Err(e) => OutboxError::storage("transition", e),
        }
    }

    async fn expect_one(
        &self,
        rows_affected: u64,
        id: EventId,
        to: OutboxStatus,
    ) -> Result<(), OutboxError> {
        if rows_affected == 0 {
            return Err(self.transition_error(id, to).await);
        }
        Ok(())
    }
}

/// Insert pending records inside the caller's transaction.
///
/// Used by `PostgresEventStore::append` so events and their outbox rows
/// commit together.
pub(crate) async fn insert_outbox_records(
    tx: &mut Transaction<'_, Postgres>,
    records: &[OutboxRecord],
) -> Result<(), sqlx::Error> {
    for record in records {
        insert_record(&mut **tx, record).await?;
    }
    Ok(())
}

async fn insert_record<'e, E>(executor: E, record: &OutboxRecord) -> Result<(), sqlx::Error>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    sqlx::query(
        r#"
        INSERT INTO outbox_events (
            id, aggregate_id, event_type, event_data, metadata, tenant_id,
            created_at, retry_count, status, correlation_id, causation_id
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        ON CONFLICT (id) DO NOTHING
        "#,
    )
    .bind(record.id.as_uuid())
    .bind(record.aggregate_id.as_str())
    .bind(&record.event_type)
    .bind(&record.event_data)
    .bind(JsonValue::Object(record.metadata.clone()))
    .bind(record.tenant_id.as_uuid())
    .bind(record.created_at)
    .bind(record.retry_count as i32)
    .bind(record.status.as_str())
    .bind(record.correlation_id)
    .bind(record.causation_id)
    .execute(executor)
    .await?;
    Ok(())
}

#[async_trait]
impl OutboxStore for PostgresOutboxStore {
    async fn enqueue(&self, records: Vec<OutboxRecord>) -> Result<(), OutboxError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| OutboxError::storage("begin_transaction", e))?;
        insert_outbox_records(&mut tx, &records)
            .await
            .map_err(|e| OutboxError::storage("enqueue", e))?;
        tx.commit()
            .await
            .map_err(|e| OutboxError::storage("commit_transaction", e))
    }

    #[instrument(skip(self, request), fields(batch_size = request.batch_size, claimed = tracing::field::Empty), err)]
    async fn claim_batch(&self, request: ClaimRequest) -> Result<Vec<OutboxRecord>, OutboxError> {
        let stale_before = chrono::Duration::from_std(request.claim_timeout)
            .ok()
            .and_then(|timeout| request.now.checked_sub_signed(timeout))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let sql = r#"
            WITH claimable AS (
                SELECT id
                FROM outbox_events
                WHERE (status = 'pending' AND (next_attempt_at IS NULL OR next_attempt_at <= $1))
                   OR (status = 'processing' AND (claimed_at IS NULL OR claimed_at < $2))
                ORDER BY created_at ASC, id ASC
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            UPDATE outbox_events o
            SET status = 'processing',
                claimed_at = $1
            FROM claimable c
            WHERE o.id = c.id
            RETURNING o.id, o.aggregate_id, o.event_type, o.event_data, o.metadata,
                      o.tenant_id, o.created_at, o.processed_at, o.retry_count, o.status,
                      o.error_message, o.correlation_id, o.causation_id,
                      o.next_attempt_at, o.claimed_at
            "#;

        let rows = sqlx::query(sql)
            .bind(request.now)
            .bind(stale_before)
            .bind(i64::try_from(request.batch_size).unwrap_or(i64::MAX))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| OutboxError::storage("claim_batch", e))?;

        // RETURNING does not preserve the CTE's order.
        let mut records = decode_records(rows)?;
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

        Span::current().record("claimed", records.len());
        Ok(records)
    }

    async fn mark_done(&self, id: EventId, processed_at: DateTime<Utc>) -> Result<(), OutboxError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = 'done', processed_at = $2, claimed_at = NULL
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id.as_uuid())
        .bind(processed_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| OutboxError::storage("mark_done", e))?;

        self.expect_one(result.rows_affected(), id, OutboxStatus::Done).await
    }

    async fn mark_retry(
        &self,
        id: EventId,
        retry_count: u32,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<(), OutboxError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = 'pending',
                retry_count = $2,
                error_message = $3,
                next_attempt_at = $4,
                claimed_at = NULL
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id.as_uuid())
        .bind(retry_count as i32)
        .bind(error)
        .bind(next_attempt_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| OutboxError::storage("mark_retry", e))?;

        self.expect_one(result.rows_affected(), id, OutboxStatus::Pending).await
    }

    async fn mark_dlq(&self, id: EventId, retry_count: u32, error: &str) -> Result<(), OutboxError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = 'dlq',
                retry_count = $2,
                error_message = $3,
                claimed_at = NULL
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id.as_uuid())
        .bind(retry_count as i32)
        .bind(error)
        .execute(&*self.pool)
        .await
        .map_err(|e| OutboxError::storage("mark_dlq", e))?;

        self.expect_one(result.rows_affected(), id, OutboxStatus::Dlq).await
    }

    async fn get(&self, id: EventId) -> Result<Option<OutboxRecord>, OutboxError> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM outbox_events WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| OutboxError::storage("get", e))?;

        row.map(|row| OutboxRow::from_row(&row).map_err(|e| OutboxError::storage("decode_record", e)))
            .transpose()?
            .map(OutboxRow::into_record)
            .transpose()
    }

    async fn stats(&self) -> Result<OutboxStats, OutboxError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS count FROM outbox_events GROUP BY status")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| OutboxError::storage("stats", e))?;

        let mut stats = OutboxStats::default();
        for row in rows {
            let status: String = row
                .try_get("status")
                .map_err(|e| OutboxError::storage("stats", e))?;
            let count: i64 = row
                .try_get("count")
                .map_err(|e| OutboxError::storage("stats", e))?;
            let count = count.max(0) as u64;
            match OutboxStatus::parse(&status) {
                Some(OutboxStatus::Pending) => stats.pending = count,
                Some(OutboxStatus::Processing) => stats.processing = count,
                Some(OutboxStatus::Done) => stats.done = count,
                Some(OutboxStatus::Dlq) => stats.dlq = count,
                None => tracing::warn!(status = %status, count, "ignoring unknown outbox status"),
            }
        }
        Ok(stats)
    }

    async fn list_dlq(&self, limit: usize) -> Result<Vec<OutboxRecord>, OutboxError> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM outbox_events \
             WHERE status = 'dlq' ORDER BY created_at ASC, id ASC LIMIT $1"
        );
        let rows = sqlx::query(&sql)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| OutboxError::storage("list_dlq", e))?;
        decode_records(rows)
    }

    #[instrument(skip(self), fields(outbox_id = %id), err)]
    async fn requeue_dlq(&self, id: EventId) -> Result<(), OutboxError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = 'pending',
                retry_count = 0,
                error_message = NULL,
                next_attempt_at = NULL
            WHERE id = $1 AND status = 'dlq'
            "#,
        )
        .bind(id.as_uuid())
        .execute(&*self.pool)
        .await
        .map_err(|e| OutboxError::storage("requeue_dlq", e))?;

        self.expect_one(result.rows_affected(), id, OutboxStatus::Pending).await?;
        tracing::info!("requeued dead-lettered outbox record");
        Ok(())
    }
}

fn decode_records(rows: Vec<PgRow>) -> Result<Vec<OutboxRecord>, OutboxError> {
    rows.iter()
        .map(|row| {
            OutboxRow::from_row(row)
                .map_err(|e| OutboxError::storage("decode_record", e))
                .and_then(OutboxRow::into_record)
        })
        .collect()
}

#[derive(Debug)]
struct OutboxRow {
    id: Uuid,
    aggregate_id: String,
    event_type: String,
    event_data: JsonValue,
    metadata: JsonValue,
    tenant_id: Uuid,
    created_at: DateTime<Utc>,
    processed_at: Option<DateTime<Utc>>,
    retry_count: i32,
    status: String,
    error_message: Option<String>,
    correlation_id: Option<Uuid>,
    causation_id: Option<Uuid>,
    next_attempt_at: Option<DateTime<Utc>>,
    claimed_at: Option<DateTime<Utc>>,
}

impl<'r> FromRow<'r, PgRow> for OutboxRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(OutboxRow {
            id: row.try_get("id")?,
            aggregate_id: row.try_get("aggregate_id")?,
            event_type: row.try_get("event_type")?,
            event_data: row.try_get("event_data")?,
            metadata: row.try_get("metadata")?,
            tenant_id: row.try_get("tenant_id")?,
            created_at: row.try_get("created_at")?,
            processed_at: row.try_get("processed_at")?,
            retry_count: row.try_get("retry_count")?,
            status: row.try_get("status")?,
            error_message: row.try_get("error_message")?,
            correlation_id: row.try_get("correlation_id")?,
            causation_id: row.try_get("causation_id")?,
            next_attempt_at: row.try_get("next_attempt_at")?,
            claimed_at: row.try_get("claimed_at")?,
        })
    }
}

impl OutboxRow {
    fn into_record(self) -> Result<OutboxRecord, OutboxError> {
        let id = EventId::from_uuid(self.id);
        let status = OutboxStatus::parse(&self.status).ok_or_else(|| OutboxError::MalformedRecord {
            id,
            message: format!("unknown status {:?}", self.status),
        })?;
        let metadata = match self.metadata {
            JsonValue::Object(map) => map,
            _ => Metadata::new(),
        };

        Ok(OutboxRecord {
            id,
            aggregate_id: StreamId::new(self.aggregate_id),
            event_type: self.event_type,
            event_data: self.event_data,
            metadata,
            tenant_id: TenantId::from_uuid(self.tenant_id),
            created_at: self.created_at,
            processed_at: self.processed_at,
            retry_count: self.retry_count.max(0) as u32,
            status,
            error_message: self.error_message,
            correlation_id: self.correlation_id,
            causation_id: self.causation_id,
            next_attempt_at: self.next_attempt_at,
            claimed_at: self.claimed_at,
        })
    }
}
