//! Postgres-backed event store implementation.
//!
//! Enforces optimistic concurrency, tenant isolation and append-only semantics
//! at the database level. Table layout lives in [`super::schema`].
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | EventStoreError | Scenario |
//! |------------|----------------------|-----------------|----------|
//! | Database (unique violation) | `23505` | `ConcurrencyConflict` | Concurrent append won the race on `(stream_id, version)`; `actual` is re-read from `streams` |
//! | Database (unique violation) | `23505` | `InvalidAppend` | Stream head unchanged, so the event id already exists |
//! | Database (check constraint violation) | `23514` | `InvalidAppend` | Invalid data (e.g. version <= 0) |
//! | Database (other) | Any other | `Storage` | Other database errors |
//! | PoolClosed / Io / other | N/A | `Storage` | Connection failures |
//!
//! ## Concurrency
//!
//! Each append locks the stream's row in `streams` (`SELECT ... FOR UPDATE`),
//! so writers of one stream are serialised and the version comparison is
//! exact. The unique index on `(stream_id, version)` is the last line.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::{Span, instrument};
use uuid::Uuid;

use eventide_core::{EventId, StreamId, TenantId, UserId};
use eventide_events::{DomainEvent, Metadata};

use crate::outbox::postgres::insert_outbox_records;
use crate::outbox::OutboxRecord;

use super::r#trait::{EventStore, EventStoreError, Snapshot, TimestampPosition, validate_batch};

const EVENT_COLUMNS: &str = "id, stream_id, version, event_type, event_data, metadata, \
     tenant_id, created_at, created_by, correlation_id, causation_id";

/// Postgres-backed append-only event store.
///
/// ## Transactional Outbox
///
/// With [`PostgresEventStore::with_outbox`] every append also inserts one
/// `outbox_events` row per event inside the same transaction, so an event is
/// never committed without its publication record (or vice versa).
#[derive(Debug, Clone)]
pub struct PostgresEventStore {
    pool: Arc<PgPool>,
    write_outbox: bool,
}

impl PostgresEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
            write_outbox: false,
        }
    }

    pub fn with_outbox(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
            write_outbox: true,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create tables and indexes if missing.
    pub async fn ensure_schema(&self) -> Result<(), EventStoreError> {
        super::schema::ensure_schema(&self.pool).await
    }
}

#[async_trait]
impl EventStore for PostgresEventStore {
    #[instrument(
        skip(self, events),
        fields(
            stream_id = %stream_id,
            event_count = events.len(),
            new_version = tracing::field::Empty
        ),
        err
    )]
    async fn append(
        &self,
        stream_id: &StreamId,
        events: Vec<DomainEvent>,
        expected_version: u64,
    ) -> Result<u64, EventStoreError> {
        let tenant_id = validate_batch(stream_id, &events, expected_version)?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let (actual, owner) = lock_stream(&mut tx, stream_id, tenant_id).await?;

        if actual != expected_version {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(EventStoreError::ConcurrencyConflict {
                stream_id: stream_id.clone(),
                expected: expected_version,
                actual,
            });
        }
        if owner != tenant_id {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(EventStoreError::TenantIsolation(format!(
                "stream {stream_id} belongs to tenant {owner}, append from {tenant_id}"
            )));
        }

        for event in &events {
            let inserted = sqlx::query(
                r#"
                INSERT INTO events (
                    id, stream_id, version, event_type, event_data, metadata,
                    tenant_id, created_at, created_by, correlation_id, causation_id
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                "#,
            )
            .bind(event.id().as_uuid())
            .bind(stream_id.as_str())
            .bind(event.version() as i64)
            .bind(event.event_type())
            .bind(event.payload())
            .bind(JsonValue::Object(event.metadata().clone()))
            .bind(event.tenant_id().as_uuid())
            .bind(event.occurred_at())
            .bind(event.created_by().map(Uuid::from))
            .bind(event.correlation_id())
            .bind(event.causation_id())
            .execute(&mut *tx)
            .await;

            match inserted {
                Ok(_) => {}
                Err(e) if is_unique_violation(&e) => {
                    tx.rollback()
                        .await
                        .map_err(|e| map_sqlx_error("rollback", e))?;
                    let actual = self.get_stream_version(stream_id).await?;
                    return Err(unique_violation_error(stream_id, expected_version, actual, event));
                }
                Err(e) => return Err(map_sqlx_error("insert_event", e)),
            }
        }

        let new_version = expected_version + events.len() as u64;
        sqlx::query("UPDATE streams SET version = $2 WHERE stream_id = $1")
            .bind(stream_id.as_str())
            .bind(new_version as i64)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("update_stream_version", e))?;

        if self.write_outbox {
            let records: Vec<OutboxRecord> = events.iter().map(OutboxRecord::from_event).collect();
            insert_outbox_records(&mut tx, &records)
                .await
                .map_err(|e| EventStoreError::storage("insert_outbox", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Span::current().record("new_version", new_version);
        Ok(new_version)
    }

    async fn get_events(
        &self,
        stream_id: &StreamId,
        from_version: u64,
    ) -> Result<Vec<DomainEvent>, EventStoreError> {
        self.get_events_batch(stream_id, from_version, i64::MAX as usize).await
    }

    #[instrument(skip(self), fields(stream_id = %stream_id, event_count = tracing::field::Empty), err)]
    async fn get_events_batch(
        &self,
        stream_id: &StreamId,
        from_version: u64,
        max_count: usize,
    ) -> Result<Vec<DomainEvent>, EventStoreError> {
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM events \
             WHERE stream_id = $1 AND version >= $2 \
             ORDER BY version ASC LIMIT $3"
        );
        let rows = sqlx::query(&sql)
            .bind(stream_id.as_str())
            .bind(from_version as i64)
            .bind(i64::try_from(max_count).unwrap_or(i64::MAX))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_events_batch", e))?;

        let events = decode_events(rows)?;
        Span::current().record("event_count", events.len());
        Ok(events)
    }

    #[instrument(skip(self), fields(event_count = tracing::field::Empty), err)]
    async fn get_events_from_timestamp(
        &self,
        timestamp: DateTime<Utc>,
    ) -> Result<Vec<DomainEvent>, EventStoreError> {
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM events \
             WHERE created_at >= $1 \
             ORDER BY created_at ASC, stream_id ASC, version ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(timestamp)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_events_from_timestamp", e))?;

        let events = decode_events(rows)?;
        Span::current().record("event_count", events.len());
        Ok(events)
    }

    /// Keyset page over `idx_events_created_at`.
    #[instrument(skip(self, after), fields(event_count = tracing::field::Empty), err)]
    async fn get_events_from_timestamp_batch(
        &self,
        timestamp: DateTime<Utc>,
        after: Option<&TimestampPosition>,
        max_count: usize,
    ) -> Result<Vec<DomainEvent>, EventStoreError> {
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM events \
             WHERE created_at >= $1 \
               AND ($2::timestamptz IS NULL \
                    OR (created_at, stream_id, version) > ($2, $3::text, $4::bigint)) \
             ORDER BY created_at ASC, stream_id ASC, version ASC LIMIT $5"
        );
        let rows = sqlx::query(&sql)
            .bind(timestamp)
            .bind(after.map(|p| p.occurred_at))
            .bind(after.map(|p| p.stream_id.as_str()))
            .bind(after.map(|p| p.version as i64))
            .bind(i64::try_from(max_count).unwrap_or(i64::MAX))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_events_from_timestamp_batch", e))?;

        let events = decode_events(rows)?;
        Span::current().record("event_count", events.len());
        Ok(events)
    }

    #[instrument(skip(self, snapshot), fields(stream_id = %snapshot.stream_id, version = snapshot.version), err)]
    async fn create_snapshot(&self, snapshot: Snapshot) -> Result<(), EventStoreError> {
        let current = self.get_stream_version(&snapshot.stream_id).await?;
        if snapshot.version == 0 || snapshot.version > current {
            return Err(EventStoreError::InvalidSnapshot(format!(
                "snapshot version {} outside 1..={current} for stream {}",
                snapshot.version, snapshot.stream_id
            )));
        }

        sqlx::query(
            r#"
            INSERT INTO snapshots (stream_id, version, snapshot_data, created_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (stream_id)
            DO UPDATE SET
                version = EXCLUDED.version,
                snapshot_data = EXCLUDED.snapshot_data,
                created_at = EXCLUDED.created_at
            "#,
        )
        .bind(snapshot.stream_id.as_str())
        .bind(snapshot.version as i64)
        .bind(&snapshot.snapshot_data)
        .bind(snapshot.created_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("create_snapshot", e))?;

        Ok(())
    }

    #[instrument(skip(self), fields(stream_id = %stream_id, snapshot_found = tracing::field::Empty), err)]
    async fn get_snapshot(&self, stream_id: &StreamId) -> Result<Option<Snapshot>, EventStoreError> {
        let row = sqlx::query(
            r#"
            SELECT stream_id, version, snapshot_data, created_at
            FROM snapshots
            WHERE stream_id = $1
            "#,
        )
        .bind(stream_id.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_snapshot", e))?;

        Span::current().record("snapshot_found", row.is_some());
        row.map(|row| {
            SnapshotRow::from_row(&row)
                .map(Snapshot::from)
                .map_err(|e| EventStoreError::storage("decode_snapshot", e))
        })
        .transpose()
    }

    async fn get_stream_version(&self, stream_id: &StreamId) -> Result<u64, EventStoreError> {
        let version: Option<i64> = sqlx::query_scalar("SELECT version FROM streams WHERE stream_id = $1")
            .bind(stream_id.as_str())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_stream_version", e))?;
        Ok(version.unwrap_or(0) as u64)
    }

    async fn stream_exists(&self, stream_id: &StreamId) -> Result<bool, EventStoreError> {
        sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM streams WHERE stream_id = $1 AND version > 0)")
            .bind(stream_id.as_str())
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("stream_exists", e))
    }

    #[instrument(skip(self), fields(stream_id = %stream_id), err)]
    async fn delete_stream(&self, stream_id: &StreamId) -> Result<(), EventStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let deleted = sqlx::query("DELETE FROM streams WHERE stream_id = $1")
            .bind(stream_id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("delete_stream", e))?
            .rows_affected();
        if deleted == 0 {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(EventStoreError::StreamNotFound(stream_id.clone()));
        }

        for table in ["events", "snapshots"] {
            sqlx::query(&format!("DELETE FROM {table} WHERE stream_id = $1"))
                .bind(stream_id.as_str())
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("delete_stream", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        tracing::info!("deleted stream");
        Ok(())
    }
}

/// Lock the stream's version row, creating it for a new stream.
///
/// Returns `(current_version, owning_tenant)`.
async fn lock_stream(
    tx: &mut Transaction<'_, Postgres>,
    stream_id: &StreamId,
    tenant_id: TenantId,
) -> Result<(u64, TenantId), EventStoreError> {
    sqlx::query(
        r#"
        INSERT INTO streams (stream_id, version, tenant_id)
        VALUES ($1, 0, $2)
        ON CONFLICT (stream_id) DO NOTHING
        "#,
    )
    .bind(stream_id.as_str())
    .bind(tenant_id.as_uuid())
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("create_stream", e))?;

    let row = sqlx::query("SELECT version, tenant_id FROM streams WHERE stream_id = $1 FOR UPDATE")
        .bind(stream_id.as_str())
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("lock_stream", e))?;

    let version: i64 = row
        .try_get("version")
        .map_err(|e| EventStoreError::storage("lock_stream", e))?;
    let owner: Uuid = row
        .try_get("tenant_id")
        .map_err(|e| EventStoreError::storage("lock_stream", e))?;

    Ok((version as u64, TenantId::from_uuid(owner)))
}

fn decode_events(rows: Vec<PgRow>) -> Result<Vec<DomainEvent>, EventStoreError> {
    rows.iter()
        .map(|row| {
            EventRow::from_row(row)
                .map(EventRow::into_event)
                .map_err(|e| EventStoreError::storage("decode_event", e))
        })
        .collect()
}

/// Map SQLx errors to EventStoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> EventStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {operation}: {}", db_err.message());
            match db_err.code().as_deref() {
                // Concurrency conflicts with the real version are produced by the
                // caller; this only catches constraint races elsewhere.
                Some("23505") => EventStoreError::storage(operation, msg),
                Some("23514") => EventStoreError::InvalidAppend(msg),
                _ => EventStoreError::storage(operation, msg),
            }
        }
        sqlx::Error::PoolClosed => EventStoreError::storage(operation, "connection pool closed"),
        other => EventStoreError::storage(operation, other),
    }
}

/// Classify a unique violation on insert using the stream head read after
/// rollback. A moved head is a lost race; an unchanged one means the event id
/// itself collided.
fn unique_violation_error(
    stream_id: &StreamId,
    expected: u64,
    actual: u64,
    event: &DomainEvent,
) -> EventStoreError {
    if actual == expected {
        EventStoreError::InvalidAppend(format!(
            "event {} already exists (stream {stream_id} at version {actual})",
            event.id()
        ))
    } else {
        EventStoreError::ConcurrencyConflict {
            stream_id: stream_id.clone(),
            expected,
            actual,
        }
    }
}

/// Check if an error is a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

// SQLx row types

#[derive(Debug)]
struct EventRow {
    id: Uuid,
    stream_id: String,
    version: i64,
    event_type: String,
    event_data: JsonValue,
    metadata: JsonValue,
    tenant_id: Uuid,
    created_at: DateTime<Utc>,
    created_by: Option<Uuid>,
    correlation_id: Option<Uuid>,
    causation_id: Option<Uuid>,
}

impl<'r> FromRow<'r, PgRow> for EventRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(EventRow {
            id: row.try_get("id")?,
            stream_id: row.try_get("stream_id")?,
            version: row.try_get("version")?,
            event_type: row.try_get("event_type")?,
            event_data: row.try_get("event_data")?,
            metadata: row.try_get("metadata")?,
            tenant_id: row.try_get("tenant_id")?,
            created_at: row.try_get("created_at")?,
            created_by: row.try_get("created_by")?,
            correlation_id: row.try_get("correlation_id")?,
            causation_id: row.try_get("causation_id")?,
        })
    }
}

impl EventRow {
    fn into_event(self) -> DomainEvent {
        let metadata = match self.metadata {
            JsonValue::Object(map) => map,
            _ => Metadata::new(),
        };
        DomainEvent::new(
            StreamId::new(self.stream_id),
            TenantId::from_uuid(self.tenant_id),
            self.version as u64,
            self.event_type,
            self.event_data,
        )
        .with_id(EventId::from_uuid(self.id))
        .with_occurred_at(self.created_at)
        .with_created_by(self.created_by.map(UserId::from_uuid))
        .with_correlation_id(self.correlation_id)
        .with_causation_id(self.causation_id)
        .with_metadata(metadata)
    }
}

#[derive(Debug)]
struct SnapshotRow {
    stream_id: String,
    version: i64,
    snapshot_data: JsonValue,
    created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for SnapshotRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(SnapshotRow {
            stream_id: row.try_get("stream_id")?,
            version: row.try_get("version")?,
            snapshot_data: row.try_get("snapshot_data")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl From<SnapshotRow> for Snapshot {
    fn from(row: SnapshotRow) -> Self {
        Snapshot {
            stream_id: StreamId::new(row.stream_id),
            version: row.version as u64,
            snapshot_data: row.snapshot_data,
            created_at: row.created_at,
        }
    }
}
