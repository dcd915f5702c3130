use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use eventide_core::{DomainError, StreamId};
use eventide_events::DomainEvent;

/// Aggregate snapshot for fast rehydration.
///
/// `snapshot_data` is opaque to the store; it is produced and read by a
/// `SnapshotCodec` (see `crate::snapshot`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub stream_id: StreamId,
    pub version: u64,
    pub snapshot_data: JsonValue,
    pub created_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn new(stream_id: StreamId, version: u64, snapshot_data: JsonValue) -> Self {
        Self {
            stream_id,
            version,
            snapshot_data,
            created_at: Utc::now(),
        }
    }
}

/// Event store operation error.
///
/// ## Error Categories
///
/// - **ConcurrencyConflict**: optimistic concurrency check failed; the caller
///   must reload the aggregate and re-run the business operation
/// - **StreamNotFound**: the stream does not exist
/// - **TenantIsolation**: the append or snapshot would mix tenants in one stream
/// - **InvalidAppend / InvalidSnapshot**: malformed request, nothing was written
/// - **Storage**: the backing store failed
#[derive(Debug, Error)]
pub enum EventStoreError {
    #[error("concurrency conflict on {stream_id}: expected version {expected}, actual {actual}")]
    ConcurrencyConflict {
        stream_id: StreamId,
        expected: u64,
        actual: u64,
    },

    #[error("stream not found: {0}")]
    StreamNotFound(StreamId),

    #[error("tenant isolation violation: {0}")]
    TenantIsolation(String),

    #[error("invalid append: {0}")]
    InvalidAppend(String),

    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),

    #[error("storage error in {operation}: {message}")]
    Storage { operation: String, message: String },
}

impl EventStoreError {
    pub fn storage(operation: impl Into<String>, message: impl ToString) -> Self {
        Self::Storage {
            operation: operation.into(),
            message: message.to_string(),
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. })
    }
}

impl From<EventStoreError> for DomainError {
    fn from(err: EventStoreError) -> Self {
        match err {
            EventStoreError::ConcurrencyConflict { .. } => {
                DomainError::conflict(format!("stale state, reload and retry: {err}"))
            }
            EventStoreError::StreamNotFound(_) => DomainError::not_found(),
            EventStoreError::TenantIsolation(msg) => DomainError::invariant(msg),
            EventStoreError::InvalidAppend(msg) | EventStoreError::InvalidSnapshot(msg) => {
                DomainError::validation(msg)
            }
            EventStoreError::Storage { .. } => {
                DomainError::unavailable(format!("please retry: {err}"))
            }
        }
    }
}

/// Append-only event store.
///
/// Events are organised into **streams**, one per aggregate instance. Within a
/// stream, versions are 1-based, strictly increasing and gap-free.
///
/// ## Append Semantics
///
/// `append()`:
/// - compares `expected_version` to the actual stream version (0 when absent)
///   and fails with `ConcurrencyConflict` on mismatch
/// - requires every event to target `stream_id`, carry version
///   `expected_version + i + 1` and share the stream's tenant
/// - persists the batch atomically (all or nothing), together with one outbox
///   row per event when the implementation has an outbox attached
///
/// Absent values are always `None`, never an error, except for
/// `delete_stream`, which reports `StreamNotFound`.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append `events` and return the new stream version.
    async fn append(
        &self,
        stream_id: &StreamId,
        events: Vec<DomainEvent>,
        expected_version: u64,
    ) -> Result<u64, EventStoreError>;

    /// Events with `version >= from_version`, ascending.
    async fn get_events(
        &self,
        stream_id: &StreamId,
        from_version: u64,
    ) -> Result<Vec<DomainEvent>, EventStoreError>;

    /// Page of at most `max_count` events with `version >= from_version`, ascending.
    async fn get_events_batch(
        &self,
        stream_id: &StreamId,
        from_version: u64,
        max_count: usize,
    ) -> Result<Vec<DomainEvent>, EventStoreError>;

    /// Events from every stream with `occurred_at >= timestamp`, ordered by
    /// occurrence time (ties broken by stream id, then version).
    async fn get_events_from_timestamp(
        &self,
        timestamp: DateTime<Utc>,
    ) -> Result<Vec<DomainEvent>, EventStoreError>;

    /// Page of `get_events_from_timestamp`: at most `max_count` events ordered
    /// after `after` (exclusive), or from the start when `after` is `None`.
    async fn get_events_from_timestamp_batch(
        &self,
        timestamp: DateTime<Utc>,
        after: Option<&TimestampPosition>,
        max_count: usize,
    ) -> Result<Vec<DomainEvent>, EventStoreError>;

    /// Store (or replace) the stream's snapshot.
    async fn create_snapshot(&self, snapshot: Snapshot) -> Result<(), EventStoreError>;

    async fn get_snapshot(&self, stream_id: &StreamId) -> Result<Option<Snapshot>, EventStoreError>;

    /// Current version of the stream; 0 when it does not exist.
    async fn get_stream_version(&self, stream_id: &StreamId) -> Result<u64, EventStoreError>;

    async fn stream_exists(&self, stream_id: &StreamId) -> Result<bool, EventStoreError>;

    /// Remove events, snapshot and version record of a stream (ops/test utility).
    async fn delete_stream(&self, stream_id: &StreamId) -> Result<(), EventStoreError>;
}

#[async_trait]
impl<S> EventStore for Arc<S>
where
    S: EventStore + ?Sized,
{
    async fn append(
        &self,
        stream_id: &StreamId,
        events: Vec<DomainEvent>,
        expected_version: u64,
    ) -> Result<u64, EventStoreError> {
        (**self).append(stream_id, events, expected_version).await
    }

    async fn get_events(
        &self,
        stream_id: &StreamId,
        from_version: u64,
    ) -> Result<Vec<DomainEvent>, EventStoreError> {
        (**self).get_events(stream_id, from_version).await
    }

    async fn get_events_batch(
        &self,
        stream_id: &StreamId,
        from_version: u64,
        max_count: usize,
    ) -> Result<Vec<DomainEvent>, EventStoreError> {
        (**self).get_events_batch(stream_id, from_version, max_count).await
    }

    async fn get_events_from_timestamp(
        &self,
        timestamp: DateTime<Utc>,
    ) -> Result<Vec<DomainEvent>, EventStoreError> {
        (**self).get_events_from_timestamp(timestamp).await
    }

    async fn get_events_from_timestamp_batch(
        &self,
        timestamp: DateTime<Utc>,
        after: Option<&TimestampPosition>,
        max_count: usize,
    ) -> Result<Vec<DomainEvent>, EventStoreError> {
        (**self)
            .get_events_from_timestamp_batch(timestamp, after, max_count)
            .await
    }

    async fn create_snapshot(&self, snapshot: Snapshot) -> Result<(), EventStoreError> {
        (**self).create_snapshot(snapshot).await
    }

    async fn get_snapshot(&self, stream_id: &StreamId) -> Result<Option<Snapshot>, EventStoreError> {
        (**self).get_snapshot(stream_id).await
    }

    async fn get_stream_version(&self, stream_id: &StreamId) -> Result<u64, EventStoreError> {
        (**self).get_stream_version(stream_id).await
    }

    async fn stream_exists(&self, stream_id: &StreamId) -> Result<bool, EventStoreError> {
        (**self).stream_exists(stream_id).await
    }

    async fn delete_stream(&self, stream_id: &StreamId) -> Result<(), EventStoreError> {
        (**self).delete_stream(stream_id).await
    }
}

/// Append validation shared by the store implementations.
///
/// Returns the tenant of the batch. Does not check the expected version.
pub(crate) fn validate_batch(
    stream_id: &StreamId,
    events: &[DomainEvent],
    expected_version: u64,
) -> Result<eventide_core::TenantId, EventStoreError> {
    let Some(first) = events.first() else {
        return Err(EventStoreError::InvalidAppend(format!(
            "empty batch for stream {stream_id}"
        )));
    };
    let tenant_id = first.tenant_id();

    for (idx, event) in events.iter().enumerate() {
        if event.aggregate_id() != stream_id {
            return Err(EventStoreError::InvalidAppend(format!(
                "event {} (index {idx}) targets stream {}, not {stream_id}",
                event.id(),
                event.aggregate_id()
            )));
        }
        if event.tenant_id() != tenant_id {
            return Err(EventStoreError::TenantIsolation(format!(
                "batch for {stream_id} contains multiple tenant_ids (index {idx})"
            )));
        }
        let expected = expected_version + idx as u64 + 1;
        if event.version() != expected {
            return Err(EventStoreError::InvalidAppend(format!(
                "event {} (index {idx}) has version {}, expected {expected}",
                event.id(),
                event.version()
            )));
        }
    }

    Ok(tenant_id)
}

/// Tie-broken ordering used by `get_events_from_timestamp`.
pub(crate) fn timestamp_order(a: &DomainEvent, b: &DomainEvent) -> std::cmp::Ordering {
    TimestampPosition::of(a).cmp(&TimestampPosition::of(b))
}

/// Key of an event in timestamp order; the resume point between pages of
/// [`EventStore::get_events_from_timestamp_batch`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimestampPosition {
    pub occurred_at: DateTime<Utc>,
    pub stream_id: StreamId,
    pub version: u64,
}

impl TimestampPosition {
    pub fn of(event: &DomainEvent) -> Self {
        Self {
            occurred_at: event.occurred_at(),
            stream_id: event.aggregate_id().clone(),
            version: event.version(),
        }
    }
}
