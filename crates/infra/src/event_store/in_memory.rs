use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use eventide_core::{StreamId, TenantId};
use eventide_events::DomainEvent;

use crate::outbox::{InMemoryOutboxStore, OutboxRecord};

use super::r#trait::{
    EventStore, EventStoreError, Snapshot, TimestampPosition, timestamp_order, validate_batch,
};

#[derive(Debug)]
struct Stream {
    tenant_id: TenantId,
    events: Vec<DomainEvent>,
}

impl Stream {
    fn version(&self) -> u64 {
        self.events.len() as u64
    }
}

#[derive(Debug, Default)]
struct State {
    streams: HashMap<StreamId, Stream>,
    snapshots: HashMap<StreamId, Snapshot>,
}

/// In-memory append-only event store.
///
/// Intended for tests/dev. Not optimized for performance. Obeys the same
/// contract as the Postgres store, including all-or-nothing appends and the
/// transactional outbox write.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    state: RwLock<State>,
    outbox: Option<Arc<InMemoryOutboxStore>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write one outbox record per appended event into `outbox`.
    pub fn with_outbox(outbox: Arc<InMemoryOutboxStore>) -> Self {
        Self {
            state: RwLock::default(),
            outbox: Some(outbox),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>, EventStoreError> {
        self.state
            .read()
            .map_err(|_| EventStoreError::storage("read", "lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>, EventStoreError> {
        self.state
            .write()
            .map_err(|_| EventStoreError::storage("write", "lock poisoned"))
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(
        &self,
        stream_id: &StreamId,
        events: Vec<DomainEvent>,
        expected_version: u64,
    ) -> Result<u64, EventStoreError> {
        let tenant_id = validate_batch(stream_id, &events, expected_version)?;

        let mut state = self.write()?;

        let (actual, stream_tenant) = state
            .streams
            .get(stream_id)
            .map(|s| (s.version(), Some(s.tenant_id)))
            .unwrap_or((0, None));

        if actual != expected_version {
            return Err(EventStoreError::ConcurrencyConflict {
                stream_id: stream_id.clone(),
                expected: expected_version,
                actual,
            });
        }
        if let Some(owner) = stream_tenant.filter(|owner| *owner != tenant_id) {
            return Err(EventStoreError::TenantIsolation(format!(
                "stream {stream_id} belongs to tenant {owner}, append from {tenant_id}"
            )));
        }

        // Every check has passed; from here on nothing can fail halfway.
        if let Some(outbox) = &self.outbox {
            outbox
                .insert_pending(events.iter().map(OutboxRecord::from_event).collect())
                .map_err(|e| EventStoreError::storage("outbox_insert", e))?;
        }

        let stream = state.streams.entry(stream_id.clone()).or_insert_with(|| Stream {
            tenant_id,
            events: Vec::new(),
        });
        stream.events.extend(events);
        let version = stream.version();

        tracing::debug!(stream_id = %stream_id, version, "appended events");
        Ok(version)
    }

    async fn get_events(
        &self,
        stream_id: &StreamId,
        from_version: u64,
    ) -> Result<Vec<DomainEvent>, EventStoreError> {
        self.get_events_batch(stream_id, from_version, usize::MAX).await
    }

    async fn get_events_batch(
        &self,
        stream_id: &StreamId,
        from_version: u64,
        max_count: usize,
    ) -> Result<Vec<DomainEvent>, EventStoreError> {
        let state = self.read()?;
        let Some(stream) = state.streams.get(stream_id) else {
            return Ok(Vec::new());
        };

        // Versions are 1-based and gap-free, so version v sits at index v - 1.
        let start = from_version.saturating_sub(1) as usize;
        Ok(stream
            .events
            .iter()
            .skip(start)
            .take(max_count)
            .cloned()
            .collect())
    }

    async fn get_events_from_timestamp(
        &self,
        timestamp: DateTime<Utc>,
    ) -> Result<Vec<DomainEvent>, EventStoreError> {
        let state = self.read()?;
        let mut events: Vec<DomainEvent> = state
            .streams
            .values()
            .flat_map(|s| s.events.iter())
            .filter(|e| e.occurred_at() >= timestamp)
            .cloned()
            .collect();
        events.sort_by(timestamp_order);
        Ok(events)
    }

    async fn get_events_from_timestamp_batch(
        &self,
        timestamp: DateTime<Utc>,
        after: Option<&TimestampPosition>,
        max_count: usize,
    ) -> Result<Vec<DomainEvent>, EventStoreError> {
        let state = self.read()?;
        let mut events: Vec<&DomainEvent> = state
            .streams
            .values()
            .flat_map(|s| s.events.iter())
            .filter(|e| e.occurred_at() >= timestamp)
            .filter(|e| after.is_none_or(|after| TimestampPosition::of(e) > *after))
            .collect();
        events.sort_by(|a, b| timestamp_order(a, b));
        Ok(events.into_iter().take(max_count).cloned().collect())
    }

    async fn create_snapshot(&self, snapshot: Snapshot) -> Result<(), EventStoreError> {
        let mut state = self.write()?;
        let current = state
            .streams
            .get(&snapshot.stream_id)
            .map(Stream::version)
            .unwrap_or(0);

        if snapshot.version == 0 || snapshot.version > current {
            return Err(EventStoreError::InvalidSnapshot(format!(
                "snapshot version {} outside 1..={current} for stream {}",
                snapshot.version, snapshot.stream_id
            )));
        }

        state.snapshots.insert(snapshot.stream_id.clone(), snapshot);
        Ok(())
    }

    async fn get_snapshot(&self, stream_id: &StreamId) -> Result<Option<Snapshot>, EventStoreError> {
        Ok(self.read()?.snapshots.get(stream_id).cloned())
    }

    async fn get_stream_version(&self, stream_id: &StreamId) -> Result<u64, EventStoreError> {
        Ok(self
            .read()?
            .streams
            .get(stream_id)
            .map(Stream::version)
            .unwrap_or(0))
    }

    async fn stream_exists(&self, stream_id: &StreamId) -> Result<bool, EventStoreError> {
        Ok(self.read()?.streams.contains_key(stream_id))
    }

    async fn delete_stream(&self, stream_id: &StreamId) -> Result<(), EventStoreError> {
        let mut state = self.write()?;
        if state.streams.remove(stream_id).is_none() {
            return Err(EventStoreError::StreamNotFound(stream_id.clone()));
        }
        state.snapshots.remove(stream_id);
        tracing::info!(stream_id = %stream_id, "deleted stream");
        Ok(())
    }
}
