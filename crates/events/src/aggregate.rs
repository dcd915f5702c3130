//! Aggregate root: identity, version tracking and the uncommitted-event buffer.

use thiserror::Error;
use uuid::Uuid;

use eventide_core::{Aggregate, StreamId, TenantId, UserId};

use crate::event::{DomainEvent, Event, EventCodecError, encode_payload};

/// Failure while mutating or rehydrating an aggregate root.
#[derive(Debug, Error)]
pub enum AggregateError {
    #[error(transparent)]
    Codec(#[from] EventCodecError),

    #[error("event for stream {found} applied to aggregate {expected}")]
    StreamMismatch { expected: StreamId, found: StreamId },

    #[error("event from tenant {found} applied to aggregate owned by tenant {expected}")]
    TenantMismatch { expected: TenantId, found: TenantId },

    #[error("version gap on {stream_id}: expected {expected}, found {found}")]
    VersionGap {
        stream_id: StreamId,
        expected: u64,
        found: u64,
    },

    #[error("cannot replay committed events while {pending} events are uncommitted")]
    UncommittedEvents { pending: usize },
}

/// Causal context stamped onto every event the root records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventContext {
    pub correlation_id: Option<Uuid>,
    pub causation_id: Option<Uuid>,
    pub created_by: Option<UserId>,
}

/// In-memory projection of one stream.
///
/// Lifecycle:
/// 1. constructed empty ([`AggregateRoot::new`]) or from a snapshot
/// 2. rehydrated with [`AggregateRoot::load_from_history`]
/// 3. mutated only through [`AggregateRoot::add_event`], which records the event
///    in the uncommitted buffer **and** applies it to the state
/// 4. [`AggregateRoot::mark_committed`] after the store accepted the buffer
#[derive(Debug, Clone)]
pub struct AggregateRoot<A: Aggregate> {
    id: StreamId,
    tenant_id: TenantId,
    version: u64,
    state: A,
    uncommitted: Vec<DomainEvent>,
    context: EventContext,
}

impl<A> AggregateRoot<A>
where
    A: Aggregate,
    A::Event: Event,
{
    pub fn new(id: StreamId, tenant_id: TenantId) -> Self {
        Self::from_snapshot(id, tenant_id, 0, A::default())
    }

    /// Restore a root from previously snapshotted state at `version`.
    pub fn from_snapshot(id: StreamId, tenant_id: TenantId, version: u64, state: A) -> Self {
        Self {
            id,
            tenant_id,
            version,
            state,
            uncommitted: Vec::new(),
            context: EventContext::default(),
        }
    }

    pub fn id(&self) -> &StreamId {
        &self.id
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    /// Version including uncommitted events.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Stream version the store must be at for the buffer to append cleanly.
    pub fn expected_version(&self) -> u64 {
        self.version - self.uncommitted.len() as u64
    }

    pub fn state(&self) -> &A {
        &self.state
    }

    pub fn set_context(&mut self, context: EventContext) {
        self.context = context;
    }

    pub fn uncommitted_events(&self) -> &[DomainEvent] {
        &self.uncommitted
    }

    pub fn has_uncommitted_events(&self) -> bool {
        !self.uncommitted.is_empty()
    }

    /// Clear the buffer after a successful append.
    pub fn mark_committed(&mut self) {
        self.uncommitted.clear();
    }

    /// Record a new event and apply it to the state.
    pub fn add_event(&mut self, event: A::Event) -> Result<&DomainEvent, AggregateError> {
        let payload = encode_payload(&event)?;
        let version = self.version + 1;

        let recorded = DomainEvent::new(
            self.id.clone(),
            self.tenant_id,
            version,
            event.event_type(),
            payload,
        )
        .with_correlation_id(self.context.correlation_id)
        .with_causation_id(self.context.causation_id)
        .with_created_by(self.context.created_by)
        .with_schema_version(event.schema_version());

        self.state.apply(&event);
        self.version = version;
        self.uncommitted.push(recorded);

        Ok(&self.uncommitted[self.uncommitted.len() - 1])
    }

    /// Apply an already-committed event (replay path).
    pub fn apply_committed(&mut self, event: &DomainEvent) -> Result<(), AggregateError> {
        if !self.uncommitted.is_empty() {
            return Err(AggregateError::UncommittedEvents {
                pending: self.uncommitted.len(),
            });
        }
        if event.aggregate_id() != &self.id {
            return Err(AggregateError::StreamMismatch {
                expected: self.id.clone(),
                found: event.aggregate_id().clone(),
            });
        }
        if event.tenant_id() != self.tenant_id {
            return Err(AggregateError::TenantMismatch {
                expected: self.tenant_id,
                found: event.tenant_id(),
            });
        }
        let expected = self.version + 1;
        if event.version() != expected {
            return Err(AggregateError::VersionGap {
                stream_id: self.id.clone(),
                expected,
                found: event.version(),
            });
        }

        let typed: A::Event = event.decode()?;
        self.state.apply(&typed);
        self.version = expected;
        Ok(())
    }

    pub fn load_from_history<'a>(
        &mut self,
        events: impl IntoIterator<Item = &'a DomainEvent>,
    ) -> Result<(), AggregateError> {
        for event in events {
            self.apply_committed(event)?;
        }
        Ok(())
    }
}
