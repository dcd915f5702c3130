//! Stored event envelope and the typed-event codec.
//!
//! [`DomainEvent`] is the untyped record the store, outbox and broker move
//! around: stream id, tenant, version, event type and a JSON payload plus
//! metadata. Aggregates work with typed [`Event`] enums, and
//! [`encode_payload`] / [`decode_payload`] convert between the two by
//! splitting the serde variant tag into the event type. The payload's schema
//! version lives in metadata under [`SCHEMA_VERSION_KEY`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use uuid::Uuid;

use eventide_core::{EventId, StreamId, TenantId, UserId};

/// Metadata key carrying the payload schema version.
pub const SCHEMA_VERSION_KEY: &str = "schemaVersion";

/// Free-form event metadata (always a JSON object).
pub type Metadata = Map<String, JsonValue>;

/// A typed business event.
///
/// Events are:
/// - **immutable** (treat them as facts)
/// - **versioned** (schema evolution, see `SCHEMA_VERSION_KEY`)
/// - designed to be **append-only**
///
/// Implementors are expected to be serde enums with the default (externally
/// tagged) representation; the variant name becomes the event type and the
/// variant body becomes the stored payload. See [`encode_payload`].
pub trait Event: Serialize + DeserializeOwned + Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable event name/type identifier (e.g. "AccountCreated").
    fn event_type(&self) -> &'static str;

    /// Schema version the current code writes for this event.
    fn schema_version(&self) -> u32 {
        1
    }
}

/// Failure converting between typed events and stored payloads.
#[derive(Debug, Error)]
pub enum EventCodecError {
    #[error("payload serialization failed for {event_type}: {message}")]
    Encode { event_type: String, message: String },

    #[error("payload deserialization failed for {event_type}: {message}")]
    Decode { event_type: String, message: String },
}

/// Serialize a typed event into its stored payload.
///
/// `{"AccountCreated": {"name": "Cash"}}` is stored as `{"name": "Cash"}` with
/// event type `AccountCreated`. Unit variants are stored as `null`.
pub fn encode_payload<E: Event>(event: &E) -> Result<JsonValue, EventCodecError> {
    let event_type = event.event_type();
    let encoded = serde_json::to_value(event).map_err(|e| EventCodecError::Encode {
        event_type: event_type.to_string(),
        message: e.to_string(),
    })?;

    match encoded {
        JsonValue::Object(mut map) if map.len() == 1 => {
            map.remove(event_type).ok_or_else(|| EventCodecError::Encode {
                event_type: event_type.to_string(),
                message: "serialized variant name does not match event_type()".to_string(),
            })
        }
        JsonValue::String(variant) if variant == event_type => Ok(JsonValue::Null),
        _ => Err(EventCodecError::Encode {
            event_type: event_type.to_string(),
            message: "event must serialize as an externally tagged enum variant".to_string(),
        }),
    }
}

/// Deserialize a stored payload back into a typed event.
pub fn decode_payload<E: Event>(event_type: &str, payload: &JsonValue) -> Result<E, EventCodecError> {
    let tagged = match payload {
        JsonValue::Null => JsonValue::String(event_type.to_string()),
        other => {
            let mut map = Map::with_capacity(1);
            map.insert(event_type.to_string(), other.clone());
            JsonValue::Object(map)
        }
    };

    serde_json::from_value(tagged).map_err(|e| EventCodecError::Decode {
        event_type: event_type.to_string(),
        message: e.to_string(),
    })
}

/// An event as recorded in a stream.
///
/// `DomainEvent` is an immutable value: it identifies its aggregate by
/// `aggregate_id` and never holds a reference to a live aggregate instance.
/// The `with_*` builders consume and return a new value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    id: EventId,
    aggregate_id: StreamId,
    event_type: String,

    /// 1-based, gap-free position within the aggregate stream.
    version: u64,

    tenant_id: TenantId,
    occurred_at: DateTime<Utc>,
    correlation_id: Option<Uuid>,
    causation_id: Option<Uuid>,
    created_by: Option<UserId>,

    payload: JsonValue,
    metadata: Metadata,
}

impl DomainEvent {
    pub fn new(
        aggregate_id: StreamId,
        tenant_id: TenantId,
        version: u64,
        event_type: impl Into<String>,
        payload: JsonValue,
    ) -> Self {
        Self {
            id: EventId::new(),
            aggregate_id,
            event_type: event_type.into(),
            version,
            tenant_id,
            occurred_at: Utc::now(),
            correlation_id: None,
            causation_id: None,
            created_by: None,
            payload,
            metadata: Metadata::new(),
        }
    }

    pub fn with_id(mut self, id: EventId) -> Self {
        self.id = id;
        self
    }

    pub fn with_occurred_at(mut self, occurred_at: DateTime<Utc>) -> Self {
        self.occurred_at = occurred_at;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: Option<Uuid>) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    pub fn with_causation_id(mut self, causation_id: Option<Uuid>) -> Self {
        self.causation_id = causation_id;
        self
    }

    pub fn with_created_by(mut self, created_by: Option<UserId>) -> Self {
        self.created_by = created_by;
        self
    }

    pub fn with_payload(mut self, payload: JsonValue) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_schema_version(mut self, schema_version: u32) -> Self {
        self.metadata
            .insert(SCHEMA_VERSION_KEY.to_string(), JsonValue::from(schema_version));
        self
    }

    pub fn id(&self) -> EventId {
        self.id
    }

    pub fn aggregate_id(&self) -> &StreamId {
        &self.aggregate_id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn correlation_id(&self) -> Option<Uuid> {
        self.correlation_id
    }

    pub fn causation_id(&self) -> Option<Uuid> {
        self.causation_id
    }

    pub fn created_by(&self) -> Option<UserId> {
        self.created_by
    }

    pub fn payload(&self) -> &JsonValue {
        &self.payload
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Payload schema version recorded in metadata (1 when absent).
    pub fn schema_version(&self) -> u32 {
        self.metadata
            .get(SCHEMA_VERSION_KEY)
            .and_then(JsonValue::as_u64)
            .and_then(|v| u32::try_from(v).ok())
            .unwrap_or(1)
    }

    /// Decode the payload into a typed event.
    pub fn decode<E: Event>(&self) -> Result<E, EventCodecError> {
        decode_payload(&self.event_type, &self.payload)
    }
}
