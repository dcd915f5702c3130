//! Wire format of published events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use eventide_core::{EventId, StreamId, TenantId, UserId};
use eventide_events::{DomainEvent, Metadata, SCHEMA_VERSION_KEY};

use super::BrokerError;

pub const HEADER_EVENT_TYPE: &str = "event-type";
pub const HEADER_TENANT_ID: &str = "tenant-id";
pub const HEADER_SCHEMA_VERSION: &str = "schema-version";
pub const HEADER_CORRELATION_ID: &str = "correlation-id";
pub const HEADER_CAUSATION_ID: &str = "causation-id";

const META_CREATED_BY: &str = "createdBy";

/// Message body (camelCase JSON).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMessage {
    pub id: EventId,
    pub aggregate_id: StreamId,
    pub version: u64,
    pub event_type: String,
    pub occurred_at: DateTime<Utc>,
    pub tenant_id: TenantId,
    pub correlation_id: Option<Uuid>,
    pub causation_id: Option<Uuid>,
    pub data: JsonValue,
    pub metadata: MessageMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageMetadata {
    pub schema_version: u32,
    pub published_at: DateTime<Utc>,
    /// Remaining event metadata, passed through untouched.
    #[serde(flatten)]
    pub extra: Metadata,
}

impl EventMessage {
    pub fn from_event(event: &DomainEvent, published_at: DateTime<Utc>) -> Self {
        let mut extra = event.metadata().clone();
        extra.remove(SCHEMA_VERSION_KEY);
        if let Some(created_by) = event.created_by() {
            extra.insert(META_CREATED_BY.to_string(), JsonValue::String(created_by.to_string()));
        }

        Self {
            id: event.id(),
            aggregate_id: event.aggregate_id().clone(),
            version: event.version(),
            event_type: event.event_type().to_string(),
            occurred_at: event.occurred_at(),
            tenant_id: event.tenant_id(),
            correlation_id: event.correlation_id(),
            causation_id: event.causation_id(),
            data: event.payload().clone(),
            metadata: MessageMetadata {
                schema_version: event.schema_version(),
                published_at,
                extra,
            },
        }
    }

    pub fn to_event(&self) -> Result<DomainEvent, BrokerError> {
        let mut metadata = self.metadata.extra.clone();
        let created_by = match metadata.remove(META_CREATED_BY) {
            Some(JsonValue::String(raw)) => Some(
                raw.parse::<UserId>()
                    .map_err(|e| BrokerError::Malformed(format!("invalid createdBy: {e}")))?,
            ),
            _ => None,
        };

        Ok(DomainEvent::new(
            self.aggregate_id.clone(),
            self.tenant_id,
            self.version,
            self.event_type.clone(),
            self.data.clone(),
        )
        .with_id(self.id)
        .with_occurred_at(self.occurred_at)
        .with_correlation_id(self.correlation_id)
        .with_causation_id(self.causation_id)
        .with_created_by(created_by)
        .with_metadata(metadata)
        .with_schema_version(self.metadata.schema_version))
    }

    pub fn headers(&self) -> Vec<(String, String)> {
        let mut headers = vec![
            (HEADER_EVENT_TYPE.to_string(), self.event_type.clone()),
            (HEADER_TENANT_ID.to_string(), self.tenant_id.to_string()),
            (
                HEADER_SCHEMA_VERSION.to_string(),
                self.metadata.schema_version.to_string(),
            ),
        ];
        if let Some(id) = self.correlation_id {
            headers.push((HEADER_CORRELATION_ID.to_string(), id.to_string()));
        }
        if let Some(id) = self.causation_id {
            headers.push((HEADER_CAUSATION_ID.to_string(), id.to_string()));
        }
        headers
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, BrokerError> {
        serde_json::to_vec(self).map_err(|e| BrokerError::Malformed(e.to_string()))
    }

    /// Parse a message body; any missing required field makes it malformed.
    pub fn from_bytes(payload: &[u8]) -> Result<Self, BrokerError> {
        serde_json::from_slice(payload).map_err(|e| BrokerError::Malformed(e.to_string()))
    }
}
