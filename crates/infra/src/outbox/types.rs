//! Outbox record model and state machine.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

use eventide_core::{EventId, StreamId, TenantId, UserId};
use eventide_events::{DomainEvent, Metadata};

/// Metadata keys the outbox adds so the event can be rebuilt for publication.
pub const META_VERSION: &str = "version";
pub const META_OCCURRED_AT: &str = "occurredAt";
pub const META_CREATED_BY: &str = "createdBy";

/// Outbox record status.
///
/// ```text
/// pending ──claim──> processing ──ok──> done
///    ^                   │
///    └──retry (backoff)──┤
///                        └──retry_count >= dlq_threshold──> dlq
/// ```
///
/// `dlq` is terminal until an operator requeues the record.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboxStatus {
    Pending,
    Processing,
    Done,
    Dlq,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Done => "done",
            Self::Dlq => "dlq",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "done" => Some(Self::Done),
            "dlq" => Some(Self::Dlq),
            _ => None,
        }
    }
}

impl core::fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the transactional outbox.
///
/// The id is the id of the event it carries, so a record can be written at
/// most once per event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxRecord {
    pub id: EventId,
    pub aggregate_id: StreamId,
    pub event_type: String,
    pub event_data: JsonValue,
    pub metadata: Metadata,
    pub tenant_id: TenantId,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub status: OutboxStatus,
    pub error_message: Option<String>,
    pub correlation_id: Option<Uuid>,
    pub causation_id: Option<Uuid>,
    /// Not claimable before this instant (retry backoff).
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub claimed_at: Option<DateTime<Utc>>,
}

impl OutboxRecord {
    /// Pending record for a freshly committed event.
    pub fn from_event(event: &DomainEvent) -> Self {
        let mut metadata = event.metadata().clone();
        metadata.insert(META_VERSION.to_string(), JsonValue::from(event.version()));
        metadata.insert(
            META_OCCURRED_AT.to_string(),
            JsonValue::String(event.occurred_at().to_rfc3339()),
        );
        if let Some(created_by) = event.created_by() {
            metadata.insert(
                META_CREATED_BY.to_string(),
                JsonValue::String(created_by.to_string()),
            );
        }

        Self {
            id: event.id(),
            aggregate_id: event.aggregate_id().clone(),
            event_type: event.event_type().to_string(),
            event_data: event.payload().clone(),
            metadata,
            tenant_id: event.tenant_id(),
            created_at: Utc::now(),
            processed_at: None,
            retry_count: 0,
            status: OutboxStatus::Pending,
            error_message: None,
            correlation_id: event.correlation_id(),
            causation_id: event.causation_id(),
            next_attempt_at: None,
            claimed_at: None,
        }
    }

    /// Rebuild the carried event.
    pub fn to_event(&self) -> Result<DomainEvent, OutboxError> {
        let mut metadata = self.metadata.clone();

        let version = metadata
            .remove(META_VERSION)
            .and_then(|v| v.as_u64())
            .ok_or_else(|| self.malformed("missing or invalid version metadata"))?;

        let occurred_at = match metadata.remove(META_OCCURRED_AT) {
            Some(JsonValue::String(raw)) => DateTime::parse_from_rfc3339(&raw)
                .map(|ts| ts.with_timezone(&Utc))
                .map_err(|e| self.malformed(format!("invalid occurredAt: {e}")))?,
            _ => self.created_at,
        };

        let created_by = match metadata.remove(META_CREATED_BY) {
            Some(JsonValue::String(raw)) => Some(
                raw.parse::<UserId>()
                    .map_err(|e| self.malformed(format!("invalid createdBy: {e}")))?,
            ),
            _ => None,
        };

        Ok(DomainEvent::new(
            self.aggregate_id.clone(),
            self.tenant_id,
            version,
            self.event_type.clone(),
            self.event_data.clone(),
        )
        .with_id(self.id)
        .with_occurred_at(occurred_at)
        .with_correlation_id(self.correlation_id)
        .with_causation_id(self.causation_id)
        .with_created_by(created_by)
        .with_metadata(metadata))
    }

    /// Whether a claim issued at `now` may take this record.
    pub fn is_claimable(&self, now: DateTime<Utc>, claim_timeout: Duration) -> bool {
        match self.status {
            OutboxStatus::Pending => self.next_attempt_at.is_none_or(|at| at <= now),
            OutboxStatus::Processing => {
                let timeout = chrono::Duration::from_std(claim_timeout)
                    .unwrap_or(chrono::Duration::MAX);
                self.claimed_at
                    .is_none_or(|claimed| now.signed_duration_since(claimed) > timeout)
            }
            OutboxStatus::Done | OutboxStatus::Dlq => false,
        }
    }

    fn malformed(&self, message: impl Into<String>) -> OutboxError {
        OutboxError::MalformedRecord {
            id: self.id,
            message: message.into(),
        }
    }
}

/// Parameters of one claim.
#[derive(Debug, Clone, Copy)]
pub struct ClaimRequest {
    pub batch_size: usize,
    pub now: DateTime<Utc>,
    /// `processing` rows claimed longer ago than this are reclaimed.
    pub claim_timeout: Duration,
}

/// Record counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutboxStats {
    pub pending: u64,
    pub processing: u64,
    pub done: u64,
    pub dlq: u64,
}

impl OutboxStats {
    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.done + self.dlq
    }

    pub(crate) fn count(&mut self, status: OutboxStatus) {
        match status {
            OutboxStatus::Pending => self.pending += 1,
            OutboxStatus::Processing => self.processing += 1,
            OutboxStatus::Done => self.done += 1,
            OutboxStatus::Dlq => self.dlq += 1,
        }
    }
}

#[derive(Debug, Error)]
pub enum OutboxError {
    #[error("outbox record not found: {0}")]
    NotFound(EventId),

    #[error("outbox record {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: EventId,
        from: OutboxStatus,
        to: OutboxStatus,
    },

    #[error("malformed outbox record {id}: {message}")]
    MalformedRecord { id: EventId, message: String },

    #[error("outbox storage error in {operation}: {message}")]
    Storage { operation: String, message: String },
}

impl OutboxError {
    pub fn storage(operation: impl Into<String>, message: impl ToString) -> Self {
        Self::Storage {
            operation: operation.into(),
            message: message.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn event() -> DomainEvent {
        DomainEvent::new(
            StreamId::new("acc-1"),
            TenantId::new(),
            3,
            "Deposited",
            json!({"amount": 10}),
        )
        .with_correlation_id(Some(Uuid::now_v7()))
        .with_created_by(Some(UserId::new()))
        .with_schema_version(2)
    }

    #[test]
    fn record_carries_everything_needed_to_rebuild_the_event() {
        let original = event();
        let record = OutboxRecord::from_event(&original);

        assert_eq!(record.id, original.id());
        assert_eq!(record.status, OutboxStatus::Pending);
        assert_eq!(record.metadata[META_VERSION], json!(3));

        assert_eq!(record.to_event().unwrap(), original);
    }

    #[test]
    fn missing_version_metadata_is_reported() {
        let mut record = OutboxRecord::from_event(&event());
        record.metadata.remove(META_VERSION);
        assert!(matches!(record.to_event(), Err(OutboxError::MalformedRecord { .. })));
    }

    #[test]
    fn claimability_honours_backoff_and_claim_timeout() {
        let now = Utc::now();
        let timeout = Duration::from_secs(60);
        let mut record = OutboxRecord::from_event(&event());
        assert!(record.is_claimable(now, timeout));

        record.next_attempt_at = Some(now + chrono::Duration::seconds(5));
        assert!(!record.is_claimable(now, timeout));

        record.status = OutboxStatus::Processing;
        record.claimed_at = Some(now - chrono::Duration::seconds(30));
        assert!(!record.is_claimable(now, timeout));
        record.claimed_at = Some(now - chrono::Duration::seconds(120));
        assert!(record.is_claimable(now, timeout));

        record.status = OutboxStatus::Dlq;
        assert!(!record.is_claimable(now, timeout));
    }
}
