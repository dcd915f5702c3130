//! Versioned event schema registry.
//!
//! Schema definitions are JSON-schema-like objects:
//!
//! ```json
//! {
//!   "required": ["name", "address"],
//!   "properties": {
//!     "address": { "type": "object", "required": ["city"] }
//!   }
//! }
//! ```
//!
//! Only `required` is enforced. Nested `required` lists are checked when the
//! parent field is present and is an object. Validation never fails hard: a bad
//! payload yields `false` / a [`SchemaValidationFailure`] and a warning.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::event::DomainEvent;

/// One registered version of an event type's schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaVersion {
    pub event_type: String,
    /// 1-based, assigned by the registry.
    pub version: u32,
    pub schema_definition: JsonValue,
    pub created_at: DateTime<Utc>,
    pub deprecated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("unknown event type: {0}")]
    UnknownEventType(String),

    #[error("unknown schema version {version} for {event_type}")]
    UnknownVersion { event_type: String, version: u32 },
}

/// Payload did not satisfy the current schema.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{event_type} v{version} is missing required fields: {}", .missing.join(", "))]
pub struct SchemaValidationFailure {
    pub event_type: String,
    pub version: u32,
    /// Dot-qualified paths of every missing field.
    pub missing: Vec<String>,
}

/// Registry of schema versions per event type.
///
/// Constructed once and shared (`Arc<SchemaRegistry>`); all methods take `&self`.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    schemas: RwLock<HashMap<String, Vec<SchemaVersion>>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new schema version for `event_type`; returns the assigned version.
    pub fn register(&self, event_type: impl Into<String>, definition: JsonValue) -> u32 {
        let event_type = event_type.into();
        let mut schemas = self.schemas.write().unwrap_or_else(PoisonError::into_inner);
        let versions = schemas.entry(event_type.clone()).or_default();
        let version = versions.len() as u32 + 1;

        versions.push(SchemaVersion {
            event_type: event_type.clone(),
            version,
            schema_definition: definition,
            created_at: Utc::now(),
            deprecated: false,
        });

        tracing::info!(event_type = %event_type, version, "registered event schema");
        version
    }

    pub fn current_version(&self, event_type: &str) -> Option<u32> {
        let schemas = self.schemas.read().unwrap_or_else(PoisonError::into_inner);
        schemas.get(event_type).and_then(|v| v.last()).map(|s| s.version)
    }

    pub fn current_schema(&self, event_type: &str) -> Option<SchemaVersion> {
        let schemas = self.schemas.read().unwrap_or_else(PoisonError::into_inner);
        schemas.get(event_type).and_then(|v| v.last()).cloned()
    }

    pub fn schema(&self, event_type: &str, version: u32) -> Option<SchemaVersion> {
        let schemas = self.schemas.read().unwrap_or_else(PoisonError::into_inner);
        schemas
            .get(event_type)
            .and_then(|v| v.iter().find(|s| s.version == version))
            .cloned()
    }

    /// All versions of `event_type`, oldest first.
    pub fn versions(&self, event_type: &str) -> Vec<SchemaVersion> {
        let schemas = self.schemas.read().unwrap_or_else(PoisonError::into_inner);
        schemas.get(event_type).cloned().unwrap_or_default()
    }

    pub fn event_types(&self) -> Vec<String> {
        let schemas = self.schemas.read().unwrap_or_else(PoisonError::into_inner);
        let mut types: Vec<String> = schemas.keys().cloned().collect();
        types.sort();
        types
    }

    /// Mark a version deprecated. Deprecated versions stay readable.
    pub fn deprecate(&self, event_type: &str, version: u32) -> Result<(), SchemaError> {
        let mut schemas = self.schemas.write().unwrap_or_else(PoisonError::into_inner);
        let versions = schemas
            .get_mut(event_type)
            .ok_or_else(|| SchemaError::UnknownEventType(event_type.to_string()))?;
        let schema = versions
            .iter_mut()
            .find(|s| s.version == version)
            .ok_or_else(|| SchemaError::UnknownVersion {
                event_type: event_type.to_string(),
                version,
            })?;

        schema.deprecated = true;
        tracing::info!(event_type, version, "deprecated event schema");
        Ok(())
    }

    /// Check `payload` against the current schema of `event_type`.
    ///
    /// Event types without a registered schema always pass.
    pub fn validate_payload(
        &self,
        event_type: &str,
        payload: &JsonValue,
    ) -> Result<(), SchemaValidationFailure> {
        let Some(schema) = self.current_schema(event_type) else {
            return Ok(());
        };

        let mut missing = Vec::new();
        collect_missing(&schema.schema_definition, payload, "", &mut missing);

        if missing.is_empty() {
            Ok(())
        } else {
            Err(SchemaValidationFailure {
                event_type: event_type.to_string(),
                version: schema.version,
                missing,
            })
        }
    }

    /// `true` when the event's payload satisfies the current schema.
    pub fn validate_event(&self, event: &DomainEvent) -> bool {
        match self.validate_payload(event.event_type(), event.payload()) {
            Ok(()) => true,
            Err(failure) => {
                tracing::warn!(
                    event_id = %event.id(),
                    event_type = %failure.event_type,
                    schema_version = failure.version,
                    missing = ?failure.missing,
                    "event failed schema validation"
                );
                false
            }
        }
    }
}

fn collect_missing(schema: &JsonValue, value: &JsonValue, prefix: &str, missing: &mut Vec<String>) {
    let object = value.as_object();

    if let Some(required) = schema.get("required").and_then(JsonValue::as_array) {
        for field in required.iter().filter_map(JsonValue::as_str) {
            let present = object.is_some_and(|o| o.get(field).is_some_and(|v| !v.is_null()));
            if !present {
                missing.push(join_path(prefix, field));
            }
        }
    }

    let (Some(properties), Some(object)) = (
        schema.get("properties").and_then(JsonValue::as_object),
        object,
    ) else {
        return;
    };

    for (field, sub_schema) in properties {
        if let Some(child) = object.get(field).filter(|v| v.is_object()) {
            collect_missing(sub_schema, child, &join_path(prefix, field), missing);
        }
    }
}

fn join_path(prefix: &str, field: &str) -> String {
    if prefix.is_empty() {
        field.to_string()
    } else {
        format!("{prefix}.{field}")
    }
}
