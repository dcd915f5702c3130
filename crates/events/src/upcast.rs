//! Upcasting: transform stored payloads from older schema versions into the
//! current shape before handlers or aggregates see them.
//!
//! Upcasters are registered per event type on an [`UpcasterPipeline`] and run in
//! registration order. Field paths are dot-qualified (`"address.city"`).

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

use crate::event::DomainEvent;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpcastError {
    #[error("upcaster {upcaster}: payload of {event_type} is not a JSON object")]
    PayloadNotObject { upcaster: String, event_type: String },

    #[error("upcaster {upcaster}: transforming `{path}` failed: {message}")]
    Transform {
        upcaster: String,
        path: String,
        message: String,
    },

    #[error("upcaster {upcaster} failed: {message}")]
    Failed { upcaster: String, message: String },
}

/// Result of running one upcaster.
#[derive(Debug, Clone, PartialEq)]
pub enum UpcastOutcome {
    /// Nothing to do for this event.
    Unchanged,
    Changed(DomainEvent),
}

pub trait Upcaster: Send + Sync {
    fn name(&self) -> &str;

    /// Event type this upcaster applies to.
    fn event_type(&self) -> &str;

    fn upcast(&self, event: &DomainEvent) -> Result<UpcastOutcome, UpcastError>;
}

pub type FieldFn = Arc<dyn Fn(&JsonValue) -> Result<JsonValue, String> + Send + Sync>;

/// Canonical payload transformation.
#[derive(Clone)]
pub enum Transform {
    /// Insert `default` at `path` if nothing is there yet.
    AddField { path: String, default: JsonValue },
    /// Move `from` to `to`; no-op when `from` is absent or `to` already exists.
    RenameField { from: String, to: String },
    RemoveField { path: String },
    /// Replace the value at `path` with `f(value)`; no-op when absent.
    TransformField { path: String, f: FieldFn },
    /// Set metadata `schemaVersion`; never lowers it.
    BumpSchemaVersion { to: u32 },
}

impl Transform {
    pub fn add_field(path: impl Into<String>, default: JsonValue) -> Self {
        Self::AddField {
            path: path.into(),
            default,
        }
    }

    pub fn rename_field(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::RenameField {
            from: from.into(),
            to: to.into(),
        }
    }

    pub fn remove_field(path: impl Into<String>) -> Self {
        Self::RemoveField { path: path.into() }
    }

    pub fn transform_field<F>(path: impl Into<String>, f: F) -> Self
    where
        F: Fn(&JsonValue) -> Result<JsonValue, String> + Send + Sync + 'static,
    {
        Self::TransformField {
            path: path.into(),
            f: Arc::new(f),
        }
    }

    fn touches_payload(&self) -> bool {
        !matches!(self, Self::BumpSchemaVersion { .. })
    }
}

impl fmt::Debug for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AddField { path, default } => f
                .debug_struct("AddField")
                .field("path", path)
                .field("default", default)
                .finish(),
            Self::RenameField { from, to } => f
                .debug_struct("RenameField")
                .field("from", from)
                .field("to", to)
                .finish(),
            Self::RemoveField { path } => f.debug_struct("RemoveField").field("path", path).finish(),
            Self::TransformField { path, .. } => f
                .debug_struct("TransformField")
                .field("path", path)
                .finish_non_exhaustive(),
            Self::BumpSchemaVersion { to } => {
                f.debug_struct("BumpSchemaVersion").field("to", to).finish()
            }
        }
    }
}

/// Upcaster built from a list of [`Transform`]s.
///
/// With [`FieldUpcaster::below_version`] the upcaster only runs for events whose
/// schema version is lower than the given one; pair it with
/// [`Transform::BumpSchemaVersion`] so non-idempotent transforms run once.
#[derive(Debug, Clone)]
pub struct FieldUpcaster {
    name: String,
    event_type: String,
    below_version: Option<u32>,
    transforms: Vec<Transform>,
}

impl FieldUpcaster {
    pub fn new(name: impl Into<String>, event_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            event_type: event_type.into(),
            below_version: None,
            transforms: Vec::new(),
        }
    }

    pub fn below_version(mut self, version: u32) -> Self {
        self.below_version = Some(version);
        self
    }

    pub fn then(mut self, transform: Transform) -> Self {
        self.transforms.push(transform);
        self
    }

    fn apply(
        &self,
        transform: &Transform,
        payload: &mut Map<String, JsonValue>,
        schema_version: &mut u32,
    ) -> Result<bool, UpcastError> {
        match transform {
            Transform::AddField { path, default } => {
                if get_path(payload, path).is_some() {
                    return Ok(false);
                }
                Ok(insert_path(payload, path, default.clone()))
            }
            Transform::RenameField { from, to } => {
                if get_path(payload, to).is_some() {
                    return Ok(false);
                }
                match remove_path(payload, from) {
                    Some(value) => {
                        if insert_path(payload, to, value.clone()) {
                            Ok(true)
                        } else {
                            // Destination not reachable; put the source back.
                            insert_path(payload, from, value);
                            Ok(false)
                        }
                    }
                    None => Ok(false),
                }
            }
            Transform::RemoveField { path } => Ok(remove_path(payload, path).is_some()),
            Transform::TransformField { path, f } => {
                let Some(current) = get_path(payload, path) else {
                    return Ok(false);
                };
                let next = f(current).map_err(|message| UpcastError::Transform {
                    upcaster: self.name.clone(),
                    path: path.clone(),
                    message,
                })?;
                if &next == current {
                    return Ok(false);
                }
                Ok(insert_path(payload, path, next))
            }
            Transform::BumpSchemaVersion { to } => {
                if *to > *schema_version {
                    *schema_version = *to;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
        }
    }
}

impl Upcaster for FieldUpcaster {
    fn name(&self) -> &str {
        &self.name
    }

    fn event_type(&self) -> &str {
        &self.event_type
    }

    fn upcast(&self, event: &DomainEvent) -> Result<UpcastOutcome, UpcastError> {
        if event.event_type() != self.event_type {
            return Ok(UpcastOutcome::Unchanged);
        }
        if self
            .below_version
            .is_some_and(|v| event.schema_version() >= v)
        {
            return Ok(UpcastOutcome::Unchanged);
        }

        let mut payload = match event.payload() {
            JsonValue::Object(map) => map.clone(),
            JsonValue::Null if !self.transforms.iter().any(Transform::touches_payload) => Map::new(),
            _ => {
                return Err(UpcastError::PayloadNotObject {
                    upcaster: self.name.clone(),
                    event_type: event.event_type().to_string(),
                });
            }
        };
        let mut schema_version = event.schema_version();
        let mut payload_changed = false;
        let mut version_changed = false;

        for transform in &self.transforms {
            let changed = self.apply(transform, &mut payload, &mut schema_version)?;
            if transform.touches_payload() {
                payload_changed |= changed;
            } else {
                version_changed |= changed;
            }
        }

        if !payload_changed && !version_changed {
            return Ok(UpcastOutcome::Unchanged);
        }

        let mut next = event.clone();
        if payload_changed {
            next = next.with_payload(JsonValue::Object(payload));
        }
        if version_changed {
            next = next.with_schema_version(schema_version);
        }
        Ok(UpcastOutcome::Changed(next))
    }
}

/// Ordered upcasters per event type.
///
/// Constructed once and shared by `Arc`.
#[derive(Default)]
pub struct UpcasterPipeline {
    upcasters: HashMap<String, Vec<Arc<dyn Upcaster>>>,
}

impl UpcasterPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, upcaster: Arc<dyn Upcaster>) -> &mut Self {
        self.upcasters
            .entry(upcaster.event_type().to_string())
            .or_default()
            .push(upcaster);
        self
    }

    pub fn with(mut self, upcaster: Arc<dyn Upcaster>) -> Self {
        self.register(upcaster);
        self
    }

    pub fn has_upcasters(&self, event_type: &str) -> bool {
        self.upcasters.get(event_type).is_some_and(|u| !u.is_empty())
    }

    /// Run every upcaster registered for the event's type.
    ///
    /// Any error aborts the whole upcast; no partially upcast event is returned.
    pub fn upcast(&self, event: DomainEvent) -> Result<DomainEvent, UpcastError> {
        let Some(upcasters) = self.upcasters.get(event.event_type()) else {
            return Ok(event);
        };

        let mut current = event;
        for upcaster in upcasters {
            match upcaster.upcast(&current)? {
                UpcastOutcome::Unchanged => {}
                UpcastOutcome::Changed(next) => {
                    tracing::debug!(
                        upcaster = upcaster.name(),
                        event_id = %next.id(),
                        event_type = next.event_type(),
                        "upcast event"
                    );
                    current = next;
                }
            }
        }
        Ok(current)
    }

    pub fn upcast_all(&self, events: Vec<DomainEvent>) -> Result<Vec<DomainEvent>, UpcastError> {
        events.into_iter().map(|e| self.upcast(e)).collect()
    }
}

impl fmt::Debug for UpcasterPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: HashMap<&str, Vec<&str>> = self
            .upcasters
            .iter()
            .map(|(t, u)| (t.as_str(), u.iter().map(|u| u.name()).collect()))
            .collect();
        f.debug_struct("UpcasterPipeline").field("upcasters", &names).finish()
    }
}

fn get_path<'a>(root: &'a Map<String, JsonValue>, path: &str) -> Option<&'a JsonValue> {
    let mut segments = path.split('.');
    let first = segments.next()?;
    let mut current = root.get(first)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Insert, creating intermediate objects. Returns false when a non-object is in the way.
fn insert_path(root: &mut Map<String, JsonValue>, path: &str, value: JsonValue) -> bool {
    let (parents, leaf) = match path.rsplit_once('.') {
        Some((parents, leaf)) => (Some(parents), leaf),
        None => (None, path),
    };

    let mut current = root;
    if let Some(parents) = parents {
        for segment in parents.split('.') {
            let entry = current
                .entry(segment.to_string())
                .or_insert_with(|| JsonValue::Object(Map::new()));
            match entry {
                JsonValue::Object(map) => current = map,
                _ => return false,
            }
        }
    }
    current.insert(leaf.to_string(), value);
    true
}

fn remove_path(root: &mut Map<String, JsonValue>, path: &str) -> Option<JsonValue> {
    match path.rsplit_once('.') {
        None => root.remove(path),
        Some((parents, leaf)) => {
            let mut current = root;
            for segment in parents.split('.') {
                current = current.get_mut(segment)?.as_object_mut()?;
            }
            current.remove(leaf)
        }
    }
}

#[cfg(test)]
mod tests {
    use eventide_core::{StreamId, TenantId};
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;

    fn event(payload: JsonValue) -> DomainEvent {
        DomainEvent::new(
            StreamId::new("acc-1"),
            TenantId::new(),
            1,
            "AccountCreated",
            payload,
        )
    }

    fn v1_to_v2() -> FieldUpcaster {
        FieldUpcaster::new("account-created-v2", "AccountCreated")
            .then(Transform::rename_field("accountName", "name"))
            .then(Transform::add_field("currency", json!("EUR")))
            .then(Transform::add_field("address.country", json!("NO")))
            .then(Transform::remove_field("legacyCode"))
            .then(Transform::BumpSchemaVersion { to: 2 })
    }

    #[test]
    fn field_transforms_reshape_the_payload() {
        let pipeline = UpcasterPipeline::new().with(Arc::new(v1_to_v2()));
        let upcast = pipeline
            .upcast(event(json!({"accountName": "Cash", "legacyCode": 7})))
            .unwrap();

        assert_eq!(
            upcast.payload(),
            &json!({"name": "Cash", "currency": "EUR", "address": {"country": "NO"}})
        );
        assert_eq!(upcast.schema_version(), 2);
    }

    #[test]
    fn rename_is_a_noop_when_target_exists() {
        let upcaster = FieldUpcaster::new("r", "AccountCreated").then(Transform::rename_field("a", "b"));
        let outcome = upcaster.upcast(&event(json!({"a": 1, "b": 2}))).unwrap();
        assert_eq!(outcome, UpcastOutcome::Unchanged);
    }

    #[test]
    fn schema_version_is_never_lowered() {
        let upcaster =
            FieldUpcaster::new("bump", "AccountCreated").then(Transform::BumpSchemaVersion { to: 2 });
        let current = event(json!({})).with_schema_version(3);
        assert_eq!(upcaster.upcast(&current).unwrap(), UpcastOutcome::Unchanged);
    }

    #[test]
    fn version_gate_skips_already_current_events() {
        let double = FieldUpcaster::new("double", "AccountCreated")
            .below_version(2)
            .then(Transform::transform_field("amount", |v| {
                v.as_i64().map(|n| json!(n * 2)).ok_or_else(|| "not a number".to_string())
            }))
            .then(Transform::BumpSchemaVersion { to: 2 });
        let pipeline = UpcasterPipeline::new().with(Arc::new(double));

        let once = pipeline.upcast(event(json!({"amount": 5}))).unwrap();
        let twice = pipeline.upcast(once.clone()).unwrap();
        assert_eq!(once.payload(), &json!({"amount": 10}));
        assert_eq!(twice, once);
    }

    #[test]
    fn failing_transform_aborts_the_whole_upcast() {
        let pipeline = UpcasterPipeline::new()
            .with(Arc::new(
                FieldUpcaster::new("add", "AccountCreated").then(Transform::add_field("x", json!(1))),
            ))
            .with(Arc::new(FieldUpcaster::new("broken", "AccountCreated").then(
                Transform::transform_field("x", |_| Err("boom".to_string())),
            )));

        let err = pipeline.upcast(event(json!({}))).unwrap_err();
        assert_eq!(
            err,
            UpcastError::Transform {
                upcaster: "broken".to_string(),
                path: "x".to_string(),
                message: "boom".to_string(),
            }
        );
    }

    #[test]
    fn other_event_types_pass_through() {
        let pipeline = UpcasterPipeline::new().with(Arc::new(v1_to_v2()));
        let other = DomainEvent::new(StreamId::new("s"), TenantId::new(), 1, "Deposited", json!({"a": 1}));
        assert!(!pipeline.has_upcasters("Deposited"));
        assert_eq!(pipeline.upcast(other.clone()).unwrap(), other);
    }

    #[test]
    fn non_object_payloads_are_rejected_by_field_transforms() {
        let pipeline = UpcasterPipeline::new().with(Arc::new(v1_to_v2()));
        assert!(matches!(
            pipeline.upcast(event(json!([1, 2]))),
            Err(UpcastError::PayloadNotObject { .. })
        ));
    }

    fn arb_payload() -> impl Strategy<Value = Map<String, JsonValue>> {
        prop::collection::btree_map("[a-d]{1,3}", any::<i64>().prop_map(JsonValue::from), 0..6)
            .prop_map(|m| m.into_iter().collect())
    }

    proptest! {
        #[test]
        fn pipeline_is_idempotent(payload in arb_payload()) {
            let pipeline = UpcasterPipeline::new()
                .with(Arc::new(
                    FieldUpcaster::new("v2", "AccountCreated")
                        .then(Transform::add_field("a", json!("default")))
                        .then(Transform::rename_field("b", "bb"))
                        .then(Transform::remove_field("c"))
                        .then(Transform::BumpSchemaVersion { to: 2 }),
                ))
                .with(Arc::new(
                    FieldUpcaster::new("v3", "AccountCreated")
                        .then(Transform::add_field("nested.flag", json!(true)))
                        .then(Transform::BumpSchemaVersion { to: 3 }),
                ));

            let original = event(JsonValue::Object(payload));
            let once = pipeline.upcast(original).unwrap();
            let twice = pipeline.upcast(once.clone()).unwrap();
            prop_assert_eq!(twice, once);
        }
    }
}
