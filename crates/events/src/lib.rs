//! Event model for the eventide runtime.
//!
//! - [`DomainEvent`]: immutable record of something that happened in a stream
//! - [`AggregateRoot`]: version tracking + uncommitted-event buffer around an
//!   [`eventide_core::Aggregate`]
//! - [`HandlerRegistry`]: explicit dispatch table for [`EventHandler`]s
//! - [`SchemaRegistry`] and [`UpcasterPipeline`]: schema evolution

pub mod aggregate;
pub mod event;
pub mod handler;
pub mod schema;
pub mod upcast;

pub use aggregate::{AggregateError, AggregateRoot, EventContext};
pub use event::{
    DomainEvent, Event, EventCodecError, Metadata, SCHEMA_VERSION_KEY, decode_payload,
    encode_payload,
};
pub use handler::{EventHandler, FnHandler, HandlerRegistry};
pub use schema::{SchemaError, SchemaRegistry, SchemaValidationFailure, SchemaVersion};
pub use upcast::{FieldFn, FieldUpcaster, Transform, UpcastError, UpcastOutcome, Upcaster, UpcasterPipeline};
