//! Append-only event store boundary.
//!
//! [`EventStore`] is the storage-agnostic contract; [`InMemoryEventStore`] and
//! [`PostgresEventStore`] implement it with identical validation and errors.

pub mod in_memory;
pub mod postgres;
pub mod schema;
pub mod r#trait;

pub use in_memory::InMemoryEventStore;
pub use postgres::PostgresEventStore;
pub use r#trait::{EventStore, EventStoreError, Snapshot, TimestampPosition};
