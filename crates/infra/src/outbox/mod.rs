//! Transactional outbox.
//!
//! Events appended through an outbox-enabled event store get one `pending`
//! record each, written in the same transaction. [`OutboxWorker`] claims those
//! records, publishes them through an [`EventPublisher`] and drives the
//! retry/backoff/dead-letter state machine (see [`OutboxStatus`]).

pub mod in_memory;
pub mod postgres;
pub mod store;
pub mod types;
pub mod worker;

pub use in_memory::InMemoryOutboxStore;
pub use postgres::PostgresOutboxStore;
pub use store::OutboxStore;
pub use types::{ClaimRequest, OutboxError, OutboxRecord, OutboxStats, OutboxStatus};
pub use worker::{
    BatchSummary, EventPublisher, OutboxMetrics, OutboxReport, OutboxWorker, OutboxWorkerHandle,
    RecordOutcome,
};
