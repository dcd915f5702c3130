//! Infrastructure layer: event store, outbox, snapshots, replay and broker.
//!
//! Every store has an in-memory implementation for tests and a Postgres one
//! (`sqlx`). The Kafka transport is behind the `kafka` feature.

pub mod broker;
pub mod config;
pub mod event_store;
pub mod outbox;
pub mod replay;
pub mod snapshot;

#[cfg(test)]
mod testing;
