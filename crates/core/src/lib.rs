//! `eventide-core`: identifiers, errors and the aggregate state contract.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns).

pub mod aggregate;
pub mod error;
pub mod id;

pub use aggregate::Aggregate;
pub use error::{DomainError, DomainResult};
pub use id::{EventId, StreamId, TenantId, UserId};
