//! Aggregate state trait for event-sourced domain models.

/// State of an event-sourced aggregate.
///
/// Implementors are the pure, in-memory fold of a stream: they only know how to
/// evolve from one event to the next. Identity, version tracking and the
/// uncommitted-event buffer live in `eventide_events::AggregateRoot`, which wraps
/// this trait. Keeping the two apart means events never hold a reference back to
/// the aggregate instance.
///
/// Aggregates must not perform IO or side effects.
pub trait Aggregate: Default + Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Closed set of events this aggregate understands.
    type Event: Clone + core::fmt::Debug + Send + Sync + 'static;

    /// Stable aggregate type name (e.g. "accounting.account").
    const AGGREGATE_TYPE: &'static str;

    /// Evolve in-memory state from a single event.
    ///
    /// Must be deterministic: replaying the same events in the same order must
    /// always produce the same state.
    fn apply(&mut self, event: &Self::Event);
}
