//! Event handlers and the registry used to dispatch to them.
//!
//! Handlers are plain values registered on an explicit [`HandlerRegistry`];
//! there is no process-wide handler table. The replay engine and the broker
//! consumer both receive a registry at construction time.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;

use crate::event::DomainEvent;

/// Business-side reaction to a committed event (projection, process manager, ...).
///
/// `handle` returns `anyhow::Result` so business code can surface any error;
/// the runtime only logs it or aborts the current run.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Stable name used in logs and error reports.
    fn name(&self) -> &str;

    fn can_handle(&self, event: &DomainEvent) -> bool;

    async fn handle(&self, event: &DomainEvent) -> anyhow::Result<()>;
}

#[async_trait]
impl<H: EventHandler + ?Sized> EventHandler for Arc<H> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn can_handle(&self, event: &DomainEvent) -> bool {
        (**self).can_handle(event)
    }

    async fn handle(&self, event: &DomainEvent) -> anyhow::Result<()> {
        (**self).handle(event).await
    }
}

/// Ordered collection of handlers.
///
/// Dispatch order is registration order.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn EventHandler>) -> &mut Self {
        self.handlers.push(handler);
        self
    }

    /// Builder-style variant of [`HandlerRegistry::register`].
    pub fn with(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Handlers accepting `event`, in registration order.
    pub fn handlers_for<'a>(
        &'a self,
        event: &'a DomainEvent,
    ) -> impl Iterator<Item = &'a Arc<dyn EventHandler>> + 'a {
        self.handlers.iter().filter(move |h| h.can_handle(event))
    }

    pub fn names(&self) -> Vec<&str> {
        self.handlers.iter().map(|h| h.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn clear(&mut self) {
        self.handlers.clear();
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.names())
            .finish()
    }
}

type BoxedHandle =
    dyn Fn(DomainEvent) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>> + Send + Sync;

/// Closure-backed handler for a fixed set of event types.
///
/// An empty type list accepts every event.
pub struct FnHandler {
    name: String,
    event_types: Vec<String>,
    handle: Box<BoxedHandle>,
}

impl FnHandler {
    pub fn new<F, Fut>(name: impl Into<String>, event_types: &[&str], f: F) -> Self
    where
        F: Fn(DomainEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            event_types: event_types.iter().map(|t| t.to_string()).collect(),
            handle: Box::new(move |event| Box::pin(f(event))),
        }
    }
}

impl fmt::Debug for FnHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnHandler")
            .field("name", &self.name)
            .field("event_types", &self.event_types)
            .finish()
    }
}

#[async_trait]
impl EventHandler for FnHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn can_handle(&self, event: &DomainEvent) -> bool {
        self.event_types.is_empty() || self.event_types.iter().any(|t| t == event.event_type())
    }

    async fn handle(&self, event: &DomainEvent) -> anyhow::Result<()> {
        (self.handle)(event.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use eventide_core::{StreamId, TenantId};

    use super::*;

    fn event(event_type: &str) -> DomainEvent {
        DomainEvent::new(
            StreamId::new("acc-1"),
            TenantId::new(),
            1,
            event_type,
            serde_json::json!({}),
        )
    }

    #[tokio::test]
    async fn dispatch_follows_registration_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut registry = HandlerRegistry::new();

        for name in ["first", "second"] {
            let seen = seen.clone();
            registry.register(Arc::new(FnHandler::new(name, &[], move |_| {
                let seen = seen.clone();
                async move {
                    seen.lock().unwrap().push(name);
                    Ok(())
                }
            })));
        }

        let ev = event("Deposited");
        for handler in registry.handlers_for(&ev) {
            handler.handle(&ev).await.unwrap();
        }

        assert_eq!(*seen.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn handlers_are_filtered_by_event_type() {
        let registry = HandlerRegistry::new()
            .with(Arc::new(FnHandler::new("deposits", &["Deposited"], |_| async { Ok(()) })))
            .with(Arc::new(FnHandler::new("audit", &[], |_| async { Ok(()) })));

        let ev = event("Withdrawn");
        let names: Vec<&str> = registry
            .handlers_for(&ev)
            .map(|h| h.name())
            .collect();
        assert_eq!(names, vec!["audit"]);
        assert_eq!(registry.len(), 2);
    }
}
