use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use parking_lot::RwLock;
use tracing::warn;
use uuid::Uuid;

use waggle_core::{Event, EventFilter, WaggleResult};

use crate::event_log::EventLog;

type Handler = Arc<dyn Fn(Event) -> BoxFuture<'static, WaggleResult<()>> + Send + Sync>;

/// Identity of a registered handler, used to unregister it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(Uuid);

#[derive(Default)]
struct Registry {
    /// Exact event type → handlers, in registration order.
    exact: HashMap<String, Vec<(HandlerId, Handler)>>,
    /// Wildcard handlers, invoked for every event. Kept as a separate
    /// registry (not a sentinel key) so an event never reaches the same
    /// handler twice.
    wildcard: Vec<(HandlerId, Handler)>,
}

/// Durable publish/subscribe event log.
///
/// `emit` appends to the [`EventLog`] first — persistence failure fails the
/// emit — then invokes exact-type handlers followed by wildcard handlers.
/// Handler failures are logged and isolated: they never stop other handlers
/// or the emit itself.
pub struct EventBus {
    log: EventLog,
    registry: RwLock<Registry>,
}

impl EventBus {
    pub async fn new(dir: impl Into<PathBuf>) -> WaggleResult<Self> {
        Ok(Self {
            log: EventLog::new(dir).await?,
            registry: RwLock::new(Registry::default()),
        })
    }

    /// Register a handler for one exact event type.
    pub fn on<F, Fut>(&self, event_type: impl Into<String>, handler: F) -> HandlerId
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = WaggleResult<()>> + Send + 'static,
    {
        let id = HandlerId(Uuid::new_v4());
        let handler: Handler = Arc::new(move |event| Box::pin(handler(event)));
        self.registry
            .write()
            .exact
            .entry(event_type.into())
            .or_default()
            .push((id, handler));
        id
    }

    /// Register a handler for every event regardless of type.
    pub fn on_any<F, Fut>(&self, handler: F) -> HandlerId
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = WaggleResult<()>> + Send + 'static,
    {
        let id = HandlerId(Uuid::new_v4());
        let handler: Handler = Arc::new(move |event| Box::pin(handler(event)));
        self.registry.write().wildcard.push((id, handler));
        id
    }

    /// Unregister a handler by identity. Unknown ids are ignored.
    pub fn off(&self, id: HandlerId) {
        let mut registry = self.registry.write();
        for handlers in registry.exact.values_mut() {
            handlers.retain(|(h, _)| *h != id);
        }
        registry.exact.retain(|_, handlers| !handlers.is_empty());
        registry.wildcard.retain(|(h, _)| *h != id);
    }

    /// Durably persist the event, then fan it out to subscribers.
    pub async fn emit(&self, event: Event) -> WaggleResult<()> {
        self.log.append(&event).await?;

        // Snapshot the matching handlers so the registry lock is never held
        // across an invocation; handlers may re-enter emit.
        let handlers: Vec<Handler> = {
            let registry = self.registry.read();
            let exact = registry
                .exact
                .get(&event.event_type)
                .into_iter()
                .flatten()
                .map(|(_, h)| Arc::clone(h));
            let wildcard = registry.wildcard.iter().map(|(_, h)| Arc::clone(h));
            exact.chain(wildcard).collect()
        };

        for handler in handlers {
            if let Err(e) = handler(event.clone()).await {
                warn!(
                    event_type = %event.event_type,
                    event_id = %event.id,
                    error = %e,
                    "event handler failed"
                );
            }
        }
        Ok(())
    }

    /// Filtered replay of the persisted history.
    pub async fn history(&self, filter: &EventFilter) -> WaggleResult<Vec<Event>> {
        self.log.history(filter).await
    }
}
