//! Handler and event-type registry.
//!
//! Maps a logical event name to the ordered handlers registered for it and to
//! the concrete event type needed to decode its payloads. Both mappings live
//! behind one lock. Entries are only removed when a subscribe fails to open
//! its consumer.

use std::any::{Any, TypeId};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::RwLock;
use tracing::debug;

use super::{BusError, Result};
use crate::event::{bare_type_name, decode_event, Event, EventHandler};

/// A decoded event, shared by every handler of one delivery.
pub type DecodedEvent = Arc<dyn Any + Send + Sync>;

type Decoder = Arc<dyn Fn(&[u8]) -> Result<DecodedEvent> + Send + Sync>;

/// Identity of a handler type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId {
    type_id: TypeId,
    name: &'static str,
}

impl HandlerId {
    pub fn of<H: 'static>() -> Self {
        Self {
            type_id: TypeId::of::<H>(),
            name: bare_type_name::<H>(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// Concrete type registered under a logical event name.
#[derive(Clone)]
pub struct EventType {
    name: &'static str,
    type_id: TypeId,
    type_name: &'static str,
    decoder: Decoder,
}

impl EventType {
    pub fn of<E: Event>() -> Self {
        Self {
            name: E::event_name(),
            type_id: TypeId::of::<E>(),
            type_name: std::any::type_name::<E>(),
            decoder: Arc::new(|payload: &[u8]| {
                decode_event::<E>(payload).map(|event| Arc::new(event) as DecodedEvent)
            }),
        }
    }

    /// Logical name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Fully qualified Rust type name.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Decode a payload into this type.
    pub fn decode(&self, payload: &[u8]) -> Result<DecodedEvent> {
        (self.decoder)(payload)
    }
}

impl fmt::Debug for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventType")
            .field("name", &self.name)
            .field("type_name", &self.type_name)
            .finish()
    }
}

/// Type-erased handler invocation built at subscribe time.
pub(crate) trait ErasedHandler: Send + Sync {
    fn invoke(&self, event: DecodedEvent) -> BoxFuture<'static, Result<()>>;
}

struct TypedHandler<E, H, F> {
    factory: F,
    _marker: PhantomData<fn() -> (E, H)>,
}

impl<E, H, F> ErasedHandler for TypedHandler<E, H, F>
where
    E: Event,
    H: EventHandler<E>,
    F: Fn() -> H + Send + Sync + 'static,
{
    fn invoke(&self, event: DecodedEvent) -> BoxFuture<'static, Result<()>> {
        let handler = (self.factory)();
        Box::pin(async move {
            let event = event
                .downcast::<E>()
                .map_err(|_| BusError::UnknownEventType(E::event_name().to_string()))?;
            handler
                .handle(event)
                .await
                .map_err(|e| BusError::Handler {
                    handler: bare_type_name::<H>(),
                    message: e.to_string(),
                })
        })
    }
}

/// One handler registered for an event name.
#[derive(Clone)]
pub struct Registration {
    handler: HandlerId,
    invoker: Arc<dyn ErasedHandler>,
}

impl Registration {
    pub fn handler(&self) -> HandlerId {
        self.handler
    }

    /// Build a fresh handler and run it against `event`.
    pub(crate) fn invoke(&self, event: DecodedEvent) -> BoxFuture<'static, Result<()>> {
        self.invoker.invoke(event)
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("handler", &self.handler.name)
            .finish()
    }
}

#[derive(Default)]
struct Inner {
    handlers: HashMap<String, Vec<Registration>>,
    event_types: HashMap<String, EventType>,
    consuming: HashSet<String>,
}

/// Registry of handlers and event types, shared by subscribe and every delivery.
#[derive(Default)]
pub struct HandlerRegistry {
    inner: RwLock<Inner>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register handler type `H` for event type `E`.
    ///
    /// `factory` builds a fresh handler for every invocation. Records `E` as the
    /// concrete type of its logical name if not already known.
    pub async fn register<E, H, F>(&self, factory: F) -> Result<()>
    where
        E: Event,
        H: EventHandler<E>,
        F: Fn() -> H + Send + Sync + 'static,
    {
        let name = E::event_name();
        let handler = HandlerId::of::<H>();
        let mut inner = self.inner.write().await;

        if let Some(existing) = inner.event_types.get(name) {
            if existing.type_id != TypeId::of::<E>() {
                return Err(BusError::EventNameConflict {
                    name: name.to_string(),
                    existing: existing.type_name,
                    attempted: std::any::type_name::<E>(),
                });
            }
        }

        if inner
            .handlers
            .get(name)
            .is_some_and(|registered| registered.iter().any(|r| r.handler == handler))
        {
            return Err(BusError::DuplicateHandler {
                event: name.to_string(),
                handler: handler.name,
            });
        }

        inner
            .event_types
            .entry(name.to_string())
            .or_insert_with(EventType::of::<E>);

        let registrations = inner.handlers.entry(name.to_string()).or_default();
        registrations.push(Registration {
            handler,
            invoker: Arc::new(TypedHandler::<E, H, F> {
                factory,
                _marker: PhantomData,
            }),
        });

        debug!(
            event = %name,
            handler = %handler.name,
            handler_count = registrations.len(),
            "Handler registered"
        );

        Ok(())
    }

    /// Handlers registered for `event_name`, in registration order.
    ///
    /// Empty when nothing is registered.
    pub async fn lookup(&self, event_name: &str) -> Vec<Registration> {
        self.inner
            .read()
            .await
            .handlers
            .get(event_name)
            .cloned()
            .unwrap_or_default()
    }

    /// Concrete type registered under `event_name`.
    pub async fn resolve_type(&self, event_name: &str) -> Result<EventType> {
        self.inner
            .read()
            .await
            .event_types
            .get(event_name)
            .cloned()
            .ok_or_else(|| BusError::UnknownEventType(event_name.to_string()))
    }

    /// Names of handler types registered for `event_name`, in registration order.
    pub async fn handler_names(&self, event_name: &str) -> Vec<&'static str> {
        self.lookup(event_name)
            .await
            .iter()
            .map(|r| r.handler.name)
            .collect()
    }

    /// Every known logical event name, sorted.
    pub async fn event_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.read().await.event_types.keys().cloned().collect();
        names.sort();
        names
    }

    /// Whether a standing consumer is open for `event_name`.
    pub async fn is_consuming(&self, event_name: &str) -> bool {
        self.inner.read().await.consuming.contains(event_name)
    }

    /// Undo a registration whose consumer could not be opened.
    ///
    /// Drops the event type too when `handler` was the only registration.
    pub(crate) async fn unregister(&self, event_name: &str, handler: HandlerId) {
        let mut inner = self.inner.write().await;
        let Some(registrations) = inner.handlers.get_mut(event_name) else {
            return;
        };
        registrations.retain(|r| r.handler != handler);
        if registrations.is_empty() {
            inner.handlers.remove(event_name);
            inner.event_types.remove(event_name);
        }
        debug!(event = %event_name, handler = %handler.name, "Handler unregistered");
    }

    pub(crate) async fn mark_consuming(&self, event_name: &str) {
        self.inner
            .write()
            .await
            .consuming
            .insert(event_name.to_string());
    }
}
