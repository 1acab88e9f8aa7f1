//! The event bus facade.
//!
//! One `EventBus` is constructed per process and shared (behind an `Arc`) by
//! every producer and consumer. It forwards commands to the in-process
//! mediator, publishes events through the transport and owns the handler
//! registry that standing consumers dispatch into.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{
    BusError, Dispatcher, HandlerId, HandlerRegistry, OutboundMessage, Result, Transport,
};
use crate::command::{Command, CommandEnvelope, Mediator};
use crate::config::DispatchConfig;
use crate::event::{encode_event, Event, EventHandler};

/// Facade over command forwarding and broker-backed publish/subscribe.
pub struct EventBus {
    transport: Arc<dyn Transport>,
    mediator: Arc<dyn Mediator>,
    registry: Arc<HandlerRegistry>,
    dispatcher: Arc<Dispatcher>,
    /// Serializes subscribe so an event name never gets two consumers.
    subscribe_lock: Mutex<()>,
}

impl EventBus {
    /// Create a bus with the default dispatch policy.
    pub fn new(transport: Arc<dyn Transport>, mediator: Arc<dyn Mediator>) -> Self {
        let registry = Arc::new(HandlerRegistry::new());
        let dispatcher = Dispatcher::new(Arc::clone(&registry), DispatchConfig::default());
        Self::with_dispatcher(transport, mediator, dispatcher)
    }

    /// Create a bus around a preconfigured dispatcher (policy, failure hook).
    ///
    /// The bus registers handlers into the dispatcher's registry.
    pub fn with_dispatcher(
        transport: Arc<dyn Transport>,
        mediator: Arc<dyn Mediator>,
        dispatcher: Dispatcher,
    ) -> Self {
        Self {
            transport,
            mediator,
            registry: Arc::clone(dispatcher.registry()),
            dispatcher: Arc::new(dispatcher),
            subscribe_lock: Mutex::new(()),
        }
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Hand a command to the in-process mediator and wait for it to complete.
    pub async fn send_command<C: Command>(&self, command: C) -> Result<()> {
        let envelope = CommandEnvelope::new(command);
        debug!(command = %envelope.name(), "Sending command");
        self.mediator.send(envelope).await
    }

    /// Serialize `event` and hand it to the transport.
    ///
    /// Declares the event's direct exchange and its queue (named after the
    /// logical event name), binds them with the routing key and sends. Success
    /// means the broker accepted the message, not that anyone consumed it.
    pub async fn publish<E: Event>(&self, event: E) -> Result<()> {
        let meta = event.metadata();
        if meta.exchange_name.is_empty() {
            return Err(BusError::InvalidEvent(format!(
                "{} has no exchange name",
                E::event_name()
            )));
        }

        let message = OutboundMessage {
            exchange: meta.exchange_name.clone(),
            queue: E::event_name().to_string(),
            routing_key: meta.routing_key.clone(),
            body: encode_event(&event)?,
        };

        self.transport.publish(message).await
    }

    /// Register handler type `H` for event type `E`, built with `H::default()`.
    pub async fn subscribe<E, H>(&self) -> Result<()>
    where
        E: Event,
        H: EventHandler<E> + Default,
    {
        self.subscribe_with::<E, H, _>(H::default).await
    }

    /// Register handler type `H` for event type `E`, built by `factory` for
    /// every delivery.
    ///
    /// The first subscription for an event name opens its standing consumer;
    /// later handlers for the same name join the in-process fan-out. A
    /// duplicate registration fails before any transport interaction. If the
    /// consumer cannot be opened the registration is rolled back, so the same
    /// subscribe can be retried.
    pub async fn subscribe_with<E, H, F>(&self, factory: F) -> Result<()>
    where
        E: Event,
        H: EventHandler<E>,
        F: Fn() -> H + Send + Sync + 'static,
    {
        let _guard = self.subscribe_lock.lock().await;
        let name = E::event_name();

        self.registry.register::<E, H, F>(factory).await?;

        if !self.registry.is_consuming(name).await {
            if let Err(e) = self
                .transport
                .start_consumer(name, self.dispatcher.clone())
                .await
            {
                self.registry.unregister(name, HandlerId::of::<H>()).await;
                return Err(e);
            }
            self.registry.mark_consuming(name).await;
            info!(event = %name, "Standing consumer opened");
        }

        Ok(())
    }

    /// Stop every standing consumer.
    pub async fn shutdown(&self) -> Result<()> {
        self.transport.shutdown().await
    }
}
