//! Event bus for async delivery.
//!
//! This module contains:
//! - `EventBus`: the facade producers and consumers talk to
//! - `Transport` trait: the broker seam (declare, send, consume)
//! - `HandlerRegistry` and `Dispatcher`: map a logical event name to typed handlers
//! - Implementations: AMQP (RabbitMQ), in-memory channel, Mock

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::config::{MessagingConfig, MessagingType};

// Implementation modules
#[cfg(feature = "amqp")]
pub mod amqp;
pub mod channel;
pub mod dispatch;
pub mod facade;
pub mod mock;
pub mod registry;

// Re-exports
#[cfg(feature = "amqp")]
pub use amqp::{AmqpConfig, AmqpTransport};
pub use channel::ChannelTransport;
pub use dispatch::{DispatchResult, Dispatcher, FailureHook};
pub use facade::EventBus;
pub use mock::MockTransport;
pub use registry::{EventType, HandlerId, HandlerRegistry, Registration};

// ============================================================================
// Errors
// ============================================================================

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Handler type {handler} already is registered for {event}")]
    DuplicateHandler { event: String, handler: &'static str },

    #[error("No event type registered for '{0}'")]
    UnknownEventType(String),

    #[error("Event name '{name}' already belongs to {existing}, cannot register {attempted}")]
    EventNameConflict {
        name: String,
        existing: &'static str,
        attempted: &'static str,
    },

    #[error("Failed to decode '{event}' payload: {source}")]
    PayloadDecode {
        event: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to encode '{event}': {source}")]
    Encode {
        event: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Handler '{handler}' failed: {message}")]
    Handler {
        handler: &'static str,
        message: String,
    },

    #[error("Handler '{0}' panicked")]
    HandlerPanicked(&'static str),

    #[error("No command handler registered for '{0}'")]
    NoCommandHandler(String),
}

// ============================================================================
// Transport
// ============================================================================

/// A serialized event addressed for publishing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Direct exchange to publish to.
    pub exchange: String,
    /// Queue declared and bound for the event (its logical name).
    pub queue: String,
    /// Routing key for both the binding and the publish.
    pub routing_key: String,
    /// UTF-8 JSON body.
    pub body: Vec<u8>,
}

/// A message delivered by a standing consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Queue the message was consumed from (the logical event name).
    pub queue: String,
    /// Exchange the message was published to.
    pub exchange: String,
    /// Routing key the message was published with.
    pub routing_key: String,
    /// Raw body.
    pub body: Vec<u8>,
}

/// Receives every delivery of a standing consumer.
///
/// Implementations must not fail: the consumer loop keeps running regardless
/// of what happens to an individual message.
#[async_trait]
pub trait DeliverySink: Send + Sync {
    async fn deliver(&self, delivery: Delivery);
}

/// Interface to the message broker.
///
/// Implementations:
/// - `AmqpTransport`: RabbitMQ via AMQP
/// - `ChannelTransport`: in-memory direct exchanges
/// - `MockTransport`: recording mock for testing
#[async_trait]
pub trait Transport: Send + Sync {
    /// Declare the exchange and queue, bind them, and send the message.
    ///
    /// Returns once the message is handed to the broker. No publisher confirms.
    async fn publish(&self, message: OutboundMessage) -> Result<()>;

    /// Open a standing consumer on `queue` feeding every delivery to `sink`.
    ///
    /// Errors setting up the consumer are returned; errors after that point
    /// stay inside the consumer.
    async fn start_consumer(&self, queue: &str, sink: Arc<dyn DeliverySink>) -> Result<()>;

    /// Stop every standing consumer opened by this transport.
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

// ============================================================================
// Factory
// ============================================================================

/// Initialize the transport selected by configuration.
///
/// AMQP requires the `amqp` feature (included in default).
pub async fn init_transport(config: &MessagingConfig) -> Result<Arc<dyn Transport>> {
    match config.messaging_type {
        MessagingType::Amqp => {
            #[cfg(feature = "amqp")]
            {
                let transport = AmqpTransport::new(AmqpConfig::from(&config.amqp)).await?;
                info!(messaging_type = "amqp", "Transport initialized");
                Ok(Arc::new(transport))
            }

            #[cfg(not(feature = "amqp"))]
            {
                Err(BusError::Transport(
                    "AMQP support requires the 'amqp' feature. Rebuild with --features amqp"
                        .to_string(),
                ))
            }
        }
        MessagingType::Channel => {
            info!(messaging_type = "channel", "Transport initialized");
            Ok(Arc::new(ChannelTransport::new()))
        }
    }
}
