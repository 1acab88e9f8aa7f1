//! Messaging and transport configuration types.

use std::time::Duration;

use serde::Deserialize;

/// Messaging type discriminator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessagingType {
    /// AMQP/RabbitMQ messaging.
    #[default]
    Amqp,
    /// In-memory channel messaging (no external broker).
    Channel,
}

/// Messaging configuration (discriminated union).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// Messaging type discriminator.
    #[serde(rename = "type")]
    pub messaging_type: MessagingType,
    /// AMQP-specific configuration.
    pub amqp: AmqpSettings,
}

/// AMQP-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AmqpSettings {
    /// AMQP connection URL.
    pub url: String,
    /// Upper bound on connection and channel setup.
    pub connect_timeout_ms: u64,
    /// Maximum pooled publisher connections.
    pub pool_size: usize,
    /// First delay when a standing consumer reconnects.
    pub reconnect_min_delay_ms: u64,
    /// Largest delay between consumer reconnect attempts.
    pub reconnect_max_delay_ms: u64,
}

impl AmqpSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Default for AmqpSettings {
    fn default() -> Self {
        Self {
            url: "amqp://localhost:5672".to_string(),
            connect_timeout_ms: 5_000,
            pool_size: 10,
            reconnect_min_delay_ms: 100,
            reconnect_max_delay_ms: 30_000,
        }
    }
}
