//! rabbitbus-demo: publish an event and watch it come back
//!
//! Subscribes a logging handler to `OrderCreated`, publishes one event and
//! waits for the standing consumer to dispatch it.
//!
//! ## Configuration
//! - RABBITBUS_CONFIG: Path to a YAML config file (optional)
//! - RABBITBUS__MESSAGING__TYPE: `amqp` (default) or `channel`
//! - RABBITBUS__MESSAGING__AMQP__URL: Broker URL
//! - RABBITBUS_LOG: Log filter (default: info)

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::info;

use rabbitbus::config::Config;
use rabbitbus::utils::bootstrap::{build_event_bus, init_tracing};
use rabbitbus::{CommandRouter, Event, EventHandler, EventMetadata, HandlerError};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct OrderCreated {
    order_id: String,
    #[serde(flatten)]
    meta: EventMetadata,
}

impl Event for OrderCreated {
    fn metadata(&self) -> &EventMetadata {
        &self.meta
    }
}

struct LogOrder {
    received: Arc<Notify>,
}

#[async_trait]
impl EventHandler<OrderCreated> for LogOrder {
    async fn handle(&self, event: Arc<OrderCreated>) -> Result<(), HandlerError> {
        info!(
            order_id = %event.order_id,
            created_at = %event.meta.timestamp(),
            "Order received"
        );
        self.received.notify_one();
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = Config::load(None)?;
    let bus = build_event_bus(&config, Arc::new(CommandRouter::new())).await?;

    let received = Arc::new(Notify::new());
    let handler_signal = received.clone();
    bus.subscribe_with::<OrderCreated, _, _>(move || LogOrder {
        received: handler_signal.clone(),
    })
    .await?;

    bus.publish(OrderCreated {
        order_id: "A1".to_string(),
        meta: EventMetadata::new("orders.direct", "OrderCreated"),
    })
    .await?;

    match tokio::time::timeout(Duration::from_secs(10), received.notified()).await {
        Ok(()) => info!("rabbitbus-demo finished"),
        Err(_) => info!("No delivery within 10s"),
    }

    bus.shutdown().await?;
    Ok(())
}
