//! Test utilities: sample events and recording handlers.
//!
//! Used by unit tests and, through the `test-utils` feature, by integration tests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::event::{Event, EventHandler, EventMetadata, HandlerError};

/// Order placed by a customer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct OrderCreated {
    pub order_id: String,
    #[serde(flatten)]
    pub meta: EventMetadata,
}

impl OrderCreated {
    pub fn new(
        order_id: impl Into<String>,
        exchange_name: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        Self {
            order_id: order_id.into(),
            meta: EventMetadata::new(exchange_name, routing_key),
        }
    }
}

impl Event for OrderCreated {
    fn metadata(&self) -> &EventMetadata {
        &self.meta
    }
}

/// Payment captured for an order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PaymentReceived {
    pub order_id: String,
    pub amount: f64,
    #[serde(flatten)]
    pub meta: EventMetadata,
}

impl PaymentReceived {
    pub fn new(order_id: impl Into<String>, amount: f64) -> Self {
        Self {
            order_id: order_id.into(),
            amount,
            meta: EventMetadata::new("payments.direct", "PaymentReceived"),
        }
    }
}

impl Event for PaymentReceived {
    fn metadata(&self) -> &EventMetadata {
        &self.meta
    }
}

/// Generic carrier, only used to check logical name derivation.
#[derive(Debug)]
pub struct Wrapper<T>(pub T);

/// A second type whose logical name collides with [`OrderCreated`].
pub mod legacy {
    use super::*;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub struct OrderCreated {
        pub legacy_id: u64,
        #[serde(flatten)]
        pub meta: EventMetadata,
    }

    impl Event for OrderCreated {
        fn metadata(&self) -> &EventMetadata {
            &self.meta
        }
    }
}

/// Shared, ordered record of handler activity.
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record(&self, entry: impl Into<String>) {
        self.entries.lock().await.push(entry.into());
    }

    pub async fn entries(&self) -> Vec<String> {
        self.entries.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Poll until at least `count` entries exist. Returns false on timeout.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.len().await >= count {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

macro_rules! recording_handler {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        ///
        /// Records `<Handler>:start:<order>` and `<Handler>:end:<order>`, pausing
        /// for `delay` in between.
        #[derive(Debug, Clone)]
        pub struct $name {
            log: CallLog,
            delay: Duration,
        }

        impl $name {
            pub fn new(log: CallLog) -> Self {
                Self {
                    log,
                    delay: Duration::ZERO,
                }
            }

            pub fn with_delay(log: CallLog, delay: Duration) -> Self {
                Self { log, delay }
            }
        }

        #[async_trait]
        impl EventHandler<OrderCreated> for $name {
            async fn handle(&self, event: Arc<OrderCreated>) -> Result<(), HandlerError> {
                self.log
                    .record(format!("{}:start:{}", stringify!($name), event.order_id))
                    .await;
                if !self.delay.is_zero() {
                    tokio::time::sleep(self.delay).await;
                }
                self.log
                    .record(format!("{}:end:{}", stringify!($name), event.order_id))
                    .await;
                Ok(())
            }
        }
    };
}

recording_handler!(
    /// Sends an order confirmation.
    SendConfirmationHandler
);
recording_handler!(
    /// Reserves stock for an order.
    ReserveStockHandler
);

/// Handler that always fails after recording the attempt.
#[derive(Debug, Clone)]
pub struct FailingHandler {
    log: CallLog,
}

impl FailingHandler {
    pub fn new(log: CallLog) -> Self {
        Self { log }
    }
}

#[async_trait]
impl EventHandler<OrderCreated> for FailingHandler {
    async fn handle(&self, event: Arc<OrderCreated>) -> Result<(), HandlerError> {
        self.log
            .record(format!("FailingHandler:{}", event.order_id))
            .await;
        Err(format!("cannot process order {}", event.order_id).into())
    }
}

/// Handler that panics.
#[derive(Debug, Default)]
pub struct PanickingHandler;

#[async_trait]
impl EventHandler<OrderCreated> for PanickingHandler {
    async fn handle(&self, event: Arc<OrderCreated>) -> Result<(), HandlerError> {
        panic!("handler blew up on {}", event.order_id);
    }
}

/// Handler with no behaviour, constructible through `Default`.
#[derive(Debug, Default)]
pub struct NoopHandler;

#[async_trait]
impl EventHandler<OrderCreated> for NoopHandler {
    async fn handle(&self, _event: Arc<OrderCreated>) -> Result<(), HandlerError> {
        Ok(())
    }
}

#[async_trait]
impl EventHandler<PaymentReceived> for NoopHandler {
    async fn handle(&self, _event: Arc<PaymentReceived>) -> Result<(), HandlerError> {
        Ok(())
    }
}

/// Handler for the colliding `legacy::OrderCreated`.
#[derive(Debug, Default)]
pub struct LegacyHandler;

#[async_trait]
impl EventHandler<legacy::OrderCreated> for LegacyHandler {
    async fn handle(&self, _event: Arc<legacy::OrderCreated>) -> Result<(), HandlerError> {
        Ok(())
    }
}

/// Serialize an `OrderCreated` for feeding straight into a dispatcher.
pub fn order_payload(order_id: &str) -> Vec<u8> {
    crate::event::encode_event(&OrderCreated::new(order_id, "orders.direct", "OrderCreated"))
        .expect("OrderCreated serializes")
}
