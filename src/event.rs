//! Event model and wire codec.
//!
//! An event carries transport metadata (creation timestamp, exchange name and
//! routing key) next to its domain fields. On the wire an event is UTF-8 JSON
//! containing every field, with the metadata under PascalCase keys:
//!
//! ```json
//! {"OrderId":"A1","TimeStamp":"2024-05-01T10:00:00Z","ExchangeName":"orders.direct","RoutingKey":"OrderCreated"}
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::bus::{BusError, Result};

/// Error type returned by event and command handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Transport metadata shared by every event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EventMetadata {
    #[serde(rename = "TimeStamp")]
    timestamp: DateTime<Utc>,
    /// Exchange the event is published to.
    #[serde(default)]
    pub exchange_name: String,
    /// Routing key used to address the publish and bind the event's queue.
    #[serde(default)]
    pub routing_key: String,
}

impl EventMetadata {
    /// Create metadata stamped with the current time.
    pub fn new(exchange_name: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            exchange_name: exchange_name.into(),
            routing_key: routing_key.into(),
        }
    }

    /// When the event was constructed.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// A domain event that can cross the bus.
///
/// Implementors embed an [`EventMetadata`] with `#[serde(flatten)]` so the
/// metadata travels alongside the domain fields.
pub trait Event: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Transport metadata of this instance.
    fn metadata(&self) -> &EventMetadata;

    /// Logical name: queue name on publish, demultiplexing key on receive.
    fn event_name() -> &'static str
    where
        Self: Sized,
    {
        bare_type_name::<Self>()
    }
}

/// Handler for one event type.
///
/// A fresh handler is constructed for every delivery it processes.
#[async_trait]
pub trait EventHandler<E: Event>: Send + Sync + 'static {
    async fn handle(&self, event: Arc<E>) -> std::result::Result<(), HandlerError>;
}

/// Bare identifier of a type: module path and generic arguments stripped.
///
/// `my_app::events::OrderCreated` becomes `OrderCreated`.
pub fn bare_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let without_generics = full.split('<').next().unwrap_or(full);
    without_generics
        .rsplit("::")
        .next()
        .unwrap_or(without_generics)
}

/// Serialize an event to its JSON wire form.
pub fn encode_event<E: Event>(event: &E) -> Result<Vec<u8>> {
    serde_json::to_vec(event).map_err(|e| BusError::Encode {
        event: E::event_name().to_string(),
        source: e,
    })
}

/// Parse an event from its JSON wire form.
pub fn decode_event<E: Event>(payload: &[u8]) -> Result<E> {
    serde_json::from_slice(payload).map_err(|e| BusError::PayloadDecode {
        event: E::event_name().to_string(),
        source: e,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{OrderCreated, Wrapper};

    #[test]
    fn test_bare_type_name_strips_module_path() {
        assert_eq!(bare_type_name::<OrderCreated>(), "OrderCreated");
        assert_eq!(OrderCreated::event_name(), "OrderCreated");
    }

    #[test]
    fn test_bare_type_name_strips_generics() {
        assert_eq!(bare_type_name::<Wrapper<OrderCreated>>(), "Wrapper");
        assert_eq!(bare_type_name::<u32>(), "u32");
    }

    #[test]
    fn test_round_trip_preserves_all_fields() {
        let event = OrderCreated::new("A1", "orders.direct", "OrderCreated");

        let payload = encode_event(&event).unwrap();
        let decoded: OrderCreated = decode_event(&payload).unwrap();

        assert_eq!(decoded, event);
        assert_eq!(decoded.metadata().timestamp(), event.metadata().timestamp());
        assert_eq!(decoded.metadata().exchange_name, "orders.direct");
        assert_eq!(decoded.metadata().routing_key, "OrderCreated");
        assert_eq!(decoded.order_id, "A1");
    }

    #[test]
    fn test_wire_form_uses_pascal_case_keys() {
        let event = OrderCreated::new("A1", "orders.direct", "OrderCreated");
        let value: serde_json::Value =
            serde_json::from_slice(&encode_event(&event).unwrap()).unwrap();

        assert_eq!(value["OrderId"], "A1");
        assert_eq!(value["ExchangeName"], "orders.direct");
        assert_eq!(value["RoutingKey"], "OrderCreated");
        assert!(value["TimeStamp"].is_string());
    }

    #[test]
    fn test_decode_accepts_offset_timestamps() {
        let payload = br#"{"OrderId":"B2","TimeStamp":"2024-05-01T12:00:00.1234567+02:00","ExchangeName":"orders.direct","RoutingKey":"OrderCreated"}"#;

        let decoded: OrderCreated = decode_event(payload).unwrap();

        assert_eq!(decoded.order_id, "B2");
        assert_eq!(
            decoded.metadata().timestamp().to_rfc3339(),
            "2024-05-01T10:00:00.123456700+00:00"
        );
    }

    #[test]
    fn test_decode_malformed_payload() {
        let result = decode_event::<OrderCreated>(b"not json");
        assert!(matches!(
            result,
            Err(BusError::PayloadDecode { ref event, .. }) if event == "OrderCreated"
        ));
    }

    #[test]
    fn test_decode_schema_mismatch() {
        let result = decode_event::<OrderCreated>(br#"{"Unrelated":true}"#);
        assert!(matches!(result, Err(BusError::PayloadDecode { .. })));
    }
}
