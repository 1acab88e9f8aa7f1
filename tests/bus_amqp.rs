//! AMQP/RabbitMQ transport integration tests using testcontainers.
//!
//! Run with: cargo test --test bus_amqp --features amqp,test-utils -- --nocapture
//!
//! These tests spin up RabbitMQ in a container using testcontainers-rs.
//! No manual RabbitMQ setup required.

use std::sync::Arc;
use std::time::Duration;

use rabbitbus::bus::{AmqpConfig, AmqpTransport};
use rabbitbus::test_utils::{CallLog, OrderCreated, ReserveStockHandler, SendConfirmationHandler};
use rabbitbus::{CommandRouter, EventBus};
use testcontainers::{
    core::{IntoContainerPort, WaitFor},
    runners::AsyncRunner,
    GenericImage, ImageExt,
};

/// Start RabbitMQ container.
///
/// Returns (container, amqp_url) where amqp_url is suitable for AMQP connection.
async fn start_rabbitmq() -> (testcontainers::ContainerAsync<GenericImage>, String) {
    let image = GenericImage::new("rabbitmq", "3-management")
        .with_exposed_port(5672.tcp())
        .with_wait_for(WaitFor::message_on_stdout("Server startup complete"));

    let container = image
        .with_startup_timeout(Duration::from_secs(60))
        .start()
        .await
        .expect("Failed to start rabbitmq container");

    // Brief delay to ensure RabbitMQ is fully ready
    tokio::time::sleep(Duration::from_secs(2)).await;

    let host_port = container
        .get_host_port_ipv4(5672)
        .await
        .expect("Failed to get mapped port");

    let host = container
        .get_host()
        .await
        .expect("Failed to get container host");

    let amqp_url = format!("amqp://guest:guest@{}:{}", host, host_port);

    println!("RabbitMQ available at: {}", amqp_url);

    (container, amqp_url)
}

async fn amqp_bus(url: &str) -> EventBus {
    let transport = AmqpTransport::new(AmqpConfig::new(url))
        .await
        .expect("Failed to create transport");
    EventBus::new(Arc::new(transport), Arc::new(CommandRouter::new()))
}

#[tokio::test]
async fn test_publish_and_consume() {
    println!("=== AMQP Publish and Consume Test ===");

    let (_container, url) = start_rabbitmq().await;
    let bus = amqp_bus(&url).await;
    let log = CallLog::new();
    let handler_log = log.clone();

    bus.subscribe_with::<OrderCreated, _, _>(move || {
        SendConfirmationHandler::new(handler_log.clone())
    })
    .await
    .expect("Failed to subscribe");

    bus.publish(OrderCreated::new("A1", "orders.direct", "OrderCreated"))
        .await
        .expect("Failed to publish");

    assert!(log.wait_for(2, Duration::from_secs(5)).await, "Timed out waiting for delivery");
    assert_eq!(
        log.entries().await,
        vec!["SendConfirmationHandler:start:A1", "SendConfirmationHandler:end:A1"]
    );

    bus.shutdown().await.unwrap();
    println!("=== AMQP Publish and Consume Test PASSED ===");
}

#[tokio::test]
async fn test_separate_publisher_and_consumer_processes() {
    println!("=== AMQP Separate Buses Test ===");

    let (_container, url) = start_rabbitmq().await;
    let consumer_bus = amqp_bus(&url).await;
    let producer_bus = amqp_bus(&url).await;
    let log = CallLog::new();
    let first = log.clone();
    let second = log.clone();

    consumer_bus
        .subscribe_with::<OrderCreated, _, _>(move || SendConfirmationHandler::new(first.clone()))
        .await
        .unwrap();
    consumer_bus
        .subscribe_with::<OrderCreated, _, _>(move || ReserveStockHandler::new(second.clone()))
        .await
        .unwrap();

    for i in 0..10 {
        producer_bus
            .publish(OrderCreated::new(format!("order-{}", i), "orders.direct", "OrderCreated"))
            .await
            .unwrap();
    }

    // Two handlers, two entries each, ten messages.
    assert!(log.wait_for(40, Duration::from_secs(10)).await, "Timed out");

    consumer_bus.shutdown().await.unwrap();
    producer_bus.shutdown().await.unwrap();
    println!("=== AMQP Separate Buses Test PASSED ===");
}

#[tokio::test]
async fn test_malformed_message_is_consumed_and_skipped() {
    use rabbitbus::bus::{OutboundMessage, Transport};

    println!("=== AMQP Malformed Message Test ===");

    let (_container, url) = start_rabbitmq().await;
    let raw = AmqpTransport::new(AmqpConfig::new(&url)).await.unwrap();
    let bus = amqp_bus(&url).await;
    let log = CallLog::new();
    let handler_log = log.clone();

    bus.subscribe_with::<OrderCreated, _, _>(move || {
        SendConfirmationHandler::new(handler_log.clone())
    })
    .await
    .unwrap();

    raw.publish(OutboundMessage {
        exchange: "orders.direct".to_string(),
        queue: "OrderCreated".to_string(),
        routing_key: "OrderCreated".to_string(),
        body: b"not json".to_vec(),
    })
    .await
    .unwrap();
    bus.publish(OrderCreated::new("A2", "orders.direct", "OrderCreated"))
        .await
        .unwrap();

    assert!(log.wait_for(2, Duration::from_secs(5)).await, "Timed out");
    assert_eq!(log.entries().await[0], "SendConfirmationHandler:start:A2");

    bus.shutdown().await.unwrap();
    println!("=== AMQP Malformed Message Test PASSED ===");
}

#[tokio::test]
async fn test_shutdown_stops_consuming() {
    println!("=== AMQP Shutdown Test ===");

    let (_container, url) = start_rabbitmq().await;
    let first_bus = amqp_bus(&url).await;
    let log = CallLog::new();
    let first_log = log.clone();

    first_bus
        .subscribe_with::<OrderCreated, _, _>(move || {
            SendConfirmationHandler::new(first_log.clone())
        })
        .await
        .unwrap();
    first_bus.shutdown().await.unwrap();

    let producer_bus = amqp_bus(&url).await;
    producer_bus
        .publish(OrderCreated::new("late", "orders.direct", "OrderCreated"))
        .await
        .unwrap();

    // The stopped consumer no longer takes messages off the queue.
    assert!(!log.wait_for(1, Duration::from_secs(1)).await);

    let second_bus = amqp_bus(&url).await;
    let second_log = log.clone();
    second_bus
        .subscribe_with::<OrderCreated, _, _>(move || ReserveStockHandler::new(second_log.clone()))
        .await
        .unwrap();

    assert!(log.wait_for(2, Duration::from_secs(5)).await, "Timed out");
    assert_eq!(log.entries().await[0], "ReserveStockHandler:start:late");

    second_bus.shutdown().await.unwrap();
    producer_bus.shutdown().await.unwrap();
    println!("=== AMQP Shutdown Test PASSED ===");
}
