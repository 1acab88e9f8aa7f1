//! AMQP (RabbitMQ) transport implementation.
//!
//! Uses one direct exchange per event family. Each event type gets a queue named
//! after its logical name, bound to the exchange with the event's routing key.
//!
//! Publishing borrows a pooled connection and opens a private channel for the
//! duration of the call. Every standing consumer owns a dedicated connection,
//! reconnects with backoff if its stream ends, and closes the connection when
//! the transport shuts down.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::{BackoffBuilder, ExponentialBuilder};
use deadpool_lapin::{Manager, Pool, PoolError};
use futures::StreamExt;
use lapin::{
    options::{
        BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind,
};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::{BusError, Delivery, DeliverySink, OutboundMessage, Result, Transport};
use crate::config::AmqpSettings;

/// AMQP reply code for a normal close.
const REPLY_SUCCESS: u16 = 200;

/// Configuration for AMQP connections.
#[derive(Clone, Debug)]
pub struct AmqpConfig {
    /// AMQP connection URL (e.g., amqp://localhost:5672).
    pub url: String,
    /// Upper bound on connection and channel setup.
    pub connect_timeout: Duration,
    /// Maximum pooled publisher connections.
    pub pool_size: usize,
    /// First delay when a consumer reconnects.
    pub reconnect_min_delay: Duration,
    /// Largest delay between consumer reconnect attempts.
    pub reconnect_max_delay: Duration,
}

impl AmqpConfig {
    /// Config with default timeouts for `url`.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::from(&AmqpSettings::default())
        }
    }
}

impl From<&AmqpSettings> for AmqpConfig {
    fn from(settings: &AmqpSettings) -> Self {
        Self {
            url: settings.url.clone(),
            connect_timeout: settings.connect_timeout(),
            pool_size: settings.pool_size,
            reconnect_min_delay: Duration::from_millis(settings.reconnect_min_delay_ms),
            reconnect_max_delay: Duration::from_millis(settings.reconnect_max_delay_ms),
        }
    }
}

/// Run `fut`, failing with `BusError::Timeout` after `limit`.
async fn within<T, F>(limit: Duration, what: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| BusError::Timeout(format!("{} exceeded {:?}", what, limit)))?
}

fn transport_error(what: &str) -> impl FnOnce(lapin::Error) -> BusError + '_ {
    move |e| BusError::Transport(format!("{}: {}", what, e))
}

/// Signal consumer tasks to close their connections and wait up to `grace`
/// for each. Tasks still running after that (stuck in a handler) are aborted.
///
/// Returns how many stopped on their own.
async fn stop_consumers(
    handles: Vec<JoinHandle<()>>,
    signal: &watch::Sender<bool>,
    grace: Duration,
) -> usize {
    signal.send_replace(true);

    let mut stopped = 0;
    for mut handle in handles {
        match tokio::time::timeout(grace, &mut handle).await {
            Ok(_) => stopped += 1,
            Err(_) => handle.abort(),
        }
    }
    stopped
}

/// RabbitMQ transport.
pub struct AmqpTransport {
    pool: Pool,
    config: AmqpConfig,
    consumers: Mutex<Vec<JoinHandle<()>>>,
    /// Flipped to `true` to stop every standing consumer.
    shutdown_tx: watch::Sender<bool>,
}

impl AmqpTransport {
    /// Create a transport and verify the broker is reachable.
    pub async fn new(config: AmqpConfig) -> Result<Self> {
        let manager = Manager::new(config.url.clone(), ConnectionProperties::default());
        let pool = Pool::builder(manager)
            .max_size(config.pool_size)
            .build()
            .map_err(|e| BusError::Transport(format!("Failed to create pool: {}", e)))?;

        let transport = Self {
            pool,
            config,
            consumers: Mutex::new(Vec::new()),
            shutdown_tx: watch::channel(false).0,
        };

        // Verify connection
        let channel = transport.get_channel().await?;
        let _ = channel.close(REPLY_SUCCESS, "OK").await;

        info!(url = %transport.config.url, "Connected to AMQP");

        Ok(transport)
    }

    /// Open a private channel on a pooled connection.
    async fn get_channel(&self) -> Result<Channel> {
        within(self.config.connect_timeout, "AMQP channel setup", async {
            let conn = self.pool.get().await.map_err(|e: PoolError| {
                BusError::Transport(format!("Failed to get connection from pool: {}", e))
            })?;

            conn.create_channel()
                .await
                .map_err(transport_error("Failed to create channel"))
        })
        .await
    }

    /// Declare the topology for one message and send it.
    async fn publish_on(channel: &Channel, message: &OutboundMessage) -> Result<()> {
        channel
            .exchange_declare(
                &message.exchange,
                ExchangeKind::Direct,
                ExchangeDeclareOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(transport_error("Failed to declare exchange"))?;

        channel
            .queue_declare(
                &message.queue,
                QueueDeclareOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(transport_error("Failed to declare queue"))?;

        channel
            .queue_bind(
                &message.queue,
                &message.exchange,
                &message.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(transport_error("Failed to bind queue"))?;

        // Confirms are not enabled on the channel, so the returned confirmation
        // resolves immediately and is dropped.
        channel
            .basic_publish(
                &message.exchange,
                &message.routing_key,
                BasicPublishOptions::default(),
                &message.body,
                BasicProperties::default().with_content_type("application/json".into()),
            )
            .await
            .map_err(transport_error("Failed to publish"))?;

        Ok(())
    }

    /// Connect, declare the queue and start an auto-ack consumer on it.
    async fn setup_consumer(config: &AmqpConfig, queue: &str) -> Result<(Connection, Consumer)> {
        within(config.connect_timeout, "AMQP consumer setup", async {
            let connection = Connection::connect(&config.url, ConnectionProperties::default())
                .await
                .map_err(transport_error("Failed to connect"))?;

            let channel = connection
                .create_channel()
                .await
                .map_err(transport_error("Failed to create channel"))?;

            channel
                .queue_declare(queue, QueueDeclareOptions::default(), FieldTable::default())
                .await
                .map_err(transport_error("Failed to declare queue"))?;

            let consumer = channel
                .basic_consume(
                    queue,
                    &format!("rabbitbus-{}-{}", queue, uuid::Uuid::new_v4()),
                    BasicConsumeOptions {
                        no_ack: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(transport_error("Failed to start consumer"))?;

            Ok((connection, consumer))
        })
        .await
    }

    /// Feed deliveries to `sink` until `shutdown` fires, reconnecting with
    /// exponential backoff and jitter whenever the stream ends.
    ///
    /// The connection is closed before the task returns.
    async fn consume_with_reconnect(
        config: AmqpConfig,
        queue: String,
        sink: Arc<dyn DeliverySink>,
        mut connection: Connection,
        mut consumer: Consumer,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let backoff_builder = ExponentialBuilder::default()
            .with_min_delay(config.reconnect_min_delay)
            .with_max_delay(config.reconnect_max_delay)
            .with_jitter();

        loop {
            loop {
                let delivery = tokio::select! {
                    _ = shutdown.changed() => {
                        let _ = connection.close(REPLY_SUCCESS, "Shutdown").await;
                        info!(queue = %queue, "Consumer stopped");
                        return;
                    }
                    next = consumer.next() => next,
                };

                match delivery {
                    Some(Ok(delivery)) => {
                        debug!(
                            queue = %queue,
                            routing_key = %delivery.routing_key,
                            "Received message"
                        );
                        sink.deliver(Delivery {
                            queue: queue.clone(),
                            exchange: delivery.exchange.as_str().to_string(),
                            routing_key: delivery.routing_key.as_str().to_string(),
                            body: delivery.data,
                        })
                        .await;
                    }
                    Some(Err(e)) => {
                        error!(
                            queue = %queue,
                            error = %e,
                            "Consumer delivery error, will reconnect"
                        );
                        break;
                    }
                    None => break,
                }
            }

            info!(queue = %queue, "Consumer stream ended, reconnecting...");
            let _ = connection.close(REPLY_SUCCESS, "Reconnecting").await;

            let mut backoff = backoff_builder.build();
            loop {
                match Self::setup_consumer(&config, &queue).await {
                    Ok((conn, cons)) => {
                        info!(queue = %queue, "Consumer reconnected");
                        connection = conn;
                        consumer = cons;
                        break;
                    }
                    Err(e) => {
                        let delay = backoff.next().unwrap_or(config.reconnect_max_delay);
                        error!(
                            error = %e,
                            backoff_ms = %delay.as_millis(),
                            queue = %queue,
                            "Failed to set up consumer, retrying after backoff"
                        );
                        tokio::select! {
                            _ = shutdown.changed() => {
                                info!(queue = %queue, "Consumer stopped while reconnecting");
                                return;
                            }
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    #[tracing::instrument(
        name = "bus.publish",
        skip_all,
        fields(exchange = %message.exchange, routing_key = %message.routing_key)
    )]
    async fn publish(&self, message: OutboundMessage) -> Result<()> {
        let channel = self.get_channel().await?;
        let result = Self::publish_on(&channel, &message).await;

        if let Err(e) = channel.close(REPLY_SUCCESS, "OK").await {
            debug!(error = %e, "Failed to close publish channel");
        }

        if result.is_ok() {
            debug!(
                exchange = %message.exchange,
                queue = %message.queue,
                routing_key = %message.routing_key,
                "Published message"
            );
        }
        result
    }

    async fn start_consumer(&self, queue: &str, sink: Arc<dyn DeliverySink>) -> Result<()> {
        let (connection, consumer) = Self::setup_consumer(&self.config, queue).await?;

        info!(queue = %queue, "Consumer connected, processing messages");

        let handle = tokio::spawn(Self::consume_with_reconnect(
            self.config.clone(),
            queue.to_string(),
            sink,
            connection,
            consumer,
            self.shutdown_tx.subscribe(),
        ));
        self.consumers.lock().await.push(handle);

        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        let handles = std::mem::take(&mut *self.consumers.lock().await);
        let total = handles.len();
        let stopped = stop_consumers(handles, &self.shutdown_tx, self.config.connect_timeout).await;
        self.pool.close();
        info!(consumers = total, stopped, "AMQP transport shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = AmqpConfig::new("amqp://broker:5672");
        assert_eq!(config.url, "amqp://broker:5672");
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
        assert_eq!(config.pool_size, 10);
    }

    #[test]
    fn test_config_from_settings() {
        let settings = AmqpSettings {
            url: "amqp://other:5672".to_string(),
            connect_timeout_ms: 750,
            pool_size: 2,
            reconnect_min_delay_ms: 10,
            reconnect_max_delay_ms: 20,
        };

        let config = AmqpConfig::from(&settings);

        assert_eq!(config.connect_timeout, Duration::from_millis(750));
        assert_eq!(config.pool_size, 2);
        assert_eq!(config.reconnect_min_delay, Duration::from_millis(10));
        assert_eq!(config.reconnect_max_delay, Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_within_times_out() {
        let result: Result<()> = within(Duration::from_millis(10), "slow setup", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        assert!(matches!(result, Err(BusError::Timeout(ref msg)) if msg.starts_with("slow setup")));
    }

    #[tokio::test]
    async fn test_stop_consumers_lets_tasks_close_cleanly() {
        let (signal, _) = watch::channel(false);
        let (closed_tx, closed_rx) = tokio::sync::oneshot::channel();
        let mut receiver = signal.subscribe();
        let handle = tokio::spawn(async move {
            let _ = receiver.changed().await;
            let _ = closed_tx.send("closed");
        });

        let stopped = stop_consumers(vec![handle], &signal, Duration::from_secs(1)).await;

        assert_eq!(stopped, 1);
        assert_eq!(closed_rx.await.unwrap(), "closed");
    }

    #[tokio::test]
    async fn test_stop_consumers_aborts_stuck_task() {
        let (signal, _) = watch::channel(false);
        let handle = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        let stopped = stop_consumers(vec![handle], &signal, Duration::from_millis(20)).await;

        assert_eq!(stopped, 0);
    }

    #[tokio::test]
    async fn test_unreachable_broker_fails() {
        let mut config = AmqpConfig::new("amqp://127.0.0.1:1");
        config.connect_timeout = Duration::from_millis(500);

        let result = AmqpTransport::new(config).await;

        assert!(matches!(
            result,
            Err(BusError::Transport(_)) | Err(BusError::Timeout(_))
        ));
    }
}
