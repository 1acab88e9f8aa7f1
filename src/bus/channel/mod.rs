//! In-memory channel-based transport for standalone mode.
//!
//! Emulates direct exchanges inside a single process: a message published to an
//! exchange reaches every queue bound with exactly its routing key. Each queue
//! is an unbounded tokio mpsc channel, so messages published before a consumer
//! attaches are buffered. Ideal for local development and testing without
//! external dependencies.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::{BusError, Delivery, DeliverySink, OutboundMessage, Result, Transport};

struct Queue {
    sender: mpsc::UnboundedSender<Delivery>,
    /// Taken by the queue's single consumer.
    receiver: Option<mpsc::UnboundedReceiver<Delivery>>,
}

impl Queue {
    fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Some(receiver),
        }
    }
}

#[derive(Default)]
struct Broker {
    /// Exchange name to `(routing_key, queue)` bindings.
    exchanges: HashMap<String, Vec<(String, String)>>,
    queues: HashMap<String, Queue>,
}

impl Broker {
    fn declare_queue(&mut self, name: &str) -> &mut Queue {
        self.queues.entry(name.to_string()).or_insert_with(Queue::new)
    }

    fn bind(&mut self, exchange: &str, routing_key: &str, queue: &str) {
        let bindings = self.exchanges.entry(exchange.to_string()).or_default();
        if !bindings.iter().any(|(rk, q)| rk == routing_key && q == queue) {
            bindings.push((routing_key.to_string(), queue.to_string()));
        }
    }

    /// Queues bound to `exchange` with exactly `routing_key`.
    fn route(&self, exchange: &str, routing_key: &str) -> Vec<String> {
        self.exchanges
            .get(exchange)
            .map(|bindings| {
                bindings
                    .iter()
                    .filter(|(rk, _)| rk == routing_key)
                    .map(|(_, queue)| queue.clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// In-memory transport with direct-exchange routing.
///
/// Clones share the same exchanges and queues, so one clone can publish while
/// another consumes.
#[derive(Clone, Default)]
pub struct ChannelTransport {
    broker: Arc<Mutex<Broker>>,
    consumers: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl ChannelTransport {
    pub fn new() -> Self {
        info!("Channel transport initialized");
        Self::default()
    }

    /// Messages waiting in `queue` that no consumer has taken yet.
    pub async fn pending(&self, queue: &str) -> usize {
        self.broker
            .lock()
            .await
            .queues
            .get(queue)
            .and_then(|q| q.receiver.as_ref())
            .map(|rx| rx.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn publish(&self, message: OutboundMessage) -> Result<()> {
        let mut broker = self.broker.lock().await;

        broker.declare_queue(&message.queue);
        broker.bind(&message.exchange, &message.routing_key, &message.queue);

        let targets = broker.route(&message.exchange, &message.routing_key);
        for queue in &targets {
            let delivery = Delivery {
                queue: queue.clone(),
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                body: message.body.clone(),
            };
            if let Some(q) = broker.queues.get(queue) {
                // A closed queue only happens after shutdown; the message is dropped.
                let _ = q.sender.send(delivery);
            }
        }

        debug!(
            exchange = %message.exchange,
            routing_key = %message.routing_key,
            queues = targets.len(),
            "Published message to channel"
        );

        Ok(())
    }

    async fn start_consumer(&self, queue: &str, sink: Arc<dyn DeliverySink>) -> Result<()> {
        let mut receiver = self
            .broker
            .lock()
            .await
            .declare_queue(queue)
            .receiver
            .take()
            .ok_or_else(|| {
                BusError::Transport(format!("Queue '{}' already has a consumer", queue))
            })?;

        let queue_name = queue.to_string();
        let handle = tokio::spawn(async move {
            while let Some(delivery) = receiver.recv().await {
                sink.deliver(delivery).await;
            }
            info!(queue = %queue_name, "Channel closed, stopping consumer");
        });
        self.consumers.lock().await.push(handle);

        info!(queue = %queue, "Channel consumer started");
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        let handles = std::mem::take(&mut *self.consumers.lock().await);
        for handle in &handles {
            handle.abort();
        }
        info!(consumers = handles.len(), "Channel transport shut down");
        Ok(())
    }
}
