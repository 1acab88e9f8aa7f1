//! Mock transport implementation for testing.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{BusError, Delivery, DeliverySink, OutboundMessage, Result, Transport};

/// Mock transport for testing.
///
/// Records published messages and consumer queues; failures can be injected.
/// Tests push deliveries into an opened consumer with [`MockTransport::deliver`].
#[derive(Default)]
pub struct MockTransport {
    published: RwLock<Vec<OutboundMessage>>,
    consumers: RwLock<Vec<(String, Arc<dyn DeliverySink>)>>,
    fail_on_publish: RwLock<bool>,
    fail_on_consume: RwLock<bool>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_fail_on_publish(&self, fail: bool) {
        *self.fail_on_publish.write().await = fail;
    }

    pub async fn set_fail_on_consume(&self, fail: bool) {
        *self.fail_on_consume.write().await = fail;
    }

    pub async fn published_count(&self) -> usize {
        self.published.read().await.len()
    }

    pub async fn take_published(&self) -> Vec<OutboundMessage> {
        std::mem::take(&mut *self.published.write().await)
    }

    /// Queues with an open consumer, in the order they were opened.
    pub async fn consumer_queues(&self) -> Vec<String> {
        self.consumers
            .read()
            .await
            .iter()
            .map(|(queue, _)| queue.clone())
            .collect()
    }

    /// Hand `body` to every consumer of `queue`. Returns how many received it.
    pub async fn deliver(&self, queue: &str, routing_key: &str, body: Vec<u8>) -> usize {
        let sinks: Vec<Arc<dyn DeliverySink>> = self
            .consumers
            .read()
            .await
            .iter()
            .filter(|(q, _)| q == queue)
            .map(|(_, sink)| Arc::clone(sink))
            .collect();

        for sink in &sinks {
            sink.deliver(Delivery {
                queue: queue.to_string(),
                exchange: String::new(),
                routing_key: routing_key.to_string(),
                body: body.clone(),
            })
            .await;
        }
        sinks.len()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn publish(&self, message: OutboundMessage) -> Result<()> {
        if *self.fail_on_publish.read().await {
            return Err(BusError::Transport("Mock publish failure".to_string()));
        }
        self.published.write().await.push(message);
        Ok(())
    }

    async fn start_consumer(&self, queue: &str, sink: Arc<dyn DeliverySink>) -> Result<()> {
        if *self.fail_on_consume.read().await {
            return Err(BusError::Transport("Mock consume failure".to_string()));
        }
        self.consumers.write().await.push((queue.to_string(), sink));
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.consumers.write().await.clear();
        Ok(())
    }
}
