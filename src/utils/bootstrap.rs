//! Bootstrap utilities for rabbitbus binaries.

use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::bus::{init_transport, Dispatcher, EventBus, HandlerRegistry, Result};
use crate::command::Mediator;
use crate::config::{Config, LOG_ENV_VAR};

/// Initialize tracing with the RABBITBUS_LOG environment variable.
///
/// Defaults to "info" level if RABBITBUS_LOG is not set.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Build the process-wide bus from configuration.
pub async fn build_event_bus(config: &Config, mediator: Arc<dyn Mediator>) -> Result<EventBus> {
    let transport = init_transport(&config.messaging).await?;
    let dispatcher = Dispatcher::new(Arc::new(HandlerRegistry::new()), config.dispatch.clone());
    Ok(EventBus::with_dispatcher(transport, mediator, dispatcher))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandRouter;
    use crate::config::DispatchConfig;

    #[tokio::test]
    async fn test_build_event_bus_from_test_config() {
        let mut config = Config::for_test();
        config.dispatch = DispatchConfig {
            continue_on_handler_error: true,
        };

        let bus = build_event_bus(&config, Arc::new(CommandRouter::new()))
            .await
            .unwrap();

        assert!(bus.registry().event_names().await.is_empty());
    }
}
