//! Handler dispatch.
//!
//! Turns a delivered payload into handler invocations: resolve the logical name,
//! decode once, then run every registered handler in registration order.
//! Failures never leave the dispatcher; they are logged and handed to an
//! optional failure hook.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tracing::{debug, error, Instrument};

use super::{BusError, Delivery, DeliverySink, HandlerRegistry, Result};
use crate::config::DispatchConfig;

/// Observer for failures swallowed by the dispatcher.
///
/// Receives the logical event name and the error.
pub type FailureHook = Arc<dyn Fn(&str, &BusError) + Send + Sync>;

/// Outcome of processing one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchResult {
    /// No handler registered for the name; message discarded.
    NoHandlers,
    /// Every handler ran successfully.
    Handled(usize),
    /// Resolution, decoding or at least one handler failed.
    Failed,
}

impl DispatchResult {
    /// Returns true unless something failed.
    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Failed)
    }
}

/// Routes deliveries to the handlers in a [`HandlerRegistry`].
pub struct Dispatcher {
    registry: Arc<HandlerRegistry>,
    config: DispatchConfig,
    failure_hook: Option<FailureHook>,
}

impl Dispatcher {
    pub fn new(registry: Arc<HandlerRegistry>, config: DispatchConfig) -> Self {
        Self {
            registry,
            config,
            failure_hook: None,
        }
    }

    /// Observe every failure the dispatcher swallows.
    pub fn with_failure_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str, &BusError) + Send + Sync + 'static,
    {
        self.failure_hook = Some(Arc::new(hook));
        self
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    /// Process one delivery. Never fails.
    pub async fn on_delivery(&self, event_name: &str, payload: &[u8]) -> DispatchResult {
        match self.dispatch(event_name, payload).await {
            Ok(DispatchResult::NoHandlers) => {
                debug!(event = %event_name, "No handlers registered, message discarded");
                DispatchResult::NoHandlers
            }
            Ok(result) => result,
            Err(e) => {
                self.report(event_name, &e);
                DispatchResult::Failed
            }
        }
    }

    /// Process one delivery, returning resolution and decode errors.
    ///
    /// Handler failures abort the remaining handlers and are returned, unless
    /// `continue_on_handler_error` is set, in which case each one is reported and
    /// the fan-out goes on.
    pub async fn dispatch(&self, event_name: &str, payload: &[u8]) -> Result<DispatchResult> {
        let registrations = self.registry.lookup(event_name).await;
        if registrations.is_empty() {
            return Ok(DispatchResult::NoHandlers);
        }

        let event_type = self.registry.resolve_type(event_name).await?;
        let event = event_type.decode(payload)?;

        let mut failed = false;
        for registration in &registrations {
            let handler = registration.handler().name();
            let outcome = AssertUnwindSafe(registration.invoke(Arc::clone(&event)))
                .catch_unwind()
                .await
                .unwrap_or(Err(BusError::HandlerPanicked(handler)));

            match outcome {
                Ok(()) => debug!(event = %event_name, handler = %handler, "Handler completed"),
                Err(e) if self.config.continue_on_handler_error => {
                    self.report(event_name, &e);
                    failed = true;
                }
                Err(e) => return Err(e),
            }
        }

        if failed {
            Ok(DispatchResult::Failed)
        } else {
            Ok(DispatchResult::Handled(registrations.len()))
        }
    }

    fn report(&self, event_name: &str, error: &BusError) {
        error!(event = %event_name, error = %error, "Delivery processing failed");
        if let Some(hook) = &self.failure_hook {
            hook(event_name, error);
        }
    }
}

#[async_trait]
impl DeliverySink for Dispatcher {
    async fn deliver(&self, delivery: Delivery) {
        let span = tracing::info_span!(
            "bus.consume",
            event = %delivery.queue,
            routing_key = %delivery.routing_key
        );
        self.on_delivery(&delivery.queue, &delivery.body)
            .instrument(span)
            .await;
    }
}
