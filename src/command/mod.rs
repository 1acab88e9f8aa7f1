//! In-process command forwarding.
//!
//! Commands carry no transport metadata. The bus hands each one to a single
//! [`Mediator`] and waits for it to finish. [`CommandRouter`] is the provided
//! mediator: one handler per command type.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::bus::{BusError, Result};
use crate::event::{bare_type_name, HandlerError};

/// A command dispatched in-process.
pub trait Command: Send + Sync + 'static {
    fn command_name() -> &'static str
    where
        Self: Sized,
    {
        bare_type_name::<Self>()
    }
}

/// Handler for one command type.
#[async_trait]
pub trait CommandHandler<C: Command>: Send + Sync + 'static {
    async fn handle(&self, command: C) -> std::result::Result<(), HandlerError>;
}

/// A type-erased command on its way to the mediator.
pub struct CommandEnvelope {
    name: &'static str,
    type_id: TypeId,
    command: Box<dyn Any + Send + Sync>,
}

impl CommandEnvelope {
    pub fn new<C: Command>(command: C) -> Self {
        Self {
            name: C::command_name(),
            type_id: TypeId::of::<C>(),
            command: Box::new(command),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn command_type(&self) -> TypeId {
        self.type_id
    }

    /// Recover the typed command, or get the envelope back on mismatch.
    pub fn downcast<C: Command>(self) -> std::result::Result<C, Self> {
        let Self {
            name,
            type_id,
            command,
        } = self;
        command.downcast::<C>().map(|c| *c).map_err(|command| Self {
            name,
            type_id,
            command,
        })
    }
}

impl std::fmt::Debug for CommandEnvelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandEnvelope")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// The in-process collaborator commands are forwarded to.
#[async_trait]
pub trait Mediator: Send + Sync {
    async fn send(&self, command: CommandEnvelope) -> Result<()>;
}

trait ErasedCommandHandler: Send + Sync {
    fn handle(&self, command: CommandEnvelope) -> BoxFuture<'_, Result<()>>;
}

struct TypedCommandHandler<C, H> {
    handler: H,
    _marker: PhantomData<fn() -> C>,
}

impl<C, H> ErasedCommandHandler for TypedCommandHandler<C, H>
where
    C: Command,
    H: CommandHandler<C>,
{
    fn handle(&self, envelope: CommandEnvelope) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let name = envelope.name();
            let command = envelope
                .downcast::<C>()
                .map_err(|_| BusError::NoCommandHandler(name.to_string()))?;
            self.handler
                .handle(command)
                .await
                .map_err(|e| BusError::Handler {
                    handler: bare_type_name::<H>(),
                    message: e.to_string(),
                })
        })
    }
}

/// Mediator routing each command type to exactly one handler.
#[derive(Default)]
pub struct CommandRouter {
    handlers: RwLock<HashMap<TypeId, Arc<dyn ErasedCommandHandler>>>,
}

impl CommandRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for command type `C`. A command has at most one handler.
    pub async fn register<C, H>(&self, handler: H) -> Result<()>
    where
        C: Command,
        H: CommandHandler<C>,
    {
        let mut handlers = self.handlers.write().await;
        if handlers.contains_key(&TypeId::of::<C>()) {
            return Err(BusError::DuplicateHandler {
                event: C::command_name().to_string(),
                handler: bare_type_name::<H>(),
            });
        }
        handlers.insert(
            TypeId::of::<C>(),
            Arc::new(TypedCommandHandler {
                handler,
                _marker: PhantomData,
            }),
        );
        info!(
            command = %C::command_name(),
            handler = %bare_type_name::<H>(),
            "Command handler registered"
        );
        Ok(())
    }
}

#[async_trait]
impl Mediator for CommandRouter {
    async fn send(&self, command: CommandEnvelope) -> Result<()> {
        let handler = self
            .handlers
            .read()
            .await
            .get(&command.command_type())
            .cloned()
            .ok_or_else(|| BusError::NoCommandHandler(command.name().to_string()))?;

        debug!(command = %command.name(), "Dispatching command");
        handler.handle(command).await
    }
}
