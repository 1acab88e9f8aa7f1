//! rabbitbus - event bus facade
//!
//! Bridges two dispatch paths: commands forwarded to an in-process mediator,
//! and domain events published and consumed through a message broker with a
//! typed handler registry on the receiving side.

pub mod bus;
pub mod command;
pub mod config;
pub mod event;
pub mod utils;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use bus::{BusError, EventBus, Result};
pub use command::{Command, CommandHandler, CommandRouter, Mediator};
pub use event::{Event, EventHandler, EventMetadata, HandlerError};
