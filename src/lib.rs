//! Tessera - reactive state units with per-event concurrency control
//!
//! A unit holds an immutable state value, accepts typed events, routes each
//! event to at most one registered handler and publishes every resulting
//! state on a change stream. Each handler chooses how concurrent
//! occurrences of its events interact: run in parallel, queue in order,
//! restart on the latest, or drop while busy.

pub mod config;
pub mod context;
pub mod error;
pub mod error_channel;
mod pipeline;
pub mod registry;
pub mod state;
pub mod strategy;
pub mod unit;
pub mod utils;

pub use config::{ConfigError, UnitConfig};
pub use context::{Context, ExecutionToken};
pub use error::{HandlerError, HandlerResult, Result, UnitError};
pub use error_channel::{ErrorCallback, ErrorRecord, ErrorStream};
pub use registry::{
    handler_fn, sync_handler, Event, EventHandler, HandlerConfig, HandlerKey, HandlerRegistry,
    Identifier, Matcher,
};
pub use state::{StateCell, StateStream};
pub use strategy::ConcurrencyStrategy;
pub use unit::{create_unit, PipeUnit, StateUnit, Unit, UnitBuilder, UnitId};
