//! Units: reactive state containers driven by events.
//!
//! A [`Unit`] owns a state cell, a handler registry and a dispatch pipeline.
//! Events passed to [`Unit::add`] are routed to at most one handler, run
//! under that handler's concurrency strategy, and the resulting states are
//! published on [`Unit::changes`]. Handler failures surface on
//! [`Unit::errors`] without stopping the unit.
//!
//! # Example
//!
//! ```rust,ignore
//! use tessera::{ConcurrencyStrategy, Unit};
//!
//! let unit = Unit::builder(Counter { count: 0 })
//!     .on_with("INC", ConcurrencyStrategy::Sequential, |_event, ctx| async move {
//!         ctx.update(|s| Counter { count: s.count + 1 });
//!         Ok(())
//!     })
//!     .build();
//!
//! unit.add(CounterEvent::Inc);
//! ```

mod pipe;

pub use pipe::PipeUnit;

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use uuid::Uuid;

use crate::config::UnitConfig;
use crate::context::Context;
use crate::error::{HandlerResult, Result, UnitError};
use crate::error_channel::{ErrorCallback, ErrorRecord, ErrorStream};
use crate::pipeline::Core;
use crate::registry::{
    handler_fn, Event, HandlerConfig, HandlerKey, HandlerRegistry, Identifier, Matcher,
};
use crate::state::{StateCell, StateStream};
use crate::strategy::ConcurrencyStrategy;

/// Unique identity of a unit, attached to its log records and contexts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UnitId(Uuid);

impl UnitId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for UnitId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Surface shared by every kind of unit.
///
/// Lets collaborators that only observe and feed units (view bindings,
/// signal buses) treat handler-driven and source-driven units alike.
pub trait StateUnit<E, S>: Send + Sync {
    fn id(&self) -> UnitId;

    /// Dispatch an event. Never fails; misuse is logged.
    fn add(&self, event: E);

    /// Current state.
    fn state(&self) -> Arc<S>;

    /// Current state, then every distinct state until close.
    fn changes(&self) -> StateStream<S>;

    /// Failures from now until close.
    fn errors(&self) -> ErrorStream<E>;

    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Handler-driven unit.
///
/// Dropping the unit closes it.
pub struct Unit<E, S>
where
    E: Event,
    S: Send + Sync + 'static,
{
    core: Arc<Core<E, S>>,
}

impl<E, S> Unit<E, S>
where
    E: Event,
    S: Send + Sync + 'static,
{
    /// Start building a unit around `initial`.
    pub fn builder(initial: impl Into<Arc<S>>) -> UnitBuilder<E, S> {
        UnitBuilder::new(initial)
    }

    /// Create a unit with default configuration.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn new(initial: impl Into<Arc<S>>, registry: HandlerRegistry<E, S>) -> Self {
        Self::with_config(initial, registry, &UnitConfig::default(), None)
    }

    /// Create a unit with explicit configuration and error callback.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn with_config(
        initial: impl Into<Arc<S>>,
        registry: HandlerRegistry<E, S>,
        config: &UnitConfig,
        on_error: Option<ErrorCallback<E>>,
    ) -> Self {
        let cell = Arc::new(StateCell::new(initial));
        let core = Core::start(UnitId::new(), cell, registry, config, on_error);
        Self { core }
    }

    pub fn id(&self) -> UnitId {
        self.core.id()
    }

    /// Queue an event for dispatch. A no-op with a warning after close.
    pub fn add(&self, event: E) {
        self.core.add(event);
    }

    /// Queue an event, reporting [`UnitError::Closed`] instead of logging
    /// when the unit is closed.
    pub fn try_add(&self, event: E) -> Result<()> {
        if self.core.is_closed() {
            return Err(UnitError::Closed);
        }
        self.core.add(event);
        Ok(())
    }

    pub fn state(&self) -> Arc<S> {
        self.core.cell().get()
    }

    pub fn changes(&self) -> StateStream<S> {
        self.core.cell().changes()
    }

    pub fn errors(&self) -> ErrorStream<E> {
        self.core.errors()
    }

    /// Stop dispatch, abort in-flight executions and complete both streams.
    /// Idempotent.
    pub fn close(&self) {
        self.core.close();
    }

    pub fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    /// Register an async handler for an event kind at runtime.
    pub fn on<F, Fut>(&self, kind: impl Into<String>, f: F) -> &Self
    where
        F: Fn(Arc<E>, Context<S>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.core.register(HandlerConfig::new(
            Identifier::Kind(kind.into()),
            handler_fn(f),
        ));
        self
    }

    /// Register an async handler for an event kind with a strategy.
    pub fn on_with<F, Fut>(
        &self,
        kind: impl Into<String>,
        strategy: ConcurrencyStrategy,
        f: F,
    ) -> &Self
    where
        F: Fn(Arc<E>, Context<S>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.core.register(
            HandlerConfig::new(Identifier::Kind(kind.into()), handler_fn(f))
                .with_strategy(strategy),
        );
        self
    }

    /// Register an async handler behind a predicate at runtime.
    pub fn on_match<F, Fut>(
        &self,
        matcher: Matcher<E>,
        strategy: ConcurrencyStrategy,
        f: F,
    ) -> &Self
    where
        F: Fn(Arc<E>, Context<S>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.core
            .register(HandlerConfig::new(matcher, handler_fn(f)).with_strategy(strategy));
        self
    }

    /// Add or replace a registration. Returns the replaced one.
    pub fn register(&self, config: HandlerConfig<E, S>) -> Option<HandlerConfig<E, S>> {
        self.core.register(config)
    }

    /// Keys of the current registrations, in registration order.
    pub fn handler_keys(&self) -> Vec<HandlerKey> {
        self.core.handler_keys()
    }
}

impl<E, S> StateUnit<E, S> for Unit<E, S>
where
    E: Event,
    S: Send + Sync + 'static,
{
    fn id(&self) -> UnitId {
        Unit::id(self)
    }

    fn add(&self, event: E) {
        Unit::add(self, event)
    }

    fn state(&self) -> Arc<S> {
        Unit::state(self)
    }

    fn changes(&self) -> StateStream<S> {
        Unit::changes(self)
    }

    fn errors(&self) -> ErrorStream<E> {
        Unit::errors(self)
    }

    fn close(&self) {
        Unit::close(self)
    }

    fn is_closed(&self) -> bool {
        Unit::is_closed(self)
    }
}

impl<E, S> Drop for Unit<E, S>
where
    E: Event,
    S: Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.core.close();
    }
}

impl<E, S> fmt::Debug for Unit<E, S>
where
    E: Event,
    S: Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unit")
            .field("id", &self.core.id())
            .field("closed", &self.core.is_closed())
            .finish_non_exhaustive()
    }
}

/// Builder for [`Unit`].
pub struct UnitBuilder<E, S> {
    initial: Arc<S>,
    registry: HandlerRegistry<E, S>,
    config: UnitConfig,
    on_error: Option<ErrorCallback<E>>,
}

impl<E, S> UnitBuilder<E, S>
where
    E: Event,
    S: Send + Sync + 'static,
{
    pub fn new(initial: impl Into<Arc<S>>) -> Self {
        Self {
            initial: initial.into(),
            registry: HandlerRegistry::new(),
            config: UnitConfig::default(),
            on_error: None,
        }
    }

    pub fn on<F, Fut>(mut self, kind: impl Into<String>, f: F) -> Self
    where
        F: Fn(Arc<E>, Context<S>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.registry = self.registry.on(kind, f);
        self
    }

    pub fn on_with<F, Fut>(
        mut self,
        kind: impl Into<String>,
        strategy: ConcurrencyStrategy,
        f: F,
    ) -> Self
    where
        F: Fn(Arc<E>, Context<S>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.registry = self.registry.on_with(kind, strategy, f);
        self
    }

    pub fn on_sync<F>(mut self, kind: impl Into<String>, f: F) -> Self
    where
        F: Fn(&E, &Context<S>) -> HandlerResult + Send + Sync + 'static,
    {
        self.registry = self.registry.on_sync(kind, f);
        self
    }

    pub fn on_match<F, Fut>(
        mut self,
        matcher: Matcher<E>,
        strategy: ConcurrencyStrategy,
        f: F,
    ) -> Self
    where
        F: Fn(Arc<E>, Context<S>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.registry = self.registry.on_match(matcher, strategy, f);
        self
    }

    /// Add a prepared registration.
    pub fn handler(mut self, config: HandlerConfig<E, S>) -> Self {
        self.registry.register(config);
        self
    }

    /// Replace the registry built so far.
    pub fn registry(mut self, registry: HandlerRegistry<E, S>) -> Self {
        self.registry = registry;
        self
    }

    /// Global error callback, invoked synchronously for every error record.
    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&ErrorRecord<E>) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(callback));
        self
    }

    pub fn config(mut self, config: UnitConfig) -> Self {
        self.config = config;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config = self.config.with_name(name);
        self
    }

    /// Strategy for handlers registered without one.
    pub fn default_strategy(mut self, strategy: ConcurrencyStrategy) -> Self {
        self.config = self.config.with_default_strategy(strategy);
        self
    }

    /// Start the unit.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn build(self) -> Unit<E, S> {
        Unit::with_config(self.initial, self.registry, &self.config, self.on_error)
    }
}

impl<E, S> fmt::Debug for UnitBuilder<E, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitBuilder")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Create a unit from an initial state, a registry and an optional global
/// error callback.
///
/// # Panics
///
/// Panics when called outside a Tokio runtime.
pub fn create_unit<E, S>(
    initial: impl Into<Arc<S>>,
    registry: HandlerRegistry<E, S>,
    on_error: Option<ErrorCallback<E>>,
) -> Unit<E, S>
where
    E: Event,
    S: Send + Sync + 'static,
{
    Unit::with_config(initial, registry, &UnitConfig::default(), on_error)
}
