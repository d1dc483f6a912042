//! Handler registry: which handler runs for which event.
//!
//! Handlers are registered against an [`Identifier`]: either an event kind
//! (matched by string equality on [`Event::kind`]) or a [`Matcher`] predicate
//! over the whole event. Classification returns the first entry in
//! registration order that accepts the event, so an event runs at most one
//! handler.
//!
//! # Example
//!
//! ```rust,ignore
//! use tessera::{ConcurrencyStrategy, HandlerRegistry};
//!
//! let registry = HandlerRegistry::<CounterEvent, Counter>::new()
//!     .on("INC", |_event, ctx| async move {
//!         ctx.update(|s| Counter { count: s.count + 1 });
//!         Ok(())
//!     })
//!     .on_with("SEARCH", ConcurrencyStrategy::Restartable, search);
//! ```

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::context::Context;
use crate::error::HandlerResult;
use crate::strategy::ConcurrencyStrategy;

/// A command dispatched to a unit.
///
/// The kind is the discriminator handlers are registered against. For enum
/// events this is usually the variant name.
pub trait Event: Send + Sync + 'static {
    fn kind(&self) -> &str;
}

impl Event for String {
    fn kind(&self) -> &str {
        self
    }
}

impl Event for &'static str {
    fn kind(&self) -> &str {
        self
    }
}

/// Handler for one registered identifier.
///
/// Implement this for handlers that carry their own dependencies. Closures
/// are registered directly through [`HandlerRegistry::on`] and friends.
#[async_trait]
pub trait EventHandler<E, S>: Send + Sync {
    async fn handle(&self, event: Arc<E>, ctx: Context<S>) -> HandlerResult;
}

/// Adapts an async closure into an [`EventHandler`].
pub struct HandlerFn<F>(F);

#[async_trait]
impl<E, S, F, Fut> EventHandler<E, S> for HandlerFn<F>
where
    E: Send + Sync + 'static,
    S: Send + Sync + 'static,
    F: Fn(Arc<E>, Context<S>) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, event: Arc<E>, ctx: Context<S>) -> HandlerResult {
        (self.0)(event, ctx).await
    }
}

/// Adapts a synchronous closure into an [`EventHandler`] whose future is
/// already resolved when first polled.
pub struct SyncHandlerFn<F>(F);

#[async_trait]
impl<E, S, F> EventHandler<E, S> for SyncHandlerFn<F>
where
    E: Send + Sync + 'static,
    S: Send + Sync + 'static,
    F: Fn(&E, &Context<S>) -> HandlerResult + Send + Sync,
{
    async fn handle(&self, event: Arc<E>, ctx: Context<S>) -> HandlerResult {
        (self.0)(event.as_ref(), &ctx)
    }
}

/// Predicate over events, used for registrations that need more than the
/// event kind.
///
/// A matcher's identity is its allocation: clones of one matcher are the
/// same identifier, two matchers built from identical closures are not.
pub struct Matcher<E> {
    name: Arc<str>,
    predicate: Arc<dyn Fn(&E) -> bool + Send + Sync>,
}

impl<E> Matcher<E> {
    pub fn new<F>(predicate: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        Self::named("matcher", predicate)
    }

    /// A matcher with a name used in logs and error records.
    pub fn named<F>(name: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        Self {
            name: Arc::from(name.into()),
            predicate: Arc::new(predicate),
        }
    }

    pub fn matches(&self, event: &E) -> bool {
        (self.predicate)(event)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn identity(&self) -> usize {
        Arc::as_ptr(&self.predicate) as *const () as usize
    }
}

impl<E> Clone for Matcher<E> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            predicate: Arc::clone(&self.predicate),
        }
    }
}

impl<E> fmt::Debug for Matcher<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Matcher")
            .field("name", &self.name)
            .field("identity", &format_args!("{:#x}", self.identity()))
            .finish()
    }
}

/// What a handler is registered against.
pub enum Identifier<E> {
    /// Exact event kind.
    Kind(String),
    /// Arbitrary predicate.
    Matcher(Matcher<E>),
}

impl<E> Identifier<E> {
    pub fn key(&self) -> HandlerKey {
        match self {
            Identifier::Kind(kind) => HandlerKey::Kind(kind.clone()),
            Identifier::Matcher(matcher) => HandlerKey::Matcher(matcher.identity()),
        }
    }

    /// Name used in logs and error records.
    pub fn label(&self) -> &str {
        match self {
            Identifier::Kind(kind) => kind,
            Identifier::Matcher(matcher) => matcher.name(),
        }
    }
}

impl<E: Event> Identifier<E> {
    pub fn accepts(&self, event: &E) -> bool {
        match self {
            Identifier::Kind(kind) => event.kind() == kind,
            Identifier::Matcher(matcher) => matcher.matches(event),
        }
    }
}

impl<E> From<&str> for Identifier<E> {
    fn from(kind: &str) -> Self {
        Identifier::Kind(kind.to_string())
    }
}

impl<E> From<String> for Identifier<E> {
    fn from(kind: String) -> Self {
        Identifier::Kind(kind)
    }
}

impl<E> From<Matcher<E>> for Identifier<E> {
    fn from(matcher: Matcher<E>) -> Self {
        Identifier::Matcher(matcher)
    }
}

impl<E> fmt::Debug for Identifier<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identifier::Kind(kind) => f.debug_tuple("Kind").field(kind).finish(),
            Identifier::Matcher(matcher) => f.debug_tuple("Matcher").field(matcher).finish(),
        }
    }
}

/// Identity of a registration; one concurrency lane exists per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HandlerKey {
    Kind(String),
    Matcher(usize),
}

impl fmt::Display for HandlerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerKey::Kind(kind) => f.write_str(kind),
            HandlerKey::Matcher(identity) => write!(f, "matcher@{:#x}", identity),
        }
    }
}

/// One registration: identifier, handler and optional strategy.
///
/// A `None` strategy resolves to the unit's configured default when events
/// are admitted.
pub struct HandlerConfig<E, S> {
    pub identifier: Identifier<E>,
    pub handler: Arc<dyn EventHandler<E, S>>,
    pub strategy: Option<ConcurrencyStrategy>,
}

impl<E, S> HandlerConfig<E, S> {
    pub fn new(
        identifier: impl Into<Identifier<E>>,
        handler: impl EventHandler<E, S> + 'static,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            handler: Arc::new(handler),
            strategy: None,
        }
    }

    pub fn with_strategy(mut self, strategy: ConcurrencyStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn key(&self) -> HandlerKey {
        self.identifier.key()
    }
}

impl<E, S> fmt::Debug for HandlerConfig<E, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerConfig")
            .field("identifier", &self.identifier)
            .field("strategy", &self.strategy)
            .finish_non_exhaustive()
    }
}

/// Wrap an async closure as a handler.
pub fn handler_fn<E, S, F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Arc<E>, Context<S>) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    HandlerFn(f)
}

/// Wrap a synchronous closure as a handler.
pub fn sync_handler<E, S, F>(f: F) -> SyncHandlerFn<F>
where
    F: Fn(&E, &Context<S>) -> HandlerResult + Send + Sync,
{
    SyncHandlerFn(f)
}

/// Ordered set of registrations.
///
/// Kind registrations are indexed by kind; matcher registrations are scanned
/// in order. Re-registering an identifier replaces the handler in place and
/// keeps its position.
pub struct HandlerRegistry<E, S> {
    entries: Vec<HandlerConfig<E, S>>,
    by_kind: HashMap<String, usize>,
}

impl<E, S> Default for HandlerRegistry<E, S> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            by_kind: HashMap::new(),
        }
    }
}

impl<E: Event, S: Send + Sync + 'static> HandlerRegistry<E, S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an async closure for an event kind with the default strategy.
    pub fn on<F, Fut>(self, kind: impl Into<String>, f: F) -> Self
    where
        F: Fn(Arc<E>, Context<S>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.with(HandlerConfig::new(Identifier::Kind(kind.into()), HandlerFn(f)))
    }

    /// Register an async closure for an event kind with an explicit strategy.
    pub fn on_with<F, Fut>(
        self,
        kind: impl Into<String>,
        strategy: ConcurrencyStrategy,
        f: F,
    ) -> Self
    where
        F: Fn(Arc<E>, Context<S>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.with(
            HandlerConfig::new(Identifier::Kind(kind.into()), HandlerFn(f)).with_strategy(strategy),
        )
    }

    /// Register a synchronous closure for an event kind.
    pub fn on_sync<F>(self, kind: impl Into<String>, f: F) -> Self
    where
        F: Fn(&E, &Context<S>) -> HandlerResult + Send + Sync + 'static,
    {
        self.with(HandlerConfig::new(Identifier::Kind(kind.into()), SyncHandlerFn(f)))
    }

    /// Register an async closure behind a predicate.
    pub fn on_match<F, Fut>(
        self,
        matcher: Matcher<E>,
        strategy: ConcurrencyStrategy,
        f: F,
    ) -> Self
    where
        F: Fn(Arc<E>, Context<S>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.with(HandlerConfig::new(matcher, HandlerFn(f)).with_strategy(strategy))
    }

    /// Builder form of [`register`](Self::register).
    pub fn with(mut self, config: HandlerConfig<E, S>) -> Self {
        self.register(config);
        self
    }

    /// Insert a registration, replacing any existing one for the same
    /// identifier. Returns the replaced registration.
    pub fn register(&mut self, config: HandlerConfig<E, S>) -> Option<HandlerConfig<E, S>> {
        let key = config.key();
        let existing = match &key {
            HandlerKey::Kind(kind) => self.by_kind.get(kind).copied(),
            HandlerKey::Matcher(_) => self.entries.iter().position(|entry| entry.key() == key),
        };

        match existing {
            Some(index) => {
                warn!(
                    handler = %config.identifier.label(),
                    "Handler already registered, overwriting"
                );
                Some(std::mem::replace(&mut self.entries[index], config))
            }
            None => {
                if let HandlerKey::Kind(kind) = key {
                    self.by_kind.insert(kind, self.entries.len());
                }
                self.entries.push(config);
                None
            }
        }
    }

    /// First registration, in registration order, that accepts `event`.
    pub fn classify(&self, event: &E) -> Option<&HandlerConfig<E, S>> {
        let kind_index = self.by_kind.get(event.kind()).copied();
        let scan_end = kind_index.unwrap_or(self.entries.len());

        self.entries[..scan_end]
            .iter()
            .find(|entry| {
                matches!(entry.identifier, Identifier::Matcher(_)) && entry.identifier.accepts(event)
            })
            .or_else(|| kind_index.map(|index| &self.entries[index]))
    }

    /// Keys of all registrations, in registration order.
    pub fn keys(&self) -> Vec<HandlerKey> {
        self.entries.iter().map(HandlerConfig::key).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.by_kind.clear();
    }
}

impl<E, S> fmt::Debug for HandlerRegistry<E, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("entries", &self.entries)
            .finish()
    }
}
