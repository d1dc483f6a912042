//! Source-driven units.
//!
//! A [`PipeUnit`] takes its state from an external stream instead of from
//! handlers. It exposes the same observation surface as [`Unit`] so view
//! glue can bind to either.
//!
//! [`Unit`]: super::Unit

use std::convert::Infallible;
use std::fmt;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use futures::{Stream, StreamExt};
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use super::{StateUnit, UnitId};
use crate::error_channel::{ErrorChannel, ErrorStream};
use crate::registry::Event;
use crate::state::{StateCell, StateStream};

struct PipeInner<S, E> {
    id: UnitId,
    cell: StateCell<S>,
    errors: ErrorChannel<E>,
    closed: AtomicBool,
    source: Mutex<Option<AbortHandle>>,
}

impl<S, E> PipeInner<S, E>
where
    S: Send + Sync + 'static,
    E: Event,
{
    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(source) = self
            .source
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            source.abort();
        }
        self.cell.close();
        self.errors.close();
        info!(unit.id = %self.id, "Unit closed");
    }
}

/// Unit whose state follows an external stream.
///
/// Each `Ok` item becomes the new state. Items may be plain values or
/// `Arc<S>`; yielding the `Arc` already held republishes nothing. The unit
/// closes when the source
/// completes or yields an `Err`; source errors are logged, never published
/// on the error stream. Events are not accepted. Dropping the unit closes it.
pub struct PipeUnit<S, E = String>
where
    S: Send + Sync + 'static,
    E: Event,
{
    inner: Arc<PipeInner<S, E>>,
}

impl<S, E> PipeUnit<S, E>
where
    S: Send + Sync + 'static,
    E: Event,
{
    /// Create a unit driven by `source`.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn new<St, T, Err>(initial: impl Into<Arc<S>>, source: St) -> Self
    where
        St: Stream<Item = Result<T, Err>> + Send + 'static,
        T: Into<Arc<S>> + 'static,
        Err: fmt::Display + Send + 'static,
    {
        let inner = Arc::new(PipeInner {
            id: UnitId::new(),
            cell: StateCell::new(initial),
            errors: ErrorChannel::silent(),
            closed: AtomicBool::new(false),
            source: Mutex::new(None),
        });

        let task = tokio::spawn(drive(Arc::downgrade(&inner), source));
        *inner.source.lock().unwrap_or_else(PoisonError::into_inner) = Some(task.abort_handle());

        info!(unit.id = %inner.id, "Source-driven unit created");
        Self { inner }
    }

    /// Create a unit that steps through `values`, then closes.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn from_values<I, T>(initial: impl Into<Arc<S>>, values: I) -> Self
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
        T: Into<Arc<S>> + 'static,
    {
        let source = futures::stream::iter(values.into_iter().map(Ok::<T, Infallible>));
        Self::new(initial, source)
    }

    pub fn id(&self) -> UnitId {
        self.inner.id
    }

    /// Events are not accepted by source-driven units; logs a warning.
    pub fn add(&self, event: E) {
        warn!(
            unit.id = %self.inner.id,
            event.kind = %event.kind(),
            "Event added to source-driven unit ignored"
        );
    }

    pub fn state(&self) -> Arc<S> {
        self.inner.cell.get()
    }

    pub fn changes(&self) -> StateStream<S> {
        self.inner.cell.changes()
    }

    /// Never emits; completes on close.
    pub fn errors(&self) -> ErrorStream<E> {
        self.inner.errors.subscribe()
    }

    /// Stop following the source and complete both streams. Idempotent.
    pub fn close(&self) {
        self.inner.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

async fn drive<S, E, St, T, Err>(inner: Weak<PipeInner<S, E>>, source: St)
where
    S: Send + Sync + 'static,
    E: Event,
    St: Stream<Item = Result<T, Err>>,
    T: Into<Arc<S>>,
    Err: fmt::Display,
{
    let mut source = pin!(source);

    while let Some(item) = source.next().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        match item {
            Ok(state) => {
                inner.cell.set(state);
            }
            Err(err) => {
                error!(unit.id = %inner.id, error = %err, "State source failed, closing unit");
                inner.close();
                return;
            }
        }
    }

    if let Some(inner) = inner.upgrade() {
        debug!(unit.id = %inner.id, "State source completed");
        inner.close();
    }
}

impl<S, E> StateUnit<E, S> for PipeUnit<S, E>
where
    S: Send + Sync + 'static,
    E: Event,
{
    fn id(&self) -> UnitId {
        PipeUnit::id(self)
    }

    fn add(&self, event: E) {
        PipeUnit::add(self, event)
    }

    fn state(&self) -> Arc<S> {
        PipeUnit::state(self)
    }

    fn changes(&self) -> StateStream<S> {
        PipeUnit::changes(self)
    }

    fn errors(&self) -> ErrorStream<E> {
        PipeUnit::errors(self)
    }

    fn close(&self) {
        PipeUnit::close(self)
    }

    fn is_closed(&self) -> bool {
        PipeUnit::is_closed(self)
    }
}

impl<S, E> Drop for PipeUnit<S, E>
where
    S: Send + Sync + 'static,
    E: Event,
{
    fn drop(&mut self) {
        self.inner.close();
    }
}

impl<S, E> fmt::Debug for PipeUnit<S, E>
where
    S: Send + Sync + 'static,
    E: Event,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeUnit")
            .field("id", &self.inner.id)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
