//! State cell: the single owner of a unit's current state.
//!
//! The cell holds the state as an `Arc<S>` and republishes only when a new
//! allocation replaces the current one. Equality of contents is never
//! consulted; setting the same `Arc` twice is a no-op.
//!
//! Every subscriber gets its own unbounded queue, so each distinct state is
//! delivered exactly once and in order, starting with the value current at
//! subscription time.

use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::warn;

struct CellInner<S> {
    current: Arc<S>,
    subscribers: Vec<mpsc::UnboundedSender<Arc<S>>>,
    closed: bool,
}

/// Holds the current state and multicasts changes.
pub struct StateCell<S> {
    inner: Mutex<CellInner<S>>,
}

impl<S: Send + Sync + 'static> StateCell<S> {
    /// Create a cell holding `initial`.
    pub fn new(initial: impl Into<Arc<S>>) -> Self {
        Self {
            inner: Mutex::new(CellInner {
                current: initial.into(),
                subscribers: Vec::new(),
                closed: false,
            }),
        }
    }

    // A handler panicking inside `update` poisons the lock; the held state is
    // still a complete value, so recover it.
    fn lock(&self) -> MutexGuard<'_, CellInner<S>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current state. Still available after close.
    pub fn get(&self) -> Arc<S> {
        Arc::clone(&self.lock().current)
    }

    /// Replace the state. Returns true if subscribers were notified.
    pub fn set(&self, next: impl Into<Arc<S>>) -> bool {
        let next = next.into();
        self.update_when(|| true, move |_| next)
    }

    /// Read-modify-write under the cell's writer lock.
    ///
    /// `f` may return the same `Arc` it was given to leave the state alone.
    pub fn update<F>(&self, f: F) -> bool
    where
        F: FnOnce(&Arc<S>) -> Arc<S>,
    {
        self.update_when(|| true, f)
    }

    /// Like [`update`](Self::update), but `allowed` is evaluated under the
    /// writer lock and skips the write when it returns false.
    pub(crate) fn update_when<G, F>(&self, allowed: G, f: F) -> bool
    where
        G: FnOnce() -> bool,
        F: FnOnce(&Arc<S>) -> Arc<S>,
    {
        let mut inner = self.lock();
        if inner.closed {
            warn!("State update after close ignored");
            return false;
        }
        if !allowed() {
            return false;
        }

        let next = f(&inner.current);
        if Arc::ptr_eq(&next, &inner.current) {
            return false;
        }

        inner.current = Arc::clone(&next);
        inner
            .subscribers
            .retain(|subscriber| subscriber.send(Arc::clone(&next)).is_ok());
        true
    }

    /// Subscribe to state changes.
    ///
    /// The stream yields the current value first. Once the cell is closed it
    /// completes; subscribing to a closed cell yields the final value only.
    pub fn changes(&self) -> StateStream<S> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        // Receiver is alive, so this send cannot fail.
        let _ = tx.send(Arc::clone(&inner.current));
        if !inner.closed {
            inner.subscribers.push(tx);
        }
        StateStream {
            inner: UnboundedReceiverStream::new(rx),
        }
    }

    /// Complete all change streams. Idempotent.
    pub fn close(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        inner.subscribers.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        let mut inner = self.lock();
        inner.subscribers.retain(|subscriber| !subscriber.is_closed());
        inner.subscribers.len()
    }
}

/// Stream of distinct states, beginning with the value current at
/// subscription time.
pub struct StateStream<S> {
    inner: UnboundedReceiverStream<Arc<S>>,
}

impl<S: Send + Sync + 'static> StateStream<S> {
    /// Project a slice of each state, emitting only when the slice changes.
    pub fn select<T, F>(self, mut f: F) -> BoxStream<'static, T>
    where
        F: FnMut(&S) -> T + Send + 'static,
        T: PartialEq + Clone + Send + 'static,
    {
        let mut last: Option<T> = None;
        self.filter_map(move |state| {
            let slice = f(state.as_ref());
            let changed = last.as_ref() != Some(&slice);
            if changed {
                last = Some(slice.clone());
            }
            futures::future::ready(changed.then_some(slice))
        })
        .boxed()
    }
}

impl<S> Stream for StateStream<S> {
    type Item = Arc<S>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl<S> std::fmt::Debug for StateStream<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStream").finish_non_exhaustive()
    }
}
