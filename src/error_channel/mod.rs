//! Error channel: where handler and pipeline failures surface.
//!
//! Every subscriber owns an unbounded queue, so each record reported while
//! it is subscribed is delivered exactly once and in order, however far the
//! subscriber falls behind. Records are also handed to a synchronous
//! callback when one is configured.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use chrono::{DateTime, Utc};
use futures::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{error, warn};

use crate::error::{panic_message, UnitError};
use crate::registry::Event;

/// A failure observed by a unit.
#[derive(Debug)]
pub struct ErrorRecord<E> {
    /// The event whose handler failed. `None` for pipeline-level failures.
    pub event: Option<Arc<E>>,
    pub error: Arc<UnitError>,
    pub occurred_at: DateTime<Utc>,
}

impl<E> Clone for ErrorRecord<E> {
    fn clone(&self) -> Self {
        Self {
            event: self.event.clone(),
            error: Arc::clone(&self.error),
            occurred_at: self.occurred_at,
        }
    }
}

impl<E> ErrorRecord<E> {
    /// Returns true for failures that closed the unit.
    pub fn is_fatal(&self) -> bool {
        self.error.is_fatal()
    }
}

/// Global error callback, invoked synchronously for every record.
pub type ErrorCallback<E> = Arc<dyn Fn(&ErrorRecord<E>) + Send + Sync>;

struct ChannelInner<E> {
    subscribers: Vec<mpsc::UnboundedSender<ErrorRecord<E>>>,
    closed: bool,
}

/// Fan-out of error records to streams and an optional callback.
pub struct ErrorChannel<E> {
    inner: Mutex<ChannelInner<E>>,
    callback: Option<ErrorCallback<E>>,
}

impl<E: Event> ErrorChannel<E> {
    pub fn new(callback: Option<ErrorCallback<E>>) -> Self {
        Self {
            inner: Mutex::new(ChannelInner {
                subscribers: Vec::new(),
                closed: false,
            }),
            callback,
        }
    }

    /// A channel that never emits; it only completes on close.
    pub fn silent() -> Self {
        Self::new(None)
    }

    fn lock(&self) -> MutexGuard<'_, ChannelInner<E>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish a failure. No-op once closed.
    pub fn report(&self, event: Option<Arc<E>>, error: UnitError) {
        let record = ErrorRecord {
            event,
            error: Arc::new(error),
            occurred_at: Utc::now(),
        };

        {
            let mut inner = self.lock();
            if inner.closed {
                warn!(error = %record.error, "Error reported after close dropped");
                return;
            }
            inner
                .subscribers
                .retain(|subscriber| subscriber.send(record.clone()).is_ok());
        }

        if let Some(callback) = &self.callback {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| callback(&record))) {
                error!(
                    panic = %panic_message(payload.as_ref()),
                    "Error callback panicked"
                );
            }
        }
    }

    /// Subscribe to records reported from now on.
    ///
    /// Subscribing after close returns an already completed stream.
    pub fn subscribe(&self) -> ErrorStream<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        if !inner.closed {
            inner.subscribers.push(tx);
        }
        ErrorStream {
            inner: UnboundedReceiverStream::new(rx),
        }
    }

    /// Complete every stream once queued records are drained. Idempotent.
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

/// Stream of error records. Ends when the unit closes.
pub struct ErrorStream<E> {
    inner: UnboundedReceiverStream<ErrorRecord<E>>,
}

impl<E> Stream for ErrorStream<E> {
    type Item = ErrorRecord<E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl<E> std::fmt::Debug for ErrorStream<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorStream").finish_non_exhaustive()
    }
}
