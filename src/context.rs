//! Per-execution handler context.
//!
//! Every handler invocation receives a fresh [`Context`]: the unit's id, the
//! state snapshot taken when the execution started, and write access to the
//! unit's state. Writes go through the state cell's writer lock, so parallel
//! executions never interleave partial updates.

use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;

use crate::state::StateCell;
use crate::unit::UnitId;

/// Cancellation flag shared between a running execution and its lane.
///
/// Restartable lanes cancel the token of a superseded execution before
/// aborting its task; any state write the execution attempts afterwards is
/// discarded.
#[derive(Clone)]
pub struct ExecutionToken {
    cancel: Arc<watch::Sender<bool>>,
}

impl ExecutionToken {
    pub fn new() -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            cancel: Arc::new(cancel),
        }
    }

    /// Signal cancellation. Idempotent.
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&self) {
        let mut receiver = self.cancel.subscribe();
        // The sender lives as long as `self`, so this cannot observe a close.
        let _ = receiver.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for ExecutionToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ExecutionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Handle given to a handler for one execution.
pub struct Context<S> {
    unit_id: UnitId,
    snapshot: Arc<S>,
    cell: Arc<StateCell<S>>,
    token: ExecutionToken,
}

impl<S> Clone for Context<S> {
    fn clone(&self) -> Self {
        Self {
            unit_id: self.unit_id,
            snapshot: Arc::clone(&self.snapshot),
            cell: Arc::clone(&self.cell),
            token: self.token.clone(),
        }
    }
}

impl<S: Send + Sync + 'static> Context<S> {
    /// Build a context whose snapshot is the cell's current value.
    pub(crate) fn new(unit_id: UnitId, cell: Arc<StateCell<S>>, token: ExecutionToken) -> Self {
        Self {
            unit_id,
            snapshot: cell.get(),
            cell,
            token,
        }
    }

    pub fn id(&self) -> UnitId {
        self.unit_id
    }

    /// State as it was when this execution started.
    pub fn snapshot(&self) -> &Arc<S> {
        &self.snapshot
    }

    /// State as it is now, including writes made since the snapshot.
    pub fn current(&self) -> Arc<S> {
        self.cell.get()
    }

    /// Replace the state.
    ///
    /// Returns true if the state changed. Writes from a cancelled execution
    /// are discarded.
    pub fn set(&self, next: impl Into<Arc<S>>) -> bool {
        let next = next.into();
        self.write(move |_| next)
    }

    /// Derive the next state from the current one, under the writer lock.
    pub fn update<F>(&self, f: F) -> bool
    where
        F: FnOnce(&S) -> S,
    {
        self.write(move |current| Arc::new(f(current.as_ref())))
    }

    /// Like [`update`](Self::update), but may return the current `Arc` to
    /// leave the state untouched.
    pub fn update_arc<F>(&self, f: F) -> bool
    where
        F: FnOnce(&Arc<S>) -> Arc<S>,
    {
        self.write(f)
    }

    fn write<F>(&self, f: F) -> bool
    where
        F: FnOnce(&Arc<S>) -> Arc<S>,
    {
        let token = &self.token;
        let written = self.cell.update_when(|| !token.is_cancelled(), f);
        if !written && token.is_cancelled() {
            debug!(unit.id = %self.unit_id, "Write from cancelled execution discarded");
        }
        written
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once this execution has been superseded.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

impl<S> fmt::Debug for Context<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("unit_id", &self.unit_id)
            .field("token", &self.token)
            .finish_non_exhaustive()
    }
}
