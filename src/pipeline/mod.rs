//! Dispatch pipeline.
//!
//! Events enter through an unbounded inbox drained by one pipeline task. The
//! task classifies each event against the registry and offers it to the lane
//! of the matched handler; the lane's strategy decides whether an execution
//! starts now, waits, or is discarded. Every execution runs as its own tokio
//! task inside a failure boundary, so a failing handler never stops the
//! pipeline or the other lanes.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, debug_span, error, info, warn, Instrument};

use crate::config::UnitConfig;
use crate::context::{Context, ExecutionToken};
use crate::error::{panic_message, UnitError};
use crate::error_channel::{ErrorCallback, ErrorChannel, ErrorStream};
use crate::registry::{Event, EventHandler, HandlerConfig, HandlerKey, HandlerRegistry};
use crate::state::StateCell;
use crate::strategy::{Admission, Admitted, ConcurrencyStrategy, ExecutionId, Lane};
use crate::unit::UnitId;

/// Work waiting in, or started from, a lane.
struct Job<E, S> {
    event: Arc<E>,
    handler: Arc<dyn EventHandler<E, S>>,
    label: String,
}

/// Cancellation handle of a spawned execution.
struct Running {
    abort: AbortHandle,
    token: ExecutionToken,
}

impl Running {
    /// Suppress further writes, then stop the task at its next await.
    fn cancel(self) {
        self.token.cancel();
        self.abort.abort();
    }
}

type ExecutionLane<E, S> = Lane<Job<E, S>, Running>;

/// Handler chosen for an event, copied out of the registry.
struct Route<E, S> {
    key: HandlerKey,
    handler: Arc<dyn EventHandler<E, S>>,
    strategy: ConcurrencyStrategy,
    label: String,
}

/// Shared core of a handler-driven unit.
pub(crate) struct Core<E, S> {
    id: UnitId,
    name: Option<String>,
    cell: Arc<StateCell<S>>,
    registry: RwLock<HandlerRegistry<E, S>>,
    errors: ErrorChannel<E>,
    lanes: Mutex<HashMap<HandlerKey, ExecutionLane<E, S>>>,
    closed: AtomicBool,
    inbox: Mutex<Option<mpsc::UnboundedSender<E>>>,
    pipeline: Mutex<Option<AbortHandle>>,
    default_strategy: ConcurrencyStrategy,
    log_unhandled: bool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<E: Event, S: Send + Sync + 'static> Core<E, S> {
    /// Build the core and spawn its pipeline task.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn start(
        id: UnitId,
        cell: Arc<StateCell<S>>,
        registry: HandlerRegistry<E, S>,
        config: &UnitConfig,
        on_error: Option<ErrorCallback<E>>,
    ) -> Arc<Self> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let handlers = registry.len();

        let core = Arc::new(Self {
            id,
            name: config.name.clone(),
            cell,
            registry: RwLock::new(registry),
            errors: ErrorChannel::new(on_error),
            lanes: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            inbox: Mutex::new(Some(sender)),
            pipeline: Mutex::new(None),
            default_strategy: config.default_strategy,
            log_unhandled: config.log_unhandled,
        });

        let span = debug_span!("unit.pipeline", unit.id = %id);
        let task = tokio::spawn(Self::run(Arc::downgrade(&core), receiver).instrument(span));
        *lock(&core.pipeline) = Some(task.abort_handle());

        info!(
            unit.id = %id,
            unit.name = ?core.name,
            handlers = handlers,
            strategy = %core.default_strategy,
            "Unit created"
        );
        core
    }

    pub fn id(&self) -> UnitId {
        self.id
    }

    pub fn cell(&self) -> &Arc<StateCell<S>> {
        &self.cell
    }

    pub fn errors(&self) -> ErrorStream<E> {
        self.errors.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Queue an event for dispatch. No-op after close.
    pub fn add(&self, event: E) {
        let inbox = lock(&self.inbox);
        let Some(sender) = inbox.as_ref() else {
            warn!(unit.id = %self.id, event.kind = %event.kind(), "Event added after close ignored");
            return;
        };
        if let Err(mpsc::error::SendError(event)) = sender.send(event) {
            warn!(unit.id = %self.id, event.kind = %event.kind(), "Pipeline stopped, event ignored");
        }
    }

    /// Add or replace a registration. Ignored after close.
    pub fn register(&self, config: HandlerConfig<E, S>) -> Option<HandlerConfig<E, S>> {
        if self.is_closed() {
            warn!(
                unit.id = %self.id,
                handler = %config.identifier.label(),
                "Handler registered after close ignored"
            );
            return None;
        }
        self.registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .register(config)
    }

    pub fn handler_keys(&self) -> Vec<HandlerKey> {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
    }

    async fn run(core: Weak<Self>, mut receiver: mpsc::UnboundedReceiver<E>) {
        while let Some(event) = receiver.recv().await {
            let Some(core) = core.upgrade() else {
                break;
            };
            if !core.route(event) {
                break;
            }
        }
    }

    /// Classify one event and hand it to its lane. Returns false once the
    /// pipeline has failed.
    fn route(self: &Arc<Self>, event: E) -> bool {
        let classified = catch_unwind(AssertUnwindSafe(|| self.classify(&event)));

        let route = match classified {
            Ok(Some(route)) => route,
            Ok(None) => {
                if self.log_unhandled {
                    debug!(unit.id = %self.id, event.kind = %event.kind(), "Unhandled event");
                }
                return true;
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(
                    unit.id = %self.id,
                    error = %message,
                    "Event classification panicked, closing unit"
                );
                self.errors.report(None, UnitError::Pipeline(message));
                self.close();
                return false;
            }
        };

        debug!(
            unit.id = %self.id,
            event.kind = %event.kind(),
            handler = %route.label,
            strategy = %route.strategy,
            "Routing event"
        );
        self.admit(
            route.key,
            route.strategy,
            Job {
                event: Arc::new(event),
                handler: route.handler,
                label: route.label,
            },
        );
        true
    }

    fn classify(&self, event: &E) -> Option<Route<E, S>> {
        let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
        let config = registry.classify(event)?;
        Some(Route {
            key: config.key(),
            handler: Arc::clone(&config.handler),
            strategy: config.strategy.unwrap_or(self.default_strategy),
            label: config.identifier.label().to_string(),
        })
    }

    fn admit(self: &Arc<Self>, key: HandlerKey, strategy: ConcurrencyStrategy, job: Job<E, S>) {
        let mut lanes = lock(&self.lanes);
        if self.is_closed() {
            return;
        }

        let lane = lanes.entry(key.clone()).or_insert_with(Lane::new);
        match lane.admit(strategy, job) {
            Admission::Start(admitted) => self.spawn_execution(lane, key, admitted),
            Admission::Queued => {
                debug!(
                    unit.id = %self.id,
                    handler = %key,
                    queued = lane.queued(),
                    "Event queued behind running execution"
                );
            }
            Admission::Dropped(job) => {
                debug!(
                    unit.id = %self.id,
                    event.kind = %job.event.kind(),
                    in_flight = lane.in_flight(),
                    "Event dropped, handler busy"
                );
            }
        }
    }

    /// Spawn an admitted execution. Must run under the lane lock so the
    /// execution cannot finish before its handle is tracked.
    fn spawn_execution(
        self: &Arc<Self>,
        lane: &mut ExecutionLane<E, S>,
        key: HandlerKey,
        admitted: Admitted<Job<E, S>, Running>,
    ) {
        let Admitted {
            id,
            job,
            superseded,
        } = admitted;

        if !superseded.is_empty() {
            debug!(
                unit.id = %self.id,
                handler = %key,
                superseded = superseded.len(),
                "Cancelling superseded executions"
            );
        }
        for running in superseded {
            running.cancel();
        }

        let token = ExecutionToken::new();
        let core = Arc::clone(self);
        let execution_token = token.clone();
        let span = debug_span!(
            "unit.execute",
            unit.id = %self.id,
            event.kind = %job.event.kind(),
            execution = id
        );
        let task = tokio::spawn(
            async move {
                core.execute(job, execution_token).await;
                core.finish(&key, id);
            }
            .instrument(span),
        );

        let running = Running {
            abort: task.abort_handle(),
            token,
        };
        if let Some(running) = lane.track(id, running) {
            running.cancel();
        }
    }

    async fn execute(&self, job: Job<E, S>, token: ExecutionToken) {
        let ctx = Context::new(self.id, Arc::clone(&self.cell), token.clone());
        let event = Arc::clone(&job.event);

        let outcome = match catch_unwind(AssertUnwindSafe(|| job.handler.handle(event, ctx))) {
            Ok(future) => AssertUnwindSafe(future).catch_unwind().await,
            Err(payload) => Err(payload),
        };

        if token.is_cancelled() {
            debug!(unit.id = %self.id, handler = %job.label, "Superseded execution finished");
            return;
        }

        let failure = match outcome {
            Ok(Ok(())) => {
                debug!(unit.id = %self.id, handler = %job.label, "Handler completed");
                return;
            }
            Ok(Err(source)) => UnitError::Handler {
                kind: job.label,
                source,
            },
            Err(payload) => UnitError::HandlerPanicked {
                kind: job.label,
                message: panic_message(payload.as_ref()),
            },
        };

        error!(
            unit.id = %self.id,
            event.kind = %job.event.kind(),
            error = %failure,
            "Handler failed"
        );
        self.errors.report(Some(job.event), failure);
    }

    /// Release an execution's lane slot and start the next queued job.
    fn finish(self: &Arc<Self>, key: &HandlerKey, id: ExecutionId) {
        let mut lanes = lock(&self.lanes);
        let Some(lane) = lanes.get_mut(key) else {
            return;
        };
        if let Some(next) = lane.complete(id) {
            self.spawn_execution(lane, key.clone(), next);
        }
    }

    /// Stop the pipeline, abort executions and complete every stream.
    /// Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        lock(&self.inbox).take();
        if let Some(pipeline) = lock(&self.pipeline).take() {
            pipeline.abort();
        }

        let running: Vec<Running> = lock(&self.lanes)
            .drain()
            .flat_map(|(_, mut lane)| lane.drain())
            .collect();
        let aborted = running.len();
        for execution in running {
            execution.cancel();
        }

        self.cell.close();
        self.errors.close();
        self.registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();

        info!(
            unit.id = %self.id,
            unit.name = ?self.name,
            aborted = aborted,
            "Unit closed"
        );
    }
}
