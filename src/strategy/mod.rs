//! Concurrency strategies.
//!
//! A strategy decides how a newly arrived event interacts with executions
//! already in flight for the same handler. Strategies are plain values; the
//! per-handler bookkeeping lives in a [`Lane`], an explicit state machine the
//! dispatch pipeline drives under its lane lock.
//!
//! | Strategy      | Event arrives while another is running        |
//! |---------------|-----------------------------------------------|
//! | `Parallel`    | starts immediately                            |
//! | `Sequential`  | queued, starts after the running one finishes |
//! | `Restartable` | running one is cancelled, new one starts      |
//! | `Droppable`   | discarded                                     |

use std::collections::VecDeque;
use std::fmt;

use serde::Deserialize;

/// Policy governing overlap of executions that share a handler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyStrategy {
    /// Queue; executions never overlap and finish in arrival order.
    Sequential,
    /// Start every execution immediately.
    #[default]
    Parallel,
    /// Latest wins: a new execution cancels the one in flight.
    #[serde(alias = "latest")]
    Restartable,
    /// First wins: events arriving while one is in flight are discarded.
    #[serde(alias = "first")]
    Droppable,
}

impl ConcurrencyStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConcurrencyStrategy::Sequential => "sequential",
            ConcurrencyStrategy::Parallel => "parallel",
            ConcurrencyStrategy::Restartable => "restartable",
            ConcurrencyStrategy::Droppable => "droppable",
        }
    }
}

impl fmt::Display for ConcurrencyStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies one execution within a lane.
pub type ExecutionId = u64;

/// An execution the lane has decided to start.
#[derive(Debug)]
pub(crate) struct Admitted<J, H> {
    pub id: ExecutionId,
    pub job: J,
    /// Handles of executions this one replaces. The caller must cancel them.
    pub superseded: Vec<H>,
}

/// Outcome of offering a job to a lane.
#[derive(Debug)]
pub(crate) enum Admission<J, H> {
    Start(Admitted<J, H>),
    Queued,
    Dropped(J),
}

/// Per-handler execution bookkeeping.
///
/// `J` is the pending unit of work, `H` the handle used to cancel a running
/// execution. An execution is active from admission until [`complete`] is
/// called for it or it is superseded; its handle is attached with [`track`]
/// once the caller has spawned it.
///
/// [`complete`]: Lane::complete
/// [`track`]: Lane::track
#[derive(Debug)]
pub(crate) struct Lane<J, H> {
    active: Vec<(ExecutionId, Option<H>)>,
    queue: VecDeque<J>,
    next_id: ExecutionId,
}

impl<J, H> Default for Lane<J, H> {
    fn default() -> Self {
        Self {
            active: Vec::new(),
            queue: VecDeque::new(),
            next_id: 0,
        }
    }
}

impl<J, H> Lane<J, H> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer a job under `strategy`.
    pub fn admit(&mut self, strategy: ConcurrencyStrategy, job: J) -> Admission<J, H> {
        match strategy {
            ConcurrencyStrategy::Parallel => Admission::Start(self.begin(job, Vec::new())),
            ConcurrencyStrategy::Sequential => {
                if self.active.is_empty() && self.queue.is_empty() {
                    Admission::Start(self.begin(job, Vec::new()))
                } else {
                    self.queue.push_back(job);
                    Admission::Queued
                }
            }
            ConcurrencyStrategy::Restartable => {
                let superseded = self.active.drain(..).filter_map(|(_, h)| h).collect();
                Admission::Start(self.begin(job, superseded))
            }
            ConcurrencyStrategy::Droppable => {
                if self.active.is_empty() {
                    Admission::Start(self.begin(job, Vec::new()))
                } else {
                    Admission::Dropped(job)
                }
            }
        }
    }

    fn begin(&mut self, job: J, superseded: Vec<H>) -> Admitted<J, H> {
        let id = self.next_id;
        self.next_id += 1;
        self.active.push((id, None));
        Admitted {
            id,
            job,
            superseded,
        }
    }

    /// Attach the cancellation handle of a spawned execution.
    ///
    /// Returns the handle back if the execution is no longer active.
    pub fn track(&mut self, id: ExecutionId, handle: H) -> Option<H> {
        match self.active.iter_mut().find(|(active_id, _)| *active_id == id) {
            Some((_, slot)) => {
                *slot = Some(handle);
                None
            }
            None => Some(handle),
        }
    }

    /// Mark an execution finished. Returns the next queued job to start, if
    /// the lane is now idle and has one waiting.
    pub fn complete(&mut self, id: ExecutionId) -> Option<Admitted<J, H>> {
        let position = self
            .active
            .iter()
            .position(|(active_id, _)| *active_id == id)?;
        self.active.remove(position);

        if self.active.is_empty() {
            let job = self.queue.pop_front()?;
            return Some(self.begin(job, Vec::new()));
        }
        None
    }

    /// Drop all queued work and return every tracked handle.
    pub fn drain(&mut self) -> Vec<H> {
        self.queue.clear();
        self.active.drain(..).filter_map(|(_, h)| h).collect()
    }

    pub fn in_flight(&self) -> usize {
        self.active.len()
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }
}
