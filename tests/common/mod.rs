//! Shared fixtures for tessera integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tessera::{Event, StateStream};
use tokio::time::timeout;

/// How long a test waits for an expected emission.
pub const WAIT: Duration = Duration::from_secs(5);

/// Commands understood by the counter fixtures.
#[derive(Debug, Clone, PartialEq)]
pub enum CounterEvent {
    Inc,
    Add(u32),
    Search(String),
    Slow(u32),
    Fail(String),
    Panic,
    Noise,
}

impl Event for CounterEvent {
    fn kind(&self) -> &str {
        match self {
            CounterEvent::Inc => "INC",
            CounterEvent::Add(_) => "ADD",
            CounterEvent::Search(_) => "SEARCH",
            CounterEvent::Slow(_) => "SLOW",
            CounterEvent::Fail(_) => "FAIL",
            CounterEvent::Panic => "PANIC",
            CounterEvent::Noise => "NOISE",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Counter {
    pub count: u32,
    pub query: Option<String>,
}

impl Counter {
    pub fn with_count(count: u32) -> Self {
        Self { count, query: None }
    }

    pub fn incremented(&self, by: u32) -> Self {
        Self {
            count: self.count + by,
            query: self.query.clone(),
        }
    }

    pub fn searched(&self, query: &str) -> Self {
        Self {
            count: self.count,
            query: Some(query.to_string()),
        }
    }
}

/// Next emission, failing the test if none arrives in time.
pub async fn next_state<S>(changes: &mut StateStream<S>) -> Arc<S> {
    timeout(WAIT, changes.next())
        .await
        .expect("state emitted within timeout")
        .expect("change stream still open")
}

/// Skip emissions until one satisfies `predicate`.
pub async fn wait_for<S, F>(changes: &mut StateStream<S>, mut predicate: F) -> Arc<S>
where
    F: FnMut(&S) -> bool,
{
    loop {
        let state = next_state(changes).await;
        if predicate(&state) {
            return state;
        }
    }
}

/// Every remaining emission until the stream completes.
pub async fn drain<S>(changes: StateStream<S>) -> Vec<Arc<S>> {
    timeout(WAIT, changes.collect::<Vec<_>>())
        .await
        .expect("change stream completed within timeout")
}
