//! Unit lifecycle and change stream integration tests.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tessera::{ConcurrencyStrategy, Unit};
use tokio::sync::Notify;
use tokio::time::timeout;
use tokio_test::assert_pending;

use crate::common::{drain, next_state, wait_for, Counter, CounterEvent};

fn counter_unit(initial: Counter) -> Unit<CounterEvent, Counter> {
    Unit::<CounterEvent, Counter>::builder(initial)
        .on_with("INC", ConcurrencyStrategy::Sequential, |_event, ctx| async move {
            ctx.update(|s| s.incremented(1));
            Ok(())
        })
        .build()
}

#[tokio::test]
async fn test_sequential_increments_emit_each_state() {
    let unit = counter_unit(Counter::with_count(0));
    let mut changes = unit.changes();

    for _ in 0..3 {
        unit.add(CounterEvent::Inc);
    }

    let counts: Vec<u32> = changes
        .by_ref()
        .take(4)
        .map(|s| s.count)
        .collect()
        .await;
    assert_eq!(counts, vec![0, 1, 2, 3]);
    assert_eq!(unit.state().count, 3);
}

#[tokio::test]
async fn test_changes_replay_current_without_events() {
    let unit = counter_unit(Counter::with_count(7));

    let mut first = unit.changes();
    let mut second = unit.changes();

    assert_eq!(next_state(&mut first).await.count, 7);
    assert_eq!(next_state(&mut second).await.count, 7);
}

#[tokio::test]
async fn test_late_subscriber_sees_latest_only() {
    let unit = counter_unit(Counter::with_count(0));
    let mut early = unit.changes();

    unit.add(CounterEvent::Inc);
    unit.add(CounterEvent::Inc);
    wait_for(&mut early, |s| s.count == 2).await;

    let mut late = unit.changes();
    assert_eq!(next_state(&mut late).await.count, 2);
}

#[tokio::test]
async fn test_same_state_is_not_republished() {
    let done = Arc::new(Notify::new());
    let signal = Arc::clone(&done);

    let unit = Unit::<CounterEvent, Counter>::builder(Counter::default())
        .on("NOISE", move |_event, ctx| {
            let signal = Arc::clone(&signal);
            async move {
                let unchanged = !ctx.update_arc(Arc::clone);
                let snapshot = Arc::clone(ctx.snapshot());
                let unchanged = unchanged && !ctx.set(snapshot);
                if unchanged {
                    signal.notify_one();
                }
                Ok(())
            }
        })
        .build();
    let mut changes = unit.changes();
    next_state(&mut changes).await;

    unit.add(CounterEvent::Noise);
    timeout(Duration::from_secs(5), done.notified())
        .await
        .expect("handler saw no change");

    let mut pending = tokio_test::task::spawn(changes.next());
    assert_pending!(pending.poll());
}

#[tokio::test]
async fn test_unmatched_event_changes_nothing() {
    let unit = counter_unit(Counter::with_count(1));
    let mut changes = unit.changes();
    let errors = unit.errors();
    next_state(&mut changes).await;

    unit.add(CounterEvent::Noise);
    unit.add(CounterEvent::Inc);

    // INC is processed after NOISE, so once it lands NOISE has been routed.
    assert_eq!(next_state(&mut changes).await.count, 2);

    unit.close();
    assert!(drain(changes).await.is_empty());
    assert!(errors.collect::<Vec<_>>().await.is_empty());
}

#[tokio::test]
async fn test_close_completes_streams_and_ignores_adds() {
    let unit = counter_unit(Counter::with_count(5));
    let changes = unit.changes();
    let errors = unit.errors();

    unit.close();
    unit.close();
    unit.add(CounterEvent::Inc);

    let states = drain(changes).await;
    assert_eq!(states.len(), 1);
    assert!(errors.collect::<Vec<_>>().await.is_empty());

    assert!(unit.is_closed());
    assert_eq!(unit.state().count, 5);

    let after_close = drain(unit.changes()).await;
    assert_eq!(after_close.len(), 1);
    assert_eq!(after_close[0].count, 5);
}

#[tokio::test]
async fn test_close_aborts_in_flight_execution() {
    let entered = Arc::new(Notify::new());
    let signal = Arc::clone(&entered);

    let unit = Unit::<CounterEvent, Counter>::builder(Counter::default())
        .on("SLOW", move |_event, ctx| {
            let signal = Arc::clone(&signal);
            async move {
                signal.notify_one();
                std::future::pending::<()>().await;
                ctx.update(|s| s.incremented(1));
                Ok(())
            }
        })
        .build();
    let changes = unit.changes();

    unit.add(CounterEvent::Slow(1));
    timeout(Duration::from_secs(5), entered.notified())
        .await
        .expect("handler started");

    unit.close();
    let states = drain(changes).await;
    assert_eq!(states.len(), 1);
    assert_eq!(unit.state().count, 0);
}

#[tokio::test]
async fn test_select_emits_only_slice_changes() {
    let unit = Unit::<CounterEvent, Counter>::builder(Counter::default())
        .on("INC", |_event, ctx| async move {
            ctx.update(|s| s.incremented(1));
            Ok(())
        })
        .on("SEARCH", |event, ctx| async move {
            if let CounterEvent::Search(query) = event.as_ref() {
                ctx.update(|s| s.searched(query));
            }
            Ok(())
        })
        .default_strategy(ConcurrencyStrategy::Sequential)
        .build();

    let queries = unit.changes().select(|s| s.query.clone());

    unit.add(CounterEvent::Inc);
    unit.add(CounterEvent::Search("rust".to_string()));
    unit.add(CounterEvent::Inc);
    unit.add(CounterEvent::Search("tokio".to_string()));

    let mut changes = unit.changes();
    wait_for(&mut changes, |s| s.query.as_deref() == Some("tokio") && s.count == 2).await;
    unit.close();

    let seen: Vec<Option<String>> = timeout(Duration::from_secs(5), queries.collect())
        .await
        .expect("select stream completes");
    assert_eq!(
        seen,
        vec![None, Some("rust".to_string()), Some("tokio".to_string())]
    );
}
