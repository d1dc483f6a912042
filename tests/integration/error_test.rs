//! Handler failure isolation tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use tessera::{ErrorRecord, ErrorStream, Unit, UnitError};
use tokio::time::timeout;

use crate::common::{next_state, Counter, CounterEvent, WAIT};

fn failing_unit() -> Unit<CounterEvent, Counter> {
    Unit::<CounterEvent, Counter>::builder(Counter::default())
        .on("FAIL", |event, _ctx| async move {
            match event.as_ref() {
                CounterEvent::Fail(reason) => Err(reason.clone().into()),
                _ => Ok(()),
            }
        })
        .on("PANIC", |_event, _ctx| async move { panic!("handler blew up") })
        .on_sync("SLOW", |_event, _ctx| panic!("sync handler blew up"))
        .on("INC", |_event, ctx| async move {
            ctx.update(|s| s.incremented(1));
            Ok(())
        })
        .build()
}

async fn next_error(errors: &mut ErrorStream<CounterEvent>) -> ErrorRecord<CounterEvent> {
    timeout(WAIT, errors.next())
        .await
        .expect("error within timeout")
        .expect("error stream still open")
}

#[tokio::test]
async fn test_handler_error_is_reported_and_pipeline_continues() {
    let unit = failing_unit();
    let mut errors = unit.errors();
    let mut changes = unit.changes();
    next_state(&mut changes).await;

    unit.add(CounterEvent::Fail("disk full".to_string()));
    unit.add(CounterEvent::Inc);

    let record = next_error(&mut errors).await;
    assert_eq!(
        record.event.as_deref(),
        Some(&CounterEvent::Fail("disk full".to_string()))
    );
    assert_eq!(record.error.kind(), Some("FAIL"));
    assert!(!record.is_fatal());
    assert!(record.error.to_string().contains("disk full"));

    assert_eq!(next_state(&mut changes).await.count, 1);
    assert!(!unit.is_closed());
}

#[tokio::test]
async fn test_async_panic_is_contained() {
    let unit = failing_unit();
    let mut errors = unit.errors();

    unit.add(CounterEvent::Panic);
    let record = next_error(&mut errors).await;

    match record.error.as_ref() {
        UnitError::HandlerPanicked { kind, message } => {
            assert_eq!(kind, "PANIC");
            assert_eq!(message, "handler blew up");
        }
        other => panic!("expected HandlerPanicked, got {other:?}"),
    }
    assert!(!unit.is_closed());
}

#[tokio::test]
async fn test_sync_panic_is_contained() {
    let unit = failing_unit();
    let mut errors = unit.errors();
    let mut changes = unit.changes();
    next_state(&mut changes).await;

    unit.add(CounterEvent::Slow(1));
    unit.add(CounterEvent::Inc);

    let record = next_error(&mut errors).await;
    assert!(matches!(
        record.error.as_ref(),
        UnitError::HandlerPanicked { message, .. } if message == "sync handler blew up"
    ));
    assert_eq!(next_state(&mut changes).await.count, 1);
}

#[tokio::test]
async fn test_callback_and_stream_both_observe_failures() {
    let seen = Arc::new(Mutex::new(Vec::<String>::new()));
    let sink = Arc::clone(&seen);

    let unit = Unit::<CounterEvent, Counter>::builder(Counter::default())
        .on("FAIL", |_event, _ctx| async move { Err("nope".into()) })
        .on_error(move |record| {
            sink.lock().unwrap().push(record.error.to_string());
        })
        .build();
    let mut errors = unit.errors();

    unit.add(CounterEvent::Fail(String::new()));
    unit.add(CounterEvent::Fail(String::new()));

    next_error(&mut errors).await;
    next_error(&mut errors).await;
    assert_eq!(seen.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn test_errors_from_superseded_execution_are_not_reported() {
    let unit = Unit::<CounterEvent, Counter>::builder(Counter::default())
        .on_with(
            "SEARCH",
            tessera::ConcurrencyStrategy::Restartable,
            |event, ctx| async move {
                let CounterEvent::Search(query) = event.as_ref() else {
                    return Ok(());
                };
                if query == "slow" {
                    ctx.cancelled().await;
                    return Err("cancelled".into());
                }
                Err(format!("failed {query}").into())
            },
        )
        .build();
    let mut errors = unit.errors();

    unit.add(CounterEvent::Search("slow".to_string()));
    tokio::time::sleep(Duration::from_millis(20)).await;
    unit.add(CounterEvent::Search("fast".to_string()));

    let record = next_error(&mut errors).await;
    assert_eq!(record.error.to_string(), "handler for 'SEARCH' failed: failed fast");

    unit.close();
    assert!(errors.next().await.is_none());
}

#[tokio::test]
async fn test_idle_error_subscriber_receives_every_failure() {
    let reported = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&reported);

    let unit = Unit::<CounterEvent, Counter>::builder(Counter::default())
        .on_sync("FAIL", |_event, _ctx| Err("rejected".into()))
        .on_error(move |_record| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .build();
    let errors = unit.errors();

    for _ in 0..2_000 {
        unit.add(CounterEvent::Fail(String::new()));
    }
    timeout(WAIT, async {
        while reported.load(Ordering::SeqCst) < 2_000 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("every failure reported");
    unit.close();

    let records: Vec<_> = timeout(WAIT, errors.collect::<Vec<_>>())
        .await
        .expect("error stream completes");
    assert_eq!(records.len(), 2_000);
    assert!(records.iter().all(|record| record.error.kind() == Some("FAIL")));
}
