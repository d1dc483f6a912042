//! Configuration-driven unit tests.

use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serial_test::serial;
use tessera::{ConcurrencyStrategy, Unit, UnitConfig};
use tokio::time::sleep;

use crate::common::{wait_for, Counter, CounterEvent};

fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".yaml")
        .tempfile()
        .expect("create temp config");
    writeln!(file, "{contents}").expect("write temp config");
    file
}

#[tokio::test(start_paused = true)]
#[serial]
async fn test_loaded_default_strategy_governs_unqualified_handlers() {
    let file = write_config("name: droppy\ndefault_strategy: first");
    let config = UnitConfig::load(file.path().to_str()).expect("config loads");
    assert_eq!(config.default_strategy, ConcurrencyStrategy::Droppable);

    let invocations = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&invocations);
    let unit = Unit::<CounterEvent, Counter>::builder(Counter::default())
        .on("SLOW", move |_event, ctx| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                sleep(Duration::from_millis(50)).await;
                ctx.update(|s| s.incremented(1));
                Ok(())
            }
        })
        .config(config)
        .build();
    let mut changes = unit.changes();

    for n in 0..5 {
        unit.add(CounterEvent::Slow(n));
    }
    wait_for(&mut changes, |s| s.count == 1).await;
    sleep(Duration::from_millis(100)).await;

    assert_eq!(invocations.load(Ordering::SeqCst), 1);
}

#[tokio::test]
#[serial]
async fn test_explicit_strategy_overrides_configured_default() {
    let file = write_config("default_strategy: droppable");
    let config = UnitConfig::load(file.path().to_str()).expect("config loads");

    let unit = Unit::<CounterEvent, Counter>::builder(Counter::default())
        .on_with("INC", ConcurrencyStrategy::Sequential, |_event, ctx| async move {
            ctx.update(|s| s.incremented(1));
            Ok(())
        })
        .config(config)
        .build();
    let mut changes = unit.changes();

    for _ in 0..4 {
        unit.add(CounterEvent::Inc);
    }
    let state = wait_for(&mut changes, |s| s.count == 4).await;
    assert_eq!(state.count, 4);
}

#[tokio::test]
#[serial]
async fn test_blank_name_is_rejected() {
    let file = write_config("name: \"\"");
    let result = UnitConfig::load(file.path().to_str());
    assert!(matches!(result, Err(tessera::ConfigError::Invalid(_))));
}
