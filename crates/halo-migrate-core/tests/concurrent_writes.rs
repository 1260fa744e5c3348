//! Migrations under a steady stream of application writes.

mod common;

use common::*;
use halo_migrate_core::error::Error;
use halo_migrate_core::migration::{CancellationToken, Executor, MigrationRequest, Phase};
use halo_migrate_core::{CaptureKind, Row, StorageEngine, Value};
use pretty_assertions::assert_eq;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const SEEDED: i64 = 2_000;

/// Upsert with whatever shape the live table has right now. A write racing
/// the swap is rejected for its width and retried.
fn upsert_current_shape(engine: &StorageEngine, id: i64, email: &str) {
    loop {
        let width = engine.describe(ACCOUNTS).unwrap().columns.len();
        let mut values = vec![Value::Int(id), Value::Text(email.to_string())];
        if width == 3 {
            values.push(Value::Int(0));
        }
        match engine.upsert(ACCOUNTS, Row::new(values)) {
            Ok(()) => return,
            Err(Error::InvalidRow { .. }) => continue,
            Err(e) => panic!("write to {} failed: {}", id, e),
        }
    }
}

/// Random upserts and deletes until `stop`; returns the expected contents.
fn write_until(engine: &StorageEngine, stop: &AtomicBool, seed: u64) -> BTreeMap<i64, String> {
    let mut expected: BTreeMap<i64, String> = (0..SEEDED)
        .map(|id| (id, format!("user{}@example.com", id)))
        .collect();
    let mut rng = StdRng::seed_from_u64(seed);
    let mut n = 0u64;
    while !stop.load(Ordering::SeqCst) {
        n += 1;
        let id = rng.gen_range(0..3_000);
        if rng.gen_bool(0.25) {
            engine.delete(ACCOUNTS, &[Value::Int(id)]).unwrap();
            expected.remove(&id);
        } else {
            let email = format!("user{}-v{}@example.com", id, n);
            upsert_current_shape(engine, id, &email);
            expected.insert(id, email);
        }
    }
    expected
}

fn migrate_under_load(capture: CaptureKind) {
    let engine = temp_engine();
    seed_accounts(&engine, SEEDED);
    let executor = Executor::open(engine.clone(), fast_config().with_capture(capture)).unwrap();
    executor
        .start(
            MigrationRequest::new(ACCOUNTS, "ADD COLUMN score int NOT NULL DEFAULT 0")
                .with_id("under_load"),
        )
        .unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let writer = {
        let engine = engine.clone();
        let stop = Arc::clone(&stop);
        std::thread::spawn(move || write_until(&engine, &stop, 42))
    };
    std::thread::sleep(Duration::from_millis(20));

    let done = executor
        .run("under_load", &CancellationToken::new())
        .unwrap();
    // keep writing against the new table for a moment
    std::thread::sleep(Duration::from_millis(50));
    stop.store(true, Ordering::SeqCst);
    let expected = writer.join().unwrap();

    assert_eq!(done.phase, Phase::Complete);
    assert!(done.entries_applied > 0);

    let actual: BTreeMap<i64, String> = engine
        .scan(ACCOUNTS)
        .unwrap()
        .into_iter()
        .map(|row| match row.values.as_slice() {
            [Value::Int(id), Value::Text(email), Value::Int(0)] => (*id, email.clone()),
            other => panic!("unexpected row {:?}", other),
        })
        .collect();
    assert_eq!(actual.len(), expected.len());
    assert_eq!(actual, expected);
    assert!(engine.describe(ACCOUNTS).unwrap().capture.is_none());
}

#[test]
fn test_trigger_capture_under_load() {
    migrate_under_load(CaptureKind::Trigger);
}

#[test]
fn test_log_stream_capture_under_load() {
    migrate_under_load(CaptureKind::LogStream);
}
