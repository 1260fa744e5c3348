//! End-to-end migrations against the embedded engine.

mod common;

use common::*;
use halo_migrate_core::error::Error;
use halo_migrate_core::migration::{
    CancellationToken, CutoverState, ErrorCategory, Executor, LockLevel, MigrateError,
    MigrationRequest, MigrationState, MigrationStateStore, MigrationStatus, Phase, Strategy,
};
use halo_migrate_core::storage::Row;
use halo_migrate_core::{ColumnDef, ColumnType, StorageEngine, TableDef, Value};
use pretty_assertions::assert_eq;
use std::time::Duration;

const ADD_SCORE: &str = "ADD COLUMN score int NOT NULL DEFAULT 0";

fn table_names(executor: &Executor<StorageEngine>) -> Vec<String> {
    executor
        .host()
        .list_tables()
        .unwrap()
        .into_iter()
        .map(|t| t.name)
        .collect()
}

#[test]
fn test_add_not_null_column_to_10k_rows() {
    let engine = temp_engine();
    seed_accounts(&engine, 10_000);
    let executor = Executor::open(engine.clone(), fast_config()).unwrap();

    let started = executor
        .start(MigrationRequest::new(ACCOUNTS, ADD_SCORE).with_id("add_score"))
        .unwrap();
    assert_eq!(started.phase, Phase::Pending);
    assert_eq!(started.spec.strategy, Strategy::Copy);

    let done = executor.run("add_score", &CancellationToken::new()).unwrap();
    assert_eq!(done.phase, Phase::Complete);
    assert_eq!(done.status, MigrationStatus::Complete);
    assert_eq!(done.copy.rows_copied, 10_000);
    assert_eq!(done.retired_table.as_deref(), Some("accounts_pre_migrate_add_score"));
    assert!(done.completed_at.is_some());

    let live = engine.describe(ACCOUNTS).unwrap();
    assert_eq!(live.columns.len(), 3);
    assert_eq!(live.columns[2], ColumnDef::new("score", ColumnType::Int).not_null().with_default(Value::Int(0)));
    assert!(live.capture.is_none());
    assert!(live.stats.is_some());
    assert_eq!(engine.count(ACCOUNTS).unwrap(), 10_000);

    // same rows as a table created with the new schema from the start
    let mut expected = TableDef::new(
        "expected",
        vec![
            ColumnDef::new("id", ColumnType::Int).not_null(),
            ColumnDef::new("email", ColumnType::Text),
            ColumnDef::new("score", ColumnType::Int).not_null(),
        ],
        vec!["id"],
    );
    expected.columns[2].default = Some(Value::Int(0));
    engine.create_table(expected).unwrap();
    for id in 0..10_000 {
        let row = Row::new(vec![
            Value::Int(id),
            Value::Text(format!("user{}@example.com", id)),
            Value::Int(0),
        ]);
        engine.insert("expected", row).unwrap();
    }
    assert_eq!(engine.digest(ACCOUNTS).unwrap(), engine.digest("expected").unwrap());

    engine.drop_table("expected").unwrap();
    assert_eq!(table_names(&executor), vec![ACCOUNTS.to_string()]);
    assert!(!engine
        .db()
        .tree_names()
        .iter()
        .any(|name| name.starts_with(b"capture:")));
}

#[test]
fn test_phase_history_of_copy_migration() {
    let engine = temp_engine();
    seed_accounts(&engine, 50);
    let executor = Executor::open(engine, fast_config()).unwrap();
    executor
        .start(MigrationRequest::new(ACCOUNTS, "DROP COLUMN email").with_id("m1"))
        .unwrap();
    let done = executor.run("m1", &CancellationToken::new()).unwrap();

    let phases: Vec<Phase> = done.history.iter().map(|t| t.to).collect();
    assert_eq!(
        phases,
        vec![
            Phase::Copying,
            Phase::BuildingIndexes,
            Phase::Syncing,
            Phase::Cutover(CutoverState::Preparing),
            Phase::Cutover(CutoverState::LockAcquired),
            Phase::Cutover(CutoverState::Swapped),
            Phase::Cutover(CutoverState::Cleanup),
            Phase::Cutover(CutoverState::Done),
            Phase::Complete,
        ]
    );
    assert_eq!(done.cutover_attempts, 1);

    let live = executor.host().describe(ACCOUNTS).unwrap();
    assert_eq!(live.columns.len(), 1);
    let row = executor.host().get(ACCOUNTS, &[Value::Int(7)]).unwrap().unwrap();
    assert_eq!(row.values, vec![Value::Int(7)]);
}

/// Distinct phases of the saved migration records, in save order.
fn saved_phases(subscriber: &mut sled::Subscriber) -> Vec<Phase> {
    let mut phases = Vec::new();
    while let Ok(event) = subscriber.next_timeout(Duration::from_millis(200)) {
        if let sled::Event::Insert { value, .. } = event {
            let state = MigrationState::from_bytes(&value).unwrap();
            if phases.last() != Some(&state.phase) {
                phases.push(state.phase);
            }
        }
    }
    phases
}

fn watch_saves(engine: &StorageEngine) -> sled::Subscriber {
    engine
        .db()
        .open_tree(MigrationStateStore::TREE_NAME)
        .unwrap()
        .watch_prefix(b"migration:")
}

#[test]
fn test_every_cutover_state_is_saved() {
    let engine = temp_engine();
    seed_accounts(&engine, 50);
    let executor = Executor::open(engine.clone(), fast_config()).unwrap();

    executor
        .start(MigrationRequest::new(ACCOUNTS, "RENAME COLUMN email TO contact").with_id("rename"))
        .unwrap();
    let mut saves = watch_saves(&engine);
    executor.run("rename", &CancellationToken::new()).unwrap();
    assert_eq!(
        saved_phases(&mut saves),
        vec![
            Phase::Pending,
            Phase::Cutover(CutoverState::Preparing),
            Phase::Cutover(CutoverState::LockAcquired),
            Phase::Cutover(CutoverState::Swapped),
            Phase::Cutover(CutoverState::Cleanup),
            Phase::Cutover(CutoverState::Done),
            Phase::Complete,
        ]
    );

    executor
        .start(MigrationRequest::new(ACCOUNTS, ADD_SCORE).with_id("copy"))
        .unwrap();
    let mut saves = watch_saves(&engine);
    executor.run("copy", &CancellationToken::new()).unwrap();
    let cutover: Vec<Phase> = saved_phases(&mut saves)
        .into_iter()
        .filter(|phase| matches!(phase, Phase::Cutover(_) | Phase::Complete))
        .collect();
    assert_eq!(
        cutover,
        vec![
            Phase::Cutover(CutoverState::Preparing),
            Phase::Cutover(CutoverState::LockAcquired),
            Phase::Cutover(CutoverState::Swapped),
            Phase::Cutover(CutoverState::Cleanup),
            Phase::Cutover(CutoverState::Done),
            Phase::Complete,
        ]
    );
}

#[test]
fn test_advance_steps_one_phase_at_a_time() {
    let engine = temp_engine();
    seed_accounts(&engine, 20);
    let executor = Executor::open(engine, fast_config()).unwrap();
    executor
        .start(MigrationRequest::new(ACCOUNTS, ADD_SCORE).with_id("stepwise"))
        .unwrap();
    let cancel = CancellationToken::new();

    let state = executor.advance("stepwise", &cancel).unwrap();
    assert_eq!(state.phase, Phase::Copying);
    assert_eq!(state.status, MigrationStatus::Paused);
    assert_eq!(
        table_names(&executor),
        vec![ACCOUNTS.to_string(), "_migrate_accounts_stepwise".to_string()]
    );
    assert!(executor.host().describe(ACCOUNTS).unwrap().capture.is_some());

    assert_eq!(executor.advance("stepwise", &cancel).unwrap().phase, Phase::BuildingIndexes);
    assert_eq!(executor.advance("stepwise", &cancel).unwrap().phase, Phase::Syncing);
    assert_eq!(
        executor.advance("stepwise", &cancel).unwrap().phase,
        Phase::Cutover(CutoverState::Preparing)
    );
    // the live table is still the original one
    assert_eq!(executor.host().describe(ACCOUNTS).unwrap().columns.len(), 2);

    let done = executor.resume("stepwise", &cancel).unwrap();
    assert_eq!(done.phase, Phase::Complete);
    assert_eq!(executor.host().describe(ACCOUNTS).unwrap().columns.len(), 3);
}

#[test]
fn test_in_place_rename_keeps_storage() {
    let engine = temp_engine();
    seed_accounts(&engine, 100);
    let before = engine.describe(ACCOUNTS).unwrap();
    let digest = engine.digest(ACCOUNTS).unwrap();
    let executor = Executor::open(engine.clone(), fast_config()).unwrap();

    let request = MigrationRequest::new(ACCOUNTS, "RENAME COLUMN email TO contact").with_id("rename");
    let plan = executor.plan(&request).unwrap();
    assert_eq!(plan.strategy, Strategy::InPlace);
    assert!(!plan.rewrites_rows);
    assert_eq!(plan.max_lock(), LockLevel::TableExclusive);

    executor.start(request).unwrap();
    let done = executor.run("rename", &CancellationToken::new()).unwrap();
    assert_eq!(done.phase, Phase::Complete);
    assert!(done.shadow.is_none());
    assert!(done.retired_table.is_none());

    let after = engine.describe(ACCOUNTS).unwrap();
    assert_eq!(after.storage_id, before.storage_id);
    assert_eq!(after.columns[1].name, "contact");
    assert_eq!(engine.digest(ACCOUNTS).unwrap(), digest);
    assert_eq!(table_names(&executor), vec![ACCOUNTS.to_string()]);
}

#[test]
fn test_in_place_rejected_for_row_rewrite() {
    let engine = temp_engine();
    seed_accounts(&engine, 10);
    let executor = Executor::open(engine, fast_config()).unwrap();

    let err = executor
        .start(MigrationRequest::new(ACCOUNTS, ADD_SCORE).with_strategy(Strategy::InPlace))
        .unwrap_err();
    assert!(matches!(err, MigrateError::UnsupportedDelta(_)));
    assert_eq!(err.category().exit_code(), 2);
    assert!(executor.list().unwrap().is_empty());
}

#[test]
fn test_type_change_converts_rows() {
    let engine = temp_engine();
    engine
        .create_table(TableDef::new(
            "readings",
            vec![
                ColumnDef::new("id", ColumnType::Int).not_null(),
                ColumnDef::new("value", ColumnType::Int),
            ],
            vec!["id"],
        ))
        .unwrap();
    for id in 0..10 {
        engine
            .insert("readings", Row::new(vec![Value::Int(id), Value::Int(id * 10)]))
            .unwrap();
    }
    let executor = Executor::open(engine.clone(), fast_config()).unwrap();
    executor
        .start(MigrationRequest::new("readings", "ALTER COLUMN value TYPE float").with_id("to_float"))
        .unwrap();
    executor.run("to_float", &CancellationToken::new()).unwrap();

    let row = engine.get("readings", &[Value::Int(3)]).unwrap().unwrap();
    assert_eq!(row.values, vec![Value::Int(3), Value::Float(30.0)]);
}

/// Run `alter` to its failure and check that nothing of the migration is
/// left behind.
fn assert_data_error_aborts(engine: &StorageEngine, id: &str, alter: &str) -> MigrateError {
    let digest = engine.digest(ACCOUNTS).unwrap();
    let executor = Executor::open(engine.clone(), fast_config()).unwrap();
    executor
        .start(MigrationRequest::new(ACCOUNTS, alter).with_id(id))
        .unwrap();
    let err = executor.run(id, &CancellationToken::new()).unwrap_err();
    assert_eq!(err.category(), ErrorCategory::User);

    let state = executor.status(id).unwrap();
    assert_eq!(state.phase, Phase::Aborted);
    assert_eq!(state.status, MigrationStatus::Aborted);
    assert_eq!(state.last_error.unwrap().category, ErrorCategory::User);
    assert!(executor.store().active_for_target(ACCOUNTS).unwrap().is_none());

    assert_eq!(engine.digest(ACCOUNTS).unwrap(), digest);
    assert!(engine.describe(ACCOUNTS).unwrap().capture.is_none());
    assert_eq!(table_names(&executor), vec![ACCOUNTS.to_string()]);
    assert!(!engine
        .db()
        .tree_names()
        .iter()
        .any(|name| name.starts_with(b"capture:")));

    // the table is free for a corrected migration
    executor
        .start(MigrationRequest::new(ACCOUNTS, "ADD COLUMN note text").with_id("followup"))
        .unwrap();
    err
}

#[test]
fn test_unique_constraint_on_duplicates_aborts() {
    let engine = temp_engine();
    seed_accounts(&engine, 100);
    engine.upsert(ACCOUNTS, account(50, "dup@example.com")).unwrap();
    engine.upsert(ACCOUNTS, account(51, "dup@example.com")).unwrap();

    let err = assert_data_error_aborts(
        &engine,
        "uniq",
        "ADD CONSTRAINT accounts_email_key UNIQUE (email)",
    );
    assert!(matches!(err, MigrateError::ConstraintViolation(_)), "{err}");
}

#[test]
fn test_set_not_null_over_nulls_aborts() {
    let engine = temp_engine();
    seed_accounts(&engine, 100);
    engine
        .upsert(ACCOUNTS, Row::new(vec![Value::Int(42), Value::Null]))
        .unwrap();

    let err = assert_data_error_aborts(&engine, "not_null", "ALTER COLUMN email SET NOT NULL");
    assert!(matches!(err, MigrateError::ConstraintViolation(_)), "{err}");
    assert_eq!(
        engine.get(ACCOUNTS, &[Value::Int(42)]).unwrap().unwrap().values[1],
        Value::Null
    );
}

#[test]
fn test_failing_check_constraint_aborts() {
    let engine = temp_engine();
    seed_accounts(&engine, 100);

    let err = assert_data_error_aborts(
        &engine,
        "check",
        "ADD CONSTRAINT small_ids CHECK (id < 50)",
    );
    assert!(matches!(err, MigrateError::ConstraintViolation(_)), "{err}");
}

#[test]
fn test_failed_type_conversion_aborts() {
    let engine = temp_engine();
    seed_accounts(&engine, 100);

    let err = assert_data_error_aborts(&engine, "to_int", "ALTER COLUMN email TYPE int");
    assert!(matches!(err, MigrateError::ConversionFailed(_)), "{err}");
}

#[test]
fn test_unique_constraint_enforced_after_cutover() {
    let engine = temp_engine();
    seed_accounts(&engine, 100);
    let executor = Executor::open(engine.clone(), fast_config()).unwrap();
    executor
        .start(
            MigrationRequest::new(ACCOUNTS, "ADD CONSTRAINT accounts_email_key UNIQUE (email)")
                .with_id("uniq"),
        )
        .unwrap();
    executor.run("uniq", &CancellationToken::new()).unwrap();

    let err = engine
        .insert(ACCOUNTS, account(500, "user7@example.com"))
        .unwrap_err();
    assert!(matches!(err, Error::UniqueViolation { .. }));
    engine.insert(ACCOUNTS, account(500, "fresh@example.com")).unwrap();
}

#[test]
fn test_start_validation() {
    let engine = temp_engine();
    seed_accounts(&engine, 10);
    let executor = Executor::open(engine, fast_config()).unwrap();

    let err = executor
        .start(MigrationRequest::new("missing", ADD_SCORE))
        .unwrap_err();
    assert!(matches!(err, MigrateError::InvalidTarget { .. }));

    let err = executor
        .start(MigrationRequest::new(ACCOUNTS, "ALTER TABLE users ADD COLUMN x int"))
        .unwrap_err();
    assert!(matches!(err, MigrateError::UnsupportedDelta(_)));

    let err = executor
        .start(MigrationRequest::new(ACCOUNTS, "ADD COLUMN"))
        .unwrap_err();
    assert!(matches!(err, MigrateError::Parse(_)));
    assert_eq!(err.category(), ErrorCategory::User);

    let err = executor
        .start(MigrationRequest::new(ACCOUNTS, "ADD COLUMN score int NOT NULL"))
        .unwrap_err();
    assert!(matches!(err, MigrateError::UnsupportedDelta(_)));

    let err = executor
        .start(MigrationRequest::new(ACCOUNTS, ADD_SCORE).with_id("bad-id"))
        .unwrap_err();
    assert!(matches!(err, MigrateError::InvalidId(_)));

    let err = executor
        .start(MigrationRequest::new("_migrate_accounts_x", ADD_SCORE))
        .unwrap_err();
    assert!(matches!(err, MigrateError::InvalidTarget { .. }));

    assert!(matches!(
        executor.status("nope").unwrap_err(),
        MigrateError::MigrationNotFound(_)
    ));
    assert!(executor.list().unwrap().is_empty());
}

#[test]
fn test_one_migration_per_table() {
    let engine = temp_engine();
    seed_accounts(&engine, 10);
    let executor = Executor::open(engine, fast_config()).unwrap();

    executor
        .start(MigrationRequest::new(ACCOUNTS, ADD_SCORE).with_id("first"))
        .unwrap();
    let err = executor
        .start(MigrationRequest::new(ACCOUNTS, "DROP COLUMN email").with_id("second"))
        .unwrap_err();
    match err {
        MigrateError::MigrationInProgress { table, migration_id } => {
            assert_eq!(table, ACCOUNTS);
            assert_eq!(migration_id, "first");
        }
        other => panic!("unexpected error: {other}"),
    }

    // same id again is refused while the first is live
    let err = executor
        .start(MigrationRequest::new(ACCOUNTS, ADD_SCORE).with_id("first"))
        .unwrap_err();
    assert!(matches!(err, MigrateError::InvalidTransition { .. }));

    executor.run("first", &CancellationToken::new()).unwrap();
    executor
        .start(MigrationRequest::new(ACCOUNTS, "DROP COLUMN email").with_id("second"))
        .unwrap();
}

#[test]
fn test_abort_lifecycle_and_id_reuse() {
    let engine = temp_engine();
    seed_accounts(&engine, 200);
    let digest = engine.digest(ACCOUNTS).unwrap();
    let executor = Executor::open(engine.clone(), fast_config()).unwrap();
    let cancel = CancellationToken::new();

    executor
        .start(MigrationRequest::new(ACCOUNTS, ADD_SCORE).with_id("again"))
        .unwrap();
    executor.advance("again", &cancel).unwrap();
    executor.advance("again", &cancel).unwrap();

    let aborted = executor.abort("again").unwrap();
    assert_eq!(aborted.phase, Phase::Aborted);
    assert_eq!(aborted.status, MigrationStatus::Aborted);
    // idempotent
    assert_eq!(executor.abort("again").unwrap().phase, Phase::Aborted);
    assert!(matches!(
        executor.resume("again", &cancel).unwrap_err(),
        MigrateError::InvalidTransition { .. }
    ));

    assert_eq!(engine.digest(ACCOUNTS).unwrap(), digest);
    assert_eq!(table_names(&executor), vec![ACCOUNTS.to_string()]);
    assert!(engine.describe(ACCOUNTS).unwrap().capture.is_none());

    let restarted = executor
        .start(MigrationRequest::new(ACCOUNTS, ADD_SCORE).with_id("again"))
        .unwrap();
    assert_eq!(restarted.phase, Phase::Pending);
    assert!(restarted.history.is_empty());
    let done = executor.run("again", &cancel).unwrap();
    assert_eq!(done.phase, Phase::Complete);

    let err = executor.abort("again").unwrap_err();
    assert!(matches!(err, MigrateError::InvalidTransition { action: "abort", .. }));
    assert!(matches!(
        executor.pause("again").unwrap_err(),
        MigrateError::InvalidTransition { .. }
    ));
}

#[test]
fn test_list_reports_all_migrations() {
    let engine = temp_engine();
    seed_accounts(&engine, 5);
    engine
        .create_table(TableDef::new(
            "events",
            vec![ColumnDef::new("id", ColumnType::Int).not_null()],
            vec!["id"],
        ))
        .unwrap();
    let executor = Executor::open(engine, fast_config()).unwrap();

    executor
        .start(MigrationRequest::new(ACCOUNTS, ADD_SCORE).with_id("a1"))
        .unwrap();
    executor
        .start(MigrationRequest::new("events", "ADD COLUMN kind text").with_id("e1"))
        .unwrap();
    executor.run("e1", &CancellationToken::new()).unwrap();

    let listed: Vec<(String, Phase)> = executor
        .list()
        .unwrap()
        .into_iter()
        .map(|s| (s.migration_id, s.phase))
        .collect();
    assert_eq!(
        listed,
        vec![
            ("a1".to_string(), Phase::Pending),
            ("e1".to_string(), Phase::Complete),
        ]
    );
}
