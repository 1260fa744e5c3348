//! Command dispatch.

use crate::config::{Args, Command, SeedArgs, StartArgs, TargetArgs};
use crate::control::{self, ControlRequest};
use crate::error::CliError;
use crate::formatter::Formatter;
use halo_migrate_core::migration::{validate_migration_id, MigrationRequest};
use halo_migrate_core::{
    CancellationToken, ColumnDef, ColumnType, Executor, MigrateError, MigrationConfig,
    MigrationState, Row, StorageEngine, TableDef, Value,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;

type EngineExecutor = Executor<StorageEngine>;

/// Run a parsed command and return its rendered output.
pub async fn run(args: Args, formatter: &dyn Formatter) -> Result<String, CliError> {
    let engine = match StorageEngine::open(args.storage_config()) {
        Ok(engine) => engine,
        Err(source) => {
            let err = CliError::Open {
                path: args.data_dir.clone(),
                source,
            };
            return leave_request(&args, err, formatter);
        }
    };

    let config = match &args.command {
        Command::Start(start) => start.tuning.into_config(),
        Command::Resume(resume) => resume.tuning.into_config(),
        _ => MigrationConfig::default(),
    };

    match args.command {
        Command::Tables => Ok(formatter.format_tables(&engine.list_tables()?)),
        Command::Describe { table } => describe(&engine, &table, formatter),
        Command::Seed(seed_args) => seed(&engine, &seed_args, formatter),
        command => {
            let executor = Arc::new(Executor::open(engine, config)?);
            run_migration_command(executor, args.data_dir, command, formatter).await
        }
    }
}

/// The database is held by another process, most likely the one running
/// the migration: `pause` and `abort` leave it a request instead.
fn leave_request(args: &Args, err: CliError, formatter: &dyn Formatter) -> Result<String, CliError> {
    let (request, target) = match &args.command {
        Command::Pause(target) => (ControlRequest::Pause, target),
        Command::Abort(target) => (ControlRequest::Abort, target),
        _ => return Err(err),
    };
    let Some(id) = &target.id else {
        return Err(CliError::Usage(format!(
            "{}; pass --id to signal the migration running there",
            err
        )));
    };
    validate_migration_id(id)?;
    let path = control::request(&args.data_dir, id, request).map_err(|e| {
        CliError::Runtime(format!("cannot leave {} request for {}: {}", request, id, e))
    })?;
    tracing::info!(migration_id = %id, path = %path.display(), %request, "control request left for the running process");
    Ok(formatter.format_message(&format!("{} requested for migration {}", request, id)))
}

async fn run_migration_command(
    executor: Arc<EngineExecutor>,
    data_dir: PathBuf,
    command: Command,
    formatter: &dyn Formatter,
) -> Result<String, CliError> {
    match command {
        Command::Start(start) => start_migration(executor, data_dir, start, formatter).await,
        Command::Status(target) => {
            let id = resolve_id(&executor, &target)?;
            Ok(formatter.format_state(&executor.status(&id)?))
        }
        Command::Pause(target) => {
            let id = resolve_id(&executor, &target)?;
            Ok(formatter.format_state(&executor.pause(&id)?))
        }
        Command::Resume(resume) => {
            let id = resolve_id(&executor, &resume.target)?;
            let state = drive(executor, &data_dir, id, true).await?;
            Ok(formatter.format_state(&state))
        }
        Command::Abort(target) => {
            let id = resolve_id(&executor, &target)?;
            Ok(formatter.format_state(&executor.abort(&id)?))
        }
        Command::List => Ok(formatter.format_states(&executor.list()?)),
        Command::Tables | Command::Describe { .. } | Command::Seed(_) => Err(CliError::Usage(
            "command does not operate on migrations".to_string(),
        )),
    }
}

async fn start_migration(
    executor: Arc<EngineExecutor>,
    data_dir: PathBuf,
    start: StartArgs,
    formatter: &dyn Formatter,
) -> Result<String, CliError> {
    let mut request = MigrationRequest::new(&start.table, &start.alter);
    if let Some(id) = start.id {
        request = request.with_id(id);
    }
    if let Some(strategy) = start.strategy {
        request = request.with_strategy(strategy);
    }
    if let Some(capture) = start.capture {
        request = request.with_capture(capture);
    }

    if start.dry_run {
        let plan = executor.plan(&request)?;
        return Ok(formatter.format_plan(&plan));
    }

    let state = executor.start(request)?;
    if let Err(e) = control::clear(&data_dir, &state.migration_id) {
        tracing::warn!(migration_id = %state.migration_id, error = %e, "failed to remove stale control request");
    }
    let state = drive(executor, &data_dir, state.migration_id, false).await?;
    Ok(formatter.format_state(&state))
}

/// Run or resume a migration on a blocking thread. Ctrl-C or a pause
/// request stops it at the next batch boundary, which is not an error; an
/// abort request stops it and then aborts it.
async fn drive(
    executor: Arc<EngineExecutor>,
    data_dir: &Path,
    migration_id: String,
    resume: bool,
) -> Result<MigrationState, CliError> {
    let token = CancellationToken::new();
    let mut worker = {
        let executor = Arc::clone(&executor);
        let token = token.clone();
        let migration_id = migration_id.clone();
        tokio::task::spawn_blocking(move || {
            if resume {
                executor.resume(&migration_id, &token)
            } else {
                executor.run(&migration_id, &token)
            }
        })
    };

    let mut poll = tokio::time::interval(control::POLL_INTERVAL);
    let mut requested = None;
    let joined = loop {
        tokio::select! {
            joined = &mut worker => break joined,
            Ok(()) = tokio::signal::ctrl_c(), if requested.is_none() => {
                tracing::info!(migration_id = %migration_id, "interrupted, pausing at the next batch boundary");
                token.cancel();
                requested = Some(ControlRequest::Pause);
            }
            _ = poll.tick(), if requested.is_none() => match control::take(data_dir, &migration_id) {
                Ok(Some(request)) => {
                    tracing::info!(migration_id = %migration_id, %request, "control request received, stopping at the next batch boundary");
                    token.cancel();
                    requested = Some(request);
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(migration_id = %migration_id, error = %e, "failed to read control request"),
            },
        }
    };

    match joined.map_err(|e| CliError::Runtime(format!("migration task failed: {}", e)))? {
        Ok(state) => Ok(state),
        Err(MigrateError::Cancelled) if requested == Some(ControlRequest::Abort) => {
            Ok(executor.abort(&migration_id)?)
        }
        Err(MigrateError::Cancelled) => Ok(executor.status(&migration_id)?),
        Err(source) => Err(CliError::Stopped {
            migration_id,
            source,
        }),
    }
}

/// Id of the migration a command targets: the given id, else the active
/// migration of the table, else its most recent one.
fn resolve_id(executor: &EngineExecutor, target: &TargetArgs) -> Result<String, CliError> {
    match (&target.id, &target.table) {
        (Some(id), Some(table)) => {
            let state = executor.status(id)?;
            if state.table() != table {
                return Err(CliError::Usage(format!(
                    "migration {} belongs to table {}, not {}",
                    id,
                    state.table(),
                    table
                )));
            }
            Ok(id.clone())
        }
        (Some(id), None) => Ok(id.clone()),
        (None, Some(table)) => {
            if let Some(active) = executor.store().active_for_target(table)? {
                return Ok(active.migration_id);
            }
            executor
                .list()?
                .into_iter()
                .filter(|state| state.table() == table)
                .last()
                .map(|state| state.migration_id)
                .ok_or_else(|| CliError::Usage(format!("no migration found for table {}", table)))
        }
        (None, None) => Err(CliError::Usage("pass --table or --id".to_string())),
    }
}

fn describe(
    engine: &StorageEngine,
    table: &str,
    formatter: &dyn Formatter,
) -> Result<String, CliError> {
    let def = match engine.describe(table) {
        Ok(def) => def,
        Err(halo_migrate_core::Error::TableNotFound(name)) => {
            return Err(CliError::Usage(format!("table not found: {}", name)))
        }
        Err(e) => return Err(e.into()),
    };
    let rows = engine.count(table)?;
    let digest = engine.digest(table)?;
    Ok(formatter.format_table(&def, rows, &digest))
}

/// Columns of the demo table created by `seed`.
fn seed_table(name: &str) -> TableDef {
    TableDef::new(
        name,
        vec![
            ColumnDef::new("id", ColumnType::Int).not_null(),
            ColumnDef::new("name", ColumnType::Text),
            ColumnDef::new("balance", ColumnType::Int),
        ],
        vec!["id"],
    )
}

fn seed(engine: &StorageEngine, args: &SeedArgs, formatter: &dyn Formatter) -> Result<String, CliError> {
    if args.rows < 0 {
        return Err(CliError::Usage("--rows must not be negative".to_string()));
    }
    match engine.create_table(seed_table(&args.table)) {
        Ok(_) => {}
        Err(halo_migrate_core::Error::TableExists(name)) => {
            return Err(CliError::Usage(format!("table already exists: {}", name)))
        }
        Err(e) => return Err(e.into()),
    }
    for id in 0..args.rows {
        engine.insert(
            &args.table,
            Row::new(vec![
                Value::Int(id),
                Value::Text(format!("customer{}", id)),
                Value::Int((id * 37) % 1000),
            ]),
        )?;
    }
    engine.flush()?;
    tracing::info!(table = %args.table, rows = args.rows, "seeded table");
    Ok(formatter.format_message(&format!("seeded {} rows into {}", args.rows, args.table)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formatter::JsonFormatter;
    use clap::Parser;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn exec(dir: &TempDir, argv: &[&str]) -> Result<serde_json::Value, CliError> {
        let data_dir = dir.path().join("db");
        let data_dir = data_dir.to_string_lossy().to_string();
        let mut full = vec!["halo_migrate", "--data-dir", data_dir.as_str(), "--format", "json"];
        full.extend_from_slice(argv);
        let args = Args::try_parse_from(full).unwrap();
        let output = run(args, &JsonFormatter).await?;
        Ok(serde_json::from_str(&output).unwrap())
    }

    const FAST: [&str; 6] = [
        "--batch-delay-ms",
        "0",
        "--converge-polls",
        "1",
        "--wait-timeout",
        "5",
    ];

    fn slow_start(id: &'static str) -> Vec<&'static str> {
        vec![
            "start",
            "--table",
            "customers",
            "--alter",
            "ADD COLUMN tier int NOT NULL DEFAULT 1",
            "--id",
            id,
            "--batch-size",
            "100",
            "--batch-delay-ms",
            "50",
            "--converge-polls",
            "1",
            "--wait-timeout",
            "5",
        ]
    }

    /// Start a slow migration and leave `request` for it while it copies.
    async fn start_then_request(
        dir: &TempDir,
        id: &'static str,
        request: ControlRequest,
    ) -> serde_json::Value {
        let data_dir = dir.path().join("db");
        let args = slow_start(id);
        let (stopped, ()) = tokio::join!(exec(dir, &args), async {
            tokio::time::sleep(Duration::from_millis(300)).await;
            control::request(&data_dir, id, request).unwrap();
        });
        assert!(!control::control_path(&data_dir, id).exists());
        stopped.unwrap()
    }

    #[tokio::test]
    async fn test_seed_and_describe() {
        let dir = TempDir::new().unwrap();
        let seeded = exec(&dir, &["seed", "--table", "customers", "--rows", "25"])
            .await
            .unwrap();
        assert_eq!(seeded["message"], "seeded 25 rows into customers");

        let described = exec(&dir, &["describe", "--table", "customers"]).await.unwrap();
        assert_eq!(described["rows"], 25);
        assert_eq!(described["columns"].as_array().unwrap().len(), 3);

        let tables = exec(&dir, &["tables"]).await.unwrap();
        assert_eq!(tables[0]["name"], "customers");

        let err = exec(&dir, &["seed", "--table", "customers"]).await.unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[tokio::test]
    async fn test_describe_missing_table_is_user_error() {
        let dir = TempDir::new().unwrap();
        let err = exec(&dir, &["describe", "--table", "nope"]).await.unwrap_err();
        assert!(matches!(err, CliError::Usage(_)));
        assert_eq!(err.exit_code(), 2);
    }

    #[tokio::test]
    async fn test_start_runs_to_completion() {
        let dir = TempDir::new().unwrap();
        exec(&dir, &["seed", "--table", "customers", "--rows", "300"])
            .await
            .unwrap();

        let mut argv = vec![
            "start",
            "--table",
            "customers",
            "--alter",
            "ADD COLUMN tier int NOT NULL DEFAULT 1",
            "--id",
            "add_tier",
        ];
        argv.extend_from_slice(&FAST);
        let done = exec(&dir, &argv).await.unwrap();
        assert_eq!(done["migration_id"], "add_tier");
        assert_eq!(done["phase"], "complete");
        assert_eq!(done["rows_copied"], 300);

        let described = exec(&dir, &["describe", "--table", "customers"]).await.unwrap();
        assert_eq!(described["columns"].as_array().unwrap().len(), 4);
        assert_eq!(described["rows"], 300);

        let status = exec(&dir, &["status", "--table", "customers"]).await.unwrap();
        assert_eq!(status["migration_id"], "add_tier");

        let listed = exec(&dir, &["list"]).await.unwrap();
        assert_eq!(listed.as_array().unwrap().len(), 1);

        let err = exec(&dir, &["abort", "--id", "add_tier"]).await.unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[tokio::test]
    async fn test_dry_run_records_nothing() {
        let dir = TempDir::new().unwrap();
        exec(&dir, &["seed", "--table", "customers", "--rows", "10"])
            .await
            .unwrap();

        let plan = exec(
            &dir,
            &[
                "start",
                "--table",
                "customers",
                "--alter",
                "DROP COLUMN balance",
                "--id",
                "drop_balance",
                "--dry-run",
            ],
        )
        .await
        .unwrap();
        assert_eq!(plan["migration_id"], "drop_balance");
        assert_eq!(plan["strategy"], "copy");
        assert_eq!(plan["target"]["columns"].as_array().unwrap().len(), 2);
        assert!(!plan["steps"].as_array().unwrap().is_empty());

        let listed = exec(&dir, &["list"]).await.unwrap();
        assert_eq!(listed, serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_bad_alter_is_user_error() {
        let dir = TempDir::new().unwrap();
        exec(&dir, &["seed", "--table", "customers", "--rows", "5"])
            .await
            .unwrap();
        let err = exec(
            &dir,
            &["start", "--table", "customers", "--alter", "ADD COLUMN"],
        )
        .await
        .unwrap_err();
        assert_eq!(err.exit_code(), 2);

        let listed = exec(&dir, &["list"]).await.unwrap();
        assert_eq!(listed, serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_target_resolution() {
        let dir = TempDir::new().unwrap();
        let err = exec(&dir, &["status"]).await.unwrap_err();
        assert!(matches!(err, CliError::Usage(_)));

        let err = exec(&dir, &["status", "--table", "customers"]).await.unwrap_err();
        assert!(matches!(err, CliError::Usage(_)));

        let err = exec(&dir, &["status", "--id", "missing"]).await.unwrap_err();
        assert!(matches!(
            err,
            CliError::Migrate(MigrateError::MigrationNotFound(_))
        ));

        exec(&dir, &["seed", "--table", "customers", "--rows", "5"])
            .await
            .unwrap();
        exec(&dir, &["seed", "--table", "orders", "--rows", "5"])
            .await
            .unwrap();
        let mut argv = vec![
            "start",
            "--table",
            "customers",
            "--alter",
            "RENAME COLUMN name TO full_name",
            "--id",
            "rename_name",
        ];
        argv.extend_from_slice(&FAST);
        exec(&dir, &argv).await.unwrap();

        let err = exec(&dir, &["status", "--table", "orders", "--id", "rename_name"])
            .await
            .unwrap_err();
        assert!(matches!(err, CliError::Usage(_)));
    }

    #[tokio::test]
    async fn test_pause_request_stops_running_migration() {
        let dir = TempDir::new().unwrap();
        exec(&dir, &["seed", "--table", "customers", "--rows", "3000"])
            .await
            .unwrap();

        let paused = start_then_request(&dir, "slow_pause", ControlRequest::Pause).await;
        assert_eq!(paused["status"], "paused");
        assert_ne!(paused["phase"], "complete");

        let mut argv = vec!["resume", "--id", "slow_pause"];
        argv.extend_from_slice(&FAST);
        let done = exec(&dir, &argv).await.unwrap();
        assert_eq!(done["phase"], "complete");
        let described = exec(&dir, &["describe", "--table", "customers"]).await.unwrap();
        assert_eq!(described["columns"].as_array().unwrap().len(), 4);
        assert_eq!(described["rows"], 3000);
    }

    #[tokio::test]
    async fn test_abort_request_aborts_running_migration() {
        let dir = TempDir::new().unwrap();
        exec(&dir, &["seed", "--table", "customers", "--rows", "3000"])
            .await
            .unwrap();
        let before = exec(&dir, &["describe", "--table", "customers"]).await.unwrap();

        let aborted = start_then_request(&dir, "slow_abort", ControlRequest::Abort).await;
        assert_eq!(aborted["phase"], "aborted");
        assert_eq!(aborted["status"], "aborted");

        let after = exec(&dir, &["describe", "--table", "customers"]).await.unwrap();
        assert_eq!(after["digest"], before["digest"]);
        assert_eq!(after["columns"], before["columns"]);
        let tables = exec(&dir, &["tables"]).await.unwrap();
        assert_eq!(tables.as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_locked_database_leaves_request() {
        let dir = TempDir::new().unwrap();
        let data_dir = dir.path().to_string_lossy().to_string();
        let parse = |argv: &[&str]| {
            let mut full = vec!["halo_migrate", "--data-dir", data_dir.as_str(), "--format", "json"];
            full.extend_from_slice(argv);
            Args::try_parse_from(full).unwrap()
        };
        let locked = || CliError::Open {
            path: dir.path().to_path_buf(),
            source: halo_migrate_core::Error::InvalidKey,
        };

        let output = leave_request(&parse(&["abort", "--id", "m1"]), locked(), &JsonFormatter).unwrap();
        let output: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert_eq!(output["message"], "abort requested for migration m1");
        assert_eq!(control::take(dir.path(), "m1").unwrap(), Some(ControlRequest::Abort));

        leave_request(&parse(&["pause", "--id", "m1"]), locked(), &JsonFormatter).unwrap();
        assert_eq!(control::take(dir.path(), "m1").unwrap(), Some(ControlRequest::Pause));

        let err = leave_request(&parse(&["pause", "--table", "customers"]), locked(), &JsonFormatter)
            .unwrap_err();
        assert!(matches!(err, CliError::Usage(_)));

        let err = leave_request(&parse(&["abort", "--id", "../m1"]), locked(), &JsonFormatter)
            .unwrap_err();
        assert!(matches!(err, CliError::Migrate(MigrateError::InvalidId(_))));

        let err = leave_request(&parse(&["status", "--id", "m1"]), locked(), &JsonFormatter)
            .unwrap_err();
        assert!(matches!(err, CliError::Open { .. }));
    }
}
