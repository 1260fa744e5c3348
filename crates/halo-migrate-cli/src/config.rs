//! Command-line arguments and the configuration built from them.

use crate::formatter::OutputFormat;
use clap::{Parser, Subcommand};
use halo_migrate_core::migration::{CutoverConfig, MigrationConfig, Strategy, SyncConfig};
use halo_migrate_core::{CaptureKind, StorageConfig};
use std::path::PathBuf;
use std::time::Duration;

/// Default database directory.
pub const DEFAULT_DATA_DIR: &str = "./halo-data";

/// Default sled page cache size in megabytes.
pub const DEFAULT_CACHE_MB: u64 = 64;

/// Schema changes with minimal locks.
#[derive(Parser, Debug)]
#[command(name = "halo_migrate")]
#[command(version, about = "Schema changes with minimal locks", long_about = None)]
pub struct Args {
    /// Path to the database directory.
    #[arg(short, long, global = true, default_value = DEFAULT_DATA_DIR)]
    pub data_dir: PathBuf,

    /// Output format.
    #[arg(long, global = true, default_value = "table", value_enum)]
    pub format: OutputFormat,

    /// Page cache size in megabytes.
    #[arg(long, global = true, default_value_t = DEFAULT_CACHE_MB)]
    pub cache_mb: u64,

    /// More logging (-v debug, -vv trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

impl Args {
    pub fn storage_config(&self) -> StorageConfig {
        StorageConfig::new(&self.data_dir).with_cache_capacity(self.cache_mb * 1024 * 1024)
    }

    /// Default `tracing` filter for the verbosity level.
    pub fn log_filter(&self) -> &'static str {
        match self.verbose {
            0 => "halo_migrate=info,halo_migrate_core=info",
            1 => "halo_migrate=debug,halo_migrate_core=debug",
            _ => "halo_migrate=trace,halo_migrate_core=trace",
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Plan, record and run a migration.
    Start(StartArgs),
    /// Show the state of a migration.
    Status(TargetArgs),
    /// Stop a migration at the next batch boundary.
    Pause(TargetArgs),
    /// Continue a paused or stalled migration.
    Resume(ResumeArgs),
    /// Abandon a migration that has not swapped; the live table is untouched.
    Abort(TargetArgs),
    /// List all migrations.
    List,
    /// List tables.
    Tables,
    /// Show a table's schema and contents digest.
    Describe {
        #[arg(long)]
        table: String,
    },
    /// Create a demo table with generated rows.
    Seed(SeedArgs),
}

/// Selects a migration by id, or the latest one of a table.
#[derive(clap::Args, Debug, Clone, Default)]
pub struct TargetArgs {
    #[arg(long)]
    pub table: Option<String>,

    #[arg(long)]
    pub id: Option<String>,
}

#[derive(clap::Args, Debug)]
pub struct StartArgs {
    /// Table to change.
    #[arg(long)]
    pub table: String,

    /// ALTER TABLE actions, e.g. "ADD COLUMN score int NOT NULL DEFAULT 0".
    #[arg(long)]
    pub alter: String,

    /// Migration id (generated when omitted).
    #[arg(long)]
    pub id: Option<String>,

    /// copy or in-place (chosen from the change when omitted).
    #[arg(long)]
    pub strategy: Option<Strategy>,

    /// trigger or log-stream.
    #[arg(long)]
    pub capture: Option<CaptureKind>,

    /// Print the plan and exit.
    #[arg(long)]
    pub dry_run: bool,

    #[command(flatten)]
    pub tuning: TuningArgs,
}

#[derive(clap::Args, Debug)]
pub struct ResumeArgs {
    #[command(flatten)]
    pub target: TargetArgs,

    #[command(flatten)]
    pub tuning: TuningArgs,
}

#[derive(clap::Args, Debug)]
pub struct SeedArgs {
    #[arg(long)]
    pub table: String,

    #[arg(long, default_value_t = 1000)]
    pub rows: i64,
}

/// Copy, sync and cutover tuning.
#[derive(clap::Args, Debug, Clone)]
pub struct TuningArgs {
    /// Bounded wait in seconds for the exclusive lock at setup and cutover.
    #[arg(long, default_value_t = 60)]
    pub wait_timeout: u64,

    /// Skip refreshing statistics after the migration.
    #[arg(long)]
    pub no_analyze: bool,

    /// Rows copied per batch.
    #[arg(long, default_value_t = 1000)]
    pub batch_size: usize,

    /// Pause between copy batches in milliseconds.
    #[arg(long, default_value_t = 10)]
    pub batch_delay_ms: u64,

    /// Change-log entries applied per batch.
    #[arg(long, default_value_t = 1000)]
    pub apply_count: usize,

    /// Backlog below which the shadow counts as converged.
    #[arg(long, default_value_t = 20)]
    pub switch_threshold: u64,

    /// Consecutive converged polls before cutover.
    #[arg(long, default_value_t = 3)]
    pub converge_polls: u32,

    /// Seconds to sync before reporting a stall.
    #[arg(long, default_value_t = 600)]
    pub sync_deadline: u64,

    /// Drain attempts under the cutover lock.
    #[arg(long, default_value_t = 3)]
    pub drain_retries: u32,
}

impl TuningArgs {
    pub fn into_config(&self) -> MigrationConfig {
        let sync = SyncConfig::default()
            .with_batch_size(self.batch_size)
            .with_batch_delay(Duration::from_millis(self.batch_delay_ms))
            .with_apply_count(self.apply_count)
            .with_switch_threshold(self.switch_threshold)
            .with_converge_polls(self.converge_polls)
            .with_deadline(Duration::from_secs(self.sync_deadline));
        let cutover = CutoverConfig::default()
            .with_drain_retries(self.drain_retries)
            .with_analyze(!self.no_analyze);
        MigrationConfig::default()
            .with_sync(sync)
            .with_cutover(cutover)
            .with_wait_timeout(Duration::from_secs(self.wait_timeout))
    }
}

impl Default for TuningArgs {
    fn default() -> Self {
        Self {
            wait_timeout: 60,
            no_analyze: false,
            batch_size: 1000,
            batch_delay_ms: 10,
            apply_count: 1000,
            switch_threshold: 20,
            converge_polls: 3,
            sync_deadline: 600,
            drain_retries: 3,
        }
    }
}
