//! halo_migrate command-line tool
//!
//! Starts, inspects and controls minimal-lock schema migrations on a local
//! database directory.

mod commands;
mod config;
mod control;
mod error;
mod formatter;

use clap::Parser;
use config::Args;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Logs go to stderr so command output stays parseable.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(args.log_filter())),
        )
        .with_writer(std::io::stderr)
        .init();

    let formatter = formatter::create_formatter(args.format);

    match commands::run(args, formatter.as_ref()).await {
        Ok(output) => println!("{}", output),
        Err(e) => {
            if let Some(migration_id) = e.migration_id() {
                tracing::warn!(migration_id, exit_code = e.exit_code(), "migration stopped");
            }
            eprintln!(
                "{}",
                formatter.format_error(&e.to_string(), &e.category().to_string())
            );
            std::process::exit(e.exit_code());
        }
    }
}
