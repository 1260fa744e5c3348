//! Output formatters for migrations, plans and tables.

use chrono::{DateTime, SecondsFormat};
use clap::ValueEnum;
use comfy_table::{Cell, Table};
use halo_migrate_core::migration::MigrationPlan;
use halo_migrate_core::{ConstraintDef, MigrationState, TableDef};
use serde::Serialize;

/// Output format for results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// ASCII table format
    Table,
    /// JSON format
    Json,
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Table => write!(f, "table"),
            OutputFormat::Json => write!(f, "json"),
        }
    }
}

/// Trait for formatting output.
pub trait Formatter: Send + Sync {
    /// Format one migration.
    fn format_state(&self, state: &MigrationState) -> String;

    /// Format a list of migrations.
    fn format_states(&self, states: &[MigrationState]) -> String;

    /// Format a plan produced by a dry run.
    fn format_plan(&self, plan: &MigrationPlan) -> String;

    /// Format the table list.
    fn format_tables(&self, tables: &[TableDef]) -> String;

    /// Format one table with its row count and digest.
    fn format_table(&self, table: &TableDef, rows: u64, digest: &str) -> String;

    /// Format a simple message.
    fn format_message(&self, message: &str) -> String;

    /// Format an error message.
    fn format_error(&self, error: &str, category: &str) -> String;
}

/// Create a formatter for the given output format.
pub fn create_formatter(format: OutputFormat) -> Box<dyn Formatter> {
    match format {
        OutputFormat::Table => Box::new(TableFormatter),
        OutputFormat::Json => Box::new(JsonFormatter),
    }
}

/// Render microseconds since the epoch as RFC 3339.
fn format_timestamp(micros: u64) -> String {
    i64::try_from(micros)
        .ok()
        .and_then(DateTime::from_timestamp_micros)
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_else(|| micros.to_string())
}

fn format_constraint(constraint: &ConstraintDef) -> String {
    match constraint {
        ConstraintDef::Unique { name, columns } => {
            format!("{} UNIQUE ({})", name, columns.join(", "))
        }
        ConstraintDef::Check {
            name,
            column,
            op,
            value,
        } => format!("{} CHECK ({} {} {})", name, column, op, value),
    }
}

#[derive(Debug, Serialize)]
struct PhaseChange {
    from: String,
    to: String,
    at: String,
}

#[derive(Debug, Serialize)]
struct StatusView {
    migration_id: String,
    table: String,
    alter: String,
    strategy: String,
    capture: String,
    phase: String,
    status: String,
    rows_copied: u64,
    total_rows: u64,
    percent_complete: f64,
    entries_applied: u64,
    last_applied_lsn: u64,
    cutover_attempts: u32,
    shadow_table: Option<String>,
    created_at: String,
    updated_at: String,
    completed_at: Option<String>,
    last_error: Option<ErrorView>,
    history: Vec<PhaseChange>,
}

impl From<&MigrationState> for StatusView {
    fn from(state: &MigrationState) -> Self {
        Self {
            migration_id: state.migration_id.clone(),
            table: state.table().to_string(),
            alter: state.spec.alter_text.clone(),
            strategy: state.spec.strategy.to_string(),
            capture: state.spec.capture.to_string(),
            phase: state.phase.to_string(),
            status: state.status.to_string(),
            rows_copied: state.copy.rows_copied,
            total_rows: state.copy.total_rows,
            percent_complete: (state.copy.percent_complete() * 10.0).round() / 10.0,
            entries_applied: state.entries_applied,
            last_applied_lsn: state.last_applied_lsn,
            cutover_attempts: state.cutover_attempts,
            shadow_table: state.shadow.as_ref().map(|s| s.table.clone()),
            created_at: format_timestamp(state.created_at),
            updated_at: format_timestamp(state.updated_at),
            completed_at: state.completed_at.map(format_timestamp),
            last_error: state.last_error.as_ref().map(|e| ErrorView {
                category: e.category.to_string(),
                message: e.message.clone(),
                at: Some(format_timestamp(e.at)),
            }),
            history: state
                .history
                .iter()
                .map(|t| PhaseChange {
                    from: t.from.to_string(),
                    to: t.to.to_string(),
                    at: format_timestamp(t.at),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Serialize)]
struct StepView {
    step: String,
    lock: String,
    description: String,
}

#[derive(Debug, Serialize)]
struct PlanView {
    migration_id: String,
    table: String,
    strategy: String,
    rewrites_rows: bool,
    max_lock: String,
    estimated_rows: Option<u64>,
    target: TableView,
    steps: Vec<StepView>,
}

impl From<&MigrationPlan> for PlanView {
    fn from(plan: &MigrationPlan) -> Self {
        Self {
            migration_id: plan.migration_id.clone(),
            table: plan.table.clone(),
            strategy: plan.strategy.to_string(),
            rewrites_rows: plan.rewrites_rows,
            max_lock: plan.max_lock().to_string(),
            estimated_rows: plan.estimated_rows,
            target: TableView::new(&plan.target, None, None),
            steps: plan
                .steps
                .iter()
                .map(|s| StepView {
                    step: s.kind.to_string(),
                    lock: s.lock.to_string(),
                    description: s.description.clone(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ColumnView {
    name: String,
    #[serde(rename = "type")]
    ty: String,
    nullable: bool,
    default: Option<String>,
    primary_key: bool,
}

#[derive(Debug, Serialize)]
struct TableView {
    name: String,
    version: u64,
    columns: Vec<ColumnView>,
    constraints: Vec<String>,
    capture: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    rows: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    digest: Option<String>,
}

impl TableView {
    fn new(def: &TableDef, rows: Option<u64>, digest: Option<&str>) -> Self {
        Self {
            name: def.name.clone(),
            version: def.version,
            columns: def
                .columns
                .iter()
                .map(|c| ColumnView {
                    name: c.name.clone(),
                    ty: c.ty.to_string(),
                    nullable: c.nullable,
                    default: c.default.as_ref().map(ToString::to_string),
                    primary_key: def.is_primary_key(&c.name),
                })
                .collect(),
            constraints: def.constraints.iter().map(format_constraint).collect(),
            capture: def.capture.as_ref().map(|c| c.migration_id.clone()),
            rows,
            digest: digest.map(str::to_string),
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorView {
    category: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    at: Option<String>,
}

/// Table formatter using comfy-table.
pub struct TableFormatter;

impl TableFormatter {
    fn columns_table(view: &TableView) -> Table {
        let mut table = Table::new();
        table.set_header(vec!["Column", "Type", "Null", "Default", "Key"]);
        for column in &view.columns {
            table.add_row(vec![
                Cell::new(&column.name),
                Cell::new(&column.ty),
                Cell::new(if column.nullable { "yes" } else { "no" }),
                Cell::new(column.default.as_deref().unwrap_or("")),
                Cell::new(if column.primary_key { "PK" } else { "" }),
            ]);
        }
        table
    }
}

impl Formatter for TableFormatter {
    fn format_state(&self, state: &MigrationState) -> String {
        let view = StatusView::from(state);
        let mut table = Table::new();
        table.set_header(vec!["Field", "Value"]);
        let mut field = |name: &str, value: String| {
            table.add_row(vec![Cell::new(name), Cell::new(value)]);
        };
        field("migration", view.migration_id);
        field("table", view.table);
        field("alter", view.alter);
        field("strategy", view.strategy);
        field("capture", view.capture);
        field("phase", view.phase);
        field("status", view.status);
        field(
            "copied",
            format!(
                "{}/{} ({:.1}%)",
                view.rows_copied, view.total_rows, view.percent_complete
            ),
        );
        field("applied", format!("{} (lsn {})", view.entries_applied, view.last_applied_lsn));
        if view.cutover_attempts > 0 {
            field("cutover attempts", view.cutover_attempts.to_string());
        }
        if let Some(shadow) = view.shadow_table {
            field("shadow", shadow);
        }
        field("created", view.created_at);
        field("updated", view.updated_at);
        if let Some(completed) = view.completed_at {
            field("completed", completed);
        }
        if let Some(error) = view.last_error {
            field("last error", format!("[{}] {}", error.category, error.message));
        }
        table.to_string()
    }

    fn format_states(&self, states: &[MigrationState]) -> String {
        if states.is_empty() {
            return "No migrations".to_string();
        }
        let mut table = Table::new();
        table.set_header(vec!["Migration", "Table", "Strategy", "Phase", "Status", "Created"]);
        for state in states {
            table.add_row(vec![
                Cell::new(&state.migration_id),
                Cell::new(state.table()),
                Cell::new(state.spec.strategy),
                Cell::new(state.phase),
                Cell::new(state.status),
                Cell::new(format_timestamp(state.created_at)),
            ]);
        }
        table.to_string()
    }

    fn format_plan(&self, plan: &MigrationPlan) -> String {
        let view = PlanView::from(plan);
        let mut steps = Table::new();
        steps.set_header(vec!["#", "Step", "Lock", "Description"]);
        for (i, step) in view.steps.iter().enumerate() {
            steps.add_row(vec![
                Cell::new(i + 1),
                Cell::new(&step.step),
                Cell::new(&step.lock),
                Cell::new(&step.description),
            ]);
        }
        let rows = view
            .estimated_rows
            .map(|n| format!(", ~{} rows", n))
            .unwrap_or_default();
        format!(
            "Plan {} for {}: {} strategy, strongest lock {}{}\n{}\n\nTarget schema:\n{}",
            view.migration_id,
            view.table,
            view.strategy,
            view.max_lock,
            rows,
            steps,
            Self::columns_table(&view.target)
        )
    }

    fn format_tables(&self, tables: &[TableDef]) -> String {
        if tables.is_empty() {
            return "No tables".to_string();
        }
        let mut table = Table::new();
        table.set_header(vec!["Table", "Columns", "Version", "Capture"]);
        for def in tables {
            table.add_row(vec![
                Cell::new(&def.name),
                Cell::new(def.columns.len()),
                Cell::new(def.version),
                Cell::new(
                    def.capture
                        .as_ref()
                        .map(|c| c.migration_id.as_str())
                        .unwrap_or(""),
                ),
            ]);
        }
        table.to_string()
    }

    fn format_table(&self, table: &TableDef, rows: u64, digest: &str) -> String {
        let view = TableView::new(table, Some(rows), Some(digest));
        let mut output = format!(
            "Table {} (version {}, {} rows)\n{}",
            view.name,
            view.version,
            rows,
            Self::columns_table(&view)
        );
        for constraint in &view.constraints {
            output.push_str(&format!("\nconstraint {}", constraint));
        }
        if let Some(owner) = &view.capture {
            output.push_str(&format!("\ncapture installed by migration {}", owner));
        }
        output.push_str(&format!("\ndigest {}", digest));
        output
    }

    fn format_message(&self, message: &str) -> String {
        message.to_string()
    }

    fn format_error(&self, error: &str, category: &str) -> String {
        format!("Error ({}): {}", category, error)
    }
}

/// JSON formatter.
pub struct JsonFormatter;

impl JsonFormatter {
    fn render<T: Serialize>(value: &T) -> String {
        serde_json::to_string_pretty(value).unwrap_or_else(|_| "{}".to_string())
    }
}

impl Formatter for JsonFormatter {
    fn format_state(&self, state: &MigrationState) -> String {
        Self::render(&StatusView::from(state))
    }

    fn format_states(&self, states: &[MigrationState]) -> String {
        let views: Vec<StatusView> = states.iter().map(StatusView::from).collect();
        Self::render(&views)
    }

    fn format_plan(&self, plan: &MigrationPlan) -> String {
        Self::render(&PlanView::from(plan))
    }

    fn format_tables(&self, tables: &[TableDef]) -> String {
        let views: Vec<TableView> = tables.iter().map(|t| TableView::new(t, None, None)).collect();
        Self::render(&views)
    }

    fn format_table(&self, table: &TableDef, rows: u64, digest: &str) -> String {
        Self::render(&TableView::new(table, Some(rows), Some(digest)))
    }

    fn format_message(&self, message: &str) -> String {
        serde_json::json!({ "message": message }).to_string()
    }

    fn format_error(&self, error: &str, category: &str) -> String {
        Self::render(&serde_json::json!({
            "error": ErrorView {
                category: category.to_string(),
                message: error.to_string(),
                at: None,
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use halo_migrate_core::catalog::CheckOp;
    use halo_migrate_core::{ColumnDef, ColumnType, Value};
    use pretty_assertions::assert_eq;

    fn users() -> TableDef {
        TableDef::new(
            "users",
            vec![
                ColumnDef::new("id", ColumnType::Int).not_null(),
                ColumnDef::new("score", ColumnType::Int)
                    .not_null()
                    .with_default(Value::Int(0)),
            ],
            vec!["id"],
        )
        .with_constraint(ConstraintDef::Check {
            name: "score_positive".into(),
            column: "score".into(),
            op: CheckOp::Ge,
            value: Value::Int(0),
        })
    }

    #[test]
    fn test_format_timestamp() {
        assert_eq!(format_timestamp(0), "1970-01-01T00:00:00Z");
        assert_eq!(format_timestamp(1_500_000), "1970-01-01T00:00:01Z");
    }

    #[test]
    fn test_json_table() {
        let json = JsonFormatter.format_table(&users(), 3, "abcd");
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["name"], "users");
        assert_eq!(parsed["rows"], 3);
        assert_eq!(parsed["digest"], "abcd");
        assert_eq!(parsed["columns"][0]["primary_key"], true);
        assert_eq!(parsed["columns"][1]["default"], "0");
        assert_eq!(parsed["constraints"][0], "score_positive CHECK (score >= 0)");
    }

    #[test]
    fn test_json_tables_omit_digest() {
        let json = JsonFormatter.format_tables(&[users()]);
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert!(parsed[0].get("digest").is_none());
        assert!(parsed[0]["capture"].is_null());
    }

    #[test]
    fn test_table_output_mentions_columns() {
        let output = TableFormatter.format_table(&users(), 3, "abcd");
        assert!(output.contains("Table users"));
        assert!(output.contains("score"));
        assert!(output.contains("digest abcd"));
    }

    #[test]
    fn test_json_error() {
        let json = JsonFormatter.format_error("bad alter", "user");
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["error"]["category"], "user");
        assert_eq!(parsed["error"]["message"], "bad alter");
    }

    #[test]
    fn test_empty_lists() {
        assert_eq!(TableFormatter.format_states(&[]), "No migrations");
        assert_eq!(TableFormatter.format_tables(&[]), "No tables");
        assert_eq!(JsonFormatter.format_states(&[]), "[]");
    }
}
