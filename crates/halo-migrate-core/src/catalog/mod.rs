//! Table catalog of the embedded host database.
//!
//! Every table has one catalog entry keyed by name. Renames, shadow creation
//! and the cutover swap are single transactions on the catalog tree, so a
//! reader sees either the old set of tables or the new one.

mod catalog;
mod table;
mod types;

pub use catalog::Catalog;
pub use table::{is_valid_identifier, CaptureBinding, ColumnDef, ConstraintDef, TableDef, TableStats};
pub use types::{CheckOp, ColumnType, Conversion, Value};
