//! ALTER TABLE grammar for halo-migrate.
//!
//! Parses the schema delta passed to `halo_migrate start --alter`. The grammar
//! is the action list of a PostgreSQL `ALTER TABLE`, optionally prefixed by
//! `ALTER TABLE name`:
//!
//! ```text
//! ADD [COLUMN] name type [NOT NULL | NULL] [DEFAULT literal]
//! DROP [COLUMN] name
//! ALTER [COLUMN] name TYPE type
//! ALTER [COLUMN] name SET DATA TYPE type
//! ALTER [COLUMN] name SET NOT NULL | DROP NOT NULL
//! ALTER [COLUMN] name SET DEFAULT literal | DROP DEFAULT
//! RENAME [COLUMN] old TO new
//! ADD CONSTRAINT name UNIQUE (col, ...)
//! ADD CONSTRAINT name CHECK (col op literal)
//! DROP CONSTRAINT name
//! ```
//!
//! Actions are separated by commas; a trailing `;` is accepted.
//!
//! ```rust
//! use halo_migrate_lang::{parse, AlterAction};
//!
//! let stmt = parse("ADD COLUMN score int NOT NULL DEFAULT 0").unwrap();
//! assert!(matches!(stmt.actions[0], AlterAction::AddColumn { .. }));
//! ```

pub mod ast;
pub mod error;
pub mod lexer;
pub mod parser;
pub mod span;

pub use ast::{AlterAction, AlterStatement, ComparisonOp, DataType, Literal};
pub use error::ParseError;
pub use span::{Span, Spanned};

/// Parse ALTER text into a statement.
pub fn parse(source: &str) -> Result<AlterStatement, ParseError> {
    parser::parse(source)
}
