//! Parse errors with source context.

use crate::span::{locate, Span};
use thiserror::Error;

/// Error raised while lexing or parsing ALTER text.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message}")]
pub struct ParseError {
    /// The error message.
    pub message: String,
    /// Source span where the error occurred.
    pub span: Span,
    /// Optional hint for fixing the error.
    pub hint: Option<String>,
}

impl ParseError {
    pub fn new(message: impl Into<String>, span: Span) -> Self {
        Self {
            message: message.into(),
            span,
            hint: None,
        }
    }

    /// Attach a hint shown below the source excerpt.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// Render the error with the offending line and a caret underline.
    pub fn format_with_source(&self, source: &str) -> String {
        let at = locate(source, self.span.start);
        let gutter = at.line.to_string().len().max(3);
        let pad = " ".repeat(gutter);

        let rest = at.text.chars().count() + 1 - at.column;
        let width = self.span.len().clamp(1, rest.max(1));
        let marker = format!("^{}", "~".repeat(width - 1));

        let mut out = format!("error: {}\n  --> line {}:{}\n", self.message, at.line, at.column);
        out += &format!("{pad}|\n{:>gutter$}| {}\n", at.line, at.text);
        out += &format!("{pad}|{}{}\n", " ".repeat(at.column), marker);
        if let Some(hint) = &self.hint {
            out += &format!("{pad}= hint: {}\n", hint);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_formatting() {
        let source = "ALTER COLUMN age TYPE money";
        let err = ParseError::new("unknown type 'money'", Span::new(22, 27))
            .with_hint("supported types: bool, int, float, text, bytes");

        let formatted = err.format_with_source(source);
        assert!(formatted.contains("line 1:23"));
        assert!(formatted.contains("unknown type 'money'"));
        assert!(formatted.contains("^~~~~"));
        assert!(formatted.contains("hint: supported types"));
    }

    #[test]
    fn test_error_at_end_of_input() {
        let source = "DROP COLUMN";
        let err = ParseError::new("unexpected end of input", Span::new(11, 11));
        let formatted = err.format_with_source(source);
        assert!(formatted.contains("line 1:12"));
        assert!(formatted.ends_with("^\n"));
    }
}
