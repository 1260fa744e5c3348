//! Lexer for ALTER TABLE actions using logos.

use crate::error::ParseError;
use crate::span::Span;
use logos::Logos;

/// Tokens of the ALTER action grammar. Keywords are case-insensitive.
#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r\n]+|--[^\n]*")]
pub enum Token {
    // Statement keywords
    #[token("alter", ignore(ascii_case))]
    Alter,
    #[token("table", ignore(ascii_case))]
    Table,
    #[token("add", ignore(ascii_case))]
    Add,
    #[token("drop", ignore(ascii_case))]
    Drop,
    #[token("rename", ignore(ascii_case))]
    Rename,
    #[token("column", ignore(ascii_case))]
    Column,
    #[token("constraint", ignore(ascii_case))]
    Constraint,
    #[token("to", ignore(ascii_case))]
    To,
    #[token("type", ignore(ascii_case))]
    Type,
    #[token("data", ignore(ascii_case))]
    Data,
    #[token("set", ignore(ascii_case))]
    Set,
    #[token("default", ignore(ascii_case))]
    Default,
    #[token("not", ignore(ascii_case))]
    Not,
    #[token("unique", ignore(ascii_case))]
    Unique,
    #[token("check", ignore(ascii_case))]
    Check,

    // Literals
    #[token("null", ignore(ascii_case))]
    Null,
    #[token("true", ignore(ascii_case))]
    True,
    #[token("false", ignore(ascii_case))]
    False,

    #[regex(r"[a-zA-Z_][a-zA-Z0-9_]*", |lex| lex.slice().to_string())]
    Ident(String),

    // Double quotes delimit identifiers, a doubled quote escapes itself
    #[regex(r#""([^"]|"")+""#, |lex| {
        let s = lex.slice();
        s[1..s.len() - 1].replace("\"\"", "\"")
    })]
    QuotedIdent(String),

    // Single-quoted string, '' escapes a quote
    #[regex(r"'([^']|'')*'", |lex| {
        let s = lex.slice();
        s[1..s.len() - 1].replace("''", "'")
    })]
    String(String),

    #[regex(r"-?[0-9]+", |lex| lex.slice().parse::<i64>().ok())]
    Int(i64),

    #[regex(r"-?[0-9]+\.[0-9]+", |lex| lex.slice().parse::<f64>().ok())]
    Float(f64),

    // Comparison operators
    #[token("=")]
    Eq,
    #[token("<>")]
    #[token("!=")]
    Ne,
    #[token("<=")]
    Le,
    #[token(">=")]
    Ge,
    #[token("<")]
    Lt,
    #[token(">")]
    Gt,

    // Punctuation
    #[token(",")]
    Comma,
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token(";")]
    Semicolon,
}

/// A token with its span in the source.
#[derive(Debug, Clone, PartialEq)]
pub struct SpannedToken {
    pub token: Token,
    pub span: Span,
}

/// Lexer producing spanned tokens with one token of lookahead.
pub struct Lexer<'source> {
    inner: logos::Lexer<'source, Token>,
    peeked: Option<Option<Result<SpannedToken, ParseError>>>,
}

impl<'source> Lexer<'source> {
    pub fn new(source: &'source str) -> Self {
        Self {
            inner: Token::lexer(source),
            peeked: None,
        }
    }

    /// Peek at the next token without consuming it. Lexing errors are left
    /// in place for `next_token` to report.
    pub fn peek(&mut self) -> Option<&SpannedToken> {
        if self.peeked.is_none() {
            self.peeked = Some(self.next_inner());
        }
        match self.peeked.as_ref() {
            Some(Some(Ok(tok))) => Some(tok),
            _ => None,
        }
    }

    /// Whether the next token is the given one.
    pub fn peek_is(&mut self, token: &Token) -> bool {
        self.peek().is_some_and(|t| &t.token == token)
    }

    /// Consume the next token.
    pub fn next_token(&mut self) -> Option<Result<SpannedToken, ParseError>> {
        match self.peeked.take() {
            Some(peeked) => peeked,
            None => self.next_inner(),
        }
    }

    fn next_inner(&mut self) -> Option<Result<SpannedToken, ParseError>> {
        let result = self.inner.next()?;
        let span: Span = self.inner.span().into();
        Some(match result {
            Ok(token) => Ok(SpannedToken { token, span }),
            Err(()) => Err(ParseError::new(
                format!("unrecognized input '{}'", self.inner.slice()),
                span,
            )),
        })
    }

    pub fn source(&self) -> &'source str {
        self.inner.source()
    }
}

/// Tokenize a source string, stopping at the first lexing error.
pub fn tokenize(source: &str) -> Result<Vec<SpannedToken>, ParseError> {
    let mut lexer = Lexer::new(source);
    let mut tokens = Vec::new();
    while let Some(tok) = lexer.next_token() {
        tokens.push(tok?);
    }
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn kinds(source: &str) -> Vec<Token> {
        tokenize(source)
            .unwrap()
            .into_iter()
            .map(|t| t.token)
            .collect()
    }

    #[test]
    fn test_add_column() {
        assert_eq!(
            kinds("ADD COLUMN score int NOT NULL DEFAULT 0"),
            vec![
                Token::Add,
                Token::Column,
                Token::Ident("score".to_string()),
                Token::Ident("int".to_string()),
                Token::Not,
                Token::Null,
                Token::Default,
                Token::Int(0),
            ]
        );
    }

    #[test]
    fn test_keywords_are_case_insensitive() {
        assert_eq!(
            kinds("alter Table t Drop column c"),
            vec![
                Token::Alter,
                Token::Table,
                Token::Ident("t".to_string()),
                Token::Drop,
                Token::Column,
                Token::Ident("c".to_string()),
            ]
        );
    }

    #[test]
    fn test_identifier_prefixed_by_keyword() {
        // "adder" and "types" must not split into keyword + suffix
        assert_eq!(
            kinds("adder types"),
            vec![
                Token::Ident("adder".to_string()),
                Token::Ident("types".to_string()),
            ]
        );
    }

    #[test]
    fn test_quoted_identifier_and_string() {
        assert_eq!(
            kinds(r#""Order ""Id""" 'it''s'"#),
            vec![
                Token::QuotedIdent("Order \"Id\"".to_string()),
                Token::String("it's".to_string()),
            ]
        );
    }

    #[test]
    fn test_numbers_and_operators() {
        assert_eq!(
            kinds("-5 2.5 <> != <= >= < > ="),
            vec![
                Token::Int(-5),
                Token::Float(2.5),
                Token::Ne,
                Token::Ne,
                Token::Le,
                Token::Ge,
                Token::Lt,
                Token::Gt,
                Token::Eq,
            ]
        );
    }

    #[test]
    fn test_comments_are_skipped() {
        assert_eq!(
            kinds("DROP COLUMN a -- old flag\n, DROP COLUMN b;"),
            vec![
                Token::Drop,
                Token::Column,
                Token::Ident("a".to_string()),
                Token::Comma,
                Token::Drop,
                Token::Column,
                Token::Ident("b".to_string()),
                Token::Semicolon,
            ]
        );
    }

    #[test]
    fn test_unrecognized_input_is_an_error() {
        let err = tokenize("DROP COLUMN a$").unwrap_err();
        assert_eq!(err.span, Span::new(13, 14));
        assert!(err.message.contains('$'));
    }

    #[test]
    fn test_peek_does_not_consume() {
        let mut lexer = Lexer::new("RENAME a");
        assert_eq!(lexer.peek().map(|t| &t.token), Some(&Token::Rename));
        assert!(lexer.peek_is(&Token::Rename));
        let tok = lexer.next_token().unwrap().unwrap();
        assert_eq!(tok.token, Token::Rename);
        assert_eq!(
            lexer.next_token().unwrap().unwrap().token,
            Token::Ident("a".to_string())
        );
        assert!(lexer.next_token().is_none());
    }
}
