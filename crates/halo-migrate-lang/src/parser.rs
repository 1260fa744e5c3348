//! Recursive descent parser for ALTER TABLE actions.

use crate::ast::*;
use crate::error::ParseError;
use crate::lexer::{Lexer, SpannedToken, Token};
use crate::span::{Span, Spanned};

/// Parser over a single ALTER statement.
pub struct Parser<'source> {
    lexer: Lexer<'source>,
    source: &'source str,
}

impl<'source> Parser<'source> {
    pub fn new(source: &'source str) -> Self {
        Self {
            lexer: Lexer::new(source),
            source,
        }
    }

    /// Parse `[ALTER TABLE name] action (, action)* [;]` up to end of input.
    pub fn parse_statement(&mut self) -> Result<AlterStatement, ParseError> {
        let mut prefix = None;

        if self.lexer.peek_is(&Token::Alter) {
            let alter = self.next_token()?;
            // "ALTER COLUMN ..." is an action, "ALTER TABLE ..." a prefix
            if self.lexer.peek_is(&Token::Table) {
                self.next_token()?;
                let table = self.expect_ident()?;
                prefix = Some((alter.span, table));
            } else {
                let action = self.parse_alter_column(alter.span)?;
                return self.finish_statement(None, vec![action]);
            }
        }

        let first = self.parse_action()?;
        self.finish_statement(prefix, vec![first])
    }

    fn finish_statement(
        &mut self,
        prefix: Option<(Span, Spanned<String>)>,
        mut actions: Vec<AlterAction>,
    ) -> Result<AlterStatement, ParseError> {
        while self.lexer.peek_is(&Token::Comma) {
            self.next_token()?;
            actions.push(self.parse_action()?);
        }

        if self.lexer.peek_is(&Token::Semicolon) {
            self.next_token()?;
        }

        if let Some(tok) = self.lexer.next_token() {
            let tok = tok?;
            return Err(ParseError::new(
                format!("unexpected {:?} after action", tok.token),
                tok.span,
            )
            .with_hint("separate actions with ','"));
        }

        let mut span = actions
            .iter()
            .map(AlterAction::span)
            .reduce(Span::merge)
            .unwrap_or_default();
        let table = prefix.map(|(alter, table)| {
            span = span.merge(alter);
            table
        });

        Ok(AlterStatement {
            table,
            actions,
            span,
        })
    }

    fn parse_action(&mut self) -> Result<AlterAction, ParseError> {
        let tok = self.next_token()?;
        match tok.token {
            Token::Add => self.parse_add(tok.span),
            Token::Drop => self.parse_drop(tok.span),
            Token::Alter => self.parse_alter_column(tok.span),
            Token::Rename => self.parse_rename(tok.span),
            other => Err(ParseError::new(
                format!("expected ADD, DROP, ALTER or RENAME, found {:?}", other),
                tok.span,
            )),
        }
    }

    fn parse_add(&mut self, start: Span) -> Result<AlterAction, ParseError> {
        if self.lexer.peek_is(&Token::Constraint) {
            self.next_token()?;
            return self.parse_constraint(start);
        }
        self.skip_optional(&Token::Column)?;

        let name = self.expect_ident()?;
        let data_type = self.parse_data_type()?;
        let mut end = data_type.span;
        let mut not_null = false;
        let mut default = None;

        loop {
            let next = self.lexer.peek().map(|t| t.token.clone());
            match next {
                Some(Token::Not) => {
                    self.next_token()?;
                    end = self.expect_token(Token::Null)?.span;
                    not_null = true;
                }
                Some(Token::Null) => {
                    end = self.next_token()?.span;
                    not_null = false;
                }
                Some(Token::Default) => {
                    let kw = self.next_token()?;
                    if default.is_some() {
                        return Err(ParseError::new("multiple DEFAULT clauses", kw.span));
                    }
                    let value = self.parse_literal()?;
                    end = value.span;
                    default = Some(value);
                }
                _ => break,
            }
        }

        Ok(AlterAction::AddColumn {
            name,
            data_type,
            not_null,
            default,
            span: start.merge(end),
        })
    }

    fn parse_constraint(&mut self, start: Span) -> Result<AlterAction, ParseError> {
        let constraint = self.expect_ident()?;
        let tok = self.next_token()?;
        match tok.token {
            Token::Unique => {
                self.expect_token(Token::LParen)?;
                let mut columns = vec![self.expect_ident()?];
                while self.lexer.peek_is(&Token::Comma) {
                    self.next_token()?;
                    columns.push(self.expect_ident()?);
                }
                let end = self.expect_token(Token::RParen)?;
                Ok(AlterAction::AddUnique {
                    constraint,
                    columns,
                    span: start.merge(end.span),
                })
            }
            Token::Check => {
                self.expect_token(Token::LParen)?;
                let column = self.expect_ident()?;
                let op = self.parse_comparison_op()?;
                let value = self.parse_literal()?;
                let end = self.expect_token(Token::RParen)?;
                Ok(AlterAction::AddCheck {
                    constraint,
                    column,
                    op,
                    value,
                    span: start.merge(end.span),
                })
            }
            other => Err(ParseError::new(
                format!("expected UNIQUE or CHECK, found {:?}", other),
                tok.span,
            )
            .with_hint("only UNIQUE (...) and CHECK (column op value) constraints are supported")),
        }
    }

    fn parse_drop(&mut self, start: Span) -> Result<AlterAction, ParseError> {
        if self.lexer.peek_is(&Token::Constraint) {
            self.next_token()?;
            let constraint = self.expect_ident()?;
            let span = start.merge(constraint.span);
            return Ok(AlterAction::DropConstraint { constraint, span });
        }
        self.skip_optional(&Token::Column)?;
        let name = self.expect_ident()?;
        let span = start.merge(name.span);
        Ok(AlterAction::DropColumn { name, span })
    }

    fn parse_alter_column(&mut self, start: Span) -> Result<AlterAction, ParseError> {
        self.skip_optional(&Token::Column)?;
        let name = self.expect_ident()?;
        let tok = self.next_token()?;

        match tok.token {
            Token::Type => {
                let data_type = self.parse_data_type()?;
                let span = start.merge(data_type.span);
                Ok(AlterAction::AlterColumnType {
                    name,
                    data_type,
                    span,
                })
            }
            Token::Set => {
                let what = self.next_token()?;
                match what.token {
                    Token::Data => {
                        self.expect_token(Token::Type)?;
                        let data_type = self.parse_data_type()?;
                        let span = start.merge(data_type.span);
                        Ok(AlterAction::AlterColumnType {
                            name,
                            data_type,
                            span,
                        })
                    }
                    Token::Not => {
                        let end = self.expect_token(Token::Null)?;
                        Ok(AlterAction::SetNotNull {
                            name,
                            span: start.merge(end.span),
                        })
                    }
                    Token::Default => {
                        let value = self.parse_literal()?;
                        let span = start.merge(value.span);
                        Ok(AlterAction::SetDefault { name, value, span })
                    }
                    other => Err(ParseError::new(
                        format!("expected DATA TYPE, NOT NULL or DEFAULT, found {:?}", other),
                        what.span,
                    )),
                }
            }
            Token::Drop => {
                let what = self.next_token()?;
                match what.token {
                    Token::Not => {
                        let end = self.expect_token(Token::Null)?;
                        Ok(AlterAction::DropNotNull {
                            name,
                            span: start.merge(end.span),
                        })
                    }
                    Token::Default => Ok(AlterAction::DropDefault {
                        name,
                        span: start.merge(what.span),
                    }),
                    other => Err(ParseError::new(
                        format!("expected NOT NULL or DEFAULT, found {:?}", other),
                        what.span,
                    )),
                }
            }
            other => Err(ParseError::new(
                format!("expected TYPE, SET or DROP, found {:?}", other),
                tok.span,
            )),
        }
    }

    fn parse_rename(&mut self, start: Span) -> Result<AlterAction, ParseError> {
        self.skip_optional(&Token::Column)?;
        let from = self.expect_ident()?;
        self.expect_token(Token::To)?;
        let to = self.expect_ident()?;
        let span = start.merge(to.span);
        Ok(AlterAction::RenameColumn { from, to, span })
    }

    /// A type name, optionally followed by a length modifier like `(255)`
    /// which is accepted and ignored.
    fn parse_data_type(&mut self) -> Result<Spanned<DataType>, ParseError> {
        let tok = self.next_token()?;
        let name = match tok.token {
            Token::Ident(name) => name,
            other => {
                return Err(ParseError::new(
                    format!("expected type name, found {:?}", other),
                    tok.span,
                ))
            }
        };
        let data_type = DataType::from_name(&name).ok_or_else(|| {
            ParseError::new(format!("unknown type '{}'", name), tok.span)
                .with_hint("supported types: bool, int, float, text, bytes")
        })?;

        let mut span = tok.span;
        if self.lexer.peek_is(&Token::LParen) {
            self.next_token()?;
            let size = self.next_token()?;
            if !matches!(size.token, Token::Int(_)) {
                return Err(ParseError::new("expected type length", size.span));
            }
            span = span.merge(self.expect_token(Token::RParen)?.span);
        }

        Ok(Spanned::new(data_type, span))
    }

    fn parse_comparison_op(&mut self) -> Result<ComparisonOp, ParseError> {
        let tok = self.next_token()?;
        let op = match tok.token {
            Token::Eq => ComparisonOp::Eq,
            Token::Ne => ComparisonOp::Ne,
            Token::Lt => ComparisonOp::Lt,
            Token::Le => ComparisonOp::Le,
            Token::Gt => ComparisonOp::Gt,
            Token::Ge => ComparisonOp::Ge,
            other => {
                return Err(ParseError::new(
                    format!("expected comparison operator, found {:?}", other),
                    tok.span,
                ))
            }
        };
        Ok(op)
    }

    fn parse_literal(&mut self) -> Result<Spanned<Literal>, ParseError> {
        let tok = self.next_token()?;
        let literal = match tok.token {
            Token::Null => Literal::Null,
            Token::True => Literal::Bool(true),
            Token::False => Literal::Bool(false),
            Token::Int(i) => Literal::Int(i),
            Token::Float(f) => Literal::Float(f),
            Token::String(s) => Literal::String(s),
            other => {
                return Err(ParseError::new(
                    format!("expected literal value, found {:?}", other),
                    tok.span,
                ))
            }
        };

        Ok(Spanned::new(literal, tok.span))
    }

    fn expect_ident(&mut self) -> Result<Spanned<String>, ParseError> {
        let tok = self.next_token()?;
        match tok.token {
            Token::Ident(name) | Token::QuotedIdent(name) => Ok(Spanned::new(name, tok.span)),
            other => Err(ParseError::new(
                format!("expected identifier, found {:?}", other),
                tok.span,
            )
            .with_hint("quote reserved words used as names, e.g. \"type\"")),
        }
    }

    fn expect_token(&mut self, expected: Token) -> Result<SpannedToken, ParseError> {
        let tok = self.next_token()?;
        if std::mem::discriminant(&tok.token) == std::mem::discriminant(&expected) {
            Ok(tok)
        } else {
            Err(ParseError::new(
                format!("expected {:?}, found {:?}", expected, tok.token),
                tok.span,
            ))
        }
    }

    fn skip_optional(&mut self, token: &Token) -> Result<(), ParseError> {
        if self.lexer.peek_is(token) {
            self.next_token()?;
        }
        Ok(())
    }

    /// Next token, or an error at end of input.
    fn next_token(&mut self) -> Result<SpannedToken, ParseError> {
        match self.lexer.next_token() {
            Some(tok) => tok,
            None => Err(ParseError::new(
                "unexpected end of input",
                Span::new(self.source.len(), self.source.len()),
            )),
        }
    }
}

/// Parse ALTER text into a statement.
pub fn parse(source: &str) -> Result<AlterStatement, ParseError> {
    Parser::new(source).parse_statement()
}
