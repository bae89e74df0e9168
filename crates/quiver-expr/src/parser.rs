//! Recursive-descent parser for the Quiver expression language.
//!
//! Grammar:
//! ```text
//! program := stmt ( ';' stmt )*
//! stmt    := target '=' expr | expr
//! expr    := or ; or := and ('||' and)* ; and := cmp ('&&' cmp)*
//! cmp     := sum (('=='|'!='|'<'|'<='|'>'|'>=') sum)?
//! sum     := term (('+'|'-') term)*
//! term    := factor (('*'|'/'|'%') factor)*
//! factor  := '-' factor | '!' factor | postfix
//! postfix := primary ('.' ident | '[' expr ']')*
//! primary := literal | ident | '(' expr ')' | '[' ... ']' | '{' ... '}'
//! ```

use quiver_types::{QuiverError, Result};

use crate::ast::*;
use crate::lexer::{tokenize, SpannedToken, Token};

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<SpannedToken>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(source: &'a str) -> Result<Self> {
        Ok(Self {
            source,
            tokens: tokenize(source)?,
            pos: 0,
        })
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|t| &t.token)
    }

    fn advance(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).map(|t| t.token.clone());
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn offset(&self) -> usize {
        self.tokens
            .get(self.pos)
            .map(|t| t.offset)
            .unwrap_or(self.source.len())
    }

    fn error(&self, message: impl Into<String>) -> QuiverError {
        QuiverError::EvalParse {
            expression: self.source.to_string(),
            offset: self.offset(),
            message: message.into(),
        }
    }

    fn eat(&mut self, expected: &Token, what: &str) -> Result<()> {
        match self.peek() {
            Some(tok) if tok == expected => {
                self.pos += 1;
                Ok(())
            }
            Some(tok) => Err(self.error(format!("expected {what}, found {tok:?}"))),
            None => Err(self.error(format!("expected {what}, found end of input"))),
        }
    }

    fn ident(&mut self, what: &str) -> Result<String> {
        match self.peek() {
            Some(Token::Ident(name)) => {
                let name = name.clone();
                self.pos += 1;
                Ok(name)
            }
            _ => Err(self.error(format!("expected {what}"))),
        }
    }

    // --- statements ---

    fn program(&mut self) -> Result<Program> {
        let mut stmts = Vec::new();
        while self.peek().is_some() {
            stmts.push(self.statement()?);
            match self.peek() {
                Some(Token::Semi) => {
                    self.pos += 1;
                }
                Some(_) => return Err(self.error("expected end of statement")),
                None => break,
            }
        }
        Ok(Program { stmts })
    }

    fn statement(&mut self) -> Result<Stmt> {
        let expr = self.expression()?;
        if matches!(self.peek(), Some(Token::Assign)) {
            self.pos += 1;
            let target = expr_to_target(&expr)
                .ok_or_else(|| self.error("left-hand side of '=' is not assignable"))?;
            let value = self.expression()?;
            Ok(Stmt::Assign { target, value })
        } else {
            Ok(Stmt::Expr(expr))
        }
    }

    // --- expressions, by precedence ---

    fn expression(&mut self) -> Result<Expr> {
        self.or_expr()
    }

    fn or_expr(&mut self) -> Result<Expr> {
        let mut lhs = self.and_expr()?;
        while matches!(self.peek(), Some(Token::OrOr)) {
            self.pos += 1;
            let rhs = self.and_expr()?;
            lhs = Expr::Binary(BinaryOp::Or, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and_expr(&mut self) -> Result<Expr> {
        let mut lhs = self.cmp_expr()?;
        while matches!(self.peek(), Some(Token::AndAnd)) {
            self.pos += 1;
            let rhs = self.cmp_expr()?;
            lhs = Expr::Binary(BinaryOp::And, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn cmp_expr(&mut self) -> Result<Expr> {
        let lhs = self.sum_expr()?;
        let op = match self.peek() {
            Some(Token::Eq) => BinaryOp::Eq,
            Some(Token::NotEq) => BinaryOp::NotEq,
            Some(Token::Lt) => BinaryOp::Lt,
            Some(Token::Le) => BinaryOp::Le,
            Some(Token::Gt) => BinaryOp::Gt,
            Some(Token::Ge) => BinaryOp::Ge,
            _ => return Ok(lhs),
        };
        self.pos += 1;
        let rhs = self.sum_expr()?;
        Ok(Expr::Binary(op, Box::new(lhs), Box::new(rhs)))
    }

    fn sum_expr(&mut self) -> Result<Expr> {
        let mut lhs = self.term_expr()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.term_expr()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn term_expr(&mut self) -> Result<Expr> {
        let mut lhs = self.factor()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                Some(Token::Percent) => BinaryOp::Rem,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.factor()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn factor(&mut self) -> Result<Expr> {
        match self.peek() {
            Some(Token::Minus) => {
                self.pos += 1;
                Ok(Expr::Unary(UnaryOp::Neg, Box::new(self.factor()?)))
            }
            Some(Token::Bang) => {
                self.pos += 1;
                Ok(Expr::Unary(UnaryOp::Not, Box::new(self.factor()?)))
            }
            _ => self.postfix(),
        }
    }

    fn postfix(&mut self) -> Result<Expr> {
        let mut expr = self.primary()?;
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.pos += 1;
                    let field = self.ident("field name after '.'")?;
                    expr = Expr::Field(Box::new(expr), field);
                }
                Some(Token::LBracket) => {
                    self.pos += 1;
                    let index = self.expression()?;
                    self.eat(&Token::RBracket, "']'")?;
                    expr = Expr::Index(Box::new(expr), Box::new(index));
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn primary(&mut self) -> Result<Expr> {
        let start = self.offset();
        match self.advance() {
            Some(Token::Int(v)) => Ok(Expr::Int(v)),
            Some(Token::Float(v)) => Ok(Expr::Float(v)),
            Some(Token::Str(v)) => Ok(Expr::Str(v)),
            Some(Token::True) => Ok(Expr::Bool(true)),
            Some(Token::False) => Ok(Expr::Bool(false)),
            Some(Token::Null) => Ok(Expr::Null),
            Some(Token::Ident(name)) => Ok(Expr::Var(name)),
            Some(Token::LParen) => {
                let inner = self.expression()?;
                self.eat(&Token::RParen, "')'")?;
                Ok(inner)
            }
            Some(Token::LBracket) => {
                let mut items = Vec::new();
                if !matches!(self.peek(), Some(Token::RBracket)) {
                    loop {
                        items.push(self.expression()?);
                        if matches!(self.peek(), Some(Token::Comma)) {
                            self.pos += 1;
                            // allow trailing comma
                            if matches!(self.peek(), Some(Token::RBracket)) {
                                break;
                            }
                        } else {
                            break;
                        }
                    }
                }
                self.eat(&Token::RBracket, "']'")?;
                Ok(Expr::List(items))
            }
            Some(Token::LBrace) => {
                let mut entries = Vec::new();
                if !matches!(self.peek(), Some(Token::RBrace)) {
                    loop {
                        let key = match self.advance() {
                            Some(Token::Str(s)) => s,
                            Some(Token::Ident(s)) => s,
                            _ => return Err(self.error("expected dict key")),
                        };
                        self.eat(&Token::Colon, "':'")?;
                        entries.push((key, self.expression()?));
                        if matches!(self.peek(), Some(Token::Comma)) {
                            self.pos += 1;
                            if matches!(self.peek(), Some(Token::RBrace)) {
                                break;
                            }
                        } else {
                            break;
                        }
                    }
                }
                self.eat(&Token::RBrace, "'}'")?;
                Ok(Expr::Map(entries))
            }
            Some(tok) => Err(QuiverError::EvalParse {
                expression: self.source.to_string(),
                offset: start,
                message: format!("unexpected token {tok:?}"),
            }),
            None => Err(self.error("unexpected end of input")),
        }
    }
}

/// Reinterpret an already-parsed expression as an assignment target.
///
/// Only `Var`, `Field`, and `Index` chains are assignable.
fn expr_to_target(expr: &Expr) -> Option<Target> {
    match expr {
        Expr::Var(name) => Some(Target {
            root: name.clone(),
            path: Vec::new(),
        }),
        Expr::Field(inner, field) => {
            let mut target = expr_to_target(inner)?;
            target.path.push(Accessor::Field(field.clone()));
            Some(target)
        }
        Expr::Index(inner, index) => {
            let mut target = expr_to_target(inner)?;
            target.path.push(Accessor::Index((**index).clone()));
            Some(target)
        }
        _ => None,
    }
}

/// Parse a block of statements (config-block mode).
pub fn parse_program(source: &str) -> Result<Program> {
    Parser::new(source)?.program()
}

/// Parse a single expression (contract mode); trailing input is an error.
pub fn parse_expression(source: &str) -> Result<Expr> {
    let mut parser = Parser::new(source)?;
    if parser.peek().is_none() {
        return Err(parser.error("empty expression"));
    }
    let expr = parser.expression()?;
    if parser.peek().is_some() {
        return Err(parser.error("unexpected trailing input after expression"));
    }
    Ok(expr)
}
