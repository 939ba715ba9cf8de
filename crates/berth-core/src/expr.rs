//! Boolean expressions for `{% if %}` blocks and step `when` conditions.
//!
//! Grammar:
//!
//! ```text
//! expr    := and ("or" and)*
//! and     := unary ("and" unary)*
//! unary   := "not" unary | atom
//! atom    := "true" | "false" | "(" expr ")" | operand (("==" | "!=") operand)?
//! operand := IDENT | "string" | 'string' | NUMBER
//! ```
//!
//! A bare identifier is a variable reference evaluated for truthiness.

use crate::context::{is_truthy, RenderContext};
use crate::error::TemplateError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    Var(String),
    Literal(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    Bool(bool),
    Truthy(String),
    Eq(Operand, Operand),
    Ne(Operand, Operand),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

impl Expr {
    /// Parse an expression.
    pub fn parse(src: &str) -> Result<Expr, TemplateError> {
        let tokens = tokenize(src)?;
        let mut parser = Parser {
            src,
            tokens,
            pos: 0,
        };
        let expr = parser.parse_or()?;
        if parser.pos != parser.tokens.len() {
            return Err(invalid(src, "unexpected trailing input"));
        }
        Ok(expr)
    }

    /// Evaluate against `ctx`. `line` is reported on unresolved variables.
    pub fn eval(&self, ctx: &RenderContext, line: usize) -> Result<bool, TemplateError> {
        match self {
            Expr::Bool(b) => Ok(*b),
            Expr::Truthy(name) => lookup(ctx, name, line).map(is_truthy),
            Expr::Eq(a, b) => Ok(resolve(ctx, a, line)? == resolve(ctx, b, line)?),
            Expr::Ne(a, b) => Ok(resolve(ctx, a, line)? != resolve(ctx, b, line)?),
            Expr::Not(inner) => Ok(!inner.eval(ctx, line)?),
            Expr::And(a, b) => Ok(a.eval(ctx, line)? && b.eval(ctx, line)?),
            Expr::Or(a, b) => Ok(a.eval(ctx, line)? || b.eval(ctx, line)?),
        }
    }
}

/// Parse and evaluate a step condition in one go.
pub fn evaluate_condition(src: &str, ctx: &RenderContext) -> Result<bool, TemplateError> {
    Expr::parse(src)?.eval(ctx, 1)
}

fn lookup<'a>(ctx: &'a RenderContext, name: &str, line: usize) -> Result<&'a str, TemplateError> {
    ctx.get(name)
        .ok_or_else(|| TemplateError::UnresolvedVariable {
            name: name.to_string(),
            line,
        })
}

fn resolve<'a>(
    ctx: &'a RenderContext,
    operand: &'a Operand,
    line: usize,
) -> Result<&'a str, TemplateError> {
    match operand {
        Operand::Var(name) => lookup(ctx, name, line),
        Operand::Literal(value) => Ok(value),
    }
}

fn invalid(src: &str, reason: impl Into<String>) -> TemplateError {
    TemplateError::InvalidExpression {
        expr: src.trim().to_string(),
        reason: reason.into(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(String),
    Str(String),
    Number(String),
    LParen,
    RParen,
    EqEq,
    NotEq,
}

fn tokenize(src: &str) -> Result<Vec<Token>, TemplateError> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '=' | '!' => {
                if chars.get(i + 1) != Some(&'=') {
                    return Err(invalid(src, format!("expected `{c}=`")));
                }
                tokens.push(if c == '=' { Token::EqEq } else { Token::NotEq });
                i += 2;
            }
            '"' | '\'' => {
                let quote = c;
                let start = i + 1;
                let mut end = start;
                while end < chars.len() && chars[end] != quote {
                    end += 1;
                }
                if end == chars.len() {
                    return Err(invalid(src, "unterminated string literal"));
                }
                tokens.push(Token::Str(chars[start..end].iter().collect()));
                i = end + 1;
            }
            c if c.is_ascii_digit() || c == '-' => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                if text == "-" {
                    return Err(invalid(src, "stray `-`"));
                }
                tokens.push(Token::Number(text));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => return Err(invalid(src, format!("unexpected character `{other}`"))),
        }
    }

    if tokens.is_empty() {
        return Err(invalid(src, "empty expression"));
    }
    Ok(tokens)
}

struct Parser<'a> {
    src: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_keyword(&self, kw: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(name)) if name == kw)
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn parse_or(&mut self) -> Result<Expr, TemplateError> {
        let mut left = self.parse_and()?;
        while self.peek_keyword("or") {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, TemplateError> {
        let mut left = self.parse_unary()?;
        while self.peek_keyword("and") {
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, TemplateError> {
        if self.peek_keyword("not") {
            self.pos += 1;
            let inner = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_atom()
    }

    fn parse_atom(&mut self) -> Result<Expr, TemplateError> {
        if self.peek() == Some(&Token::LParen) {
            self.pos += 1;
            let inner = self.parse_or()?;
            if self.next() != Some(Token::RParen) {
                return Err(invalid(self.src, "expected `)`"));
            }
            return Ok(inner);
        }

        if let Some(Token::Ident(name)) = self.peek() {
            let compared = matches!(
                self.tokens.get(self.pos + 1),
                Some(Token::EqEq) | Some(Token::NotEq)
            );
            if !compared && (name == "true" || name == "false") {
                let value = name == "true";
                self.pos += 1;
                return Ok(Expr::Bool(value));
            }
        }

        let left = self.parse_operand()?;
        match self.peek() {
            Some(Token::EqEq) | Some(Token::NotEq) => {
                let negate = self.next() == Some(Token::NotEq);
                let right = self.parse_operand()?;
                Ok(if negate {
                    Expr::Ne(left, right)
                } else {
                    Expr::Eq(left, right)
                })
            }
            _ => match left {
                Operand::Var(name) => Ok(Expr::Truthy(name)),
                Operand::Literal(_) => Err(invalid(
                    self.src,
                    "a literal must be compared with `==` or `!=`",
                )),
            },
        }
    }

    fn parse_operand(&mut self) -> Result<Operand, TemplateError> {
        match self.next() {
            Some(Token::Ident(name)) => match name.as_str() {
                "true" | "false" => Ok(Operand::Literal(name)),
                "and" | "or" | "not" => Err(invalid(
                    self.src,
                    format!("unexpected keyword `{name}`"),
                )),
                _ => Ok(Operand::Var(name)),
            },
            Some(Token::Str(s)) | Some(Token::Number(s)) => Ok(Operand::Literal(s)),
            Some(other) => Err(invalid(self.src, format!("unexpected token {other:?}"))),
            None => Err(invalid(self.src, "unexpected end of expression")),
        }
    }
}
