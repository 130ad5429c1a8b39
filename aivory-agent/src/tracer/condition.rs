// Copyright 2024-Present AIVory, Inc. https://www.aivory.net/
// SPDX-License-Identifier: Apache-2.0

//! Breakpoint condition expressions: a small comparison language evaluated
//! against the hit frame's locals. `i == 3`, `user.age >= 18 && region == 'eu'`,
//! `items[0] != null`, `not done`.

use crate::capture::{Inspect, Shape};
use anyhow::{anyhow, bail, Result};
use std::borrow::Cow;
use std::fmt::{self, Display, Formatter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Comparison {
    Equals,
    NotEquals,
    LessThan,
    LessOrEquals,
    GreaterThan,
    GreaterOrEquals,
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Member(String),
    Index(Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Null,
    Bool(bool),
    Number(f64),
    Str(String),
    Reference(Vec<Segment>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(Box<Expr>, Comparison, Box<Expr>),
}

/// A parsed breakpoint condition. Parsing happens once at install time;
/// evaluation failures surface as errors and are treated as a non-hit by the
/// caller.
#[derive(Debug)]
pub struct BreakpointCondition {
    source: String,
    expr: Expr,
}

impl Display for BreakpointCondition {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl BreakpointCondition {
    pub fn parse(source: &str) -> Result<Self> {
        let tokens = tokenize(source)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.expression()?;
        if parser.pos != parser.tokens.len() {
            bail!("unexpected trailing input in condition {source:?}");
        }
        Ok(BreakpointCondition {
            source: source.to_string(),
            expr,
        })
    }

    pub fn evaluate(&self, locals: &[(&str, &dyn Inspect)]) -> Result<bool> {
        truthy(&eval(&self.expr, locals)?)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Str(String),
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Not,
    Dot,
    LParen,
    RParen,
    LBracket,
    RBracket,
}

fn tokenize(source: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = source.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\n' | '\r' => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '[' => {
                chars.next();
                tokens.push(Token::LBracket);
            }
            ']' => {
                chars.next();
                tokens.push(Token::RBracket);
            }
            '.' => {
                chars.next();
                tokens.push(Token::Dot);
            }
            '=' => {
                chars.next();
                match chars.next() {
                    Some('=') => tokens.push(Token::Eq),
                    other => bail!("expected '==', found '={}'", other.unwrap_or(' ')),
                }
            }
            '!' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Ne);
                } else {
                    tokens.push(Token::Not);
                }
            }
            '<' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Le);
                } else {
                    tokens.push(Token::Lt);
                }
            }
            '>' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Ge);
                } else {
                    tokens.push(Token::Gt);
                }
            }
            '&' => {
                chars.next();
                match chars.next() {
                    Some('&') => tokens.push(Token::And),
                    _ => bail!("expected '&&'"),
                }
            }
            '|' => {
                chars.next();
                match chars.next() {
                    Some('|') => tokens.push(Token::Or),
                    _ => bail!("expected '||'"),
                }
            }
            '\'' | '"' => {
                let quote = c;
                chars.next();
                let mut value = String::new();
                loop {
                    match chars.next() {
                        Some('\\') => match chars.next() {
                            Some(escaped) => value.push(escaped),
                            None => bail!("unterminated string in condition"),
                        },
                        Some(ch) if ch == quote => break,
                        Some(ch) => value.push(ch),
                        None => bail!("unterminated string in condition"),
                    }
                }
                tokens.push(Token::Str(value));
            }
            '-' | '0'..='9' => {
                let mut literal = String::new();
                if c == '-' {
                    literal.push(c);
                    chars.next();
                }
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() || d == '.' {
                        literal.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let number: f64 = literal
                    .parse()
                    .map_err(|_| anyhow!("invalid number {literal:?} in condition"))?;
                tokens.push(Token::Number(number));
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_alphanumeric() || d == '_' {
                        ident.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                match ident.as_str() {
                    "and" => tokens.push(Token::And),
                    "or" => tokens.push(Token::Or),
                    "not" => tokens.push(Token::Not),
                    "true" | "True" => tokens.push(Token::Ident("true".to_string())),
                    "false" | "False" => tokens.push(Token::Ident("false".to_string())),
                    "null" | "none" | "None" => tokens.push(Token::Ident("null".to_string())),
                    _ => tokens.push(Token::Ident(ident)),
                }
            }
            other => bail!("unexpected character {other:?} in condition"),
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, expected: Token) -> Result<()> {
        match self.next() {
            Some(token) if token == expected => Ok(()),
            other => bail!("expected {expected:?}, found {other:?}"),
        }
    }

    fn expression(&mut self) -> Result<Expr> {
        let mut left = self.conjunction()?;
        while self.peek() == Some(&Token::Or) {
            self.next();
            let right = self.conjunction()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn conjunction(&mut self) -> Result<Expr> {
        let mut left = self.negation()?;
        while self.peek() == Some(&Token::And) {
            self.next();
            let right = self.negation()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn negation(&mut self) -> Result<Expr> {
        if self.peek() == Some(&Token::Not) {
            self.next();
            return Ok(Expr::Not(Box::new(self.negation()?)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr> {
        let left = self.operand()?;
        let comparison = match self.peek() {
            Some(Token::Eq) => Comparison::Equals,
            Some(Token::Ne) => Comparison::NotEquals,
            Some(Token::Lt) => Comparison::LessThan,
            Some(Token::Le) => Comparison::LessOrEquals,
            Some(Token::Gt) => Comparison::GreaterThan,
            Some(Token::Ge) => Comparison::GreaterOrEquals,
            _ => return Ok(left),
        };
        self.next();
        let right = self.operand()?;
        Ok(Expr::Compare(Box::new(left), comparison, Box::new(right)))
    }

    fn operand(&mut self) -> Result<Expr> {
        match self.next() {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::Str(s)) => Ok(Expr::Str(s)),
            Some(Token::LParen) => {
                let inner = self.expression()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Ident(name)) => match name.as_str() {
                "true" => Ok(Expr::Bool(true)),
                "false" => Ok(Expr::Bool(false)),
                "null" => Ok(Expr::Null),
                _ => self.reference(name),
            },
            other => bail!("expected a value, found {other:?}"),
        }
    }

    fn reference(&mut self, base: String) -> Result<Expr> {
        let mut segments = vec![Segment::Member(base)];
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.next();
                    match self.next() {
                        Some(Token::Ident(member)) => segments.push(Segment::Member(member)),
                        other => bail!("expected member name after '.', found {other:?}"),
                    }
                }
                Some(Token::LBracket) => {
                    self.next();
                    let index = self.expression()?;
                    self.expect(Token::RBracket)?;
                    segments.push(Segment::Index(Box::new(index)));
                }
                _ => return Ok(Expr::Reference(segments)),
            }
        }
    }
}

/// A resolved scalar operand.
enum Scalar<'a> {
    Null,
    Bool(bool),
    Number(f64),
    Str(Cow<'a, str>),
}

fn eval<'e>(expr: &Expr, locals: &'e [(&str, &'e dyn Inspect)]) -> Result<Scalar<'e>> {
    Ok(match expr {
        Expr::Null => Scalar::Null,
        Expr::Bool(b) => Scalar::Bool(*b),
        Expr::Number(n) => Scalar::Number(*n),
        Expr::Str(s) => Scalar::Str(Cow::Owned(s.clone())),
        Expr::Reference(segments) => scalarize(resolve(segments, locals)?)?,
        Expr::Not(inner) => Scalar::Bool(!truthy(&eval(inner, locals)?)?),
        Expr::And(left, right) => {
            Scalar::Bool(truthy(&eval(left, locals)?)? && truthy(&eval(right, locals)?)?)
        }
        Expr::Or(left, right) => {
            Scalar::Bool(truthy(&eval(left, locals)?)? || truthy(&eval(right, locals)?)?)
        }
        Expr::Compare(left, comparison, right) => {
            let left = eval(left, locals)?;
            let right = eval(right, locals)?;
            Scalar::Bool(compare(&left, *comparison, &right)?)
        }
    })
}

fn resolve<'e>(
    segments: &[Segment],
    locals: &'e [(&str, &'e dyn Inspect)],
) -> Result<&'e dyn Inspect> {
    let mut segments = segments.iter();
    let Some(Segment::Member(base)) = segments.next() else {
        bail!("reference has no base identifier");
    };
    let mut current: &'e dyn Inspect = locals
        .iter()
        .find(|(name, _)| *name == base.as_str())
        .map(|(_, value)| *value)
        .ok_or_else(|| anyhow!("could not fetch {base}"))?;

    for segment in segments {
        current = match segment {
            Segment::Member(member) => fetch_member(current, member)?,
            Segment::Index(index) => {
                let index = eval(index, locals)?;
                fetch_index(current, &index)?
            }
        };
    }
    Ok(current)
}

fn fetch_member<'e>(value: &'e dyn Inspect, member: &str) -> Result<&'e dyn Inspect> {
    match value.shape()? {
        Shape::Record(fields) => fields
            .into_iter()
            .find(|(name, _)| *name == member)
            .map(|(_, value)| value)
            .ok_or_else(|| anyhow!("could not fetch property {member}")),
        Shape::Map(map) => {
            for (key, entry) in map.entries {
                if key == member {
                    return Ok(entry);
                }
            }
            Err(anyhow!("could not fetch property {member}"))
        }
        _ => Err(anyhow!(
            "cannot fetch property {member} on {}",
            value.type_name()
        )),
    }
}

fn fetch_index<'e>(value: &'e dyn Inspect, index: &Scalar<'_>) -> Result<&'e dyn Inspect> {
    match value.shape()? {
        Shape::Sequence(seq) | Shape::Set(seq) => {
            let position = match index {
                Scalar::Number(n) if *n >= 0.0 => *n as usize,
                _ => bail!("sequence index must be a non-negative number"),
            };
            seq.items
                .into_iter()
                .nth(position)
                .ok_or_else(|| anyhow!("could not fetch index {position}"))
        }
        Shape::Map(map) => {
            let key = match index {
                Scalar::Str(s) => s.to_string(),
                Scalar::Number(n) => n.to_string(),
                _ => bail!("map index must be a string or number"),
            };
            for (entry_key, entry) in map.entries {
                if entry_key == key {
                    return Ok(entry);
                }
            }
            Err(anyhow!("could not fetch index {key:?}"))
        }
        _ => Err(anyhow!("cannot index into {}", value.type_name())),
    }
}

fn scalarize<'e>(value: &'e dyn Inspect) -> Result<Scalar<'e>> {
    Ok(match value.shape()? {
        Shape::Null => Scalar::Null,
        Shape::Bool(b) => Scalar::Bool(b),
        Shape::Int(i) => Scalar::Number(i as f64),
        Shape::Float(f) => Scalar::Number(f),
        Shape::Text(text) => Scalar::Str(text),
        _ => bail!("{} is not a scalar value", value.type_name()),
    })
}

fn truthy(value: &Scalar<'_>) -> Result<bool> {
    Ok(match value {
        Scalar::Null => false,
        Scalar::Bool(b) => *b,
        Scalar::Number(n) => *n != 0.0,
        Scalar::Str(s) => !s.is_empty(),
    })
}

fn compare(left: &Scalar<'_>, comparison: Comparison, right: &Scalar<'_>) -> Result<bool> {
    use Comparison::*;
    let ordering = match (left, right) {
        (Scalar::Number(a), Scalar::Number(b)) => a.partial_cmp(b),
        (Scalar::Str(a), Scalar::Str(b)) => Some(a.cmp(b)),
        (Scalar::Bool(a), Scalar::Bool(b)) => match comparison {
            Equals => return Ok(a == b),
            NotEquals => return Ok(a != b),
            _ => bail!("booleans cannot be ordered"),
        },
        (Scalar::Null, Scalar::Null) => match comparison {
            Equals => return Ok(true),
            NotEquals => return Ok(false),
            _ => bail!("null cannot be ordered"),
        },
        _ => match comparison {
            // Values of different kinds are never equal.
            Equals => return Ok(false),
            NotEquals => return Ok(true),
            _ => bail!("cannot order values of different types"),
        },
    };
    let Some(ordering) = ordering else {
        return Ok(false);
    };
    Ok(match comparison {
        Equals => ordering.is_eq(),
        NotEquals => !ordering.is_eq(),
        LessThan => ordering.is_lt(),
        LessOrEquals => ordering.is_le(),
        GreaterThan => ordering.is_gt(),
        GreaterOrEquals => ordering.is_ge(),
    })
}
