//! Condition expressions used to pick a pool's active sizing strategy or
//! fleet manager.
//!
//! Conditions are small boolean expressions evaluated against a map of
//! string properties, typically the current UTC time broken into parts:
//!
//! ```text
//! timeUtcHour >= 8 && timeUtcHour < 18 && timeUtcDayOfWeek != 'saturday'
//! timeUtcDayOfWeek ~= '^(saturday|sunday)$'
//! ```
//!
//! Operands are property names, quoted strings, numbers or `true`/`false`.
//! Comparisons are numeric when both sides parse as numbers and
//! case-insensitive string comparisons otherwise. Properties that are not
//! defined evaluate to the empty string.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{CoreError, CoreResult};

/// String properties a condition is evaluated against.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConditionProperties {
    values: BTreeMap<String, String>,
}

impl ConditionProperties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Properties describing `now` in UTC.
    ///
    /// Numeric parts are plain decimal strings (`"7"`, not `"07"`), the
    /// weekday is the lower-cased English name.
    pub fn from_time(now: DateTime<Utc>) -> Self {
        let mut props = Self::new();
        props.insert("timeUtcYear", now.year().to_string());
        props.insert("timeUtcMonth", now.month().to_string());
        props.insert("timeUtcDay", now.day().to_string());
        props.insert("timeUtcDayOfWeek", weekday_name(now.weekday()));
        props.insert("timeUtcHour", now.hour().to_string());
        props.insert("timeUtcMin", now.minute().to_string());
        props.insert("timeUtcSec", now.second().to_string());
        props
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }
}

fn weekday_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "monday",
        Weekday::Tue => "tuesday",
        Weekday::Wed => "wednesday",
        Weekday::Thu => "thursday",
        Weekday::Fri => "friday",
        Weekday::Sat => "saturday",
        Weekday::Sun => "sunday",
    }
}

/// A parsed condition expression.
#[derive(Clone)]
pub struct Condition {
    text: String,
    root: Expr,
}

impl Condition {
    /// Parse a condition expression.
    pub fn parse(text: &str) -> CoreResult<Self> {
        let tokens = tokenize(text).map_err(|message| condition_error(text, message))?;
        let mut parser = Parser { tokens, pos: 0 };
        let root = parser
            .parse_or()
            .map_err(|message| condition_error(text, message))?;
        if parser.pos != parser.tokens.len() {
            return Err(condition_error(
                text,
                format!("unexpected token {:?}", parser.tokens[parser.pos]),
            ));
        }
        Ok(Self {
            text: text.to_string(),
            root,
        })
    }

    /// Evaluate the condition against `props`.
    pub fn evaluate(&self, props: &ConditionProperties) -> CoreResult<bool> {
        self.root
            .eval(props)
            .and_then(|v| v.truthy())
            .map_err(|message| condition_error(&self.text, message))
    }

    pub fn text(&self) -> &str {
        &self.text
    }
}

impl fmt::Debug for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Condition").field(&self.text).finish()
    }
}

impl PartialEq for Condition {
    fn eq(&self, other: &Self) -> bool {
        self.text == other.text
    }
}

impl Serialize for Condition {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.text)
    }
}

impl<'de> Deserialize<'de> for Condition {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Condition::parse(&text).map_err(serde::de::Error::custom)
    }
}

fn condition_error(expr: &str, message: impl Into<String>) -> CoreError {
    CoreError::Condition {
        expr: expr.to_string(),
        message: message.into(),
    }
}

// ── Tokens ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Number(String),
    Op(CmpOp),
    Match,
    And,
    Or,
    Not,
    LParen,
    RParen,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

fn tokenize(text: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = text.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
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
            '&' if next == Some('&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if next == Some('|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '=' if next == Some('=') => {
                tokens.push(Token::Op(CmpOp::Eq));
                i += 2;
            }
            '~' if next == Some('=') => {
                tokens.push(Token::Match);
                i += 2;
            }
            '!' if next == Some('=') => {
                tokens.push(Token::Op(CmpOp::Ne));
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '<' | '>' => {
                let op = match (c, next == Some('=')) {
                    ('<', false) => CmpOp::Lt,
                    ('<', true) => CmpOp::Le,
                    ('>', false) => CmpOp::Gt,
                    _ => CmpOp::Ge,
                };
                tokens.push(Token::Op(op));
                i += if next == Some('=') { 2 } else { 1 };
            }
            '\'' | '"' => {
                let quote = c;
                let start = i + 1;
                let mut end = start;
                while end < chars.len() && chars[end] != quote {
                    end += 1;
                }
                if end >= chars.len() {
                    return Err("unterminated string literal".to_string());
                }
                tokens.push(Token::Str(chars[start..end].iter().collect()));
                i = end + 1;
            }
            c if c.is_ascii_digit() || (c == '-' && next.is_some_and(|n| n.is_ascii_digit())) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                tokens.push(Token::Number(chars[start..i].iter().collect()));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.')
                {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => return Err(format!("unexpected character {other:?}")),
        }
    }

    Ok(tokens)
}

// ── Syntax tree ────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Expr {
    Literal(Value),
    Property(String),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(Box<Expr>, CmpOp, Box<Expr>),
    Matches(Box<Expr>, Regex),
}

#[derive(Debug, Clone, PartialEq)]
enum Value {
    Str(String),
    Bool(bool),
}

impl Value {
    fn as_text(&self) -> &str {
        match self {
            Value::Str(s) => s,
            Value::Bool(true) => "true",
            Value::Bool(false) => "false",
        }
    }

    fn truthy(&self) -> Result<bool, String> {
        match self {
            Value::Bool(b) => Ok(*b),
            Value::Str(s) if s.eq_ignore_ascii_case("true") => Ok(true),
            Value::Str(s) if s.eq_ignore_ascii_case("false") || s.is_empty() => Ok(false),
            Value::Str(s) => Err(format!("{s:?} is not a boolean")),
        }
    }
}

impl Expr {
    fn eval(&self, props: &ConditionProperties) -> Result<Value, String> {
        match self {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Property(name) => Ok(Value::Str(props.get(name).unwrap_or_default().to_string())),
            Expr::Not(inner) => Ok(Value::Bool(!inner.eval(props)?.truthy()?)),
            Expr::And(lhs, rhs) => {
                let result = lhs.eval(props)?.truthy()? && rhs.eval(props)?.truthy()?;
                Ok(Value::Bool(result))
            }
            Expr::Or(lhs, rhs) => {
                let result = lhs.eval(props)?.truthy()? || rhs.eval(props)?.truthy()?;
                Ok(Value::Bool(result))
            }
            Expr::Compare(lhs, op, rhs) => {
                let lhs = lhs.eval(props)?;
                let rhs = rhs.eval(props)?;
                compare(lhs.as_text(), *op, rhs.as_text()).map(Value::Bool)
            }
            Expr::Matches(lhs, re) => {
                let lhs = lhs.eval(props)?;
                Ok(Value::Bool(re.is_match(lhs.as_text())))
            }
        }
    }
}

fn compare(lhs: &str, op: CmpOp, rhs: &str) -> Result<bool, String> {
    if let (Ok(a), Ok(b)) = (lhs.trim().parse::<f64>(), rhs.trim().parse::<f64>()) {
        return Ok(match op {
            CmpOp::Eq => a == b,
            CmpOp::Ne => a != b,
            CmpOp::Lt => a < b,
            CmpOp::Le => a <= b,
            CmpOp::Gt => a > b,
            CmpOp::Ge => a >= b,
        });
    }
    match op {
        CmpOp::Eq => Ok(lhs.eq_ignore_ascii_case(rhs)),
        CmpOp::Ne => Ok(!lhs.eq_ignore_ascii_case(rhs)),
        _ => Err(format!("cannot order non-numeric values {lhs:?} and {rhs:?}")),
    }
}

// ── Parser ─────────────────────────────────────────────────────────

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
        self.pos += 1;
        token
    }

    fn parse_or(&mut self) -> Result<Expr, String> {
        let mut lhs = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let rhs = self.parse_and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, String> {
        let mut lhs = self.parse_unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let rhs = self.parse_unary()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, String> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            return Ok(Expr::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, String> {
        let lhs = self.parse_primary()?;
        match self.peek() {
            Some(Token::Op(op)) => {
                let op = *op;
                self.pos += 1;
                let rhs = self.parse_primary()?;
                Ok(Expr::Compare(Box::new(lhs), op, Box::new(rhs)))
            }
            Some(Token::Match) => {
                self.pos += 1;
                match self.next() {
                    Some(Token::Str(pattern)) => {
                        let re = Regex::new(&format!("(?i){pattern}"))
                            .map_err(|e| format!("invalid regex {pattern:?}: {e}"))?;
                        Ok(Expr::Matches(Box::new(lhs), re))
                    }
                    other => Err(format!("expected string pattern after ~=, found {other:?}")),
                }
            }
            _ => Ok(lhs),
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, String> {
        match self.next() {
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    other => Err(format!("expected ')', found {other:?}")),
                }
            }
            Some(Token::Str(s)) | Some(Token::Number(s)) => Ok(Expr::Literal(Value::Str(s))),
            Some(Token::Ident(name)) => Ok(match name.as_str() {
                "true" => Expr::Literal(Value::Bool(true)),
                "false" => Expr::Literal(Value::Bool(false)),
                _ => Expr::Property(name),
            }),
            Some(other) => Err(format!("unexpected token {other:?}")),
            None => Err("unexpected end of expression".to_string()),
        }
    }
}
