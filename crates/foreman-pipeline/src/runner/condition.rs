//! Conditional branch runner and its expression language.
//!
//! Expressions support:
//!
//! - literals: `'text'`, `"text"`, `42`, `-1.5`, `true`, `false`, `null`
//! - context references: `${step.field}` or a bare dotted path `step.field`
//! - comparison: `==`, `!=`, `<`, `<=`, `>`, `>=`, `contains`
//! - boolean logic: `&&`, `||`, `!` and parentheses
//!
//! References that resolve to nothing evaluate to `null`.

use std::cmp::Ordering;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::debug;

use super::{StepResult, StepRunner};
use crate::context::ExecutionContext;

/// Picks the first branch whose expression holds.
///
/// Parameters: `conditions` (ordered list of `{expression, target}`; `if` and
/// `then` are accepted as aliases) and `default`. Output:
/// `{target, matched_index}` where `matched_index` is null when the default
/// was taken.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConditionRunner;

#[async_trait]
impl StepRunner for ConditionRunner {
    fn step_type(&self) -> &str {
        "condition"
    }

    async fn execute(&self, step_id: &str, params: &Value, ctx: &ExecutionContext) -> StepResult {
        let started = Instant::now();
        let Some(conditions) = params.get("conditions").and_then(Value::as_array) else {
            return StepResult::failed("Missing required parameter 'conditions'");
        };

        for (index, branch) in conditions.iter().enumerate() {
            let expression = branch
                .get("expression")
                .or_else(|| branch.get("if"))
                .and_then(Value::as_str);
            let target = branch
                .get("target")
                .or_else(|| branch.get("then"))
                .and_then(Value::as_str);
            let (Some(expression), Some(target)) = (expression, target) else {
                return StepResult::failed(format!(
                    "Condition {index} needs an 'expression' and a 'target'"
                ));
            };

            match evaluate_condition(expression, ctx) {
                Ok(true) => {
                    debug!(step_id, index, target, "Condition matched");
                    return StepResult::completed(json!({"target": target, "matched_index": index}))
                        .with_branch(target)
                        .with_duration(started.elapsed());
                }
                Ok(false) => {}
                Err(e) => {
                    return StepResult::failed(format!("Condition {index} is invalid: {e}"))
                        .with_duration(started.elapsed());
                }
            }
        }

        match params.get("default").and_then(Value::as_str) {
            Some(target) => {
                debug!(step_id, target, "No condition matched, taking default");
                StepResult::completed(json!({"target": target, "matched_index": null}))
                    .with_branch(target)
                    .with_duration(started.elapsed())
            }
            None => StepResult::failed("No condition matched and no default target is set")
                .with_duration(started.elapsed()),
        }
    }
}

/// Evaluate a boolean expression against the context.
pub fn evaluate_condition(expression: &str, ctx: &ExecutionContext) -> Result<bool, String> {
    let tokens = tokenize(expression)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_or()?;
    if parser.pos < parser.tokens.len() {
        return Err(format!("unexpected {:?}", parser.tokens[parser.pos]));
    }
    Ok(truthy(&expr.eval(ctx)?))
}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Str(String),
    Num(f64),
    Bool(bool),
    Null,
    Ref(String),
    Op(CmpOp),
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
    Contains,
}

fn tokenize(src: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = src.chars().collect();
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
                    ('<', true) => CmpOp::Le,
                    ('<', false) => CmpOp::Lt,
                    ('>', true) => CmpOp::Ge,
                    _ => CmpOp::Gt,
                };
                tokens.push(Token::Op(op));
                i += if next == Some('=') { 2 } else { 1 };
            }
            '\'' | '"' => {
                let quote = c;
                let mut text = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err("unterminated string literal".to_string()),
                        Some('\\') if i + 1 < chars.len() => {
                            text.push(chars[i + 1]);
                            i += 2;
                        }
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            text.push(ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(text));
            }
            '$' if next == Some('{') => {
                let rest: String = chars[i + 2..].iter().collect();
                let Some(len) = rest.find('}') else {
                    return Err("unterminated ${ reference".to_string());
                };
                let path = rest[..len].trim().to_string();
                if path.is_empty() {
                    return Err("empty ${} reference".to_string());
                }
                i += 2 + rest[..len].chars().count() + 1;
                tokens.push(Token::Ref(path));
            }
            c if c.is_ascii_digit()
                || (c == '-' && next.is_some_and(|n| n.is_ascii_digit())) =>
            {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let literal: String = chars[start..i].iter().collect();
                let n = literal
                    .parse::<f64>()
                    .map_err(|_| format!("invalid number '{literal}'"))?;
                tokens.push(Token::Num(n));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || matches!(chars[i], '_' | '.' | '-'))
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "true" => Token::Bool(true),
                    "false" => Token::Bool(false),
                    "null" => Token::Null,
                    "contains" => Token::Op(CmpOp::Contains),
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    _ => Token::Ref(word),
                });
            }
            other => return Err(format!("unexpected character '{other}'")),
        }
    }
    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum Expr {
    Literal(Value),
    Ref(String),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(Box<Expr>, CmpOp, Box<Expr>),
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn parse_or(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.advance();
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_not()?;
        while self.peek() == Some(&Token::And) {
            self.advance();
            let right = self.parse_not()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, String> {
        if self.peek() == Some(&Token::Not) {
            self.advance();
            return Ok(Expr::Not(Box::new(self.parse_not()?)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, String> {
        let left = self.parse_primary()?;
        if let Some(Token::Op(op)) = self.peek() {
            let op = *op;
            self.advance();
            let right = self.parse_primary()?;
            return Ok(Expr::Compare(Box::new(left), op, Box::new(right)));
        }
        Ok(left)
    }

    fn parse_primary(&mut self) -> Result<Expr, String> {
        match self.advance() {
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Num(n)) => Ok(Expr::Literal(json!(n))),
            Some(Token::Bool(b)) => Ok(Expr::Literal(Value::Bool(b))),
            Some(Token::Null) => Ok(Expr::Literal(Value::Null)),
            Some(Token::Ref(path)) => Ok(Expr::Ref(path)),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                match self.advance() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err("expected ')'".to_string()),
                }
            }
            Some(other) => Err(format!("unexpected {other:?}")),
            None => Err("unexpected end of expression".to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

impl Expr {
    fn eval(&self, ctx: &ExecutionContext) -> Result<Value, String> {
        match self {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Ref(path) => Ok(ctx.get(path).cloned().unwrap_or(Value::Null)),
            Expr::Not(inner) => Ok(Value::Bool(!truthy(&inner.eval(ctx)?))),
            Expr::And(l, r) => {
                if !truthy(&l.eval(ctx)?) {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(truthy(&r.eval(ctx)?)))
            }
            Expr::Or(l, r) => {
                if truthy(&l.eval(ctx)?) {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(truthy(&r.eval(ctx)?)))
            }
            Expr::Compare(l, op, r) => compare(&l.eval(ctx)?, *op, &r.eval(ctx)?).map(Value::Bool),
        }
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn loosely_equal(left: &Value, right: &Value) -> bool {
    match (left.as_f64(), right.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => left == right,
    }
}

fn compare(left: &Value, op: CmpOp, right: &Value) -> Result<bool, String> {
    let ordering = || -> Result<Ordering, String> {
        match (left, right) {
            (Value::Number(a), Value::Number(b)) => {
                let (a, b) = (a.as_f64().unwrap_or(f64::NAN), b.as_f64().unwrap_or(f64::NAN));
                a.partial_cmp(&b).ok_or_else(|| "cannot order NaN".to_string())
            }
            (Value::String(a), Value::String(b)) => Ok(a.cmp(b)),
            _ => Err(format!("cannot order {left} and {right}")),
        }
    };

    Ok(match op {
        CmpOp::Eq => loosely_equal(left, right),
        CmpOp::Ne => !loosely_equal(left, right),
        CmpOp::Lt => ordering()? == Ordering::Less,
        CmpOp::Le => ordering()? != Ordering::Greater,
        CmpOp::Gt => ordering()? == Ordering::Greater,
        CmpOp::Ge => ordering()? != Ordering::Less,
        CmpOp::Contains => match (left, right) {
            (Value::String(hay), Value::String(needle)) => hay.contains(needle.as_str()),
            (Value::Array(items), needle) => items.iter().any(|item| loosely_equal(item, needle)),
            (Value::Object(map), Value::String(key)) => map.contains_key(key),
            (Value::Null, _) => false,
            _ => return Err(format!("{left} cannot contain {right}")),
        },
    })
}
