//! Boolean expressions evaluated by CONDITION nodes.
//!
//! Grammar (lowest precedence first):
//!
//! ```text
//! expr    := and ("||" and)*
//! and     := unary ("&&" unary)*
//! unary   := "!" unary | compare
//! compare := operand (("==" | "!=" | ">" | ">=" | "<" | "<=" | "contains") operand)?
//! operand := number | string | true | false | null | "len(" path ")" | path | "(" expr ")"
//! path    := ident ("." segment)*
//! ```
//!
//! Paths are resolved against a JSON scope; a segment that is a number
//! indexes into an array. Unknown paths resolve to `null`.
//!
//! Expressions are limited to [`MAX_TOKENS`] tokens and [`MAX_NESTING`]
//! levels of `!` and parentheses.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::error::CoreError;

pub const MAX_TOKENS: usize = 1024;
pub const MAX_NESTING: usize = 64;

static TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"^\s*(?:(?P<num>-?\d+(?:\.\d+)?)|(?P<str>"(?:[^"\\]|\\.)*"|'(?:[^'\\]|\\.)*')|(?P<op>\|\||&&|==|!=|>=|<=|>|<|!|\(|\))|(?P<ident>[A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z0-9_]+)*))"#,
    )
    .expect("valid regex")
});

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Str(String),
    Op(&'static str),
    Ident(String),
}

const OPS: [&str; 12] = ["||", "&&", "==", "!=", ">=", "<=", ">", "<", "!", "(", ")", "contains"];

fn op(text: &str) -> Option<&'static str> {
    OPS.iter().copied().find(|o| *o == text)
}

fn tokenize(input: &str) -> Result<Vec<Token>, CoreError> {
    let mut tokens = Vec::new();
    let mut rest = input;
    while !rest.trim_start().is_empty() {
        if tokens.len() == MAX_TOKENS {
            return Err(CoreError::Validation(format!(
                "Condition expression has more than {MAX_TOKENS} tokens"
            )));
        }
        let caps = TOKEN_RE.captures(rest).ok_or_else(|| {
            CoreError::Validation(format!("Unexpected input in expression near \"{}\"", rest.trim()))
        })?;
        let whole = caps.get(0).map_or(0, |m| m.end());
        if let Some(m) = caps.name("num") {
            let n = m
                .as_str()
                .parse::<f64>()
                .map_err(|e| CoreError::Validation(format!("Bad number: {e}")))?;
            tokens.push(Token::Num(n));
        } else if let Some(m) = caps.name("str") {
            let raw = m.as_str();
            tokens.push(Token::Str(unescape(&raw[1..raw.len() - 1])));
        } else if let Some(m) = caps.name("op") {
            tokens.push(Token::Op(op(m.as_str()).unwrap_or("!")));
        } else if let Some(m) = caps.name("ident") {
            match op(m.as_str()) {
                Some(o) => tokens.push(Token::Op(o)),
                None => tokens.push(Token::Ident(m.as_str().to_string())),
            }
        }
        rest = &rest[whole..];
    }
    Ok(tokens)
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

// ---------------------------------------------------------------------------
// AST
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Path(String),
    Len(String),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(&'static str, Box<Expr>, Box<Expr>),
}

/// A parsed condition expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    source: String,
    expr: Expr,
}

impl Condition {
    pub fn parse(source: &str) -> Result<Self, CoreError> {
        let tokens = tokenize(source)?;
        if tokens.is_empty() {
            return Err(CoreError::Validation("Condition expression is empty".into()));
        }
        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
        };
        let expr = parser.parse_or()?;
        if parser.pos != parser.tokens.len() {
            return Err(CoreError::Validation(format!(
                "Trailing tokens in expression \"{source}\""
            )));
        }
        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate against `scope`, coercing the result to a boolean.
    pub fn evaluate(&self, scope: &Value) -> bool {
        truthy(&eval(&self.expr, scope))
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek_op(&self) -> Option<&'static str> {
        match self.tokens.get(self.pos) {
            Some(Token::Op(o)) => Some(o),
            _ => None,
        }
    }

    fn expect_op(&mut self, expected: &str) -> Result<(), CoreError> {
        if self.peek_op() == Some(expected) {
            self.pos += 1;
            Ok(())
        } else {
            Err(CoreError::Validation(format!("Expected \"{expected}\" in expression")))
        }
    }

    fn nested<T>(
        &mut self,
        parse: impl FnOnce(&mut Self) -> Result<T, CoreError>,
    ) -> Result<T, CoreError> {
        if self.depth >= MAX_NESTING {
            return Err(CoreError::Validation(format!(
                "Condition expression nests deeper than {MAX_NESTING} levels"
            )));
        }
        self.depth += 1;
        let result = parse(self);
        self.depth -= 1;
        result
    }

    fn parse_or(&mut self) -> Result<Expr, CoreError> {
        let mut left = self.parse_and()?;
        while self.peek_op() == Some("||") {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, CoreError> {
        let mut left = self.parse_unary()?;
        while self.peek_op() == Some("&&") {
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, CoreError> {
        if self.peek_op() == Some("!") {
            self.pos += 1;
            let inner = self.nested(Self::parse_unary)?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_compare()
    }

    fn parse_compare(&mut self) -> Result<Expr, CoreError> {
        let left = self.parse_operand()?;
        match self.peek_op() {
            Some(o @ ("==" | "!=" | ">" | ">=" | "<" | "<=" | "contains")) => {
                self.pos += 1;
                let right = self.parse_operand()?;
                Ok(Expr::Compare(o, Box::new(left), Box::new(right)))
            }
            _ => Ok(left),
        }
    }

    fn parse_operand(&mut self) -> Result<Expr, CoreError> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or_else(|| CoreError::Validation("Unexpected end of expression".into()))?;
        self.pos += 1;
        match token {
            Token::Num(n) => Ok(Expr::Literal(
                serde_json::Number::from_f64(n).map_or(Value::Null, Value::Number),
            )),
            Token::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Token::Op("(") => {
                let inner = self.nested(Self::parse_or)?;
                self.expect_op(")")?;
                Ok(inner)
            }
            Token::Op(o) => Err(CoreError::Validation(format!(
                "Unexpected \"{o}\" in expression"
            ))),
            Token::Ident(name) => match name.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" => Ok(Expr::Literal(Value::Null)),
                "len" if self.peek_op() == Some("(") => {
                    self.pos += 1;
                    let path = match self.tokens.get(self.pos) {
                        Some(Token::Ident(p)) => p.clone(),
                        _ => {
                            return Err(CoreError::Validation(
                                "len() expects a path argument".into(),
                            ))
                        }
                    };
                    self.pos += 1;
                    self.expect_op(")")?;
                    Ok(Expr::Len(path))
                }
                _ => Ok(Expr::Path(name)),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Resolve a dotted path inside `scope`.
pub fn lookup<'a>(scope: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(scope, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// JSON truthiness: null, false, zero and empty containers are false.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn length(value: &Value) -> usize {
    match value {
        Value::String(s) => s.chars().count(),
        Value::Array(a) => a.len(),
        Value::Object(o) => o.len(),
        _ => 0,
    }
}

fn eval(expr: &Expr, scope: &Value) -> Value {
    match expr {
        Expr::Literal(v) => v.clone(),
        Expr::Path(p) => lookup(scope, p).cloned().unwrap_or(Value::Null),
        Expr::Len(p) => Value::from(lookup(scope, p).map_or(0, length)),
        Expr::Not(inner) => Value::Bool(!truthy(&eval(inner, scope))),
        Expr::And(a, b) => Value::Bool(truthy(&eval(a, scope)) && truthy(&eval(b, scope))),
        Expr::Or(a, b) => Value::Bool(truthy(&eval(a, scope)) || truthy(&eval(b, scope))),
        Expr::Compare(o, a, b) => Value::Bool(compare(o, &eval(a, scope), &eval(b, scope))),
    }
}

fn compare(op: &str, left: &Value, right: &Value) -> bool {
    match op {
        "==" => loosely_equal(left, right),
        "!=" => !loosely_equal(left, right),
        "contains" => match left {
            Value::String(s) => right.as_str().is_some_and(|needle| s.contains(needle)),
            Value::Array(items) => items.iter().any(|i| loosely_equal(i, right)),
            Value::Object(map) => right.as_str().is_some_and(|k| map.contains_key(k)),
            _ => false,
        },
        _ => {
            let ordering = match (left.as_f64(), right.as_f64()) {
                (Some(l), Some(r)) => l.partial_cmp(&r),
                _ => match (left.as_str(), right.as_str()) {
                    (Some(l), Some(r)) => Some(l.cmp(r)),
                    _ => None,
                },
            };
            let Some(ordering) = ordering else {
                return false;
            };
            match op {
                ">" => ordering.is_gt(),
                ">=" => ordering.is_ge(),
                "<" => ordering.is_lt(),
                "<=" => ordering.is_le(),
                _ => false,
            }
        }
    }
}

/// Numbers compare by value regardless of integer/float representation.
fn loosely_equal(left: &Value, right: &Value) -> bool {
    match (left.as_f64(), right.as_f64()) {
        (Some(l), Some(r)) => l == r,
        _ => left == right,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn eval_str(src: &str, scope: Value) -> bool {
        Condition::parse(src).unwrap().evaluate(&scope)
    }

    #[test]
    fn comparisons() {
        let scope = json!({"input": {"score": 0.8, "label": "cat"}});
        assert!(eval_str("input.score > 0.5", scope.clone()));
        assert!(eval_str("input.score <= 0.8", scope.clone()));
        assert!(eval_str("input.label == 'cat'", scope.clone()));
        assert!(!eval_str("input.label != \"cat\"", scope));
    }

    #[test]
    fn boolean_connectives_and_precedence() {
        let scope = json!({"a": true, "b": false, "c": true});
        assert!(eval_str("a && !b", scope.clone()));
        assert!(eval_str("b || a && c", scope.clone()));
        assert!(!eval_str("(b || a) && b", scope));
    }

    #[test]
    fn len_and_contains() {
        let scope = json!({"input": {"images": ["a.png", "b.png"], "tags": "portrait,hd"}});
        assert!(eval_str("len(input.images) == 2", scope.clone()));
        assert!(eval_str("input.images contains 'b.png'", scope.clone()));
        assert!(eval_str("input.tags contains 'hd'", scope));
    }

    #[test]
    fn array_index_segments() {
        let scope = json!({"items": [{"ok": false}, {"ok": true}]});
        assert!(eval_str("items.1.ok", scope.clone()));
        assert!(!eval_str("items.0.ok", scope));
    }

    #[test]
    fn missing_path_is_falsy() {
        assert!(!eval_str("input.missing", json!({})));
        assert!(eval_str("input.missing == null", json!({})));
    }

    #[test]
    fn integer_equals_float() {
        assert!(eval_str("n == 3", json!({"n": 3.0})));
    }

    #[test]
    fn parse_errors() {
        assert!(Condition::parse("").is_err());
        assert!(Condition::parse("a ==").is_err());
        assert!(Condition::parse("(a").is_err());
        assert!(Condition::parse("a b").is_err());
        assert!(Condition::parse("a # b").is_err());
    }

    #[test]
    fn deep_nesting_is_rejected() {
        let bangs = format!("{}a", "!".repeat(10_000));
        assert!(matches!(Condition::parse(&bangs), Err(CoreError::Validation(_))));

        let parens = format!("{}a{}", "(".repeat(500), ")".repeat(500));
        assert!(matches!(Condition::parse(&parens), Err(CoreError::Validation(_))));

        let fine = format!("{}a{}", "(".repeat(MAX_NESTING), ")".repeat(MAX_NESTING));
        assert!(eval_str(&fine, json!({"a": true})));
        assert!(eval_str("!!a", json!({"a": true})));
    }
}
