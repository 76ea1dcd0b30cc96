//! The built-in expression evaluator.
//!
//! Guards, assignments, log lines, and invoke params share one small
//! expression language over the variable scopes:
//!
//! - `flag` - variable lookup (truthy check when used as a guard)
//! - `order.customer.paid` - nested field access into a JSON value
//! - `status == "active"` - equality (strings, numbers, booleans, null)
//! - `status != "active"` - inequality
//! - `amount > 100` / `>=` / `<` / `<=` - numeric comparison
//! - `!expr` - logical NOT
//! - `expr && expr` - logical AND (higher precedence than OR)
//! - `expr || expr` - logical OR
//! - `(expr)` - grouping
//! - `42`, `-1.5`, `"text"`, `true`, `false`, `null` - literals
//!
//! The first segment of a variable path is resolved through the scope
//! chain; a first segment matching a declared namespace prefix is first
//! rewritten to the name it maps to. The remaining segments dig into the
//! resolved JSON value. An
//! undefined variable reads as `null`, so guards over missing data are
//! simply false rather than errors. Hosts needing a richer language plug
//! their own [`Evaluator`] into the executor.

use crate::env::Evaluator;
use crate::error::ExprError;
use crate::instance::Scope;
use serde_json::Value;

/// A parsed expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Literal value.
    Lit(Value),
    /// Dotted variable path.
    Var(String),
    /// Equality comparison.
    Eq(Box<Expr>, Box<Expr>),
    /// Inequality comparison.
    Ne(Box<Expr>, Box<Expr>),
    /// Greater than.
    Gt(Box<Expr>, Box<Expr>),
    /// Greater or equal.
    Ge(Box<Expr>, Box<Expr>),
    /// Less than.
    Lt(Box<Expr>, Box<Expr>),
    /// Less or equal.
    Le(Box<Expr>, Box<Expr>),
    /// Logical AND.
    And(Box<Expr>, Box<Expr>),
    /// Logical OR.
    Or(Box<Expr>, Box<Expr>),
    /// Logical NOT.
    Not(Box<Expr>),
}

impl Expr {
    /// Parses an expression from a string.
    pub fn parse(s: &str) -> Result<Self, ExprError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ExprError::Parse {
                reason: "empty expression".to_string(),
            });
        }
        let mut parser = Parser::new(s);
        let expr = parser.parse_expr()?;
        parser.skip_whitespace();
        if parser.pos != s.len() {
            return Err(ExprError::Parse {
                reason: format!("unexpected trailing input at offset {}", parser.pos),
            });
        }
        Ok(expr)
    }

    /// Evaluates against a scope chain.
    pub fn evaluate(&self, scope: &Scope<'_>) -> Value {
        match self {
            Expr::Lit(value) => value.clone(),
            Expr::Var(path) => lookup(scope, path),
            Expr::Eq(l, r) => Value::Bool(values_equal(&l.evaluate(scope), &r.evaluate(scope))),
            Expr::Ne(l, r) => Value::Bool(!values_equal(&l.evaluate(scope), &r.evaluate(scope))),
            Expr::Gt(l, r) => compare(scope, l, r, |a, b| a > b),
            Expr::Ge(l, r) => compare(scope, l, r, |a, b| a >= b),
            Expr::Lt(l, r) => compare(scope, l, r, |a, b| a < b),
            Expr::Le(l, r) => compare(scope, l, r, |a, b| a <= b),
            Expr::And(l, r) => {
                Value::Bool(is_truthy(&l.evaluate(scope)) && is_truthy(&r.evaluate(scope)))
            }
            Expr::Or(l, r) => {
                Value::Bool(is_truthy(&l.evaluate(scope)) || is_truthy(&r.evaluate(scope)))
            }
            Expr::Not(inner) => Value::Bool(!is_truthy(&inner.evaluate(scope))),
        }
    }
}

fn compare(scope: &Scope<'_>, l: &Expr, r: &Expr, op: impl Fn(f64, f64) -> bool) -> Value {
    let result = as_f64(&l.evaluate(scope))
        .zip(as_f64(&r.evaluate(scope)))
        .map(|(a, b)| op(a, b))
        .unwrap_or(false);
    Value::Bool(result)
}

fn lookup(scope: &Scope<'_>, path: &str) -> Value {
    let mut parts = path.split('.');
    let head = parts.next().unwrap_or_default();
    let head = match scope.namespaces().get(head) {
        Some(mapped) => mapped.as_str(),
        None => head,
    };
    let mut current = match scope.get(head) {
        Some(value) => value,
        None => return Value::Null,
    };
    for part in parts {
        match current {
            Value::Object(map) => {
                current = map.get(part).unwrap_or(&Value::Null);
            }
            _ => return Value::Null,
        }
    }
    current.clone()
}

pub(crate) fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Number(a), Value::Number(b)) => a
            .as_f64()
            .zip(b.as_f64())
            .map(|(a, b)| (a - b).abs() < f64::EPSILON)
            .unwrap_or(false),
        (Value::String(a), Value::String(b)) => a == b,
        _ => false,
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

/// Simple recursive descent parser.
struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn parse_expr(&mut self) -> Result<Expr, ExprError> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_and()?;
        self.skip_whitespace();

        while self.peek_str("||") {
            self.pos += 2;
            self.skip_whitespace();
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
            self.skip_whitespace();
        }

        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_unary()?;
        self.skip_whitespace();

        while self.peek_str("&&") {
            self.pos += 2;
            self.skip_whitespace();
            let right = self.parse_unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
            self.skip_whitespace();
        }

        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ExprError> {
        self.skip_whitespace();

        if self.peek_char() == Some('!') && !self.peek_str("!=") {
            self.pos += 1;
            self.skip_whitespace();
            let inner = self.parse_unary()?; // recursive to allow !!a
            return Ok(Expr::Not(Box::new(inner)));
        }

        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, ExprError> {
        let left = self.parse_primary()?;
        self.skip_whitespace();

        macro_rules! binary {
            ($op:literal, $variant:ident) => {
                if self.peek_str($op) {
                    self.pos += $op.len();
                    self.skip_whitespace();
                    let right = self.parse_primary()?;
                    return Ok(Expr::$variant(Box::new(left), Box::new(right)));
                }
            };
        }
        binary!("==", Eq);
        binary!("!=", Ne);
        binary!(">=", Ge);
        binary!("<=", Le);
        binary!(">", Gt);
        binary!("<", Lt);

        // no operator, bare operand (truthy when used as a guard)
        Ok(left)
    }

    /// A comparison operand: a parenthesized sub-expression or a plain
    /// operand.
    fn parse_primary(&mut self) -> Result<Expr, ExprError> {
        self.skip_whitespace();
        if self.peek_char() == Some('(') {
            self.pos += 1;
            let expr = self.parse_expr()?;
            self.skip_whitespace();
            if self.peek_char() != Some(')') {
                return Err(ExprError::Parse {
                    reason: "expected ')'".to_string(),
                });
            }
            self.pos += 1;
            return Ok(expr);
        }
        self.parse_operand()
    }

    fn parse_operand(&mut self) -> Result<Expr, ExprError> {
        self.skip_whitespace();
        let rest = &self.input[self.pos..];

        if rest.starts_with('"') {
            return self.parse_string_literal();
        }
        if rest
            .chars()
            .next()
            .map(|c| c.is_ascii_digit() || c == '-')
            .unwrap_or(false)
        {
            let num = self.parse_number()?;
            let num = serde_json::Number::from_f64(num).ok_or_else(|| ExprError::Parse {
                reason: "number out of range".to_string(),
            })?;
            return Ok(Expr::Lit(Value::Number(num)));
        }

        let path = self.parse_path()?;
        match path.as_str() {
            "true" => Ok(Expr::Lit(Value::Bool(true))),
            "false" => Ok(Expr::Lit(Value::Bool(false))),
            "null" => Ok(Expr::Lit(Value::Null)),
            _ => Ok(Expr::Var(path)),
        }
    }

    fn parse_path(&mut self) -> Result<String, ExprError> {
        let start = self.pos;
        while let Some(c) = self.peek_char() {
            if c.is_alphanumeric() || c == '_' || c == '.' {
                self.pos += 1;
            } else {
                break;
            }
        }
        let path = &self.input[start..self.pos];
        if path.is_empty() || path.starts_with('.') || path.ends_with('.') {
            return Err(ExprError::Parse {
                reason: format!("invalid variable path at offset {}", start),
            });
        }
        Ok(path.to_string())
    }

    fn parse_string_literal(&mut self) -> Result<Expr, ExprError> {
        self.pos += 1; // opening quote

        let start = self.pos;
        while let Some(c) = self.peek_char() {
            if c == '"' {
                let s = &self.input[start..self.pos];
                self.pos += 1;
                return Ok(Expr::Lit(Value::String(s.to_string())));
            }
            if c == '\\' {
                self.pos += 2; // skip escape sequence
            } else {
                self.pos += c.len_utf8();
            }
        }

        Err(ExprError::Parse {
            reason: "unterminated string".to_string(),
        })
    }

    fn parse_number(&mut self) -> Result<f64, ExprError> {
        let start = self.pos;

        if self.peek_char() == Some('-') {
            self.pos += 1;
        }
        while let Some(c) = self.peek_char() {
            if c.is_ascii_digit() {
                self.pos += 1;
            } else {
                break;
            }
        }
        if self.peek_char() == Some('.') {
            self.pos += 1;
            while let Some(c) = self.peek_char() {
                if c.is_ascii_digit() {
                    self.pos += 1;
                } else {
                    break;
                }
            }
        }

        let num_str = &self.input[start..self.pos];
        num_str.parse::<f64>().map_err(|_| ExprError::Parse {
            reason: format!("invalid number: '{}'", num_str),
        })
    }

    fn skip_whitespace(&mut self) {
        while let Some(c) = self.peek_char() {
            if c.is_whitespace() {
                self.pos += 1;
            } else {
                break;
            }
        }
    }

    fn peek_char(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn peek_str(&self, s: &str) -> bool {
        self.input[self.pos..].starts_with(s)
    }
}

/// Default [`Evaluator`] backed by the expression language above.
///
/// Parses on every call; machines with hot guards can wrap this in a
/// memoizing evaluator if profiling ever warrants it.
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinEvaluator;

impl Evaluator for BuiltinEvaluator {
    fn eval(&self, scope: &Scope<'_>, expr: &str) -> Result<Value, ExprError> {
        Ok(Expr::parse(expr)?.evaluate(scope))
    }

    fn eval_cond(&self, scope: &Scope<'_>, expr: &str) -> Result<bool, ExprError> {
        Ok(is_truthy(&self.eval(scope, expr)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::{Scope, Scopes};
    use crate::model::Model;
    use serde_json::json;

    fn eval_with(vars: Value, expr: &str) -> Value {
        let model = Model::from_json(&json!({"states": [{"id": "s"}]})).unwrap();
        let mut scopes = Scopes::default();
        if let Value::Object(map) = vars {
            for (k, v) in map {
                scopes.set_local(None, k, v);
            }
        }
        let scope = Scope::new(&model, &scopes, model.node_by_id("s"));
        BuiltinEvaluator.eval(&scope, expr).unwrap()
    }

    fn cond(vars: Value, expr: &str) -> bool {
        is_truthy(&eval_with(vars, expr))
    }

    #[test]
    fn test_truthy_check() {
        assert!(cond(json!({"enabled": true}), "enabled"));
        assert!(!cond(json!({"enabled": false}), "enabled"));
        assert!(!cond(json!({"enabled": null}), "enabled"));
        assert!(!cond(json!({}), "enabled"));
    }

    #[test]
    fn test_equality() {
        assert!(cond(json!({"status": "active"}), "status == \"active\""));
        assert!(!cond(json!({"status": "inactive"}), "status == \"active\""));
        assert!(cond(json!({"status": "active"}), "status != \"inactive\""));
        assert!(cond(json!({"count": 42}), "count == 42"));
        assert!(cond(json!({"value": null}), "value == null"));
        assert!(cond(json!({"flag": false}), "flag == false"));
    }

    #[test]
    fn test_numeric_comparison() {
        assert!(cond(json!({"amount": 150}), "amount > 100"));
        assert!(!cond(json!({"amount": 100}), "amount > 100"));
        assert!(cond(json!({"amount": 100}), "amount >= 100"));
        assert!(cond(json!({"count": 5}), "count < 10"));
        assert!(cond(json!({"count": 10}), "count <= 10"));
        assert!(cond(json!({"temp": 5}), "temp > -10"));
        assert!(cond(json!({"rate": 0.5}), "rate >= 0.5"));
        // non-numeric operands fail the comparison, not the evaluation
        assert!(!cond(json!({"value": "nan"}), "value > 10"));
    }

    #[test]
    fn test_variable_to_variable_comparison() {
        assert!(cond(json!({"a": 3, "b": 2}), "a > b"));
        assert!(cond(json!({"a": "x", "b": "x"}), "a == b"));
    }

    #[test]
    fn test_logical_operators() {
        assert!(cond(json!({"a": true, "b": true}), "a && b"));
        assert!(!cond(json!({"a": true, "b": false}), "a && b"));
        assert!(cond(json!({"a": false, "b": true}), "a || b"));
        assert!(cond(json!({"disabled": false}), "!disabled"));
        assert!(cond(json!({"a": true}), "!!a"));
        // && binds tighter than ||
        assert!(cond(json!({"a": false, "b": false, "c": true}), "a && b || c"));
    }

    #[test]
    fn test_grouping() {
        assert!(!cond(
            json!({"a": false, "b": true, "c": false}),
            "(a || b) && c"
        ));
        assert!(cond(json!({"a": true, "b": false}), "!(a && b)"));
    }

    #[test]
    fn test_nested_field_access() {
        assert!(cond(
            json!({"order": {"customer": {"verified": true}}}),
            "order.customer.verified"
        ));
        assert!(!cond(json!({"order": {}}), "order.customer.verified"));
    }

    #[test]
    fn test_eval_returns_values() {
        assert_eq!(eval_with(json!({"n": 7}), "n"), json!(7));
        assert_eq!(eval_with(json!({}), "\"hello\""), json!("hello"));
        assert_eq!(eval_with(json!({}), "42"), json!(42.0));
        assert_eq!(eval_with(json!({}), "missing"), Value::Null);
        assert_eq!(eval_with(json!({"n": 7}), "n > 3"), json!(true));
    }

    #[test]
    fn test_parenthesized_comparison_operands() {
        assert!(cond(json!({"a": 1}), "(a) == 1"));
        assert!(cond(json!({"a": 2}), "1 < (a)"));
        assert!(cond(json!({"a": true, "b": false}), "(a || b) == true"));
    }

    #[test]
    fn test_namespace_prefix_aliases_variable() {
        let model = Model::from_json(&json!({
            "namespaces": {"ns": "config"},
            "states": [{"id": "s"}]
        }))
        .unwrap();
        let mut scopes = Scopes::default();
        scopes.set_local(None, "config", json!({"mode": "auto"}));
        let scope = Scope::new(&model, &scopes, model.node_by_id("s"));

        assert_eq!(
            BuiltinEvaluator.eval(&scope, "ns.mode").unwrap(),
            json!("auto")
        );
        assert!(BuiltinEvaluator
            .eval_cond(&scope, "ns.mode == \"auto\"")
            .unwrap());
    }

    #[test]
    fn test_not_equal_is_not_negation() {
        // "!=" must not be parsed as "!" followed by "=..."
        assert!(cond(json!({"a": 1, "b": 2}), "a != b"));
    }

    #[test]
    fn test_parse_errors() {
        assert!(Expr::parse("").is_err());
        assert!(Expr::parse("   ").is_err());
        assert!(Expr::parse("(a && b").is_err());
        assert!(Expr::parse("name == \"unclosed").is_err());
        assert!(Expr::parse("a == ==").is_err());
        assert!(Expr::parse("a.b. == 1").is_err());
        assert!(Expr::parse("a ~ b").is_err());
    }
}
