//! Sandboxed `${{ … }}` template evaluation.
//!
//! Two entry points:
//! - [`Evaluator::evaluate_string`] replaces every `${{ expr }}` fragment in
//!   a template with the stringified evaluation; literal text is preserved.
//! - [`Evaluator::evaluate`] returns the native JSON value when the whole
//!   template is a single `${{ expr }}`, and falls back to string behaviour
//!   otherwise.
//!
//! Expressions run in a restricted scope: the only resolvable roots are the
//! context keys (`inputs`, `secrets`, `env`, `steps`, `item`, `index`,
//! `memory`, `workflow`). There are no host globals, banned identifiers and
//! methods are rejected at parse time, and evaluation carries a soft cap so a
//! pathological expression fails with `EvaluationTimeout` instead of wedging
//! the scheduler.

mod parser;

use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use thiserror::Error;

use parser::{BinaryOp, Expr, Segment, UnaryOp};

/// Context roots an expression may reference.
const CONTEXT_ROOTS: &[&str] = &[
    "inputs", "secrets", "env", "steps", "item", "index", "memory", "workflow",
];

/// Soft wall-clock cap on a single evaluation.
const EVAL_TIME_CAP: Duration = Duration::from_secs(1);

/// Operation budget checked alongside the wall clock.
const EVAL_OP_CAP: u64 = 100_000;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors from template parsing or evaluation.
#[derive(Debug, Error)]
pub enum ExprError {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("undefined variable '{0}'")]
    UndefinedVariable(String),

    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    #[error("banned identifier or method '{0}'")]
    Banned(String),

    #[error("expression evaluation exceeded its budget")]
    EvaluationTimeout,
}

// ---------------------------------------------------------------------------
// Evaluator
// ---------------------------------------------------------------------------

/// Template evaluator over a JSON context object.
#[derive(Debug, Clone, Default)]
pub struct Evaluator;

impl Evaluator {
    pub fn new() -> Self {
        Self
    }

    /// Evaluate a template, returning the native value when the whole input
    /// is a single `${{ … }}` fragment.
    pub fn evaluate(&self, template: &str, ctx: &Value) -> Result<Value, ExprError> {
        let trimmed = template.trim();
        if let Some(inner) = single_fragment(trimmed) {
            let mut state = EvalState::new(ctx);
            let expr = parser::parse(inner)?;
            return state.eval(&expr);
        }
        self.evaluate_string(template, ctx)
            .map(Value::String)
    }

    /// Replace every `${{ expr }}` fragment with its stringified evaluation.
    pub fn evaluate_string(&self, template: &str, ctx: &Value) -> Result<String, ExprError> {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(start) = rest.find("${{") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 3..];
            let end = fragment_end(after).ok_or_else(|| {
                ExprError::Parse("unterminated '${{' fragment".to_string())
            })?;
            let inner = &after[..end];

            let mut state = EvalState::new(ctx);
            let expr = parser::parse(inner)?;
            let value = state.eval(&expr)?;
            out.push_str(&stringify(&value));

            rest = &after[end + 2..];
        }
        out.push_str(rest);
        Ok(out)
    }

    /// Evaluate a gate expression to a boolean using JS-like truthiness.
    ///
    /// Accepts both bare expressions and `${{ … }}`-wrapped ones.
    pub fn evaluate_bool(&self, template: &str, ctx: &Value) -> Result<bool, ExprError> {
        let trimmed = template.trim();
        let inner = single_fragment(trimmed).unwrap_or(trimmed);
        let mut state = EvalState::new(ctx);
        let expr = parser::parse(inner)?;
        let value = state.eval(&expr)?;
        Ok(truthy(&value))
    }
}

/// If the whole input is exactly one `${{ … }}` fragment, return its inner
/// expression.
fn single_fragment(input: &str) -> Option<&str> {
    let after = input.strip_prefix("${{")?;
    let end = fragment_end(after)?;
    if after[end + 2..].trim().is_empty() {
        Some(&after[..end])
    } else {
        None
    }
}

/// Find the byte offset of the closing `}}` of a fragment, skipping braces
/// that belong to object constructors and string literals.
fn fragment_end(input: &str) -> Option<usize> {
    let bytes = input.as_bytes();
    let mut depth = 0usize;
    let mut i = 0;
    let mut in_string: Option<u8> = None;

    while i < bytes.len() {
        let b = bytes[i];
        match in_string {
            Some(quote) => {
                if b == b'\\' {
                    i += 1;
                } else if b == quote {
                    in_string = None;
                }
            }
            None => match b {
                b'\'' | b'"' => in_string = Some(b),
                b'{' => depth += 1,
                b'}' => {
                    if depth == 0 {
                        if bytes.get(i + 1) == Some(&b'}') {
                            return Some(i);
                        }
                        return None;
                    }
                    depth -= 1;
                }
                _ => {}
            },
        }
        i += 1;
    }
    None
}

/// Convert a value to its template-substitution string.
fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

/// JS-like truthiness.
fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

// ---------------------------------------------------------------------------
// Evaluation state
// ---------------------------------------------------------------------------

struct EvalState<'a> {
    ctx: &'a Value,
    started: Instant,
    ops: u64,
}

impl<'a> EvalState<'a> {
    fn new(ctx: &'a Value) -> Self {
        Self {
            ctx,
            started: Instant::now(),
            ops: 0,
        }
    }

    fn tick(&mut self) -> Result<(), ExprError> {
        self.ops += 1;
        if self.ops > EVAL_OP_CAP {
            return Err(ExprError::EvaluationTimeout);
        }
        if self.ops % 1024 == 0 && self.started.elapsed() > EVAL_TIME_CAP {
            return Err(ExprError::EvaluationTimeout);
        }
        Ok(())
    }

    fn eval(&mut self, expr: &Expr) -> Result<Value, ExprError> {
        self.tick()?;
        match expr {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Path { root, segments } => self.eval_path(root, segments),
            Expr::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.eval(item)?);
                }
                Ok(Value::Array(out))
            }
            Expr::Object(fields) => {
                let mut map = Map::new();
                for (key, value) in fields {
                    map.insert(key.clone(), self.eval(value)?);
                }
                Ok(Value::Object(map))
            }
            Expr::Unary { op, expr } => {
                let value = self.eval(expr)?;
                match op {
                    UnaryOp::Not => Ok(Value::Bool(!truthy(&value))),
                    UnaryOp::Neg => {
                        let n = as_number(&value).ok_or_else(|| {
                            ExprError::TypeMismatch(format!("cannot negate {value}"))
                        })?;
                        Ok(number(-n))
                    }
                }
            }
            Expr::Binary { op, left, right } => self.eval_binary(*op, left, right),
            Expr::Ternary {
                cond,
                then,
                otherwise,
            } => {
                let cond = self.eval(cond)?;
                if truthy(&cond) {
                    self.eval(then)
                } else {
                    self.eval(otherwise)
                }
            }
        }
    }

    fn eval_path(&mut self, root: &str, segments: &[Segment]) -> Result<Value, ExprError> {
        // An empty root marks a synthetic path: the first segment holds the
        // receiver expression (a parenthesised expression or literal that
        // segments were attached to).
        let (mut current, rest) = if root.is_empty() {
            match segments.first() {
                Some(Segment::Index(receiver)) => (self.eval(receiver)?, &segments[1..]),
                _ => return Err(ExprError::Parse("malformed receiver".to_string())),
            }
        } else {
            if !CONTEXT_ROOTS.contains(&root) {
                return Err(ExprError::UndefinedVariable(root.to_string()));
            }
            let value = self
                .ctx
                .get(root)
                .cloned()
                .ok_or_else(|| ExprError::UndefinedVariable(root.to_string()))?;
            (value, segments)
        };

        for segment in rest {
            self.tick()?;
            current = match segment {
                Segment::Key(key) => member(&current, key),
                Segment::Index(index) => {
                    let index = self.eval(index)?;
                    match (&current, &index) {
                        (Value::Array(items), Value::Number(n)) => {
                            let i = n.as_u64().unwrap_or(u64::MAX) as usize;
                            items.get(i).cloned().unwrap_or(Value::Null)
                        }
                        (_, Value::String(key)) => member(&current, key),
                        _ => {
                            return Err(ExprError::TypeMismatch(format!(
                                "cannot index {current} with {index}"
                            )))
                        }
                    }
                }
                Segment::Call { name, args } => {
                    let mut evaluated = Vec::with_capacity(args.len());
                    for arg in args {
                        evaluated.push(self.eval(arg)?);
                    }
                    call_method(&current, name, &evaluated)?
                }
            };
        }

        Ok(current)
    }

    fn eval_binary(
        &mut self,
        op: BinaryOp,
        left: &Expr,
        right: &Expr,
    ) -> Result<Value, ExprError> {
        // Short-circuit the boolean operators before evaluating the right side.
        match op {
            BinaryOp::And => {
                let l = self.eval(left)?;
                if !truthy(&l) {
                    return Ok(Value::Bool(false));
                }
                let r = self.eval(right)?;
                return Ok(Value::Bool(truthy(&r)));
            }
            BinaryOp::Or => {
                let l = self.eval(left)?;
                if truthy(&l) {
                    return Ok(Value::Bool(true));
                }
                let r = self.eval(right)?;
                return Ok(Value::Bool(truthy(&r)));
            }
            _ => {}
        }

        let l = self.eval(left)?;
        let r = self.eval(right)?;

        match op {
            BinaryOp::Add => match (&l, &r) {
                (Value::String(a), _) => Ok(Value::String(format!("{a}{}", stringify(&r)))),
                (_, Value::String(b)) => Ok(Value::String(format!("{}{b}", stringify(&l)))),
                _ => arithmetic(&l, &r, |a, b| a + b),
            },
            BinaryOp::Sub => arithmetic(&l, &r, |a, b| a - b),
            BinaryOp::Mul => arithmetic(&l, &r, |a, b| a * b),
            BinaryOp::Div => {
                if as_number(&r) == Some(0.0) {
                    return Err(ExprError::TypeMismatch("division by zero".to_string()));
                }
                arithmetic(&l, &r, |a, b| a / b)
            }
            BinaryOp::Rem => {
                if as_number(&r) == Some(0.0) {
                    return Err(ExprError::TypeMismatch("division by zero".to_string()));
                }
                arithmetic(&l, &r, |a, b| a % b)
            }
            BinaryOp::EqLoose => Ok(Value::Bool(loose_eq(&l, &r))),
            BinaryOp::NeLoose => Ok(Value::Bool(!loose_eq(&l, &r))),
            BinaryOp::EqStrict => Ok(Value::Bool(l == r)),
            BinaryOp::NeStrict => Ok(Value::Bool(l != r)),
            BinaryOp::Lt => ordering(&l, &r).map(|o| Value::Bool(o == std::cmp::Ordering::Less)),
            BinaryOp::Le => {
                ordering(&l, &r).map(|o| Value::Bool(o != std::cmp::Ordering::Greater))
            }
            BinaryOp::Gt => {
                ordering(&l, &r).map(|o| Value::Bool(o == std::cmp::Ordering::Greater))
            }
            BinaryOp::Ge => ordering(&l, &r).map(|o| Value::Bool(o != std::cmp::Ordering::Less)),
            BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
        }
    }
}

/// Missing members on objects resolve to null, matching the path semantics
/// expressions rely on for optional step fields.
fn member(value: &Value, key: &str) -> Value {
    value.get(key).cloned().unwrap_or(Value::Null)
}

fn as_number(value: &Value) -> Option<f64> {
    value.as_f64()
}

fn number(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
        Value::Number((n as i64).into())
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

fn arithmetic(l: &Value, r: &Value, f: impl Fn(f64, f64) -> f64) -> Result<Value, ExprError> {
    match (as_number(l), as_number(r)) {
        (Some(a), Some(b)) => Ok(number(f(a, b))),
        _ => Err(ExprError::TypeMismatch(format!(
            "arithmetic on non-numbers: {l} and {r}"
        ))),
    }
}

/// Loose equality: numbers and numeric strings compare by value.
fn loose_eq(l: &Value, r: &Value) -> bool {
    if l == r {
        return true;
    }
    match (l, r) {
        (Value::Number(_), Value::String(s)) | (Value::String(s), Value::Number(_)) => {
            let n = if let Value::Number(n) = l {
                n.as_f64()
            } else if let Value::Number(n) = r {
                n.as_f64()
            } else {
                None
            };
            matches!((s.parse::<f64>().ok(), n), (Some(a), Some(b)) if a == b)
        }
        (Value::Bool(b), Value::Number(n)) | (Value::Number(n), Value::Bool(b)) => {
            n.as_f64() == Some(if *b { 1.0 } else { 0.0 })
        }
        _ => false,
    }
}

fn ordering(l: &Value, r: &Value) -> Result<std::cmp::Ordering, ExprError> {
    match (l, r) {
        (Value::Number(_), Value::Number(_)) => {
            let a = as_number(l).unwrap_or(f64::NAN);
            let b = as_number(r).unwrap_or(f64::NAN);
            a.partial_cmp(&b).ok_or_else(|| {
                ExprError::TypeMismatch("cannot order NaN".to_string())
            })
        }
        (Value::String(a), Value::String(b)) => Ok(a.cmp(b)),
        _ => Err(ExprError::TypeMismatch(format!(
            "cannot order {l} and {r}"
        ))),
    }
}

/// Whitelisted method dispatch.
fn call_method(receiver: &Value, name: &str, args: &[Value]) -> Result<Value, ExprError> {
    let arg_str = |i: usize| -> Option<&str> { args.get(i).and_then(Value::as_str) };

    match (name, receiver) {
        ("trim", Value::String(s)) => Ok(Value::String(s.trim().to_string())),
        ("upper", Value::String(s)) => Ok(Value::String(s.to_uppercase())),
        ("lower", Value::String(s)) => Ok(Value::String(s.to_lowercase())),
        ("length", Value::String(s)) => Ok(Value::Number((s.chars().count() as u64).into())),
        ("length", Value::Array(a)) => Ok(Value::Number((a.len() as u64).into())),
        ("length", Value::Object(o)) => Ok(Value::Number((o.len() as u64).into())),
        ("contains", Value::String(s)) => Ok(Value::Bool(
            arg_str(0).map(|needle| s.contains(needle)).unwrap_or(false),
        )),
        ("contains", Value::Array(items)) => Ok(Value::Bool(
            args.first().map(|needle| items.contains(needle)).unwrap_or(false),
        )),
        ("startsWith", Value::String(s)) => Ok(Value::Bool(
            arg_str(0).map(|p| s.starts_with(p)).unwrap_or(false),
        )),
        ("endsWith", Value::String(s)) => Ok(Value::Bool(
            arg_str(0).map(|p| s.ends_with(p)).unwrap_or(false),
        )),
        ("split", Value::String(s)) => {
            let sep = arg_str(0).unwrap_or(",");
            Ok(Value::Array(
                s.split(sep)
                    .map(|part| Value::String(part.to_string()))
                    .collect(),
            ))
        }
        ("join", Value::Array(items)) => {
            let sep = arg_str(0).unwrap_or(",");
            let joined = items
                .iter()
                .map(stringify)
                .collect::<Vec<_>>()
                .join(sep);
            Ok(Value::String(joined))
        }
        ("first", Value::Array(items)) => Ok(items.first().cloned().unwrap_or(Value::Null)),
        ("last", Value::Array(items)) => Ok(items.last().cloned().unwrap_or(Value::Null)),
        _ => Err(ExprError::TypeMismatch(format!(
            "method '{name}' not applicable to {receiver}"
        ))),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
