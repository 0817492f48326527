//! Compiled predicates and their evaluation.

use crate::functions::Functions;
use crate::parser::{parse, CompareOp, Expr};
use serde_json::Value;
use std::cmp::Ordering;
use steward_core::{json_type_name, Error, Result};
use tracing::debug;

const LOGGED_SOURCE_CHARS: usize = 80;

fn truncate(source: &str) -> &str {
    match source.char_indices().nth(LOGGED_SOURCE_CHARS) {
        Some((end, _)) => &source[..end],
        None => source,
    }
}

/// A compiled criteria expression.
#[derive(Debug, Clone)]
pub struct Predicate {
    source: String,
    root: Expr,
}

/// Compile an expression string. Malformed input fails with `Error::Compile`.
pub fn compile(expression: &str) -> Result<Predicate> {
    let root = parse(expression).map_err(|e| {
        debug!("Rejected criteria {:?}: {}", truncate(expression), e);
        e
    })?;
    Ok(Predicate {
        source: expression.to_string(),
        root,
    })
}

impl Predicate {
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn expr(&self) -> &Expr {
        &self.root
    }

    /// Evaluate against `document`. Runtime type problems fail with `Error::Eval`.
    pub fn evaluate(&self, document: &Value, functions: &Functions) -> Result<bool> {
        let value = Evaluator { document, functions }.eval(&self.root)?;
        Ok(truthy(&value))
    }
}

struct Evaluator<'a> {
    document: &'a Value,
    functions: &'a Functions,
}

impl Evaluator<'_> {
    fn eval(&self, expr: &Expr) -> Result<Value> {
        match expr {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::List(items) => items
                .iter()
                .map(|item| self.eval(item))
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
            Expr::Path(segments) => Ok(resolve_path(self.document, segments)),
            Expr::Call { name, args } => {
                let function = self
                    .functions
                    .get(name)
                    .ok_or_else(|| Error::eval(format!("unknown function '{}'", name)))?;
                let args = args
                    .iter()
                    .map(|arg| self.eval(arg))
                    .collect::<Result<Vec<_>>>()?;
                (**function)(self.document, &args)
            }
            Expr::Not(inner) => Ok(Value::Bool(!truthy(&self.eval(inner)?))),
            Expr::And(operands) => {
                for operand in operands {
                    if !truthy(&self.eval(operand)?) {
                        return Ok(Value::Bool(false));
                    }
                }
                Ok(Value::Bool(true))
            }
            Expr::Or(operands) => {
                for operand in operands {
                    if truthy(&self.eval(operand)?) {
                        return Ok(Value::Bool(true));
                    }
                }
                Ok(Value::Bool(false))
            }
            Expr::Compare { op, lhs, rhs } => {
                let lhs = self.eval(lhs)?;
                let rhs = self.eval(rhs)?;
                compare(*op, &lhs, &rhs).map(Value::Bool)
            }
        }
    }
}

fn resolve_path(document: &Value, segments: &[String]) -> Value {
    let mut current = document;
    for segment in segments {
        let next = match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        };
        match next {
            Some(value) => current = value,
            None => return Value::Null,
        }
    }
    current.clone()
}

fn compare(op: CompareOp, lhs: &Value, rhs: &Value) -> Result<bool> {
    match op {
        CompareOp::Eq => Ok(loose_eq(lhs, rhs)),
        CompareOp::Ne => Ok(!loose_eq(lhs, rhs)),
        CompareOp::In => contains(rhs, lhs),
        CompareOp::NotIn => contains(rhs, lhs).map(|found| !found),
        CompareOp::Lt => order(lhs, rhs).map(|o| o == Ordering::Less),
        CompareOp::Le => order(lhs, rhs).map(|o| o != Ordering::Greater),
        CompareOp::Gt => order(lhs, rhs).map(|o| o == Ordering::Greater),
        CompareOp::Ge => order(lhs, rhs).map(|o| o != Ordering::Less),
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Equality that treats `3`, `3.0` and `"3"` as the same value.
fn loose_eq(lhs: &Value, rhs: &Value) -> bool {
    match (lhs, rhs) {
        (Value::Number(a), Value::Number(b)) => match (a.as_i64(), b.as_i64()) {
            (Some(a), Some(b)) => a == b,
            _ => a.as_f64() == b.as_f64(),
        },
        (Value::Number(_), Value::String(_)) | (Value::String(_), Value::Number(_)) => {
            match (as_number(lhs), as_number(rhs)) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            }
        }
        _ => lhs == rhs,
    }
}

fn contains(haystack: &Value, needle: &Value) -> Result<bool> {
    match haystack {
        Value::Array(items) => Ok(items.iter().any(|item| loose_eq(item, needle))),
        Value::Object(map) => match needle {
            Value::String(key) => Ok(map.contains_key(key)),
            other => Err(Error::eval(format!(
                "object keys are strings, cannot test {} membership",
                json_type_name(other)
            ))),
        },
        Value::String(s) => match needle {
            Value::String(sub) => Ok(s.contains(sub.as_str())),
            other => Err(Error::eval(format!(
                "cannot test {} membership in a string",
                json_type_name(other)
            ))),
        },
        other => Err(Error::eval(format!(
            "containment test on {}, expected a collection",
            json_type_name(other)
        ))),
    }
}

fn order(lhs: &Value, rhs: &Value) -> Result<Ordering> {
    if let (Value::String(a), Value::String(b)) = (lhs, rhs) {
        return Ok(a.cmp(b));
    }
    match (as_number(lhs), as_number(rhs)) {
        (Some(a), Some(b)) => a
            .partial_cmp(&b)
            .ok_or_else(|| Error::eval("numbers are not comparable")),
        _ => Err(Error::eval(format!(
            "cannot order {} against {}",
            json_type_name(lhs),
            json_type_name(rhs)
        ))),
    }
}

/// Python-style truthiness: null, false, zero, and empty collections are false.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}
