// mqtt2prom - Telemetry to Prometheus metric transformation
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Expression environment for value and label derivation.
//!
//! Expressions are written in CEL and compiled once per state identity. Each
//! evaluation builds a fresh context from an [`Env`], so nothing leaks from
//! one evaluation into the next except what the state store records.
//!
//! | name | meaning |
//! |---|---|
//! | `raw_value` | untouched input value |
//! | `value` | numeric value computed so far |
//! | `last_value` | `value` of the previous evaluation |
//! | `last_raw_value` | `raw_value` of the previous evaluation |
//! | `last_result` | previous result (number for values, text for labels) |
//! | `elapsed` | duration since the previous evaluation, zero if none |
//! | `now()` | current time |
//! | `int(x)`, `float(x)` | coercion from numbers, text or durations |
//! | `round`, `ceil`, `floor`, `abs`, `min`, `max` | numeric helpers |

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use cel_interpreter::extractors::Arguments;
use cel_interpreter::objects::{Key, Map};
use cel_interpreter::{Context, ExecutionError, Program, Value};
use chrono::Utc;
use serde_json::Value as JsonValue;

use crate::error::ExprError;

pub const RAW_VALUE: &str = "raw_value";
pub const VALUE: &str = "value";
pub const LAST_VALUE: &str = "last_value";
pub const LAST_RAW_VALUE: &str = "last_raw_value";
pub const LAST_RESULT: &str = "last_result";
pub const ELAPSED: &str = "elapsed";

/// Previous result exposed as `last_result`.
#[derive(Debug, Clone, PartialEq)]
pub enum LastResult<'a> {
    Number(f64),
    Text(&'a str),
}

/// Variable bindings for one evaluation.
#[derive(Debug, Clone)]
pub struct Env<'a> {
    pub raw_value: &'a JsonValue,
    pub value: f64,
    pub last_value: f64,
    pub last_raw_value: &'a JsonValue,
    pub last_result: LastResult<'a>,
    pub elapsed: chrono::Duration,
}

impl<'a> Env<'a> {
    /// Bindings for a first evaluation: nothing happened before.
    pub fn first(raw_value: &'a JsonValue, value: f64) -> Self {
        Self {
            raw_value,
            value,
            last_value: 0.0,
            last_raw_value: &JsonValue::Null,
            last_result: LastResult::Number(0.0),
            elapsed: chrono::Duration::zero(),
        }
    }
}

/// A compiled expression.
pub struct Expression {
    source: String,
    program: Program,
}

impl fmt::Debug for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Expression").field(&self.source).finish()
    }
}

impl Expression {
    /// Compile an expression. Syntax errors surface here, never at evaluation.
    pub fn compile(source: &str) -> Result<Self, ExprError> {
        let program = Program::compile(source).map_err(|e| ExprError::Compile {
            expression: source.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            source: source.to_string(),
            program,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Run the program against `env`.
    pub fn evaluate(&self, env: &Env<'_>) -> Result<Value, ExprError> {
        let context = build_context(env);
        self.program
            .execute(&context)
            .map_err(|e| ExprError::Evaluate {
                expression: self.source.clone(),
                reason: e.to_string(),
            })
    }

    /// Run the program and require a numeric result.
    pub fn evaluate_number(&self, env: &Env<'_>) -> Result<f64, ExprError> {
        let result = self.evaluate(env)?;
        as_number(&result).ok_or_else(|| ExprError::NotNumeric {
            expression: self.source.clone(),
            found: to_text(&result),
        })
    }

    /// Run the program and render any result as text.
    pub fn evaluate_text(&self, env: &Env<'_>) -> Result<String, ExprError> {
        self.evaluate(env).map(|result| to_text(&result))
    }
}

fn build_context(env: &Env<'_>) -> Context<'static> {
    let mut context = Context::default();

    context.add_variable_from_value(RAW_VALUE, from_json(env.raw_value));
    context.add_variable_from_value(VALUE, Value::Float(env.value));
    context.add_variable_from_value(LAST_VALUE, Value::Float(env.last_value));
    context.add_variable_from_value(LAST_RAW_VALUE, from_json(env.last_raw_value));
    context.add_variable_from_value(
        LAST_RESULT,
        match env.last_result {
            LastResult::Number(n) => Value::Float(n),
            LastResult::Text(text) => Value::String(Arc::new(text.to_string())),
        },
    );
    context.add_variable_from_value(ELAPSED, Value::Duration(env.elapsed));

    context.add_function("now", now);
    context.add_function("int", int);
    context.add_function("float", float);
    context.add_function("round", |args: Arguments| unary("round", args, f64::round));
    context.add_function("ceil", |args: Arguments| unary("ceil", args, f64::ceil));
    context.add_function("floor", |args: Arguments| unary("floor", args, f64::floor));
    context.add_function("abs", |args: Arguments| unary("abs", args, f64::abs));
    context.add_function("min", |args: Arguments| fold("min", args, f64::min));
    context.add_function("max", |args: Arguments| fold("max", args, f64::max));

    context
}

/// Convert an inbound JSON value. Numbers always become floats.
pub fn from_json(value: &JsonValue) -> Value {
    match value {
        JsonValue::Null => Value::Null,
        JsonValue::Bool(b) => Value::Bool(*b),
        JsonValue::Number(n) => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
        JsonValue::String(s) => Value::String(Arc::new(s.clone())),
        JsonValue::Array(items) => Value::List(Arc::new(items.iter().map(from_json).collect())),
        JsonValue::Object(fields) => {
            let entries: HashMap<Arc<String>, Value> = fields
                .iter()
                .map(|(k, v)| (Arc::new(k.clone()), from_json(v)))
                .collect();
            Value::Map(Map::from(entries))
        }
    }
}

/// Numeric view of a result, if it has one.
pub fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Float(f) => Some(*f),
        Value::Int(i) => Some(*i as f64),
        Value::UInt(u) => Some(*u as f64),
        _ => None,
    }
}

/// Canonical text for a result.
pub fn to_text(value: &Value) -> String {
    match value {
        Value::Null => "<nil>".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Int(i) => i.to_string(),
        Value::UInt(u) => u.to_string(),
        Value::Float(f) => f.to_string(),
        Value::String(s) => s.to_string(),
        Value::Bytes(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        Value::Duration(d) => format_seconds(*d),
        Value::Timestamp(ts) => ts.to_rfc3339(),
        Value::List(items) => {
            let parts: Vec<String> = items.iter().map(to_text).collect();
            format!("[{}]", parts.join(" "))
        }
        Value::Map(map) => {
            let mut parts: Vec<String> = map
                .map
                .iter()
                .map(|(k, v)| format!("{}:{}", key_text(k), to_text(v)))
                .collect();
            parts.sort();
            format!("map[{}]", parts.join(" "))
        }
        other => format!("{:?}", other),
    }
}

fn key_text(key: &Key) -> String {
    match key {
        Key::Int(i) => i.to_string(),
        Key::Uint(u) => u.to_string(),
        Key::Bool(b) => b.to_string(),
        Key::String(s) => s.to_string(),
    }
}

fn format_seconds(duration: chrono::Duration) -> String {
    let nanos = duration.num_nanoseconds().unwrap_or(i64::MAX);
    format!("{}s", nanos as f64 / 1e9)
}

fn duration_nanos(duration: &chrono::Duration) -> i64 {
    duration.num_nanoseconds().unwrap_or(i64::MAX)
}

fn single<'a>(name: &str, args: &'a Arguments) -> Result<&'a Value, ExecutionError> {
    match args.0.as_slice() {
        [value] => Ok(value),
        other => Err(ExecutionError::function_error(
            name,
            format!("expected 1 argument, got {}", other.len()),
        )),
    }
}

fn numeric(name: &str, value: &Value) -> Result<f64, ExecutionError> {
    as_number(value).ok_or_else(|| {
        ExecutionError::function_error(name, format!("expected a number, got {}", to_text(value)))
    })
}

fn now(_args: Arguments) -> Result<Value, ExecutionError> {
    Ok(Value::Timestamp(Utc::now().fixed_offset()))
}

fn float(args: Arguments) -> Result<Value, ExecutionError> {
    let converted = match single("float", &args)? {
        Value::Float(f) => *f,
        Value::Int(i) => *i as f64,
        Value::UInt(u) => *u as f64,
        Value::Duration(d) => duration_nanos(d) as f64,
        Value::String(s) => s.parse::<f64>().map_err(|e| {
            ExecutionError::function_error("float", format!("cannot parse {:?}: {}", s, e))
        })?,
        other => {
            return Err(ExecutionError::function_error(
                "float",
                format!("cannot convert {}", to_text(other)),
            ))
        }
    };
    Ok(Value::Float(converted))
}

fn int(args: Arguments) -> Result<Value, ExecutionError> {
    let converted = match single("int", &args)? {
        Value::Float(f) => *f as i64,
        Value::Int(i) => *i,
        Value::UInt(u) => *u as i64,
        Value::Duration(d) => duration_nanos(d),
        Value::String(s) => s.parse::<i64>().map_err(|e| {
            ExecutionError::function_error("int", format!("cannot parse {:?}: {}", s, e))
        })?,
        other => {
            return Err(ExecutionError::function_error(
                "int",
                format!("cannot convert {}", to_text(other)),
            ))
        }
    };
    Ok(Value::Int(converted))
}

fn unary(name: &str, args: Arguments, op: fn(f64) -> f64) -> Result<Value, ExecutionError> {
    let x = numeric(name, single(name, &args)?)?;
    Ok(Value::Float(op(x)))
}

fn fold(name: &str, args: Arguments, op: fn(f64, f64) -> f64) -> Result<Value, ExecutionError> {
    let mut values = args.0.iter();
    let first = values
        .next()
        .ok_or_else(|| ExecutionError::function_error(name, "expected at least 1 argument"))?;
    let mut acc = numeric(name, first)?;
    for value in values {
        acc = op(acc, numeric(name, value)?);
    }
    Ok(Value::Float(acc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use serde_json::json;

    fn eval_number(source: &str, raw: &JsonValue, value: f64) -> Result<f64, ExprError> {
        Expression::compile(source)?.evaluate_number(&Env::first(raw, value))
    }

    #[test]
    fn test_index_into_raw_list() {
        let raw = json!([1.0, 2.0, 3.0]);
        assert_relative_eq!(eval_number("float(raw_value[0])", &raw, 0.0).unwrap(), 1.0);
        assert_relative_eq!(eval_number("raw_value[2]", &raw, 0.0).unwrap(), 3.0);
    }

    #[test]
    fn test_field_of_raw_object() {
        let raw = json!({"temp": 21.5, "unit": "C"});
        assert_relative_eq!(eval_number("raw_value.temp", &raw, 0.0).unwrap(), 21.5);
    }

    #[test]
    fn test_value_arithmetic() {
        let raw = json!(10.0);
        assert_relative_eq!(eval_number("value * 2.0 + 1.0", &raw, 10.0).unwrap(), 21.0);
    }

    #[test]
    fn test_coercions() {
        let raw = json!("42.5");
        assert_relative_eq!(eval_number("float(raw_value)", &raw, 0.0).unwrap(), 42.5);
        assert_relative_eq!(eval_number("int(\"17\")", &raw, 0.0).unwrap(), 17.0);
        assert_relative_eq!(eval_number("int(3.9)", &raw, 0.0).unwrap(), 3.0);
        assert!(matches!(
            eval_number("float(\"abc\")", &raw, 0.0),
            Err(ExprError::Evaluate { .. })
        ));
        assert!(eval_number("float(\" 3.5 \")", &raw, 0.0).is_err());
        assert!(eval_number("int(\" 17\")", &raw, 0.0).is_err());
    }

    #[test]
    fn test_numeric_functions() {
        let raw = JsonValue::Null;
        assert_relative_eq!(eval_number("round(2.5)", &raw, 0.0).unwrap(), 3.0);
        assert_relative_eq!(eval_number("ceil(2.1)", &raw, 0.0).unwrap(), 3.0);
        assert_relative_eq!(eval_number("floor(2.9)", &raw, 0.0).unwrap(), 2.0);
        assert_relative_eq!(eval_number("abs(-4.0)", &raw, 0.0).unwrap(), 4.0);
        assert_relative_eq!(eval_number("min(value, 5.0)", &raw, 7.0).unwrap(), 5.0);
        assert_relative_eq!(eval_number("max(value, 5.0)", &raw, 7.0).unwrap(), 7.0);
    }

    #[test]
    fn test_compile_error() {
        let err = Expression::compile("(value * ").unwrap_err();
        assert!(matches!(err, ExprError::Compile { .. }));
    }

    #[test]
    fn test_non_numeric_result() {
        let raw = json!("on");
        assert!(matches!(
            eval_number("raw_value", &raw, 0.0),
            Err(ExprError::NotNumeric { .. })
        ));
    }

    #[test]
    fn test_text_results() {
        let raw = json!("kitchen");
        let expr = Expression::compile("raw_value").unwrap();
        assert_eq!(expr.evaluate_text(&Env::first(&raw, 0.0)).unwrap(), "kitchen");

        let expr = Expression::compile("value > 1.0").unwrap();
        assert_eq!(expr.evaluate_text(&Env::first(&raw, 2.0)).unwrap(), "true");

        let expr = Expression::compile("value").unwrap();
        assert_eq!(expr.evaluate_text(&Env::first(&raw, 3.0)).unwrap(), "3");
    }

    #[test]
    fn test_last_result_binding() {
        let raw = JsonValue::Null;
        let env = Env {
            last_result: LastResult::Text("previous"),
            ..Env::first(&raw, 0.0)
        };
        let expr = Expression::compile("last_result + \"!\"").unwrap();
        assert_eq!(expr.evaluate_text(&env).unwrap(), "previous!");
    }

    #[test]
    fn test_elapsed_binding() {
        let raw = JsonValue::Null;
        let env = Env {
            elapsed: chrono::Duration::milliseconds(1500),
            ..Env::first(&raw, 0.0)
        };
        let expr = Expression::compile("float(elapsed) / 1000000000.0").unwrap();
        assert_relative_eq!(expr.evaluate_number(&env).unwrap(), 1.5);

        let expr = Expression::compile("elapsed").unwrap();
        assert_eq!(expr.evaluate_text(&env).unwrap(), "1.5s");
    }
}
