//! Formula values and the evaluator interface.
//!
//! A formula is a string tag value starting with `=`. Everything after the
//! `=` is handed to a [`FormulaEvaluator`] together with a
//! [`CalculationContext`]; the evaluator never sees the weave.
//!
//! Non-formula values go through [`coerce_literal`] instead, and evaluation
//! failures become an error marker (`{"$error": "<message>"}`) for that tag
//! only.

pub mod expr;
pub mod lexer;

use serde_json::{Map, Value};
use weave_core::ErrorCode;

use crate::precalc::CalculationContext;

pub use expr::ExprEvaluator;

/// Key of the error marker object.
pub const ERROR_KEY: &str = "$error";

/// Why a formula produced no value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FormulaError {
    #[error("parse error at {offset}: {message}")]
    Parse { offset: usize, message: String },

    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    #[error("unknown identifier '{0}'")]
    UnknownIdentifier(String),

    #[error("type error: {0}")]
    Type(String),

    #[error("division by zero")]
    DivisionByZero,

    /// The formula (indirectly) reads itself.
    #[error("circular reference through {bot}.{tag}")]
    Cycle { bot: String, tag: String },

    #[error("formula nesting exceeds {limit}")]
    DepthExceeded { limit: usize },
}

impl FormulaError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        ErrorCode::FormulaFailed
    }

    /// The marker value stored in place of the tag's result.
    #[must_use]
    pub fn marker(&self) -> Value {
        error_marker(&self.to_string())
    }
}

/// Evaluates formula source text. Implementations must be pure: the same
/// source and context give the same value.
pub trait FormulaEvaluator {
    /// Evaluate `source` (without the leading `=`) for `bot.tag`.
    ///
    /// # Errors
    ///
    /// Any [`FormulaError`]; the caller turns it into an error marker.
    fn evaluate(
        &self,
        source: &str,
        bot: &str,
        tag: &str,
        context: &mut CalculationContext<'_>,
    ) -> Result<Value, FormulaError>;
}

/// Formula source of a tag value, without the `=`.
#[must_use]
pub fn formula_source(value: &Value) -> Option<&str> {
    value.as_str()?.strip_prefix('=')
}

#[must_use]
pub fn is_formula(value: &Value) -> bool {
    formula_source(value).is_some()
}

#[must_use]
pub fn error_marker(message: &str) -> Value {
    let mut map = Map::new();
    map.insert(ERROR_KEY.to_string(), Value::String(message.to_string()));
    Value::Object(map)
}

#[must_use]
pub fn is_error_marker(value: &Value) -> bool {
    value.as_object().is_some_and(|map| map.contains_key(ERROR_KEY))
}

/// Precalculated form of a non-formula value: numeric strings become
/// numbers and `"true"`/`"false"` become booleans.
#[must_use]
pub fn coerce_literal(value: &Value) -> Value {
    let Value::String(text) = value else {
        return value.clone();
    };
    match text.as_str() {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        _ => {}
    }
    if looks_numeric(text) {
        if let Ok(n) = text.parse::<f64>() {
            return number(n);
        }
    }
    value.clone()
}

fn looks_numeric(text: &str) -> bool {
    let body = text.strip_prefix('-').unwrap_or(text);
    body.starts_with(|c: char| c.is_ascii_digit() || c == '.')
        && body
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '.' | 'e' | 'E' | '+' | '-'))
}

/// JSON number for `n`; integral values become integers. Non-finite values
/// become `null`.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::float_cmp)]
pub fn number(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < 9.0e15 {
        return Value::from(n as i64);
    }
    serde_json::Number::from_f64(n).map_or(Value::Null, Value::Number)
}
