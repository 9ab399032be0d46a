//! Tag value rules.

use serde_json::Value;

/// Returns `true` if `value` counts as a value.
///
/// `null`, the empty string and the empty array are "no value".
#[must_use]
pub fn has_value(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Number(n) => n.as_f64().is_none_or(|f| !f.is_nan()),
        Value::Bool(_) | Value::Object(_) => true,
    }
}

/// [`has_value`] for an optional (absent) value.
#[must_use]
pub fn has_some_value(value: Option<&Value>) -> bool {
    value.is_some_and(has_value)
}

/// Combine an update with the existing value: objects are shallow-merged,
/// anything else is replaced.
#[must_use]
pub fn merge_update(old: Option<&Value>, new: &Value) -> Value {
    match (old, new) {
        (Some(Value::Object(old)), Value::Object(new)) => {
            let mut merged = old.clone();
            for (key, value) in new {
                merged.insert(key.clone(), value.clone());
            }
            Value::Object(merged)
        }
        _ => new.clone(),
    }
}

/// Returns `true` if replacing `old` with `new` would not change the tag.
#[must_use]
pub fn same_value(old: Option<&Value>, new: &Value) -> bool {
    if !has_some_value(old) && !has_value(new) {
        return true;
    }
    old == Some(new)
}

/// Text a value is edited through. Strings are themselves, no-value is
/// empty, and everything else is its JSON rendering.
#[must_use]
pub fn text_form(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
