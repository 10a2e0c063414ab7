//! Comparison evaluation for Condition steps and stored segments.
//!
//! The operator set is closed (no expression language). String comparisons
//! are case-insensitive and trimmed. Numeric comparisons coerce both sides
//! with a best-effort parse; a side that fails to parse makes the predicate
//! false rather than erroring.

use serde_json::Value;

use dripline_types::flow::CompareOp;

/// Evaluate `actual <op> expected`.
///
/// `actual` is `None` when the source field/path does not exist; only
/// `Exists`/`NotExists` (and the negated operators, by plain negation) can
/// be true in that case.
pub fn compare(op: CompareOp, actual: Option<&Value>, expected: &Value) -> bool {
    match op {
        CompareOp::Exists => exists(actual),
        CompareOp::NotExists => !exists(actual),
        CompareOp::Equals => actual.is_some_and(|a| loose_eq(a, expected)),
        CompareOp::NotEquals => !actual.is_some_and(|a| loose_eq(a, expected)),
        CompareOp::Contains => actual.is_some_and(|a| contains(a, expected)),
        CompareOp::NotContains => !actual.is_some_and(|a| contains(a, expected)),
        CompareOp::GreaterThan => numeric_cmp(actual, expected).is_some_and(|ord| ord.is_gt()),
        CompareOp::LessThan => numeric_cmp(actual, expected).is_some_and(|ord| ord.is_lt()),
        CompareOp::In => actual.is_some_and(|a| member_of(a, expected)),
        CompareOp::NotIn => !actual.is_some_and(|a| member_of(a, expected)),
    }
}

fn exists(actual: Option<&Value>) -> bool {
    matches!(actual, Some(v) if !v.is_null())
}

/// Equality with string normalization and numeric coercion.
fn loose_eq(a: &Value, b: &Value) -> bool {
    if let (Some(x), Some(y)) = (as_number(a), as_number(b)) {
        return x == y;
    }
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x == y,
        _ => norm_string(a) == norm_string(b),
    }
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::Array(items) => items.iter().any(|item| loose_eq(item, needle)),
        _ => norm_string(haystack).contains(&norm_string(needle)),
    }
}

/// Membership: `expected` is an array, or a comma-separated string list.
fn member_of(actual: &Value, expected: &Value) -> bool {
    match expected {
        Value::Array(items) => items.iter().any(|item| loose_eq(actual, item)),
        Value::String(s) => {
            let needle = norm_string(actual);
            s.split(',').any(|item| item.trim().to_lowercase() == needle)
        }
        _ => loose_eq(actual, expected),
    }
}

fn numeric_cmp(actual: Option<&Value>, expected: &Value) -> Option<std::cmp::Ordering> {
    let a = as_number(actual?)?;
    let b = as_number(expected)?;
    a.partial_cmp(&b)
}

/// Best-effort numeric coercion: numbers pass through, strings are parsed
/// after trimming.
fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn norm_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.trim().to_lowercase(),
        Value::Null => String::new(),
        other => other.to_string().trim().to_lowercase(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
