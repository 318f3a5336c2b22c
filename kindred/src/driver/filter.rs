//! Primitive filter evaluation shared by the bundled drivers.
//!
//! A primitive filter maps a storage key (dotted for embedded values) to a
//! condition: a literal means equality, or membership when the stored value is
//! a list; a list means "is one of"; an operator map (`$in`, `$nin`, `$ne`,
//! `$gt`, `$gte`, `$lt`, `$lte`, `$exists`) applies each operator.

use super::{Document, Filter};
use serde_json::{Map, Value};
use std::cmp::Ordering;

pub fn matches(doc: &Document, filter: &Filter) -> bool {
    filter
        .iter()
        .all(|(key, condition)| matches_condition(lookup(doc, key), condition))
}

/// Resolve a dotted path against a document.
pub fn lookup<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = doc.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

/// True when every key of a non-empty map is an operator.
pub fn is_operator_map(map: &Map<String, Value>) -> bool {
    !map.is_empty() && map.keys().all(|k| k.starts_with('$'))
}

pub fn matches_condition(value: Option<&Value>, condition: &Value) -> bool {
    match condition {
        Value::Object(ops) if is_operator_map(ops) => ops
            .iter()
            .all(|(op, arg)| apply_operator(value, op, arg)),
        Value::Array(options) => options.iter().any(|option| equals(value, option)),
        literal => equals(value, literal),
    }
}

fn equals(value: Option<&Value>, literal: &Value) -> bool {
    match value {
        None | Some(Value::Null) => literal.is_null(),
        Some(Value::Array(items)) if !literal.is_array() => {
            items.iter().any(|item| values_equal(item, literal))
        }
        Some(v) => values_equal(v, literal),
    }
}

fn apply_operator(value: Option<&Value>, op: &str, arg: &Value) -> bool {
    match op {
        "$in" => match arg {
            Value::Array(options) => options.iter().any(|o| equals(value, o)),
            other => equals(value, other),
        },
        "$nin" => match arg {
            Value::Array(options) => !options.iter().any(|o| equals(value, o)),
            other => !equals(value, other),
        },
        "$ne" => !equals(value, arg),
        "$exists" => {
            let exists = !matches!(value, None | Some(Value::Null));
            arg.as_bool().unwrap_or(true) == exists
        }
        "$gt" => compares(value, arg, |o| o == Ordering::Greater),
        "$gte" => compares(value, arg, |o| o != Ordering::Less),
        "$lt" => compares(value, arg, |o| o == Ordering::Less),
        "$lte" => compares(value, arg, |o| o != Ordering::Greater),
        _ => false,
    }
}

fn compares(value: Option<&Value>, arg: &Value, accept: impl Fn(Ordering) -> bool) -> bool {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .any(|item| compare_values(item, arg).map(&accept).unwrap_or(false)),
        Some(v) => compare_values(v, arg).map(accept).unwrap_or(false),
        None => false,
    }
}

pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

/// Ordering between two scalar values of the same kind. Null sorts first.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Null, _) => Some(Ordering::Less),
        (_, Value::Null) => Some(Ordering::Greater),
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    fn filter(value: Value) -> Filter {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_literal_matches_array_membership() {
        let d = doc(json!({ "name": "Richard", "friends": ["a", "b"] }));
        assert!(matches(&d, &filter(json!({ "friends": "b" }))));
        assert!(!matches(&d, &filter(json!({ "friends": "c" }))));
        assert!(matches(&d, &filter(json!({ "friends": { "$in": ["c", "a"] } }))));
    }

    #[test]
    fn test_list_means_one_of() {
        let d = doc(json!({ "name": "Richard" }));
        assert!(matches(&d, &filter(json!({ "name": ["Christie", "Richard"] }))));
        assert!(!matches(&d, &filter(json!({ "name": ["Christie"] }))));
    }

    #[test]
    fn test_range_operators_and_numbers() {
        let d = doc(json!({ "age": 30, "address": { "city": "Paris" } }));
        assert!(matches(&d, &filter(json!({ "age": { "$gte": 30.0, "$lt": 40 } }))));
        assert!(!matches(&d, &filter(json!({ "age": { "$gt": 30 } }))));
        assert!(matches(&d, &filter(json!({ "address.city": "Paris" }))));
        assert!(matches(&d, &filter(json!({ "missing": { "$exists": false } }))));
        assert!(matches(&d, &filter(json!({ "missing": null }))));
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        assert!(matches(&doc(json!({ "a": 1 })), &Filter::new()));
    }
}
