//! Input normalization for writes and where clauses.
//!
//! Write payloads arrive keyed by logical field names and leave keyed by
//! storage keys, with references converted to store-native ids and scalars
//! coerced to their declared kinds. Where clauses keep their logical keys and
//! structure; only id-shaped and scalar values are converted.

use crate::driver::{filter::is_operator_map, Document, Filter, Stores};
use crate::error::{KindredError, Result};
use crate::schema::{Field, Model, ScalarKind, SchemaRegistry, TransformSpec, ID_KEY};
use serde_json::{Map, Number, Value};
use std::collections::HashSet;

/// Wrap bare values supplied for list fields into one-element lists.
pub fn ensure_model_array_types(registry: &SchemaRegistry, model: &Model, data: &mut Document) {
    for field in &model.fields {
        let Some(value) = data.get_mut(&field.name) else {
            continue;
        };
        if field.is_array() && !value.is_array() && !value.is_null() {
            *value = Value::Array(vec![value.take()]);
        }
        if field.embedded {
            let Ok(Some(target)) = registry.target(field) else {
                continue;
            };
            match value {
                Value::Object(inner) => ensure_model_array_types(registry, target, inner),
                Value::Array(items) => {
                    for item in items.iter_mut() {
                        if let Value::Object(inner) = item {
                            ensure_model_array_types(registry, target, inner);
                        }
                    }
                }
                _ => {}
            }
        }
    }
}

/// Normalize a create/update payload into its stored form.
pub fn normalize_model_data(
    registry: &SchemaRegistry,
    stores: &Stores,
    model: &Model,
    data: &Document,
) -> Result<Document> {
    normalize_data_at(registry, stores, model, data, &model.name)
}

fn normalize_data_at(
    registry: &SchemaRegistry,
    stores: &Stores,
    model: &Model,
    data: &Document,
    prefix: &str,
) -> Result<Document> {
    let mut out = Document::new();
    for (name, value) in data {
        if name == ID_KEY {
            if !value.is_null() {
                out.insert(ID_KEY.to_string(), stores.for_model(model)?.id_value(value)?);
            }
            continue;
        }
        let path = format!("{prefix}.{name}");
        let field = model
            .field(name)
            .ok_or_else(|| KindredError::validation(&path, "unknown field"))?;
        if field.is_virtual() {
            return Err(KindredError::validation(path, "is a virtual field and read-only"));
        }
        let normalized = if value.is_null() {
            Value::Null
        } else {
            normalize_field_value(registry, stores, field, value, &path)?
        };
        out.insert(field.key.clone(), normalized);
    }
    Ok(out)
}

fn normalize_field_value(
    registry: &SchemaRegistry,
    stores: &Stores,
    field: &Field,
    value: &Value,
    path: &str,
) -> Result<Value> {
    if let Some(target) = registry.target(field)? {
        if field.embedded {
            return map_elements(value, |item| match item {
                Value::Object(inner) => Ok(Value::Object(normalize_data_at(
                    registry, stores, target, inner, path,
                )?)),
                other => Err(KindredError::validation(
                    path,
                    format!("expected an embedded object, got {other}"),
                )),
            });
        }

        let driver = stores.for_model(target)?;
        let converted = map_elements(value, |item| {
            let id = match item {
                Value::Object(obj) => obj.get(ID_KEY).ok_or_else(|| {
                    KindredError::validation(path, "nested reference is missing an id")
                })?,
                other => other,
            };
            driver
                .id_value(id)
                .map_err(|e| KindredError::validation(path, e.to_string()))
        })?;
        return Ok(match converted {
            Value::Array(ids) if field.unique => Value::Array(dedupe(ids)),
            other => other,
        });
    }

    let kind = field.field_type.scalar().unwrap_or(ScalarKind::String);
    let coerced = map_elements(value, |item| {
        coerce(kind, item).ok_or_else(|| {
            KindredError::validation(path, format!("cannot convert {item} to {kind:?}"))
        })
    })?;
    let transformed = field
        .transforms
        .iter()
        .fold(coerced, |value, transform| apply_transform(*transform, value));
    Ok(match transformed {
        Value::Array(items) if field.unique => Value::Array(dedupe(items)),
        other => other,
    })
}

/// Normalize filter values, leaving nested filters for the resolver.
pub fn normalize_model_where(
    registry: &SchemaRegistry,
    stores: &Stores,
    model: &Model,
    where_: &Filter,
) -> Result<Filter> {
    let mut out = Filter::new();
    for (name, value) in where_ {
        let normalized = if name == ID_KEY {
            convert_ids(value, &|id: &Value| stores.for_model(model)?.id_value(id))
        } else {
            let field = model.require_field(name)?;
            match registry.target(field)? {
                Some(target) if field.is_direct_reference() => {
                    let driver = stores.for_model(target)?;
                    convert_ids(value, &|id: &Value| driver.id_value(id))
                }
                Some(_) => value.clone(),
                None => {
                    let kind = field.field_type.scalar().unwrap_or(ScalarKind::String);
                    convert_ids(value, &|v: &Value| {
                        coerce(kind, v).ok_or_else(|| {
                            KindredError::validation(model.path(name), "uncoercible value")
                        })
                    })
                }
            }
        };
        out.insert(name.clone(), normalized);
    }
    Ok(out)
}

/// Convert scalar filter values in place, best effort: anything that fails
/// to convert, and any nested filter object, passes through untouched.
fn convert_ids(value: &Value, convert: &dyn Fn(&Value) -> Result<Value>) -> Value {
    match value {
        Value::Null => Value::Null,
        Value::Array(items) => {
            Value::Array(items.iter().map(|item| convert_ids(item, convert)).collect())
        }
        Value::Object(ops) if is_operator_map(ops) => {
            let mut out = Map::new();
            for (op, arg) in ops {
                let converted = match op.as_str() {
                    "$in" | "$nin" | "$ne" | "$gt" | "$gte" | "$lt" | "$lte" => {
                        convert_ids(arg, convert)
                    }
                    _ => arg.clone(),
                };
                out.insert(op.clone(), converted);
            }
            Value::Object(out)
        }
        Value::Object(_) => value.clone(),
        scalar => convert(scalar).unwrap_or_else(|_| scalar.clone()),
    }
}

fn map_elements(value: &Value, f: impl Fn(&Value) -> Result<Value>) -> Result<Value> {
    match value {
        Value::Array(items) => items
            .iter()
            .map(|item| if item.is_null() { Ok(Value::Null) } else { f(item) })
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        other => f(other),
    }
}

/// Coerce a scalar into the declared kind; `None` when not representable.
pub fn coerce(kind: ScalarKind, value: &Value) -> Option<Value> {
    match (kind, value) {
        (ScalarKind::String | ScalarKind::Id, Value::String(_)) => Some(value.clone()),
        (ScalarKind::String | ScalarKind::Id, Value::Number(n)) => Some(Value::String(n.to_string())),
        (ScalarKind::String, Value::Bool(b)) => Some(Value::String(b.to_string())),
        (ScalarKind::Number, Value::Number(_)) => Some(value.clone()),
        (ScalarKind::Number, Value::String(s)) => {
            let s = s.trim();
            if let Ok(i) = s.parse::<i64>() {
                Some(Value::from(i))
            } else {
                s.parse::<f64>().ok().and_then(Number::from_f64).map(Value::Number)
            }
        }
        (ScalarKind::Boolean, Value::Bool(_)) => Some(value.clone()),
        (ScalarKind::Boolean, Value::String(s)) => match s.trim() {
            "true" => Some(Value::Bool(true)),
            "false" => Some(Value::Bool(false)),
            _ => None,
        },
        _ => None,
    }
}

fn apply_transform(transform: TransformSpec, value: Value) -> Value {
    let rewrite = |f: fn(&str) -> String| move |v: Value| match v {
        Value::String(s) => Value::String(f(&s)),
        other => other,
    };
    let each = |value: Value, f: &dyn Fn(Value) -> Value| match value {
        Value::Array(items) => Value::Array(items.into_iter().map(f).collect()),
        other => f(other),
    };
    match transform {
        TransformSpec::Trim => each(value, &rewrite(|s| s.trim().to_string())),
        TransformSpec::Lowercase => each(value, &rewrite(str::to_lowercase)),
        TransformSpec::Uppercase => each(value, &rewrite(str::to_uppercase)),
        TransformSpec::Dedupe => match value {
            Value::Array(items) => Value::Array(dedupe(items)),
            other => other,
        },
    }
}

/// Order-preserving de-duplication.
pub fn dedupe(items: Vec<Value>) -> Vec<Value> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(item.to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{MemoryDriver, SqliteDriver};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Arc;

    fn fixture() -> (SchemaRegistry, Stores) {
        let registry = SchemaRegistry::from_yaml(
            r#"
models:
  Person:
    fields:
      name: { type: String, transforms: [trim] }
      age: Number
      active: Boolean
      emailAddress: { type: String, alias: email, transforms: [lowercase] }
      friends: { type: "[Person]", unique: true }
      favorite: Book
      address: { type: Address, embedded: true }
      books: { type: "[Book]", by: author }
  Address:
    hideFromApi: true
    fields:
      city: { type: String, transforms: [uppercase] }
      zip: String
  Book:
    store: archive
    fields:
      author: Person
"#,
            "default",
        )
        .unwrap();
        let stores = Stores::new()
            .with("default", Arc::new(MemoryDriver::default()))
            .with("archive", Arc::new(SqliteDriver::open_in_memory().unwrap()));
        (registry, stores)
    }

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_ensure_array_types_wraps_scalars() {
        let (registry, _) = fixture();
        let person = registry.model("Person").unwrap();
        let mut data = doc(json!({ "friends": "a", "name": "x" }));
        ensure_model_array_types(&registry, person, &mut data);
        assert_eq!(data["friends"], json!(["a"]));
        assert_eq!(data["name"], json!("x"));
    }

    #[test]
    fn test_normalize_data_coerces_and_renames() {
        let (registry, stores) = fixture();
        let person = registry.model("Person").unwrap();
        let data = doc(json!({
            "name": "  Richard ",
            "age": "42",
            "active": "true",
            "emailAddress": "R@X.COM",
            "favorite": "7",
            "address": { "city": "paris", "zip": 75001 }
        }));
        let normalized = normalize_model_data(&registry, &stores, person, &data).unwrap();
        assert_eq!(
            Value::Object(normalized),
            json!({
                "name": "Richard",
                "age": 42,
                "active": true,
                "email": "r@x.com",
                "favorite": 7,
                "address": { "city": "PARIS", "zip": "75001" }
            })
        );
    }

    #[test]
    fn test_unique_reference_dedupe_is_idempotent() {
        let (registry, stores) = fixture();
        let person = registry.model("Person").unwrap();
        let data = doc(json!({ "friends": ["b", "a", "b", { "id": "a" }, "c"] }));
        let once = normalize_model_data(&registry, &stores, person, &data).unwrap();
        assert_eq!(once["friends"], json!(["b", "a", "c"]));

        let mut logical = Document::new();
        logical.insert("friends".into(), once["friends"].clone());
        let twice = normalize_model_data(&registry, &stores, person, &logical).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_virtual_and_unknown_fields_rejected() {
        let (registry, stores) = fixture();
        let person = registry.model("Person").unwrap();
        let err = normalize_model_data(&registry, &stores, person, &doc(json!({ "books": [] })))
            .unwrap_err();
        assert!(err.to_string().contains("Person.books"));
        let err = normalize_model_data(&registry, &stores, person, &doc(json!({ "nope": 1 })))
            .unwrap_err();
        assert!(err.to_string().contains("Person.nope"));
    }

    #[test]
    fn test_bad_number_is_validation_error() {
        let (registry, stores) = fixture();
        let person = registry.model("Person").unwrap();
        let err = normalize_model_data(&registry, &stores, person, &doc(json!({ "age": "old" })))
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
    }

    #[test]
    fn test_normalize_where_keeps_structure() {
        let (registry, stores) = fixture();
        let person = registry.model("Person").unwrap();
        let where_ = doc(json!({
            "favorite": { "$in": ["1", "x"] },
            "friends": ["a", { "name": "Christie" }],
            "age": { "$gte": "30" },
            "books": { "name": "Dune" }
        }));
        let normalized = normalize_model_where(&registry, &stores, person, &where_).unwrap();
        assert_eq!(normalized["favorite"], json!({ "$in": [1, "x"] }));
        assert_eq!(normalized["friends"], json!(["a", { "name": "Christie" }]));
        assert_eq!(normalized["age"], json!({ "$gte": 30 }));
        assert_eq!(normalized["books"], json!({ "name": "Dune" }));
    }
}
