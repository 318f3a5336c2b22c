use crate::driver::{filter, Document};
use crate::error::{KindredError, Result};
use crate::events::Operation;
use crate::loader::Loader;
use crate::schema::{Field, Model, SchemaRegistry};
use futures::future::try_join_all;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// What a rule sees when it runs.
#[derive(Debug, Clone, Copy)]
pub struct RuleContext<'a> {
    /// `None` when the key is absent from the input.
    pub value: Option<&'a Value>,
    pub previous: Option<&'a Value>,
    pub operation: Operation,
    /// e.g. `Person.address.city`
    pub path: &'a str,
}

pub type RuleFn = Arc<dyn Fn(&RuleContext<'_>) -> Result<()> + Send + Sync>;

/// A validation rule attached to a field.
#[derive(Clone)]
pub enum Rule {
    Required,
    Immutable,
    Enum(Vec<Value>),
    Range { min: Option<f64>, max: Option<f64> },
    Allow(Vec<Value>),
    Reject(Vec<Value>),
    Pattern(regex::Regex),
    Custom(RuleFn),
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rule::Required => f.write_str("Required"),
            Rule::Immutable => f.write_str("Immutable"),
            Rule::Enum(values) => f.debug_tuple("Enum").field(values).finish(),
            Rule::Range { min, max } => f
                .debug_struct("Range")
                .field("min", min)
                .field("max", max)
                .finish(),
            Rule::Allow(values) => f.debug_tuple("Allow").field(values).finish(),
            Rule::Reject(values) => f.debug_tuple("Reject").field(values).finish(),
            Rule::Pattern(regex) => f.debug_tuple("Pattern").field(&regex.as_str()).finish(),
            Rule::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl Rule {
    pub fn custom<F>(check: F) -> Self
    where
        F: Fn(&RuleContext<'_>) -> Result<()> + Send + Sync + 'static,
    {
        Rule::Custom(Arc::new(check))
    }

    pub fn check(&self, ctx: &RuleContext<'_>) -> Result<()> {
        let present = !matches!(ctx.value, None | Some(Value::Null));
        match self {
            Rule::Required => {
                let missing = match ctx.operation {
                    Operation::Create => !present,
                    _ => matches!(ctx.value, Some(Value::Null)),
                };
                if missing {
                    return Err(KindredError::validation(ctx.path, "is required"));
                }
            }
            Rule::Immutable => {
                if ctx.operation == Operation::Update {
                    if let (Some(value), Some(previous)) = (ctx.value, ctx.previous) {
                        if !previous.is_null() && !filter::values_equal(value, previous) {
                            return Err(KindredError::validation(ctx.path, "is immutable"));
                        }
                    }
                }
            }
            Rule::Enum(allowed) | Rule::Allow(allowed) => {
                for item in elements(ctx.value) {
                    if !allowed.iter().any(|a| filter::values_equal(a, item)) {
                        return Err(KindredError::validation(
                            ctx.path,
                            format!("value {item} is not allowed"),
                        ));
                    }
                }
            }
            Rule::Reject(rejected) => {
                for item in elements(ctx.value) {
                    if rejected.iter().any(|r| filter::values_equal(r, item)) {
                        return Err(KindredError::validation(
                            ctx.path,
                            format!("value {item} is rejected"),
                        ));
                    }
                }
            }
            Rule::Range { min, max } => {
                for item in elements(ctx.value) {
                    let measure = match item {
                        Value::Number(n) => n.as_f64(),
                        Value::String(s) => Some(s.chars().count() as f64),
                        _ => None,
                    };
                    let Some(measure) = measure else { continue };
                    let below = min.map(|m| measure < m).unwrap_or(false);
                    let above = max.map(|m| measure > m).unwrap_or(false);
                    if below || above {
                        return Err(KindredError::validation(
                            ctx.path,
                            format!("value {item} is out of range"),
                        ));
                    }
                }
            }
            Rule::Pattern(regex) => {
                for item in elements(ctx.value) {
                    if let Some(s) = item.as_str() {
                        if !regex.is_match(s) {
                            return Err(KindredError::validation(
                                ctx.path,
                                format!("value '{s}' does not match {}", regex.as_str()),
                            ));
                        }
                    }
                }
            }
            Rule::Custom(check) => check(ctx)?,
        }
        Ok(())
    }
}

/// Non-null values to check: every element of a list, or the value itself.
fn elements<'a>(value: Option<&'a Value>) -> Vec<&'a Value> {
    match value {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items.iter().filter(|v| !v.is_null()).collect(),
        Some(v) => vec![v],
    }
}

/// A reference that must exist before the write proceeds.
struct PendingRef<'a> {
    path: String,
    target: &'a Model,
    id: Value,
}

/// Validate normalized (storage-keyed) data for a write.
///
/// All rule checks run first across the whole document, then every stored
/// reference is confirmed to exist. Any failure aborts the operation.
pub async fn validate_model_data(
    registry: &SchemaRegistry,
    loader: &Loader,
    model: &Model,
    data: &Document,
    previous: Option<&Document>,
    operation: Operation,
) -> Result<()> {
    let mut refs = Vec::new();
    check_model(
        registry,
        model,
        data,
        previous,
        operation,
        &model.name,
        &mut refs,
    )?;

    try_join_all(refs.into_iter().map(|pending| async move {
        match loader.get(pending.target, &pending.id).await? {
            Some(_) => Ok(()),
            None => Err(KindredError::not_found_at(
                pending.path,
                &pending.target.name,
                &pending.id,
            )),
        }
    }))
    .await?;
    Ok(())
}

fn check_model<'a>(
    registry: &'a SchemaRegistry,
    model: &'a Model,
    data: &Document,
    previous: Option<&Document>,
    operation: Operation,
    prefix: &str,
    refs: &mut Vec<PendingRef<'a>>,
) -> Result<()> {
    for field in &model.fields {
        let path = format!("{prefix}.{}", field.name);
        let value = data.get(&field.key);

        if field.is_virtual() {
            if value.is_some() {
                return Err(KindredError::validation(path, "is a virtual field and read-only"));
            }
            continue;
        }
        if operation == Operation::Update && value.is_none() {
            continue;
        }

        let prev = previous.and_then(|p| p.get(&field.key));
        let ctx = RuleContext {
            value,
            previous: prev,
            operation,
            path: &path,
        };
        for rule in &field.rules {
            rule.check(&ctx)?;
        }

        if let Some(value) = value.filter(|v| !v.is_null()) {
            check_shape(field, value, &path)?;
            check_references(registry, field, value, prev, operation, &path, refs)?;
        }
    }
    Ok(())
}

fn check_shape(field: &Field, value: &Value, path: &str) -> Result<()> {
    match (field.is_array(), value.is_array()) {
        (true, false) => Err(KindredError::validation(path, "expected a list")),
        (false, true) => Err(KindredError::validation(path, "expected a single value, got a list")),
        _ => Ok(()),
    }
}

fn check_references<'a>(
    registry: &'a SchemaRegistry,
    field: &Field,
    value: &Value,
    previous: Option<&Value>,
    operation: Operation,
    path: &str,
    refs: &mut Vec<PendingRef<'a>>,
) -> Result<()> {
    let Some(target) = registry.target(field)? else {
        return Ok(());
    };

    if field.embedded {
        let items: Vec<&Value> = match value {
            Value::Array(items) => items.iter().collect(),
            other => vec![other],
        };
        for (i, item) in items.into_iter().enumerate() {
            let embedded = item
                .as_object()
                .ok_or_else(|| KindredError::validation(path, "expected an embedded object"))?;
            let item_path = if field.is_array() {
                format!("{path}.{i}")
            } else {
                path.to_string()
            };
            // Embedded arrays are validated as fresh objects; single embeds keep history.
            let (embedded_prev, embedded_op) = match (field.is_array(), previous) {
                (false, Some(Value::Object(prev))) => (Some(prev), operation),
                _ => (None, Operation::Create),
            };
            check_model(
                registry,
                target,
                embedded,
                embedded_prev,
                embedded_op,
                &item_path,
                refs,
            )?;
        }
        return Ok(());
    }

    for id in elements(Some(value)) {
        if id.is_object() || id.is_array() {
            return Err(KindredError::validation(path, format!("{id} is not a reference id")));
        }
        refs.push(PendingRef {
            path: path.to_string(),
            target,
            id: id.clone(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx<'a>(value: Option<&'a Value>, previous: Option<&'a Value>, op: Operation) -> RuleContext<'a> {
        RuleContext {
            value,
            previous,
            operation: op,
            path: "Person.name",
        }
    }

    #[test]
    fn test_required_create_vs_update() {
        let null = Value::Null;
        assert!(Rule::Required.check(&ctx(None, None, Operation::Create)).is_err());
        assert!(Rule::Required.check(&ctx(None, None, Operation::Update)).is_ok());
        assert!(Rule::Required.check(&ctx(Some(&null), None, Operation::Update)).is_err());
    }

    #[test]
    fn test_immutable_allows_unchanged_and_first_set() {
        let richard = json!("Richard");
        let other = json!("Rich");
        let null = Value::Null;
        let rule = Rule::Immutable;
        assert!(rule.check(&ctx(Some(&richard), Some(&richard), Operation::Update)).is_ok());
        assert!(rule.check(&ctx(Some(&richard), Some(&null), Operation::Update)).is_ok());
        assert!(rule.check(&ctx(Some(&richard), None, Operation::Update)).is_ok());
        let err = rule
            .check(&ctx(Some(&other), Some(&richard), Operation::Update))
            .unwrap_err();
        assert!(err.to_string().contains("Person.name"));
    }

    #[test]
    fn test_range_allow_reject_pattern() {
        let range = Rule::Range {
            min: Some(1.0),
            max: Some(3.0),
        };
        assert!(range.check(&ctx(Some(&json!(2)), None, Operation::Create)).is_ok());
        assert!(range.check(&ctx(Some(&json!(4)), None, Operation::Create)).is_err());
        assert!(range.check(&ctx(Some(&json!("abcd")), None, Operation::Create)).is_err());

        let allow = Rule::Allow(vec![json!("a"), json!("b")]);
        assert!(allow.check(&ctx(Some(&json!(["a", "b"])), None, Operation::Create)).is_ok());
        assert!(allow.check(&ctx(Some(&json!(["a", "c"])), None, Operation::Create)).is_err());

        let reject = Rule::Reject(vec![json!(0)]);
        assert!(reject.check(&ctx(Some(&json!(0.0)), None, Operation::Create)).is_err());

        let pattern = Rule::Pattern(regex::Regex::new("^R").unwrap());
        assert!(pattern.check(&ctx(Some(&json!("Richard")), None, Operation::Create)).is_ok());
        assert!(pattern.check(&ctx(Some(&json!("Christie")), None, Operation::Create)).is_err());
    }

    #[test]
    fn test_custom_rule_receives_context() {
        let rule = Rule::custom(|ctx| {
            if ctx.operation == Operation::Update && ctx.previous.is_none() {
                return Err(KindredError::validation(ctx.path, "needs history"));
            }
            Ok(())
        });
        assert!(rule.check(&ctx(Some(&json!(1)), None, Operation::Update)).is_err());
        assert!(rule.check(&ctx(Some(&json!(1)), None, Operation::Create)).is_ok());
    }
}
