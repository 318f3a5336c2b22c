//! Where-clause resolution.
//!
//! A where clause may reach into other models through references, inverse
//! (`by`) fields and arrays mixing literal ids with nested filters. The
//! resolver flattens it into an explicit plan of lookups, one node per nested
//! filter, then executes the plan from the deepest level back to the root.
//! Each executed node contributes ids to a slot on its parent; once every
//! child of a parent has run, the slot becomes an `$in` constraint on the
//! parent's primitive filter. The root filter is the result.

use crate::driver::filter::is_operator_map;
use crate::driver::{Document, Filter};
use crate::error::{KindredError, Result};
use crate::loader::Loader;
use crate::normalize::{dedupe, normalize_model_where};
use crate::query::is_count_name;
use crate::schema::{Model, SchemaRegistry, ID_KEY};
use futures::future::try_join_all;
use serde_json::{json, Value};
use std::sync::Arc;

/// How a node's rows constrain its parent.
#[derive(Debug, Clone, PartialEq)]
enum Link {
    /// Parent stores the child's id under the slot key.
    Direct,
    /// Child stores the parent's id under `by_key`.
    Inverse { by_key: String },
}

#[derive(Debug)]
struct PlanNode<'a> {
    model: &'a Model,
    depth: usize,
    filter: Filter,
    /// Slot on the parent this node feeds; `None` for the root.
    slot: Option<usize>,
    link: Link,
}

/// Storage key on a parent node, constrained by the union of its seeds and
/// the contributions of every child feeding it.
#[derive(Debug)]
struct Slot {
    parent: usize,
    key: String,
    seeds: Vec<Value>,
}

#[derive(Debug, Default)]
struct Plan<'a> {
    nodes: Vec<PlanNode<'a>>,
    slots: Vec<Slot>,
}

impl<'a> Plan<'a> {
    fn max_depth(&self) -> usize {
        self.nodes.iter().map(|n| n.depth).max().unwrap_or(0)
    }

    fn level(&self, depth: usize) -> Vec<usize> {
        (0..self.nodes.len())
            .filter(|&i| self.nodes[i].depth == depth)
            .collect()
    }

    fn add_slot(&mut self, parent: usize, key: &str, seeds: Vec<Value>) -> usize {
        self.slots.push(Slot {
            parent,
            key: key.to_string(),
            seeds,
        });
        self.slots.len() - 1
    }
}

pub struct Resolver<'a> {
    registry: &'a SchemaRegistry,
    loader: &'a Loader,
}

impl<'a> Resolver<'a> {
    pub fn new(registry: &'a SchemaRegistry, loader: &'a Loader) -> Self {
        Resolver { registry, loader }
    }

    /// Rewrite `where_` (logical keys) into a primitive, storage-keyed filter
    /// for `model`, running whatever lookups nested filters require.
    pub async fn resolve(&self, model: &'a Model, where_: &Filter) -> Result<Filter> {
        let mut plan = Plan::default();
        self.descend(&mut plan, model, where_, 0, None, Link::Direct)?;

        if plan.nodes.len() == 1 {
            return Ok(std::mem::take(&mut plan.nodes[0].filter));
        }

        let max_depth = plan.max_depth();
        log::debug!(
            "resolving {} where clause: {} lookups over {max_depth} levels",
            model.name,
            plan.nodes.len() - 1
        );

        let mut contributions: Vec<Vec<Value>> = vec![Vec::new(); plan.nodes.len()];
        for depth in (1..=max_depth).rev() {
            let level = plan.level(depth);
            let rows = try_join_all(level.iter().map(|&i| self.execute(&plan.nodes[i]))).await?;
            for (&i, rows) in level.iter().zip(rows) {
                contributions[i] = contribute(&plan.nodes[i].link, &rows);
            }

            for slot_index in 0..plan.slots.len() {
                let slot = &plan.slots[slot_index];
                if plan.nodes[slot.parent].depth + 1 != depth {
                    continue;
                }
                let mut values = slot.seeds.clone();
                for (i, node) in plan.nodes.iter().enumerate() {
                    if node.slot == Some(slot_index) {
                        values.extend(contributions[i].iter().cloned());
                    }
                }
                let (parent, key) = (slot.parent, slot.key.clone());
                constrain(&mut plan.nodes[parent].filter, &key, dedupe(values));
            }
        }

        Ok(std::mem::take(&mut plan.nodes[0].filter))
    }

    async fn execute(&self, node: &PlanNode<'a>) -> Result<Arc<Vec<Document>>> {
        if unsatisfiable(&node.filter) {
            log::debug!("skipping {} lookup at level {}: nothing can match", node.model.name, node.depth);
            return Ok(Arc::new(Vec::new()));
        }
        log::debug!("level {} lookup on {}", node.depth, node.model.name);
        self.loader.find(node.model, &node.filter).await
    }

    /// Push a node for `where_` on `model` and recurse into nested filters.
    fn descend(
        &self,
        plan: &mut Plan<'a>,
        model: &'a Model,
        where_: &Filter,
        depth: usize,
        slot: Option<usize>,
        link: Link,
    ) -> Result<usize> {
        let index = plan.nodes.len();
        plan.nodes.push(PlanNode {
            model,
            depth,
            filter: Filter::new(),
            slot,
            link,
        });

        if let Some(name) = where_.keys().find(|k| is_count_name(k) && model.field(k).is_none()) {
            return Err(KindredError::Query(format!(
                "{} is a count and cannot be filtered by the store",
                model.path(name)
            )));
        }
        let normalized = normalize_model_where(self.registry, self.loader.stores(), model, where_)?;
        let mut filter = Filter::new();
        for (name, value) in normalized {
            if name == ID_KEY {
                filter.insert(name, value);
                continue;
            }
            let field = model.require_field(&name)?;
            let Some(target) = self.registry.target(field)? else {
                filter.insert(field.key.clone(), value);
                continue;
            };

            if let Some(by) = &field.by {
                let by_key = target.require_field(by)?.key.clone();
                let nested = match value {
                    Value::Object(map) if !is_operator_map(&map) => map,
                    other => {
                        let mut map = Filter::new();
                        map.insert(ID_KEY.to_string(), other);
                        map
                    }
                };
                let slot = plan.add_slot(index, ID_KEY, Vec::new());
                self.descend(plan, target, &nested, depth + 1, Some(slot), Link::Inverse { by_key })?;
                continue;
            }

            if field.embedded {
                match value {
                    Value::Object(map) if !is_operator_map(&map) => {
                        let nested = normalize_model_where(self.registry, self.loader.stores(), target, &map)?;
                        flatten_embedded(self.registry, target, &field.key, nested, &mut filter)?;
                    }
                    other => {
                        filter.insert(field.key.clone(), other);
                    }
                }
                continue;
            }

            match value {
                Value::Object(map) if !is_operator_map(&map) => {
                    let slot = plan.add_slot(index, &field.key, Vec::new());
                    self.descend(plan, target, &map, depth + 1, Some(slot), Link::Direct)?;
                }
                Value::Array(items) if items.iter().any(Value::is_object) => {
                    let (nested, seeds): (Vec<Value>, Vec<Value>) =
                        items.into_iter().partition(Value::is_object);
                    let slot = plan.add_slot(index, &field.key, seeds);
                    for item in nested {
                        if let Value::Object(map) = item {
                            self.descend(plan, target, &map, depth + 1, Some(slot), Link::Direct)?;
                        }
                    }
                }
                other => {
                    filter.insert(field.key.clone(), other);
                }
            }
        }

        plan.nodes[index].filter = filter;
        Ok(index)
    }
}

/// Values a node's rows contribute to its parent slot.
fn contribute(link: &Link, rows: &[Document]) -> Vec<Value> {
    let key = match link {
        Link::Direct => ID_KEY,
        Link::Inverse { by_key } => by_key.as_str(),
    };
    let mut values = Vec::new();
    for row in rows {
        match row.get(key) {
            Some(Value::Array(items)) => values.extend(items.iter().filter(|v| !v.is_null()).cloned()),
            Some(Value::Null) | None => {}
            Some(value) => values.push(value.clone()),
        }
    }
    values
}

/// Narrow `filter[key]` to `values`, intersecting with whatever is already there.
fn constrain(filter: &mut Filter, key: &str, values: Vec<Value>) {
    let merged = match filter.remove(key) {
        None => json!({ "$in": values }),
        Some(Value::Object(mut ops)) if is_operator_map(&ops) => {
            let allowed = match ops.remove("$in") {
                Some(Value::Array(existing)) => intersect(&existing, values),
                Some(single) => intersect(&[single], values),
                None => values,
            };
            ops.insert("$in".to_string(), Value::Array(allowed));
            Value::Object(ops)
        }
        Some(Value::Array(existing)) => json!({ "$in": intersect(&existing, values) }),
        Some(literal) => json!({ "$in": intersect(&[literal], values) }),
    };
    filter.insert(key.to_string(), merged);
}

fn intersect(existing: &[Value], values: Vec<Value>) -> Vec<Value> {
    values
        .into_iter()
        .filter(|v| existing.iter().any(|e| crate::driver::filter::values_equal(e, v)))
        .collect()
}

fn unsatisfiable(filter: &Filter) -> bool {
    filter.values().any(|condition| match condition {
        Value::Object(ops) => matches!(ops.get("$in"), Some(Value::Array(options)) if options.is_empty()),
        _ => false,
    })
}

/// Rewrite a nested embedded filter into dotted storage keys.
fn flatten_embedded(
    registry: &SchemaRegistry,
    model: &Model,
    prefix: &str,
    where_: Filter,
    out: &mut Filter,
) -> Result<()> {
    for (name, value) in where_ {
        let field = model.require_field(&name)?;
        let key = format!("{prefix}.{}", field.key);
        match (value, registry.target(field)?) {
            (Value::Object(map), Some(target)) if field.embedded && !is_operator_map(&map) => {
                flatten_embedded(registry, target, &key, map, out)?;
            }
            (value, _) => {
                out.insert(key, value);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{MemoryDriver, StoreDriver, Stores};
    use pretty_assertions::assert_eq;

    const SCHEMA: &str = r#"
models:
  Person:
    fields:
      name: String
      friends: "[Person]"
      address: { type: Address, embedded: true }
      books: { type: "[Book]", by: author }
  Address:
    hideFromApi: true
    fields:
      city: String
  Book:
    fields:
      name: String
      author: Person
"#;

    struct Fixture {
        registry: SchemaRegistry,
        driver: Arc<MemoryDriver>,
        loader: Loader,
    }

    async fn fixture() -> Fixture {
        let registry = SchemaRegistry::from_yaml(SCHEMA, "default").unwrap();
        let driver = Arc::new(MemoryDriver::default());
        let person = registry.model("Person").unwrap();
        let book = registry.model("Book").unwrap();
        let rows = [
            json!({ "id": "christie", "name": "Christie", "friends": [] }),
            json!({ "id": "richard", "name": "Richard", "friends": ["christie"] }),
            json!({ "id": "ada", "name": "Ada", "friends": ["richard"], "address": { "city": "Paris" } }),
        ];
        for row in rows {
            driver.create(person, row.as_object().cloned().unwrap()).await.unwrap();
        }
        driver
            .create(book, json!({ "id": "dune", "name": "Dune", "author": "richard" }).as_object().cloned().unwrap())
            .await
            .unwrap();
        let loader = Loader::new(Stores::new().with("default", driver.clone()));
        Fixture {
            registry,
            driver,
            loader,
        }
    }

    fn filter(value: Value) -> Filter {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_flat_filter_needs_no_lookup() {
        let fx = fixture().await;
        let resolver = Resolver::new(&fx.registry, &fx.loader);
        let person = fx.registry.model("Person").unwrap();
        let resolved = resolver
            .resolve(person, &filter(json!({ "name": "Richard", "address": { "city": "Paris" } })))
            .await
            .unwrap();
        assert_eq!(Value::Object(resolved), json!({ "name": "Richard", "address.city": "Paris" }));
        assert_eq!(fx.driver.calls().reads(), 0);
    }

    #[tokio::test]
    async fn test_direct_reference_becomes_in_filter() {
        let fx = fixture().await;
        let resolver = Resolver::new(&fx.registry, &fx.loader);
        let person = fx.registry.model("Person").unwrap();
        let resolved = resolver
            .resolve(person, &filter(json!({ "friends": { "name": "Christie" } })))
            .await
            .unwrap();
        assert_eq!(Value::Object(resolved), json!({ "friends": { "$in": ["christie"] } }));
        assert_eq!(fx.driver.calls().find, 1);
    }

    #[tokio::test]
    async fn test_mixed_array_unions_literals_and_lookups() {
        let fx = fixture().await;
        let resolver = Resolver::new(&fx.registry, &fx.loader);
        let person = fx.registry.model("Person").unwrap();
        let resolved = resolver
            .resolve(person, &filter(json!({ "friends": ["ada", { "name": "Christie" }] })))
            .await
            .unwrap();
        assert_eq!(Value::Object(resolved), json!({ "friends": { "$in": ["ada", "christie"] } }));
    }

    #[tokio::test]
    async fn test_inverse_field_constrains_id() {
        let fx = fixture().await;
        let resolver = Resolver::new(&fx.registry, &fx.loader);
        let person = fx.registry.model("Person").unwrap();
        let resolved = resolver
            .resolve(person, &filter(json!({ "id": ["richard", "ada"], "books": { "name": "Dune" } })))
            .await
            .unwrap();
        assert_eq!(Value::Object(resolved), json!({ "id": { "$in": ["richard"] } }));
    }

    #[tokio::test]
    async fn test_two_levels_run_deepest_first() {
        let fx = fixture().await;
        let resolver = Resolver::new(&fx.registry, &fx.loader);
        let book = fx.registry.model("Book").unwrap();
        let resolved = resolver
            .resolve(book, &filter(json!({ "author": { "friends": { "name": "Christie" } } })))
            .await
            .unwrap();
        assert_eq!(Value::Object(resolved), json!({ "author": { "$in": ["richard"] } }));
        assert_eq!(fx.driver.calls().find, 2);
    }

    #[tokio::test]
    async fn test_empty_nested_filter_matches_all_rows() {
        let fx = fixture().await;
        let resolver = Resolver::new(&fx.registry, &fx.loader);
        let book = fx.registry.model("Book").unwrap();
        let resolved = resolver
            .resolve(book, &filter(json!({ "author": {} })))
            .await
            .unwrap();
        let Value::Array(ids) = &resolved["author"]["$in"] else {
            panic!("expected an $in list");
        };
        assert_eq!(ids.len(), 3);
    }

    #[tokio::test]
    async fn test_no_match_skips_parent_lookup() {
        let fx = fixture().await;
        let resolver = Resolver::new(&fx.registry, &fx.loader);
        let book = fx.registry.model("Book").unwrap();
        let resolved = resolver
            .resolve(book, &filter(json!({ "author": { "friends": { "name": "Nobody" } } })))
            .await
            .unwrap();
        assert_eq!(Value::Object(resolved), json!({ "author": { "$in": [] } }));
        assert_eq!(fx.driver.calls().find, 1);
    }

    #[tokio::test]
    async fn test_unknown_field_names_path() {
        let fx = fixture().await;
        let resolver = Resolver::new(&fx.registry, &fx.loader);
        let book = fx.registry.model("Book").unwrap();
        let err = resolver
            .resolve(book, &filter(json!({ "author": { "nickname": "R" } })))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Person.nickname"));
    }
}
