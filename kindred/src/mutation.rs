//! Create, update and delete orchestration.
//!
//! Every write runs the same pipeline: shape and normalize the input,
//! validate it (rules, then reference existence), fire `pre` hooks, write,
//! clear the request loader, hydrate the result and fire `post` hooks.
//! Nothing is written until every check and every `pre` hook has passed.

use crate::driver::{Document, Filter};
use crate::error::{KindredError, Result};
use crate::events::{Hooks, Operation, PostMutation, PreMutation};
use crate::guid;
use crate::hydrate::{HydratedDocument, Hydrator};
use crate::loader::Loader;
use crate::normalize::{dedupe, ensure_model_array_types, normalize_model_data};
use crate::query::Selection;
use crate::schema::{Field, Model, OnDeletePolicy, SchemaRegistry, TransformSpec, ID_KEY};
use crate::validation::validate_model_data;
use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use std::collections::{HashMap, HashSet};

pub struct Mutator<'a> {
    registry: &'a SchemaRegistry,
    loader: &'a Loader,
    hooks: &'a Hooks,
}

/// Everything one delete will touch, gathered before any write.
#[derive(Default)]
struct DeletePlan<'a> {
    seen: HashSet<String>,
    /// Dependents first, the requested document last.
    deletes: Vec<(&'a Model, Value, Document)>,
    nullify: Vec<(&'a Model, &'a Field, Document)>,
}

impl<'a> Mutator<'a> {
    pub fn new(registry: &'a SchemaRegistry, loader: &'a Loader, hooks: &'a Hooks) -> Self {
        Mutator {
            registry,
            loader,
            hooks,
        }
    }

    pub async fn create(
        &self,
        model: &'a Model,
        data: Document,
        selection: &Selection,
    ) -> Result<HydratedDocument> {
        let mut shaped = data.clone();
        ensure_model_array_types(self.registry, model, &mut shaped);
        let normalized = normalize_model_data(self.registry, self.loader.stores(), model, &shaped)?;
        validate_model_data(self.registry, self.loader, model, &normalized, None, Operation::Create)
            .await?;

        self.hooks.emit_pre(&PreMutation {
            operation: Operation::Create,
            model: &model.name,
            id: normalized.get(ID_KEY),
            input: &data,
            at: Utc::now(),
        })?;

        let driver = self.loader.stores().for_model(model)?;
        let created = driver.create(model, normalized).await?;
        log::debug!(
            "created {}/{}",
            model.name,
            created.get(ID_KEY).unwrap_or(&Value::Null)
        );
        self.finish(Operation::Create, model, created, selection).await
    }

    pub async fn update(
        &self,
        model: &'a Model,
        id: &Value,
        patch: Document,
        selection: &Selection,
    ) -> Result<HydratedDocument> {
        let driver = self.loader.stores().for_model(model)?;
        let id = driver.id_value(id)?;
        let current = self
            .loader
            .get(model, &id)
            .await?
            .ok_or_else(|| KindredError::not_found(&model.name, &id))?;

        let mut shaped = patch.clone();
        if let Some(new_id) = shaped.remove(ID_KEY) {
            if !new_id.is_null() && driver.id_value(&new_id)? != id {
                return Err(KindredError::validation(model.path(ID_KEY), "is immutable"));
            }
        }
        ensure_model_array_types(self.registry, model, &mut shaped);
        let normalized = normalize_model_data(self.registry, self.loader.stores(), model, &shaped)?;
        validate_model_data(
            self.registry,
            self.loader,
            model,
            &normalized,
            Some(&current),
            Operation::Update,
        )
        .await?;

        self.hooks.emit_pre(&PreMutation {
            operation: Operation::Update,
            model: &model.name,
            id: Some(&id),
            input: &patch,
            at: Utc::now(),
        })?;

        let merged = merge_document(self.registry, model, current, &normalized);
        let updated = driver.replace(model, &id, &normalized, merged).await?;
        log::debug!("replaced {}/{id}", model.name);
        self.finish(Operation::Update, model, updated, selection).await
    }

    /// Delete a document, applying every `onDelete` policy that points at it.
    pub async fn delete(
        &self,
        model: &'a Model,
        id: &Value,
        selection: &Selection,
    ) -> Result<HydratedDocument> {
        let id = self.loader.stores().for_model(model)?.id_value(id)?;
        let current = self
            .loader
            .get(model, &id)
            .await?
            .ok_or_else(|| KindredError::not_found(&model.name, &id))?;

        let mut plan = DeletePlan::default();
        plan.seen.insert(guid::encode(&model.name, &id));
        self.plan_delete(model, id, current, &mut plan).await?;

        for (target, target_id, last_known) in &plan.deletes {
            self.hooks.emit_pre(&PreMutation {
                operation: Operation::Delete,
                model: &target.name,
                id: Some(target_id),
                input: last_known,
                at: Utc::now(),
            })?;
        }

        for (dependent, row_id, row, fields) in nullify_groups(&plan) {
            self.nullify(dependent, &fields, row, row_id, &plan).await?;
        }

        let mut deleted = Vec::with_capacity(plan.deletes.len());
        for (target, target_id, last_known) in &plan.deletes {
            let driver = self.loader.stores().for_model(target)?;
            let snapshot = driver.delete(target, target_id, last_known).await?;
            log::debug!("deleted {}/{target_id}", target.name);
            deleted.push((*target, snapshot));
        }
        self.loader.clear();

        let empty = Selection::new();
        let last = deleted.len().saturating_sub(1);
        let mut result = None;
        for (i, (target, snapshot)) in deleted.into_iter().enumerate() {
            let selection = if i == last { selection } else { &empty };
            let doc = Hydrator::new(self.registry, self.loader)
                .hydrate(target, snapshot, selection)
                .await?;
            self.hooks.emit_post(&PostMutation {
                operation: Operation::Delete,
                model: &target.name,
                result: &doc,
                at: Utc::now(),
            });
            result = Some(doc);
        }
        result.ok_or_else(|| KindredError::not_found(&model.name, &Value::Null))
    }

    /// Walk the documents referencing `model/id`, failing on `restrict` and
    /// scheduling cascades and nullifications.
    fn plan_delete<'s>(
        &'s self,
        model: &'a Model,
        id: Value,
        current: Document,
        plan: &'s mut DeletePlan<'a>,
    ) -> BoxFuture<'s, Result<()>> {
        async move {
            for (dependent, field) in self.registry.references_to(&model.name) {
                let Some(policy) = field.on_delete else { continue };
                let mut filter = Filter::new();
                filter.insert(field.key.clone(), id.clone());
                let rows = self.loader.find(dependent, &filter).await?;
                if rows.is_empty() {
                    continue;
                }
                match policy {
                    OnDeletePolicy::Restrict => {
                        return Err(KindredError::ReferentialIntegrity(format!(
                            "{}/{id} is still referenced by {} document(s) through {}",
                            model.name,
                            rows.len(),
                            dependent.path(&field.name)
                        )));
                    }
                    OnDeletePolicy::Cascade => {
                        for row in rows.iter() {
                            let Some(row_id) = row.get(ID_KEY) else { continue };
                            if plan.seen.insert(guid::encode(&dependent.name, row_id)) {
                                self.plan_delete(dependent, row_id.clone(), row.clone(), plan)
                                    .await?;
                            }
                        }
                    }
                    OnDeletePolicy::Nullify => {
                        for row in rows.iter() {
                            plan.nullify.push((dependent, field, row.clone()));
                        }
                    }
                }
            }
            plan.deletes.push((model, id, current));
            Ok(())
        }
        .boxed()
    }

    /// Clear every reference `row` holds to a planned delete with one write.
    async fn nullify(
        &self,
        dependent: &'a Model,
        fields: &[&'a Field],
        row: &Document,
        row_id: &Value,
        plan: &DeletePlan<'a>,
    ) -> Result<()> {
        let mut patch = Document::new();
        for field in fields {
            let removed: Vec<&Value> = plan
                .deletes
                .iter()
                .filter(|(target, _, _)| field.reference() == Some(target.name.as_str()))
                .map(|(_, id, _)| id)
                .collect();
            let value = match row.get(&field.key) {
                Some(Value::Array(items)) => Value::Array(
                    items
                        .iter()
                        .filter(|item| !removed.contains(item))
                        .cloned()
                        .collect(),
                ),
                _ => Value::Null,
            };
            patch.insert(field.key.clone(), value);
        }

        let mut merged = row.clone();
        merged.extend(patch.clone());
        let driver = self.loader.stores().for_model(dependent)?;
        driver.replace(dependent, row_id, &patch, merged).await?;
        let keys: Vec<&str> = patch.keys().map(String::as_str).collect();
        log::debug!("cleared {} on {}/{row_id}", keys.join(", "), dependent.name);
        Ok(())
    }

    async fn finish(
        &self,
        operation: Operation,
        model: &'a Model,
        stored: Document,
        selection: &Selection,
    ) -> Result<HydratedDocument> {
        self.loader.clear();
        let doc = Hydrator::new(self.registry, self.loader)
            .hydrate(model, stored, selection)
            .await?;
        self.hooks.emit_post(&PostMutation {
            operation,
            model: &model.name,
            result: &doc,
            at: Utc::now(),
        });
        Ok(doc)
    }
}

/// Pending nullifications grouped per surviving row, in planning order.
fn nullify_groups<'p, 'a>(
    plan: &'p DeletePlan<'a>,
) -> Vec<(&'a Model, &'p Value, &'p Document, Vec<&'a Field>)> {
    let mut groups: Vec<(&'a Model, &'p Value, &'p Document, Vec<&'a Field>)> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for (dependent, field, row) in &plan.nullify {
        let Some(row_id) = row.get(ID_KEY) else { continue };
        let key = guid::encode(&dependent.name, row_id);
        if plan.seen.contains(&key) {
            continue;
        }
        match index.get(&key) {
            Some(&i) => {
                let fields = &mut groups[i].3;
                if !fields.iter().any(|f| f.name == field.name) {
                    fields.push(*field);
                }
            }
            None => {
                index.insert(key, groups.len());
                groups.push((*dependent, row_id, row, vec![*field]));
            }
        }
    }
    groups
}

/// Merge a normalized patch into the stored document.
///
/// Lists concatenate and are de-duplicated when the field asks for it;
/// single embedded objects merge key by key; everything else overwrites.
pub fn merge_document(
    registry: &SchemaRegistry,
    model: &Model,
    mut current: Document,
    patch: &Document,
) -> Document {
    for (key, value) in patch {
        let Some(field) = model.field_by_key(key) else {
            current.insert(key.clone(), value.clone());
            continue;
        };
        let merged = match (current.remove(key), value) {
            (Some(Value::Array(mut existing)), Value::Array(added)) => {
                existing.extend(added.iter().cloned());
                if field.unique || field.transforms.contains(&TransformSpec::Dedupe) {
                    existing = dedupe(existing);
                }
                Value::Array(existing)
            }
            (Some(Value::Object(existing)), Value::Object(added)) if field.embedded => {
                match registry.target(field) {
                    Ok(Some(target)) => Value::Object(merge_document(registry, target, existing, added)),
                    _ => Value::Object(added.clone()),
                }
            }
            (_, value) => value.clone(),
        };
        current.insert(key.clone(), merged);
    }
    current
}
