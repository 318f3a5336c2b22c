//! Hydration: turning stored rows into nested result documents.
//!
//! Sibling relations and counts of one document, and every document of a
//! result set, are resolved concurrently through the request loader.

use crate::driver::{filter, Document, Filter};
use crate::error::{KindredError, Result};
use crate::guid;
use crate::loader::Loader;
use crate::query::Selection;
use crate::resolver::Resolver;
use crate::schema::{Field, Model, SchemaRegistry, ID_KEY};
use futures::future::{join_all, try_join_all, BoxFuture};
use futures::FutureExt;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Key under which the guid appears in JSON output.
pub const GUID_KEY: &str = "$id";

/// A resolved result document.
///
/// Stored values stay under their logical names in `fields`; resolved
/// relations and counts live in their own slots so both remain visible.
#[derive(Debug, Clone, PartialEq)]
pub struct HydratedDocument {
    pub model: String,
    /// Native id; null for embedded documents.
    pub id: Value,
    /// `None` for embedded documents, which are not addressable.
    pub guid: Option<String>,
    pub fields: Document,
    pub relations: BTreeMap<String, Relation>,
    pub counts: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Relation {
    One(Option<Box<HydratedDocument>>),
    Many(Vec<HydratedDocument>),
}

impl Relation {
    pub fn documents(&self) -> Vec<&HydratedDocument> {
        match self {
            Relation::One(doc) => doc.iter().map(|d| &**d).collect(),
            Relation::Many(docs) => docs.iter().collect(),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Relation::One(None) => Value::Null,
            Relation::One(Some(doc)) => doc.to_json(),
            Relation::Many(docs) => Value::Array(docs.iter().map(HydratedDocument::to_json).collect()),
        }
    }
}

impl HydratedDocument {
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn relation(&self, field: &str) -> Option<&Relation> {
        self.relations.get(field)
    }

    pub fn count(&self, name: &str) -> Option<u64> {
        self.counts.get(name).copied()
    }

    /// Values reachable at `path`, following relations and counts.
    pub fn values_at(&self, path: &[String]) -> Vec<Value> {
        let Some((first, rest)) = path.split_first() else {
            return Vec::new();
        };
        if let Some(count) = self.counts.get(first) {
            return if rest.is_empty() { vec![Value::from(*count)] } else { Vec::new() };
        }
        if rest.is_empty() {
            if first == ID_KEY {
                return vec![self.id.clone()];
            }
            return self.fields.get(first).cloned().into_iter().collect();
        }
        if let Some(relation) = self.relations.get(first) {
            return relation
                .documents()
                .into_iter()
                .flat_map(|doc| doc.values_at(rest))
                .collect();
        }
        match self.fields.get(first) {
            Some(Value::Object(inner)) => filter::lookup(inner, &rest.join("."))
                .cloned()
                .into_iter()
                .collect(),
            _ => Vec::new(),
        }
    }

    /// JSON shape: stored fields, `id`, `$id`, relations under `$<field>`
    /// and counts under their `count<Field>` names.
    pub fn to_json(&self) -> Value {
        let mut out = self.fields.clone();
        if !self.id.is_null() {
            out.insert(ID_KEY.to_string(), self.id.clone());
        }
        if let Some(guid) = &self.guid {
            out.insert(GUID_KEY.to_string(), Value::String(guid.clone()));
        }
        for (name, relation) in &self.relations {
            out.insert(format!("${name}"), relation.to_json());
        }
        for (name, count) in &self.counts {
            out.insert(name.clone(), Value::from(*count));
        }
        Value::Object(out)
    }
}

enum Computed {
    Relation(String, Relation),
    Count(String, u64),
}

pub struct Hydrator<'a> {
    registry: &'a SchemaRegistry,
    loader: &'a Loader,
}

impl<'a> Hydrator<'a> {
    pub fn new(registry: &'a SchemaRegistry, loader: &'a Loader) -> Self {
        Hydrator { registry, loader }
    }

    pub fn hydrate<'b>(
        &'b self,
        model: &'a Model,
        row: Document,
        selection: &'b Selection,
    ) -> BoxFuture<'b, Result<HydratedDocument>> {
        self.hydrate_row(model, row, selection, true)
    }

    pub async fn hydrate_many(
        &self,
        model: &'a Model,
        rows: Vec<Document>,
        selection: &Selection,
    ) -> Result<Vec<HydratedDocument>> {
        try_join_all(rows.into_iter().map(|row| self.hydrate(model, row, selection))).await
    }

    fn hydrate_row<'b>(
        &'b self,
        model: &'a Model,
        mut row: Document,
        selection: &'b Selection,
        addressable: bool,
    ) -> BoxFuture<'b, Result<HydratedDocument>> {
        async move {
            check_selection(model, selection)?;

            let id = if addressable {
                row.remove(ID_KEY).unwrap_or(Value::Null)
            } else {
                Value::Null
            };
            let guid = (addressable && !id.is_null()).then(|| guid::encode(&model.name, &id));

            let mut fields = Map::new();
            for field in model.fields.iter().filter(|f| !f.is_virtual()) {
                if let Some(value) = row.get(&field.key) {
                    fields.insert(field.name.clone(), value.clone());
                }
            }

            let mut pending: Vec<BoxFuture<'_, Result<Computed>>> = Vec::new();
            for (name, sub) in &selection.fields {
                if let Some(field) = model.field(name) {
                    if field.reference().is_some() {
                        let (row, id) = (&row, &id);
                        pending.push(
                            async move {
                                let relation = self.relation(model, field, row, id, sub).await?;
                                Ok(Computed::Relation(name.clone(), relation))
                            }
                            .boxed(),
                        );
                    }
                } else if let Some(field) = model.count_field(name) {
                    let (row, id) = (&row, &id);
                    pending.push(
                        async move {
                            let count = self.count(field, row, id, sub).await?;
                            Ok(Computed::Count(name.clone(), count))
                        }
                        .boxed(),
                    );
                }
            }

            let mut relations = BTreeMap::new();
            let mut counts = BTreeMap::new();
            for computed in try_join_all(pending).await? {
                match computed {
                    Computed::Relation(name, relation) => {
                        relations.insert(name, relation);
                    }
                    Computed::Count(name, count) => {
                        counts.insert(name, count);
                    }
                }
            }

            Ok(HydratedDocument {
                model: model.name.clone(),
                id,
                guid,
                fields,
                relations,
                counts,
            })
        }
        .boxed()
    }

    async fn relation(
        &self,
        parent: &'a Model,
        field: &'a Field,
        row: &Document,
        id: &Value,
        selection: &Selection,
    ) -> Result<Relation> {
        let Some(target) = self.registry.target(field)? else {
            return Ok(Relation::One(None));
        };
        let stored = row.get(&field.key).unwrap_or(&Value::Null);

        if field.embedded {
            return match stored {
                Value::Array(items) => {
                    let docs = try_join_all(items.iter().filter_map(Value::as_object).map(|item| {
                        self.hydrate_row(target, item.clone(), selection, false)
                    }))
                    .await?;
                    Ok(Relation::Many(docs))
                }
                Value::Object(item) => {
                    let doc = self.hydrate_row(target, item.clone(), selection, false).await?;
                    Ok(Relation::One(Some(Box::new(doc))))
                }
                _ => Ok(empty(field)),
            };
        }

        if let Some(by) = &field.by {
            if id.is_null() {
                return Ok(empty(field));
            }
            let mut where_ = selection.filter.clone().unwrap_or_default();
            where_.insert(by.clone(), id.clone());
            let rows = self.find(target, &where_).await?;
            return if field.is_array() {
                Ok(Relation::Many(self.hydrate_many(target, rows, selection).await?))
            } else {
                match rows.into_iter().next() {
                    Some(row) => {
                        let doc = self.hydrate(target, row, selection).await?;
                        Ok(Relation::One(Some(Box::new(doc))))
                    }
                    None => Ok(Relation::One(None)),
                }
            };
        }

        if field.is_array() {
            let ids = id_list(stored);
            let rows = match &selection.filter {
                None => {
                    let found = join_all(ids.iter().map(|ref_id| self.loader.get(target, ref_id))).await;
                    let mut rows = Vec::with_capacity(found.len());
                    for (ref_id, result) in ids.iter().zip(found) {
                        match result? {
                            Some(row) => rows.push(row),
                            None => log::debug!("dropping missing {}/{ref_id} from {} of {id}", target.name, field.name),
                        }
                    }
                    rows
                }
                Some(extra) => {
                    let mut where_ = extra.clone();
                    where_.insert(ID_KEY.to_string(), Value::Array(ids.clone()));
                    let mut rows = self.find(target, &where_).await?;
                    // Keep the order the ids are stored in, not the store's.
                    rows.sort_by_key(|row| {
                        row.get(ID_KEY)
                            .and_then(|row_id| ids.iter().position(|id| filter::values_equal(id, row_id)))
                            .unwrap_or(usize::MAX)
                    });
                    rows
                }
            };
            return Ok(Relation::Many(self.hydrate_many(target, rows, selection).await?));
        }

        if stored.is_null() {
            return Ok(Relation::One(None));
        }
        match self.loader.get(target, stored).await? {
            Some(row) => {
                let doc = self.hydrate(target, row, selection).await?;
                Ok(Relation::One(Some(Box::new(doc))))
            }
            None if field.required => Err(KindredError::not_found_at(
                parent.path(&field.name),
                &target.name,
                stored,
            )),
            None => {
                log::warn!("{} of {id} points at missing {}/{stored}", field.name, target.name);
                Ok(Relation::One(None))
            }
        }
    }

    async fn count(&self, field: &'a Field, row: &Document, id: &Value, selection: &Selection) -> Result<u64> {
        let Some(target) = self.registry.target(field)? else {
            return Ok(0);
        };
        if let Some(by) = &field.by {
            if id.is_null() {
                return Ok(0);
            }
            let mut where_ = selection.filter.clone().unwrap_or_default();
            where_.insert(by.clone(), id.clone());
            let primitive = Resolver::new(self.registry, self.loader).resolve(target, &where_).await?;
            return self.loader.count(target, &primitive).await;
        }

        let ids = id_list(row.get(&field.key).unwrap_or(&Value::Null));
        match &selection.filter {
            None => Ok(ids.len() as u64),
            Some(extra) => {
                let mut where_ = extra.clone();
                where_.insert(ID_KEY.to_string(), Value::Array(ids));
                let primitive = Resolver::new(self.registry, self.loader).resolve(target, &where_).await?;
                self.loader.count(target, &primitive).await
            }
        }
    }

    async fn find(&self, model: &'a Model, where_: &Filter) -> Result<Vec<Document>> {
        let primitive = Resolver::new(self.registry, self.loader).resolve(model, where_).await?;
        Ok(self.loader.find(model, &primitive).await?.as_ref().clone())
    }
}

/// Reject selection names that are neither fields nor counts of `model`.
fn check_selection(model: &Model, selection: &Selection) -> Result<()> {
    for name in selection.fields.keys() {
        let known = name == ID_KEY
            || name == GUID_KEY
            || model.field(name).is_some()
            || model.count_field(name).is_some();
        if !known {
            return Err(KindredError::validation(model.path(name), "cannot be selected"));
        }
    }
    Ok(())
}

fn empty(field: &Field) -> Relation {
    if field.is_array() {
        Relation::Many(Vec::new())
    } else {
        Relation::One(None)
    }
}

fn id_list(stored: &Value) -> Vec<Value> {
    match stored {
        Value::Array(items) => items.iter().filter(|v| !v.is_null()).cloned().collect(),
        Value::Null => Vec::new(),
        other => vec![other.clone()],
    }
}
