//! Entry points: a process-wide [`Engine`] and request-scoped [`Request`]s.

use crate::config::KindredConfig;
use crate::driver::{filter, Document, Filter, Stores};
use crate::error::{KindredError, Result};
use crate::events::Hooks;
use crate::guid;
use crate::hydrate::{HydratedDocument, Hydrator};
use crate::loader::Loader;
use crate::mutation::Mutator;
use crate::query::{Pagination, Query, Selection, SortDirection, SortField};
use crate::resolver::Resolver;
use crate::schema::{Model, SchemaRegistry};
use serde_json::Value;
use std::cmp::Ordering;
use std::sync::Arc;

/// Shared, read-only after construction. Cheap to clone.
#[derive(Clone)]
pub struct Engine {
    registry: Arc<SchemaRegistry>,
    stores: Stores,
    hooks: Arc<Hooks>,
}

impl Engine {
    pub fn new(registry: SchemaRegistry, stores: Stores, hooks: Hooks) -> Result<Self> {
        for model in registry.models() {
            stores.for_model(model).map_err(|_| {
                KindredError::Schema(format!(
                    "Model '{}' uses store '{}', which is not configured",
                    model.name, model.store
                ))
            })?;
        }
        Ok(Engine {
            registry: Arc::new(registry),
            stores,
            hooks: Arc::new(hooks),
        })
    }

    /// Build registry and drivers from configuration and create indexes.
    pub async fn from_config(config: &KindredConfig, hooks: Hooks) -> Result<Self> {
        let engine = Engine::new(config.load_schema()?, config.build_stores()?, hooks)?;
        engine.ensure_indexes().await?;
        Ok(engine)
    }

    pub async fn ensure_indexes(&self) -> Result<()> {
        for model in self.registry.models().filter(|m| !m.indexes.is_empty()) {
            self.stores
                .for_model(model)?
                .create_indexes(model, &model.indexes)
                .await?;
            log::debug!("ensured {} index(es) on {}", model.indexes.len(), model.name);
        }
        Ok(())
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    /// Start a request with its own empty loader.
    pub fn request(&self) -> Request {
        Request {
            engine: self.clone(),
            loader: Loader::new(self.stores.clone()),
        }
    }
}

/// One logical request. Owns the loader; never shared between requests.
pub struct Request {
    engine: Engine,
    loader: Loader,
}

impl Request {
    pub fn loader(&self) -> &Loader {
        &self.loader
    }

    fn model(&self, name: &str) -> Result<&Model> {
        self.engine.registry.model(name)
    }

    fn hydrator(&self) -> Hydrator<'_> {
        Hydrator::new(&self.engine.registry, &self.loader)
    }

    fn mutator(&self) -> Mutator<'_> {
        Mutator::new(&self.engine.registry, &self.loader, &self.engine.hooks)
    }

    pub async fn get(
        &self,
        model: &str,
        id: &Value,
        required: bool,
        selection: &Selection,
    ) -> Result<Option<HydratedDocument>> {
        let model = self.model(model)?;
        match self.loader.get(model, id).await? {
            Some(row) => Ok(Some(self.hydrator().hydrate(model, row, selection).await?)),
            None if required => Err(KindredError::not_found(&model.name, id)),
            None => Ok(None),
        }
    }

    pub async fn get_by_guid(&self, guid: &str, selection: &Selection) -> Result<Option<HydratedDocument>> {
        let (model, id) = guid::decode(guid)?;
        self.get(&model, &Value::String(id), false, selection).await
    }

    pub async fn find(&self, model: &str, query: &Query) -> Result<Vec<HydratedDocument>> {
        let model = self.model(model)?;
        let primitive = Resolver::new(&self.engine.registry, &self.loader)
            .resolve(model, &query.where_)
            .await?;
        let rows = self.loader.find(model, &primitive).await?;
        let docs = self
            .hydrator()
            .hydrate_many(model, rows.as_ref().clone(), &query.select)
            .await?;

        let mut docs: Vec<HydratedDocument> = docs
            .into_iter()
            .filter(|doc| matches_counts(doc, &query.count_where))
            .collect();
        sort_documents(&mut docs, &query.sort);
        let mut docs = paginate(docs, &query.pagination)?;
        if let Some(limit) = query.limit {
            docs.truncate(limit);
        }
        Ok(docs)
    }

    pub async fn find_first(&self, model: &str, query: &Query) -> Result<Option<HydratedDocument>> {
        Ok(self.find(model, query).await?.into_iter().next())
    }

    /// Count matching documents. Count predicates force a hydrated find.
    pub async fn count(&self, model: &str, where_: &Filter) -> Result<u64> {
        let query = Query::new().with_where(where_.clone());
        if !query.count_where.is_empty() {
            return Ok(self.find(model, &query).await?.len() as u64);
        }
        let model = self.model(model)?;
        let primitive = Resolver::new(&self.engine.registry, &self.loader)
            .resolve(model, &query.where_)
            .await?;
        self.loader.count(model, &primitive).await
    }

    pub async fn create(&self, model: &str, data: Document, selection: &Selection) -> Result<HydratedDocument> {
        let model = self.model(model)?;
        self.mutator().create(model, data, selection).await
    }

    pub async fn update(
        &self,
        model: &str,
        id: &Value,
        patch: Document,
        selection: &Selection,
    ) -> Result<HydratedDocument> {
        let model = self.model(model)?;
        self.mutator().update(model, id, patch, selection).await
    }

    pub async fn delete(&self, model: &str, id: &Value, selection: &Selection) -> Result<HydratedDocument> {
        let model = self.model(model)?;
        self.mutator().delete(model, id, selection).await
    }
}

fn matches_counts(doc: &HydratedDocument, count_where: &Filter) -> bool {
    count_where.iter().all(|(path, condition)| {
        let path: Vec<String> = path.split('.').map(str::to_string).collect();
        let values = doc.values_at(&path);
        if values.is_empty() {
            return filter::matches_condition(None, condition);
        }
        values
            .iter()
            .any(|value| filter::matches_condition(Some(value), condition))
    })
}

fn sort_documents(docs: &mut [HydratedDocument], sort: &[SortField]) {
    if sort.is_empty() {
        return;
    }
    docs.sort_by(|a, b| {
        for field in sort {
            let left = a.values_at(&field.path).into_iter().next().unwrap_or(Value::Null);
            let right = b.values_at(&field.path).into_iter().next().unwrap_or(Value::Null);
            let ordering = filter::compare_values(&left, &right).unwrap_or(Ordering::Equal);
            let ordering = match field.direction {
                SortDirection::Asc => ordering,
                SortDirection::Desc => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
}

fn cursor_position(docs: &[HydratedDocument], cursor: &str) -> Result<usize> {
    docs.iter()
        .position(|doc| doc.guid.as_deref() == Some(cursor))
        .ok_or_else(|| KindredError::Query(format!("cursor '{cursor}' is not in the result set")))
}

fn paginate(mut docs: Vec<HydratedDocument>, page: &Pagination) -> Result<Vec<HydratedDocument>> {
    if let Some(before) = &page.before {
        let end = cursor_position(&docs, before)?;
        docs.truncate(end);
    }
    if let Some(after) = &page.after {
        let start = cursor_position(&docs, after)? + 1;
        docs.drain(..start);
    }
    if let Some(first) = page.first {
        docs.truncate(first);
    }
    if let Some(last) = page.last {
        let skip = docs.len().saturating_sub(last);
        docs.drain(..skip);
    }
    Ok(docs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::MemoryDriver;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn engine() -> Engine {
        let registry = SchemaRegistry::from_yaml(
            "models:\n  Person:\n    fields:\n      name: String\n      age: Number\n",
            "default",
        )
        .unwrap();
        let stores = Stores::new().with("default", Arc::new(MemoryDriver::default()));
        Engine::new(registry, stores, Hooks::new()).unwrap()
    }

    async fn seed(request: &Request) -> Vec<HydratedDocument> {
        let mut created = Vec::new();
        for (name, age) in [("Ada", 36), ("Richard", 52), ("Christie", 41), ("Bob", 41)] {
            let data = json!({ "name": name, "age": age }).as_object().cloned().unwrap();
            created.push(request.create("Person", data, &Selection::new()).await.unwrap());
        }
        created
    }

    fn names(docs: &[HydratedDocument]) -> Vec<String> {
        docs.iter()
            .map(|d| d.get("name").and_then(Value::as_str).unwrap_or_default().to_string())
            .collect()
    }

    #[test]
    fn test_missing_store_rejected() {
        let registry = SchemaRegistry::from_yaml(
            "models:\n  Person:\n    store: elsewhere\n    fields:\n      name: String\n",
            "default",
        )
        .unwrap();
        let err = Engine::new(registry, Stores::new(), Hooks::new()).err().unwrap();
        assert!(err.to_string().contains("elsewhere"));
    }

    #[tokio::test]
    async fn test_sort_with_tiebreak_and_cursors() {
        let request = engine().request();
        seed(&request).await;

        let query = Query::from_json(&json!({ "sort": [{ "age": "desc" }, { "name": "asc" }] })).unwrap();
        let sorted = request.find("Person", &query).await.unwrap();
        assert_eq!(names(&sorted), vec!["Richard", "Bob", "Christie", "Ada"]);

        let after = sorted[0].guid.clone().unwrap();
        let query = Query::from_json(&json!({
            "sort": [{ "age": "desc" }, { "name": "asc" }],
            "after": after,
            "first": 2
        }))
        .unwrap();
        assert_eq!(names(&request.find("Person", &query).await.unwrap()), vec!["Bob", "Christie"]);

        let query = Query::from_json(&json!({ "sort": { "name": "asc" }, "last": 1 })).unwrap();
        assert_eq!(names(&request.find("Person", &query).await.unwrap()), vec!["Richard"]);
    }

    #[tokio::test]
    async fn test_get_required_and_guid() {
        let request = engine().request();
        let created = seed(&request).await;
        let missing = request
            .get("Person", &json!("nope"), true, &Selection::new())
            .await
            .unwrap_err();
        assert_eq!(missing.kind(), crate::error::ErrorKind::NotFound);
        assert!(request
            .get("Person", &json!("nope"), false, &Selection::new())
            .await
            .unwrap()
            .is_none());

        let guid = created[1].guid.clone().unwrap();
        let found = request.get_by_guid(&guid, &Selection::new()).await.unwrap().unwrap();
        assert_eq!(found.get("name"), Some(&json!("Richard")));
    }

    #[tokio::test]
    async fn test_count_and_limit() {
        let request = engine().request();
        seed(&request).await;
        let where_ = json!({ "age": { "$gt": 40 } }).as_object().cloned().unwrap();
        assert_eq!(request.count("Person", &where_).await.unwrap(), 3);
        let query = Query::new().with_where(where_).limit(1);
        assert_eq!(request.find("Person", &query).await.unwrap().len(), 1);
    }
}
