use super::{check_unique, filter, Document, Filter, StoreDriver};
use crate::error::{KindredError, Result};
use crate::schema::{IndexDefinition, Model, ID_KEY};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

/// How the memory driver generates ids
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdStrategy {
    #[default]
    Ulid,
    Uuid,
    Nanoid,
}

impl IdStrategy {
    fn generate(self) -> String {
        match self {
            IdStrategy::Ulid => ulid::Ulid::new().to_string().to_lowercase(),
            IdStrategy::Uuid => uuid::Uuid::new_v4().to_string(),
            IdStrategy::Nanoid => nanoid::nanoid!(),
        }
    }
}

/// Number of primitive calls a driver has served.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub get: usize,
    pub find: usize,
    pub count: usize,
    pub create: usize,
    pub replace: usize,
    pub delete: usize,
}

impl CallCounts {
    pub fn reads(&self) -> usize {
        self.get + self.find + self.count
    }

    pub fn writes(&self) -> usize {
        self.create + self.replace + self.delete
    }
}

#[derive(Default)]
struct Counters {
    get: AtomicUsize,
    find: AtomicUsize,
    count: AtomicUsize,
    create: AtomicUsize,
    replace: AtomicUsize,
    delete: AtomicUsize,
}

#[derive(Default)]
struct Tables {
    rows: HashMap<String, Vec<Document>>,
    indexes: HashMap<String, Vec<IndexDefinition>>,
}

/// In-memory key-value/document store. Rows keep insertion order.
#[derive(Default)]
pub struct MemoryDriver {
    ids: IdStrategy,
    tables: Mutex<Tables>,
    counters: Counters,
}

impl MemoryDriver {
    pub fn new(ids: IdStrategy) -> Self {
        MemoryDriver {
            ids,
            ..Self::default()
        }
    }

    /// Snapshot of the primitive calls served so far.
    pub fn calls(&self) -> CallCounts {
        CallCounts {
            get: self.counters.get.load(Ordering::SeqCst),
            find: self.counters.find.load(Ordering::SeqCst),
            count: self.counters.count.load(Ordering::SeqCst),
            create: self.counters.create.load(Ordering::SeqCst),
            replace: self.counters.replace.load(Ordering::SeqCst),
            delete: self.counters.delete.load(Ordering::SeqCst),
        }
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::SeqCst);
    }
}

fn position(rows: &[Document], id: &Value) -> Option<usize> {
    rows.iter().position(|row| row.get(ID_KEY) == Some(id))
}

#[async_trait]
impl StoreDriver for MemoryDriver {
    async fn get(&self, model: &Model, id: &Value) -> Result<Option<Document>> {
        Self::bump(&self.counters.get);
        let id = self.id_value(id)?;
        let tables = self.tables();
        Ok(tables
            .rows
            .get(&model.name)
            .and_then(|rows| position(rows, &id).map(|i| rows[i].clone())))
    }

    async fn find(&self, model: &Model, filter: &Filter) -> Result<Vec<Document>> {
        Self::bump(&self.counters.find);
        let tables = self.tables();
        Ok(tables
            .rows
            .get(&model.name)
            .map(|rows| {
                rows.iter()
                    .filter(|row| filter::matches(row, filter))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn count(&self, model: &Model, filter: &Filter) -> Result<u64> {
        Self::bump(&self.counters.count);
        let tables = self.tables();
        Ok(tables
            .rows
            .get(&model.name)
            .map(|rows| rows.iter().filter(|row| filter::matches(row, filter)).count() as u64)
            .unwrap_or(0))
    }

    async fn create(&self, model: &Model, mut data: Document) -> Result<Document> {
        Self::bump(&self.counters.create);
        let id = match data.get(ID_KEY) {
            Some(id) if !id.is_null() => self.id_value(id)?,
            _ => Value::String(self.ids.generate()),
        };
        data.insert(ID_KEY.to_string(), id.clone());

        let mut tables = self.tables();
        let indexes = tables.indexes.get(&model.name).cloned().unwrap_or_default();
        let rows = tables.rows.entry(model.name.clone()).or_default();
        if position(rows, &id).is_some() {
            return Err(KindredError::Store(format!(
                "Duplicate id {id} for {}",
                model.name
            )));
        }
        check_unique(model, &indexes, rows.iter(), &data)?;
        rows.push(data.clone());
        Ok(data)
    }

    async fn replace(
        &self,
        model: &Model,
        id: &Value,
        _patch: &Document,
        mut merged: Document,
    ) -> Result<Document> {
        Self::bump(&self.counters.replace);
        let id = self.id_value(id)?;
        merged.insert(ID_KEY.to_string(), id.clone());

        let mut tables = self.tables();
        let indexes = tables.indexes.get(&model.name).cloned().unwrap_or_default();
        let rows = tables
            .rows
            .get_mut(&model.name)
            .ok_or_else(|| KindredError::not_found(&model.name, &id))?;
        let index = position(rows, &id).ok_or_else(|| KindredError::not_found(&model.name, &id))?;
        check_unique(model, &indexes, rows.iter(), &merged)?;
        rows[index] = merged.clone();
        Ok(merged)
    }

    async fn delete(&self, model: &Model, id: &Value, _last_known: &Document) -> Result<Document> {
        Self::bump(&self.counters.delete);
        let id = self.id_value(id)?;
        let mut tables = self.tables();
        let rows = tables
            .rows
            .get_mut(&model.name)
            .ok_or_else(|| KindredError::not_found(&model.name, &id))?;
        let index = position(rows, &id).ok_or_else(|| KindredError::not_found(&model.name, &id))?;
        Ok(rows.remove(index))
    }

    async fn create_indexes(&self, model: &Model, indexes: &[IndexDefinition]) -> Result<()> {
        let mut tables = self.tables();
        let existing = tables.indexes.entry(model.name.clone()).or_default();
        for index in indexes {
            if !existing.iter().any(|i| i.name == index.name) {
                existing.push(index.clone());
            }
        }
        Ok(())
    }

    fn id_value(&self, id: &Value) -> Result<Value> {
        match id {
            Value::String(s) if !s.is_empty() => Ok(Value::String(s.clone())),
            Value::Number(n) => Ok(Value::String(n.to_string())),
            other => Err(KindredError::validation(
                ID_KEY,
                format!("{other} is not a valid id"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaRegistry;
    use serde_json::json;

    fn person() -> Model {
        let registry = SchemaRegistry::from_yaml(
            r#"
models:
  Person:
    indexes:
      - { name: person_email, type: unique, fields: [email] }
    fields:
      name: String
      email: { type: String, alias: email_address }
"#,
            "default",
        )
        .unwrap();
        registry.model("Person").unwrap().clone()
    }

    fn data(value: serde_json::Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_create_get_and_count_calls() {
        let driver = MemoryDriver::new(IdStrategy::Uuid);
        let model = person();
        let created = driver
            .create(&model, data(json!({ "name": "Richard" })))
            .await
            .unwrap();
        let id = created["id"].clone();
        assert!(id.is_string());

        let fetched = driver.get(&model, &id).await.unwrap().unwrap();
        assert_eq!(fetched["name"], "Richard");
        assert!(driver.get(&model, &json!("missing")).await.unwrap().is_none());

        let calls = driver.calls();
        assert_eq!(calls.create, 1);
        assert_eq!(calls.get, 2);
        assert_eq!(calls.writes(), 1);
    }

    #[tokio::test]
    async fn test_supplied_id_and_numeric_coercion() {
        let driver = MemoryDriver::default();
        let model = person();
        driver
            .create(&model, data(json!({ "id": 7, "name": "Christie" })))
            .await
            .unwrap();
        let fetched = driver.get(&model, &json!("7")).await.unwrap();
        assert!(fetched.is_some());
        assert!(driver
            .create(&model, data(json!({ "id": "7" })))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_unique_index_uses_storage_key() {
        let driver = MemoryDriver::default();
        let model = person();
        driver
            .create_indexes(&model, &model.indexes)
            .await
            .unwrap();
        driver
            .create_indexes(&model, &model.indexes)
            .await
            .unwrap();

        driver
            .create(&model, data(json!({ "email_address": "a@b.c" })))
            .await
            .unwrap();
        let err = driver
            .create(&model, data(json!({ "email_address": "a@b.c" })))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("person_email"));
    }

    #[tokio::test]
    async fn test_replace_and_delete_missing() {
        let driver = MemoryDriver::default();
        let model = person();
        let err = driver
            .replace(&model, &json!("nope"), &Document::new(), Document::new())
            .await
            .unwrap_err();
        assert!(matches!(err, KindredError::NotFound { .. }));
        assert!(driver
            .delete(&model, &json!("nope"), &Document::new())
            .await
            .is_err());
    }
}
