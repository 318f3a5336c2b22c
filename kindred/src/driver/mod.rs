pub mod filter;
mod memory;
mod sqlite;

pub use memory::{CallCounts, IdStrategy, MemoryDriver};
pub use sqlite::SqliteDriver;

use crate::error::{KindredError, Result};
use crate::schema::{IndexDefinition, IndexKind, Model, ID_KEY};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// A stored document, keyed by storage keys.
pub type Document = serde_json::Map<String, Value>;

/// A filter containing only store-native values, see [`filter`].
pub type Filter = serde_json::Map<String, Value>;

/// The primitive contract every backing-store adapter implements.
///
/// Filters and documents use storage keys (field aliases). A missing document
/// is `Ok(None)` from `get`, never an error.
#[async_trait]
pub trait StoreDriver: Send + Sync {
    async fn get(&self, model: &Model, id: &Value) -> Result<Option<Document>>;

    async fn find(&self, model: &Model, filter: &Filter) -> Result<Vec<Document>>;

    async fn count(&self, model: &Model, filter: &Filter) -> Result<u64>;

    /// Store a new document, returning it with its generated id.
    async fn create(&self, model: &Model, data: Document) -> Result<Document>;

    /// Replace a document. Drivers may use the raw patch or the merged document.
    async fn replace(
        &self,
        model: &Model,
        id: &Value,
        patch: &Document,
        merged: Document,
    ) -> Result<Document>;

    /// Remove a document, returning the deleted snapshot.
    async fn delete(&self, model: &Model, id: &Value, last_known: &Document) -> Result<Document>;

    /// Idempotent.
    async fn create_indexes(&self, model: &Model, indexes: &[IndexDefinition]) -> Result<()>;

    /// Coerce a loosely-typed id into this store's native id type.
    fn id_value(&self, id: &Value) -> Result<Value>;
}

/// Routing table from store name to driver.
#[derive(Clone, Default)]
pub struct Stores {
    drivers: HashMap<String, Arc<dyn StoreDriver>>,
}

impl Stores {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, driver: Arc<dyn StoreDriver>) -> Self {
        self.insert(name, driver);
        self
    }

    pub fn insert(&mut self, name: &str, driver: Arc<dyn StoreDriver>) {
        self.drivers.insert(name.to_string(), driver);
    }

    pub fn driver(&self, name: &str) -> Result<&Arc<dyn StoreDriver>> {
        self.drivers
            .get(name)
            .ok_or_else(|| KindredError::Schema(format!("Store '{name}' is not configured")))
    }

    pub fn for_model(&self, model: &Model) -> Result<&Arc<dyn StoreDriver>> {
        self.driver(&model.store)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.drivers.keys().map(String::as_str)
    }
}

/// Fail when `candidate` collides with another document on a unique index.
pub(crate) fn check_unique<'a>(
    model: &Model,
    indexes: &[IndexDefinition],
    existing: impl Iterator<Item = &'a Document> + Clone,
    candidate: &Document,
) -> Result<()> {
    for index in indexes.iter().filter(|i| i.kind == IndexKind::Unique) {
        let keys: Vec<&str> = index
            .fields
            .iter()
            .map(|name| model.field(name).map(|f| f.key.as_str()).unwrap_or(name))
            .collect();
        let values: Vec<Option<&Value>> = keys.iter().map(|k| candidate.get(*k)).collect();
        if values.iter().all(|v| matches!(v, None | Some(Value::Null))) {
            continue;
        }

        let conflict = existing.clone().any(|doc| {
            doc.get(ID_KEY) != candidate.get(ID_KEY)
                && keys.iter().zip(&values).all(|(k, v)| doc.get(*k) == *v)
        });
        if conflict {
            return Err(KindredError::Store(format!(
                "Duplicate key for unique index '{}' on {}",
                index.name, model.name
            )));
        }
    }
    Ok(())
}
