//! Request-scoped read cache.
//!
//! Every primitive read is keyed by a deterministic serialization of
//! (operation, model, canonical argument). Concurrent identical reads share
//! one store call; completed reads are served from memory until the loader is
//! cleared or dropped with its request.

use crate::driver::{Document, Filter, Stores};
use crate::error::Result;
use crate::schema::{Model, ID_KEY};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::OnceCell;

#[derive(Debug, Clone)]
enum Loaded {
    One(Option<Document>),
    Many(Arc<Vec<Document>>),
    Count(u64),
}

pub struct Loader {
    stores: Stores,
    cells: Mutex<HashMap<String, Arc<OnceCell<Loaded>>>>,
}

impl Loader {
    pub fn new(stores: Stores) -> Self {
        Loader {
            stores,
            cells: Mutex::new(HashMap::new()),
        }
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    pub async fn get(&self, model: &Model, id: &Value) -> Result<Option<Document>> {
        let driver = self.stores.for_model(model)?;
        let id = driver.id_value(id)?;
        let key = cache_key("get", model, &id)?;
        let loaded = self
            .load(key, || async {
                Ok(Loaded::One(driver.get(model, &id).await?))
            })
            .await?;
        match loaded {
            Loaded::One(doc) => Ok(doc),
            _ => Ok(None),
        }
    }

    pub async fn find(&self, model: &Model, filter: &Filter) -> Result<Arc<Vec<Document>>> {
        let driver = self.stores.for_model(model)?;
        let key = cache_key("find", model, filter)?;
        let loaded = self
            .load(key, || async {
                let rows = driver.find(model, filter).await?;
                self.prime(model, &rows)?;
                Ok(Loaded::Many(Arc::new(rows)))
            })
            .await?;
        match loaded {
            Loaded::Many(rows) => Ok(rows),
            _ => Ok(Arc::new(Vec::new())),
        }
    }

    pub async fn count(&self, model: &Model, filter: &Filter) -> Result<u64> {
        let driver = self.stores.for_model(model)?;
        let key = cache_key("count", model, filter)?;
        let loaded = self
            .load(key, || async {
                Ok(Loaded::Count(driver.count(model, filter).await?))
            })
            .await?;
        match loaded {
            Loaded::Count(n) => Ok(n),
            _ => Ok(0),
        }
    }

    /// Forget everything; called after writes.
    pub fn clear(&self) {
        self.cells().clear();
    }

    fn cells(&self) -> MutexGuard<'_, HashMap<String, Arc<OnceCell<Loaded>>>> {
        self.cells.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn load<F, Fut>(&self, key: String, fetch: F) -> Result<Loaded>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Loaded>>,
    {
        let cell = Arc::clone(self.cells().entry(key.clone()).or_default());
        if let Some(loaded) = cell.get() {
            log::debug!("loader hit {key}");
            return Ok(loaded.clone());
        }
        let loaded = cell.get_or_try_init(fetch).await?;
        Ok(loaded.clone())
    }

    /// Seed `get` entries with rows a `find` already returned.
    fn prime(&self, model: &Model, rows: &[Document]) -> Result<()> {
        let mut cells = self.cells();
        for row in rows {
            if let Some(id) = row.get(ID_KEY) {
                let key = cache_key("get", model, id)?;
                cells
                    .entry(key)
                    .or_insert_with(|| Arc::new(OnceCell::new_with(Some(Loaded::One(Some(row.clone()))))));
            }
        }
        Ok(())
    }
}

fn cache_key(operation: &str, model: &Model, argument: &impl serde::Serialize) -> Result<String> {
    Ok(format!(
        "{operation}:{}:{}:{}",
        model.store,
        model.name,
        serde_json::to_string(argument)?
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{MemoryDriver, StoreDriver};
    use crate::schema::SchemaRegistry;
    use serde_json::json;

    async fn setup() -> (Arc<MemoryDriver>, Loader, Model) {
        let registry =
            SchemaRegistry::from_yaml("models:\n  Person:\n    fields:\n      name: String\n", "default")
                .unwrap();
        let model = registry.model("Person").unwrap().clone();
        let driver = Arc::new(MemoryDriver::default());
        for name in ["Richard", "Christie"] {
            let mut doc = Document::new();
            doc.insert("name".into(), json!(name));
            driver.create(&model, doc).await.unwrap();
        }
        let loader = Loader::new(Stores::new().with("default", driver.clone()));
        (driver, loader, model)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_identical_finds_share_one_call() {
        let (driver, loader, model) = setup().await;
        let mut filter = Filter::new();
        filter.insert("name".into(), json!("Richard"));

        let (a, b) = tokio::join!(loader.find(&model, &filter), loader.find(&model, &filter));
        assert_eq!(a.unwrap().len(), 1);
        assert_eq!(b.unwrap().len(), 1);
        assert_eq!(driver.calls().find, 1);
    }

    #[tokio::test]
    async fn test_find_primes_gets_and_clear_forgets() {
        let (driver, loader, model) = setup().await;
        let rows = loader.find(&model, &Filter::new()).await.unwrap();
        let id = rows[0]["id"].clone();

        assert!(loader.get(&model, &id).await.unwrap().is_some());
        assert_eq!(driver.calls().get, 0);

        loader.clear();
        assert!(loader.get(&model, &id).await.unwrap().is_some());
        assert_eq!(driver.calls().get, 1);
    }

    #[tokio::test]
    async fn test_count_is_cached() {
        let (driver, loader, model) = setup().await;
        assert_eq!(loader.count(&model, &Filter::new()).await.unwrap(), 2);
        assert_eq!(loader.count(&model, &Filter::new()).await.unwrap(), 2);
        assert_eq!(driver.calls().count, 1);
    }
}
