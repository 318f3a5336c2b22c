use super::{check_unique, filter, Document, Filter, StoreDriver};
use crate::error::{KindredError, Result};
use crate::schema::{IndexDefinition, Model, ID_KEY};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Document store persisted in SQLite. Ids are integers allocated per model.
#[derive(Clone)]
pub struct SqliteDriver {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteDriver {
    /// Open or create the database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        Self::init(Connection::open(path)?)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS documents (
                model TEXT NOT NULL,
                id INTEGER NOT NULL,
                data_json TEXT NOT NULL,
                PRIMARY KEY (model, id)
            );

            CREATE TABLE IF NOT EXISTS indexes (
                model TEXT NOT NULL,
                name TEXT NOT NULL,
                definition_json TEXT NOT NULL,
                PRIMARY KEY (model, name)
            );
            ",
        )?;
        Ok(SqliteDriver {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a blocking closure against the connection off the async executor.
    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            f(&guard)
        })
        .await
        .map_err(|e| KindredError::Store(format!("SQLite task failed: {e}")))?
    }

    fn native_id(&self, id: &Value) -> Result<i64> {
        self.id_value(id)?
            .as_i64()
            .ok_or_else(|| KindredError::validation(ID_KEY, format!("{id} is not a valid id")))
    }
}

fn load_rows(conn: &Connection, model: &str) -> Result<Vec<Document>> {
    let mut stmt =
        conn.prepare("SELECT id, data_json FROM documents WHERE model = ?1 ORDER BY id")?;
    let rows = stmt.query_map(params![model], |row| {
        Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
    })?;

    let mut docs = Vec::new();
    for row in rows {
        let (id, json) = row?;
        docs.push(to_document(id, &json)?);
    }
    Ok(docs)
}

fn load_row(conn: &Connection, model: &str, id: i64) -> Result<Option<Document>> {
    let json: Option<String> = conn
        .query_row(
            "SELECT data_json FROM documents WHERE model = ?1 AND id = ?2",
            params![model, id],
            |row| row.get(0),
        )
        .optional()?;
    json.map(|json| to_document(id, &json)).transpose()
}

fn load_indexes(conn: &Connection, model: &str) -> Result<Vec<IndexDefinition>> {
    let mut stmt = conn.prepare("SELECT definition_json FROM indexes WHERE model = ?1")?;
    let rows = stmt.query_map(params![model], |row| row.get::<_, String>(0))?;
    let mut indexes = Vec::new();
    for row in rows {
        indexes.push(serde_json::from_str(&row?)?);
    }
    Ok(indexes)
}

fn to_document(id: i64, json: &str) -> Result<Document> {
    let mut doc: Document = serde_json::from_str(json)?;
    doc.insert(ID_KEY.to_string(), Value::from(id));
    Ok(doc)
}

fn to_json(doc: &Document) -> Result<String> {
    let mut data = doc.clone();
    data.remove(ID_KEY);
    Ok(serde_json::to_string(&data)?)
}

#[async_trait]
impl StoreDriver for SqliteDriver {
    async fn get(&self, model: &Model, id: &Value) -> Result<Option<Document>> {
        let id = self.native_id(id)?;
        let name = model.name.clone();
        self.run(move |conn| load_row(conn, &name, id)).await
    }

    async fn find(&self, model: &Model, filter: &Filter) -> Result<Vec<Document>> {
        let name = model.name.clone();
        let filter = filter.clone();
        self.run(move |conn| {
            Ok(load_rows(conn, &name)?
                .into_iter()
                .filter(|doc| filter::matches(doc, &filter))
                .collect())
        })
        .await
    }

    async fn count(&self, model: &Model, filter: &Filter) -> Result<u64> {
        Ok(self.find(model, filter).await?.len() as u64)
    }

    async fn create(&self, model: &Model, data: Document) -> Result<Document> {
        let requested = match data.get(ID_KEY) {
            Some(id) if !id.is_null() => Some(self.native_id(id)?),
            _ => None,
        };
        let model = model.clone();
        self.run(move |conn| {
            let id = match requested {
                Some(id) => id,
                None => conn.query_row(
                    "SELECT COALESCE(MAX(id), 0) + 1 FROM documents WHERE model = ?1",
                    params![model.name],
                    |row| row.get(0),
                )?,
            };
            let mut doc = data;
            doc.insert(ID_KEY.to_string(), Value::from(id));

            let existing = load_rows(conn, &model.name)?;
            if existing.iter().any(|d| d.get(ID_KEY) == doc.get(ID_KEY)) {
                return Err(KindredError::Store(format!(
                    "Duplicate id {id} for {}",
                    model.name
                )));
            }
            check_unique(&model, &load_indexes(conn, &model.name)?, existing.iter(), &doc)?;

            conn.execute(
                "INSERT INTO documents (model, id, data_json) VALUES (?1, ?2, ?3)",
                params![model.name, id, to_json(&doc)?],
            )?;
            Ok(doc)
        })
        .await
    }

    async fn replace(
        &self,
        model: &Model,
        id: &Value,
        _patch: &Document,
        merged: Document,
    ) -> Result<Document> {
        let id = self.native_id(id)?;
        let model = model.clone();
        self.run(move |conn| {
            let mut doc = merged;
            doc.insert(ID_KEY.to_string(), Value::from(id));
            let existing = load_rows(conn, &model.name)?;
            check_unique(&model, &load_indexes(conn, &model.name)?, existing.iter(), &doc)?;

            let changed = conn.execute(
                "UPDATE documents SET data_json = ?3 WHERE model = ?1 AND id = ?2",
                params![model.name, id, to_json(&doc)?],
            )?;
            if changed == 0 {
                return Err(KindredError::not_found(&model.name, &Value::from(id)));
            }
            Ok(doc)
        })
        .await
    }

    async fn delete(&self, model: &Model, id: &Value, last_known: &Document) -> Result<Document> {
        let id = self.native_id(id)?;
        let name = model.name.clone();
        let last_known = last_known.clone();
        self.run(move |conn| {
            let snapshot = load_row(conn, &name, id)?.unwrap_or(last_known);
            let changed = conn.execute(
                "DELETE FROM documents WHERE model = ?1 AND id = ?2",
                params![name, id],
            )?;
            if changed == 0 {
                return Err(KindredError::not_found(&name, &Value::from(id)));
            }
            Ok(snapshot)
        })
        .await
    }

    async fn create_indexes(&self, model: &Model, indexes: &[IndexDefinition]) -> Result<()> {
        let name = model.name.clone();
        let indexes = indexes.to_vec();
        self.run(move |conn| {
            for index in &indexes {
                conn.execute(
                    "INSERT OR REPLACE INTO indexes (model, name, definition_json) VALUES (?1, ?2, ?3)",
                    params![name, index.name, serde_json::to_string(index)?],
                )?;
            }
            Ok(())
        })
        .await
    }

    fn id_value(&self, id: &Value) -> Result<Value> {
        let native = match id {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse::<i64>().ok(),
            _ => None,
        };
        native
            .map(Value::from)
            .ok_or_else(|| KindredError::validation(ID_KEY, format!("{id} is not a valid id")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaRegistry;
    use serde_json::json;
    use tempfile::TempDir;

    fn book() -> Model {
        let registry = SchemaRegistry::from_yaml(
            r#"
models:
  Book:
    indexes:
      - { name: book_isbn, type: unique, fields: [isbn] }
    fields:
      name: String
      isbn: String
"#,
            "default",
        )
        .unwrap();
        registry.model("Book").unwrap().clone()
    }

    fn data(value: serde_json::Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_integer_ids_and_string_coercion() {
        let driver = SqliteDriver::open_in_memory().unwrap();
        let model = book();
        let first = driver
            .create(&model, data(json!({ "name": "Dune" })))
            .await
            .unwrap();
        let second = driver
            .create(&model, data(json!({ "name": "Emma" })))
            .await
            .unwrap();
        assert_eq!(first["id"], json!(1));
        assert_eq!(second["id"], json!(2));

        let fetched = driver.get(&model, &json!("2")).await.unwrap().unwrap();
        assert_eq!(fetched["name"], "Emma");
        assert!(driver.id_value(&json!("abc")).is_err());
    }

    #[tokio::test]
    async fn test_find_replace_delete() {
        let driver = SqliteDriver::open_in_memory().unwrap();
        let model = book();
        let created = driver
            .create(&model, data(json!({ "name": "Dune" })))
            .await
            .unwrap();
        let id = created["id"].clone();

        let filter = data(json!({ "name": ["Dune", "Emma"] }));
        assert_eq!(driver.count(&model, &filter).await.unwrap(), 1);

        let updated = driver
            .replace(&model, &id, &Document::new(), data(json!({ "name": "Dune Messiah" })))
            .await
            .unwrap();
        assert_eq!(updated["id"], id);

        let deleted = driver.delete(&model, &id, &updated).await.unwrap();
        assert_eq!(deleted["name"], "Dune Messiah");
        assert!(driver.get(&model, &id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_persists_indexes_across_reopen() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("store.db");
        let model = book();
        {
            let driver = SqliteDriver::open(&path).unwrap();
            driver.create_indexes(&model, &model.indexes).await.unwrap();
            driver.create_indexes(&model, &model.indexes).await.unwrap();
            driver
                .create(&model, data(json!({ "isbn": "123" })))
                .await
                .unwrap();
        }

        let driver = SqliteDriver::open(&path).unwrap();
        let err = driver
            .create(&model, data(json!({ "isbn": "123" })))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("book_isbn"));
    }
}
