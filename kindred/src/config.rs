//! Engine configuration (`kindred.yaml`).

use crate::driver::{IdStrategy, MemoryDriver, SqliteDriver, StoreDriver, Stores};
use crate::error::{KindredError, Result};
use crate::schema::SchemaRegistry;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const IN_MEMORY: &str = ":memory:";

fn default_store_name() -> String {
    "default".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KindredConfig {
    /// Schema file, relative to the config file.
    pub schema: PathBuf,
    #[serde(default = "default_store_name")]
    pub default_store: String,
    #[serde(default)]
    pub stores: BTreeMap<String, StoreConfig>,
    /// Directory relative paths resolve against.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreConfig {
    Memory {
        #[serde(default)]
        id: IdStrategy,
    },
    Sqlite {
        path: PathBuf,
    },
}

impl KindredConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config = Self::from_yaml_str(&content)?;
        config.base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Ok(config)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let mut config: KindredConfig = serde_yaml::from_str(content)?;
        if config.stores.is_empty() {
            config.stores.insert(
                config.default_store.clone(),
                StoreConfig::Memory {
                    id: IdStrategy::default(),
                },
            );
        }
        if !config.stores.contains_key(&config.default_store) {
            return Err(KindredError::Schema(format!(
                "Default store '{}' is not configured",
                config.default_store
            )));
        }
        Ok(config)
    }

    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    pub fn load_schema(&self) -> Result<SchemaRegistry> {
        let definition = crate::schema::parse_schema(&self.resolve(&self.schema))?;
        SchemaRegistry::from_definition(&definition, &self.default_store)
    }

    pub fn build_stores(&self) -> Result<Stores> {
        let mut stores = Stores::new();
        for (name, store) in &self.stores {
            let driver: Arc<dyn StoreDriver> = match store {
                StoreConfig::Memory { id } => Arc::new(MemoryDriver::new(*id)),
                StoreConfig::Sqlite { path } if path.as_os_str() == IN_MEMORY => {
                    Arc::new(SqliteDriver::open_in_memory()?)
                }
                StoreConfig::Sqlite { path } => Arc::new(SqliteDriver::open(&self.resolve(path))?),
            };
            log::debug!("configured store '{name}'");
            stores.insert(name, driver);
        }
        Ok(stores)
    }
}
