use super::field::Field;
use super::types::{IndexDefinition, ModelDefinition};
use crate::error::{KindredError, Result};

/// Key every store uses for a document's native id.
pub const ID_KEY: &str = "id";

/// A named collection of fields bound to one backing store.
#[derive(Debug, Clone)]
pub struct Model {
    pub name: String,
    pub store: String,
    pub fields: Vec<Field>,
    pub indexes: Vec<IndexDefinition>,
    pub hidden: bool,
}

impl Model {
    pub fn from_definition(name: &str, def: &ModelDefinition, default_store: &str) -> Result<Self> {
        let mut fields = Vec::with_capacity(def.fields.0.len());
        for (field_name, spec) in &def.fields.0 {
            if field_name == ID_KEY {
                return Err(KindredError::Schema(format!(
                    "Model '{name}' declares reserved field '{ID_KEY}'"
                )));
            }
            let field = Field::from_spec(field_name, spec).map_err(|e| match e {
                KindredError::Schema(msg) => KindredError::Schema(format!("{name}: {msg}")),
                other => other,
            })?;
            fields.push(field);
        }

        Ok(Model {
            name: name.to_string(),
            store: def.store.clone().unwrap_or_else(|| default_store.to_string()),
            fields,
            indexes: def.indexes.clone(),
            hidden: def.hide_from_api,
        })
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn field_by_key(&self, key: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.key == key)
    }

    /// Look up a field by logical name, failing with the model/field path.
    pub fn require_field(&self, name: &str) -> Result<&Field> {
        self.field(name)
            .ok_or_else(|| KindredError::validation(self.path(name), "unknown field"))
    }

    /// `Model.field` path used in error messages.
    pub fn path(&self, field: &str) -> String {
        format!("{}.{}", self.name, field)
    }

    pub fn scalar_fields(&self) -> impl Iterator<Item = &Field> {
        self.fields.iter().filter(|f| f.is_scalar())
    }

    pub fn reference_fields(&self) -> impl Iterator<Item = &Field> {
        self.fields.iter().filter(|f| f.is_direct_reference())
    }

    pub fn virtual_fields(&self) -> impl Iterator<Item = &Field> {
        self.fields.iter().filter(|f| f.is_virtual())
    }

    pub fn embedded_fields(&self) -> impl Iterator<Item = &Field> {
        self.fields.iter().filter(|f| f.embedded)
    }

    pub fn countable_fields(&self) -> impl Iterator<Item = &Field> {
        self.fields.iter().filter(|f| f.is_countable())
    }

    /// Resolve a `count<Field>` selection name to its countable field.
    pub fn count_field(&self, selection: &str) -> Option<&Field> {
        if !selection.starts_with("count") {
            return None;
        }
        self.countable_fields().find(|f| f.count_name() == selection)
    }
}
