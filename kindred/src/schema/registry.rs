use super::field::{Field, FieldType};
use super::model::Model;
use super::types::SchemaDefinition;
use crate::error::{KindredError, Result};
use crate::validation::Rule;
use std::collections::BTreeMap;

/// Holds every model definition. Read-only once shared.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    models: BTreeMap<String, Model>,
}

impl SchemaRegistry {
    /// Resolve a raw schema definition, checking every reference.
    pub fn from_definition(def: &SchemaDefinition, default_store: &str) -> Result<Self> {
        let mut models = BTreeMap::new();
        for (name, model_def) in &def.models {
            models.insert(
                name.clone(),
                Model::from_definition(name, model_def, default_store)?,
            );
        }

        let registry = SchemaRegistry { models };
        registry.check()?;
        Ok(registry)
    }

    pub fn from_yaml(content: &str, default_store: &str) -> Result<Self> {
        let def = super::parse_schema_str(content)?;
        Self::from_definition(&def, default_store)
    }

    fn check(&self) -> Result<()> {
        for model in self.models.values() {
            let mut keys = std::collections::HashSet::new();
            for field in &model.fields {
                if !keys.insert(field.key.as_str()) {
                    return Err(KindredError::Schema(format!(
                        "{} stores two fields under key '{}'",
                        model.name, field.key
                    )));
                }
                self.check_field(model, field)?;
            }
            for index in &model.indexes {
                for name in &index.fields {
                    if model.field(name).is_none() {
                        return Err(KindredError::Schema(format!(
                            "Index '{}' on {} names unknown field '{name}'",
                            index.name, model.name
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    fn check_field(&self, model: &Model, field: &Field) -> Result<()> {
        let path = model.path(&field.name);
        if let Some(target) = field.reference() {
            let target_model = self.models.get(target).ok_or_else(|| {
                KindredError::Schema(format!("{path} references unknown model '{target}'"))
            })?;
            if let Some(by) = &field.by {
                let by_field = target_model.field(by).ok_or_else(|| {
                    KindredError::Schema(format!(
                        "{path} is defined by unknown field '{target}.{by}'"
                    ))
                })?;
                if by_field.reference() != Some(model.name.as_str()) {
                    return Err(KindredError::Schema(format!(
                        "{path} is defined by '{target}.{by}', which does not reference {}",
                        model.name
                    )));
                }
                if field.embedded {
                    return Err(KindredError::Schema(format!(
                        "{path} cannot be both virtual and embedded"
                    )));
                }
            }
        } else if field.by.is_some() || field.embedded {
            return Err(KindredError::Schema(format!(
                "{path} is virtual or embedded but does not reference a model"
            )));
        }
        if field.on_delete.is_some() && !field.is_direct_reference() {
            return Err(KindredError::Schema(format!(
                "{path} declares onDelete but is not a stored reference"
            )));
        }
        Ok(())
    }

    pub fn model(&self, name: &str) -> Result<&Model> {
        self.models
            .get(name)
            .ok_or_else(|| KindredError::Schema(format!("Model '{name}' not found in schema")))
    }

    pub fn models(&self) -> impl Iterator<Item = &Model> {
        self.models.values()
    }

    /// Models visible to external API surfaces.
    pub fn public_models(&self) -> impl Iterator<Item = &Model> {
        self.models.values().filter(|m| !m.hidden)
    }

    /// Attach a rule to a field. Only possible before the registry is shared.
    pub fn add_rule(&mut self, model: &str, field: &str, rule: Rule) -> Result<()> {
        let model = self
            .models
            .get_mut(model)
            .ok_or_else(|| KindredError::Schema(format!("Model '{model}' not found in schema")))?;
        let path = model.path(field);
        let field = model
            .fields
            .iter_mut()
            .find(|f| f.name == field)
            .ok_or_else(|| KindredError::Schema(format!("Field '{path}' not found in schema")))?;
        field.rules.push(rule);
        Ok(())
    }

    /// Stored reference fields on any model that point at `target`.
    pub fn references_to<'a>(&'a self, target: &'a str) -> impl Iterator<Item = (&'a Model, &'a Field)> {
        self.models.values().flat_map(move |model| {
            model
                .reference_fields()
                .filter(move |f| f.reference() == Some(target))
                .map(move |f| (model, f))
        })
    }

    /// Model a field points at, for reference fields.
    pub fn target(&self, field: &Field) -> Result<Option<&Model>> {
        match field.field_type.element() {
            FieldType::Reference(name) => self.model(name).map(Some),
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_reference_rejected() {
        let err = SchemaRegistry::from_yaml(
            "models:\n  Book:\n    fields:\n      author: Person\n",
            "default",
        )
        .unwrap_err();
        assert!(err.to_string().contains("Book.author"));
    }

    #[test]
    fn test_virtual_field_must_point_back() {
        let yaml = r#"
models:
  Book:
    fields:
      chapters: { type: "[Chapter]", by: title }
  Chapter:
    fields:
      title: String
"#;
        let err = SchemaRegistry::from_yaml(yaml, "default").unwrap_err();
        assert!(err.to_string().contains("does not reference Book"));
    }

    #[test]
    fn test_references_to() {
        let yaml = r#"
models:
  Person:
    fields:
      name: String
  Book:
    store: archive
    fields:
      author: { type: Person, onDelete: restrict }
      readers: "[Person]"
"#;
        let registry = SchemaRegistry::from_yaml(yaml, "default").unwrap();
        let refs: Vec<_> = registry
            .references_to("Person")
            .map(|(m, f)| format!("{}.{}", m.name, f.name))
            .collect();
        assert_eq!(refs, vec!["Book.author", "Book.readers"]);
        assert_eq!(registry.model("Book").unwrap().store, "archive");
        assert_eq!(registry.model("Person").unwrap().store, "default");
    }

    #[test]
    fn test_add_rule_unknown_field() {
        let mut registry =
            SchemaRegistry::from_yaml("models:\n  Person:\n    fields:\n      name: String\n", "default")
                .unwrap();
        assert!(registry.add_rule("Person", "nope", Rule::Required).is_err());
        assert!(registry.add_rule("Person", "name", Rule::Required).is_ok());
    }
}
