use super::types::SchemaDefinition;
use crate::error::Result;
use std::path::Path;

/// Parse a schema.yaml file into a SchemaDefinition
pub fn parse_schema(path: &Path) -> Result<SchemaDefinition> {
    let content = std::fs::read_to_string(path)?;
    parse_schema_str(&content)
}

/// Parse a schema YAML string into a SchemaDefinition
pub fn parse_schema_str(content: &str) -> Result<SchemaDefinition> {
    let schema: SchemaDefinition = serde_yaml::from_str(content)?;
    Ok(schema)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::types::{FieldSpec, IndexKind, OnDeletePolicy, RuleSpec};

    #[test]
    fn test_parse_markers_and_options() {
        let schema = parse_schema_str(
            r#"
models:
  Person:
    indexes:
      - { name: person_name, type: unique, fields: [name] }
    fields:
      name: { type: String, required: true }
      age: { type: Number, rules: [{ range: [0, 150] }] }
      friends: "[Person]"
  Chapter:
    hideFromApi: true
    fields:
      book: { type: Book, onDelete: cascade }
"#,
        )
        .unwrap();

        let person = &schema.models["Person"];
        let names: Vec<_> = person.fields.0.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["name", "age", "friends"]);
        assert_eq!(person.indexes[0].kind, IndexKind::Unique);
        assert!(matches!(&person.fields.0[2].1, FieldSpec::Marker(m) if m == "[Person]"));

        let age = person.fields.0[1].1.options();
        assert!(matches!(age.rules[0], RuleSpec::Range(Some(min), Some(max)) if min == 0.0 && max == 150.0));

        let chapter = &schema.models["Chapter"];
        assert!(chapter.hide_from_api);
        assert_eq!(
            chapter.fields.0[0].1.options().on_delete,
            Some(OnDeletePolicy::Cascade)
        );
    }

    #[test]
    fn test_parse_rejects_bad_yaml() {
        assert!(parse_schema_str("models: [not, a, map]").is_err());
    }
}
